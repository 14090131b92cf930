use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::OnceLock;

use itertools::Itertools;
use nalgebra::DMatrix;
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::algorithm::utility::sorted_window;
use crate::data::point_cloud::{Axis, PointCloud};
use crate::error::{NsError, Result};

/// Sampling of one axis: `count` points spanning `[lower, upper]`.
///
/// Serialized as a `[lower, upper, count]` triple.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f64, f64, usize)", into = "(f64, f64, usize)")]
pub struct GridAxis {
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
}

impl From<(f64, f64, usize)> for GridAxis {
    fn from((lower, upper, count): (f64, f64, usize)) -> Self {
        GridAxis {
            lower,
            upper,
            count,
        }
    }
}

impl From<GridAxis> for (f64, f64, usize) {
    fn from(axis: GridAxis) -> Self {
        (axis.lower, axis.upper, axis.count)
    }
}

impl GridAxis {
    pub fn new(lower: f64, upper: f64, count: usize) -> Self {
        GridAxis {
            lower,
            upper,
            count,
        }
    }

    /// A single sample at `value` with a zero-width window.
    pub fn point(value: f64) -> Self {
        GridAxis {
            lower: value,
            upper: value,
            count: 1,
        }
    }

    pub fn validate(&self, axis: Axis) -> Result<()> {
        if self.count == 0 {
            return Err(NsError::InvalidGrid(format!("axis {} has zero samples", axis)));
        }
        if !self.lower.is_finite() || !self.upper.is_finite() {
            return Err(NsError::InvalidGrid(format!(
                "axis {} has non-finite bounds",
                axis
            )));
        }
        if self.upper < self.lower {
            return Err(NsError::InvalidGrid(format!(
                "axis {} has upper bound {} below lower bound {}",
                axis, self.upper, self.lower
            )));
        }
        Ok(())
    }

    /// Sample positions and the step between them.
    ///
    /// A single sample sits at the midpoint with a step of `upper - lower`; otherwise the
    /// samples are evenly spaced and include both bounds.
    ///
    /// # Example
    ///
    /// ```
    /// use nscore::algorithm::binning::GridAxis;
    ///
    /// let (values, step) = GridAxis::new(0.0, 1.0, 1).samples();
    /// assert_eq!(values, vec![0.5]);
    /// assert_eq!(step, 1.0);
    ///
    /// let (values, step) = GridAxis::new(0.0, 1.0, 3).samples();
    /// assert_eq!(values, vec![0.0, 0.5, 1.0]);
    /// assert_eq!(step, 0.5);
    /// ```
    pub fn samples(&self) -> (Vec<f64>, f64) {
        if self.count == 1 {
            return (vec![(self.lower + self.upper) / 2.0], self.upper - self.lower);
        }
        let step = (self.upper - self.lower) / (self.count - 1) as f64;
        let values = (0..self.count)
            .map(|i| {
                if i + 1 == self.count {
                    self.upper
                } else {
                    self.lower + i as f64 * step
                }
            })
            .collect();
        (values, step)
    }
}

/// Per-axis sampling of a regular grid over `(h, k, l, e, temp)`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GridSpec {
    pub h: GridAxis,
    pub k: GridAxis,
    pub l: GridAxis,
    pub e: GridAxis,
    pub temp: GridAxis,
}

impl GridSpec {
    pub fn new(h: GridAxis, k: GridAxis, l: GridAxis, e: GridAxis, temp: GridAxis) -> Self {
        GridSpec { h, k, l, e, temp }
    }

    pub fn axes(&self) -> [GridAxis; 5] {
        [self.h, self.k, self.l, self.e, self.temp]
    }

    /// Number of grid cells, the product of the per-axis counts.
    pub fn len(&self) -> usize {
        self.axes().iter().map(|axis| axis.count).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Expands the grid description into the Cartesian product of its axis samples.
    ///
    /// Rows follow the "xy" meshgrid layout: `k` varies slowest, then `h`, `l`, `e`, and
    /// `temp` fastest. Columns keep the `(h, k, l, e, temp)` order.
    ///
    /// # Example
    ///
    /// ```
    /// use nscore::algorithm::binning::{GridAxis, GridSpec};
    ///
    /// let spec = GridSpec::new(
    ///     GridAxis::new(0.0, 1.0, 2),
    ///     GridAxis::new(0.0, 2.0, 3),
    ///     GridAxis::point(0.0),
    ///     GridAxis::point(0.0),
    ///     GridAxis::point(0.0),
    /// );
    /// let grid = spec.build().unwrap();
    /// assert_eq!(grid.cell(1), [1.0, 0.0, 0.0, 0.0, 0.0]);
    /// assert_eq!(grid.cell(2), [0.0, 1.0, 0.0, 0.0, 0.0]);
    /// ```
    pub fn build(&self) -> Result<Grid> {
        for (axis, spec) in Axis::ALL.iter().zip(self.axes()) {
            spec.validate(*axis)?;
        }

        let (mut samples, steps): (Vec<Vec<f64>>, Vec<f64>) =
            self.axes().iter().map(GridAxis::samples).unzip();

        // product over (k, h, l, e, temp), then put h back in front
        samples.swap(0, 1);
        let cells: Vec<Vec<f64>> = samples
            .into_iter()
            .multi_cartesian_product()
            .map(|mut cell| {
                cell.swap(0, 1);
                cell
            })
            .collect();
        let q = DMatrix::from_fn(cells.len(), 5, |r, c| cells[r][c]);

        Ok(Grid {
            q,
            steps: std::array::from_fn(|i| steps[i]),
        })
    }
}

/// The cells of an expanded grid with the window width of each axis.
#[derive(Clone, Debug, PartialEq)]
pub struct Grid {
    pub q: DMatrix<f64>,
    pub steps: [f64; 5],
}

impl Grid {
    pub fn len(&self) -> usize {
        self.q.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cell(&self, index: usize) -> [f64; 5] {
        std::array::from_fn(|c| self.q[(index, c)])
    }
}

/// What a grid cell found in the source cloud.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CellOutcome {
    /// Mean over `count >= 2` source points
    Averaged { count: usize },
    /// Exactly one source point fell into the cell
    Degenerate,
    /// Some axis window held no source point
    Empty,
}

/// Values written for an empty cell.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyCellPolicy {
    #[default]
    Zero,
    Nan,
    /// Skip the empty axis window and keep narrowing with the remaining axes, averaging
    /// whatever subset survives. Reproduces the historical binning behaviour.
    ReusePrevious,
}

impl FromStr for EmptyCellPolicy {
    type Err = NsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "zero" => Ok(EmptyCellPolicy::Zero),
            "nan" => Ok(EmptyCellPolicy::Nan),
            "reuse_previous" => Ok(EmptyCellPolicy::ReusePrevious),
            other => Err(NsError::UnknownOption(other.to_string())),
        }
    }
}

impl Display for EmptyCellPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            EmptyCellPolicy::Zero => write!(f, "zero"),
            EmptyCellPolicy::Nan => write!(f, "nan"),
            EmptyCellPolicy::ReusePrevious => write!(f, "reuse_previous"),
        }
    }
}

/// A rebinned cloud together with the per-cell outcome, in grid row order.
#[derive(Clone, Debug, PartialEq)]
pub struct BinnedCloud {
    pub cloud: PointCloud,
    pub outcomes: Vec<CellOutcome>,
}

impl BinnedCloud {
    pub fn empty_cells(&self) -> usize {
        self.outcomes.iter().filter(|outcome| **outcome == CellOutcome::Empty).count()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct CellValue {
    outcome: CellOutcome,
    detector: f64,
    monitor: f64,
    time: f64,
}

/// Read-only view of the source cloud shared by all workers.
struct BinSource<'a> {
    cloud: &'a PointCloud,
    /// All source rows ordered by `h`, computed once per call
    by_first_axis: Vec<usize>,
}

impl<'a> BinSource<'a> {
    fn new(cloud: &'a PointCloud) -> Self {
        let values = cloud.column(Axis::H);
        let mut by_first_axis: Vec<usize> = (0..cloud.len()).collect();
        by_first_axis.sort_by_key(|&i| OrderedFloat(values[i]));
        BinSource {
            cloud,
            by_first_axis,
        }
    }

    fn mean(&self, rows: &[usize]) -> (f64, f64, f64) {
        let n = rows.len() as f64;
        let sum = |values: &[f64]| rows.iter().map(|&i| values[i]).sum::<f64>() / n;
        (
            sum(self.cloud.detector()),
            sum(self.cloud.monitor()),
            sum(self.cloud.time()),
        )
    }

    /// Range of `sorted` (ordered by `axis`) inside the cell's window on that axis.
    fn window(
        &self,
        axis: Axis,
        sorted: &[usize],
        cell: &[f64; 5],
        steps: &[f64; 5],
    ) -> (usize, usize) {
        let half = steps[axis.index()] / 2.0;
        let center = cell[axis.index()];
        sorted_window(sorted, self.cloud.column(axis), center - half, center + half)
    }

    /// Narrows the source axis by axis onto the window around `cell` and averages what is left.
    ///
    /// The `h` window is cut from the presorted rows first, so only that slice is copied.
    fn evaluate(&self, cell: &[f64; 5], steps: &[f64; 5], policy: EmptyCellPolicy) -> CellValue {
        let reuse = policy == EmptyCellPolicy::ReusePrevious;
        let (start, end) = self.window(Axis::H, &self.by_first_axis, cell, steps);
        let mut empty = start == end;

        let mut subset: Vec<usize> = match (empty, reuse) {
            (false, _) => self.by_first_axis[start..end].to_vec(),
            (true, true) => self.by_first_axis.clone(),
            (true, false) => return self.finish(&[], true, policy),
        };

        for axis in [Axis::K, Axis::L, Axis::E, Axis::Temp] {
            if subset.is_empty() {
                empty = true;
                break;
            }
            let values = self.cloud.column(axis);
            subset.sort_by_key(|&i| OrderedFloat(values[i]));

            let (start, end) = self.window(axis, &subset, cell, steps);
            if start == end {
                empty = true;
                if reuse {
                    continue;
                }
                break;
            }
            subset.truncate(end);
            subset.drain(..start);
        }

        self.finish(&subset, empty, policy)
    }

    fn finish(&self, subset: &[usize], empty: bool, policy: EmptyCellPolicy) -> CellValue {
        if empty {
            let (detector, monitor, time) = match policy {
                EmptyCellPolicy::Zero => (0.0, 0.0, 0.0),
                EmptyCellPolicy::Nan => (f64::NAN, f64::NAN, f64::NAN),
                EmptyCellPolicy::ReusePrevious if subset.is_empty() => (0.0, 0.0, 0.0),
                EmptyCellPolicy::ReusePrevious => self.mean(subset),
            };
            return CellValue {
                outcome: CellOutcome::Empty,
                detector,
                monitor,
                time,
            };
        }

        let outcome = match subset.len() {
            1 => CellOutcome::Degenerate,
            count => CellOutcome::Averaged { count },
        };
        let (detector, monitor, time) = self.mean(subset);
        CellValue {
            outcome,
            detector,
            monitor,
            time,
        }
    }
}

/// Rebins point clouds onto regular grids using a thread pool that lives as long as the binner.
pub struct GridBinner {
    pool: ThreadPool,
    empty_policy: EmptyCellPolicy,
}

impl GridBinner {
    /// Creates a binner with `num_threads` workers, `0` meaning one per available core.
    pub fn new(num_threads: usize) -> Result<Self> {
        let num_threads = match num_threads {
            0 => std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            n => n,
        };
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("nscore-bin-{}", i))
            .build()
            .map_err(|e| NsError::ThreadPool(e.to_string()))?;
        Ok(GridBinner {
            pool,
            empty_policy: EmptyCellPolicy::default(),
        })
    }

    pub fn with_empty_policy(mut self, policy: EmptyCellPolicy) -> Self {
        self.empty_policy = policy;
        self
    }

    pub fn empty_policy(&self) -> EmptyCellPolicy {
        self.empty_policy
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Rebins `source` onto the grid described by `spec`.
    ///
    /// # Description
    ///
    /// Grid rows are split into one contiguous chunk per worker. Every cell is evaluated
    /// independently against the shared, read-only source: for `h`, `k`, `l`, `e`, `temp` in
    /// turn the working subset is ordered by that axis and narrowed to the half-open window
    /// `[cell - step / 2, cell + step / 2)`. The surviving points are averaged. Chunks are
    /// concatenated in grid order, so the output does not depend on scheduling.
    ///
    /// The binned cloud inherits `m0`, `t0` and `time_norm` from the source.
    pub fn bin(&self, source: &PointCloud, spec: &GridSpec) -> Result<BinnedCloud> {
        self.bin_with_policy(source, spec, self.empty_policy)
    }

    /// Like [`GridBinner::bin`], with `policy` in place of the binner's own empty cell policy.
    pub fn bin_with_policy(
        &self,
        source: &PointCloud,
        spec: &GridSpec,
        policy: EmptyCellPolicy,
    ) -> Result<BinnedCloud> {
        let grid = spec.build()?;
        let n_cells = grid.len();
        let chunk_size = n_cells.div_ceil(self.num_threads()).max(1);

        debug!(
            cells = n_cells,
            points = source.len(),
            threads = self.num_threads(),
            %policy,
            "binning point cloud"
        );

        let binned: Vec<CellValue> = self.pool.install(|| {
            let view = BinSource::new(source);
            let chunks: Vec<Vec<CellValue>> = (0..n_cells)
                .step_by(chunk_size)
                .collect::<Vec<_>>()
                .into_par_iter()
                .map(|start| {
                    (start..(start + chunk_size).min(n_cells))
                        .map(|row| view.evaluate(&grid.cell(row), &grid.steps, policy))
                        .collect()
                })
                .collect();
            chunks.into_iter().flatten().collect()
        });

        let mut detector = Vec::with_capacity(n_cells);
        let mut monitor = Vec::with_capacity(n_cells);
        let mut time = Vec::with_capacity(n_cells);
        let mut outcomes = Vec::with_capacity(n_cells);
        for value in binned {
            detector.push(value.detector);
            monitor.push(value.monitor);
            time.push(value.time);
            outcomes.push(value.outcome);
        }

        let mut cloud = PointCloud::from_q(grid.q, detector, monitor, time)?;
        cloud.m0 = source.m0;
        cloud.t0 = source.t0;
        cloud.time_norm = source.time_norm;

        let result = BinnedCloud { cloud, outcomes };
        debug!(empty_cells = result.empty_cells(), "binning finished");
        Ok(result)
    }
}

static DEFAULT_BINNER: OnceLock<GridBinner> = OnceLock::new();

/// Process-wide binner with one worker per core, created on first use.
pub fn default_binner() -> Result<&'static GridBinner> {
    if let Some(binner) = DEFAULT_BINNER.get() {
        return Ok(binner);
    }
    let binner = GridBinner::new(0)?;
    Ok(DEFAULT_BINNER.get_or_init(|| binner))
}

impl PointCloud {
    /// Rebins this cloud onto `spec` with the process-wide binner.
    pub fn bin(&self, spec: &GridSpec) -> Result<PointCloud> {
        Ok(default_binner()?.bin(self, spec)?.cloud)
    }
}
