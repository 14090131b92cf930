use std::fmt;
use std::fmt::{Display, Formatter};
use std::ops::{Add, Div, Mul, Sub};

use itertools::izip;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::algorithm::merge::MergeOptions;
use crate::algorithm::utility::{filter_with_mask, nan_max};
use crate::constants::BOLTZMANN_IN_MEV_K;
use crate::data::columns::{ColumnInput, PointCloudConfig, RawColumns};
use crate::error::{NsError, Result};

/// One of the five coordinates of a Q-point, in storage column order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    H,
    K,
    L,
    E,
    Temp,
}

impl Axis {
    pub const ALL: [Axis; 5] = [Axis::H, Axis::K, Axis::L, Axis::E, Axis::Temp];

    /// Axes entering moment calculations, temperature excluded.
    pub const MOMENT: [Axis; 4] = [Axis::H, Axis::K, Axis::L, Axis::E];

    pub fn index(self) -> usize {
        match self {
            Axis::H => 0,
            Axis::K => 1,
            Axis::L => 2,
            Axis::E => 3,
            Axis::Temp => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Axis::H => "h",
            Axis::K => "k",
            Axis::L => "l",
            Axis::E => "e",
            Axis::Temp => "temp",
        }
    }
}

impl Display for Axis {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A cloud of neutron scattering measurements.
///
/// # Description
///
/// Every point carries a Q-vector `(h, k, l, e, temp)`, stored as one row of an `N x 5`
/// matrix, plus the raw detector counts, monitor counts and counting time (minutes).
/// Intensity and error are derived on read and never stored.
#[derive(Clone, Debug, PartialEq)]
pub struct PointCloud {
    q: DMatrix<f64>,
    detector: Vec<f64>,
    monitor: Vec<f64>,
    time: Vec<f64>,
    /// Reference monitor used for normalization, `0.0` means "use the current maximum"
    pub m0: f64,
    /// Reference time used for normalization when `time_norm` is set
    pub t0: f64,
    pub time_norm: bool,
}

/// Columns selected for plotting consumers, keyed like the loader mapping.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlotDims {
    pub h: Vec<f64>,
    pub k: Vec<f64>,
    pub l: Vec<f64>,
    pub e: Vec<f64>,
    pub temp: Vec<f64>,
    pub intensity: Vec<f64>,
    pub error: Vec<f64>,
}

impl PlotDims {
    pub fn get(&self, name: &str) -> Option<&[f64]> {
        match name {
            "h" => Some(&self.h),
            "k" => Some(&self.k),
            "l" => Some(&self.l),
            "e" => Some(&self.e),
            "temp" => Some(&self.temp),
            "intensity" => Some(&self.intensity),
            "error" => Some(&self.error),
            _ => None,
        }
    }
}

impl PointCloud {
    /// Creates a point cloud from per-axis columns.
    ///
    /// # Description
    ///
    /// Scalars are replicated to the common length `N` of the array inputs (`N = 1` if every
    /// input is a scalar). Arrays of differing length fail with [`NsError::ShapeMismatch`].
    /// `m0` and `t0` default to the largest monitor and time values.
    ///
    /// # Example
    ///
    /// ```
    /// use nscore::data::point_cloud::PointCloud;
    ///
    /// let cloud = PointCloud::new(
    ///     vec![1.0, 1.1].into(), 0.0.into(), 0.0.into(), 0.0.into(), 10.0.into(),
    ///     vec![10.0, 20.0].into(), 5.0.into(), 1.0.into(),
    /// ).unwrap();
    /// assert_eq!(cloud.q().shape(), (2, 5));
    /// assert_eq!(cloud.intensity(), vec![10.0, 20.0]);
    /// ```
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        h: ColumnInput,
        k: ColumnInput,
        l: ColumnInput,
        e: ColumnInput,
        temp: ColumnInput,
        detector: ColumnInput,
        monitor: ColumnInput,
        time: ColumnInput,
    ) -> Result<Self> {
        let n = [&h, &k, &l, &e, &temp, &detector, &monitor, &time]
            .iter()
            .find_map(|column| column.len())
            .unwrap_or(1);

        let q_columns = [
            h.broadcast(n, "h")?,
            k.broadcast(n, "k")?,
            l.broadcast(n, "l")?,
            e.broadcast(n, "e")?,
            temp.broadcast(n, "temp")?,
        ];
        let q = DMatrix::from_iterator(n, 5, q_columns.into_iter().flatten());

        PointCloud::from_q(
            q,
            detector.broadcast(n, "detector")?,
            monitor.broadcast(n, "monitor")?,
            time.broadcast(n, "time")?,
        )
    }

    /// Creates a point cloud from a pre-built `N x 5` Q matrix.
    pub fn from_q(
        q: DMatrix<f64>,
        detector: Vec<f64>,
        monitor: Vec<f64>,
        time: Vec<f64>,
    ) -> Result<Self> {
        if q.ncols() != 5 {
            return Err(NsError::shape("Q columns", 5, q.ncols()));
        }
        let n = q.nrows();
        for (what, column) in [("detector", &detector), ("monitor", &monitor), ("time", &time)] {
            if column.len() != n {
                return Err(NsError::shape(what, n, column.len()));
            }
        }

        let m0 = nan_max(&monitor);
        let t0 = nan_max(&time);

        Ok(PointCloud {
            q,
            detector,
            monitor,
            time,
            m0,
            t0,
            time_norm: false,
        })
    }

    pub fn from_config(config: PointCloudConfig) -> Result<Self> {
        let PointCloudConfig {
            h,
            k,
            l,
            e,
            temp,
            detector,
            monitor,
            time,
            m0,
            t0,
            time_norm,
        } = config;
        let mut cloud = PointCloud::new(h, k, l, e, temp, detector, monitor, time)?;
        if let Some(m0) = m0 {
            cloud.m0 = m0;
        }
        if let Some(t0) = t0 {
            cloud.t0 = t0;
        }
        cloud.time_norm = time_norm;
        Ok(cloud)
    }

    /// An empty cloud, the neutral element of merging.
    pub fn empty() -> Self {
        PointCloud {
            q: DMatrix::zeros(0, 5),
            detector: Vec::new(),
            monitor: Vec::new(),
            time: Vec::new(),
            m0: 0.0,
            t0: 0.0,
            time_norm: false,
        }
    }

    pub fn len(&self) -> usize {
        self.q.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn q(&self) -> &DMatrix<f64> {
        &self.q
    }

    /// Values of one Q axis; the matrix is column major so this is a contiguous slice.
    pub fn column(&self, axis: Axis) -> &[f64] {
        let n = self.len();
        let start = axis.index() * n;
        &self.q.as_slice()[start..start + n]
    }

    pub fn row(&self, index: usize) -> [f64; 5] {
        std::array::from_fn(|c| self.q[(index, c)])
    }

    pub fn h(&self) -> &[f64] {
        self.column(Axis::H)
    }

    pub fn k(&self) -> &[f64] {
        self.column(Axis::K)
    }

    pub fn l(&self) -> &[f64] {
        self.column(Axis::L)
    }

    pub fn e(&self) -> &[f64] {
        self.column(Axis::E)
    }

    pub fn temp(&self) -> &[f64] {
        self.column(Axis::Temp)
    }

    pub fn detector(&self) -> &[f64] {
        &self.detector
    }

    pub fn monitor(&self) -> &[f64] {
        &self.monitor
    }

    pub fn time(&self) -> &[f64] {
        &self.time
    }

    /// Replaces one Q axis, broadcasting a scalar to every point.
    pub fn set_column(&mut self, axis: Axis, values: ColumnInput) -> Result<()> {
        let values = values.broadcast(self.len(), axis.name())?;
        for (dst, value) in self.q.column_mut(axis.index()).iter_mut().zip(values) {
            *dst = value;
        }
        Ok(())
    }

    pub fn set_detector(&mut self, values: ColumnInput) -> Result<()> {
        self.detector = values.broadcast(self.len(), "detector")?;
        Ok(())
    }

    pub fn set_monitor(&mut self, values: ColumnInput) -> Result<()> {
        self.monitor = values.broadcast(self.len(), "monitor")?;
        Ok(())
    }

    pub fn set_time(&mut self, values: ColumnInput) -> Result<()> {
        self.time = values.broadcast(self.len(), "time")?;
        Ok(())
    }

    /// `m0`, or the current maximum monitor when `m0` is zero.
    pub fn effective_m0(&self) -> f64 {
        if self.m0 == 0.0 {
            let m0 = nan_max(&self.monitor);
            debug!(m0, "reference monitor is zero, normalizing to the largest monitor value");
            m0
        } else {
            self.m0
        }
    }

    /// `t0`, or the current maximum time when `t0` is zero.
    pub fn effective_t0(&self) -> f64 {
        if self.t0 == 0.0 {
            let t0 = nan_max(&self.time);
            debug!(t0, "reference time is zero, normalizing to the largest counting time");
            t0
        } else {
            self.t0
        }
    }

    fn normalization(&self) -> (&[f64], f64) {
        if self.time_norm {
            (&self.time, self.effective_t0())
        } else {
            (&self.monitor, self.effective_m0())
        }
    }

    /// Detector counts normalized to `m0` (or to `t0` when `time_norm` is set).
    pub fn intensity(&self) -> Vec<f64> {
        let (norm, reference) = self.normalization();
        izip!(&self.detector, norm).map(|(d, n)| d / n * reference).collect()
    }

    /// Square-root counting error, normalized like [`PointCloud::intensity`].
    pub fn error(&self) -> Vec<f64> {
        let (norm, reference) = self.normalization();
        izip!(&self.detector, norm).map(|(d, n)| d.sqrt() / n * reference).collect()
    }

    /// Detailed balance (Bose) factor `1 - exp(-e / (k_B T))` per point.
    pub fn detailed_balance_factor(&self) -> Vec<f64> {
        izip!(self.column(Axis::E), self.column(Axis::Temp))
            .map(|(e, temp)| 1.0 - (-e / (BOLTZMANN_IN_MEV_K * temp)).exp())
            .collect()
    }

    /// Points with a positive monitor, the rows worth plotting.
    pub fn plottable_mask(&self) -> Vec<bool> {
        self.monitor.iter().map(|&m| m > 0.0).collect()
    }

    pub fn plot_dims(&self) -> PlotDims {
        let mask = self.plottable_mask();
        let intensity = self.intensity();
        let error = self.error();
        PlotDims {
            h: filter_with_mask(self.h(), &mask),
            k: filter_with_mask(self.k(), &mask),
            l: filter_with_mask(self.l(), &mask),
            e: filter_with_mask(self.e(), &mask),
            temp: filter_with_mask(self.temp(), &mask),
            intensity: filter_with_mask(&intensity, &mask),
            error: filter_with_mask(&error, &mask),
        }
    }

    /// Rows where `mask` holds, keeping the normalization settings.
    pub fn select(&self, mask: &[bool]) -> Result<PointCloud> {
        if mask.len() != self.len() {
            return Err(NsError::shape("mask", self.len(), mask.len()));
        }
        let rows: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter(|(_, keep)| **keep)
            .map(|(i, _)| i)
            .collect();
        Ok(self.take_rows(&rows))
    }

    pub(crate) fn take_rows(&self, rows: &[usize]) -> PointCloud {
        PointCloud {
            q: self.q.select_rows(rows.iter()),
            detector: rows.iter().map(|&i| self.detector[i]).collect(),
            monitor: rows.iter().map(|&i| self.monitor[i]).collect(),
            time: rows.iter().map(|&i| self.time[i]).collect(),
            m0: self.m0,
            t0: self.t0,
            time_norm: self.time_norm,
        }
    }

    pub(crate) fn replace_points(
        &mut self,
        q: DMatrix<f64>,
        detector: Vec<f64>,
        monitor: Vec<f64>,
        time: Vec<f64>,
    ) {
        debug_assert!(
            q.nrows() == detector.len()
                && detector.len() == monitor.len()
                && monitor.len() == time.len()
        );
        self.q = q;
        self.detector = detector;
        self.monitor = monitor;
        self.time = time;
    }

    pub fn to_columns(&self) -> RawColumns {
        RawColumns {
            h: self.h().to_vec(),
            k: self.k().to_vec(),
            l: self.l().to_vec(),
            e: self.e().to_vec(),
            temp: self.temp().to_vec(),
            detector: self.detector.clone(),
            monitor: self.monitor.clone(),
            time: self.time.clone(),
        }
    }

    fn with_detector(&self, detector: Vec<f64>) -> PointCloud {
        PointCloud {
            q: self.q.clone(),
            detector,
            monitor: self.monitor.clone(),
            time: self.time.clone(),
            m0: self.m0,
            t0: self.t0,
            time_norm: self.time_norm,
        }
    }

    /// A copy with detector counts multiplied by `factor`.
    pub fn scaled(&self, factor: f64) -> PointCloud {
        self.with_detector(self.detector.iter().map(|d| d * factor).collect())
    }

    /// A copy with detector counts raised to `exponent`.
    pub fn powf(&self, exponent: f64) -> PointCloud {
        self.with_detector(self.detector.iter().map(|d| d.powf(exponent)).collect())
    }

    /// A copy with negated detector counts, used to subtract a background measurement.
    pub fn negated(&self) -> PointCloud {
        self.with_detector(self.detector.iter().map(|d| -d).collect())
    }
}

impl TryFrom<RawColumns> for PointCloud {
    type Error = NsError;

    fn try_from(columns: RawColumns) -> Result<Self> {
        columns.validate()?;
        PointCloud::from_config(columns.into())
    }
}

impl Display for PointCloud {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PointCloud(points: {}, m0: {}, t0: {}, time_norm: {})",
            self.len(),
            self.m0,
            self.t0,
            self.time_norm
        )
    }
}

impl Add for PointCloud {
    type Output = PointCloud;
    /// Merges `other` into a copy of `self` with the default tolerance.
    fn add(self, other: PointCloud) -> PointCloud {
        self.merged([&other], &MergeOptions::default())
    }
}

impl<'a> Add<&'a PointCloud> for &'a PointCloud {
    type Output = PointCloud;
    fn add(self, other: &'a PointCloud) -> PointCloud {
        self.merged([other], &MergeOptions::default())
    }
}

impl Sub for PointCloud {
    type Output = PointCloud;
    /// Merges `other` with negated detector counts, removing it at matching points.
    fn sub(self, other: PointCloud) -> PointCloud {
        self.merged([&other.negated()], &MergeOptions::default())
    }
}

impl<'a> Sub<&'a PointCloud> for &'a PointCloud {
    type Output = PointCloud;
    fn sub(self, other: &'a PointCloud) -> PointCloud {
        self.merged([&other.negated()], &MergeOptions::default())
    }
}

impl Mul<f64> for PointCloud {
    type Output = PointCloud;
    fn mul(self, factor: f64) -> PointCloud {
        self.scaled(factor)
    }
}

impl Div<f64> for PointCloud {
    type Output = PointCloud;
    fn div(self, divisor: f64) -> PointCloud {
        self.with_detector(self.detector.iter().map(|d| d / divisor).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PointCloud {
        PointCloud::new(
            vec![1.0, 1.1, 1.2].into(),
            0.0.into(),
            0.0.into(),
            vec![-1.0, 0.0, 2.0].into(),
            10.0.into(),
            vec![16.0, 9.0, 4.0].into(),
            vec![4.0, 2.0, 1.0].into(),
            vec![1.0, 2.0, 4.0].into(),
        )
        .unwrap()
    }

    #[test]
    fn test_construction_broadcasts_scalars() {
        let cloud = sample();
        assert_eq!(cloud.q().shape(), (3, 5));
        assert_eq!(cloud.k(), &[0.0, 0.0, 0.0]);
        assert_eq!(cloud.temp(), &[10.0, 10.0, 10.0]);
        assert_eq!(cloud.row(1), [1.1, 0.0, 0.0, 0.0, 10.0]);
        assert_eq!(cloud.m0, 4.0);
        assert_eq!(cloud.t0, 4.0);
        assert!(!cloud.time_norm);
    }

    #[test]
    fn test_construction_shape_mismatch() {
        let result = PointCloud::new(
            vec![1.0, 2.0].into(),
            vec![1.0, 2.0, 3.0].into(),
            0.0.into(),
            0.0.into(),
            0.0.into(),
            0.0.into(),
            0.0.into(),
            0.0.into(),
        );
        assert_eq!(result, Err(NsError::shape("k", 2, 3)));
    }

    #[test]
    fn test_all_scalars_yield_single_point() {
        let cloud = PointCloud::new(
            1.0.into(),
            2.0.into(),
            3.0.into(),
            4.0.into(),
            5.0.into(),
            ColumnInput::default(),
            ColumnInput::default(),
            ColumnInput::default(),
        )
        .unwrap();
        assert_eq!(cloud.len(), 1);
        assert_eq!(cloud.row(0), [1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(cloud.detector(), &[0.0]);
    }

    #[test]
    fn test_from_q_checks_columns() {
        let q = DMatrix::zeros(2, 4);
        assert_eq!(
            PointCloud::from_q(q, vec![0.0; 2], vec![0.0; 2], vec![0.0; 2]),
            Err(NsError::shape("Q columns", 5, 4))
        );
    }

    #[test]
    fn test_intensity_monitor_normalized() {
        let cloud = sample();
        // detector / monitor * m0 with m0 = 4
        assert_eq!(cloud.intensity(), vec![16.0, 18.0, 16.0]);
        assert_eq!(cloud.error(), vec![4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_intensity_time_normalized() {
        let mut cloud = sample();
        cloud.time_norm = true;
        cloud.t0 = 2.0;
        assert_eq!(cloud.intensity(), vec![32.0, 9.0, 2.0]);
        assert_eq!(cloud.error(), vec![8.0, 3.0, 1.0]);
    }

    #[test]
    fn test_zero_reference_uses_maximum() {
        let mut cloud = sample();
        cloud.m0 = 0.0;
        assert_eq!(cloud.effective_m0(), 4.0);
        assert_eq!(cloud.intensity(), vec![16.0, 18.0, 16.0]);
        // reading never mutates the stored reference
        assert_eq!(cloud.m0, 0.0);
    }

    #[test]
    fn test_detailed_balance_factor() {
        let cloud = sample();
        let factor = cloud.detailed_balance_factor();
        let expected = 1.0 - (1.0 / (BOLTZMANN_IN_MEV_K * 10.0)).exp();
        assert!((factor[0] - expected).abs() < 1e-12);
        assert_eq!(factor[1], 0.0);
        assert!(factor[2] > 0.0 && factor[2] < 1.0);
    }

    #[test]
    fn test_set_column() {
        let mut cloud = sample();
        cloud.set_column(Axis::L, 0.5.into()).unwrap();
        assert_eq!(cloud.l(), &[0.5, 0.5, 0.5]);
        cloud.set_column(Axis::H, vec![3.0, 2.0, 1.0].into()).unwrap();
        assert_eq!(cloud.h(), &[3.0, 2.0, 1.0]);
        assert!(cloud.set_column(Axis::E, vec![1.0].into()).is_err());
        assert!(cloud.set_detector(vec![1.0, 2.0].into()).is_err());
        cloud.set_monitor(1.0.into()).unwrap();
        assert_eq!(cloud.monitor(), &[1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_select_and_plot_dims() {
        let mut cloud = sample();
        cloud.set_monitor(vec![4.0, 0.0, 1.0].into()).unwrap();
        let dims = cloud.plot_dims();
        assert_eq!(dims.h, vec![1.0, 1.2]);
        assert_eq!(dims.get("intensity").unwrap(), &[16.0, 16.0]);
        assert!(dims.get("colour").is_none());

        let subset = cloud.select(&[false, false, true]).unwrap();
        assert_eq!(subset.len(), 1);
        assert_eq!(subset.detector(), &[4.0]);
        assert_eq!(subset.m0, cloud.m0);
        assert!(cloud.select(&[true]).is_err());
    }

    #[test]
    fn test_scaling_is_pure() {
        let cloud = sample();
        let doubled = cloud.clone() * 2.0;
        assert_eq!(doubled.detector(), &[32.0, 18.0, 8.0]);
        assert_eq!(cloud.detector(), &[16.0, 9.0, 4.0]);
        assert_eq!((cloud.clone() / 4.0).detector(), &[4.0, 2.25, 1.0]);
        assert_eq!(cloud.powf(0.5).detector(), &[4.0, 3.0, 2.0]);
    }

    #[test]
    fn test_subtract_removes_matching_counts() {
        let signal = sample();
        let background = sample().scaled(0.25);
        let difference = &signal - &background;
        assert_eq!(difference.len(), 3);
        assert_eq!(difference.detector(), &[12.0, 6.75, 3.0]);
        assert_eq!(difference.monitor(), &[8.0, 4.0, 2.0]);
    }

    #[test]
    fn test_raw_columns_round_trip() {
        let cloud = sample();
        let rebuilt = PointCloud::try_from(cloud.to_columns()).unwrap();
        assert_eq!(rebuilt, cloud);
    }
}
