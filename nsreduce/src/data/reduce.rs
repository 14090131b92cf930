use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};
use nscore::{
    default_binner, Background, EmptyCellPolicy, GridBinner, GridSpec, MatchPolicy, MergeOptions,
    MergeReport, MomentMode, MomentQuery, PointCloud, Tolerance,
};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Settings for a full merge, bin and moment reduction.
///
/// Read from a JSON file; every field is optional and unknown fields are rejected.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReduceConfig {
    pub tolerance: Tolerance,
    pub policy: MatchPolicy,
    /// Regular grid to rebin onto before taking moments
    pub grid: Option<GridSpec>,
    pub empty_policy: EmptyCellPolicy,
    /// Binning workers, `0` for the shared binner with one worker per core
    pub threads: usize,
    pub background: Option<Background>,
    /// Restrict moments to points with a positive monitor
    pub mask_monitor_positive: bool,
    pub mode: MomentMode,
    pub time_norm: bool,
}

impl Default for ReduceConfig {
    fn default() -> Self {
        ReduceConfig {
            tolerance: Tolerance::default(),
            policy: MatchPolicy::default(),
            grid: None,
            empty_policy: EmptyCellPolicy::default(),
            threads: 0,
            background: None,
            mask_monitor_positive: true,
            mode: MomentMode::default(),
            time_norm: false,
        }
    }
}

impl ReduceConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse reduction config {}", path.display()))
    }

    pub fn merge_options(&self) -> MergeOptions {
        MergeOptions::new(self.tolerance, self.policy)
    }

    fn moment_query(&self, cloud: &PointCloud) -> MomentQuery {
        MomentQuery {
            mask: self.mask_monitor_positive.then(|| cloud.plottable_mask()),
            background: self.background.clone(),
            mode: self.mode,
        }
    }
}

/// Outcome of [`run_reduction`], printed as JSON by the command line tool.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ReductionSummary {
    pub points: usize,
    pub merged: MergeReport,
    pub grid_cells: Option<usize>,
    pub empty_cells: Option<usize>,
    pub background: f64,
    pub integrate: f64,
    pub position: [f64; 4],
    pub width: [f64; 4],
}

/// Optionally rebins `cloud` and evaluates its moments along `(h, k, l, e)`.
///
/// With `threads == 0` the process-wide binner is used, otherwise a pool of that size.
pub fn run_reduction(
    mut cloud: PointCloud,
    merged: MergeReport,
    config: &ReduceConfig,
) -> Result<ReductionSummary> {
    cloud.time_norm = config.time_norm;
    let points = cloud.len();

    let (cloud, grid_cells, empty_cells) = match &config.grid {
        Some(spec) => {
            let owned;
            let binner: &GridBinner = if config.threads == 0 {
                default_binner()?
            } else {
                owned = GridBinner::new(config.threads)?;
                &owned
            };
            let binned = binner
                .bin_with_policy(&cloud, spec, config.empty_policy)
                .context("binning failed")?;
            let empty = binned.empty_cells();
            info!(
                cells = binned.cloud.len(),
                empty_cells = empty,
                threads = binner.num_threads(),
                "binned point cloud"
            );
            let cells = binned.cloud.len();
            (binned.cloud, Some(cells), Some(empty))
        }
        None => (cloud, None, None),
    };

    let query = config.moment_query(&cloud);
    let background = query.background.as_ref().map_or(0.0, |bg| cloud.bg_estimate(bg));

    let summary = ReductionSummary {
        points,
        merged,
        grid_cells,
        empty_cells,
        background,
        integrate: cloud.integrate(&query)?,
        position: cloud.position(&query)?,
        width: cloud.width(&query)?,
    };
    info!(integrate = summary.integrate, mode = ?config.mode, "moments evaluated");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nscore::GridAxis;

    fn peak() -> PointCloud {
        let h: Vec<f64> = (0..=20).map(|i| i as f64 * 0.1).collect();
        let detector: Vec<f64> = h
            .iter()
            .map(|x| 10.0 - 10.0 * (x - 1.0f64).abs())
            .map(|v| v + 1.0)
            .collect();
        let n = h.len();
        PointCloud::new(
            h.into(),
            0.0.into(),
            0.0.into(),
            0.0.into(),
            5.0.into(),
            detector.into(),
            vec![1.0; n].into(),
            1.0.into(),
        )
        .unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config: ReduceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ReduceConfig::default());
        assert!(config.mask_monitor_positive);
        assert_eq!(config.merge_options(), MergeOptions::default());
    }

    #[test]
    fn test_config_rejects_unknown_fields() {
        let json = r#"{"tolerence": [1, 1, 1, 1, 1]}"#;
        assert!(serde_json::from_str::<ReduceConfig>(json).is_err());
    }

    #[test]
    fn test_config_from_json() {
        let config: ReduceConfig = serde_json::from_str(
            r#"{
                "tolerance": [0.01, 0.01, 0.01, 0.1, 1.0],
                "policy": "nearest",
                "grid": {
                    "h": [0, 2, 21], "k": [0, 0, 1], "l": [0, 0, 1],
                    "e": [0, 0, 1], "temp": [5, 5, 1]
                },
                "empty_policy": "nan",
                "background": {"type": "minimum"},
                "mode": "weighted"
            }"#,
        )
        .unwrap();
        assert_eq!(config.tolerance, Tolerance([0.01, 0.01, 0.01, 0.1, 1.0]));
        assert_eq!(config.policy, MatchPolicy::Nearest);
        assert_eq!(config.grid.map(|g| g.len()), Some(21));
        assert_eq!(config.empty_policy, EmptyCellPolicy::Nan);
        assert_eq!(config.background, Some(Background::Minimum));
        assert_eq!(config.mode, MomentMode::Weighted);
    }

    #[test]
    fn test_reduction_without_grid() {
        let config = ReduceConfig {
            background: Some(Background::Constant(1.0)),
            ..ReduceConfig::default()
        };
        let summary = run_reduction(peak(), MergeReport::default(), &config).unwrap();
        assert_eq!(summary.points, 21);
        assert_eq!(summary.grid_cells, None);
        assert_eq!(summary.background, 1.0);
        // triangle of height 10 and base 2 above the background
        assert!((summary.integrate - 10.0).abs() < 1e-9);
        assert!((summary.position[0] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_reduction_with_grid() {
        let config = ReduceConfig {
            grid: Some(GridSpec::new(
                GridAxis::new(0.0, 2.0, 21),
                GridAxis::point(0.0),
                GridAxis::point(0.0),
                GridAxis::point(0.0),
                GridAxis::point(5.0),
            )),
            threads: 2,
            mode: MomentMode::Weighted,
            ..ReduceConfig::default()
        };
        let summary = run_reduction(peak(), MergeReport::default(), &config).unwrap();
        assert_eq!(summary.grid_cells, Some(21));
        assert_eq!(summary.empty_cells, Some(0));
        assert!((summary.position[0] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_reduction_on_shared_binner_with_empty_cells() {
        // k = 1 cells hold no points and come back as NaN
        let config = ReduceConfig {
            grid: Some(GridSpec::new(
                GridAxis::new(0.0, 2.0, 21),
                GridAxis::new(0.0, 1.0, 2),
                GridAxis::point(0.0),
                GridAxis::point(0.0),
                GridAxis::point(5.0),
            )),
            empty_policy: EmptyCellPolicy::Nan,
            mode: MomentMode::Weighted,
            ..ReduceConfig::default()
        };
        assert_eq!(config.threads, 0);

        let first = run_reduction(peak(), MergeReport::default(), &config).unwrap();
        assert_eq!(first.grid_cells, Some(42));
        assert_eq!(first.empty_cells, Some(21));
        assert!(first.integrate.is_finite());
        assert!((first.position[0] - 1.0).abs() < 1e-9);

        let second = run_reduction(peak(), MergeReport::default(), &config).unwrap();
        assert_eq!(first, second);
    }
}
