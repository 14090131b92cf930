use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nscore::{MergeOptions, MergeReport, PointCloud, RawColumns};
use tracing::{debug, info};

/// Reads one loader column mapping from a JSON object of equal-length arrays.
///
/// Every column key is required and unknown keys are rejected.
pub fn read_columns(path: &Path) -> Result<RawColumns> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let map: BTreeMap<String, Vec<f64>> = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("failed to parse column mapping in {}", path.display()))?;
    let columns = RawColumns::from_map(map)
        .with_context(|| format!("invalid column mapping in {}", path.display()))?;
    debug!(path = %path.display(), points = columns.len(), "read columns");
    Ok(columns)
}

pub fn write_columns(path: &Path, columns: &RawColumns) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), columns)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Builds a cloud from the first file and merges every later file into it, in order.
///
/// The cloud keeps the monitor and time references of the first file. One report is
/// returned per merged file.
pub fn load_and_merge(
    paths: &[PathBuf],
    options: &MergeOptions,
) -> Result<(PointCloud, Vec<MergeReport>)> {
    let Some((first, rest)) = paths.split_first() else {
        bail!("no input files given");
    };

    let mut cloud = PointCloud::try_from(read_columns(first)?)
        .with_context(|| format!("failed to build point cloud from {}", first.display()))?;
    info!(path = %first.display(), points = cloud.len(), "loaded base point set");

    let mut reports = Vec::with_capacity(rest.len());
    for path in rest {
        let report = cloud
            .merge_columns(read_columns(path)?, options)
            .with_context(|| format!("failed to merge {}", path.display()))?;
        info!(
            path = %path.display(),
            matched_pairs = report.matched_pairs,
            appended = report.appended,
            points = cloud.len(),
            "merged point set"
        );
        reports.push(report);
    }

    Ok((cloud, reports))
}
