use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use nalgebra::DMatrix;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::algorithm::utility::{lexsort_rows, nan_max};
use crate::constants::DEFAULT_MERGE_TOLERANCE;
use crate::data::columns::RawColumns;
use crate::data::point_cloud::PointCloud;
use crate::error::{NsError, Result};

/// Per-axis maximum absolute difference `(h, k, l, e, temp)` under which two
/// Q-points count as the same measurement.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tolerance(pub [f64; 5]);

impl Default for Tolerance {
    fn default() -> Self {
        Tolerance::uniform(DEFAULT_MERGE_TOLERANCE)
    }
}

impl Tolerance {
    pub fn uniform(value: f64) -> Self {
        Tolerance([value; 5])
    }

    /// Builds a tolerance vector from a slice, which must hold exactly one value per axis.
    pub fn from_slice(values: &[f64]) -> Result<Self> {
        <[f64; 5]>::try_from(values)
            .map(Tolerance)
            .map_err(|_| NsError::shape("tolerance", 5, values.len()))
    }

    /// True when `a` and `b` are within tolerance on all five axes simultaneously.
    pub fn matches(&self, a: &[f64; 5], b: &[f64; 5]) -> bool {
        a.iter()
            .zip(b.iter())
            .zip(self.0.iter())
            .all(|((a, b), tol)| (a - b).abs() <= *tol)
    }

    /// Largest per-axis difference expressed in units of that axis' tolerance.
    fn scaled_distance(&self, a: &[f64; 5], b: &[f64; 5]) -> f64 {
        a.iter()
            .zip(b.iter())
            .zip(self.0.iter())
            .map(|((a, b), tol)| {
                let diff = (a - b).abs();
                if *tol > 0.0 {
                    diff / tol
                } else if diff == 0.0 {
                    0.0
                } else {
                    f64::INFINITY
                }
            })
            .fold(0.0, f64::max)
    }
}

/// How incoming points are paired with existing points that lie within tolerance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    /// Every (incoming, existing) pair within tolerance accumulates, so one incoming point
    /// may be counted into several rows and one row may absorb several incoming points.
    #[default]
    AllWithinTolerance,
    /// Each incoming point folds into its single nearest existing row.
    Nearest,
    /// Incoming and existing rows are paired at most once per set, closest pairs first.
    OneToOne,
}

impl FromStr for MatchPolicy {
    type Err = NsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" | "all_within_tolerance" => Ok(MatchPolicy::AllWithinTolerance),
            "nearest" => Ok(MatchPolicy::Nearest),
            "one_to_one" => Ok(MatchPolicy::OneToOne),
            other => Err(NsError::UnknownOption(other.to_string())),
        }
    }
}

impl Display for MatchPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MatchPolicy::AllWithinTolerance => write!(f, "all_within_tolerance"),
            MatchPolicy::Nearest => write!(f, "nearest"),
            MatchPolicy::OneToOne => write!(f, "one_to_one"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MergeOptions {
    pub tolerance: Tolerance,
    pub policy: MatchPolicy,
}

impl MergeOptions {
    pub fn new(tolerance: Tolerance, policy: MatchPolicy) -> Self {
        MergeOptions { tolerance, policy }
    }
}

/// Counts describing what a merge did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    /// (incoming, existing) pairs whose counts were accumulated
    pub matched_pairs: usize,
    /// Incoming points appended as new rows
    pub appended: usize,
}

impl std::ops::AddAssign for MergeReport {
    fn add_assign(&mut self, other: MergeReport) {
        self.matched_pairs += other.matched_pairs;
        self.appended += other.appended;
    }
}

/// Row-oriented working copy of a cloud while sets are folded into it.
struct MergeBuffer {
    rows: Vec<[f64; 5]>,
    detector: Vec<f64>,
    monitor: Vec<f64>,
    time: Vec<f64>,
}

impl MergeBuffer {
    fn from_cloud(cloud: &PointCloud) -> Self {
        MergeBuffer {
            rows: (0..cloud.len()).map(|i| cloud.row(i)).collect(),
            detector: cloud.detector().to_vec(),
            monitor: cloud.monitor().to_vec(),
            time: cloud.time().to_vec(),
        }
    }

    fn pairs(&self, incoming: &[[f64; 5]], options: &MergeOptions) -> Vec<(usize, usize)> {
        let tolerance = &options.tolerance;
        let candidates = |row: [f64; 5]| {
            self.rows
                .iter()
                .enumerate()
                .filter(move |(_, existing)| tolerance.matches(&row, existing))
                .map(move |(j, existing)| (j, tolerance.scaled_distance(&row, existing)))
        };

        match options.policy {
            MatchPolicy::AllWithinTolerance => incoming
                .iter()
                .enumerate()
                .flat_map(|(i, row)| candidates(*row).map(move |(j, _)| (i, j)))
                .collect(),
            MatchPolicy::Nearest => incoming
                .iter()
                .enumerate()
                .filter_map(|(i, row)| {
                    candidates(*row)
                        .min_by_key(|&(j, distance)| (OrderedFloat(distance), j))
                        .map(|(j, _)| (i, j))
                })
                .collect(),
            MatchPolicy::OneToOne => {
                let mut all: Vec<(OrderedFloat<f64>, usize, usize)> = incoming
                    .iter()
                    .enumerate()
                    .flat_map(|(i, row)| {
                        candidates(*row).map(move |(j, d)| (OrderedFloat(d), i, j))
                    })
                    .collect();
                all.sort();

                let mut incoming_taken = vec![false; incoming.len()];
                let mut existing_taken = vec![false; self.rows.len()];
                let mut pairs = Vec::new();
                for (_, i, j) in all {
                    if !incoming_taken[i] && !existing_taken[j] {
                        incoming_taken[i] = true;
                        existing_taken[j] = true;
                        pairs.push((i, j));
                    }
                }
                pairs
            }
        }
    }

    fn fold(&mut self, incoming: &PointCloud, options: &MergeOptions) -> MergeReport {
        let rows: Vec<[f64; 5]> = (0..incoming.len()).map(|i| incoming.row(i)).collect();
        let pairs = self.pairs(&rows, options);

        let mut matched = vec![false; rows.len()];
        for &(i, j) in &pairs {
            self.detector[j] += incoming.detector()[i];
            self.monitor[j] += incoming.monitor()[i];
            self.time[j] += incoming.time()[i];
            matched[i] = true;
        }

        let mut appended = 0;
        for (i, row) in rows.into_iter().enumerate().filter(|(i, _)| !matched[*i]) {
            self.rows.push(row);
            self.detector.push(incoming.detector()[i]);
            self.monitor.push(incoming.monitor()[i]);
            self.time.push(incoming.time()[i]);
            appended += 1;
        }

        MergeReport {
            matched_pairs: pairs.len(),
            appended,
        }
    }

    /// Consumes the buffer, returning its columns in lexicographic `(h, k, l, e, temp)` order.
    fn into_sorted(self) -> (DMatrix<f64>, Vec<f64>, Vec<f64>, Vec<f64>) {
        let unsorted = DMatrix::from_fn(self.rows.len(), 5, |r, c| self.rows[r][c]);
        let order = lexsort_rows(&unsorted);

        let q = unsorted.select_rows(order.iter());
        let detector = order.iter().map(|&i| self.detector[i]).collect();
        let monitor = order.iter().map(|&i| self.monitor[i]).collect();
        let time = order.iter().map(|&i| self.time[i]).collect();
        (q, detector, monitor, time)
    }
}

impl PointCloud {
    fn fold_sets<'a, I>(&self, sets: I, options: &MergeOptions) -> (MergeBuffer, MergeReport)
    where
        I: IntoIterator<Item = &'a PointCloud>,
    {
        let mut buffer = MergeBuffer::from_cloud(self);
        let mut report = MergeReport::default();
        for (index, set) in sets.into_iter().enumerate() {
            let folded = buffer.fold(set, options);
            debug!(
                set = index,
                incoming = set.len(),
                matched_pairs = folded.matched_pairs,
                appended = folded.appended,
                policy = %options.policy,
                "folded point set"
            );
            report += folded;
        }
        (buffer, report)
    }

    /// Merges the given point sets into a copy of this cloud.
    ///
    /// # Description
    ///
    /// Sets are folded one after another, each matched against the progressively merged
    /// state. An incoming point within tolerance of an existing row on all five axes adds
    /// its detector, monitor and time to that row; unmatched points are appended. The result
    /// is sorted lexicographically by `(h, k, l, e, temp)` and normalizes to the largest
    /// merged monitor and time, as a freshly constructed cloud would.
    ///
    /// # Example
    ///
    /// ```
    /// use nscore::algorithm::merge::MergeOptions;
    /// use nscore::data::point_cloud::PointCloud;
    ///
    /// let a = PointCloud::new(1.0.into(), 0.0.into(), 0.0.into(), 0.0.into(), 0.0.into(),
    ///                         10.0.into(), 5.0.into(), 1.0.into()).unwrap();
    /// let b = PointCloud::new(1.0.into(), 0.0.into(), 0.0.into(), 0.0.into(), 0.0.into(),
    ///                         3.0.into(), 2.0.into(), 1.0.into()).unwrap();
    /// let merged = a.merged([&b], &MergeOptions::default());
    /// assert_eq!(merged.detector(), &[13.0]);
    /// assert_eq!(merged.monitor(), &[7.0]);
    /// ```
    pub fn merged<'a, I>(&self, sets: I, options: &MergeOptions) -> PointCloud
    where
        I: IntoIterator<Item = &'a PointCloud>,
    {
        let (buffer, _) = self.fold_sets(sets, options);
        let (q, detector, monitor, time) = buffer.into_sorted();

        let mut cloud = PointCloud::empty();
        cloud.m0 = nan_max(&monitor);
        cloud.t0 = nan_max(&time);
        cloud.time_norm = self.time_norm;
        cloud.replace_points(q, detector, monitor, time);
        cloud
    }

    /// Merges the given point sets into this cloud, keeping its normalization settings.
    pub fn merge_in_place<'a, I>(&mut self, sets: I, options: &MergeOptions) -> MergeReport
    where
        I: IntoIterator<Item = &'a PointCloud>,
    {
        let (buffer, report) = self.fold_sets(sets, options);
        let (q, detector, monitor, time) = buffer.into_sorted();
        self.replace_points(q, detector, monitor, time);
        report
    }

    /// Merges one loader column mapping into this cloud.
    pub fn merge_columns(
        &mut self,
        columns: RawColumns,
        options: &MergeOptions,
    ) -> Result<MergeReport> {
        let incoming = PointCloud::try_from(columns)?;
        Ok(self.merge_in_place([&incoming], options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(q: [f64; 5], detector: f64, monitor: f64) -> PointCloud {
        PointCloud::new(
            q[0].into(),
            q[1].into(),
            q[2].into(),
            q[3].into(),
            q[4].into(),
            detector.into(),
            monitor.into(),
            1.0.into(),
        )
        .unwrap()
    }

    fn cloud(rows: &[[f64; 5]]) -> PointCloud {
        let column = |c: usize| rows.iter().map(|r| r[c]).collect::<Vec<f64>>();
        PointCloud::new(
            column(0).into(),
            column(1).into(),
            column(2).into(),
            column(3).into(),
            column(4).into(),
            1.0.into(),
            1.0.into(),
            1.0.into(),
        )
        .unwrap()
    }

    #[test]
    fn test_tolerance_from_slice() {
        assert_eq!(Tolerance::from_slice(&[1.0; 5]).unwrap(), Tolerance::uniform(1.0));
        assert_eq!(Tolerance::from_slice(&[1.0; 4]), Err(NsError::shape("tolerance", 5, 4)));
    }

    #[test]
    fn test_tolerance_requires_all_axes() {
        let tolerance = Tolerance::default();
        assert!(tolerance.matches(&[1.0, 0.0, 0.0, 0.0, 0.0], &[1.0004, 0.0, 0.0, 0.0, 0.0]));
        assert!(!tolerance.matches(&[1.0, 0.0, 0.0, 0.0, 0.0], &[1.0, 0.0, 0.0, 0.0, 0.001]));
    }

    #[test]
    fn test_merge_accumulates_counts() {
        let existing = point([1.0, 0.0, 0.0, 0.0, 0.0], 10.0, 5.0);
        let incoming = point([1.0, 0.0, 0.0, 0.0, 0.0], 3.0, 2.0);
        let merged = existing.merged([&incoming], &MergeOptions::default());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.detector(), &[13.0]);
        assert_eq!(merged.monitor(), &[7.0]);
        assert_eq!(merged.time(), &[2.0]);
        assert_eq!(merged.m0, 7.0);
    }

    #[test]
    fn test_merge_sorts_lexicographically() {
        let a = cloud(&[[2.0, 0.0, 0.0, 0.0, 0.0], [1.0, 1.0, 0.0, 0.0, 0.0]]);
        let b = cloud(&[[1.0, 0.0, 5.0, 0.0, 0.0], [1.0, 0.0, 5.0, -1.0, 3.0]]);
        let merged = a.merged([&b], &MergeOptions::default());
        let rows: Vec<[f64; 5]> = (0..merged.len()).map(|i| merged.row(i)).collect();
        assert_eq!(
            rows,
            vec![
                [1.0, 0.0, 5.0, -1.0, 3.0],
                [1.0, 0.0, 5.0, 0.0, 0.0],
                [1.0, 1.0, 0.0, 0.0, 0.0],
                [2.0, 0.0, 0.0, 0.0, 0.0],
            ]
        );
    }

    #[test]
    fn test_sets_fold_against_progressive_state() {
        let base = cloud(&[[0.0; 5]]);
        let first = cloud(&[[1.0, 0.0, 0.0, 0.0, 0.0]]);
        let second = point([1.0, 0.0, 0.0, 0.0, 0.0], 4.0, 2.0);
        let merged = base.merged([&first, &second], &MergeOptions::default());
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.detector(), &[1.0, 5.0]);
        assert_eq!(merged.monitor(), &[1.0, 3.0]);
    }

    #[test]
    fn test_policies_on_ambiguous_match() {
        // two existing rows 4e-4 apart, one incoming point in between, closer to the second
        let existing = cloud(&[[0.0, 0.0, 0.0, 0.0, 0.0], [0.0004, 0.0, 0.0, 0.0, 0.0]]);
        let incoming = point([0.0003, 0.0, 0.0, 0.0, 0.0], 10.0, 1.0);

        let all = existing.merged([&incoming], &MergeOptions::default());
        assert_eq!(all.detector(), &[11.0, 11.0]);

        let options = MergeOptions::new(Tolerance::default(), MatchPolicy::Nearest);
        let nearest = existing.merged([&incoming], &options);
        assert_eq!(nearest.detector(), &[1.0, 11.0]);
    }

    #[test]
    fn test_one_to_one_appends_extra_points() {
        let existing = cloud(&[[0.0; 5]]);
        let incoming = cloud(&[[0.0001, 0.0, 0.0, 0.0, 0.0], [0.0002, 0.0, 0.0, 0.0, 0.0]]);
        let options = MergeOptions::new(Tolerance::default(), MatchPolicy::OneToOne);
        let mut merged = existing.clone();
        let report = merged.merge_in_place([&incoming], &options);
        assert_eq!(report, MergeReport { matched_pairs: 1, appended: 1 });
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.detector(), &[2.0, 1.0]);

        // the historical behaviour folds both incoming points into the single row
        let mut legacy = existing.clone();
        let report = legacy.merge_in_place([&incoming], &MergeOptions::default());
        assert_eq!(report, MergeReport { matched_pairs: 2, appended: 0 });
        assert_eq!(legacy.detector(), &[3.0]);
    }

    #[test]
    fn test_merge_in_place_keeps_reference() {
        let mut existing = point([0.0; 5], 10.0, 5.0);
        existing.m0 = 100.0;
        let incoming = point([1.0, 0.0, 0.0, 0.0, 0.0], 3.0, 20.0);
        existing.merge_in_place([&incoming], &MergeOptions::default());
        assert_eq!(existing.len(), 2);
        assert_eq!(existing.m0, 100.0);
    }

    #[test]
    fn test_merge_columns_validates_lengths() {
        let mut existing = point([0.0; 5], 1.0, 1.0);
        let mut columns = existing.to_columns();
        columns.monitor.push(3.0);
        assert!(matches!(
            existing.merge_columns(columns, &MergeOptions::default()),
            Err(NsError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("nearest".parse::<MatchPolicy>().unwrap(), MatchPolicy::Nearest);
        assert_eq!("one_to_one".parse::<MatchPolicy>().unwrap(), MatchPolicy::OneToOne);
        assert_eq!("all".parse::<MatchPolicy>().unwrap(), MatchPolicy::AllWithinTolerance);
        assert!("closest".parse::<MatchPolicy>().is_err());
    }
}
