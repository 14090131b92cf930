use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{NsError, Result};

/// A per-point input column: either one value replicated over every point, or one value per point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnInput {
    Scalar(f64),
    Array(Vec<f64>),
}

impl ColumnInput {
    /// Length of the column, `None` for a scalar.
    pub fn len(&self) -> Option<usize> {
        match self {
            ColumnInput::Scalar(_) => None,
            ColumnInput::Array(values) => Some(values.len()),
        }
    }

    /// Expands the column to exactly `n` values.
    ///
    /// # Example
    ///
    /// ```
    /// use nscore::data::columns::ColumnInput;
    ///
    /// assert_eq!(ColumnInput::Scalar(2.0).broadcast(3, "h").unwrap(), vec![2.0, 2.0, 2.0]);
    /// assert!(ColumnInput::Array(vec![1.0, 2.0]).broadcast(3, "h").is_err());
    /// ```
    pub fn broadcast(self, n: usize, what: &str) -> Result<Vec<f64>> {
        match self {
            ColumnInput::Scalar(value) => Ok(vec![value; n]),
            ColumnInput::Array(values) if values.len() == n => Ok(values),
            ColumnInput::Array(values) => Err(NsError::shape(what, n, values.len())),
        }
    }
}

impl Default for ColumnInput {
    fn default() -> Self {
        ColumnInput::Scalar(0.0)
    }
}

impl From<f64> for ColumnInput {
    fn from(value: f64) -> Self {
        ColumnInput::Scalar(value)
    }
}

impl From<Vec<f64>> for ColumnInput {
    fn from(values: Vec<f64>) -> Self {
        ColumnInput::Array(values)
    }
}

impl From<&[f64]> for ColumnInput {
    fn from(values: &[f64]) -> Self {
        ColumnInput::Array(values.to_vec())
    }
}

/// Equal-length columns as produced by an instrument file loader. Time is in minutes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawColumns {
    pub h: Vec<f64>,
    pub k: Vec<f64>,
    pub l: Vec<f64>,
    pub e: Vec<f64>,
    pub temp: Vec<f64>,
    pub detector: Vec<f64>,
    pub monitor: Vec<f64>,
    pub time: Vec<f64>,
}

impl RawColumns {
    pub const KEYS: [&'static str; 8] = ["h", "k", "l", "e", "temp", "detector", "monitor", "time"];

    /// Builds the column set from a loose name → values mapping.
    ///
    /// Every key in [`RawColumns::KEYS`] must be present and no other key is accepted.
    pub fn from_map(mut map: BTreeMap<String, Vec<f64>>) -> Result<Self> {
        if let Some(unknown) = map.keys().find(|key| !Self::KEYS.contains(&key.as_str())) {
            return Err(NsError::UnknownField(unknown.clone()));
        }

        let mut take = |key: &str| {
            map.remove(key)
                .ok_or_else(|| NsError::MissingField(key.to_string()))
        };

        let columns = RawColumns {
            h: take("h")?,
            k: take("k")?,
            l: take("l")?,
            e: take("e")?,
            temp: take("temp")?,
            detector: take("detector")?,
            monitor: take("monitor")?,
            time: take("time")?,
        };
        columns.validate()?;
        Ok(columns)
    }

    pub fn len(&self) -> usize {
        self.h.len()
    }

    pub fn is_empty(&self) -> bool {
        self.h.is_empty()
    }

    /// Checks that all columns share the length of `h`.
    pub fn validate(&self) -> Result<()> {
        let n = self.len();
        for (key, column) in Self::KEYS.iter().zip(self.columns()) {
            if column.len() != n {
                return Err(NsError::shape(*key, n, column.len()));
            }
        }
        Ok(())
    }

    fn columns(&self) -> [&Vec<f64>; 8] {
        [&self.h, &self.k, &self.l, &self.e, &self.temp, &self.detector, &self.monitor, &self.time]
    }
}

/// Closed construction configuration for a point cloud.
///
/// Missing columns default to zero; unknown keys are rejected during deserialization.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PointCloudConfig {
    pub h: ColumnInput,
    pub k: ColumnInput,
    pub l: ColumnInput,
    pub e: ColumnInput,
    pub temp: ColumnInput,
    pub detector: ColumnInput,
    pub monitor: ColumnInput,
    pub time: ColumnInput,
    /// Reference monitor, defaults to the largest monitor value
    pub m0: Option<f64>,
    /// Reference time, defaults to the largest time value
    pub t0: Option<f64>,
    pub time_norm: bool,
}

impl From<RawColumns> for PointCloudConfig {
    fn from(columns: RawColumns) -> Self {
        PointCloudConfig {
            h: columns.h.into(),
            k: columns.k.into(),
            l: columns.l.into(),
            e: columns.e.into(),
            temp: columns.temp.into(),
            detector: columns.detector.into(),
            monitor: columns.monitor.into(),
            time: columns.time.into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_map() -> BTreeMap<String, Vec<f64>> {
        RawColumns::KEYS.iter().map(|key| (key.to_string(), vec![1.0, 2.0])).collect()
    }

    #[test]
    fn test_from_map() {
        let columns = RawColumns::from_map(full_map()).unwrap();
        assert_eq!(columns.len(), 2);
        assert_eq!(columns.temp, vec![1.0, 2.0]);
    }

    #[test]
    fn test_from_map_missing_field() {
        let mut map = full_map();
        map.remove("monitor");
        assert_eq!(RawColumns::from_map(map), Err(NsError::MissingField("monitor".into())));
    }

    #[test]
    fn test_from_map_unknown_field() {
        let mut map = full_map();
        map.insert("tvti".into(), vec![1.0, 2.0]);
        assert_eq!(RawColumns::from_map(map), Err(NsError::UnknownField("tvti".into())));
    }

    #[test]
    fn test_from_map_length_mismatch() {
        let mut map = full_map();
        map.insert("detector".into(), vec![1.0]);
        assert!(matches!(
            RawColumns::from_map(map),
            Err(NsError::ShapeMismatch { expected: 2, found: 1, .. })
        ));
    }

    #[test]
    fn test_config_rejects_unknown_keys() {
        let parsed: std::result::Result<PointCloudConfig, _> =
            serde_json::from_str(r#"{"h": [1.0, 2.0], "colour": "red"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_config_scalars_and_defaults() {
        let config: PointCloudConfig =
            serde_json::from_str(r#"{"h": [1.0, 2.0], "k": 0.5, "time_norm": true}"#).unwrap();
        assert_eq!(config.h, ColumnInput::Array(vec![1.0, 2.0]));
        assert_eq!(config.k, ColumnInput::Scalar(0.5));
        assert_eq!(config.detector, ColumnInput::Scalar(0.0));
        assert!(config.time_norm);
        assert_eq!(config.m0, None);
    }
}
