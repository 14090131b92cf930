use std::str::FromStr;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use crate::algorithm::utility::{filter_with_mask, trapz};
use crate::data::point_cloud::{Axis, PointCloud};
use crate::error::{NsError, Result};

/// Background estimation policy, serialized as `{"type": ..., "value": ...}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Background {
    /// The given value, as is
    Constant(f64),
    /// Mean of the lowest `p` percent of non-negative intensities
    Percent(f64),
    /// Smallest intensity, NaN entries skipped
    Minimum,
    /// Any other policy name; estimates zero
    #[serde(other)]
    Unrecognized,
}

impl Background {
    /// Builds a policy from its name and value, falling back to [`Background::Unrecognized`].
    pub fn from_parts(kind: &str, value: f64) -> Self {
        match kind {
            "constant" => Background::Constant(value),
            "percent" => Background::Percent(value),
            "minimum" => Background::Minimum,
            _ => Background::Unrecognized,
        }
    }

    /// Estimates the background level of `intensity`.
    ///
    /// # Example
    ///
    /// ```
    /// use nscore::algorithm::moments::Background;
    ///
    /// let intensity = [4.0, 1.0, -3.0, 2.0, 8.0];
    /// assert_eq!(Background::Constant(5.0).estimate(&intensity), 5.0);
    /// assert_eq!(Background::Minimum.estimate(&intensity), -3.0);
    /// assert_eq!(Background::Percent(50.0).estimate(&intensity), 1.5);
    /// assert_eq!(Background::Unrecognized.estimate(&intensity), 0.0);
    /// ```
    pub fn estimate(&self, intensity: &[f64]) -> f64 {
        match self {
            Background::Constant(value) => *value,
            Background::Percent(percent) => {
                let mut values: Vec<f64> =
                    intensity.iter().copied().filter(|&v| v >= 0.0).collect();
                values.sort_by_key(|&v| OrderedFloat(v));
                let take = ((values.len() as f64) * percent / 100.0).floor().max(0.0) as usize;
                match take.min(values.len()) {
                    0 => 0.0,
                    n => Statistics::mean(&values[..n]),
                }
            }
            Background::Minimum => {
                let values: Vec<f64> = intensity.iter().copied().filter(|v| !v.is_nan()).collect();
                if values.is_empty() {
                    0.0
                } else {
                    Statistics::min(&values)
                }
            }
            Background::Unrecognized => 0.0,
        }
    }
}

/// How moments combine the four `(h, k, l, e)` axes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MomentMode {
    /// Sum of independent 1-D trapezoidal integrals, one per axis, over the points in
    /// their stored order. Meaningful when points are ordered along each axis, as after binning.
    #[default]
    AxisSum,
    /// Discrete intensity-weighted moments over all selected points, independent of order.
    Weighted,
}

impl FromStr for MomentMode {
    type Err = NsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "axis_sum" => Ok(MomentMode::AxisSum),
            "weighted" => Ok(MomentMode::Weighted),
            other => Err(NsError::UnknownOption(other.to_string())),
        }
    }
}

/// Selection and background for a moment calculation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MomentQuery {
    /// Points to include; all points when absent
    pub mask: Option<Vec<bool>>,
    /// Background subtracted from every intensity; zero when absent
    pub background: Option<Background>,
    pub mode: MomentMode,
}

impl MomentQuery {
    pub fn with_mask(mut self, mask: Vec<bool>) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn with_background(mut self, background: Background) -> Self {
        self.background = Some(background);
        self
    }

    pub fn with_mode(mut self, mode: MomentMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Background-subtracted signal and moment axes of the selected points.
struct MomentInput {
    axes: [Vec<f64>; 4],
    signal: Vec<f64>,
    mode: MomentMode,
}

impl MomentInput {
    /// Integral of `weight * signal`, per the moment mode.
    fn integral(&self, weight: impl Fn(usize) -> f64) -> f64 {
        let weighted: Vec<f64> = self
            .signal
            .iter()
            .enumerate()
            .map(|(i, s)| weight(i) * s)
            .collect();
        match self.mode {
            MomentMode::AxisSum => self.axes.iter().map(|x| trapz(&weighted, x)).sum(),
            MomentMode::Weighted => weighted.iter().sum(),
        }
    }

    fn zeroth(&self) -> f64 {
        self.integral(|_| 1.0)
    }

    fn first(&self, norm: f64) -> [f64; 4] {
        std::array::from_fn(|j| self.integral(|i| self.axes[j][i]) / norm)
    }

    fn second(&self, position: &[f64; 4], norm: f64) -> [f64; 4] {
        std::array::from_fn(|j| self.integral(|i| (self.axes[j][i] - position[j]).powi(2)) / norm)
    }
}

impl PointCloud {
    /// Estimates the background over the intensity of all points.
    pub fn bg_estimate(&self, background: &Background) -> f64 {
        background.estimate(&self.intensity())
    }

    fn moment_input(&self, query: &MomentQuery) -> Result<MomentInput> {
        let background = query.background.as_ref().map_or(0.0, |bg| self.bg_estimate(bg));
        let intensity = self.intensity();

        let select = |values: &[f64]| -> Vec<f64> {
            match &query.mask {
                Some(mask) => filter_with_mask(values, mask),
                None => values.to_vec(),
            }
        };

        if let Some(mask) = &query.mask {
            if mask.len() != self.len() {
                return Err(NsError::shape("mask", self.len(), mask.len()));
            }
        }

        Ok(MomentInput {
            axes: Axis::MOMENT.map(|axis| select(self.column(axis))),
            signal: select(&intensity).into_iter().map(|v| v - background).collect(),
            mode: query.mode,
        })
    }

    /// Integrated intensity of the selected points over `(h, k, l, e)`.
    ///
    /// With [`MomentMode::AxisSum`] this is the sum of four 1-D trapezoidal integrals of
    /// `intensity - background` against each axis; it normalizes [`PointCloud::position`]
    /// and [`PointCloud::width`] rather than being a volume integral.
    pub fn integrate(&self, query: &MomentQuery) -> Result<f64> {
        Ok(self.moment_input(query)?.zeroth())
    }

    /// Intensity-weighted mean position along `(h, k, l, e)`.
    pub fn position(&self, query: &MomentQuery) -> Result<[f64; 4]> {
        let input = self.moment_input(query)?;
        let norm = input.zeroth();
        Ok(input.first(norm))
    }

    /// Intensity-weighted mean-squared width along `(h, k, l, e)`.
    pub fn width(&self, query: &MomentQuery) -> Result<[f64; 4]> {
        let input = self.moment_input(query)?;
        let norm = input.zeroth();
        let position = input.first(norm);
        Ok(input.second(&position, norm))
    }
}
