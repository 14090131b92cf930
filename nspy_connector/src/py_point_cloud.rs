use std::collections::HashMap;

use numpy::{PyArray1, PyReadonlyArray1};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::PyDict;

use nscore::{
    Axis, Background, ColumnInput, GridAxis, GridSpec, MatchPolicy, MergeOptions, MomentMode,
    MomentQuery, NsError, PointCloud, PointCloudConfig, Tolerance,
};

pub fn to_py_err(error: NsError) -> PyErr {
    PyValueError::new_err(error.to_string())
}

/// A column passed from Python, either a numpy array or a single number.
#[derive(FromPyObject)]
pub enum PyColumn<'py> {
    Array(PyReadonlyArray1<'py, f64>),
    Scalar(f64),
}

impl From<PyColumn<'_>> for ColumnInput {
    fn from(column: PyColumn<'_>) -> Self {
        match column {
            PyColumn::Array(array) => ColumnInput::Array(array.as_array().to_vec()),
            PyColumn::Scalar(value) => ColumnInput::Scalar(value),
        }
    }
}

/// Reads a `{"type": ..., "value": ...}` background dictionary.
pub fn background_from_dict(dict: &Bound<'_, PyDict>) -> PyResult<Background> {
    let kind: String = match dict.get_item("type")? {
        Some(kind) => kind.extract()?,
        None => return Err(PyValueError::new_err("background requires a 'type' entry")),
    };
    let value: f64 = match dict.get_item("value")? {
        Some(value) => value.extract()?,
        None => 0.0,
    };
    Ok(Background::from_parts(&kind, value))
}

/// Builds a grid from `{"h": (lower, upper, count), ...}`, requiring all five axes.
pub fn grid_from_dict(axes: HashMap<String, (f64, f64, usize)>) -> PyResult<GridSpec> {
    let known = |key: &String| Axis::ALL.iter().any(|axis| axis.name() == key.as_str());
    if let Some(unknown) = axes.keys().find(|key| !known(key)) {
        return Err(to_py_err(NsError::UnknownField(unknown.clone())));
    }
    let axis = |axis: Axis| -> PyResult<GridAxis> {
        axes.get(axis.name())
            .map(|&triple| GridAxis::from(triple))
            .ok_or_else(|| to_py_err(NsError::MissingField(axis.name().to_string())))
    };
    Ok(GridSpec::new(
        axis(Axis::H)?,
        axis(Axis::K)?,
        axis(Axis::L)?,
        axis(Axis::E)?,
        axis(Axis::Temp)?,
    ))
}

pub fn merge_options(tolerance: Option<Vec<f64>>, policy: Option<&str>) -> PyResult<MergeOptions> {
    let tolerance = match tolerance.as_deref() {
        None => Tolerance::default(),
        Some([value]) => Tolerance::uniform(*value),
        Some(values) => Tolerance::from_slice(values).map_err(to_py_err)?,
    };
    let policy = match policy {
        Some(name) => name.parse::<MatchPolicy>().map_err(to_py_err)?,
        None => MatchPolicy::default(),
    };
    Ok(MergeOptions::new(tolerance, policy))
}

fn moment_query(
    mask: Option<PyReadonlyArray1<'_, bool>>,
    background: Option<&Bound<'_, PyDict>>,
    mode: &str,
) -> PyResult<MomentQuery> {
    Ok(MomentQuery {
        mask: mask.map(|mask| mask.as_array().to_vec()),
        background: background.map(background_from_dict).transpose()?,
        mode: mode.parse::<MomentMode>().map_err(to_py_err)?,
    })
}

fn array<'py>(py: Python<'py>, values: Vec<f64>) -> Bound<'py, PyArray1<f64>> {
    PyArray1::from_vec_bound(py, values)
}

#[pyclass]
#[derive(Clone)]
pub struct PyPointCloud {
    pub inner: PointCloud,
}

#[pymethods]
impl PyPointCloud {
    #[new]
    #[pyo3(signature = (
        h=None,
        k=None,
        l=None,
        e=None,
        temp=None,
        detector=None,
        monitor=None,
        time=None,
        m0=None,
        t0=None,
        time_norm=false
    ))]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        h: Option<PyColumn>,
        k: Option<PyColumn>,
        l: Option<PyColumn>,
        e: Option<PyColumn>,
        temp: Option<PyColumn>,
        detector: Option<PyColumn>,
        monitor: Option<PyColumn>,
        time: Option<PyColumn>,
        m0: Option<f64>,
        t0: Option<f64>,
        time_norm: bool,
    ) -> PyResult<Self> {
        let column = |c: Option<PyColumn>| c.map(ColumnInput::from).unwrap_or_default();
        let config = PointCloudConfig {
            h: column(h),
            k: column(k),
            l: column(l),
            e: column(e),
            temp: column(temp),
            detector: column(detector),
            monitor: column(monitor),
            time: column(time),
            m0,
            t0,
            time_norm,
        };
        Ok(PyPointCloud {
            inner: PointCloud::from_config(config).map_err(to_py_err)?,
        })
    }

    #[staticmethod]
    pub fn from_json(json: &str) -> PyResult<Self> {
        let config: PointCloudConfig =
            serde_json::from_str(json).map_err(|e| PyValueError::new_err(e.to_string()))?;
        Ok(PyPointCloud {
            inner: PointCloud::from_config(config).map_err(to_py_err)?,
        })
    }

    /// Serializes columns and normalization settings; the inverse of `from_json`.
    pub fn to_json(&self) -> PyResult<String> {
        let columns = self.inner.to_columns();
        let config = PointCloudConfig {
            m0: Some(self.inner.m0),
            t0: Some(self.inner.t0),
            time_norm: self.inner.time_norm,
            ..PointCloudConfig::from(columns)
        };
        serde_json::to_string(&config).map_err(|e| PyValueError::new_err(e.to_string()))
    }

    #[getter]
    pub fn h<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray1<f64>> {
        array(py, self.inner.h().to_vec())
    }

    #[getter]
    pub fn k<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray1<f64>> {
        array(py, self.inner.k().to_vec())
    }

    #[getter]
    pub fn l<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray1<f64>> {
        array(py, self.inner.l().to_vec())
    }

    #[getter]
    pub fn e<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray1<f64>> {
        array(py, self.inner.e().to_vec())
    }

    #[getter]
    pub fn temp<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray1<f64>> {
        array(py, self.inner.temp().to_vec())
    }

    #[getter]
    pub fn detector<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray1<f64>> {
        array(py, self.inner.detector().to_vec())
    }

    #[setter]
    pub fn set_detector(&mut self, values: PyColumn) -> PyResult<()> {
        self.inner.set_detector(values.into()).map_err(to_py_err)
    }

    #[getter]
    pub fn monitor<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray1<f64>> {
        array(py, self.inner.monitor().to_vec())
    }

    #[setter]
    pub fn set_monitor(&mut self, values: PyColumn) -> PyResult<()> {
        self.inner.set_monitor(values.into()).map_err(to_py_err)
    }

    #[getter]
    pub fn time<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray1<f64>> {
        array(py, self.inner.time().to_vec())
    }

    #[setter]
    pub fn set_time(&mut self, values: PyColumn) -> PyResult<()> {
        self.inner.set_time(values.into()).map_err(to_py_err)
    }

    /// The `(N, 5)` Q matrix as a flat row-major array, reshape on the Python side.
    pub fn q_flat<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray1<f64>> {
        array(py, (0..self.inner.len()).flat_map(|i| self.inner.row(i)).collect())
    }

    /// Replaces one Q column, `axis` being one of h, k, l, e, temp.
    pub fn set_axis(&mut self, axis: &str, values: PyColumn) -> PyResult<()> {
        let axis = Axis::ALL
            .into_iter()
            .find(|a| a.name() == axis)
            .ok_or_else(|| to_py_err(NsError::UnknownField(axis.to_string())))?;
        self.inner.set_column(axis, values.into()).map_err(to_py_err)
    }

    #[getter]
    pub fn intensity<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray1<f64>> {
        array(py, self.inner.intensity())
    }

    #[getter]
    pub fn error<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray1<f64>> {
        array(py, self.inner.error())
    }

    #[getter]
    pub fn detailed_balance_factor<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray1<f64>> {
        array(py, self.inner.detailed_balance_factor())
    }

    #[getter]
    pub fn m0(&self) -> f64 {
        self.inner.m0
    }

    #[setter]
    pub fn set_m0(&mut self, m0: f64) {
        self.inner.m0 = m0;
    }

    #[getter]
    pub fn t0(&self) -> f64 {
        self.inner.t0
    }

    #[setter]
    pub fn set_t0(&mut self, t0: f64) {
        self.inner.t0 = t0;
    }

    #[getter]
    pub fn time_norm(&self) -> bool {
        self.inner.time_norm
    }

    #[setter]
    pub fn set_time_norm(&mut self, time_norm: bool) {
        self.inner.time_norm = time_norm;
    }

    /// Merges `others` into this cloud in order, returning `(matched_pairs, appended)`.
    #[pyo3(signature = (others, tolerance=None, policy=None))]
    pub fn combine(
        &mut self,
        others: Vec<PyRef<PyPointCloud>>,
        tolerance: Option<Vec<f64>>,
        policy: Option<&str>,
    ) -> PyResult<(usize, usize)> {
        let options = merge_options(tolerance, policy)?;
        let report = self.inner.merge_in_place(others.iter().map(|other| &other.inner), &options);
        Ok((report.matched_pairs, report.appended))
    }

    pub fn bin(&self, grid: HashMap<String, (f64, f64, usize)>) -> PyResult<PyPointCloud> {
        let spec = grid_from_dict(grid)?;
        Ok(PyPointCloud {
            inner: self.inner.bin(&spec).map_err(to_py_err)?,
        })
    }

    #[pyo3(signature = (mask=None, background=None, mode="axis_sum"))]
    pub fn integrate(
        &self,
        mask: Option<PyReadonlyArray1<'_, bool>>,
        background: Option<&Bound<'_, PyDict>>,
        mode: &str,
    ) -> PyResult<f64> {
        self.inner.integrate(&moment_query(mask, background, mode)?).map_err(to_py_err)
    }

    #[pyo3(signature = (mask=None, background=None, mode="axis_sum"))]
    pub fn position(
        &self,
        mask: Option<PyReadonlyArray1<'_, bool>>,
        background: Option<&Bound<'_, PyDict>>,
        mode: &str,
    ) -> PyResult<[f64; 4]> {
        self.inner.position(&moment_query(mask, background, mode)?).map_err(to_py_err)
    }

    #[pyo3(signature = (mask=None, background=None, mode="axis_sum"))]
    pub fn width(
        &self,
        mask: Option<PyReadonlyArray1<'_, bool>>,
        background: Option<&Bound<'_, PyDict>>,
        mode: &str,
    ) -> PyResult<[f64; 4]> {
        self.inner.width(&moment_query(mask, background, mode)?).map_err(to_py_err)
    }

    pub fn bg_estimate(&self, background: &Bound<'_, PyDict>) -> PyResult<f64> {
        Ok(self.inner.bg_estimate(&background_from_dict(background)?))
    }

    pub fn plottable_mask<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray1<bool>> {
        PyArray1::from_vec_bound(py, self.inner.plottable_mask())
    }

    /// Masked columns and intensity keyed by name, for plotting.
    pub fn plot_dims<'py>(
        &self,
        py: Python<'py>,
    ) -> HashMap<&'static str, Bound<'py, PyArray1<f64>>> {
        let dims = self.inner.plot_dims();
        ["h", "k", "l", "e", "temp", "intensity", "error"]
            .into_iter()
            .filter_map(|name| dims.get(name).map(|values| (name, array(py, values.to_vec()))))
            .collect()
    }

    pub fn select(&self, mask: PyReadonlyArray1<'_, bool>) -> PyResult<PyPointCloud> {
        let mask = mask.as_array().to_vec();
        Ok(PyPointCloud {
            inner: self.inner.select(&mask).map_err(to_py_err)?,
        })
    }

    pub fn __len__(&self) -> usize {
        self.inner.len()
    }

    pub fn __add__(&self, other: PyRef<PyPointCloud>) -> PyPointCloud {
        PyPointCloud {
            inner: &self.inner + &other.inner,
        }
    }

    pub fn __sub__(&self, other: PyRef<PyPointCloud>) -> PyPointCloud {
        PyPointCloud {
            inner: &self.inner - &other.inner,
        }
    }

    pub fn __mul__(&self, factor: f64) -> PyPointCloud {
        PyPointCloud {
            inner: self.inner.scaled(factor),
        }
    }

    pub fn __truediv__(&self, divisor: f64) -> PyPointCloud {
        PyPointCloud {
            inner: self.inner.clone() / divisor,
        }
    }

    pub fn __pow__(&self, exponent: f64, _modulo: Option<&Bound<'_, PyAny>>) -> PyPointCloud {
        PyPointCloud {
            inner: self.inner.powf(exponent),
        }
    }

    pub fn __repr__(&self) -> String {
        self.inner.to_string()
    }
}
