use std::collections::HashMap;

use pyo3::prelude::*;

use nscore::{CellOutcome, EmptyCellPolicy, GridBinner};

use crate::py_point_cloud::{grid_from_dict, to_py_err, PyPointCloud};

/// A grid binner with its own worker pool, reusable across calls.
#[pyclass]
pub struct PyGridBinner {
    pub inner: GridBinner,
}

#[pymethods]
impl PyGridBinner {
    #[new]
    #[pyo3(signature = (num_threads=0, empty_policy="zero"))]
    pub fn new(num_threads: usize, empty_policy: &str) -> PyResult<Self> {
        let policy = empty_policy.parse::<EmptyCellPolicy>().map_err(to_py_err)?;
        let inner = GridBinner::new(num_threads).map_err(to_py_err)?.with_empty_policy(policy);
        Ok(PyGridBinner { inner })
    }

    #[getter]
    pub fn num_threads(&self) -> usize {
        self.inner.num_threads()
    }

    #[getter]
    pub fn empty_policy(&self) -> String {
        self.inner.empty_policy().to_string()
    }

    /// Rebins `cloud`, returning the binned cloud and the number of points averaged per
    /// cell (1 for a single point, 0 for an empty cell).
    pub fn bin(
        &self,
        cloud: &PyPointCloud,
        grid: HashMap<String, (f64, f64, usize)>,
    ) -> PyResult<(PyPointCloud, Vec<usize>)> {
        let spec = grid_from_dict(grid)?;
        let binned = self.inner.bin(&cloud.inner, &spec).map_err(to_py_err)?;
        let counts = binned
            .outcomes
            .iter()
            .map(|outcome| match outcome {
                CellOutcome::Averaged { count } => *count,
                CellOutcome::Degenerate => 1,
                CellOutcome::Empty => 0,
            })
            .collect();
        let cloud = PyPointCloud {
            inner: binned.cloud,
        };
        Ok((cloud, counts))
    }

    pub fn __repr__(&self) -> String {
        format!(
            "GridBinner(num_threads={}, empty_policy={})",
            self.inner.num_threads(),
            self.inner.empty_policy()
        )
    }
}
