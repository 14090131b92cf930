mod py_binning;
mod py_point_cloud;

use pyo3::prelude::*;

use crate::py_binning::PyGridBinner;
use crate::py_point_cloud::PyPointCloud;

#[pymodule]
fn nspy_connector(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyPointCloud>()?;
    m.add_class::<PyGridBinner>()?;
    Ok(())
}
