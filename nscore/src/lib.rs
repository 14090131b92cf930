pub mod constants;
pub mod error;

// data module
pub mod data {
    pub mod columns;
    pub mod point_cloud;
}

// algorithm module
pub mod algorithm {
    pub mod utility;
    pub mod merge;
    pub mod binning;
    pub mod moments;
}

pub use crate::algorithm::binning::{
    default_binner, BinnedCloud, CellOutcome, EmptyCellPolicy, GridAxis, GridBinner, GridSpec,
};
pub use crate::algorithm::merge::{MatchPolicy, MergeOptions, MergeReport, Tolerance};
pub use crate::algorithm::moments::{Background, MomentMode, MomentQuery};
pub use crate::data::columns::{ColumnInput, PointCloudConfig, RawColumns};
pub use crate::data::point_cloud::{Axis, PlotDims, PointCloud};
pub use crate::error::{NsError, Result};
