use thiserror::Error;

/// Errors raised by point cloud construction, merging and binning.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NsError {
    /// An array did not have the length (or column count) the cloud requires.
    #[error("shape mismatch for `{what}`: expected {expected}, found {found}")]
    ShapeMismatch {
        what: String,
        expected: usize,
        found: usize,
    },

    /// A column mapping lacks one of the required keys.
    #[error("missing required field `{0}`")]
    MissingField(String),

    /// A column mapping or configuration carries a key that is not part of the closed set.
    #[error("unknown field `{0}`")]
    UnknownField(String),

    /// A policy or mode name could not be parsed.
    #[error("unknown option `{0}`")]
    UnknownOption(String),

    #[error("invalid grid: {0}")]
    InvalidGrid(String),

    #[error("could not build thread pool: {0}")]
    ThreadPool(String),
}

impl NsError {
    pub fn shape(what: impl Into<String>, expected: usize, found: usize) -> Self {
        NsError::ShapeMismatch { what: what.into(), expected, found }
    }
}

pub type Result<T> = std::result::Result<T, NsError>;
