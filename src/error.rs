use thiserror::Error;

/// Errors reported by checked collection operations.
///
/// Checked operations validate their arguments before touching the tree,
/// so a returned error implies the collection is unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("operation on an empty collection")]
    EmptyCollection,

    #[error("invalid range {lo}..{hi} for length {len}")]
    InvalidRange { lo: usize, hi: usize, len: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
