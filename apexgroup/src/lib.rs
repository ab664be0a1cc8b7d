//! ApexGroup Columnar Group-By Engine
//!
//! Assigns dense 32-bit group ids to rows of Arrow key batches and can
//! reproduce the unique key tuples in group-id order. A companion row
//! segmenter partitions batches into runs of consecutive equal keys for
//! streaming aggregation over pre-sorted input.
//!
//! Two grouper implementations sit behind one facade:
//! - a vectorized fast path (little-endian hosts, 32-bit varlen offsets)
//!   built on an encoded row table and an open-addressed hash table
//! - a portable generic path that encodes rows to opaque byte strings and
//!   interns them in a hash map

pub mod data;
mod encode;
pub mod group;
mod hash;
mod row;
pub mod segment;

// Re-export main types
pub use data::{KeyBatch, KeyValue};
pub use group::{apply_groupings, make_groupings, Grouper};
pub use segment::{make_any_keys_segmenter, RowSegmenter, Segment};

/// Group-by engine error type
#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("Invalid: {0}")]
    Invalid(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),
}

pub type Result<T> = std::result::Result<T, GroupError>;

pub(crate) fn oom(e: std::collections::TryReserveError) -> GroupError {
    GroupError::OutOfMemory(e.to_string())
}

/// Execution context injected into groupers and segmenters.
///
/// Carries the mini-batch bounds of the fast path. The defaults match the
/// adaptive schedule of the vectorized pipeline (start small, double up to
/// the maximum); tests shrink them to force multi-mini-batch processing on
/// tiny inputs.
#[derive(Debug, Clone)]
pub struct ExecContext {
    /// Initial mini-batch size of the fast grouper.
    pub minibatch_size_min: usize,
    /// Upper bound on the adaptive mini-batch size.
    pub minibatch_size_max: usize,
}

impl Default for ExecContext {
    fn default() -> Self {
        Self {
            minibatch_size_min: 128,
            minibatch_size_max: 1024,
        }
    }
}

impl ExecContext {
    /// Context with a fixed mini-batch size.
    pub fn with_minibatch_size(size: usize) -> Self {
        assert!(size > 0);
        Self {
            minibatch_size_min: size,
            minibatch_size_max: size,
        }
    }
}
