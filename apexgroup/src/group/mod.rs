//! Group-id assignment over key batches
//!
//! [`Grouper`] maps each row of consumed batches to a dense 32-bit group
//! id (equal key tuples share an id) and reproduces the unique key tuples
//! in id order. Two implementations sit behind the facade: a vectorized
//! fast path and a portable generic fallback, selected per key schema at
//! construction.

mod fast;
mod generic;
mod groupings;
#[cfg(test)]
mod tests;

use arrow::array::UInt32Array;
use arrow::datatypes::DataType;
use log::debug;

pub use fast::FastGrouper;
pub use generic::GenericGrouper;
pub use groupings::{apply_groupings, make_groupings};

use crate::data::KeyBatch;
use crate::{ExecContext, Result};

/// Shared kernel selector for the three public entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GrouperMode {
    /// Insert unseen keys; no ids returned.
    Populate,
    /// Insert unseen keys and return per-row ids.
    Consume,
    /// Return per-row ids without inserting; unknown keys come back null.
    Lookup,
}

/// Assigns dense group ids to rows with equal key tuples.
pub enum Grouper {
    Fast(FastGrouper),
    Generic(GenericGrouper),
}

impl Grouper {
    /// Build a grouper for an ordered key schema, dispatching to the fast
    /// path when it applies.
    pub fn try_new(key_types: &[DataType], ctx: &ExecContext) -> Result<Self> {
        if FastGrouper::can_use(key_types) {
            debug!("grouper: fast path for {key_types:?}");
            Ok(Self::Fast(FastGrouper::try_new(key_types, ctx)?))
        } else {
            debug!("grouper: generic path for {key_types:?}");
            Ok(Self::Generic(GenericGrouper::try_new(key_types)?))
        }
    }

    pub fn key_types(&self) -> &[DataType] {
        match self {
            Self::Fast(g) => g.key_types(),
            Self::Generic(g) => g.key_types(),
        }
    }

    /// Insert the window's unseen keys without producing ids.
    pub fn populate(&mut self, batch: &KeyBatch, offset: i64, length: i64) -> Result<()> {
        match self {
            Self::Fast(g) => g.consume_impl(batch, offset, length, GrouperMode::Populate),
            Self::Generic(g) => g.consume_impl(batch, offset, length, GrouperMode::Populate),
        }
        .map(|_| ())
    }

    /// Map each row of the window to its group id, inserting unseen keys.
    pub fn consume(&mut self, batch: &KeyBatch, offset: i64, length: i64) -> Result<UInt32Array> {
        let ids = match self {
            Self::Fast(g) => g.consume_impl(batch, offset, length, GrouperMode::Consume)?,
            Self::Generic(g) => g.consume_impl(batch, offset, length, GrouperMode::Consume)?,
        };
        debug_assert!(ids.is_some());
        Ok(ids.unwrap_or_else(|| UInt32Array::from(Vec::<u32>::new())))
    }

    /// Map each row of the window to its group id without inserting; rows
    /// with unseen keys are null in the result.
    pub fn lookup(&mut self, batch: &KeyBatch, offset: i64, length: i64) -> Result<UInt32Array> {
        let ids = match self {
            Self::Fast(g) => g.consume_impl(batch, offset, length, GrouperMode::Lookup)?,
            Self::Generic(g) => g.consume_impl(batch, offset, length, GrouperMode::Lookup)?,
        };
        debug_assert!(ids.is_some());
        Ok(ids.unwrap_or_else(|| UInt32Array::from(Vec::<u32>::new())))
    }

    pub fn num_groups(&self) -> u32 {
        match self {
            Self::Fast(g) => g.num_groups(),
            Self::Generic(g) => g.num_groups(),
        }
    }

    /// Forget all groups; dictionaries observed so far are retained.
    pub fn reset(&mut self) -> Result<()> {
        match self {
            Self::Fast(g) => g.reset(),
            Self::Generic(g) => g.reset(),
        }
    }

    /// The unique key tuples in group-id order.
    pub fn get_uniques(&mut self) -> Result<KeyBatch> {
        match self {
            Self::Fast(g) => g.get_uniques(),
            Self::Generic(g) => g.get_uniques(),
        }
    }
}
