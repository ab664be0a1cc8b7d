//! Equal-key run segmentation over streaming batches
//!
//! A [`RowSegmenter`] splits each batch into maximal runs of consecutive
//! rows whose key tuple is equal, remembering just enough state (the last
//! key's bytes, or the last row's group id) to report whether the first
//! run of a batch continues the previous batch's final run.

use arrow::array::Array;
use arrow::datatypes::DataType;
use serde::{Deserialize, Serialize};

use crate::data::{check_batch, KeyBatch, KeyColumn, KeyValue};
use crate::group::Grouper;
use crate::{ExecContext, Result};

/// Sentinel group id: no previous batch observed.
const NO_GROUP_ID: u32 = u32::MAX;

/// The first segment of the very first batch extends by definition.
const DEFAULT_EXTENDS: bool = true;

/// A maximal run of consecutive rows sharing one key within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub offset: i64,
    pub length: i64,
    /// True iff the segment reaches the batch end and may continue into
    /// the next batch.
    pub is_open: bool,
    /// True iff the segment continues the previous batch's final segment.
    pub extends: bool,
}

fn make_segment(batch_length: i64, offset: i64, length: i64, extends: bool) -> Segment {
    Segment {
        offset,
        length,
        is_open: offset + length >= batch_length,
        extends,
    }
}

/// Produces equal-key segments for a stream of batches.
pub enum RowSegmenter {
    NoKeys(NoKeysSegmenter),
    SimpleKey(SimpleKeySegmenter),
    AnyKeys(AnyKeysSegmenter),
}

impl RowSegmenter {
    /// Select a variant for the key schema: no keys, a single
    /// non-nullable fixed-width key, or the general grouper-backed form.
    pub fn try_new(
        key_types: Vec<DataType>,
        nullable_keys: bool,
        ctx: &ExecContext,
    ) -> Result<Self> {
        if key_types.is_empty() {
            return Ok(Self::NoKeys(NoKeysSegmenter::new()));
        }
        if !nullable_keys && key_types.len() == 1 {
            if let Some(width) = key_types[0].primitive_width() {
                let key_type = key_types.into_iter().next().unwrap();
                return Ok(Self::SimpleKey(SimpleKeySegmenter::new(key_type, width)));
            }
        }
        Ok(Self::AnyKeys(AnyKeysSegmenter::try_new(key_types, ctx)?))
    }

    pub fn key_types(&self) -> &[DataType] {
        match self {
            Self::NoKeys(s) => &s.key_types,
            Self::SimpleKey(s) => &s.key_types,
            Self::AnyKeys(s) => &s.key_types,
        }
    }

    /// Forget the previous batch; the next batch is treated as the first.
    pub fn reset(&mut self) -> Result<()> {
        match self {
            Self::NoKeys(_) => Ok(()),
            Self::SimpleKey(s) => s.reset(),
            Self::AnyKeys(s) => s.reset(),
        }
    }

    /// Segment one batch. The returned segments partition `[0, len)`; the
    /// last (and only the last) may be open. An empty batch yields no
    /// segments.
    pub fn get_segments(&mut self, batch: &KeyBatch) -> Result<Vec<Segment>> {
        match self {
            Self::NoKeys(s) => s.get_segments(batch),
            Self::SimpleKey(s) => s.get_segments(batch),
            Self::AnyKeys(s) => s.get_segments(batch),
        }
    }
}

/// Force the general grouper-backed segmenter even for key schemas the
/// simple variant could handle.
pub fn make_any_keys_segmenter(
    key_types: Vec<DataType>,
    ctx: &ExecContext,
) -> Result<RowSegmenter> {
    Ok(RowSegmenter::AnyKeys(AnyKeysSegmenter::try_new(
        key_types, ctx,
    )?))
}

/// Zero keys: every non-empty batch is one segment extending the last.
pub struct NoKeysSegmenter {
    key_types: Vec<DataType>,
}

impl NoKeysSegmenter {
    fn new() -> Self {
        Self {
            key_types: Vec::new(),
        }
    }

    fn get_segments(&self, batch: &KeyBatch) -> Result<Vec<Segment>> {
        check_batch(batch, &self.key_types)?;
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let len = batch.len() as i64;
        Ok(vec![make_segment(len, 0, len, DEFAULT_EXTENDS)])
    }
}

/// Single non-nullable fixed-width key: run boundaries by byte compare,
/// with the last key's bytes saved across batches.
pub struct SimpleKeySegmenter {
    key_types: Vec<DataType>,
    byte_width: usize,
    saved_key: Vec<u8>,
    extend_was_called: bool,
}

impl SimpleKeySegmenter {
    fn new(key_type: DataType, byte_width: usize) -> Self {
        Self {
            key_types: vec![key_type],
            byte_width,
            saved_key: vec![0; byte_width],
            extend_was_called: false,
        }
    }

    fn reset(&mut self) -> Result<()> {
        self.extend_was_called = false;
        Ok(())
    }

    fn extend(&mut self, key: &[u8]) -> bool {
        if !self.extend_was_called {
            self.extend_was_called = true;
            return DEFAULT_EXTENDS;
        }
        self.saved_key == key
    }

    fn get_segments(&mut self, batch: &KeyBatch) -> Result<Vec<Segment>> {
        check_batch(batch, &self.key_types)?;
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let len = batch.len();

        match &batch.values()[0] {
            KeyValue::Scalar(scalar) => {
                debug_assert_eq!(scalar.null_count(), 0);
                let col = KeyColumn::try_new(scalar)?;
                let key = col.fixed_bytes(0);
                let extends = self.extend(key);
                let segment = make_segment(len as i64, 0, len as i64, extends);
                self.saved_key.copy_from_slice(key);
                Ok(vec![segment])
            }
            KeyValue::Array(array) => {
                debug_assert_eq!(array.null_count(), 0);
                let col = KeyColumn::try_new(array)?;
                debug_assert_eq!(self.byte_width, col.metadata.fixed_length as usize);
                let extends = self.extend(col.fixed_bytes(0));
                let mut segments = Vec::new();
                let mut offset = 0;
                while offset < len {
                    let match_length = Self::match_length(&col, offset, len);
                    segments.push(make_segment(
                        len as i64,
                        offset as i64,
                        match_length as i64,
                        if offset == 0 { extends } else { false },
                    ));
                    offset += match_length;
                }
                self.saved_key.copy_from_slice(col.fixed_bytes(len - 1));
                Ok(segments)
            }
        }
    }

    /// Length of the run of rows equal to the row at `offset`.
    fn match_length(col: &KeyColumn, offset: usize, len: usize) -> usize {
        let key = col.fixed_bytes(offset);
        let mut cursor = offset;
        while cursor < len && col.fixed_bytes(cursor) == key {
            cursor += 1;
        }
        cursor - offset
    }
}

/// General case: an embedded grouper detects run boundaries, and the last
/// row's group id is saved to decide `extends` for the next batch.
pub struct AnyKeysSegmenter {
    key_types: Vec<DataType>,
    grouper: Grouper,
    save_group_id: u32,
}

impl AnyKeysSegmenter {
    fn try_new(key_types: Vec<DataType>, ctx: &ExecContext) -> Result<Self> {
        let grouper = Grouper::try_new(&key_types, ctx)?;
        Ok(Self {
            key_types,
            grouper,
            save_group_id: NO_GROUP_ID,
        })
    }

    fn reset(&mut self) -> Result<()> {
        self.grouper.reset()?;
        self.save_group_id = NO_GROUP_ID;
        Ok(())
    }

    /// Group id of a single row, under the grouper state carried over
    /// from the previous batch.
    fn map_group_id_at(&mut self, batch: &KeyBatch, offset: i64) -> Result<u32> {
        let ids = self.grouper.consume(batch, offset, 1)?;
        debug_assert_eq!(ids.len(), 1);
        debug_assert_eq!(ids.null_count(), 0);
        Ok(ids.value(0))
    }

    fn get_segments(&mut self, batch: &KeyBatch) -> Result<Vec<Segment>> {
        check_batch(batch, &self.key_types)?;
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let len = batch.len();

        // The first row's group id must be computed before the reset
        // below; afterwards the grouper's ids are incomparable with the
        // saved one.
        let extends = if self.save_group_id != NO_GROUP_ID {
            self.map_group_id_at(batch, 0)? == self.save_group_id
        } else {
            DEFAULT_EXTENDS
        };

        // Resetting drops the grouper's ids, freeing memory for the next
        // segment.
        self.grouper.reset()?;

        let ids = self.grouper.consume(batch, 0, -1)?;
        debug_assert_eq!(ids.len(), len);
        debug_assert_eq!(ids.null_count(), 0);

        let mut segments = Vec::new();
        let mut current = 0;
        for cursor in 1..len {
            if ids.value(cursor) != ids.value(current) {
                segments.push(make_segment(
                    len as i64,
                    current as i64,
                    (cursor - current) as i64,
                    if current == 0 { extends } else { false },
                ));
                current = cursor;
            }
        }
        segments.push(make_segment(
            len as i64,
            current as i64,
            (len - current) as i64,
            if current == 0 { extends } else { false },
        ));

        self.save_group_id = ids.value(len - 1);
        Ok(segments)
    }
}
