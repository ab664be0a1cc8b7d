//! Encoded row table for the vectorized group-by path
//!
//! Keys are stored row-major: a contiguous fixed-section buffer (one slot
//! per column), a sideband per-row null mask (bit set = null), and, when
//! any column is variable length, one arena record per row holding the
//! varlen payloads. Row `i`'s bytes are stable for the table's lifetime
//! and all padding is zero-filled, so equal key tuples always compare
//! byte-equal.

use std::sync::Arc;

use arrow::util::bit_util;

use crate::data::{KeyColumn, KeyColumnMetadata};
use crate::{oom, Result};

pub(crate) fn align(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Row layout derived once from the column descriptors.
///
/// Fixed-section slots per column: null type = 0 bytes, boolean = 1 byte,
/// fixed width W = W bytes, dictionary = index width, varlen = 4-byte
/// payload length. The fixed row width is padded to `row_alignment`;
/// varlen payload starts are padded to `string_alignment` within a row's
/// arena record.
#[derive(Debug)]
pub(crate) struct RowTableMetadata {
    cols: Vec<KeyColumnMetadata>,
    col_offsets: Vec<usize>,
    fixed_row_width: usize,
    null_mask_bytes: usize,
    is_fixed_length: bool,
    row_alignment: usize,
    string_alignment: usize,
}

impl RowTableMetadata {
    pub fn new(
        cols: Vec<KeyColumnMetadata>,
        row_alignment: usize,
        string_alignment: usize,
    ) -> Self {
        assert!(row_alignment.is_power_of_two() && row_alignment % 8 == 0);
        assert!(string_alignment.is_power_of_two() && string_alignment % 8 == 0);
        let mut col_offsets = Vec::with_capacity(cols.len());
        let mut width = 0;
        for col in &cols {
            col_offsets.push(width);
            width += Self::slot_width(col);
        }
        let is_fixed_length = cols.iter().all(|c| c.is_fixed_length);
        Self {
            null_mask_bytes: bit_util::ceil(cols.len(), 8),
            fixed_row_width: align(width, row_alignment),
            cols,
            col_offsets,
            is_fixed_length,
            row_alignment,
            string_alignment,
        }
    }

    fn slot_width(col: &KeyColumnMetadata) -> usize {
        if col.is_null_type {
            0
        } else if !col.is_fixed_length {
            4
        } else if col.fixed_length == 0 {
            1
        } else {
            col.fixed_length as usize
        }
    }

    pub fn num_cols(&self) -> usize {
        self.cols.len()
    }

    pub fn col(&self, i: usize) -> &KeyColumnMetadata {
        &self.cols[i]
    }

    pub fn col_offset(&self, i: usize) -> usize {
        self.col_offsets[i]
    }
}

/// Append-only store of encoded key rows.
#[derive(Debug)]
pub(crate) struct RowTable {
    metadata: Arc<RowTableMetadata>,
    num_rows: usize,
    fixed: Vec<u8>,
    null_masks: Vec<u8>,
    /// Arena record boundaries; `offsets[num_rows]` is the arena size and
    /// `offsets[0] == 0` even for an empty table.
    offsets: Vec<u32>,
    varlen: Vec<u8>,
}

impl RowTable {
    pub fn new(metadata: Arc<RowTableMetadata>) -> Self {
        Self {
            metadata,
            num_rows: 0,
            fixed: Vec::new(),
            null_masks: Vec::new(),
            offsets: vec![0],
            varlen: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.num_rows
    }

    /// Truncate to zero rows, keeping the allocations.
    pub fn clean(&mut self) {
        self.num_rows = 0;
        self.fixed.clear();
        self.null_masks.clear();
        self.offsets.clear();
        self.offsets.push(0);
        self.varlen.clear();
    }

    pub fn fixed_row(&self, row: usize) -> &[u8] {
        let width = self.metadata.fixed_row_width;
        &self.fixed[row * width..(row + 1) * width]
    }

    pub fn null_mask(&self, row: usize) -> &[u8] {
        let width = self.metadata.null_mask_bytes;
        &self.null_masks[row * width..(row + 1) * width]
    }

    /// The row's arena record (empty for all-fixed layouts).
    pub fn varlen_row(&self, row: usize) -> &[u8] {
        if self.metadata.is_fixed_length {
            return &[];
        }
        let start = self.offsets[row] as usize;
        let end = self.offsets[row + 1] as usize;
        &self.varlen[start..end]
    }

    pub fn is_null(&self, row: usize, col: usize) -> bool {
        bit_util::get_bit(self.null_mask(row), col)
    }

    fn set_null(&mut self, row: usize, col: usize) {
        let width = self.metadata.null_mask_bytes;
        bit_util::set_bit(&mut self.null_masks[row * width..(row + 1) * width], col);
    }

    /// Fixed-section slot bytes of one column of one row.
    pub fn fixed_slot(&self, row: usize, col: usize) -> &[u8] {
        let start = row * self.metadata.fixed_row_width + self.metadata.col_offset(col);
        let width = RowTableMetadata::slot_width(self.metadata.col(col));
        &self.fixed[start..start + width]
    }

    /// Varlen payload bytes of one column of one row.
    pub fn varlen_value(&self, row: usize, col: usize) -> &[u8] {
        debug_assert!(!self.metadata.col(col).is_fixed_length);
        let record = self.varlen_row(row);
        let mut pos = 0;
        for c in 0..self.metadata.num_cols() {
            if self.metadata.col(c).is_fixed_length {
                continue;
            }
            pos = align(pos, self.metadata.string_alignment);
            let len =
                u32::from_le_bytes(self.fixed_slot(row, c).try_into().unwrap()) as usize;
            if c == col {
                return &record[pos..pos + len];
            }
            pos += len;
        }
        unreachable!("varlen_value past the last varlen column")
    }

    /// Byte-compare one row against a row of another table sharing the
    /// same metadata.
    pub fn rows_equal(&self, row: usize, other: &RowTable, other_row: usize) -> bool {
        self.null_mask(row) == other.null_mask(other_row)
            && self.fixed_row(row) == other.fixed_row(other_row)
            && self.varlen_row(row) == other.varlen_row(other_row)
    }

    /// Append the selected rows of `src`, in selection order.
    pub fn append_selection_from(&mut self, src: &RowTable, selection: &[u16]) -> Result<()> {
        let meta = Arc::clone(&self.metadata);
        self.fixed
            .try_reserve(selection.len() * meta.fixed_row_width)
            .map_err(oom)?;
        self.null_masks
            .try_reserve(selection.len() * meta.null_mask_bytes)
            .map_err(oom)?;
        for &sel in selection {
            let sel = sel as usize;
            self.fixed.extend_from_slice(src.fixed_row(sel));
            self.null_masks.extend_from_slice(src.null_mask(sel));
            if !meta.is_fixed_length {
                let record = src.varlen_row(sel);
                self.varlen.try_reserve(record.len()).map_err(oom)?;
                self.varlen.extend_from_slice(record);
                self.offsets.push(self.varlen.len() as u32);
            }
            self.num_rows += 1;
        }
        Ok(())
    }

    /// Encode a window of `count` rows starting at `start` into this
    /// (empty) table, one row per input row.
    pub fn encode_window(
        &mut self,
        cols: &[KeyColumn],
        start: usize,
        count: usize,
    ) -> Result<()> {
        debug_assert_eq!(self.num_rows, 0);
        debug_assert!(cols.iter().all(|c| start + count <= c.len));
        let meta = Arc::clone(&self.metadata);
        self.fixed
            .try_reserve(count * meta.fixed_row_width)
            .map_err(oom)?;
        self.fixed.resize(count * meta.fixed_row_width, 0);
        self.null_masks.resize(count * meta.null_mask_bytes, 0);
        self.num_rows = count;

        for (c, col) in cols.iter().enumerate() {
            let col_meta = meta.col(c);
            if col_meta.is_null_type {
                for row in 0..count {
                    self.set_null(row, c);
                }
            } else if !col_meta.is_fixed_length {
                for row in 0..count {
                    let len = if col.is_valid(start + row) {
                        col.varlen_bytes(start + row).len() as u32
                    } else {
                        self.set_null(row, c);
                        0
                    };
                    self.fixed_slot_mut(row, c).copy_from_slice(&len.to_le_bytes());
                }
            } else if col_meta.fixed_length == 0 {
                for row in 0..count {
                    if col.is_valid(start + row) {
                        self.fixed_slot_mut(row, c)[0] = col.bool_value(start + row) as u8;
                    } else {
                        self.set_null(row, c);
                    }
                }
            } else {
                for row in 0..count {
                    if col.is_valid(start + row) {
                        self.fixed_slot_mut(row, c)
                            .copy_from_slice(col.fixed_bytes(start + row));
                    } else {
                        self.set_null(row, c);
                    }
                }
            }
        }

        if !meta.is_fixed_length {
            let mut total = 0usize;
            for row in 0..count {
                total += self.record_len(row);
                self.offsets.push(total as u32);
            }
            self.varlen.try_reserve(total).map_err(oom)?;
            self.varlen.resize(total, 0);
            for (c, col) in cols.iter().enumerate() {
                if meta.col(c).is_fixed_length {
                    continue;
                }
                for row in 0..count {
                    if col.is_valid(start + row) {
                        let payload = col.varlen_bytes(start + row);
                        let record_start = self.offsets[row] as usize;
                        let pos = record_start + self.payload_offset(row, c);
                        self.varlen[pos..pos + payload.len()].copy_from_slice(payload);
                    }
                }
            }
        }
        Ok(())
    }

    fn fixed_slot_mut(&mut self, row: usize, col: usize) -> &mut [u8] {
        let start = row * self.metadata.fixed_row_width + self.metadata.col_offset(col);
        let width = RowTableMetadata::slot_width(self.metadata.col(col));
        &mut self.fixed[start..start + width]
    }

    /// Arena record length of one row, from the lengths already written
    /// into the fixed section.
    fn record_len(&self, row: usize) -> usize {
        let mut pos = 0;
        for c in 0..self.metadata.num_cols() {
            if self.metadata.col(c).is_fixed_length {
                continue;
            }
            pos = align(pos, self.metadata.string_alignment);
            pos += u32::from_le_bytes(self.fixed_slot(row, c).try_into().unwrap()) as usize;
        }
        align(pos, self.metadata.row_alignment)
    }

    /// Payload start of one varlen column within the row's arena record.
    fn payload_offset(&self, row: usize, col: usize) -> usize {
        let mut pos = 0;
        for c in 0..self.metadata.num_cols() {
            if self.metadata.col(c).is_fixed_length {
                continue;
            }
            pos = align(pos, self.metadata.string_alignment);
            if c == col {
                return pos;
            }
            pos += u32::from_le_bytes(self.fixed_slot(row, c).try_into().unwrap()) as usize;
        }
        unreachable!("payload_offset past the last varlen column")
    }
}
