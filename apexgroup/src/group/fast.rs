//! Vectorized grouper: row table + hash table mini-batch pipeline
//!
//! Eligible when the host is little-endian and no key column uses 64-bit
//! varlen offsets. Each mini-batch is encoded into a scratch row table,
//! hashed, pushed through the hash table's early filter, resolved by
//! byte-comparing candidate rows against the main row table, and new keys
//! are appended with the next dense ids. The mini-batch size starts small
//! and doubles up to the configured maximum.

use std::hash::{BuildHasher, Hasher};
use std::sync::Arc;

use ahash::RandomState;
use arrow::array::{
    make_array, new_null_array, Array, ArrayData, ArrayRef, AsArray, BooleanArray,
    BooleanBufferBuilder, UInt32Array,
};
use arrow::buffer::{Buffer, NullBuffer};
use arrow::datatypes::DataType;
use arrow::util::bit_util;

use crate::data::{
    cap_offset_length, check_batch, materialize_scalars, KeyBatch, KeyColumn,
    KeyColumnMetadata, KeyValue,
};
use crate::hash::{bits_to_indexes, GroupHashTable, RowMapContext};
use crate::row::{RowTable, RowTableMetadata};
use crate::group::GrouperMode;
use crate::{ExecContext, GroupError, Result};

const ROW_ALIGNMENT: usize = 8;
const STRING_ALIGNMENT: usize = 8;

pub struct FastGrouper {
    key_types: Vec<DataType>,
    col_metadata: Vec<KeyColumnMetadata>,
    /// First dictionary observed per column, then frozen.
    dictionaries: Vec<Option<ArrayRef>>,
    /// Main store of one encoded row per group, indexed by group id.
    rows: RowTable,
    /// Scratch store for the current mini-batch.
    rows_minibatch: RowTable,
    map: GroupHashTable,
    random_state: RandomState,
    minibatch_size: usize,
    ctx: ExecContext,
}

/// Equality/append callbacks binding the hash table to the row tables.
struct RowProbe<'a> {
    scratch: &'a RowTable,
    rows: &'a mut RowTable,
}

impl RowMapContext for RowProbe<'_> {
    fn equal(&self, selection: &[u16], ids: &[u32], mismatch: &mut Vec<u16>) {
        for (k, &i) in selection.iter().enumerate() {
            if !self.rows.rows_equal(ids[k] as usize, self.scratch, i as usize) {
                mismatch.push(i);
            }
        }
    }

    fn append(&mut self, selection: &[u16]) -> Result<()> {
        self.rows.append_selection_from(self.scratch, selection)
    }
}

fn hash_row(random_state: &RandomState, table: &RowTable, row: usize) -> u32 {
    let mut hasher = random_state.build_hasher();
    hasher.write(table.null_mask(row));
    hasher.write(table.fixed_row(row));
    hasher.write(table.varlen_row(row));
    let hash = hasher.finish();
    hash as u32 ^ (hash >> 32) as u32
}

impl FastGrouper {
    /// The fast path requires a little-endian host, at least one key
    /// column, and no 64-bit varlen offsets.
    pub fn can_use(key_types: &[DataType]) -> bool {
        if key_types.is_empty() || cfg!(target_endian = "big") {
            return false;
        }
        key_types.iter().all(|t| {
            KeyColumnMetadata::from_data_type(t)
                .map(|m| !m.is_large_varlen())
                .unwrap_or(false)
        })
    }

    pub fn try_new(key_types: &[DataType], ctx: &ExecContext) -> Result<Self> {
        // Mini-batch row indices travel as u16 selection vectors.
        let mut ctx = ctx.clone();
        ctx.minibatch_size_max = ctx.minibatch_size_max.clamp(1, 1 << 16);
        ctx.minibatch_size_min = ctx.minibatch_size_min.clamp(1, ctx.minibatch_size_max);
        let col_metadata = key_types
            .iter()
            .map(KeyColumnMetadata::from_data_type)
            .collect::<Result<Vec<_>>>()?;
        let row_metadata = Arc::new(RowTableMetadata::new(
            col_metadata.clone(),
            ROW_ALIGNMENT,
            STRING_ALIGNMENT,
        ));
        Ok(Self {
            key_types: key_types.to_vec(),
            dictionaries: vec![None; key_types.len()],
            col_metadata,
            rows: RowTable::new(Arc::clone(&row_metadata)),
            rows_minibatch: RowTable::new(row_metadata),
            map: GroupHashTable::new(),
            random_state: RandomState::new(),
            minibatch_size: ctx.minibatch_size_min,
            ctx,
        })
    }

    pub fn key_types(&self) -> &[DataType] {
        &self.key_types
    }

    pub fn num_groups(&self) -> u32 {
        self.rows.len() as u32
    }

    /// Forget all groups. Dictionaries stay frozen to the first batch.
    pub fn reset(&mut self) -> Result<()> {
        self.rows.clean();
        self.rows_minibatch.clean();
        self.map.clean();
        Ok(())
    }

    /// Freeze the first observed dictionary per column; every later batch
    /// must carry an equal one.
    fn process_dictionaries(&mut self, batch: &KeyBatch) -> Result<()> {
        for (col, value) in batch.values().iter().enumerate() {
            if !matches!(self.key_types[col], DataType::Dictionary(_, _)) {
                continue;
            }
            let values = value.as_array().as_any_dictionary().values();
            match &self.dictionaries[col] {
                Some(first) => {
                    if first.to_data() != values.to_data() {
                        return Err(GroupError::NotImplemented(
                            "unifying differing dictionaries".into(),
                        ));
                    }
                }
                None => self.dictionaries[col] = Some(Arc::clone(values)),
            }
        }
        Ok(())
    }

    pub(crate) fn consume_impl(
        &mut self,
        batch: &KeyBatch,
        offset: i64,
        length: i64,
        mode: GrouperMode,
    ) -> Result<Option<UInt32Array>> {
        check_batch(batch, &self.key_types)?;
        let (offset, length) = cap_offset_length(batch.len(), offset, length)?;
        let batch = if offset != 0 || length != batch.len() {
            batch.slice(offset, length)
        } else {
            batch.clone()
        };
        let batch = materialize_scalars(&batch)?;
        self.process_dictionaries(&batch)?;

        let cols = batch
            .values()
            .iter()
            .map(|v| KeyColumn::try_new(v.as_array()))
            .collect::<Result<Vec<_>>>()?;
        let num_rows = batch.len();

        // Populate reuses one mini-batch-sized id buffer; the other modes
        // return ids for every row.
        let mut ids = vec![
            0u32;
            if mode == GrouperMode::Populate {
                self.ctx.minibatch_size_max.min(num_rows)
            } else {
                num_rows
            }
        ];
        let mut validity = BooleanBufferBuilder::new(num_rows);

        let mut hashes: Vec<u32> = Vec::with_capacity(self.ctx.minibatch_size_max);
        let mut match_bits: Vec<u8> =
            vec![0; bit_util::ceil(self.ctx.minibatch_size_max, 8)];
        let mut hints: Vec<u32> = vec![0; self.ctx.minibatch_size_max];
        let mut unmatched: Vec<u16> = Vec::with_capacity(self.ctx.minibatch_size_max);

        let mut start_row = 0;
        while start_row < num_rows {
            let batch_size_next = self.minibatch_size.min(num_rows - start_row);

            // Encode the window into the scratch row table and hash it.
            self.rows_minibatch.clean();
            self.rows_minibatch
                .encode_window(&cols, start_row, batch_size_next)?;
            hashes.clear();
            for row in 0..batch_size_next {
                hashes.push(hash_row(&self.random_state, &self.rows_minibatch, row));
            }

            let batch_ids = if mode == GrouperMode::Populate {
                &mut ids[..batch_size_next]
            } else {
                &mut ids[start_row..start_row + batch_size_next]
            };
            if mode == GrouperMode::Lookup {
                batch_ids.fill(0);
            }

            let mut probe = RowProbe {
                scratch: &self.rows_minibatch,
                rows: &mut self.rows,
            };
            self.map.early_filter(
                &hashes[..batch_size_next],
                &mut match_bits,
                &mut hints,
            );
            self.map.find(
                &hashes[..batch_size_next],
                &mut match_bits,
                &mut hints,
                batch_ids,
                &probe,
            );

            if mode == GrouperMode::Lookup {
                validity.append_packed_range(0..batch_size_next, &match_bits);
            } else {
                bits_to_indexes(false, &match_bits, batch_size_next, &mut unmatched);
                if !unmatched.is_empty() {
                    self.map.map_new_keys(
                        &unmatched,
                        &hashes[..batch_size_next],
                        batch_ids,
                        &mut probe,
                    )?;
                }
            }

            start_row += batch_size_next;
            self.minibatch_size =
                self.ctx.minibatch_size_max.min(2 * self.minibatch_size);
        }
        debug_assert_eq!(self.rows.len(), self.map.len());

        match mode {
            GrouperMode::Populate => Ok(None),
            GrouperMode::Consume => Ok(Some(UInt32Array::from(ids))),
            GrouperMode::Lookup => Ok(Some(UInt32Array::new(
                ids.into(),
                Some(NullBuffer::new(validity.finish())),
            ))),
        }
    }

    /// Decode the row table back into one column per key, in group-id
    /// order. Fixed-length buffers are decoded in mini-batches; varlen
    /// payload buffers are sized from the terminal offset and decoded in
    /// a second pass. Null-type columns short-circuit to a null array and
    /// dictionary columns re-attach the frozen dictionary.
    pub fn get_uniques(&mut self) -> Result<KeyBatch> {
        let num_groups = self.rows.len();
        let step = self.ctx.minibatch_size_max;
        let mut values = Vec::with_capacity(self.col_metadata.len());

        for col in 0..self.col_metadata.len() {
            let meta = self.col_metadata[col];
            if meta.is_null_type {
                values.push(KeyValue::Array(new_null_array(&DataType::Null, num_groups)));
                continue;
            }

            let mut valid: Vec<bool> = Vec::with_capacity(num_groups);
            let array: ArrayRef = if meta.is_fixed_length && meta.fixed_length == 0 {
                // Boolean: one byte per row in the fixed section.
                let mut bits = BooleanBufferBuilder::new(num_groups);
                let mut start = 0;
                while start < num_groups {
                    let end = (start + step).min(num_groups);
                    for row in start..end {
                        valid.push(!self.rows.is_null(row, col));
                        bits.append(self.rows.fixed_slot(row, col)[0] != 0);
                    }
                    start = end;
                }
                Arc::new(BooleanArray::new(
                    bits.finish(),
                    Some(NullBuffer::from_iter(valid)),
                ))
            } else if meta.is_fixed_length {
                let width = meta.fixed_length as usize;
                let mut bytes: Vec<u8> = Vec::with_capacity(num_groups * width);
                let mut start = 0;
                while start < num_groups {
                    let end = (start + step).min(num_groups);
                    for row in start..end {
                        valid.push(!self.rows.is_null(row, col));
                        bytes.extend_from_slice(self.rows.fixed_slot(row, col));
                    }
                    start = end;
                }
                let nulls = NullBuffer::from_iter(valid);
                match &self.key_types[col] {
                    DataType::Dictionary(_, value_type) => {
                        let dictionary = match &self.dictionaries[col] {
                            Some(d) => Arc::clone(d),
                            None => new_null_array(value_type, 0),
                        };
                        let data = ArrayData::builder(self.key_types[col].clone())
                            .len(num_groups)
                            .add_buffer(Buffer::from(bytes))
                            .nulls(Some(nulls))
                            .add_child_data(dictionary.to_data())
                            .build()?;
                        make_array(data)
                    }
                    data_type => {
                        let data = ArrayData::builder(data_type.clone())
                            .len(num_groups)
                            .add_buffer(Buffer::from(bytes))
                            .nulls(Some(nulls))
                            .build()?;
                        make_array(data)
                    }
                }
            } else {
                // Varlen: lengths from the fixed slots size the payload
                // buffer, then a second pass copies the payloads.
                let mut offsets: Vec<i32> = Vec::with_capacity(num_groups + 1);
                offsets.push(0);
                let mut start = 0;
                while start < num_groups {
                    let end = (start + step).min(num_groups);
                    for row in start..end {
                        valid.push(!self.rows.is_null(row, col));
                        let len = u32::from_le_bytes(
                            self.rows.fixed_slot(row, col).try_into().unwrap(),
                        );
                        offsets.push(offsets[row] + len as i32);
                    }
                    start = end;
                }
                let total = *offsets.last().unwrap() as usize;
                let mut payload: Vec<u8> = Vec::with_capacity(total);
                let mut start = 0;
                while start < num_groups {
                    let end = (start + step).min(num_groups);
                    for row in start..end {
                        payload.extend_from_slice(self.rows.varlen_value(row, col));
                    }
                    start = end;
                }
                let data = ArrayData::builder(self.key_types[col].clone())
                    .len(num_groups)
                    .add_buffer(Buffer::from_vec(offsets))
                    .add_buffer(Buffer::from(payload))
                    .nulls(Some(NullBuffer::from_iter(valid)))
                    .build()?;
                make_array(data)
            };
            values.push(KeyValue::Array(array));
        }

        KeyBatch::try_new(values, num_groups)
    }
}
