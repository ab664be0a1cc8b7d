//! Portable grouper backed by a byte-string hash map
//!
//! Fallback for key schemas the vectorized path cannot take (big-endian
//! hosts, 64-bit varlen offsets, zero key columns). Each row is encoded
//! to one opaque byte string and interned in an `AHashMap`; the unique
//! key bytes are kept in a contiguous arena for `get_uniques`.

use ahash::AHashMap;
use arrow::array::UInt32Array;
use arrow::buffer::NullBuffer;
use arrow::datatypes::DataType;

use crate::data::{cap_offset_length, check_batch, materialize_scalars, KeyBatch, KeyValue};
use crate::encode::KeyEncoder;
use crate::group::GrouperMode;
use crate::{oom, Result};

pub struct GenericGrouper {
    key_types: Vec<DataType>,
    encoders: Vec<KeyEncoder>,
    map: AHashMap<Box<[u8]>, u32>,
    /// Arena offsets of the unique keys; `offsets[num_groups]` is the
    /// arena size.
    offsets: Vec<i32>,
    key_bytes: Vec<u8>,
    num_groups: u32,
}

impl GenericGrouper {
    pub fn try_new(key_types: &[DataType]) -> Result<Self> {
        let encoders = key_types
            .iter()
            .map(KeyEncoder::try_new)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            key_types: key_types.to_vec(),
            encoders,
            map: AHashMap::new(),
            offsets: vec![0],
            key_bytes: Vec::new(),
            num_groups: 0,
        })
    }

    pub fn key_types(&self) -> &[DataType] {
        &self.key_types
    }

    pub fn num_groups(&self) -> u32 {
        self.num_groups
    }

    pub fn reset(&mut self) -> Result<()> {
        self.map.clear();
        self.offsets.clear();
        self.offsets.push(0);
        self.key_bytes.clear();
        self.num_groups = 0;
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
        let num_rows = batch.len();

        // Per-row encoded lengths, prefix-summed into row offsets.
        let mut lengths = vec![0i32; num_rows];
        for (encoder, value) in self.encoders.iter().zip(batch.values()) {
            encoder.add_length(value.as_array(), &mut lengths)?;
        }
        let mut row_offsets = Vec::with_capacity(num_rows + 1);
        let mut total = 0i32;
        for len in &lengths {
            row_offsets.push(total);
            total += len;
        }
        row_offsets.push(total);

        let mut key_bytes = vec![0u8; total as usize];
        let mut positions: Vec<usize> =
            row_offsets[..num_rows].iter().map(|&o| o as usize).collect();
        for (encoder, value) in self.encoders.iter_mut().zip(batch.values()) {
            encoder.encode(value.as_array(), &mut key_bytes, &mut positions)?;
        }

        let row_key = |row: usize| {
            &key_bytes[row_offsets[row] as usize..row_offsets[row + 1] as usize]
        };

        match mode {
            GrouperMode::Populate => {
                for row in 0..num_rows {
                    self.intern(row_key(row))?;
                }
                Ok(None)
            }
            GrouperMode::Consume => {
                let mut ids = Vec::with_capacity(num_rows);
                for row in 0..num_rows {
                    ids.push(self.intern(row_key(row))?);
                }
                Ok(Some(UInt32Array::from(ids)))
            }
            GrouperMode::Lookup => {
                let mut ids = Vec::with_capacity(num_rows);
                let mut valid = Vec::with_capacity(num_rows);
                for row in 0..num_rows {
                    match self.map.get(row_key(row)) {
                        Some(&id) => {
                            ids.push(id);
                            valid.push(true);
                        }
                        None => {
                            ids.push(0);
                            valid.push(false);
                        }
                    }
                }
                Ok(Some(UInt32Array::new(
                    ids.into(),
                    Some(NullBuffer::from_iter(valid)),
                )))
            }
        }
    }

    /// Id of the key, inserting it if unseen.
    fn intern(&mut self, key: &[u8]) -> Result<u32> {
        if let Some(&id) = self.map.get(key) {
            return Ok(id);
        }
        let id = self.num_groups;
        self.num_groups += 1;
        self.key_bytes.try_reserve(key.len()).map_err(oom)?;
        self.key_bytes.extend_from_slice(key);
        self.offsets.push(self.key_bytes.len() as i32);
        self.map.insert(key.to_vec().into_boxed_slice(), id);
        Ok(id)
    }

    pub fn get_uniques(&self) -> Result<KeyBatch> {
        let num_groups = self.num_groups as usize;
        let mut positions: Vec<usize> = self.offsets[..num_groups]
            .iter()
            .map(|&o| o as usize)
            .collect();
        let mut values = Vec::with_capacity(self.encoders.len());
        for encoder in &self.encoders {
            values.push(KeyValue::Array(encoder.decode(
                &self.key_bytes,
                &mut positions,
                num_groups,
            )?));
        }
        KeyBatch::try_new(values, num_groups)
    }
}
