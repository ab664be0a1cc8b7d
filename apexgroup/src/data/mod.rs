//! Key batch and key column data model
//!
//! Groupers and segmenters consume [`KeyBatch`]es: ordered tuples of Arrow
//! key columns sharing one row count. A column is either a full-length
//! array or a scalar carried as a length-1 array. Internally both paths
//! view columns through [`KeyColumn`], a raw-buffer view shaped by
//! [`KeyColumnMetadata`].

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, UInt32Array};
use arrow::buffer::{BooleanBuffer, Buffer, NullBuffer, OffsetBuffer};
use arrow::compute::take;
use arrow::datatypes::DataType;

use crate::{GroupError, Result};

/// Shape of one key column: fixed or variable length, byte width of the
/// fixed part, and whether the column is of the null type.
///
/// Booleans report `fixed_length == 0` (bit-packed in columns); dictionary
/// columns report their index width; variable-length columns report the
/// width of their offset slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyColumnMetadata {
    pub is_fixed_length: bool,
    pub fixed_length: u32,
    pub is_null_type: bool,
}

impl KeyColumnMetadata {
    pub fn from_data_type(data_type: &DataType) -> Result<Self> {
        match data_type {
            DataType::Null => Ok(Self {
                is_fixed_length: true,
                fixed_length: 0,
                is_null_type: true,
            }),
            DataType::Boolean => Ok(Self {
                is_fixed_length: true,
                fixed_length: 0,
                is_null_type: false,
            }),
            DataType::Dictionary(index_type, _) => {
                let width = index_type.primitive_width().ok_or_else(|| {
                    GroupError::NotImplemented(format!(
                        "dictionary index type {index_type}"
                    ))
                })?;
                Ok(Self {
                    is_fixed_length: true,
                    fixed_length: width as u32,
                    is_null_type: false,
                })
            }
            DataType::Utf8 | DataType::Binary => Ok(Self {
                is_fixed_length: false,
                fixed_length: 4,
                is_null_type: false,
            }),
            DataType::LargeUtf8 | DataType::LargeBinary => Ok(Self {
                is_fixed_length: false,
                fixed_length: 8,
                is_null_type: false,
            }),
            other => match other.primitive_width() {
                Some(width) => Ok(Self {
                    is_fixed_length: true,
                    fixed_length: width as u32,
                    is_null_type: false,
                }),
                None => Err(GroupError::NotImplemented(format!(
                    "keys of type {other}"
                ))),
            },
        }
    }

    /// True for `Utf8`/`Binary` with 64-bit offsets, which the fast path
    /// does not handle.
    pub fn is_large_varlen(&self) -> bool {
        !self.is_fixed_length && self.fixed_length == 8
    }
}

/// One key column of a batch.
///
/// A scalar is represented as a length-1 array; groupers broadcast it to
/// the batch length before processing, while the segmenter's single-key
/// fast path consumes it directly.
#[derive(Debug, Clone)]
pub enum KeyValue {
    Array(ArrayRef),
    Scalar(ArrayRef),
}

impl KeyValue {
    pub fn as_array(&self) -> &ArrayRef {
        match self {
            KeyValue::Array(a) | KeyValue::Scalar(a) => a,
        }
    }

    pub fn data_type(&self) -> &DataType {
        self.as_array().data_type()
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, KeyValue::Scalar(_))
    }
}

/// An ordered tuple of equal-length key columns plus a row count.
#[derive(Debug, Clone)]
pub struct KeyBatch {
    values: Vec<KeyValue>,
    len: usize,
}

impl KeyBatch {
    pub fn try_new(values: Vec<KeyValue>, len: usize) -> Result<Self> {
        for (i, value) in values.iter().enumerate() {
            match value {
                KeyValue::Array(a) if a.len() != len => {
                    return Err(GroupError::Invalid(format!(
                        "batch value {i} has length {}, expected {len}",
                        a.len()
                    )))
                }
                KeyValue::Scalar(a) if a.len() != 1 => {
                    return Err(GroupError::Invalid(format!(
                        "batch value {i} is a scalar of length {}",
                        a.len()
                    )))
                }
                _ => {}
            }
        }
        Ok(Self { values, len })
    }

    /// Batch from full-length arrays. The row count is taken from the
    /// first array; use [`KeyBatch::try_new`] for zero-column batches.
    pub fn from_arrays(arrays: Vec<ArrayRef>) -> Result<Self> {
        let len = arrays
            .first()
            .map(|a| a.len())
            .ok_or_else(|| GroupError::Invalid("empty array list".into()))?;
        Self::try_new(arrays.into_iter().map(KeyValue::Array).collect(), len)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    pub fn values(&self) -> &[KeyValue] {
        &self.values
    }

    pub fn data_types(&self) -> Vec<DataType> {
        self.values.iter().map(|v| v.data_type().clone()).collect()
    }

    /// Zero-copy slice; scalars stay scalars.
    pub fn slice(&self, offset: usize, length: usize) -> Self {
        let values = self
            .values
            .iter()
            .map(|v| match v {
                KeyValue::Array(a) => KeyValue::Array(a.slice(offset, length)),
                KeyValue::Scalar(a) => KeyValue::Scalar(Arc::clone(a)),
            })
            .collect();
        Self {
            values,
            len: length,
        }
    }
}

/// Verify that a batch matches the key schema it is consumed against.
pub(crate) fn check_batch(batch: &KeyBatch, key_types: &[DataType]) -> Result<()> {
    if batch.num_values() != key_types.len() {
        return Err(GroupError::Invalid(format!(
            "expected batch size {} but got {}",
            key_types.len(),
            batch.num_values()
        )));
    }
    for (i, (value, key_type)) in batch.values().iter().zip(key_types).enumerate() {
        if value.data_type() != key_type {
            return Err(GroupError::Invalid(format!(
                "expected batch value {i} of type {key_type} but got {}",
                value.data_type()
            )));
        }
    }
    Ok(())
}

/// Validate a grouper offset/length pair against the batch length.
/// A negative length means "to the end of the batch".
pub(crate) fn cap_offset_length(
    batch_len: usize,
    offset: i64,
    length: i64,
) -> Result<(usize, usize)> {
    if offset < 0 {
        return Err(GroupError::Invalid(format!(
            "invalid grouper consume offset: {offset}"
        )));
    }
    let offset = offset as usize;
    if offset > batch_len {
        return Err(GroupError::Invalid(format!(
            "grouper consume offset {offset} past batch length {batch_len}"
        )));
    }
    let length = if length < 0 {
        batch_len - offset
    } else {
        length as usize
    };
    if offset + length > batch_len {
        return Err(GroupError::Invalid(format!(
            "grouper consume window [{offset}, {}) past batch length {batch_len}",
            offset + length
        )));
    }
    Ok((offset, length))
}

/// Materialize every scalar column as a full-length array.
///
/// All scalars are expanded as soon as any is present; batches without
/// scalars are returned as-is.
pub(crate) fn materialize_scalars(batch: &KeyBatch) -> Result<KeyBatch> {
    if !batch.values().iter().any(KeyValue::is_scalar) {
        return Ok(batch.clone());
    }
    let indices = UInt32Array::from(vec![0u32; batch.len()]);
    let values = batch
        .values()
        .iter()
        .map(|v| match v {
            KeyValue::Array(a) => Ok(KeyValue::Array(Arc::clone(a))),
            KeyValue::Scalar(a) => {
                Ok(KeyValue::Array(take(a.as_ref(), &indices, None)?))
            }
        })
        .collect::<Result<Vec<_>>>()?;
    KeyBatch::try_new(values, batch.len())
}

/// Raw-buffer view over one key column, with the array offset applied.
#[derive(Debug)]
pub(crate) struct KeyColumn {
    pub metadata: KeyColumnMetadata,
    pub len: usize,
    nulls: Option<NullBuffer>,
    data: KeyColumnData,
}

#[derive(Debug)]
enum KeyColumnData {
    Null,
    Boolean(BooleanBuffer),
    Fixed { bytes: Buffer, byte_offset: usize },
    VarBin { offsets: OffsetBuffer<i32>, values: Buffer },
    LargeVarBin { offsets: OffsetBuffer<i64>, values: Buffer },
}

impl KeyColumn {
    pub fn try_new(array: &ArrayRef) -> Result<Self> {
        let metadata = KeyColumnMetadata::from_data_type(array.data_type())?;
        let len = array.len();
        let (nulls, data) = match array.data_type() {
            DataType::Null => (None, KeyColumnData::Null),
            DataType::Boolean => {
                let a = array.as_boolean();
                (a.nulls().cloned(), KeyColumnData::Boolean(a.values().clone()))
            }
            DataType::Dictionary(_, _) => {
                let keys = array.as_any_dictionary().keys();
                let data = keys.to_data();
                let width = metadata.fixed_length as usize;
                (
                    keys.nulls().cloned(),
                    KeyColumnData::Fixed {
                        byte_offset: data.offset() * width,
                        bytes: data.buffers()[0].clone(),
                    },
                )
            }
            DataType::Utf8 => {
                let a = array.as_string::<i32>();
                (
                    a.nulls().cloned(),
                    KeyColumnData::VarBin {
                        offsets: a.offsets().clone(),
                        values: a.values().clone(),
                    },
                )
            }
            DataType::Binary => {
                let a = array.as_binary::<i32>();
                (
                    a.nulls().cloned(),
                    KeyColumnData::VarBin {
                        offsets: a.offsets().clone(),
                        values: a.values().clone(),
                    },
                )
            }
            DataType::LargeUtf8 => {
                let a = array.as_string::<i64>();
                (
                    a.nulls().cloned(),
                    KeyColumnData::LargeVarBin {
                        offsets: a.offsets().clone(),
                        values: a.values().clone(),
                    },
                )
            }
            DataType::LargeBinary => {
                let a = array.as_binary::<i64>();
                (
                    a.nulls().cloned(),
                    KeyColumnData::LargeVarBin {
                        offsets: a.offsets().clone(),
                        values: a.values().clone(),
                    },
                )
            }
            _ => {
                let data = array.to_data();
                let width = metadata.fixed_length as usize;
                (
                    array.nulls().cloned(),
                    KeyColumnData::Fixed {
                        byte_offset: data.offset() * width,
                        bytes: data.buffers()[0].clone(),
                    },
                )
            }
        };
        Ok(Self {
            metadata,
            len,
            nulls,
            data,
        })
    }

    pub fn is_valid(&self, row: usize) -> bool {
        if self.metadata.is_null_type {
            return false;
        }
        self.nulls.as_ref().map(|n| n.is_valid(row)).unwrap_or(true)
    }

    /// Fixed-width value bytes of one row. Defined for fixed-width and
    /// dictionary columns with a non-zero byte width.
    pub fn fixed_bytes(&self, row: usize) -> &[u8] {
        let width = self.metadata.fixed_length as usize;
        match &self.data {
            KeyColumnData::Fixed { bytes, byte_offset } => {
                let start = byte_offset + row * width;
                &bytes.as_slice()[start..start + width]
            }
            _ => unreachable!("fixed_bytes on a non-fixed key column"),
        }
    }

    pub fn bool_value(&self, row: usize) -> bool {
        match &self.data {
            KeyColumnData::Boolean(values) => values.value(row),
            _ => unreachable!("bool_value on a non-boolean key column"),
        }
    }

    /// Payload bytes of one row of a variable-length column.
    pub fn varlen_bytes(&self, row: usize) -> &[u8] {
        match &self.data {
            KeyColumnData::VarBin { offsets, values } => {
                let start = offsets[row] as usize;
                let end = offsets[row + 1] as usize;
                &values.as_slice()[start..end]
            }
            KeyColumnData::LargeVarBin { offsets, values } => {
                let start = offsets[row] as usize;
                let end = offsets[row + 1] as usize;
                &values.as_slice()[start..end]
            }
            _ => unreachable!("varlen_bytes on a fixed-width key column"),
        }
    }
}
