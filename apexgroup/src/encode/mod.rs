//! Per-column key encoders for the portable group-by path
//!
//! Each encoder maps a slice of its column to a packed little-endian byte
//! field and back. A row's key is the concatenation of all column fields;
//! the portable grouper interns those byte strings. Encoders are
//! deterministic: bit-equal inputs produce bit-equal fields, with padding
//! and null payloads zero-filled.
//!
//! Field layouts:
//! - null type: 1 status byte (always 0)
//! - boolean: 1 byte packing `{valid, value}` bits
//! - fixed width W: 1 validity byte + W value bytes (zeroed when null)
//! - dictionary with index width W: 1 validity byte + W index bytes
//! - varlen binary: 1 validity byte + 4-byte length + payload

use std::sync::Arc;

use arrow::array::{
    make_array, new_null_array, Array, ArrayData, ArrayRef, AsArray, BooleanArray,
};
use arrow::buffer::{BooleanBuffer, Buffer, NullBuffer};
use arrow::datatypes::DataType;

use crate::data::KeyColumn;
use crate::{GroupError, Result};

const NULL_BYTE: u8 = 0;
const VALID_BYTE: u8 = 1;

#[derive(Debug)]
pub(crate) enum KeyEncoder {
    Null,
    Boolean,
    FixedWidth {
        data_type: DataType,
        width: usize,
    },
    Dictionary {
        data_type: DataType,
        width: usize,
        /// First dictionary seen; all later batches must match it.
        dictionary: Option<ArrayRef>,
    },
    VarBinary {
        data_type: DataType,
    },
    LargeVarBinary {
        data_type: DataType,
    },
}

impl KeyEncoder {
    pub fn try_new(data_type: &DataType) -> Result<Self> {
        match data_type {
            DataType::Boolean => Ok(Self::Boolean),
            DataType::Dictionary(index_type, _) => {
                let width = index_type.primitive_width().ok_or_else(|| {
                    GroupError::NotImplemented(format!(
                        "dictionary index type {index_type}"
                    ))
                })?;
                Ok(Self::Dictionary {
                    data_type: data_type.clone(),
                    width,
                    dictionary: None,
                })
            }
            DataType::Utf8 | DataType::Binary => Ok(Self::VarBinary {
                data_type: data_type.clone(),
            }),
            DataType::LargeUtf8 | DataType::LargeBinary => Ok(Self::LargeVarBinary {
                data_type: data_type.clone(),
            }),
            DataType::Null => Ok(Self::Null),
            other => match other.primitive_width() {
                Some(width) => Ok(Self::FixedWidth {
                    data_type: other.clone(),
                    width,
                }),
                None => Err(GroupError::NotImplemented(format!(
                    "keys of type {other}"
                ))),
            },
        }
    }

    /// Add this column's per-row encoded byte count to `lengths`.
    pub fn add_length(&self, col: &ArrayRef, lengths: &mut [i32]) -> Result<()> {
        match self {
            Self::Null | Self::Boolean => {
                for len in lengths.iter_mut() {
                    *len += 1;
                }
            }
            Self::FixedWidth { width, .. } | Self::Dictionary { width, .. } => {
                for len in lengths.iter_mut() {
                    *len += 1 + *width as i32;
                }
            }
            Self::VarBinary { .. } | Self::LargeVarBinary { .. } => {
                let view = KeyColumn::try_new(col)?;
                for (row, len) in lengths.iter_mut().enumerate() {
                    let payload = if view.is_valid(row) {
                        view.varlen_bytes(row).len()
                    } else {
                        0
                    };
                    *len += 1 + 4 + payload as i32;
                }
            }
        }
        Ok(())
    }

    /// Write each row's field at `positions[row]` and advance the cursor.
    pub fn encode(
        &mut self,
        col: &ArrayRef,
        bytes: &mut [u8],
        positions: &mut [usize],
    ) -> Result<()> {
        match self {
            Self::Null => {
                for pos in positions.iter_mut() {
                    bytes[*pos] = NULL_BYTE;
                    *pos += 1;
                }
            }
            Self::Boolean => {
                let view = KeyColumn::try_new(col)?;
                for (row, pos) in positions.iter_mut().enumerate() {
                    bytes[*pos] = if view.is_valid(row) {
                        VALID_BYTE | (view.bool_value(row) as u8) << 1
                    } else {
                        NULL_BYTE
                    };
                    *pos += 1;
                }
            }
            Self::FixedWidth { width, .. } => {
                let view = KeyColumn::try_new(col)?;
                encode_fixed(&view, *width, bytes, positions);
            }
            Self::Dictionary {
                width, dictionary, ..
            } => {
                let values = col.as_any_dictionary().values();
                match dictionary {
                    Some(first) => {
                        if first.to_data() != values.to_data() {
                            return Err(GroupError::NotImplemented(
                                "unifying differing dictionaries".into(),
                            ));
                        }
                    }
                    None => *dictionary = Some(Arc::clone(values)),
                }
                let view = KeyColumn::try_new(col)?;
                encode_fixed(&view, *width, bytes, positions);
            }
            Self::VarBinary { .. } | Self::LargeVarBinary { .. } => {
                let view = KeyColumn::try_new(col)?;
                for (row, pos) in positions.iter_mut().enumerate() {
                    if view.is_valid(row) {
                        let payload = view.varlen_bytes(row);
                        bytes[*pos] = VALID_BYTE;
                        bytes[*pos + 1..*pos + 5]
                            .copy_from_slice(&(payload.len() as u32).to_le_bytes());
                        bytes[*pos + 5..*pos + 5 + payload.len()]
                            .copy_from_slice(payload);
                        *pos += 5 + payload.len();
                    } else {
                        bytes[*pos] = NULL_BYTE;
                        bytes[*pos + 1..*pos + 5].copy_from_slice(&0u32.to_le_bytes());
                        *pos += 5;
                    }
                }
            }
        }
        Ok(())
    }

    /// Read `num_rows` fields starting at `positions` back into a column,
    /// advancing each cursor past the consumed field.
    pub fn decode(
        &self,
        bytes: &[u8],
        positions: &mut [usize],
        num_rows: usize,
    ) -> Result<ArrayRef> {
        debug_assert_eq!(positions.len(), num_rows);
        match self {
            Self::Null => {
                for pos in positions.iter_mut() {
                    *pos += 1;
                }
                Ok(new_null_array(&DataType::Null, num_rows))
            }
            Self::Boolean => {
                let mut valid = Vec::with_capacity(num_rows);
                let mut values = Vec::with_capacity(num_rows);
                for pos in positions.iter_mut() {
                    let b = bytes[*pos];
                    valid.push(b & 1 != 0);
                    values.push(b >> 1 != 0);
                    *pos += 1;
                }
                let values: BooleanBuffer = values.into_iter().collect();
                Ok(Arc::new(BooleanArray::new(
                    values,
                    Some(NullBuffer::from_iter(valid)),
                )))
            }
            Self::FixedWidth { data_type, width } => {
                let (valid, values) = decode_fixed(bytes, positions, *width);
                let data = ArrayData::builder(data_type.clone())
                    .len(num_rows)
                    .add_buffer(Buffer::from(values))
                    .nulls(Some(NullBuffer::from_iter(valid)))
                    .build()?;
                Ok(make_array(data))
            }
            Self::Dictionary {
                data_type,
                width,
                dictionary,
            } => {
                let (valid, indices) = decode_fixed(bytes, positions, *width);
                let values = match dictionary {
                    Some(d) => Arc::clone(d),
                    None => match data_type {
                        DataType::Dictionary(_, value_type) => {
                            new_null_array(value_type, 0)
                        }
                        _ => unreachable!("dictionary encoder with non-dictionary type"),
                    },
                };
                let data = ArrayData::builder(data_type.clone())
                    .len(num_rows)
                    .add_buffer(Buffer::from(indices))
                    .nulls(Some(NullBuffer::from_iter(valid)))
                    .add_child_data(values.to_data())
                    .build()?;
                Ok(make_array(data))
            }
            Self::VarBinary { data_type } => {
                let (valid, offsets, values) = decode_varlen::<i32>(bytes, positions);
                let data = ArrayData::builder(data_type.clone())
                    .len(num_rows)
                    .add_buffer(Buffer::from_vec(offsets))
                    .add_buffer(Buffer::from(values))
                    .nulls(Some(NullBuffer::from_iter(valid)))
                    .build()?;
                Ok(make_array(data))
            }
            Self::LargeVarBinary { data_type } => {
                let (valid, offsets, values) = decode_varlen::<i64>(bytes, positions);
                let data = ArrayData::builder(data_type.clone())
                    .len(num_rows)
                    .add_buffer(Buffer::from_vec(offsets))
                    .add_buffer(Buffer::from(values))
                    .nulls(Some(NullBuffer::from_iter(valid)))
                    .build()?;
                Ok(make_array(data))
            }
        }
    }
}

fn encode_fixed(view: &KeyColumn, width: usize, bytes: &mut [u8], positions: &mut [usize]) {
    for (row, pos) in positions.iter_mut().enumerate() {
        if view.is_valid(row) {
            bytes[*pos] = VALID_BYTE;
            bytes[*pos + 1..*pos + 1 + width].copy_from_slice(view.fixed_bytes(row));
        } else {
            bytes[*pos] = NULL_BYTE;
            bytes[*pos + 1..*pos + 1 + width].fill(0);
        }
        *pos += 1 + width;
    }
}

fn decode_fixed(bytes: &[u8], positions: &mut [usize], width: usize) -> (Vec<bool>, Vec<u8>) {
    let mut valid = Vec::with_capacity(positions.len());
    let mut values = Vec::with_capacity(positions.len() * width);
    for pos in positions.iter_mut() {
        valid.push(bytes[*pos] != NULL_BYTE);
        values.extend_from_slice(&bytes[*pos + 1..*pos + 1 + width]);
        *pos += 1 + width;
    }
    (valid, values)
}

fn decode_varlen<O: TryFrom<usize> + Default + Copy>(
    bytes: &[u8],
    positions: &mut [usize],
) -> (Vec<bool>, Vec<O>, Vec<u8>)
where
    <O as TryFrom<usize>>::Error: std::fmt::Debug,
{
    let mut valid = Vec::with_capacity(positions.len());
    let mut offsets = Vec::with_capacity(positions.len() + 1);
    let mut values = Vec::new();
    offsets.push(O::default());
    for pos in positions.iter_mut() {
        valid.push(bytes[*pos] != NULL_BYTE);
        let len = u32::from_le_bytes(bytes[*pos + 1..*pos + 5].try_into().unwrap()) as usize;
        values.extend_from_slice(&bytes[*pos + 5..*pos + 5 + len]);
        offsets.push(O::try_from(values.len()).unwrap());
        *pos += 5 + len;
    }
    (valid, offsets, values)
}
