//! Group-major index structures over assigned ids

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Int32Array, ListArray, UInt32Array};
use arrow::buffer::{OffsetBuffer, ScalarBuffer};
use arrow::compute::take;
use arrow::datatypes::{DataType, Field};

use crate::{GroupError, Result};

/// For each group, the row indices belonging to it in ascending order,
/// packed as a `List<Int32>` with one entry per group.
pub fn make_groupings(ids: &UInt32Array, num_groups: u32) -> Result<ListArray> {
    if ids.null_count() != 0 {
        return Err(GroupError::Invalid("make_groupings with null ids".into()));
    }
    let num_groups = num_groups as usize;
    let mut offsets = vec![0i32; num_groups + 1];
    for i in 0..ids.len() {
        let id = ids.value(i) as usize;
        if id >= num_groups {
            return Err(GroupError::Invalid(format!(
                "group id {id} out of range for {num_groups} groups"
            )));
        }
        offsets[id] += 1;
    }

    // Counts become starting offsets.
    let mut length = 0i32;
    for offset in offsets.iter_mut().take(num_groups) {
        let count = *offset;
        *offset = length;
        length += count;
    }
    offsets[num_groups] = length;
    debug_assert_eq!(ids.len(), length as usize);

    // Stable scatter of row indices into their group's range.
    let mut cursors = offsets.clone();
    let mut sort_indices = vec![0i32; ids.len()];
    for i in 0..ids.len() {
        let id = ids.value(i) as usize;
        sort_indices[cursors[id] as usize] = i as i32;
        cursors[id] += 1;
    }

    let field = Arc::new(Field::new("item", DataType::Int32, true));
    let values: ArrayRef = Arc::new(Int32Array::from(sort_indices));
    Ok(ListArray::try_new(
        field,
        OffsetBuffer::new(ScalarBuffer::from(offsets)),
        values,
        None,
    )?)
}

/// Permute `array` to group-major order under `groupings`, keeping the
/// per-group list boundaries.
pub fn apply_groupings(groupings: &ListArray, array: &ArrayRef) -> Result<ListArray> {
    let indices = groupings
        .values()
        .as_any()
        .downcast_ref::<Int32Array>()
        .ok_or_else(|| {
            GroupError::Invalid("groupings child is not an Int32 index array".into())
        })?;
    let sorted = take(array.as_ref(), indices, None)?;
    let field = Arc::new(Field::new("item", array.data_type().clone(), true));
    Ok(ListArray::try_new(
        field,
        groupings.offsets().clone(),
        sorted,
        groupings.nulls().cloned(),
    )?)
}
