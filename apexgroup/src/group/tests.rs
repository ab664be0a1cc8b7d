//! Scenario and property coverage for the grouper paths

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, AsArray, BooleanArray, DictionaryArray, Int32Array, Int64Array,
    LargeStringArray, StringArray, UInt32Array,
};
use arrow::compute::take;
use arrow::datatypes::{DataType, Int8Type};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{FastGrouper, GenericGrouper, Grouper, GrouperMode};
use crate::data::{KeyBatch, KeyValue};
use crate::{ExecContext, GroupError};

fn ctx() -> ExecContext {
    ExecContext::default()
}

fn ids_vec(ids: &UInt32Array) -> Vec<u32> {
    ids.values().as_ref().to_vec()
}

fn int32_batch(values: Vec<Option<i32>>) -> KeyBatch {
    let a: ArrayRef = Arc::new(Int32Array::from(values));
    KeyBatch::from_arrays(vec![a]).unwrap()
}

#[test]
fn test_consume_single_int_key() {
    let mut grouper = Grouper::try_new(&[DataType::Int32], &ctx()).unwrap();
    assert!(matches!(grouper, Grouper::Fast(_)));

    let batch = int32_batch(vec![Some(5), Some(5), Some(7), Some(5)]);
    let ids = grouper.consume(&batch, 0, -1).unwrap();
    assert_eq!(ids_vec(&ids), vec![0, 0, 1, 0]);
    assert_eq!(grouper.num_groups(), 2);

    let uniques = grouper.get_uniques().unwrap();
    assert_eq!(uniques.len(), 2);
    let col = uniques.values()[0].as_array().as_primitive::<arrow::datatypes::Int32Type>();
    assert_eq!(col.values().as_ref(), &[5, 7]);
    assert_eq!(col.null_count(), 0);
}

#[test]
fn test_consume_string_int_keys() {
    let mut grouper =
        Grouper::try_new(&[DataType::Utf8, DataType::Int32], &ctx()).unwrap();

    let s: ArrayRef = Arc::new(StringArray::from(vec!["a", "a", "b", "a"]));
    let n: ArrayRef = Arc::new(Int32Array::from(vec![1, 1, 1, 2]));
    let batch = KeyBatch::from_arrays(vec![s, n]).unwrap();
    let ids = grouper.consume(&batch, 0, -1).unwrap();
    assert_eq!(ids_vec(&ids), vec![0, 0, 1, 2]);

    let uniques = grouper.get_uniques().unwrap();
    let s = uniques.values()[0].as_array().as_string::<i32>();
    let n = uniques.values()[1]
        .as_array()
        .as_primitive::<arrow::datatypes::Int32Type>();
    let keys: Vec<(&str, i32)> =
        (0..3).map(|i| (s.value(i), n.value(i))).collect();
    assert_eq!(keys, vec![("a", 1), ("b", 1), ("a", 2)]);
}

#[test]
fn test_nulls_group_together() {
    let mut grouper = Grouper::try_new(&[DataType::Int32], &ctx()).unwrap();
    let batch = int32_batch(vec![None, Some(3), None, Some(3)]);
    let ids = grouper.consume(&batch, 0, -1).unwrap();
    assert_eq!(ids_vec(&ids), vec![0, 1, 0, 1]);
    assert_eq!(grouper.num_groups(), 2);

    let uniques = grouper.get_uniques().unwrap();
    let col = uniques.values()[0].as_array();
    assert!(col.is_null(0));
    assert!(col.is_valid(1));
}

#[test]
fn test_lookup() {
    let mut grouper = Grouper::try_new(&[DataType::Int32], &ctx()).unwrap();
    grouper
        .consume(&int32_batch(vec![Some(5), Some(5), Some(7), Some(5)]), 0, -1)
        .unwrap();

    let ids = grouper
        .lookup(&int32_batch(vec![Some(7), Some(9), Some(5)]), 0, -1)
        .unwrap();
    assert!(ids.is_valid(0));
    assert_eq!(ids.value(0), 1);
    assert!(ids.is_null(1));
    assert!(ids.is_valid(2));
    assert_eq!(ids.value(2), 0);

    // Lookup never inserts.
    assert_eq!(grouper.num_groups(), 2);
}

#[test]
fn test_populate_then_lookup() {
    let mut grouper = Grouper::try_new(&[DataType::Int32], &ctx()).unwrap();
    grouper
        .populate(&int32_batch(vec![Some(1), Some(2)]), 0, -1)
        .unwrap();
    assert_eq!(grouper.num_groups(), 2);

    let ids = grouper
        .lookup(&int32_batch(vec![Some(2), Some(3)]), 0, -1)
        .unwrap();
    assert!(ids.is_valid(0));
    assert!(ids.is_null(1));
}

#[test]
fn test_ids_dense_in_first_appearance_order_across_batches() {
    let mut grouper = Grouper::try_new(&[DataType::Int32], &ctx()).unwrap();
    let ids = grouper
        .consume(&int32_batch(vec![Some(10), Some(20)]), 0, -1)
        .unwrap();
    assert_eq!(ids_vec(&ids), vec![0, 1]);
    let ids = grouper
        .consume(&int32_batch(vec![Some(30), Some(10), Some(40)]), 0, -1)
        .unwrap();
    assert_eq!(ids_vec(&ids), vec![2, 0, 3]);
    assert_eq!(grouper.num_groups(), 4);
}

#[test]
fn test_round_trip_uniques_at_ids() {
    let mut grouper =
        Grouper::try_new(&[DataType::Utf8, DataType::Int64], &ctx()).unwrap();
    let s: ArrayRef = Arc::new(StringArray::from(vec![
        Some("x"),
        None,
        Some("y"),
        Some("x"),
        None,
    ]));
    let n: ArrayRef = Arc::new(Int64Array::from(vec![1, 2, 1, 1, 2]));
    let batch = KeyBatch::from_arrays(vec![Arc::clone(&s), Arc::clone(&n)]).unwrap();

    let ids = grouper.consume(&batch, 0, -1).unwrap();
    let uniques = grouper.get_uniques().unwrap();
    assert_eq!(uniques.len() as u32, grouper.num_groups());

    // Taking the uniques at the assigned ids reproduces the key columns.
    let restored_s = take(uniques.values()[0].as_array(), &ids, None).unwrap();
    let restored_n = take(uniques.values()[1].as_array(), &ids, None).unwrap();
    assert_eq!(restored_s.as_ref(), s.as_ref());
    assert_eq!(restored_n.as_ref(), n.as_ref());
}

#[test]
fn test_reset() {
    let mut grouper = Grouper::try_new(&[DataType::Int32], &ctx()).unwrap();
    grouper
        .consume(&int32_batch(vec![Some(1), Some(2)]), 0, -1)
        .unwrap();
    assert_eq!(grouper.num_groups(), 2);

    grouper.reset().unwrap();
    assert_eq!(grouper.num_groups(), 0);
    assert_eq!(grouper.get_uniques().unwrap().len(), 0);

    let ids = grouper
        .consume(&int32_batch(vec![Some(2), Some(2), Some(9)]), 0, -1)
        .unwrap();
    assert_eq!(ids_vec(&ids), vec![0, 0, 1]);
}

#[test]
fn test_offset_and_length_windows() {
    let mut grouper = Grouper::try_new(&[DataType::Int32], &ctx()).unwrap();
    let batch = int32_batch(vec![Some(1), Some(2), Some(3), Some(2)]);

    let ids = grouper.consume(&batch, 2, -1).unwrap();
    assert_eq!(ids_vec(&ids), vec![0, 1]); // rows 3, 2

    let ids = grouper.consume(&batch, 0, 2).unwrap();
    assert_eq!(ids_vec(&ids), vec![2, 1]); // 1 is new, 2 was seen

    assert!(matches!(
        grouper.consume(&batch, -1, 2),
        Err(GroupError::Invalid(_))
    ));
    assert!(matches!(
        grouper.consume(&batch, 2, 3),
        Err(GroupError::Invalid(_))
    ));
}

#[test]
fn test_schema_mismatch() {
    let mut grouper = Grouper::try_new(&[DataType::Int32], &ctx()).unwrap();
    let wrong_type: ArrayRef = Arc::new(Int64Array::from(vec![1]));
    let batch = KeyBatch::from_arrays(vec![wrong_type]).unwrap();
    assert!(matches!(
        grouper.consume(&batch, 0, -1),
        Err(GroupError::Invalid(_))
    ));

    let a: ArrayRef = Arc::new(Int32Array::from(vec![1]));
    let b: ArrayRef = Arc::new(Int32Array::from(vec![1]));
    let batch = KeyBatch::from_arrays(vec![a, b]).unwrap();
    assert!(matches!(
        grouper.consume(&batch, 0, -1),
        Err(GroupError::Invalid(_))
    ));
}

#[test]
fn test_empty_batch() {
    let mut grouper = Grouper::try_new(&[DataType::Int32], &ctx()).unwrap();
    let batch = int32_batch(vec![]);
    let ids = grouper.consume(&batch, 0, -1).unwrap();
    assert_eq!(ids.len(), 0);
    assert_eq!(grouper.num_groups(), 0);
    assert_eq!(grouper.get_uniques().unwrap().len(), 0);
}

#[test]
fn test_boolean_and_null_type_keys() {
    let mut grouper =
        Grouper::try_new(&[DataType::Boolean, DataType::Null], &ctx()).unwrap();
    let b: ArrayRef = Arc::new(BooleanArray::from(vec![
        Some(true),
        Some(false),
        None,
        Some(true),
    ]));
    let n: ArrayRef = arrow::array::new_null_array(&DataType::Null, 4);
    let batch = KeyBatch::from_arrays(vec![b, n]).unwrap();
    let ids = grouper.consume(&batch, 0, -1).unwrap();
    assert_eq!(ids_vec(&ids), vec![0, 1, 2, 0]);

    let uniques = grouper.get_uniques().unwrap();
    assert_eq!(uniques.len(), 3);
    assert_eq!(uniques.values()[1].as_array().data_type(), &DataType::Null);
    assert_eq!(uniques.values()[1].as_array().null_count(), 3);
}

#[test]
fn test_scalar_broadcast() {
    let mut grouper =
        Grouper::try_new(&[DataType::Int32, DataType::Utf8], &ctx()).unwrap();
    let n: ArrayRef = Arc::new(Int32Array::from(vec![1, 2, 1]));
    let s: ArrayRef = Arc::new(StringArray::from(vec!["k"]));
    let batch =
        KeyBatch::try_new(vec![KeyValue::Array(n), KeyValue::Scalar(s)], 3).unwrap();
    let ids = grouper.consume(&batch, 0, -1).unwrap();
    assert_eq!(ids_vec(&ids), vec![0, 1, 0]);

    let uniques = grouper.get_uniques().unwrap();
    let s = uniques.values()[1].as_array().as_string::<i32>();
    assert_eq!(s.value(0), "k");
    assert_eq!(s.value(1), "k");
}

#[test]
fn test_duplicates_within_one_minibatch() {
    // A mini-batch size of 8 forces all rows through one map_new_keys
    // call; the second occurrence of each unseen key must reuse the id
    // the first occurrence just received.
    let mut grouper =
        Grouper::try_new(&[DataType::Int32], &ExecContext::with_minibatch_size(8))
            .unwrap();
    let batch = int32_batch(
        vec![7, 7, 8, 9, 8, 7, 10, 9].into_iter().map(Some).collect(),
    );
    let ids = grouper.consume(&batch, 0, -1).unwrap();
    assert_eq!(ids_vec(&ids), vec![0, 0, 1, 2, 1, 0, 3, 2]);
    assert_eq!(grouper.num_groups(), 4);
}

#[test]
fn test_multi_minibatch_consume() {
    // Far more rows than the mini-batch maximum, with keys recurring
    // across mini-batch boundaries.
    let mut grouper =
        Grouper::try_new(&[DataType::Int64], &ExecContext::with_minibatch_size(16))
            .unwrap();
    let keys: Vec<Option<i64>> = (0..5000).map(|i| Some(i % 37)).collect();
    let a: ArrayRef = Arc::new(Int64Array::from(keys.clone()));
    let batch = KeyBatch::from_arrays(vec![a]).unwrap();
    let ids = grouper.consume(&batch, 0, -1).unwrap();

    assert_eq!(grouper.num_groups(), 37);
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(ids.value(i) as i64, key.unwrap());
    }

    let uniques = grouper.get_uniques().unwrap();
    let col = uniques.values()[0]
        .as_array()
        .as_primitive::<arrow::datatypes::Int64Type>();
    let expected: Vec<i64> = (0..37).collect();
    assert_eq!(col.values().as_ref(), expected.as_slice());
}

#[test]
fn test_dictionary_keys_frozen_across_batches() {
    let dict: DictionaryArray<Int8Type> =
        vec![Some("red"), Some("blue"), None, Some("red")].into_iter().collect();
    let key_type = dict.data_type().clone();
    let first: ArrayRef = Arc::new(dict);

    let mut grouper = Grouper::try_new(&[key_type.clone()], &ctx()).unwrap();
    assert!(matches!(grouper, Grouper::Fast(_)));
    let batch = KeyBatch::from_arrays(vec![Arc::clone(&first)]).unwrap();
    let ids = grouper.consume(&batch, 0, -1).unwrap();
    assert_eq!(ids_vec(&ids), vec![0, 1, 2, 0]);

    // The same dictionary in a later batch is accepted.
    let ids = grouper.consume(&batch, 0, -1).unwrap();
    assert_eq!(ids_vec(&ids), vec![0, 1, 2, 0]);

    // A differing dictionary is rejected.
    let other: DictionaryArray<Int8Type> =
        vec![Some("red"), Some("green")].into_iter().collect();
    let other: ArrayRef = Arc::new(other);
    let batch = KeyBatch::from_arrays(vec![other]).unwrap();
    assert!(matches!(
        grouper.consume(&batch, 0, -1),
        Err(GroupError::NotImplemented(_))
    ));

    // Uniques re-attach the frozen dictionary.
    let uniques = grouper.get_uniques().unwrap();
    let col = uniques.values()[0].as_array();
    assert_eq!(col.data_type(), &key_type);
    let col = col.as_any_dictionary();
    let values = col.values().as_string::<i32>();
    assert_eq!(values.value(0), "red");
    assert_eq!(values.value(1), "blue");
}

#[test]
fn test_dictionary_retained_after_reset() {
    let dict: DictionaryArray<Int8Type> =
        vec![Some("red"), Some("blue")].into_iter().collect();
    let key_type = dict.data_type().clone();
    let first: ArrayRef = Arc::new(dict);
    let mut grouper = Grouper::try_new(&[key_type], &ctx()).unwrap();
    let batch = KeyBatch::from_arrays(vec![first]).unwrap();
    grouper.consume(&batch, 0, -1).unwrap();
    grouper.reset().unwrap();

    // Still frozen to the first dictionary after reset.
    let other: DictionaryArray<Int8Type> =
        vec![Some("green")].into_iter().collect();
    let other: ArrayRef = Arc::new(other);
    let batch = KeyBatch::from_arrays(vec![other]).unwrap();
    assert!(matches!(
        grouper.consume(&batch, 0, -1),
        Err(GroupError::NotImplemented(_))
    ));
}

#[test]
fn test_large_utf8_takes_generic_path() {
    assert!(!FastGrouper::can_use(&[DataType::LargeUtf8]));
    let mut grouper = Grouper::try_new(&[DataType::LargeUtf8], &ctx()).unwrap();
    assert!(matches!(grouper, Grouper::Generic(_)));

    let a: ArrayRef = Arc::new(LargeStringArray::from(vec![
        Some("aa"),
        None,
        Some("aa"),
        Some("b"),
    ]));
    let batch = KeyBatch::from_arrays(vec![a]).unwrap();
    let ids = grouper.consume(&batch, 0, -1).unwrap();
    assert_eq!(ids_vec(&ids), vec![0, 1, 0, 2]);

    let uniques = grouper.get_uniques().unwrap();
    let col = uniques.values()[0].as_array().as_string::<i64>();
    assert_eq!(col.value(0), "aa");
    assert!(col.is_null(1));
    assert_eq!(col.value(2), "b");
}

#[test]
fn test_zero_key_columns_generic() {
    assert!(!FastGrouper::can_use(&[]));
    let mut grouper = Grouper::try_new(&[], &ctx()).unwrap();
    let batch = KeyBatch::try_new(vec![], 3).unwrap();
    let ids = grouper.consume(&batch, 0, -1).unwrap();
    assert_eq!(ids_vec(&ids), vec![0, 0, 0]);
    assert_eq!(grouper.num_groups(), 1);
}

#[test]
fn test_unsupported_key_type() {
    let list = DataType::List(Arc::new(arrow::datatypes::Field::new(
        "item",
        DataType::Int32,
        true,
    )));
    assert!(matches!(
        Grouper::try_new(&[list], &ctx()),
        Err(GroupError::NotImplemented(_))
    ));
}

/// Reference model: first-appearance interning of the key tuples.
fn model_ids(keys: &[(Option<i64>, Option<String>)]) -> (Vec<u32>, u32) {
    let mut map: HashMap<(Option<i64>, Option<String>), u32> = HashMap::new();
    let mut ids = Vec::with_capacity(keys.len());
    for key in keys {
        let next = map.len() as u32;
        let id = *map.entry(key.clone()).or_insert(next);
        ids.push(id);
    }
    (ids, map.len() as u32)
}

fn random_keys(rng: &mut StdRng, len: usize) -> Vec<(Option<i64>, Option<String>)> {
    (0..len)
        .map(|_| {
            let n = if rng.gen_bool(0.1) {
                None
            } else {
                Some(rng.gen_range(0..25i64))
            };
            let s = if rng.gen_bool(0.1) {
                None
            } else {
                let len = rng.gen_range(0..6);
                Some(
                    (0..len)
                        .map(|_| (b'a' + rng.gen_range(0..4u8)) as char)
                        .collect(),
                )
            };
            (n, s)
        })
        .collect()
}

fn keys_to_batch(keys: &[(Option<i64>, Option<String>)]) -> KeyBatch {
    let n: ArrayRef = Arc::new(Int64Array::from(
        keys.iter().map(|k| k.0).collect::<Vec<_>>(),
    ));
    let s: ArrayRef = Arc::new(StringArray::from(
        keys.iter().map(|k| k.1.clone()).collect::<Vec<_>>(),
    ));
    KeyBatch::from_arrays(vec![n, s]).unwrap()
}

#[test]
fn test_fast_path_agrees_with_model_and_generic() {
    let mut rng = StdRng::seed_from_u64(42);
    let key_types = [DataType::Int64, DataType::Utf8];

    for round in 0..5 {
        let mut fast = FastGrouper::try_new(
            &key_types,
            &ExecContext::with_minibatch_size(1usize << (round + 3)),
        )
        .unwrap();
        let mut generic = GenericGrouper::try_new(&key_types).unwrap();

        let mut all_keys = Vec::new();
        for _ in 0..3 {
            let keys = random_keys(&mut rng, 700);
            let batch = keys_to_batch(&keys);
            all_keys.extend(keys);

            let fast_ids = fast
                .consume_impl(&batch, 0, -1, GrouperMode::Consume)
                .unwrap()
                .unwrap();
            let generic_ids = generic
                .consume_impl(&batch, 0, -1, GrouperMode::Consume)
                .unwrap()
                .unwrap();
            assert_eq!(ids_vec(&fast_ids), ids_vec(&generic_ids));
        }

        let (expected_ids, expected_groups) = model_ids(&all_keys);
        assert_eq!(fast.num_groups(), expected_groups);
        assert_eq!(generic.num_groups(), expected_groups);

        // Tail of the model ids corresponds to the last consumed batch;
        // spot-check full agreement by re-consuming everything at once.
        let batch = keys_to_batch(&all_keys);
        let fast_ids = fast
            .consume_impl(&batch, 0, -1, GrouperMode::Consume)
            .unwrap()
            .unwrap();
        assert_eq!(ids_vec(&fast_ids), expected_ids);

        // Uniques agree column-wise between the two paths.
        let fast_uniques = fast.get_uniques().unwrap();
        let generic_uniques = generic.get_uniques().unwrap();
        assert_eq!(fast_uniques.len(), generic_uniques.len());
        for (f, g) in fast_uniques.values().iter().zip(generic_uniques.values()) {
            assert_eq!(f.as_array().as_ref(), g.as_array().as_ref());
        }
    }
}

#[test]
fn test_lookup_matches_consumed_exactly() {
    let mut rng = StdRng::seed_from_u64(7);
    let key_types = [DataType::Int64, DataType::Utf8];
    let mut grouper = Grouper::try_new(&key_types, &ctx()).unwrap();

    let consumed = random_keys(&mut rng, 400);
    grouper.consume(&keys_to_batch(&consumed), 0, -1).unwrap();
    let (consumed_ids, _) = model_ids(&consumed);
    let known: HashMap<_, _> = consumed
        .iter()
        .cloned()
        .zip(consumed_ids.iter().copied())
        .collect();

    let probes = random_keys(&mut rng, 400);
    let ids = grouper.lookup(&keys_to_batch(&probes), 0, -1).unwrap();
    for (i, probe) in probes.iter().enumerate() {
        match known.get(probe) {
            Some(&expected) => {
                assert!(ids.is_valid(i));
                assert_eq!(ids.value(i), expected);
            }
            None => assert!(ids.is_null(i)),
        }
    }
}
