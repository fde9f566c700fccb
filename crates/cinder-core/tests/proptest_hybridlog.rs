//! Property-based tests for HybridLog storage engine correctness.
//!
//! These tests verify invariants that must hold regardless of input data,
//! operation ordering, or where in the tier hierarchy a record ends up.

use bytes::Bytes;
use proptest::prelude::*;
use std::collections::HashMap;

use cinder_core::config::SyncPolicy;
use cinder_core::io::RetryPolicy;
use cinder_core::storage::hybridlog::record::{decode, encode_record, Decoded, RecordKind};
use cinder_core::{HybridLog, HybridLogConfig};

// ============================================================================
// Test Strategies
// ============================================================================

/// Strategy: short keys from a small alphabet so operations collide
fn key_strategy() -> impl Strategy<Value = String> {
    "[a-d]{1,3}"
}

/// Strategy: values from empty to a few hundred bytes
fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..300)
}

#[derive(Debug, Clone)]
enum Op {
    Set(String, Vec<u8>),
    Delete(String),
    Get(String),
    Shift,
    Checkpoint,
    Compact,
    Reopen,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (key_strategy(), value_strategy()).prop_map(|(k, v)| Op::Set(k, v)),
        2 => key_strategy().prop_map(Op::Delete),
        3 => key_strategy().prop_map(Op::Get),
        1 => Just(Op::Shift),
        1 => Just(Op::Checkpoint),
        1 => Just(Op::Compact),
        1 => Just(Op::Reopen),
    ]
}

fn small_config(dir: &tempfile::TempDir) -> HybridLogConfig {
    HybridLogConfig {
        data_dir: dir.path().to_path_buf(),
        mutable_size: 4096,
        readonly_size: 4096,
        index_buckets: 16,
        sync_policy: SyncPolicy::No,
        sync_on_flush: false,
        retry: RetryPolicy::no_retry(),
        ..HybridLogConfig::default()
    }
}

// ============================================================================
// Storage Engine Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Model-based test: the engine behaves like a HashMap across shifts,
    /// checkpoints, compaction and reopening.
    #[test]
    fn prop_log_matches_hashmap_model(ops in prop::collection::vec(op_strategy(), 1..120)) {
        let dir = tempfile::tempdir().unwrap();
        let mut log = HybridLog::open(small_config(&dir)).unwrap();
        let mut model: HashMap<String, Vec<u8>> = HashMap::new();

        for op in ops {
            match op {
                Op::Set(k, v) => {
                    log.set(Bytes::from(k.clone()), Bytes::from(v.clone())).unwrap();
                    model.insert(k, v);
                }
                Op::Delete(k) => {
                    let removed = log.delete(k.as_bytes()).unwrap();
                    prop_assert_eq!(removed, model.remove(&k).is_some());
                }
                Op::Get(k) => {
                    let got = log.get(k.as_bytes()).unwrap();
                    prop_assert_eq!(got.as_deref(), model.get(&k).map(|v| v.as_slice()));
                }
                Op::Shift => log.shift().unwrap(),
                Op::Checkpoint => {
                    log.checkpoint().unwrap();
                }
                Op::Compact => {
                    log.compact().unwrap();
                }
                Op::Reopen => {
                    log.close().unwrap();
                    drop(log);
                    log = HybridLog::open(small_config(&dir)).unwrap();
                }
            }
            prop_assert_eq!(log.len(), model.len());
        }

        for (k, v) in &model {
            let got = log.get(k.as_bytes()).unwrap();
            prop_assert_eq!(got.as_deref(), Some(v.as_slice()));
        }
    }

    /// Multiple SETs to same key: last write wins, whether or not the
    /// overwrite happens in place.
    #[test]
    fn prop_last_write_wins(
        key in key_strategy(),
        values in prop::collection::vec(value_strategy(), 2..20),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let log = HybridLog::open(small_config(&dir)).unwrap();
        let key = Bytes::from(key);

        for v in &values {
            log.set(key.clone(), Bytes::from(v.clone())).unwrap();
        }

        let last = values.last().unwrap();
        let got = log.get(&key).unwrap();
        prop_assert_eq!(got.as_deref(), Some(last.as_slice()));
        prop_assert_eq!(log.len(), 1);
    }

    /// Any single-bit flip in an encoded record is caught by decoding.
    #[test]
    fn prop_bit_flip_detected(
        key in prop::collection::vec(any::<u8>(), 1..32),
        value in value_strategy(),
        bit in any::<prop::sample::Index>(),
    ) {
        let mut record = encode_record(RecordKind::Set, &key, &value);
        let payload_bits = (11 + key.len() + value.len()) * 8;
        let bit = bit.index(payload_bits);
        record[bit / 8] ^= 1 << (bit % 8);

        match decode(&record) {
            Ok(Decoded::Record(r)) => {
                prop_assert!(false, "corrupted record decoded as {:?}", r.kind)
            }
            Ok(Decoded::End) | Err(_) => {}
        }
    }
}
