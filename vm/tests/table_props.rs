//! Table invariants against a reference model: after any sequence of
//! inserts and removes, membership and length agree with a std map, probing
//! terminates, and growth preserves every pair.

mod common;

use std::collections::HashMap;

use proptest::prelude::*;
use vm::{VmOptions, VM};

#[derive(Debug, Clone)]
enum Op {
    Insert(u8, i64),
    Remove(u8),
    Query(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (any::<u8>(), -1000i64..1000).prop_map(|(k, v)| Op::Insert(k, v)),
        any::<u8>().prop_map(Op::Remove),
        any::<u8>().prop_map(Op::Query),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn table_matches_reference_model(ops in proptest::collection::vec(op_strategy(), 0..400)) {
        let mut vm = VM::new(VmOptions::default());
        let table = vm.new_table().expect("table");
        let mut model: HashMap<String, i64> = HashMap::new();

        for op in ops {
            match op {
                Op::Insert(k, v) => {
                    let key_text = format!("key-{k}");
                    let key = vm.new_string(&key_text).expect("string");
                    let added = vm.table_insert(&table, &key, v).expect("insert");
                    let model_added = model.insert(key_text, v).is_none();
                    prop_assert_eq!(added, model_added);
                }
                Op::Remove(k) => {
                    let key_text = format!("key-{k}");
                    let removed = vm.table_remove(&table, &key_text);
                    prop_assert_eq!(removed, model.remove(&key_text));
                }
                Op::Query(k) => {
                    let key_text = format!("key-{k}");
                    prop_assert_eq!(
                        vm.table_contains(&table, &key_text),
                        model.contains_key(&key_text)
                    );
                    prop_assert_eq!(vm.table_get(&table, &key_text), model.get(&key_text).copied());
                }
            }
            prop_assert_eq!(vm.table_len(&table), model.len() as i64);
        }

        // Everything still present after a full collection.
        vm.collect_garbage().expect("gc");
        for (key, value) in &model {
            prop_assert_eq!(vm.table_get(&table, key), Some(*value));
        }
    }
}
