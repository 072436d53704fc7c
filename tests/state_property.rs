//! Property tests for the dual-state manager: after any interleaving of
//! sync writes, working writes, and async refresh lifecycles, the prompt
//! view equals Working with every pending key replaced by its LSS value.

use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use taleloom::state::{StateManager, StateMap};

#[derive(Clone, Debug)]
enum Op {
    SyncUpdate(String, i64),
    WorkingWrite(String, i64),
    StartAsync(String),
    CompleteAsync(String, i64),
    CancelAsync(String),
}

fn key_strategy() -> impl Strategy<Value = String> {
    prop_oneof![Just("a"), Just("b"), Just("c"), Just("d")].prop_map(str::to_string)
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (key_strategy(), any::<i64>()).prop_map(|(k, v)| Op::SyncUpdate(k, v)),
        (key_strategy(), any::<i64>()).prop_map(|(k, v)| Op::WorkingWrite(k, v)),
        key_strategy().prop_map(Op::StartAsync),
        (key_strategy(), any::<i64>()).prop_map(|(k, v)| Op::CompleteAsync(k, v)),
        key_strategy().prop_map(Op::CancelAsync),
    ]
}

proptest! {
    #[test]
    fn prompt_view_always_matches_the_model(ops in prop::collection::vec(op_strategy(), 0..64)) {
        let mut seed = StateMap::default();
        seed.insert("a".to_string(), json!(0));
        let state = StateManager::new(seed);

        // shadow model
        let mut lss: HashMap<String, Value> = HashMap::from([("a".to_string(), json!(0))]);
        let mut working = lss.clone();
        let mut pending: HashSet<String> = HashSet::new();

        for op in ops {
            match op {
                Op::SyncUpdate(k, v) => {
                    state.update_state_sync([(k.clone(), json!(v))]);
                    lss.insert(k.clone(), json!(v));
                    working.insert(k, json!(v));
                }
                Op::WorkingWrite(k, v) => {
                    let key = k.clone();
                    state.update_working(move |w| {
                        w.insert(key, json!(v));
                    });
                    working.insert(k, json!(v));
                }
                Op::StartAsync(k) => {
                    state.start_async_update([k.clone()]);
                    pending.insert(k);
                }
                Op::CompleteAsync(k, v) => {
                    state.complete_async_update([(k.clone(), json!(v))]);
                    lss.insert(k.clone(), json!(v));
                    working.insert(k.clone(), json!(v));
                    pending.remove(&k);
                }
                Op::CancelAsync(k) => {
                    state.cancel_async_update([k.clone()]);
                    pending.remove(&k);
                }
            }

            let view = state.get_for_prompt();
            let mut expected = working.clone();
            for key in &pending {
                match lss.get(key) {
                    Some(stable) => {
                        expected.insert(key.clone(), stable.clone());
                    }
                    None => {
                        expected.remove(key);
                    }
                }
            }
            let view: HashMap<String, Value> = view.into_iter().collect();
            prop_assert_eq!(&view, &expected);

            // working and LSS reads agree with the model too
            let w: HashMap<String, Value> = state.get_working_state().into_iter().collect();
            prop_assert_eq!(&w, &working);
            let l: HashMap<String, Value> = state.get_lss().into_iter().collect();
            prop_assert_eq!(&l, &lss);
        }
    }
}
