// Model-based property tests: the dict against std's HashMap, plus the
// scan guarantees that hold for arbitrary operation interleavings.

use std::collections::{HashMap, HashSet};

use proptest::prelude::*;

use kagi::{Dict, DictType, Error};

struct Nums;

impl DictType<u64, u64> for Nums {
    type Metadata = ();
    type EntryMetadata = ();

    fn hash(&self, key: &u64) -> u64 {
        let mut h = key.wrapping_add(0x9e37_79b9_7f4a_7c15);
        h = (h ^ (h >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        h = (h ^ (h >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        h ^ (h >> 31)
    }

    fn key_eq(&self, a: &u64, b: &u64) -> bool {
        a == b
    }
}

#[derive(Clone, Debug)]
enum Op {
    Insert(u64, u64),
    Replace(u64, u64),
    Remove(u64),
    RehashSteps(usize),
    Resize,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u64..64, any::<u64>()).prop_map(|(k, v)| Op::Insert(k, v)),
        (0u64..64, any::<u64>()).prop_map(|(k, v)| Op::Replace(k, v)),
        (0u64..64).prop_map(Op::Remove),
        (1usize..8).prop_map(Op::RehashSteps),
        Just(Op::Resize),
    ]
}

proptest! {
    // Whatever the interleaving of inserts, deletes, and rehash work,
    // lookups agree with a plain map model.
    #[test]
    fn dict_matches_a_map_model(ops in proptest::collection::vec(op_strategy(), 1..200)) {
        let mut dict = Dict::new(Nums);
        let mut model: HashMap<u64, u64> = HashMap::new();

        for op in ops {
            match op {
                Op::Insert(k, v) => {
                    let res = dict.insert(k, v);
                    if model.contains_key(&k) {
                        prop_assert_eq!(res, Err(Error::AlreadyExists));
                    } else {
                        prop_assert_eq!(res, Ok(()));
                        model.insert(k, v);
                    }
                }
                Op::Replace(k, v) => {
                    let added = dict.replace(k, v).unwrap();
                    prop_assert_eq!(added, !model.contains_key(&k));
                    model.insert(k, v);
                }
                Op::Remove(k) => {
                    let res = dict.remove(&k);
                    if model.remove(&k).is_some() {
                        prop_assert_eq!(res, Ok(()));
                    } else {
                        prop_assert_eq!(res, Err(Error::NotFound));
                    }
                }
                Op::RehashSteps(n) => {
                    dict.rehash_steps(n);
                }
                Op::Resize => {
                    let _ = dict.resize();
                }
            }

            prop_assert_eq!(dict.len(), model.len());
        }

        for (k, v) in &model {
            prop_assert_eq!(dict.get(k), Some(v));
        }
        for k in 0u64..64 {
            if !model.contains_key(&k) {
                prop_assert!(dict.get(&k).is_none());
            }
        }
    }

    // A scan over a dict that is not mutated in between visits every
    // entry at least once, from any amount of pending rehash work.
    #[test]
    fn scan_is_complete_on_a_static_dict(
        n in 1u64..400,
        pending_steps in 0usize..32,
    ) {
        let mut dict = Dict::new(Nums);
        for i in 0..n {
            dict.insert(i, i).unwrap();
        }
        dict.rehash_steps(pending_steps);

        let mut seen = HashSet::new();
        let mut cursor = 0u64;
        let mut rounds = 0usize;
        loop {
            cursor = dict.scan(cursor, |e| {
                seen.insert(*e.key());
            });
            rounds += 1;
            prop_assert!(rounds <= 8192, "scan did not terminate");
            if cursor == 0 {
                break;
            }
        }
        prop_assert_eq!(seen.len() as u64, n);
    }

    // Scans terminate from arbitrary cursors, not just well-formed ones.
    #[test]
    fn scan_terminates_from_any_cursor(
        n in 0u64..200,
        start in any::<u64>(),
    ) {
        let mut dict = Dict::new(Nums);
        for i in 0..n {
            dict.insert(i, i).unwrap();
        }

        let mut cursor = start;
        let mut rounds = 0usize;
        loop {
            cursor = dict.scan(cursor, |_| {});
            rounds += 1;
            prop_assert!(rounds <= 8192, "scan from {:#x} did not terminate", start);
            if cursor == 0 {
                break;
            }
        }
    }
}
