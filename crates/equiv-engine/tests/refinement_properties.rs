use std::collections::HashMap;

use equiv_engine::proof_manager::PairwiseProofManager;
use equiv_engine::refinement::static_buffer::{decompose_history, BufferWrite, ObservedWrite};
use equiv_engine::Side;
use equiv_ir::proptest_generators::arb_buffer_script;
use equiv_ir::{BlockId, CmdPointer};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Registration {
    Pairwise(u32, u32),
    Load(bool, u32, u32),
}

fn arb_registration() -> impl Strategy<Value = Registration> {
    prop_oneof![
        (0..4u32, 0..4u32).prop_map(|(a, b)| Registration::Pairwise(a, b)),
        (any::<bool>(), 0..4u32, 0..6u32).prop_map(|(a, site, depth)| Registration::Load(a, site, depth)),
    ]
}

fn site(n: u32) -> CmdPointer {
    CmdPointer::new(BlockId::new(n), 0)
}

fn apply(m: &mut PairwiseProofManager, r: &Registration) -> bool {
    match r {
        Registration::Pairwise(a, b) => m.register_pairwise_proof(site(*a), site(*b)),
        Registration::Load(true, s, depth) => m.register_a_load_override(site(*s), *depth),
        Registration::Load(false, s, depth) => m.register_b_load_override(site(*s), *depth),
    }
}

fn windows_grew(before: &HashMap<CmdPointer, u32>, after: &HashMap<CmdPointer, u32>) -> bool {
    before.iter().all(|(k, v)| after.get(k).is_some_and(|w| w >= v))
}

proptest! {
    #[test]
    fn registrations_never_lose_facts(ops in proptest::collection::vec(arb_registration(), 1..24)) {
        let mut m = PairwiseProofManager::new();
        for op in &ops {
            let before = m.memento();
            let a_windows = m.load_windows(Side::A).clone();
            let b_windows = m.load_windows(Side::B).clone();
            let a_overrides = m.buffer_overrides(Side::A);
            let b_overrides = m.buffer_overrides(Side::B);

            let changed = apply(&mut m, op);
            prop_assert!(windows_grew(&a_windows, m.load_windows(Side::A)));
            prop_assert!(windows_grew(&b_windows, m.load_windows(Side::B)));
            prop_assert!(a_overrides.keys().all(|k| m.buffer_overrides(Side::A).contains_key(k)));
            prop_assert!(b_overrides.keys().all(|k| m.buffer_overrides(Side::B).contains_key(k)));
            if !changed {
                prop_assert_eq!(m.load_windows(Side::A), &a_windows);
                prop_assert_eq!(m.load_windows(Side::B), &b_windows);
                prop_assert_eq!(&m.buffer_overrides(Side::B), &b_overrides);
            }
            // the same registration again adds nothing
            prop_assert!(!apply(&mut m, op));

            // restoring an older snapshot keeps everything learnt since
            let now = m.memento();
            m.restore(&before);
            prop_assert_eq!(m.memento(), now);
        }
    }

    #[test]
    fn word_histories_decompose_to_the_latest_writers(script in arb_buffer_script()) {
        let offsets = script.relative_offsets();
        let latest_first: Vec<ObservedWrite> = offsets
            .iter()
            .rev()
            .map(|o| ObservedWrite::Precise(BufferWrite::WordWrite { relative_offset: *o as i64 }))
            .collect();
        let first_needed = script
            .latest_writers()
            .into_iter()
            .min()
            .expect("at least one word");

        let writes = decompose_history(&latest_first, script.length_bytes()).expect("covered");
        let expected: Vec<i64> = offsets[first_needed..].iter().map(|o| *o as i64).collect();
        let found: Vec<i64> = writes.iter().map(BufferWrite::relative_offset).collect();
        prop_assert_eq!(found, expected);

        // an imprecise write before the needed suffix doesn't matter, one
        // inside it does
        let needed = offsets.len() - first_needed;
        for cut in 0..=latest_first.len() {
            let mut history = latest_first.clone();
            history.insert(cut, ObservedWrite::Imprecise);
            let result = decompose_history(&history, script.length_bytes());
            prop_assert_eq!(result.is_some(), cut >= needed);
        }
    }
}
