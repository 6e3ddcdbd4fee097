//! Property tests for candidate and pair priorities

use std::cmp::Ordering;

use proptest::prelude::*;
use rvoip_ice_core::candidate::MAX_PRIORITY;
use rvoip_ice_core::{Candidate, CandidatePair, CandidateType, IceRole, PairId};

fn candidate(port: u16, priority: u32) -> Candidate {
    let mut c = Candidate::host(
        format!("192.0.2.1:{}", port).parse().unwrap(),
        1,
        65535,
        "1".to_string(),
    );
    c.priority = priority;
    c
}

fn candidate_type() -> impl Strategy<Value = CandidateType> {
    prop_oneof![
        Just(CandidateType::Host),
        Just(CandidateType::PeerReflexive),
        Just(CandidateType::ServerReflexive),
        Just(CandidateType::Relayed),
    ]
}

proptest! {
    #[test]
    fn both_agents_agree_on_pair_priority(g in 1..=MAX_PRIORITY, d in 1..=MAX_PRIORITY) {
        let controlling = CandidatePair::compute_priority(g, d, IceRole::Controlling);
        let controlled = CandidatePair::compute_priority(d, g, IceRole::Controlled);
        prop_assert_eq!(controlling, controlled);
    }

    #[test]
    fn candidate_priority_orders_by_type_first(
        a in candidate_type(),
        b in candidate_type(),
        pref_a in any::<u16>(),
        pref_b in any::<u16>(),
        component in 1u16..=256,
    ) {
        let pa = Candidate::compute_priority(a, pref_a, component);
        let pb = Candidate::compute_priority(b, pref_b, component);
        prop_assert!(pa <= MAX_PRIORITY);
        if a.preference() > b.preference() {
            prop_assert!(pa > pb);
        }
    }

    #[test]
    fn check_order_is_total(
        priorities in proptest::collection::vec((1..=MAX_PRIORITY, 1..=MAX_PRIORITY), 2..24),
    ) {
        let mut pairs: Vec<CandidatePair> = priorities
            .iter()
            .enumerate()
            .map(|(i, (l, r))| {
                CandidatePair::new(
                    PairId(i as u64),
                    candidate(1000 + i as u16, *l),
                    candidate(2000 + i as u16, *r),
                    IceRole::Controlling,
                )
            })
            .collect();
        pairs.sort_by(|a, b| a.check_order(b));

        for window in pairs.windows(2) {
            let (first, second) = (&window[0], &window[1]);
            prop_assert!(first.priority >= second.priority);
            if first.priority == second.priority {
                prop_assert!(first.id < second.id);
            }
            prop_assert_eq!(first.check_order(second), Ordering::Less);
            prop_assert_eq!(second.check_order(first), Ordering::Greater);
        }
        for pair in &pairs {
            prop_assert_eq!(pair.check_order(pair), Ordering::Equal);
        }
    }
}
