//! Property-Based Tests for Queue Routing and Bio Merging
//!
//! # Test Properties
//!
//! 1. **Routing Range**: every PBN maps to a queue in `[0, T)`, deterministically
//! 2. **Rotation Runs**: one rotation span visits each queue `R` times in a run
//! 3. **Rotor Fairness**: any `T × R` rotor picks hit each queue `R` times
//! 4. **No Loss**: draining every group returns each bio exactly once, in
//!    ascending sector order, with head and tail indexed while pending
//! 5. **Homogeneous Groups**: a group never mixes actions

#![cfg(test)]

use std::collections::{HashMap, HashSet};

use bytes::BytesMut;
use proptest::prelude::*;

use super::bio_map::{BioMapState, MergeOutcome};
use super::routing::{BioRotor, QueueRouting};
use crate::bio::request::tests::noop_request;
use crate::bio::{Bio, BioOp, RequestId, VioType, BLOCK_SIZE};
use crate::work_queue::BioQAction;

// =============================================================================
// Property Strategies
// =============================================================================

/// Queue count and rotation interval.
fn routing_strategy() -> impl Strategy<Value = (u32, u32)> {
    (1u32..=16, 1u32..=64)
}

/// Distinct PBNs in random submission order.
fn pbn_order_strategy() -> impl Strategy<Value = Vec<u64>> {
    prop::sample::subsequence((0u64..48).collect::<Vec<_>>(), 1..48).prop_shuffle()
}

fn action_strategy() -> impl Strategy<Value = BioQAction> {
    prop_oneof![Just(BioQAction::Data), Just(BioQAction::CompressedData)]
}

fn block_write(pbn: u64) -> Bio {
    Bio::for_block(
        noop_request(pbn, VioType::Data),
        BioOp::Write,
        BytesMut::zeroed(BLOCK_SIZE),
    )
}

/// Feed `bios` to a fresh merge state; returns it with the owners of the
/// groups that were started.
fn merge_all(bios: Vec<(Bio, BioQAction)>) -> (BioMapState, Vec<RequestId>) {
    let mut state = BioMapState::new(1024).unwrap();
    let mut owners = Vec::new();
    for (bio, action) in bios {
        let id = bio.owner().id();
        if let MergeOutcome::Queued { indexed } = state.try_merge(action, bio).unwrap() {
            assert!(indexed);
            owners.push(id);
        }
    }
    (state, owners)
}

// =============================================================================
// Routing Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: queue selection is in range and deterministic.
    #[test]
    fn prop_queue_in_range((threads, rotation) in routing_strategy(), pbn in any::<u64>()) {
        let routing = QueueRouting::new(threads, rotation).unwrap();
        let queue = routing.queue_for_pbn(pbn);
        prop_assert!(queue < threads as usize);
        prop_assert_eq!(queue, routing.queue_for_pbn(pbn));
    }

    /// Property: a rotation span starting on a span boundary visits queue 0,
    /// 1, ... in runs of exactly `rotation` PBNs.
    #[test]
    fn prop_rotation_runs((threads, rotation) in routing_strategy(), start in 0u64..1_000_000) {
        let routing = QueueRouting::new(threads, rotation).unwrap();
        let span = u64::from(threads) * u64::from(rotation);
        let base = start * span;

        let queues: Vec<usize> = (base..base + span).map(|pbn| routing.queue_for_pbn(pbn)).collect();
        for (i, chunk) in queues.chunks(rotation as usize).enumerate() {
            prop_assert!(chunk.iter().all(|q| *q == i));
        }
    }

    /// Property: any window of `T × R` rotor picks is perfectly fair.
    #[test]
    fn prop_rotor_fairness((threads, rotation) in routing_strategy(), skip in 0usize..500) {
        let routing = QueueRouting::new(threads, rotation).unwrap();
        let rotor = BioRotor::new();
        for _ in 0..skip {
            rotor.advance(&routing);
        }

        let mut counts = vec![0u32; threads as usize];
        for _ in 0..threads * rotation {
            counts[rotor.advance(&routing)] += 1;
        }
        prop_assert!(counts.iter().all(|c| *c == rotation));
    }
}

// =============================================================================
// Merge Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: every submitted bio comes back exactly once, each group is
    /// contiguous and ascending, and pending groups are indexed at both ends.
    #[test]
    fn prop_merge_loses_nothing(order in pbn_order_strategy()) {
        let bios: Vec<_> = order.iter().map(|pbn| (block_write(*pbn), BioQAction::Data)).collect();
        let submitted: HashSet<RequestId> = bios.iter().map(|(b, _)| b.owner().id()).collect();
        let (mut state, owners) = merge_all(bios);

        prop_assert_eq!(state.pending_bios(), order.len());
        prop_assert_eq!(state.map_len(), owners.len() * 2);
        for owner in &owners {
            let (head, tail) = state.group_span(*owner).unwrap();
            prop_assert_eq!(state.lookup(head), Some(*owner));
            prop_assert_eq!(state.lookup(tail), Some(*owner));
        }

        let mut drained = HashSet::new();
        for owner in owners {
            let group = state.take_group(owner);
            prop_assert!(!group.is_empty());
            for pair in group.windows(2) {
                prop_assert_eq!(pair[0].last_sector() + 1, pair[1].sector());
            }
            for bio in &group {
                prop_assert!(drained.insert(bio.owner().id()));
            }
        }
        prop_assert_eq!(drained, submitted);
        prop_assert_eq!(state.map_len(), 0);
        prop_assert_eq!(state.pending_groups(), 0);
    }

    /// Property: bios with different actions never share a group.
    #[test]
    fn prop_groups_are_homogeneous(
        order in pbn_order_strategy(),
        actions in prop::collection::vec(action_strategy(), 48),
    ) {
        let bios: Vec<_> = order
            .iter()
            .zip(actions)
            .map(|(pbn, action)| (block_write(*pbn), action))
            .collect();
        let action_of: HashMap<RequestId, BioQAction> =
            bios.iter().map(|(b, a)| (b.owner().id(), *a)).collect();
        let (mut state, owners) = merge_all(bios);

        let mut total = 0;
        for owner in owners {
            let group = state.take_group(owner);
            total += group.len();
            for bio in &group {
                prop_assert_eq!(action_of[&bio.owner().id()], action_of[&owner]);
            }
        }
        prop_assert_eq!(total, order.len());
    }
}
