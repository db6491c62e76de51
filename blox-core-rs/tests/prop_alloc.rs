//! Property tests for the role table and allocator
//!
//! Tests invariants for:
//! - Aggregates: needed/wanted are the sums of min/max
//! - Bounds: no role is pushed past its maximum
//! - Fairness: minimums are filled before anything else
//! - Determinism: same table, same sequence

use blox_core::alloc::{Allocator, Phase};
use blox_core::error::{AddError, Exhausted};
use blox_core::table::{RoleInfo, RoleTable};
use blox_core::types::*;
use proptest::prelude::*;

// ============================================================================
// Strategies
// ============================================================================

fn role_range() -> impl Strategy<Value = (u32, u32)> {
    (1u32..5u32, 0u32..4u32).prop_map(|(min, extra)| (min, min + extra))
}

fn role_ranges() -> impl Strategy<Value = Vec<(u32, u32)>> {
    prop::collection::vec(role_range(), 1..8)
}

fn build(ranges: &[(u32, u32)]) -> RoleTable<u8> {
    let mut table = RoleTable::new();
    for (i, (min, max)) in ranges.iter().enumerate() {
        table.add(i as u8, *min, *max).unwrap();
    }
    table
}

/// Drain the allocator until it is exhausted, at most `limit` calls
fn drain(table: &mut RoleTable<u8>, limit: usize) -> Vec<RoleId> {
    let mut alloc = Allocator::new();
    let mut ids = Vec::new();
    while ids.len() < limit {
        match alloc.next_id(table) {
            Ok(id) => ids.push(id),
            Err(Exhausted) => break,
        }
    }
    ids
}

// ============================================================================
// Role Table
// ============================================================================

proptest! {
    /// needed() and wanted() track the sums of accepted ranges
    #[test]
    fn aggregates_are_sums(ranges in role_ranges()) {
        let table = build(&ranges);

        let needed: u32 = ranges.iter().map(|(min, _)| min).sum();
        let wanted: u32 = ranges.iter().map(|(_, max)| max).sum();

        prop_assert_eq!(table.count() as usize, ranges.len());
        prop_assert_eq!(table.needed(), needed);
        prop_assert_eq!(table.wanted(), wanted);
    }

    /// Rejected ranges leave the table untouched
    #[test]
    fn invalid_ranges_rejected(ranges in role_ranges(), min in 0u32..10, max in 0u32..10) {
        prop_assume!(min == 0 || min > max);
        let mut table = build(&ranges);
        let (needed, wanted, count) = (table.needed(), table.wanted(), table.count());

        prop_assert_eq!(table.add(99, min, max), Err(AddError::InvalidRange { min, max }));
        prop_assert_eq!(table.needed(), needed);
        prop_assert_eq!(table.wanted(), wanted);
        prop_assert_eq!(table.count(), count);
    }

    /// The first role registered on a node is charged to the node itself
    #[test]
    fn first_role_reserved(ranges in role_ranges()) {
        let mut info = RoleInfo::new(program_name("prop").unwrap());
        for (i, (min, max)) in ranges.iter().enumerate() {
            info.add(i as u8, *min, *max).unwrap();
        }

        prop_assert_eq!(info.reserved(), Some(0));
        prop_assert_eq!(info.table().get(0).unwrap().allocated, 1);
        prop_assert!(info.table().roles()[1..].iter().all(|r| r.allocated == 0));
    }
}

// ============================================================================
// Allocator
// ============================================================================

proptest! {
    /// CORE INVARIANT: allocated never exceeds max, and the allocator hands
    /// out exactly wanted() - already allocated ids before exhausting
    #[test]
    fn never_exceeds_max(ranges in role_ranges()) {
        let mut table = build(&ranges);
        let wanted = table.wanted() as usize;

        let ids = drain(&mut table, wanted + 10);

        prop_assert_eq!(ids.len(), wanted);
        for (role, (_, max)) in table.roles().iter().zip(&ranges) {
            prop_assert_eq!(role.allocated, *max);
        }
    }

    /// No role gets a Blox beyond its minimum while another is short
    #[test]
    fn minimums_first(ranges in role_ranges()) {
        let mut table = build(&ranges);
        let needed = table.needed() as usize;

        let ids = drain(&mut table, usize::MAX);
        let mut counts = vec![0u32; ranges.len()];

        for (n, id) in ids.iter().enumerate() {
            let id = *id as usize;
            counts[id] += 1;
            if n < needed {
                prop_assert!(
                    counts[id] <= ranges[id].0,
                    "role {} got unit {} beyond min {} during minimum fill",
                    id, counts[id], ranges[id].0
                );
            }
        }

        for (id, (min, _)) in ranges.iter().enumerate() {
            let first_fill = ids[..needed].iter().filter(|r| **r as usize == id).count();
            prop_assert_eq!(first_fill as u32, *min);
        }
    }

    /// Independent runs over equal tables produce equal sequences
    #[test]
    fn deterministic(ranges in role_ranges()) {
        let mut a = build(&ranges);
        let mut b = build(&ranges);

        prop_assert_eq!(drain(&mut a, usize::MAX), drain(&mut b, usize::MAX));
    }

    /// Once exhausted, always exhausted
    #[test]
    fn exhaustion_is_sticky(ranges in role_ranges(), extra in 1usize..5) {
        let mut table = build(&ranges);
        let mut alloc = Allocator::new();
        while alloc.next_id(&mut table).is_ok() {}

        prop_assert_eq!(alloc.phase(), Phase::Exhausted);
        for _ in 0..extra {
            prop_assert_eq!(alloc.next_id(&mut table), Err(Exhausted));
        }
    }

    /// In the maximum phase consecutive ids differ whenever two roles are open
    #[test]
    fn maximum_phase_rotates(count in 2usize..6, spare in 2u32..4) {
        let ranges = vec![(1, 1 + spare); count];
        let mut table = build(&ranges);
        let ids = drain(&mut table, usize::MAX);

        let spread = &ids[count..];
        for pair in spread.windows(2).take(count * (spare as usize - 1)) {
            prop_assert_ne!(pair[0], pair[1]);
        }
    }
}
