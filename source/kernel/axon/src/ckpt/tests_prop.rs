// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the checkpoint core
//! OWNERS: @kernel-pmem-team
//! NOTE: Tests only; no kernel logic
//!
//! TEST_SCOPE:
//!   - Commit atomicity under a randomly placed crash
//!   - Heap watermark equals the sum of deltas iff no prefix violates the
//!     bounds; the first violating call fails and changes nothing
//!   - Context copy round-trips bit-exactly except CR3
//!   - Segment disjointness is enforced at process creation
//!
//! TEST_SCENARIOS:
//!   - a_random_crash_recovers_one_whole_snapshot(): replayed prefix
//!     yields the old or the new snapshot in full, never mixed bytes
//!   - heap_watermark_tracks_only_the_legal_prefix(): reference model of
//!     expand_heap over arbitrary delta sequences
//!   - context_copy_round_trips_except_cr3(): a -> b -> a' leaves a'
//!     bit-identical to a in data/stack and registers, cr3 untouched
//!   - spawn_enforces_segment_disjointness(): creation succeeds exactly
//!     when the four virtual ranges are pairwise disjoint

extern crate alloc;

use alloc::vec::Vec;

use proptest::prelude::*;

use super::tests::{build_record, record_at, scribble_segment, segment_bytes, PAGE};
use super::ExecutionContext;
use crate::ckpt::HeapError;
use crate::mm::PAGE_SIZE;
use crate::pmem::flush::journal;
use crate::task::{ProcessTable, ProgramImage, SpawnError};
use crate::sched::Scheduler;
use crate::testutil::TestArena;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn a_random_crash_recovers_one_whole_snapshot(
        old_fill in any::<u8>(),
        new_fill in any::<u8>(),
        cut in 0.0f64..=1.0,
    ) {
        prop_assume!(old_fill != new_fill);
        let _gate = journal::exclusive();
        let mut arena = TestArena::new(64);
        let mut pool = arena.pool();
        let paddr = build_record(&mut pool, old_fill, 0x4000_0000);

        let baseline = arena.snapshot();
        {
            let record = record_at(paddr);
            let working = record.working_ctx_mut().expect("working");
            scribble_segment(&working.map_info.data, new_fill);
            scribble_segment(&working.map_info.stack, new_fill);
            working.cpu.int_frame.rip = 0x4000_1111;
        }

        journal::begin_capture(arena.base() as usize, arena.len() as usize);
        let mut copied = 0u64;
        let mut flushed = 0u64;
        record_at(paddr).switch_context(&mut copied, &mut flushed).expect("switch");
        let ops = journal::end_capture();
        prop_assert!(!ops.is_empty());

        let k = ((ops.len() as f64) * cut) as usize;
        arena.restore(&baseline);
        journal::replay_prefix(&ops, k.min(ops.len()));

        let record = record_at(paddr);
        prop_assert!(record.is_valid_signature());
        let valid = record.valid_ctx_idx().expect("validity index in range");
        let ctx = record.ctx(valid);
        let expected = if valid == 0 { old_fill } else { new_fill };
        let expected_rip = if valid == 0 { 0x4000_0000u64 } else { 0x4000_1111 };
        prop_assert_eq!(segment_bytes(&ctx.map_info.data), alloc::vec![expected; PAGE as usize]);
        prop_assert_eq!(segment_bytes(&ctx.map_info.stack), alloc::vec![expected; PAGE as usize]);
        prop_assert_eq!(ctx.cpu.int_frame.rip, expected_rip);
    }
}

proptest! {
    #[test]
    fn heap_watermark_tracks_only_the_legal_prefix(
        deltas in prop::collection::vec(-(2 * PAGE_SIZE as i64)..2 * PAGE_SIZE as i64, 0..24),
    ) {
        let heap_base = 0x7000_0000u64;
        let mut ctx = ExecutionContext::zeroed();
        // The watermark check needs only the heap extent; backing is
        // irrelevant, so a dummy physical base suffices.
        ctx.map_info.heap.set(heap_base, 0x1000, PAGE);

        let mut model = 0i128;
        for delta in deltas {
            let next = model + delta as i128;
            let result = ctx.expand_heap(delta);
            if next < 0 {
                prop_assert_eq!(result, Err(HeapError::Underflow));
            } else if next > PAGE as i128 {
                prop_assert_eq!(result, Err(HeapError::Overflow));
            } else {
                prop_assert_eq!(result, Ok(heap_base + next as u64));
                model = next;
            }
            // A failing call leaves the watermark untouched.
            prop_assert_eq!(ctx.heap_used_size(), model as u64);
        }
        prop_assert_eq!(ctx.heap_end_vaddr(), heap_base + model as u64);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn context_copy_round_trips_except_cr3(
        fill in any::<u8>(),
        pokes in prop::collection::vec((0usize..PAGE_SIZE, any::<u8>()), 0..16),
        rip in any::<u64>(),
        rax in any::<u64>(),
    ) {
        let _gate = journal::exclusive();
        let mut arena = TestArena::new(64);
        let mut pool = arena.pool();
        let paddr = build_record(&mut pool, fill, rip);
        let record = record_at(paddr);

        {
            let a = record.ctx_mut(0);
            a.cpu.gpr.rax = rax;
            a.cpu.int_frame.rip = rip;
            for &(offset, value) in &pokes {
                // SAFETY: offset < PAGE_SIZE stays inside the data page.
                unsafe {
                    *crate::pmem::phys_to_ptr(a.map_info.data.paddr() + offset as u64) = value;
                }
            }
        }
        let a_cr3 = 0xaaa0_0000u64;
        let b_cr3 = 0xbbb0_0000u64;
        record.ctx_mut(0).cpu.cr3 = a_cr3;
        record.ctx_mut(1).cpu.cr3 = b_cr3;

        let a_data = segment_bytes(&record.ctx(0).map_info.data);
        let a_stack = segment_bytes(&record.ctx(0).map_info.stack);

        // a -> b, then b -> a'.
        let mut copied = 0u64;
        let (low, high) = record_split(record);
        high.copy_context_from(low, &mut copied).expect("a to b");
        let (low, high) = record_split(record_at(paddr));
        low.copy_context_from(high, &mut copied).expect("b back to a");

        let record = record_at(paddr);
        prop_assert_eq!(segment_bytes(&record.ctx(0).map_info.data), a_data);
        prop_assert_eq!(segment_bytes(&record.ctx(0).map_info.stack), a_stack);
        prop_assert_eq!(record.ctx(0).cpu.gpr, record.ctx(1).cpu.gpr);
        prop_assert_eq!(record.ctx(0).cpu.int_frame, record.ctx(1).cpu.int_frame);
        prop_assert_eq!(record.ctx(0).cpu.cr3, a_cr3);
        prop_assert_eq!(record.ctx(1).cpu.cr3, b_cr3);
    }
}

/// Splits a record into (&mut slot0, &mut slot1) views.
fn record_split(
    record: &mut super::PersistentProcessInfo,
) -> (&mut ExecutionContext, &mut ExecutionContext) {
    // Slot 0 and slot 1 never alias; go through raw pointers to hand out
    // both mutable views.
    let low: *mut ExecutionContext = record.ctx_mut(0);
    let high: *mut ExecutionContext = record.ctx_mut(1);
    // SAFETY: distinct array elements of the same record.
    unsafe { (&mut *low, &mut *high) }
}

fn pages(n: u64) -> u64 {
    n * PAGE
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn spawn_enforces_segment_disjointness(
        slots in prop::collection::vec((0u64..10, 1u64..3), 4),
    ) {
        let base = 0x4000_0000u64;
        let code_va = base + pages(slots[0].0 * 2);
        let data_va = base + pages(slots[1].0 * 2);
        let stack_va = base + pages(slots[2].0 * 2);
        let heap_va = base + pages(slots[3].0 * 2);
        let sizes: Vec<u64> = slots.iter().map(|&(_, size)| pages(size)).collect();

        let ranges = [
            (code_va, code_va + sizes[0]),
            (data_va, data_va + sizes[1]),
            (stack_va, stack_va + sizes[2]),
            (heap_va, heap_va + sizes[3]),
        ];
        let mut disjoint = true;
        for i in 0..4 {
            for j in i + 1..4 {
                if ranges[i].0 < ranges[j].1 && ranges[j].0 < ranges[i].1 {
                    disjoint = false;
                }
            }
        }

        let mut arena = TestArena::new(128);
        let mut pool = arena.pool();
        let mut procs = ProcessTable::new();
        let mut sched = Scheduler::new(&mut procs);
        let code = alloc::vec![0x90u8; sizes[0] as usize];
        let image = ProgramImage {
            code: &code,
            entry_offset: 0,
            data_size: sizes[1],
            stack_size: sizes[2],
            heap_size: sizes[3],
            code_vaddr: code_va,
            data_vaddr: data_va,
            stack_vaddr: stack_va,
            heap_vaddr: heap_va,
        };
        let result = procs.spawn_persistent(&mut pool, &mut sched, &image);
        if disjoint {
            prop_assert!(result.is_ok());
        } else {
            prop_assert_eq!(result, Err(SpawnError::Overlapping));
        }
    }
}
