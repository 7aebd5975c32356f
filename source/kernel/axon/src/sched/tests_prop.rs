// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for scheduler fairness
//! OWNERS: @kernel-sched-team
//! NOTE: Tests only; no kernel logic
//!
//! TEST_SCOPE:
//!   - Round-robin fairness over whole windows
//!   - Insertion order as the tie breaker among ready processes
//!
//! TEST_SCENARIOS:
//!   - whole_windows_are_fair(): n ready processes over n*k switches are
//!     each selected exactly k times
//!   - first_cycle_follows_insertion_order(): the first n selections
//!     replay the registration order

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use proptest::prelude::*;

use super::Scheduler;
use crate::task::{Pid, ProcessTable, Status};

fn ring_with(n: usize) -> (ProcessTable, Scheduler, Vec<Pid>) {
    let mut procs = ProcessTable::new();
    let mut sched = Scheduler::new(&mut procs);
    let pids: Vec<Pid> = (0..n)
        .map(|_| {
            let pid = procs.create(None, 0, [None, None]);
            sched.register_process(pid, &mut procs).expect("register");
            pid
        })
        .collect();
    procs.current_mut().set_status(Status::Sleeping);
    (procs, sched, pids)
}

proptest! {
    #[test]
    fn whole_windows_are_fair(n in 1usize..8, k in 1usize..16) {
        let (mut procs, mut sched, pids) = ring_with(n);
        let mut selections: BTreeMap<Pid, usize> = BTreeMap::new();
        for _ in 0..n * k {
            let pid = sched.switch_process(&mut procs);
            *selections.entry(pid).or_default() += 1;
        }
        for pid in &pids {
            prop_assert_eq!(selections.get(pid).copied().unwrap_or(0), k);
        }
    }

    #[test]
    fn first_cycle_follows_insertion_order(n in 1usize..8) {
        let (mut procs, mut sched, pids) = ring_with(n);
        let first_cycle: Vec<Pid> =
            (0..n).map(|_| sched.switch_process(&mut procs)).collect();
        prop_assert_eq!(first_cycle, pids);
    }
}
