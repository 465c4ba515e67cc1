// Copyright 2024 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The round-robin scheduler core.
//!
//! Threads live in an arena ordered by creation; a cursor holding the
//! current thread's id walks it round-robin. Sleeping threads are
//! additionally queued in a min-heap on their wake-up deadline. All of
//! the logic here is plain data manipulation over the arena: the
//! register copying in [`Scheduler::switch`] works on a borrowed
//! [`CpuState`], so the exact code that runs inside the vector-32
//! handler also runs in the tests below.

use crate::{CpuState, Status, Thread, ThreadId};
use alloc::collections::binary_heap::BinaryHeap;
use alloc::vec::Vec;
use core::cmp::Ordering;
use memlayout::VirtAddr;

/// A pending wake-up in the sleep queue.
///
/// The ordering is reversed so that the smallest deadline has
/// the highest priority in the max-heap.
///
#[derive(Clone, Copy, Eq, PartialEq)]
struct Sleeper {
    wake_at: u64,
    thread: ThreadId,
}

impl Ord for Sleeper {
    fn cmp(&self, other: &Sleeper) -> Ordering {
        other
            .wake_at
            .cmp(&self.wake_at)
            .then_with(|| other.thread.as_u64().cmp(&self.thread.as_u64()))
    }
}

impl PartialOrd for Sleeper {
    fn partial_cmp(&self, other: &Sleeper) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The scheduler state: the thread arena, the round-robin
/// cursor, and the sleep queue.
///
pub(crate) struct Scheduler {
    threads: Vec<Thread>,
    current: ThreadId,
    sleepers: BinaryHeap<Sleeper>,
    next_id: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            threads: Vec::new(),
            current: ThreadId::BOOTSTRAP,
            sleepers: BinaryHeap::new(),
            next_id: 1,
        }
    }

    /// Allocates the next thread id.
    ///
    fn alloc_id(&mut self) -> ThreadId {
        let id = ThreadId::new(self.next_id);
        self.next_id += 1;
        id
    }

    /// Creates the implicit thread for the execution context
    /// the kernel booted on. It has no allocated stack and is
    /// already running.
    ///
    pub fn bootstrap(&mut self) -> ThreadId {
        debug_assert!(self.threads.is_empty());

        let id = self.alloc_id();
        self.threads.push(Thread {
            id,
            status: Status::Running,
            regs: CpuState::zeroed(),
            stack_base: VirtAddr::zero(),
            sleep_until: 0,
        });
        self.current = id;

        id
    }

    /// Creates a thread that will begin life in the trampoline
    /// with `entry` as its argument, running on the stack at
    /// `stack_base`.
    ///
    pub fn create(&mut self, entry: fn(), stack_base: VirtAddr, stack_size: usize) -> ThreadId {
        let id = self.alloc_id();

        let mut regs = CpuState::zeroed();
        regs.rdi = entry as usize as u64;
        regs.frame.rip = crate::thread_trampoline as usize as u64;
        regs.frame.cs = cpu::KERNEL_CODE_SELECTOR as u64;
        regs.frame.ss = cpu::KERNEL_DATA_SELECTOR as u64;
        regs.frame.rflags = crate::INITIAL_RFLAGS;
        regs.frame.rsp = (stack_base + stack_size).as_usize() as u64;

        self.threads.push(Thread {
            id,
            status: Status::Waiting,
            regs,
            stack_base,
            sleep_until: 0,
        });

        id
    }

    /// Returns the id of the thread currently holding the CPU.
    ///
    pub fn current(&self) -> ThreadId {
        self.current
    }

    /// Returns the status of the given thread, if it still
    /// exists.
    ///
    pub fn status_of(&self, id: ThreadId) -> Option<Status> {
        self.thread(id).map(|thread| thread.status)
    }

    fn thread(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.iter().find(|thread| thread.id == id)
    }

    fn thread_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.threads.iter_mut().find(|thread| thread.id == id)
    }

    /// Marks the current thread as stopped. It keeps the CPU
    /// until the next schedule step and is reaped afterwards.
    ///
    pub fn stop_current(&mut self) {
        let current = self.current;
        if let Some(thread) = self.thread_mut(current) {
            thread.status = Status::Stopped;
        }
    }

    /// Puts the current thread to sleep until `wake_at`.
    ///
    /// The caller yields afterwards; until then the thread
    /// keeps running with its status already set to Sleeping.
    ///
    pub fn sleep_current(&mut self, wake_at: u64) {
        let current = self.current;
        if let Some(thread) = self.thread_mut(current) {
            thread.status = Status::Sleeping;
            thread.sleep_until = wake_at;
            self.sleepers.push(Sleeper {
                wake_at,
                thread: current,
            });
        }
    }

    /// Wakes every sleeper whose deadline has passed.
    ///
    fn wake_sleepers(&mut self, now: u64) {
        while let Some(next) = self.sleepers.peek() {
            if next.wake_at > now {
                return;
            }

            let id = self.sleepers.pop().expect("peeked sleeper vanished").thread;
            if let Some(thread) = self.thread_mut(id) {
                // A reaped or re-sleeping thread may have left
                // a stale queue entry behind; wake only if the
                // thread's own deadline agrees it is due.
                if thread.status == Status::Sleeping && thread.sleep_until <= now {
                    thread.status = Status::Waiting;
                }
            }
        }
    }

    /// Advances the cursor round-robin to the next thread in
    /// state Waiting, wrapping at the end. If no other thread
    /// is waiting the cursor stays put.
    ///
    fn pick_next(&mut self) -> ThreadId {
        if self.threads.is_empty() {
            return self.current;
        }

        let start = self
            .threads
            .iter()
            .position(|thread| thread.id == self.current)
            .unwrap_or(0);

        for offset in 1..=self.threads.len() {
            let candidate = &self.threads[(start + offset) % self.threads.len()];
            if candidate.id == self.current {
                break;
            }
            if candidate.status == Status::Waiting {
                return candidate.id;
            }
        }

        self.current
    }

    /// Performs one schedule step against the interrupted
    /// thread's saved state.
    ///
    /// Expired sleepers are woken first. If the cursor moves
    /// to a different thread, the caller-pushed register state
    /// is copied into the outgoing thread (downgrading Running
    /// to Waiting; a thread that already moved itself to
    /// Sleeping, Stopped, or Blocked keeps that status) and
    /// replaced with the incoming thread's state, so the
    /// eventual interrupt return lands in the new thread.
    ///
    pub fn switch(&mut self, state: &mut CpuState, now: u64) {
        self.wake_sleepers(now);

        let previous = self.current;
        let next = self.pick_next();
        if next == previous {
            return;
        }

        if let Some(old) = self.thread_mut(previous) {
            old.regs = *state;
            if old.status == Status::Running {
                old.status = Status::Waiting;
            }
        }

        let new = self.thread_mut(next).expect("picked thread vanished");
        *state = new.regs;
        new.status = Status::Running;
        self.current = next;
    }

    /// Removes every stopped thread from the arena, returning
    /// the stack bases to hand back to the frame allocator.
    ///
    /// The current thread is never stopped when this runs (it
    /// is the caller), so the cursor stays valid.
    ///
    pub fn reap(&mut self) -> Vec<VirtAddr> {
        debug_assert!(self.status_of(self.current) != Some(Status::Stopped));

        let mut stacks = Vec::new();
        self.threads.retain(|thread| {
            if thread.status == Status::Stopped {
                if !thread.stack_base.is_zero() {
                    stacks.push(thread.stack_base);
                }
                false
            } else {
                true
            }
        });

        stacks
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use memlayout::PAGE_SIZE;

    fn entry_a() {}
    fn entry_b() {}

    // Builds a scheduler with the bootstrap thread and `n`
    // created threads on fake stacks.
    fn scheduler_with(n: usize) -> (Scheduler, Vec<ThreadId>) {
        let mut sched = Scheduler::new();
        let mut ids = Vec::new();
        ids.push(sched.bootstrap());
        for i in 0..n {
            let stack = VirtAddr::new(0xffff_8000_1000_0000 + i * PAGE_SIZE);
            ids.push(sched.create(entry_a, stack, PAGE_SIZE));
        }
        (sched, ids)
    }

    #[test]
    fn test_bootstrap_thread() {
        let (sched, ids) = scheduler_with(0);
        assert_eq!(sched.current(), ids[0]);
        assert_eq!(sched.status_of(ids[0]), Some(Status::Running));
    }

    #[test]
    fn test_ids_unique_and_monotonic() {
        let (_sched, ids) = scheduler_with(3);
        for pair in ids.windows(2) {
            assert!(pair[0].as_u64() < pair[1].as_u64());
        }
    }

    #[test]
    fn test_created_thread_initial_state() {
        let mut sched = Scheduler::new();
        sched.bootstrap();
        let stack = VirtAddr::new(0xffff_8000_1000_0000);
        let id = sched.create(entry_b, stack, PAGE_SIZE);

        assert_eq!(sched.status_of(id), Some(Status::Waiting));

        let thread = sched.thread(id).unwrap();
        assert_eq!(thread.regs.frame.rip, crate::thread_trampoline as usize as u64);
        assert_eq!(thread.regs.rdi, entry_b as usize as u64);
        assert_eq!(thread.regs.frame.rsp, (stack + PAGE_SIZE).as_usize() as u64);
        assert_eq!(thread.regs.frame.cs, 0x08);
        assert_eq!(thread.regs.frame.ss, 0x10);
        // Interrupts enabled, reserved bit 1 set.
        assert_eq!(thread.regs.frame.rflags, 0x202);
    }

    #[test]
    fn test_round_robin_progress() {
        let (mut sched, ids) = scheduler_with(2);
        let mut state = CpuState::zeroed();
        state.frame.rip = 0x1111;

        // The first step must hand the CPU to a waiting thread
        // and save the interrupted state into the bootstrap
        // thread.
        sched.switch(&mut state, 0);
        assert_eq!(sched.current(), ids[1]);
        assert_eq!(sched.status_of(ids[0]), Some(Status::Waiting));
        assert_eq!(sched.status_of(ids[1]), Some(Status::Running));
        assert_eq!(state.frame.rip, crate::thread_trampoline as usize as u64);
        assert_eq!(sched.thread(ids[0]).unwrap().regs.frame.rip, 0x1111);

        // Subsequent steps walk the ring: T2, then back to the
        // bootstrap thread.
        sched.switch(&mut state, 0);
        assert_eq!(sched.current(), ids[2]);

        sched.switch(&mut state, 0);
        assert_eq!(sched.current(), ids[0]);
        // The bootstrap thread resumes exactly where it was
        // interrupted.
        assert_eq!(state.frame.rip, 0x1111);
    }

    #[test]
    fn test_lone_thread_keeps_cpu() {
        let (mut sched, ids) = scheduler_with(0);
        let mut state = CpuState::zeroed();
        state.frame.rip = 0x2222;

        sched.switch(&mut state, 0);
        assert_eq!(sched.current(), ids[0]);
        assert_eq!(sched.status_of(ids[0]), Some(Status::Running));
        // No switch took place, so the state is untouched.
        assert_eq!(state.frame.rip, 0x2222);
    }

    #[test]
    fn test_sleeping_thread_skipped_then_woken() {
        let (mut sched, ids) = scheduler_with(1);
        let mut state = CpuState::zeroed();

        // T1 runs, then goes to sleep until t=100.
        sched.switch(&mut state, 0);
        assert_eq!(sched.current(), ids[1]);
        sched.sleep_current(100);
        assert_eq!(sched.status_of(ids[1]), Some(Status::Sleeping));

        // Before the deadline the sleeper is skipped: control
        // returns to the bootstrap thread, and a further step
        // leaves it there.
        sched.switch(&mut state, 50);
        assert_eq!(sched.current(), ids[0]);
        sched.switch(&mut state, 99);
        assert_eq!(sched.current(), ids[0]);
        assert_eq!(sched.status_of(ids[1]), Some(Status::Sleeping));

        // At the deadline the sleeper is woken and scheduled
        // within one step.
        sched.switch(&mut state, 100);
        assert_eq!(sched.current(), ids[1]);
        assert_eq!(sched.status_of(ids[1]), Some(Status::Running));
    }

    #[test]
    fn test_sleep_ordering() {
        let (mut sched, ids) = scheduler_with(2);
        let mut state = CpuState::zeroed();

        // T1 sleeps until t=200, T2 until t=100.
        sched.switch(&mut state, 0);
        assert_eq!(sched.current(), ids[1]);
        sched.sleep_current(200);
        sched.switch(&mut state, 0);
        assert_eq!(sched.current(), ids[2]);
        sched.sleep_current(100);
        sched.switch(&mut state, 0);
        assert_eq!(sched.current(), ids[0]);

        // The earlier deadline wakes first even though it was
        // queued second.
        sched.switch(&mut state, 150);
        assert_eq!(sched.current(), ids[2]);
        assert_eq!(sched.status_of(ids[1]), Some(Status::Sleeping));

        // The later deadline follows once it expires.
        sched.switch(&mut state, 250);
        assert_eq!(sched.current(), ids[1]);
    }

    #[test]
    fn test_stopped_thread_not_rescheduled() {
        let (mut sched, ids) = scheduler_with(1);
        let mut state = CpuState::zeroed();

        sched.switch(&mut state, 0);
        assert_eq!(sched.current(), ids[1]);

        // The thread stops itself and yields. Its status must
        // not be downgraded to Waiting by the switch.
        sched.stop_current();
        sched.switch(&mut state, 0);
        assert_eq!(sched.current(), ids[0]);
        assert_eq!(sched.status_of(ids[1]), Some(Status::Stopped));

        // It is never scheduled again.
        sched.switch(&mut state, 0);
        assert_eq!(sched.current(), ids[0]);
    }

    #[test]
    fn test_blocked_thread_skipped_and_kept() {
        let (mut sched, ids) = scheduler_with(1);
        let mut state = CpuState::zeroed();

        sched.switch(&mut state, 0);
        assert_eq!(sched.current(), ids[1]);

        // A thread that blocked itself keeps that status
        // across the switch and is skipped by the cursor.
        sched.thread_mut(ids[1]).unwrap().status = Status::Blocked;
        sched.switch(&mut state, 0);
        assert_eq!(sched.current(), ids[0]);
        assert_eq!(sched.status_of(ids[1]), Some(Status::Blocked));
        sched.switch(&mut state, 0);
        assert_eq!(sched.current(), ids[0]);
    }

    #[test]
    fn test_reap_returns_stacks() {
        let (mut sched, ids) = scheduler_with(2);
        let mut state = CpuState::zeroed();

        sched.switch(&mut state, 0);
        sched.stop_current();
        sched.switch(&mut state, 0);
        sched.stop_current();
        sched.switch(&mut state, 0);
        assert_eq!(sched.current(), ids[0]);

        let stacks = sched.reap();
        assert_eq!(stacks.len(), 2);
        assert_eq!(sched.status_of(ids[1]), None);
        assert_eq!(sched.status_of(ids[2]), None);

        // The bootstrap thread has no allocated stack and is
        // never reaped.
        assert_eq!(sched.status_of(ids[0]), Some(Status::Running));
        let stacks = sched.reap();
        assert!(stacks.is_empty());

        // Scheduling still works over the shrunken arena.
        sched.switch(&mut state, 0);
        assert_eq!(sched.current(), ids[0]);
    }
}
