// Copyright 2024 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Preemptive multitasking over a round-robin scheduler.
//!
//! The kernel preempts threads from the timer interrupt on vector 32
//! and lets them cooperate through [`yield_now`], which raises the
//! same vector in software. Both paths run the context switch: the
//! vector's assembly entry saves the full register state on the
//! interrupted stack, the scheduler picks the next waiting thread,
//! and the saved state is swapped so the interrupt return lands in
//! the chosen thread.
//!
//! ## Initialisation
//!
//! [`init`] installs the vector-32 routine and adopts the boot
//! context as the first thread. Nothing is preempted until [`start`]
//! unmasks the timer IRQ and enables interrupts; from then on the
//! calling context doubles as the idle loop, reaping stopped threads
//! and yielding.
//!
//! ## Thread lifecycle
//!
//! [`create_thread`] allocates one frame for the stack and queues the
//! thread in state Waiting. The thread begins life in a trampoline
//! that calls its entry function; when the entry function returns,
//! the trampoline marks the thread Stopped and yields for the last
//! time. The idle loop later returns its stack frame to the physical
//! memory manager. [`sleep_for`] and [`sleep_until`] park the current
//! thread in the sleep queue until a deadline.

#![no_std]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::wildcard_imports)]

extern crate alloc;

mod scheduler;
mod switch;

use core::arch::asm;
use core::sync::atomic::{AtomicBool, Ordering};
use interrupts::{Guard, StackFrame, TIMER_VECTOR};
use lazy_static::lazy_static;
use log::warn;
use memlayout::{phys_to_kernel, VirtAddr, PAGE_SIZE};
use scheduler::Scheduler;
use spin::Mutex;
use time::Duration;

/// The timer's IRQ line on the first PIC.
///
const TIMER_IRQ: u8 = 0;

/// The initial RFLAGS value for new threads: interrupts
/// enabled, plus the always-set reserved bit 1.
///
const INITIAL_RFLAGS: u64 = 0x202;

/// Uniquely identifies a thread for its whole life.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ThreadId(u64);

impl ThreadId {
    /// The id the scheduler starts from; the boot context
    /// receives it in [`init`].
    ///
    pub(crate) const BOOTSTRAP: ThreadId = ThreadId(1);

    pub(crate) const fn new(id: u64) -> Self {
        ThreadId(id)
    }

    /// Returns a numerical representation of the id.
    ///
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Describes the scheduling state of a thread.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    /// The thread holds the CPU.
    Running,
    /// The thread is ready to run.
    Waiting,
    /// The thread has finished and awaits reaping.
    Stopped,
    /// The thread is parked on a resource.
    Blocked,
    /// The thread is in the sleep queue.
    Sleeping,
}

/// The complete CPU state saved across a context switch: the
/// general registers pushed by the vector-32 entry routine,
/// then the hardware stack frame.
///
/// The field order mirrors the push sequence in `switch.s`
/// exactly; the routine hands the scheduler a pointer to this
/// layout on the interrupted stack.
///
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct CpuState {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub frame: StackFrame,
}

impl CpuState {
    pub(crate) const fn zeroed() -> Self {
        CpuState {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rbp: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            frame: StackFrame {
                rip: 0,
                cs: 0,
                rflags: 0,
                rsp: 0,
                ss: 0,
            },
        }
    }
}

/// The metadata for one thread of execution.
///
pub(crate) struct Thread {
    // The thread's unique id; thread identity is id equality.
    pub id: ThreadId,

    // The thread's scheduling state.
    pub status: Status,

    // The register state to restore when the thread next gets
    // the CPU. Stale while the thread is running.
    pub regs: CpuState,

    // The lowest address of the thread's stack frame, in the
    // higher-half window. Zero for the boot context, whose
    // stack was not allocated here.
    pub stack_base: VirtAddr,

    // When the thread should leave the sleep queue, in
    // nanoseconds. Meaningful only in status Sleeping.
    pub sleep_until: u64,
}

lazy_static! {
    /// The scheduler. Mutated only inside the vector-32
    /// handler or behind the interrupt guard.
    ///
    static ref SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());
}

/// Tracks whether [`start`] has handed the flow of execution
/// to the scheduler.
///
static STARTED: AtomicBool = AtomicBool::new(false);

/// Installs the context-switch routine on vector 32 and adopts
/// the current execution context as the first thread.
///
/// Interrupts stay as they are; nothing is preempted until
/// [`start`].
///
/// # Panics
///
/// `init` panics if vector 32 is already claimed.
///
pub fn init() {
    let _guard = Guard::new();

    SCHEDULER.lock().bootstrap();

    unsafe {
        interrupts::set_isr_raw(
            TIMER_VECTOR,
            VirtAddr::new(switch::timer_interrupt_entry as usize),
        )
    }
    .expect("vector 32 already claimed");
}

/// Hands the flow of execution to the scheduler.
///
/// Unmasks the timer IRQ, enables interrupts, and turns the
/// calling context into the idle loop: reap stopped threads,
/// yield, repeat. Every created thread runs on the time slices
/// this loop gives away.
///
pub fn start() -> ! {
    STARTED.store(true, Ordering::Relaxed);

    interrupts::pic::clear_mask(TIMER_IRQ);
    x86_64::instructions::interrupts::enable();

    loop {
        reap_stopped();
        yield_now();
    }
}

/// Returns whether the scheduler owns the flow of execution.
///
pub fn started() -> bool {
    STARTED.load(Ordering::Relaxed)
}

/// Creates a new thread that will call `entry` once scheduled,
/// and queues it in state Waiting.
///
/// The thread's stack is a single frame from the physical
/// memory manager, reached through the higher-half window.
///
/// # Panics
///
/// `create_thread` panics if physical memory is exhausted.
///
pub fn create_thread(entry: fn()) -> ThreadId {
    let _guard = Guard::new();

    let frame = physmem::allocate_frame().expect("no frame for thread stack");
    let stack_base = phys_to_kernel(frame);

    SCHEDULER.lock().create(entry, stack_base, PAGE_SIZE)
}

/// Returns the id of the currently running thread.
///
pub fn current_thread() -> ThreadId {
    let _guard = Guard::new();
    SCHEDULER.lock().current()
}

/// Returns the status of the given thread, or `None` if it
/// has been reaped.
///
pub fn status_of(id: ThreadId) -> Option<Status> {
    let _guard = Guard::new();
    SCHEDULER.lock().status_of(id)
}

/// Yields the CPU by raising the scheduler vector in software.
///
/// The interrupt gate re-enters the same context-switch path
/// the timer uses, so a yield observes every enqueue that
/// happened before it.
///
pub fn yield_now() {
    unsafe {
        asm!("int 0x20");
    }
}

/// Puts the current thread to sleep for at least `duration`.
///
pub fn sleep_for(duration: Duration) {
    sleep_until(time::deadline_after(duration));
}

/// Puts the current thread to sleep until `deadline` (in
/// nanoseconds on the kernel clock), then yields.
///
pub fn sleep_until(deadline: u64) {
    {
        let _guard = Guard::new();
        SCHEDULER.lock().sleep_current(deadline);
    }

    yield_now();
}

/// Marks the current thread as finished and gives up the CPU
/// for good. The idle loop frees the thread's stack.
///
pub fn exit() -> ! {
    {
        let _guard = Guard::new();
        SCHEDULER.lock().stop_current();
    }

    loop {
        yield_now();
    }
}

/// The first frame of every created thread. Calls the entry
/// function, then stops the thread.
///
/// Entered via the interrupt return path with interrupts
/// enabled and the entry function's address in `rdi`.
///
pub(crate) extern "C" fn thread_trampoline(entry: fn()) -> ! {
    entry();
    exit();
}

/// Removes stopped threads and returns their stack frames to
/// the physical memory manager.
///
fn reap_stopped() {
    let _guard = Guard::new();

    let stacks = SCHEDULER.lock().reap();
    for stack in stacks {
        match virtmem::translate(stack) {
            Some(frame) => unsafe { physmem::deallocate_frame(frame) },
            None => warn!("reaped stack at {:?} is not mapped", stack),
        }
    }
}

/// The vector-32 handler body, called by the assembly entry
/// routine with a pointer to the interrupted thread's saved
/// state.
///
/// Interrupts are already disabled by the interrupt gate. The
/// timer is acknowledged first so the next tick can fire as
/// soon as interrupts are restored by the `iretq`.
///
#[no_mangle]
extern "C" fn switch_context(state: &mut CpuState) {
    interrupts::pic::end_of_interrupt(TIMER_IRQ);

    let now = time::now_ns();
    SCHEDULER.lock().switch(state, now);
}
