// Copyright 2024 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The handlers for the architecturally defined CPU exceptions.
//!
//! Every handler follows the same pattern: log a distinct failure
//! message, dump the hardware stack frame (plus the error code where
//! the architecture pushes one), then panic. The kernel has no
//! thread-level fault isolation, so no exception is survivable. The
//! page-fault handler additionally decodes the error-code bit fields
//! and reports the faulting address from CR2.

use crate::{dump_stack_frame, StackFrame};
use bitflags::bitflags;
use log::error;
use x86_64::registers::control::Cr2;

/// Returns the (vector, handler address) pairs for every
/// architecturally defined exception.
///
pub(crate) fn handlers() -> [(usize, usize); 25] {
    [
        (0, division_error as usize),
        (1, debug as usize),
        (2, non_maskable_interrupt as usize),
        (3, breakpoint as usize),
        (4, overflow as usize),
        (5, bound_range_exceeded as usize),
        (6, invalid_opcode as usize),
        (7, device_not_available as usize),
        (8, double_fault as usize),
        (9, coprocessor_segment_overrun as usize),
        (10, invalid_tss as usize),
        (11, segment_not_present as usize),
        (12, stack_segment_fault as usize),
        (13, general_protection_fault as usize),
        (14, page_fault as usize),
        (15, reserved_exception as usize),
        (16, x87_floating_point as usize),
        (17, alignment_check as usize),
        (18, machine_check as usize),
        (19, simd_floating_point as usize),
        (20, virtualization as usize),
        (21, control_protection as usize),
        (28, hypervisor_injection as usize),
        (29, vmm_communication as usize),
        (30, security_exception as usize),
    ]
}

bitflags! {
    /// The error-code bit fields pushed by a page fault.
    ///
    struct PageFaultCode: u64 {
        /// The fault was a protection violation on a present
        /// page; unset means the page was not present.
        const PRESENT = 1 << 0;
        /// The access was a write; unset means a read.
        const WRITE = 1 << 1;
        /// The access came from ring 3.
        const USER = 1 << 2;
        /// A reserved bit was set in a page-table entry.
        const RESERVED_WRITE = 1 << 3;
        /// The access was an instruction fetch.
        const INSTRUCTION_FETCH = 1 << 4;
        /// A protection-key violation.
        const PROTECTION_KEY = 1 << 5;
        /// A shadow-stack access violation.
        const SHADOW_STACK = 1 << 6;
        /// The fault occurred inside an SGX enclave.
        const SGX = 1 << 15;
    }
}

// 0: #DE
extern "x86-interrupt" fn division_error(frame: StackFrame) {
    error!("EXCEPTION: division error");
    dump_stack_frame(&frame);
    panic!("unhandled exception (division error)");
}

// 1: #DB
extern "x86-interrupt" fn debug(frame: StackFrame) {
    error!("EXCEPTION: debug");
    dump_stack_frame(&frame);
    panic!("unhandled exception (debug)");
}

// 2: NMI
extern "x86-interrupt" fn non_maskable_interrupt(frame: StackFrame) {
    error!("EXCEPTION: non-maskable interrupt");
    dump_stack_frame(&frame);
    panic!("unhandled exception (non-maskable interrupt)");
}

// 3: #BP
extern "x86-interrupt" fn breakpoint(frame: StackFrame) {
    error!("EXCEPTION: breakpoint");
    dump_stack_frame(&frame);
    panic!("unhandled exception (breakpoint)");
}

// 4: #OF
extern "x86-interrupt" fn overflow(frame: StackFrame) {
    error!("EXCEPTION: overflow");
    dump_stack_frame(&frame);
    panic!("unhandled exception (overflow)");
}

// 5: #BR
extern "x86-interrupt" fn bound_range_exceeded(frame: StackFrame) {
    error!("EXCEPTION: bound range exceeded");
    dump_stack_frame(&frame);
    panic!("unhandled exception (bound range exceeded)");
}

// 6: #UD
extern "x86-interrupt" fn invalid_opcode(frame: StackFrame) {
    error!("EXCEPTION: invalid opcode");
    dump_stack_frame(&frame);
    panic!("unhandled exception (invalid opcode)");
}

// 7: #NM
extern "x86-interrupt" fn device_not_available(frame: StackFrame) {
    error!("EXCEPTION: device not available");
    dump_stack_frame(&frame);
    panic!("unhandled exception (device not available)");
}

// 8: #DF. The error code is always zero.
extern "x86-interrupt" fn double_fault(frame: StackFrame, _code: u64) -> ! {
    error!("EXCEPTION: double fault");
    dump_stack_frame(&frame);
    panic!("unhandled exception (double fault)");
}

// 9: old coprocessor segment overrun, unused on modern CPUs.
extern "x86-interrupt" fn coprocessor_segment_overrun(frame: StackFrame) {
    error!("EXCEPTION: coprocessor segment overrun");
    dump_stack_frame(&frame);
    panic!("unhandled exception (coprocessor segment overrun)");
}

// 10: #TS
extern "x86-interrupt" fn invalid_tss(frame: StackFrame, code: u64) {
    error!("EXCEPTION: invalid TSS: selector {:#x}", code);
    dump_stack_frame(&frame);
    panic!("unhandled exception (invalid TSS)");
}

// 11: #NP
extern "x86-interrupt" fn segment_not_present(frame: StackFrame, code: u64) {
    error!("EXCEPTION: segment not present: selector {:#x}", code);
    dump_stack_frame(&frame);
    panic!("unhandled exception (segment not present)");
}

// 12: #SS
extern "x86-interrupt" fn stack_segment_fault(frame: StackFrame, code: u64) {
    error!("EXCEPTION: stack segment fault: selector {:#x}", code);
    dump_stack_frame(&frame);
    panic!("unhandled exception (stack segment fault)");
}

// 13: #GP
extern "x86-interrupt" fn general_protection_fault(frame: StackFrame, code: u64) {
    if code != 0 {
        error!("EXCEPTION: general protection fault: segment {:#x}", code);
    } else {
        error!("EXCEPTION: general protection fault");
    }
    dump_stack_frame(&frame);
    panic!("unhandled exception (general protection fault)");
}

// 14: #PF
extern "x86-interrupt" fn page_fault(frame: StackFrame, code: u64) {
    let code = PageFaultCode::from_bits_truncate(code);
    error!("EXCEPTION: page fault");
    error!("  address: {:#018x}", Cr2::read().as_u64());
    error!(
        "  P={} W/R={} U/S={} RSVD={} I/D={} PK={} SS={} SGX={}",
        code.contains(PageFaultCode::PRESENT) as u8,
        code.contains(PageFaultCode::WRITE) as u8,
        code.contains(PageFaultCode::USER) as u8,
        code.contains(PageFaultCode::RESERVED_WRITE) as u8,
        code.contains(PageFaultCode::INSTRUCTION_FETCH) as u8,
        code.contains(PageFaultCode::PROTECTION_KEY) as u8,
        code.contains(PageFaultCode::SHADOW_STACK) as u8,
        code.contains(PageFaultCode::SGX) as u8,
    );
    dump_stack_frame(&frame);
    panic!("unhandled exception (page fault)");
}

// 15: architecturally reserved, but it gets a gate so a
// spurious delivery is diagnosable.
extern "x86-interrupt" fn reserved_exception(frame: StackFrame) {
    error!("EXCEPTION: reserved vector 15");
    dump_stack_frame(&frame);
    panic!("unhandled exception (reserved vector 15)");
}

// 16: #MF
extern "x86-interrupt" fn x87_floating_point(frame: StackFrame) {
    error!("EXCEPTION: x87 floating point error");
    dump_stack_frame(&frame);
    panic!("unhandled exception (x87 floating point error)");
}

// 17: #AC. Bit 0 of the code distinguishes an external event.
extern "x86-interrupt" fn alignment_check(frame: StackFrame, code: u64) {
    error!("EXCEPTION: alignment check: {:#x}", code);
    dump_stack_frame(&frame);
    panic!("unhandled exception (alignment check)");
}

// 18: #MC
extern "x86-interrupt" fn machine_check(frame: StackFrame) {
    error!("EXCEPTION: machine check");
    dump_stack_frame(&frame);
    panic!("unhandled exception (machine check)");
}

// 19: #XM
extern "x86-interrupt" fn simd_floating_point(frame: StackFrame) {
    error!("EXCEPTION: SIMD floating point error");
    dump_stack_frame(&frame);
    panic!("unhandled exception (SIMD floating point error)");
}

// 20: #VE
extern "x86-interrupt" fn virtualization(frame: StackFrame) {
    error!("EXCEPTION: virtualization error");
    dump_stack_frame(&frame);
    panic!("unhandled exception (virtualization error)");
}

// 21: #CP
extern "x86-interrupt" fn control_protection(frame: StackFrame, code: u64) {
    error!("EXCEPTION: control protection: {:#x}", code);
    dump_stack_frame(&frame);
    panic!("unhandled exception (control protection)");
}

// 28: #HV
extern "x86-interrupt" fn hypervisor_injection(frame: StackFrame) {
    error!("EXCEPTION: hypervisor injection");
    dump_stack_frame(&frame);
    panic!("unhandled exception (hypervisor injection)");
}

// 29: #VC
extern "x86-interrupt" fn vmm_communication(frame: StackFrame, code: u64) {
    error!("EXCEPTION: VMM communication: {:#x}", code);
    dump_stack_frame(&frame);
    panic!("unhandled exception (VMM communication)");
}

// 30: #SX
extern "x86-interrupt" fn security_exception(frame: StackFrame, code: u64) {
    error!("EXCEPTION: security exception: {:#x}", code);
    dump_stack_frame(&frame);
    panic!("unhandled exception (security exception)");
}
