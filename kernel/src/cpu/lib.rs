// Copyright 2024 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Checks the CPU for the features the kernel depends on and
//! enables the ones that need enabling.
//!
//! The kernel requires SSE, SSE2, MSR support, and an invariant TSC
//! (the clock is TSC-based; a TSC that stops or drifts across power
//! states would corrupt sleep deadlines). [`check_features`] panics if
//! any of these is missing. [`enable_sse`] performs the architectural
//! enable sequence: clear `CR0.EM`, set `CR0.MP`, set
//! `CR4.OSFXSR | CR4.OSXMMEXCPT`.

#![no_std]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::wildcard_imports)]

use log::{info, warn};
use raw_cpuid::CpuId;
use x86_64::registers::control::{Cr0, Cr0Flags, Cr4, Cr4Flags};

/// The fixed code-segment selector the boot shim installs for
/// the kernel.
///
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;

/// The fixed data-segment selector the boot shim installs for
/// the kernel.
///
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;

/// The selector of the task state segment.
///
pub const TSS_SELECTOR: u16 = 0x28;

/// Confirms the CPU supports everything the kernel needs.
///
/// # Panics
///
/// `check_features` panics if SSE, SSE2, or MSR support is
/// missing. A missing invariant TSC is logged as a warning
/// rather than a failure, since virtual machines commonly
/// misreport it.
///
pub fn check_features() {
    let cpuid = CpuId::new();

    if let Some(vendor) = cpuid.get_vendor_info() {
        info!("CPU vendor: {}", vendor.as_str());
    }
    if let Some(brand) = cpuid.get_processor_brand_string() {
        info!("CPU brand: {}", brand.as_str().trim());
    }

    let features = cpuid
        .get_feature_info()
        .expect("CPUID feature leaf missing");
    assert!(features.has_sse(), "CPU does not support SSE");
    assert!(features.has_sse2(), "CPU does not support SSE2");
    assert!(features.has_msr(), "CPU does not support MSRs");
    assert!(features.has_tsc(), "CPU does not have a TSC");

    let invariant_tsc = cpuid
        .get_advanced_power_mgmt_info()
        .map(|apm| apm.has_invariant_tsc())
        .unwrap_or(false);
    if !invariant_tsc {
        warn!("CPU does not advertise an invariant TSC; clock may drift");
    }
}

/// Enables SSE and SSE2.
///
/// # Safety
///
/// Must only be called once during bring-up, after
/// [`check_features`] has confirmed SSE support.
///
pub unsafe fn enable_sse() {
    let mut cr0 = Cr0::read();
    cr0.remove(Cr0Flags::EMULATE_COPROCESSOR);
    cr0.insert(Cr0Flags::MONITOR_COPROCESSOR);
    Cr0::write(cr0);

    let mut cr4 = Cr4::read();
    cr4.insert(Cr4Flags::OSFXSR | Cr4Flags::OSXMMEXCPT_ENABLE);
    Cr4::write(cr4);
}
