// Copyright 2024 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Rounds unsigned integers up or down to exact powers of two.
//!
//! The memory subsystems use these helpers to round addresses to page
//! and zone boundaries. `align` must always be a power of two; rounding
//! to any other alignment is a bug, so the helpers panic on it.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::wildcard_imports)]
#![forbid(unsafe_code)]

/// An internal macro to implement rounding both up and
/// down for each unsigned integer type we use.
///
macro_rules! align_up_and_down {
    ($t:ty, $align_up:ident, $align_down:ident) => {
        /// Rounds `value` to the smallest multiple of `align` that is no
        /// smaller than `value`.
        ///
        /// `align` must be a power of two.
        ///
        pub const fn $align_up(value: $t, align: $t) -> $t {
            assert!(align.is_power_of_two(), "`align` must be a power of two");
            let mask = align - 1;
            if value & mask == 0 {
                // Already aligned.
                value
            } else {
                (value | mask) + 1
            }
        }

        /// Rounds `value` to the largest multiple of `align` that is no
        /// larger than `value`.
        ///
        /// `align` must be a power of two.
        ///
        pub const fn $align_down(value: $t, align: $t) -> $t {
            assert!(align.is_power_of_two(), "`align` must be a power of two");
            value & !(align - 1)
        }
    };
}

align_up_and_down! {   u64,   align_up_u64,   align_down_u64 }
align_up_and_down! { usize, align_up_usize, align_down_usize }
