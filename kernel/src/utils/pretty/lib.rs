// Copyright 2024 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Pretty printing for byte quantities, using [powers of 2 for larger units](https://en.wikipedia.org/wiki/Byte#Units_based_on_powers_of_2).
//!
//! The memory managers use [`Bytes`] when they log region and heap
//! sizes, so "67108864" comes out as "64 MiB".

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::wildcard_imports)]
#![forbid(unsafe_code)]

#[cfg(test)]
extern crate alloc;

use core::fmt;

/// Contains a number of bytes.
///
pub struct Bytes(usize);

impl Bytes {
    /// Wraps a number of bytes.
    ///
    pub fn from_u64(n: u64) -> Self {
        Bytes(n as usize)
    }

    /// Wraps a number of bytes.
    ///
    pub fn from_usize(n: usize) -> Self {
        Bytes(n)
    }
}

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let units = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];
        let mut b = self.0;
        for unit in units.iter() {
            if b >= 1024 && b % 1024 == 0 {
                b >>= 10;
                continue;
            }

            return write!(f, "{} {}", b, unit);
        }

        write!(f, "{} ZiB", b)
    }
}
