// Copyright 2024 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use core::marker::PhantomData;
use x86_64::instructions::interrupts;

/// Disables interrupts for the duration of a scope.
///
/// The constructor records whether interrupts were enabled and
/// disables them; dropping the guard restores the recorded
/// state. Guards therefore nest correctly: only the outermost
/// guard re-enables interrupts.
///
/// A `Guard` is tied to the CPU it was created on, so it is
/// neither `Send` nor `Sync`, and it cannot be copied.
///
/// # Examples
///
/// ```ignore
/// let _guard = Guard::new();
/// // Interrupts are disabled here, including across calls
/// // into the frame allocator and the page tables.
/// ```
///
pub struct Guard {
    was_enabled: bool,

    // Pins the guard to this CPU.
    _not_send: PhantomData<*mut ()>,
}

impl Guard {
    /// Disables interrupts, remembering their current state.
    ///
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let was_enabled = interrupts::are_enabled();
        interrupts::disable();

        Guard {
            was_enabled,
            _not_send: PhantomData,
        }
    }
}

impl Drop for Guard {
    /// Re-enables interrupts iff they were enabled when the
    /// guard was created.
    ///
    fn drop(&mut self) {
        if self.was_enabled {
            interrupts::enable();
        }
    }
}
