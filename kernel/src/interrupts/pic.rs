// Copyright 2024 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Drives the two chained legacy PICs.
//!
//! [`init`] remaps the controllers away from the exception
//! vectors and masks every line; nothing fires until a driver
//! unmasks its IRQ with [`clear_mask`]. Handlers acknowledge
//! with [`end_of_interrupt`] so further interrupts can follow.

use pic8259::ChainedPics;
use spin::Mutex;

/// The vector the first PIC's IRQ 0 is remapped to.
///
const PIC_1_OFFSET: u8 = 32;

/// The vector the second PIC's IRQ 8 is remapped to.
///
const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

/// The set of chained programmable interrupt controllers.
///
static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Remaps the PICs to vectors 32-47 and masks every line.
///
pub fn init() {
    unsafe {
        let mut pics = PICS.lock();
        pics.initialize();
        pics.disable();
    }
}

/// Acknowledges the in-service interrupt for the given IRQ.
///
/// Call exactly once per delivered interrupt, before the
/// handler returns.
///
pub fn end_of_interrupt(irq: u8) {
    unsafe {
        PICS.lock().notify_end_of_interrupt(PIC_1_OFFSET + irq);
    }
}

/// Unmasks the given IRQ line, allowing it to fire.
///
pub fn clear_mask(irq: u8) {
    let mut pics = PICS.lock();
    let mut masks = unsafe { pics.read_masks() };

    let (pic, line) = if irq < 8 { (0, irq) } else { (1, irq - 8) };
    masks[pic] &= !(1 << line);

    // The second PIC is chained through line 2 of the first,
    // so unmasking it requires unmasking the link too.
    if pic == 1 {
        masks[0] &= !(1 << 2);
    }

    unsafe { pics.write_masks(masks[0], masks[1]) };
}

/// Masks the given IRQ line, preventing it from firing.
///
pub fn set_mask(irq: u8) {
    let mut pics = PICS.lock();
    let mut masks = unsafe { pics.read_masks() };

    let (pic, line) = if irq < 8 { (0, irq) } else { (1, irq - 8) };
    masks[pic] |= 1 << line;

    unsafe { pics.write_masks(masks[0], masks[1]) };
}
