//! Support for the primary and secondary 8259 Programmable Interrupt Controllers (PICs).

use pic8259::ChainedPics;

/// The offset of the first PIC (master).
///
/// IRQs 0..7 are mapped to interrupts 32..39.
pub const PIC_1_OFFSET: u8 = 32;

/// The offset of the second PIC (slave).
///
/// IRQs 8..15 are mapped to interrupts 40..47.
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

/// Builds the chained PICs with the offsets above. Nothing is sent to the
/// hardware until `initialize` is called.
pub(super) fn chained() -> ChainedPics {
    // SAFETY: the offsets put both PICs above the 32 CPU exception vectors
    // and do not overlap.
    unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) }
}

/// Interrupt vector of a PIC line.
pub fn vector(irq: u8) -> u8 {
    PIC_1_OFFSET + irq
}
