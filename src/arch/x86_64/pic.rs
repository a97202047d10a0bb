//! 8259 PIC remapping, via the `pic8259` crate rather than hand-rolled port
//! writes -- the IRQ vector offsets it picks (32..48) are exactly the ones
//! [`super::idt`] wires the timer vector against.

use pic8259::ChainedPics;
use spin::Mutex;

const PIC_1_OFFSET: u8 = 32;
const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

static PICS: Mutex<ChainedPics> = Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Remap the PIC's IRQ vectors and mask every line. Interrupts stay disabled
/// at the CPU until the caller explicitly enables them.
pub fn init() {
    // SAFETY: called once during boot before interrupts are enabled; the
    // offsets above don't collide with any CPU exception vector.
    unsafe {
        PICS.lock().initialize();
    }
}

/// Acknowledge an interrupt on `vector` so the PIC delivers the next one.
pub fn notify_end_of_interrupt(vector: u8) {
    // SAFETY: only called from an interrupt handler for a vector the PIC
    // actually raised.
    unsafe {
        PICS.lock().notify_end_of_interrupt(vector);
    }
}
