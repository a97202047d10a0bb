//! x86_64 architecture support: GDT, IDT, PIC remap, and the bootloader
//! entry point. Everything the core spec treats as "assumed" (trap entry,
//! segmentation) is confined to this module tree.

#[cfg(target_os = "none")]
pub mod boot;
pub mod gdt;
pub mod idt;
pub mod pic;
pub mod vga;

/// Bring up segmentation, interrupts, and the PIC. Interrupts are left
/// masked and disabled; the caller enables them once the rest of boot has
/// run.
pub fn init() {
    gdt::init();
    idt::init();
    pic::init();
}

/// Halt the CPU. Used by the panic handler.
pub fn halt() -> ! {
    x86_64::instructions::interrupts::disable();
    loop {
        x86_64::instructions::hlt();
    }
}

pub fn enable_interrupts() {
    x86_64::instructions::interrupts::enable();
}
