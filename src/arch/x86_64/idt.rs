//! Interrupt Descriptor Table.
//!
//! The syscall trap gate (vector 0x80) is wired up here, but decoding the
//! command word out of the saved register file and building a
//! [`crate::process::pcb::TrapFrame`] from it is the one piece of "hardware
//! specific trap entry" the core's own spec declares out of scope -- real
//! register capture needs a naked entry stub that this tree doesn't provide.
//! The handler below only acknowledges the trap; `crate::syscall::dispatch`
//! is the documented seam a full trampoline would call into.

use core::sync::atomic::{AtomicU64, Ordering};

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

pub const SYSCALL_VECTOR: u8 = 0x80;
pub const TIMER_VECTOR: u8 = 32;

/// Ticks seen since boot. Advances the pacing list and the retransmit
/// queue and drives the scheduler's preemption point.
static TICKS: AtomicU64 = AtomicU64::new(0);

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.general_protection_fault.set_handler_fn(general_protection_fault_handler);
        // SAFETY: the double-fault IST index names a stack set up in gdt::init,
        // which must run before this handler can ever be taken.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(crate::arch::x86_64::gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt[TIMER_VECTOR as usize].set_handler_fn(timer_interrupt_handler);
        idt[SYSCALL_VECTOR as usize].set_handler_fn(syscall_handler);
        idt
    };
}

pub fn init() {
    IDT.load();
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    crate::println!("[trap] breakpoint\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(stack_frame: InterruptStackFrame, _error_code: u64) -> ! {
    panic!("double fault\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn page_fault_handler(stack_frame: InterruptStackFrame, error_code: PageFaultErrorCode) {
    use x86_64::registers::control::Cr2;
    crate::println!(
        "[trap] page fault at {:?}, error {:?}\n{:#?}",
        Cr2::read(),
        error_code,
        stack_frame
    );
    // Per the error-handling design, an unhandled user trap is reflected to
    // the parent rather than treated as fatal; wiring a faulting va/pid
    // through here needs the same register-capture trampoline noted above.
}

extern "x86-interrupt" fn general_protection_fault_handler(stack_frame: InterruptStackFrame, error_code: u64) {
    crate::println!("[trap] general protection fault, error {:#x}\n{:#?}", error_code, stack_frame);
}

extern "x86-interrupt" fn timer_interrupt_handler(_stack_frame: InterruptStackFrame) {
    let now = TICKS.fetch_add(1, Ordering::Relaxed);
    crate::net::retransmit::tick(now);
    let _ = crate::process::wait::pacing_tick(now);
    if let Some(pid) = crate::process::sched::current() {
        let _ = crate::process::sched::proc_yield(pid);
    }
    crate::arch::x86_64::pic::notify_end_of_interrupt(TIMER_VECTOR);
}

extern "x86-interrupt" fn syscall_handler(_stack_frame: InterruptStackFrame) {
    // See module doc: the decoded-command dispatch lives in
    // `crate::syscall::dispatch`, reached once a real trampoline captures
    // registers into a `TrapFrame`.
}
