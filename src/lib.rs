//! Meridian kernel library.
//!
//! Built twice: once for the bare-metal target this kernel actually boots
//! on, and once for the host, where `cargo test` runs every module's inline
//! test suite against a normal `std` allocator. The `target_os = "none"`
//! cfg gate is what tells the two builds apart everywhere in this crate.

#![no_std]
#![cfg_attr(all(test, target_os = "none"), no_main)]
#![feature(custom_test_frameworks)]
#![feature(abi_x86_interrupt)]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]
#![cfg_attr(target_os = "none", test_runner(crate::test_runner))]
#![cfg_attr(target_os = "none", reexport_test_harness_main = "test_main")]

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

// Host builds (`cargo test`) delegate to the system allocator so every
// module's `#[cfg(test)]` code can use `Vec`/`Box`/etc. normally.
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod console;
pub mod error;
pub mod hash;
pub mod label;
pub mod mm;
pub mod net;
pub mod process;
pub mod raii;
pub mod serial;
pub mod sync;
pub mod syscall;

pub use mm::MemoryRegion;
pub use mm::frame::{FrameNumber, FRAME_SIZE};

/// Heap allocation failure is unrecoverable in a `no_std` kernel; the
/// `alloc_error_handler` ABI requires `-> !`.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout);
}

/// Bring up every subsystem and enter the scheduler loop. Called from
/// [`arch::x86_64::boot`] once the bootloader has handed over control; never
/// returns.
pub fn kernel_main(regions: &[MemoryRegion]) -> ! {
    arch::init();

    let kernel_template = mm::init(regions).expect("frame table seeding failed");

    // No NIC driver is modeled (the wire format in `net::wire` is defined,
    // driving real Ethernet hardware is not); boot single-node unless a
    // real `Transmit` sink is wired up before this point by a platform
    // integration.
    net::init(0, 1, alloc::boxed::Box::new(net::NullSink));

    let root_pagemap = mm::pagemap::new_root(kernel_template).expect("root page map creation failed");
    let root = process::pcb::alloc(None, root_pagemap).expect("root PCB allocation failed");
    console::init_root(root).expect("root console init failed");
    process::sched::proc_ready(root).expect("root process readying failed");

    arch::enable_interrupts();

    loop {
        match process::sched::proc_sched() {
            Ok(pid) => {
                // Fetching the next runnable process's saved state is as
                // far as this tree goes; the actual jump into user mode on
                // `trap_frame` is the naked-entry-stub trampoline the trap
                // decoder's doc comment already calls out as assumed
                // hardware, not modeled here.
                let _ = process::sched::proc_run(pid);
                x86_64_wait_for_interrupt();
            }
            Err(_) => x86_64_wait_for_interrupt(),
        }
    }
}

#[cfg(target_arch = "x86_64")]
fn x86_64_wait_for_interrupt() {
    x86_64::instructions::hlt();
}

#[cfg(not(target_arch = "x86_64"))]
fn x86_64_wait_for_interrupt() {}

#[cfg(all(test, target_os = "none"))]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    test_main();
    loop {
        x86_64_wait_for_interrupt();
    }
}

#[cfg(all(test, target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    crate::serial_println!("[panic] {}", info);
    exit_qemu(QemuExitCode::Failed);
}

#[cfg(all(test, target_os = "none"))]
pub fn test_runner(tests: &[&dyn Testable]) {
    crate::serial_println!("running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    exit_qemu(QemuExitCode::Success);
}

#[cfg(all(test, target_os = "none"))]
pub trait Testable {
    fn run(&self);
}

#[cfg(all(test, target_os = "none"))]
impl<T: Fn()> Testable for T {
    fn run(&self) {
        crate::serial_print!("{}...\t", core::any::type_name::<T>());
        self();
        crate::serial_println!("[ok]");
    }
}

#[cfg(all(test, target_os = "none"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

/// Exit QEMU via the `isa-debug-exit` device. Only meaningful under the
/// bare-metal test harness; the host `cargo test` target never calls this.
#[cfg(all(test, target_os = "none"))]
pub fn exit_qemu(exit_code: QemuExitCode) -> ! {
    use x86_64::instructions::port::Port;

    unsafe {
        let mut port = Port::new(0xf4);
        port.write(exit_code as u32);
    }
    unreachable!();
}
