//! Bare-metal entry point.
//!
//! The actual `_start` symbol is generated by `bootloader_api::entry_point!`
//! inside `meridian_kernel::arch::x86_64::boot`, which only compiles for
//! this binary's `target_os = "none"` target. Linking against the library
//! is enough to pull it in; this file only needs to supply the panic
//! handler a `no_std` binary requires.

#![no_std]
#![no_main]

use meridian_kernel as _;

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    meridian_kernel::println!("[panic] {}", info);
    meridian_kernel::arch::halt();
}
