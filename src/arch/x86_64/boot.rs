//! Bootloader entry point.
//!
//! `bootloader_api::entry_point!` generates the real `_start` and hands us a
//! `BootInfo` with the memory map and the offset at which physical memory is
//! identity-mapped. Translating that into the arch-agnostic
//! [`crate::mm::MemoryRegion`] list `mm::init` wants is the one piece of
//! bootloader-specific glue this module exists for.

extern crate alloc;

use alloc::vec::Vec;

use bootloader_api::{entry_point, BootInfo};
use bootloader_api::info::MemoryRegionKind;

use crate::mm::frame::{FrameNumber, FRAME_SIZE};
use crate::mm::MemoryRegion;

entry_point!(kernel_entry);

fn kernel_entry(boot_info: &'static mut BootInfo) -> ! {
    let regions: Vec<MemoryRegion> = boot_info
        .memory_regions
        .iter()
        .filter(|r| r.kind == MemoryRegionKind::Usable)
        .map(|r| {
            let frame_count = (r.end - r.start) / FRAME_SIZE as u64;
            MemoryRegion {
                base: FrameNumber::new(r.start / FRAME_SIZE as u64),
                frame_count,
            }
        })
        .collect();

    crate::kernel_main(&regions)
}
