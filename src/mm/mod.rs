//! Memory management: the physical frame table and the per-process page map.

pub mod frame;
pub mod pagefault;
pub mod pagemap;

use crate::error::KernelResult;
use crate::mm::frame::FrameNumber;

/// Physical memory regions available to the frame table, as reported at
/// boot. Kept tiny and arch-agnostic; the bootloader-specific memory map
/// translation lives in `arch`.
pub struct MemoryRegion {
    pub base: FrameNumber,
    pub frame_count: u64,
}

/// One-time memory subsystem bring-up: seed the frame table from the
/// regions the bootloader reported, pin the canonical zero frame, and build
/// the kernel-half template every process root is derived from.
pub fn init(regions: &[MemoryRegion]) -> KernelResult<FrameNumber> {
    for region in regions {
        frame::FRAMES.add_region(region.base, region.frame_count);
    }
    let zero = frame::FRAMES.alloc()?;
    frame::ZERO_FRAME.init(zero);
    pagemap::build_kernel_template()
}
