//! Write-fault handling: the single place where a shared or demand-zero
//! page turns into a private, writable frame.

use crate::error::{KernelError, KernelResult};
use crate::mm::frame::{FrameNumber, FRAMES, FRAME_SIZE, ZERO_FRAME};
use crate::mm::pagemap::{self, Entry, PtePerm};

/// Handle a write trap at `va` in `root`'s user range.
///
/// - Leaf backed by the canonical zero frame, or by any frame with
///   refcount > 1: allocate a fresh frame, copy the content out, install it
///   writable, drop the old frame's refcount.
/// - Leaf backed by a frame with refcount == 1 that simply isn't marked
///   hardware-writable yet: flip the bit in place, no copy needed.
/// - Leaf still demand-zero with write permission granted: materialize a
///   fresh zero-filled frame and install it writable.
/// - Anything else (no write permission granted, a kernel address, a
///   remote reference not yet pulled in) is not this handler's problem; the
///   caller surfaces it to the process manager as a user-mode trap.
pub fn handle_write_fault(root: FrameNumber, va: u64) -> KernelResult<()> {
    let (table, index, entry) = pagemap::leaf_entry(root, va)?;

    match entry {
        Entry::Present { frame, writable, perm } => {
            if writable {
                // Hardware already permits the write; nothing to do. A
                // second fault on the same instruction shouldn't reach
                // here, but handling it as a no-op is harmless.
                return Ok(());
            }
            if !perm.contains(PtePerm::WRITE) {
                return Err(KernelError::PermissionDenied { addr: va });
            }
            let refcount = FRAMES.refcount(frame)?;
            if frame == ZERO_FRAME.get() || refcount > 1 {
                let fresh = pagemap::alloc_page_zeroed()?;
                let content = pagemap::page_bytes(frame);
                pagemap::with_page_mut(fresh, |p| *p = content);
                pagemap::set_leaf_entry(
                    table,
                    index,
                    Entry::Present {
                        frame: fresh,
                        writable: true,
                        perm,
                    },
                );
                pagemap::free_page_if_reclaimed(frame)?;
            } else {
                pagemap::set_leaf_entry(
                    table,
                    index,
                    Entry::Present {
                        frame,
                        writable: true,
                        perm,
                    },
                );
            }
            Ok(())
        }
        Entry::Zero(perm) => {
            if !perm.contains(PtePerm::WRITE) {
                return Err(KernelError::PermissionDenied { addr: va });
            }
            let fresh = pagemap::alloc_page_zeroed()?;
            pagemap::set_leaf_entry(
                table,
                index,
                Entry::Present {
                    frame: fresh,
                    writable: true,
                    perm,
                },
            );
            Ok(())
        }
        Entry::Remote(rr) => Err(KernelError::RemoteDenied { rr }),
    }
}
