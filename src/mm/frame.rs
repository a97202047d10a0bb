//! Physical frame allocator and reference-counted frame table
//!
//! Hands out and frees physical 4 KiB frames and tracks, per frame, the
//! reference count, the remote reference it originated from (if any), and
//! the set of cluster nodes it has ever been transmitted to.

#![allow(dead_code)]

extern crate alloc;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

use crate::net::rr::RemoteRef;

/// Size of a physical frame.
pub const FRAME_SIZE: usize = 4096;

/// Physical frame number (address / FRAME_SIZE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameNumber(pub u64);

impl FrameNumber {
    pub const fn new(num: u64) -> Self {
        Self(num)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_addr(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * FRAME_SIZE as u64)
    }
}

/// Physical memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_frame(&self) -> FrameNumber {
        FrameNumber::new(self.0 / FRAME_SIZE as u64)
    }
}

/// Frame allocator and table errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    OutOfMemory,
    InvalidFrame,
    DoubleFree,
}

pub type Result<T> = core::result::Result<T, FrameError>;

/// Per-frame bookkeeping. One entry per physical frame managed by the
/// table, indexed by `FrameNumber - base`.
#[derive(Debug)]
struct FrameMeta {
    /// Number of present PTEs (plus outstanding kernel references) pointing
    /// at this frame. Zero means the frame sits on the free list.
    refcount: AtomicU32,
    /// Non-zero iff this frame was pulled in from a remote node: encodes
    /// (origin-node, origin-physical-address, permission-bits).
    origin: AtomicU64,
    /// Bit N-1 set iff this frame has ever been transmitted to node N.
    /// Monotonically growing; frames with any bit set are never reclaimed.
    shared: AtomicU32,
}

impl FrameMeta {
    const fn new() -> Self {
        Self {
            refcount: AtomicU32::new(0),
            origin: AtomicU64::new(0),
            shared: AtomicU32::new(0),
        }
    }
}

/// NUMA-free, refcounted physical frame table backed by a simple free-list.
pub struct FrameTable {
    inner: Mutex<Inner>,
}

struct Inner {
    base: FrameNumber,
    meta: Vec<FrameMeta>,
    free_list: Vec<u64>,
}

impl FrameTable {
    pub const fn uninit() -> Self {
        Self {
            inner: Mutex::new(Inner {
                base: FrameNumber::new(0),
                meta: Vec::new(),
                free_list: Vec::new(),
            }),
        }
    }

    /// Seed the table with a contiguous run of usable physical memory.
    /// Called once from boot for each memory region the bootloader reports.
    pub fn add_region(&self, base: FrameNumber, count: u64) {
        let mut inner = self.inner.lock();
        if inner.meta.is_empty() {
            inner.base = base;
        }
        for _ in 0..count {
            inner.meta.push(FrameMeta::new());
        }
        let start = base.as_u64();
        for i in 0..count {
            inner.free_list.push(start + i);
        }
    }

    fn index_of(inner: &Inner, frame: FrameNumber) -> Result<usize> {
        let off = frame.as_u64().checked_sub(inner.base.as_u64()).ok_or(FrameError::InvalidFrame)?;
        let idx = off as usize;
        if idx >= inner.meta.len() {
            return Err(FrameError::InvalidFrame);
        }
        Ok(idx)
    }

    /// Allocate one free frame with refcount 1.
    pub fn alloc(&self) -> Result<FrameNumber> {
        let mut inner = self.inner.lock();
        let raw = inner.free_list.pop().ok_or(FrameError::OutOfMemory)?;
        let frame = FrameNumber::new(raw);
        let idx = Self::index_of(&inner, frame)?;
        inner.meta[idx].refcount.store(1, Ordering::Release);
        inner.meta[idx].origin.store(0, Ordering::Relaxed);
        Ok(frame)
    }

    /// Current refcount of a frame (0 means free).
    pub fn refcount(&self, frame: FrameNumber) -> Result<u32> {
        let inner = self.inner.lock();
        let idx = Self::index_of(&inner, frame)?;
        Ok(inner.meta[idx].refcount.load(Ordering::Acquire))
    }

    /// Increment a frame's refcount; used when a PTE/subtable starts
    /// sharing an already-mapped frame (COW, `pmap_copy`).
    pub fn inc_ref(&self, frame: FrameNumber) -> Result<()> {
        let inner = self.inner.lock();
        let idx = Self::index_of(&inner, frame)?;
        inner.meta[idx].refcount.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Decrement a frame's refcount, returning the frame to the free list
    /// when it hits zero (unless it carries a non-empty `shared` bitmask,
    /// in which case it is retained pending the quiescence protocol that
    /// is future work; see [`FrameError`] variants for failure modes).
    ///
    /// Returns `true` iff the frame was actually returned to the free
    /// list (refcount hit zero and `shared` is empty) -- callers that keep
    /// side tables of frame content key eviction on this, not on the
    /// refcount alone.
    pub fn dec_ref(&self, frame: FrameNumber) -> Result<bool> {
        let mut inner = self.inner.lock();
        let idx = Self::index_of(&inner, frame)?;
        let prev = inner.meta[idx].refcount.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            inner.meta[idx].refcount.store(0, Ordering::Release);
            return Err(FrameError::DoubleFree);
        }
        if prev == 1 {
            let shared = inner.meta[idx].shared.load(Ordering::Acquire);
            if shared == 0 {
                let raw = frame.as_u64();
                inner.free_list.push(raw);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Record that `frame` originated on a remote node.
    pub fn set_origin(&self, frame: FrameNumber, origin: RemoteRef) -> Result<()> {
        let inner = self.inner.lock();
        let idx = Self::index_of(&inner, frame)?;
        inner.meta[idx].origin.store(origin.raw(), Ordering::Release);
        Ok(())
    }

    pub fn origin(&self, frame: FrameNumber) -> Result<RemoteRef> {
        let inner = self.inner.lock();
        let idx = Self::index_of(&inner, frame)?;
        Ok(RemoteRef::from_raw(inner.meta[idx].origin.load(Ordering::Acquire)))
    }

    /// Mark that `frame` has been transmitted to `node` (1..=N). The bitmask
    /// only ever grows.
    pub fn mark_shared(&self, frame: FrameNumber, node: u8) -> Result<()> {
        let inner = self.inner.lock();
        let idx = Self::index_of(&inner, frame)?;
        let bit = 1u32 << (node.saturating_sub(1));
        inner.meta[idx].shared.fetch_or(bit, Ordering::AcqRel);
        Ok(())
    }

    pub fn shared_mask(&self, frame: FrameNumber) -> Result<u32> {
        let inner = self.inner.lock();
        let idx = Self::index_of(&inner, frame)?;
        Ok(inner.meta[idx].shared.load(Ordering::Acquire))
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().free_list.len()
    }
}

/// The global frame table.
pub static FRAMES: FrameTable = FrameTable::uninit();

/// The canonical all-zero frame. Never freed, never the target of a
/// present-and-writable PTE (invariant 3 in the spec's testable
/// properties). Pinned at frame 0 of a dedicated one-frame region reserved
/// during `mm::init`.
pub static ZERO_FRAME: ZeroFrame = ZeroFrame::uninit();

pub struct ZeroFrame {
    frame: Mutex<Option<FrameNumber>>,
}

impl ZeroFrame {
    const fn uninit() -> Self {
        Self { frame: Mutex::new(None) }
    }

    pub fn init(&self, frame: FrameNumber) {
        *self.frame.lock() = Some(frame);
        // Pin the refcount artificially high so normal dec_ref traffic
        // (there should be none -- the zero frame is never mapped writable)
        // never drives it to the free list.
        let _ = FRAMES.inc_ref(frame);
    }

    pub fn get(&self) -> FrameNumber {
        self.frame.lock().expect("zero frame not initialized")
    }
}

/// Seeds the global [`FRAMES`] table with a large region exactly once per
/// test binary. Host-run tests in other modules (`raii`, `pagemap`, ...)
/// that need real frames from the global table call this first; tests that
/// want a private, deterministically-addressed table build their own with
/// [`FrameTable::uninit`] and `add_region` instead.
#[cfg(all(test, not(target_os = "none")))]
pub fn ensure_test_frames() {
    static INIT: spin::Once<()> = spin::Once::new();
    INIT.call_once(|| {
        FRAMES.add_region(FrameNumber::new(1), 4096);
    });
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn fresh_table() -> FrameTable {
        let t = FrameTable::uninit();
        t.add_region(FrameNumber::new(100), 16);
        t
    }

    #[test]
    fn alloc_sets_refcount_one() {
        let t = fresh_table();
        let f = t.alloc().unwrap();
        assert_eq!(t.refcount(f).unwrap(), 1);
    }

    #[test]
    fn dec_ref_to_zero_frees_frame() {
        let t = fresh_table();
        let before = t.free_count();
        let f = t.alloc().unwrap();
        assert_eq!(t.free_count(), before - 1);
        t.dec_ref(f).unwrap();
        assert_eq!(t.free_count(), before);
    }

    #[test]
    fn shared_frame_is_not_reclaimed_at_zero_refcount() {
        let t = fresh_table();
        let f = t.alloc().unwrap();
        t.mark_shared(f, 2).unwrap();
        let before_free = t.free_count();
        t.dec_ref(f).unwrap();
        // refcount hit zero but the frame is shared, so it must not reappear
        // on the free list.
        assert_eq!(t.free_count(), before_free);
    }

    #[test]
    fn inc_then_two_dec_frees_exactly_once() {
        let t = fresh_table();
        let f = t.alloc().unwrap();
        t.inc_ref(f).unwrap();
        assert_eq!(t.refcount(f).unwrap(), 2);
        t.dec_ref(f).unwrap();
        assert_eq!(t.refcount(f).unwrap(), 1);
        let before = t.free_count();
        t.dec_ref(f).unwrap();
        assert_eq!(t.free_count(), before + 1);
    }

    #[test]
    fn out_of_memory_when_region_exhausted() {
        let t = FrameTable::uninit();
        t.add_region(FrameNumber::new(0), 1);
        let _f = t.alloc().unwrap();
        assert_eq!(t.alloc().unwrap_err(), FrameError::OutOfMemory);
    }
}
