//! RAII wrappers for kernel resources that must not leak on an error path.

extern crate alloc;

use alloc::vec::Vec;
use core::ops::{Deref, DerefMut};

use crate::mm::frame::{FrameNumber, FRAMES};
use crate::println;

/// Owns one physical frame allocated from [`FRAMES`]; decrements its
/// refcount on drop instead of requiring every fallible path to remember to.
pub struct FrameGuard {
    frame: FrameNumber,
}

impl FrameGuard {
    pub fn new(frame: FrameNumber) -> Self {
        Self { frame }
    }

    pub fn frame(&self) -> FrameNumber {
        self.frame
    }

    /// Release ownership without dropping the refcount.
    pub fn leak(self) -> FrameNumber {
        let frame = self.frame;
        core::mem::forget(self);
        frame
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        if let Err(e) = FRAMES.dec_ref(self.frame) {
            println!("[raii] dec_ref({:?}) failed: {:?}", self.frame, e);
        }
    }
}

impl Deref for FrameGuard {
    type Target = FrameNumber;

    fn deref(&self) -> &Self::Target {
        &self.frame
    }
}

/// Owns a batch of frames, e.g. the subtables allocated while building a
/// fresh page map; unwinds all of them together if construction fails
/// partway through.
pub struct FramesGuard {
    frames: Vec<FrameNumber>,
}

impl FramesGuard {
    pub fn new(frames: Vec<FrameNumber>) -> Self {
        Self { frames }
    }

    pub fn push(&mut self, frame: FrameNumber) {
        self.frames.push(frame);
    }

    pub fn leak(mut self) -> Vec<FrameNumber> {
        core::mem::take(&mut self.frames)
    }
}

impl Drop for FramesGuard {
    fn drop(&mut self) {
        for frame in self.frames.drain(..) {
            if let Err(e) = FRAMES.dec_ref(frame) {
                println!("[raii] dec_ref({:?}) failed: {:?}", frame, e);
            }
        }
    }
}

/// Runs arbitrary cleanup on scope exit. `defer!` below is the usual way to
/// construct one.
pub struct ScopeGuard<F: FnOnce()> {
    cleanup: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub fn new(cleanup: F) -> Self {
        Self {
            cleanup: Some(cleanup),
        }
    }

    pub fn cancel(mut self) {
        self.cleanup = None;
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

#[macro_export]
macro_rules! defer {
    ($e:expr) => {
        let _guard = $crate::raii::ScopeGuard::new(|| $e);
    };
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn frame_guard_dec_refs_on_drop() {
        crate::mm::frame::ensure_test_frames();
        let f = FRAMES.alloc().unwrap();
        assert_eq!(FRAMES.refcount(f).unwrap(), 1);
        {
            let _guard = FrameGuard::new(f);
        }
        assert_eq!(FRAMES.refcount(f).unwrap(), 0);
    }

    #[test]
    fn scope_guard_runs_once() {
        let mut cleaned = false;
        {
            let _guard = ScopeGuard::new(|| cleaned = true);
        }
        assert!(cleaned);
    }

    #[test]
    fn scope_guard_cancel_suppresses() {
        let mut cleaned = false;
        {
            let guard = ScopeGuard::new(|| cleaned = true);
            guard.cancel();
        }
        assert!(!cleaned);
    }
}
