//! Periodic retransmission: every 64 ticks, re-send whatever this node is
//! still waiting to hear back about. No per-entry deadline bookkeeping --
//! a request that already completed has nothing left on the relevant list
//! or pending-map, so a sweep over still-outstanding entries is exactly
//! the resend set.

use crate::net::{message, migration, pull};

pub const INTERVAL_TICKS: u64 = 64;

/// Called once per timer tick. A no-op except on tick boundaries.
pub fn tick(now: u64) {
    if now % INTERVAL_TICKS != 0 {
        return;
    }
    migration::retransmit_pending();
    pull::retransmit_pending();
    message::retransmit_pending();
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::frame::FrameNumber;
    use crate::mm::pagemap::{self, PtePerm};
    use crate::net::rr::RemoteRef;
    use crate::net::{self, pull::PullTarget};
    use crate::process::pcb;
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use spin::Mutex;

    struct RecordingSink(Arc<Mutex<Vec<Vec<u8>>>>);
    impl net::Transmit for RecordingSink {
        fn transmit(&self, frame: &[u8]) {
            self.0.lock().push(frame.to_vec());
        }
    }

    #[test]
    fn off_tick_is_a_no_op_on_tick_boundary_sweeps() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        net::init(1, 2, Box::new(RecordingSink(sent.clone())));

        let requester = pcb::alloc(None, pagemap::new_root(pagemap::build_kernel_template().unwrap()).unwrap()).unwrap();
        let parent = pagemap::alloc_table_zeroed().unwrap();
        let rr = RemoteRef::new(2, FrameNumber::new(99).as_addr().as_u64(), PtePerm::READ.bits() as u16);
        pull::request(rr, requester, PullTarget::Slot { parent, index: 0, is_leaf: true }).unwrap();

        sent.lock().clear();
        tick(1);
        assert!(sent.lock().is_empty(), "non-boundary tick must not retransmit");

        tick(64);
        assert_eq!(sent.lock().len(), 1, "tick boundary must re-send the one outstanding pull");
    }
}
