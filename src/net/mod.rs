//! Migration and remote-memory protocol: one reserved EtherType, five
//! process lists (migrating, pulling, send, recv, fetch) guarded by one
//! `net_lock`, and a tag-indexed dispatcher for inbound frames.
//!
//! The Ethernet device itself — the thing that actually puts bytes on a
//! wire — is out of scope; this module only needs a packet-in/packet-out
//! channel, modeled as a [`Transmit`] sink installed once at boot.

extern crate alloc;

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU8, Ordering};

use spin::Mutex;

use crate::error::KernelResult;
use crate::process::pcb::ProcessId;

pub mod message;
pub mod migration;
pub mod pull;
pub mod retransmit;
pub mod rr;
pub mod wire;

/// Sink for outbound frames. The real implementation hands bytes to the
/// Ethernet driver; tests install a channel that records what was sent.
pub trait Transmit: Send + Sync {
    fn transmit(&self, frame: &[u8]);
}

pub(crate) struct NullSink;
impl Transmit for NullSink {
    fn transmit(&self, _frame: &[u8]) {}
}

static SINK: Mutex<Option<Box<dyn Transmit>>> = Mutex::new(None);
static LOCAL_NODE: AtomicU8 = AtomicU8::new(0);
static NODE_COUNT: AtomicU8 = AtomicU8::new(0);

/// One-time net bring-up: record this node's identity and the cluster
/// size, and install the outbound sink.
pub fn init(local_node: u8, node_count: u8, sink: Box<dyn Transmit>) {
    LOCAL_NODE.store(local_node, Ordering::Release);
    NODE_COUNT.store(node_count, Ordering::Release);
    *SINK.lock() = Some(sink);
}

pub fn local_node() -> u8 {
    LOCAL_NODE.load(Ordering::Acquire)
}

pub fn node_count() -> u8 {
    NODE_COUNT.load(Ordering::Acquire)
}

pub(crate) fn transmit(frame: &[u8]) {
    let guard = SINK.lock();
    match guard.as_deref() {
        Some(sink) => sink.transmit(frame),
        None => NullSink.transmit(frame),
    }
}

/// The five net lists, all behind the one lock the lock-ordering rule
/// names `net_lock`.
#[derive(Default)]
pub(crate) struct NetLists {
    pub migr: Option<ProcessId>,
    pub pull: Option<ProcessId>,
    pub send: Option<ProcessId>,
    pub recv: Option<ProcessId>,
    pub fetch: Option<ProcessId>,
}

pub(crate) static NET_LISTS: Mutex<NetLists> = Mutex::new(NetLists {
    migr: None,
    pull: None,
    send: None,
    recv: None,
    fetch: None,
});

/// Route one inbound frame to the subsystem that owns its tag.
pub fn dispatch(data: &[u8]) -> KernelResult<()> {
    let frame = match wire::parse(data) {
        Ok(f) => f,
        Err(e) => {
            crate::println!("[net] dropped malformed frame: {}", e);
            return Err(e);
        }
    };
    if frame.dst.node() != local_node() {
        return Ok(());
    }
    if wire::check_node(frame.src.node(), node_count()).is_err() {
        crate::println!("[net] dropped frame from invalid node {}", frame.src.node());
        return Ok(());
    }
    use wire::MessageTag::*;
    match frame.tag {
        Migrq => migration::handle_migrq(frame.src, frame.body),
        Migrp => migration::handle_migrp(frame.body),
        Pullrq => pull::handle_pullrq(frame.src, frame.body),
        Pullrp => pull::handle_pullrp(frame.body),
        Sendrq => message::handle_sendrq(frame.src, frame.body),
        Sendrp => message::handle_sendrp(frame.body),
        Recvrq => message::handle_recvrq(frame.src, frame.body),
        Recvrp => message::handle_recvrp(frame.body),
        Fetchrq => message::handle_fetchrq(frame.src, frame.body),
        Fetchrp => message::handle_fetchrp(frame.body),
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::net::wire::{MacAddress, MessageTag};

    fn build(dst: u8, src: u8, tag: MessageTag, body: &[u8]) -> alloc::vec::Vec<u8> {
        wire::build(MacAddress::for_node(dst), MacAddress::for_node(src), tag, body)
    }

    #[test]
    fn dispatch_drops_malformed_frame() {
        init(1, 4, Box::new(NullSink));
        assert!(dispatch(&[0u8; 3]).is_err());
    }

    #[test]
    fn dispatch_drops_frame_for_other_node() {
        init(1, 4, Box::new(NullSink));
        let frame = build(2, 3, MessageTag::Migrp, &[]);
        assert!(dispatch(&frame).is_ok());
    }

    #[test]
    fn dispatch_drops_frame_from_invalid_source_node() {
        init(1, 4, Box::new(NullSink));
        let frame = build(1, 9, MessageTag::Migrp, &[]);
        assert!(dispatch(&frame).is_ok());
    }

    #[test]
    fn dispatch_routes_known_tag_to_its_handler() {
        init(1, 4, Box::new(NullSink));
        let frame = build(1, 2, MessageTag::Migrp, &[]);
        let _ = dispatch(&frame);
    }
}
