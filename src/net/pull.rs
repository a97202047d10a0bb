//! On-demand remote page/subtree pull: PULLRQ/PULLRP and the translate-back
//! step that turns a pulled directory page into local page-map entries.
//!
//! A pulled page (leaf or directory) is split into three parts so each fits
//! an Ethernet MTU; directory slots are re-encoded on the wire rather than
//! transmitted as raw in-memory [`Entry`] bytes, since this implementation's
//! [`Entry`] representation is host-side only (see `mm::pagemap`'s module
//! doc). The encoding: 16 bytes/slot, `[kind:1][perm:1][reserved:6][value:8]`
//! — kind 0 is a zero-mapping (value unused, perm carries nominal bits),
//! kind 1 carries a [`RemoteRef`] whose node decides the translate-back
//! outcome (local node -> present + refcount bump, any other non-zero node
//! -> remote mapping).

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::mm::frame::{FrameNumber, PhysicalAddress, FRAMES, FRAME_SIZE};
use crate::mm::pagemap::{self, Entry, PtePerm};
use crate::net::rr::RemoteRef;
use crate::net::{self, wire, NET_LISTS};
use crate::process::pcb::{self, ProcState, ProcessId};
use crate::process::sched;

const SLOT_WIRE_SIZE: usize = 16;
const DIRECTORY_WIRE_SIZE: usize = 512 * SLOT_WIRE_SIZE;

#[derive(Debug, Clone, Copy)]
pub enum PullTarget {
    /// Pull an entire directory page into an already-allocated table frame
    /// (used to seed a migrated process's root).
    WholeTable(FrameNumber),
    /// Pull one subtree or leaf referenced by a single PTE into `parent`'s
    /// slot `index`.
    Slot { parent: FrameNumber, index: usize, is_leaf: bool },
}

struct PendingPull {
    rr: RemoteRef,
    requester: ProcessId,
    target: PullTarget,
    is_directory: bool,
    parts: [Option<Vec<u8>>; 3],
    arrived_mask: u8,
}

static PULLS: Mutex<BTreeMap<u64, PendingPull>> = Mutex::new(BTreeMap::new());

fn link_pull(pid: ProcessId) {
    let mut lists = NET_LISTS.lock();
    let _ = pcb::with_pcb(pid, |p| p.pull_next = lists.pull);
    lists.pull = Some(pid);
}

fn unlink_pull(pid: ProcessId) -> KernelResult<()> {
    let mut lists = NET_LISTS.lock();
    let mut cursor = lists.pull;
    let mut prev: Option<ProcessId> = None;
    while let Some(cur) = cursor {
        let next = pcb::with_pcb(cur, |p| p.pull_next)?;
        if cur == pid {
            match prev {
                Some(p) => pcb::with_pcb(p, |pc| pc.pull_next = next)?,
                None => lists.pull = next,
            }
            return Ok(());
        }
        prev = Some(cur);
        cursor = next;
    }
    Ok(())
}

fn encode_directory(table: FrameNumber) -> Vec<u8> {
    let mut out = Vec::with_capacity(DIRECTORY_WIRE_SIZE);
    for i in 0..512 {
        let mut slot = [0u8; SLOT_WIRE_SIZE];
        match pagemap::table_entry(table, i) {
            Entry::Zero(perm) => {
                slot[0] = 0;
                slot[1] = perm.bits();
            }
            Entry::Present { frame, perm, .. } => {
                slot[0] = 1;
                let rr = RemoteRef::new(net::local_node(), frame.as_addr().as_u64(), perm.bits() as u16);
                slot[8..16].copy_from_slice(&rr.raw().to_be_bytes());
            }
            Entry::Remote(rr) => {
                slot[0] = 1;
                slot[8..16].copy_from_slice(&rr.raw().to_be_bytes());
            }
        }
        out.extend_from_slice(&slot);
    }
    out
}

fn decode_directory_into(dst: FrameNumber, bytes: &[u8]) -> KernelResult<()> {
    if bytes.len() != DIRECTORY_WIRE_SIZE {
        return Err(KernelError::MalformedFrame);
    }
    for i in 0..512 {
        let slot = &bytes[i * SLOT_WIRE_SIZE..(i + 1) * SLOT_WIRE_SIZE];
        let entry = match slot[0] {
            0 => Entry::Zero(PtePerm::from_bits_truncate(slot[1])),
            1 => {
                let value = u64::from_be_bytes(slot[8..16].try_into().unwrap());
                let rr = RemoteRef::from_raw(value);
                if rr.node() == net::local_node() {
                    let frame = PhysicalAddress::new(rr.addr()).as_frame();
                    FRAMES.inc_ref(frame)?;
                    Entry::Present {
                        frame,
                        writable: false,
                        perm: PtePerm::from_bits_truncate(rr.perms() as u8),
                    }
                } else if rr.node() == 0 {
                    Entry::Zero(PtePerm::from_bits_truncate(rr.perms() as u8))
                } else {
                    Entry::Remote(rr)
                }
            }
            _ => return Err(KernelError::MalformedFrame),
        };
        pagemap::set_leaf_entry(dst, i, entry);
    }
    Ok(())
}

/// Resolve `rr` into `target`, either immediately (it names the zero page
/// or a frame already local to this node) or by parking `requester` in
/// `PULL` and transmitting a PULLRQ.
pub fn request(rr: RemoteRef, requester: ProcessId, target: PullTarget) -> KernelResult<()> {
    if rr.node() == 0 {
        if let PullTarget::Slot { parent, index, .. } = target {
            pagemap::set_leaf_entry(parent, index, Entry::Zero(PtePerm::from_bits_truncate(rr.perms() as u8)));
        }
        return Ok(());
    }
    if rr.node() == net::local_node() {
        let frame = PhysicalAddress::new(rr.addr()).as_frame();
        match target {
            PullTarget::Slot { parent, index, .. } => {
                FRAMES.inc_ref(frame)?;
                pagemap::set_leaf_entry(
                    parent,
                    index,
                    Entry::Present {
                        frame,
                        writable: false,
                        perm: PtePerm::from_bits_truncate(rr.perms() as u8),
                    },
                );
            }
            PullTarget::WholeTable(dst) => {
                for i in 0..512 {
                    let entry = pagemap::table_entry(frame, i);
                    if let Entry::Present { frame: f, .. } = entry {
                        FRAMES.inc_ref(f)?;
                    }
                    pagemap::set_leaf_entry(dst, i, entry);
                }
            }
        }
        return Ok(());
    }

    let is_directory = match target {
        PullTarget::WholeTable(_) => true,
        PullTarget::Slot { is_leaf, .. } => !is_leaf,
    };
    PULLS.lock().insert(
        rr.raw(),
        PendingPull {
            rr,
            requester,
            target,
            is_directory,
            parts: [None, None, None],
            arrived_mask: 0,
        },
    );
    pcb::with_pcb(requester, |p| p.state = ProcState::Pull)?;
    link_pull(requester);

    let mut body = Vec::new();
    wire::put_rr(&mut body, rr);
    body.push(if is_directory { 0 } else { 1 });
    body.push(0b111);
    let frame = wire::build(
        wire::MacAddress::for_node(rr.node()),
        wire::MacAddress::for_node(net::local_node()),
        wire::MessageTag::Pullrq,
        &body,
    );
    net::transmit(&frame);
    Ok(())
}

/// Re-send PULLRQ for every pull still missing parts, asking only for the
/// parts that haven't arrived yet.
pub(crate) fn retransmit_pending() {
    let pulls = PULLS.lock();
    for pending in pulls.values() {
        let need_mask = !pending.arrived_mask & 0b111;
        if need_mask == 0 {
            continue;
        }
        let mut body = Vec::new();
        wire::put_rr(&mut body, pending.rr);
        body.push(if pending.is_directory { 0 } else { 1 });
        body.push(need_mask);
        let frame = wire::build(
            wire::MacAddress::for_node(pending.rr.node()),
            wire::MacAddress::for_node(net::local_node()),
            wire::MessageTag::Pullrq,
            &body,
        );
        net::transmit(&frame);
    }
}

/// PULLRQ arrived: serve up to three parts of the requested page/directory.
pub fn handle_pullrq(src: wire::MacAddress, body: &[u8]) -> KernelResult<()> {
    let rr = wire::get_rr(body, 0)?;
    let is_directory = *body.get(8).ok_or(KernelError::MalformedFrame)? == 0;
    let need_mask = *body.get(9).ok_or(KernelError::MalformedFrame)?;
    let frame = PhysicalAddress::new(rr.addr()).as_frame();
    let content = if is_directory {
        encode_directory(frame)
    } else {
        pagemap::page_bytes(frame).to_vec()
    };

    for part in 0..3u8 {
        if need_mask & (1 << part) == 0 {
            continue;
        }
        let (start, end) = wire::part_bounds(content.len(), part as usize);
        let mut out = Vec::new();
        wire::put_rr(&mut out, rr);
        out.push(part);
        out.extend_from_slice(&content[start..end]);
        let pkt = wire::build(
            src,
            wire::MacAddress::for_node(net::local_node()),
            wire::MessageTag::Pullrp,
            &out,
        );
        net::transmit(&pkt);
    }
    Ok(())
}

/// PULLRP arrived: record the part; once all three have arrived, translate
/// the assembled content back into local page-map form and wake the
/// requester.
pub fn handle_pullrp(body: &[u8]) -> KernelResult<()> {
    let rr = wire::get_rr(body, 0)?;
    let part = *body.get(8).ok_or(KernelError::MalformedFrame)? as usize;
    if part >= 3 {
        return Err(KernelError::MalformedFrame);
    }
    let data = &body[9..];

    let mut pulls = PULLS.lock();
    let pending = match pulls.get_mut(&rr.raw()) {
        Some(p) => p,
        None => return Ok(()),
    };
    if pending.parts[part].is_some() {
        return Ok(());
    }
    pending.parts[part] = Some(data.to_vec());
    pending.arrived_mask |= 1 << part;
    if pending.arrived_mask != 0b111 {
        return Ok(());
    }

    let mut content = Vec::new();
    for p in pending.parts.iter() {
        content.extend_from_slice(p.as_ref().expect("all three parts present"));
    }
    let target = pending.target;
    let requester = pending.requester;
    let is_directory = pending.is_directory;
    pulls.remove(&rr.raw());
    drop(pulls);

    match target {
        PullTarget::WholeTable(dst) => decode_directory_into(dst, &content)?,
        PullTarget::Slot { parent, index, is_leaf } => {
            if is_leaf {
                let fresh = pagemap::alloc_page_zeroed()?;
                let mut page = [0u8; FRAME_SIZE];
                page.copy_from_slice(&content);
                pagemap::with_page_mut(fresh, |p| *p = page);
                pagemap::set_leaf_entry(
                    parent,
                    index,
                    Entry::Present {
                        frame: fresh,
                        writable: false,
                        perm: PtePerm::from_bits_truncate(rr.perms() as u8),
                    },
                );
            } else {
                let fresh = pagemap::alloc_table_zeroed()?;
                decode_directory_into(fresh, &content)?;
                pagemap::set_leaf_entry(
                    parent,
                    index,
                    Entry::Present {
                        frame: fresh,
                        writable: true,
                        perm: PtePerm::READ | PtePerm::WRITE,
                    },
                );
            }
            let _ = is_directory;
        }
    }

    unlink_pull(requester)?;
    sched::proc_ready(requester)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::frame::ensure_test_frames;
    use crate::mm::pagemap::{insert, USERLO};
    use alloc::boxed::Box;

    fn spawn() -> ProcessId {
        ensure_test_frames();
        let root = pagemap::new_root(pagemap::build_kernel_template().unwrap()).unwrap();
        pcb::alloc(None, root).unwrap()
    }

    #[test]
    fn remote_slot_pull_round_trip_installs_leaf() {
        net::init(1, 2, Box::new(net::NullSink));
        let server_root = pagemap::new_root(pagemap::build_kernel_template().unwrap()).unwrap();
        let data = pagemap::alloc_page_zeroed().unwrap();
        pagemap::with_page_mut(data, |p| p[0] = 0x42);
        insert(server_root, data, USERLO, PtePerm::READ).unwrap();

        let rr = RemoteRef::new(1, data.as_addr().as_u64(), PtePerm::READ.bits() as u16);
        let requester = spawn();
        let parent = pagemap::alloc_table_zeroed().unwrap();

        request(rr, requester, PullTarget::Slot { parent, index: 5, is_leaf: true }).unwrap();
        assert_eq!(pcb::with_pcb(requester, |p| p.state).unwrap(), ProcState::Pull);

        let mut rq_body = Vec::new();
        wire::put_rr(&mut rq_body, rr);
        rq_body.push(1);
        rq_body.push(0b111);
        handle_pullrq(wire::MacAddress::for_node(2), &rq_body).unwrap();

        assert_eq!(pcb::with_pcb(requester, |p| p.state).unwrap(), ProcState::Ready);
        match pagemap::table_entry(parent, 5) {
            Entry::Present { frame, .. } => {
                assert_eq!(pagemap::page_bytes(frame)[0], 0x42);
            }
            other => panic!("expected present leaf, got {:?}", other),
        }
    }

    #[test]
    fn duplicate_pullrp_part_is_discarded() {
        net::init(1, 2, Box::new(net::NullSink));
        let requester = spawn();
        let parent = pagemap::alloc_table_zeroed().unwrap();
        let rr = RemoteRef::new(2, FrameNumber::new(42).as_addr().as_u64(), PtePerm::READ.bits() as u16);
        request(rr, requester, PullTarget::Slot { parent, index: 0, is_leaf: true }).unwrap();

        let mut body = Vec::new();
        wire::put_rr(&mut body, rr);
        body.push(0);
        body.extend_from_slice(&[1u8; 1366]);
        handle_pullrp(&body).unwrap();
        // Same part again, different content: must not overwrite.
        let mut dup = Vec::new();
        wire::put_rr(&mut dup, rr);
        dup.push(0);
        dup.extend_from_slice(&[9u8; 1366]);
        handle_pullrp(&dup).unwrap();

        assert_eq!(pulls_first_byte(rr), 1);
    }

    fn pulls_first_byte(rr: RemoteRef) -> u8 {
        let pulls = PULLS.lock();
        pulls.get(&rr.raw()).unwrap().parts[0].as_ref().unwrap()[0]
    }
}
