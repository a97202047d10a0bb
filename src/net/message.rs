//! Labeled cross-node message send/receive: SEND/RECV/FETCH, the mid table,
//! and the waitmap that reconciles a SENDRQ arriving before or after the
//! matching `recv` call.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::hash::FixedHashTable;
use crate::label::Tag;
use crate::mm::frame::{FrameNumber, FRAME_SIZE};
use crate::mm::pagemap::{self, PtePerm};
use crate::net::{self, wire, NetLists, NET_LISTS};
use crate::process::pcb::{self, ProcState, ProcessId};
use crate::process::sched;

const MID_TABLE_CAP: usize = 256;
const WAITMAP_CAP: usize = 256;

static MID_TABLE: FixedHashTable<MID_TABLE_CAP> = FixedHashTable::new();
static WAITMAP: FixedHashTable<WAITMAP_CAP> = FixedHashTable::new();

/// mids whose RECVRQ failed the label check: served with zero bytes
/// instead of real page content until the transfer completes.
static LABEL_FAILED: Mutex<BTreeMap<u64, ()>> = Mutex::new(BTreeMap::new());

fn pair_key(a: u64, b: u64) -> u64 {
    a ^ b.rotate_left(17)
}

/// mids are addressed the same way remote refs are: the top byte names the
/// owning node.
fn owning_node(mid: u64) -> u8 {
    (mid >> 56) as u8
}

fn link_remote(pid: ProcessId, pick: impl Fn(&mut NetLists) -> &mut Option<ProcessId>) -> KernelResult<()> {
    let mut lists = NET_LISTS.lock();
    let old = *pick(&mut lists);
    pcb::with_pcb(pid, |p| p.remote_next = old)?;
    *pick(&mut lists) = Some(pid);
    Ok(())
}

fn unlink_remote(pid: ProcessId, pick: impl Fn(&mut NetLists) -> &mut Option<ProcessId>) -> KernelResult<()> {
    let mut lists = NET_LISTS.lock();
    let mut cursor = *pick(&mut lists);
    let mut prev: Option<ProcessId> = None;
    while let Some(cur) = cursor {
        let next = pcb::with_pcb(cur, |p| p.remote_next)?;
        if cur == pid {
            match prev {
                Some(p) => pcb::with_pcb(p, |pc| pc.remote_next = next)?,
                None => *pick(&mut lists) = next,
            }
            return Ok(());
        }
        prev = Some(cur);
        cursor = next;
    }
    Ok(())
}

fn find_on_list(head: Option<ProcessId>, pred: impl Fn(&mut pcb::Pcb) -> bool) -> KernelResult<Option<ProcessId>> {
    let mut cursor = head;
    while let Some(pid) = cursor {
        let (matches, next) = pcb::with_pcb(pid, |p| (pred(p), p.remote_next))?;
        if matches {
            return Ok(Some(pid));
        }
        cursor = next;
    }
    Ok(None)
}

/// Register `pid`'s message id. A process holds exactly one at a time.
pub fn register_mid(pid: ProcessId, mid: u64) -> KernelResult<()> {
    MID_TABLE
        .insert(mid, pid.frame().as_u64())
        .map_err(|_| KernelError::InvalidArgument { name: "mid_table_full" })
}

pub fn unregister_mid(mid: u64) {
    MID_TABLE.remove(mid);
}

fn lookup_mid(mid: u64) -> Option<ProcessId> {
    MID_TABLE.get(mid).map(FrameNumber::new).map(ProcessId::from_frame)
}

/// `send(src_mid, dst_mid, src_va, dst_va, size)`: park the sender on the
/// send list and transmit SENDRQ to `dst_mid`'s owning node.
pub fn net_send(sender: ProcessId, src_mid: u64, dst_mid: u64, src_va: u64, dst_va: u64, size: u64) -> KernelResult<()> {
    pcb::with_pcb(sender, |p| {
        p.state = ProcState::Send;
        let mut info = pcb::MessageInfo::default();
        info.mid = src_mid;
        info.peer_mid = dst_mid;
        info.src_va = src_va;
        info.dst_va = dst_va;
        info.size = size;
        p.message = Some(info);
    })?;
    link_remote(sender, |l| &mut l.send)?;

    let mut body = Vec::new();
    wire::put_u64(&mut body, src_mid);
    wire::put_u64(&mut body, dst_mid);
    net::transmit(&wire::build(
        wire::MacAddress::for_node(owning_node(dst_mid)),
        wire::MacAddress::for_node(net::local_node()),
        wire::MessageTag::Sendrq,
        &body,
    ));
    Ok(())
}

/// `recv(own_mid, expected_src_mid, clearance)`: either a SENDRQ already
/// arrived (the waitmap has it) and the handshake completes now, or the
/// receiver parks in `BLOCK` until one does.
pub fn net_recv(receiver: ProcessId, own_mid: u64, expected_src_mid: u64, clearance: Tag) -> KernelResult<()> {
    register_mid(receiver, own_mid)?;
    pcb::with_pcb(receiver, |p| {
        let mut info = pcb::MessageInfo::default();
        info.mid = own_mid;
        info.peer_mid = expected_src_mid;
        p.message = Some(info);
        p.state = ProcState::Block;
        p.labels.promote_clearance(clearance);
    })?;
    link_remote(receiver, |l| &mut l.recv)?;

    let key = pair_key(expected_src_mid, own_mid);
    if let Some(sender_node) = WAITMAP.remove(key) {
        complete_rendezvous(receiver, own_mid, expected_src_mid, sender_node as u8, clearance)?;
    }
    Ok(())
}

fn complete_rendezvous(receiver: ProcessId, own_mid: u64, src_mid: u64, sender_node: u8, clearance: Tag) -> KernelResult<()> {
    pcb::with_pcb(receiver, |p| p.state = ProcState::Recv)?;

    let mut sendrp = Vec::new();
    wire::put_u64(&mut sendrp, src_mid);
    wire::put_u64(&mut sendrp, own_mid);
    net::transmit(&wire::build(
        wire::MacAddress::for_node(sender_node),
        wire::MacAddress::for_node(net::local_node()),
        wire::MessageTag::Sendrp,
        &sendrp,
    ));

    let mut recvrq = Vec::new();
    wire::put_u64(&mut recvrq, src_mid);
    wire::put_u64(&mut recvrq, own_mid);
    wire::put_u64(&mut recvrq, clearance.bits() as u64);
    net::transmit(&wire::build(
        wire::MacAddress::for_node(sender_node),
        wire::MacAddress::for_node(net::local_node()),
        wire::MessageTag::Recvrq,
        &recvrq,
    ));
    Ok(())
}

/// Re-send SENDRQ for every still-parked sender and re-issue the
/// in-flight FETCHRQ for every receiver past the RECVRP handshake. The
/// fetch resend always restarts from the transfer's base address rather
/// than tracking exactly which page is outstanding; a page already fully
/// assembled just gets re-fetched and re-written, which is wasteful but
/// harmless.
pub(crate) fn retransmit_pending() {
    let mut cursor = NET_LISTS.lock().send;
    while let Some(pid) = cursor {
        let next = pcb::with_pcb(pid, |p| p.remote_next).ok().flatten();
        if let Ok(Some(info)) = pcb::with_pcb(pid, |p| p.message) {
            let mut body = Vec::new();
            wire::put_u64(&mut body, info.mid);
            wire::put_u64(&mut body, info.peer_mid);
            net::transmit(&wire::build(
                wire::MacAddress::for_node(owning_node(info.peer_mid)),
                wire::MacAddress::for_node(net::local_node()),
                wire::MessageTag::Sendrq,
                &body,
            ));
        }
        cursor = next;
    }

    let mut cursor = NET_LISTS.lock().recv;
    while let Some(pid) = cursor {
        let next = pcb::with_pcb(pid, |p| p.remote_next).ok().flatten();
        if let Ok((ProcState::Recv, Some(info))) = pcb::with_pcb(pid, |p| (p.state, p.message)) {
            let _ = issue_fetchrq(info.peer_mid, info.mid, info.src_va);
        }
        cursor = next;
    }
}

pub fn handle_sendrq(src: wire::MacAddress, body: &[u8]) -> KernelResult<()> {
    let src_mid = wire::get_u64(body, 0)?;
    let dst_mid = wire::get_u64(body, 8)?;

    if let Some(receiver) = lookup_mid(dst_mid) {
        let ready = pcb::with_pcb(receiver, |p| {
            (p.state == ProcState::Block && p.message.is_some_and(|m| m.peer_mid == src_mid)).then_some(p.labels.clearance())
        })?;
        if let Some(clearance) = ready {
            return complete_rendezvous(receiver, dst_mid, src_mid, src.node(), clearance);
        }
    }
    WAITMAP
        .insert(pair_key(src_mid, dst_mid), src.node() as u64)
        .map_err(|_| KernelError::InvalidArgument { name: "waitmap_full" })
}

pub fn handle_sendrp(_body: &[u8]) -> KernelResult<()> {
    // Pure ack; the real decision point is RECVRQ, handled below.
    Ok(())
}

pub fn handle_recvrq(src: wire::MacAddress, body: &[u8]) -> KernelResult<()> {
    let src_mid = wire::get_u64(body, 0)?;
    let dst_mid = wire::get_u64(body, 8)?;
    let clearance_bits = wire::get_u64(body, 16)? as u32;

    let sender = find_on_list(NET_LISTS.lock().send, |p| p.message.is_some_and(|m| m.mid == src_mid && m.peer_mid == dst_mid))?
        .ok_or(KernelError::ProcessNotFound { pid: 0 })?;

    let (sender_label, info) = pcb::with_pcb(sender, |p| (p.labels.label(), p.message.unwrap()))?;
    if !sender_label.leq(Tag::from_bits(clearance_bits)) {
        LABEL_FAILED.lock().insert(src_mid, ());
    }

    let mut recvrp = Vec::new();
    wire::put_u64(&mut recvrp, src_mid);
    wire::put_u64(&mut recvrp, dst_mid);
    wire::put_u64(&mut recvrp, info.src_va);
    wire::put_u64(&mut recvrp, info.dst_va);
    wire::put_u64(&mut recvrp, info.size);
    wire::put_u64(&mut recvrp, sender_label.bits() as u64);
    net::transmit(&wire::build(
        src,
        wire::MacAddress::for_node(net::local_node()),
        wire::MessageTag::Recvrp,
        &recvrp,
    ));
    Ok(())
}

pub fn handle_recvrp(body: &[u8]) -> KernelResult<()> {
    let src_mid = wire::get_u64(body, 0)?;
    let dst_mid = wire::get_u64(body, 8)?;
    let src_va = wire::get_u64(body, 16)?;
    let dst_va = wire::get_u64(body, 24)?;
    let size = wire::get_u64(body, 32)?;

    let receiver = find_on_list(NET_LISTS.lock().recv, |p| p.message.is_some_and(|m| m.mid == dst_mid && m.peer_mid == src_mid))?
        .ok_or(KernelError::ProcessNotFound { pid: 0 })?;

    pcb::with_pcb(receiver, |p| {
        if let Some(info) = p.message.as_mut() {
            info.src_va = src_va;
            info.dst_va = dst_va;
            info.size = size;
        }
    })?;
    issue_fetchrq(src_mid, dst_mid, src_va)
}

fn issue_fetchrq(src_mid: u64, dst_mid: u64, page_va: u64) -> KernelResult<()> {
    let mut body = Vec::new();
    wire::put_u64(&mut body, src_mid);
    wire::put_u64(&mut body, dst_mid);
    wire::put_u64(&mut body, page_va);
    body.push(0b111);
    net::transmit(&wire::build(
        wire::MacAddress::for_node(owning_node(src_mid)),
        wire::MacAddress::for_node(net::local_node()),
        wire::MessageTag::Fetchrq,
        &body,
    ));
    Ok(())
}

pub fn handle_fetchrq(src: wire::MacAddress, body: &[u8]) -> KernelResult<()> {
    let src_mid = wire::get_u64(body, 0)?;
    let dst_mid = wire::get_u64(body, 8)?;
    let src_va = wire::get_u64(body, 16)?;
    let need_mask = *body.get(24).ok_or(KernelError::MalformedFrame)?;

    let sender = find_on_list(NET_LISTS.lock().send, |p| p.message.is_some_and(|m| m.mid == src_mid && m.peer_mid == dst_mid))?;
    let sender = match sender {
        Some(s) => s,
        None => return Ok(()),
    };
    let info = pcb::with_pcb(sender, |p| p.message.unwrap())?;
    let terminator = src_va >= info.src_va + info.size;

    if terminator {
        let mut fin = Vec::new();
        wire::put_u64(&mut fin, src_mid);
        wire::put_u64(&mut fin, dst_mid);
        wire::put_u64(&mut fin, src_va);
        fin.push(0xFF);
        net::transmit(&wire::build(
            src,
            wire::MacAddress::for_node(net::local_node()),
            wire::MessageTag::Fetchrp,
            &fin,
        ));
        unlink_remote(sender, |l| &mut l.send)?;
        LABEL_FAILED.lock().remove(&src_mid);
        return sched::proc_ready(sender);
    }

    let root = pcb::with_pcb(sender, |p| p.root)?;
    let failed = LABEL_FAILED.lock().contains_key(&src_mid);
    let content = if failed { [0u8; FRAME_SIZE] } else { read_source_page(root, src_va)? };

    for part in 0..3u8 {
        if need_mask & (1 << part) == 0 {
            continue;
        }
        let (start, end) = wire::part_bounds(FRAME_SIZE, part as usize);
        let mut out = Vec::new();
        wire::put_u64(&mut out, src_mid);
        wire::put_u64(&mut out, dst_mid);
        wire::put_u64(&mut out, src_va);
        out.push(part);
        out.extend_from_slice(&content[start..end]);
        net::transmit(&wire::build(
            src,
            wire::MacAddress::for_node(net::local_node()),
            wire::MessageTag::Fetchrp,
            &out,
        ));
    }
    Ok(())
}

fn read_source_page(root: FrameNumber, va: u64) -> KernelResult<[u8; FRAME_SIZE]> {
    let (_, _, entry) = pagemap::leaf_entry(root, va)?;
    Ok(match entry {
        pagemap::Entry::Present { frame, .. } => pagemap::page_bytes(frame),
        pagemap::Entry::Zero(_) => [0u8; FRAME_SIZE],
        pagemap::Entry::Remote(rr) => return Err(KernelError::RemoteDenied { rr }),
    })
}

struct FetchAssembly {
    parts: [Option<Vec<u8>>; 3],
    mask: u8,
}

static FETCHES: Mutex<BTreeMap<u64, FetchAssembly>> = Mutex::new(BTreeMap::new());

pub fn handle_fetchrp(body: &[u8]) -> KernelResult<()> {
    let src_mid = wire::get_u64(body, 0)?;
    let dst_mid = wire::get_u64(body, 8)?;
    let src_va = wire::get_u64(body, 16)?;
    let tag = *body.get(24).ok_or(KernelError::MalformedFrame)?;

    let receiver = find_on_list(NET_LISTS.lock().recv, |p| p.message.is_some_and(|m| m.mid == dst_mid && m.peer_mid == src_mid))?
        .ok_or(KernelError::ProcessNotFound { pid: 0 })?;

    if tag == 0xFF {
        unlink_remote(receiver, |l| &mut l.recv)?;
        unregister_mid(dst_mid);
        return sched::proc_ready(receiver);
    }

    let part = tag as usize;
    if part >= 3 {
        return Err(KernelError::MalformedFrame);
    }
    let data = &body[25..];
    let key = pair_key(src_mid, src_va);

    let mut fetches = FETCHES.lock();
    let entry = fetches.entry(key).or_insert_with(|| FetchAssembly { parts: [None, None, None], mask: 0 });
    if entry.parts[part].is_some() {
        return Ok(());
    }
    entry.parts[part] = Some(data.to_vec());
    entry.mask |= 1 << part;
    if entry.mask != 0b111 {
        return Ok(());
    }
    let mut page = [0u8; FRAME_SIZE];
    let mut off = 0;
    for p in entry.parts.iter() {
        let bytes = p.as_ref().unwrap();
        page[off..off + bytes.len()].copy_from_slice(bytes);
        off += bytes.len();
    }
    fetches.remove(&key);
    drop(fetches);

    let (dst_root, dst_va, base_src_va, size) = pcb::with_pcb(receiver, |p| {
        let m = p.message.unwrap();
        (p.root, m.dst_va + (src_va - m.src_va), m.src_va, m.size)
    })?;
    let fresh = pagemap::alloc_page_zeroed()?;
    pagemap::with_page_mut(fresh, |p| *p = page);
    pagemap::insert(dst_root, fresh, dst_va, PtePerm::READ | PtePerm::WRITE)?;

    let next_va = src_va + FRAME_SIZE as u64;
    if next_va < base_src_va + size {
        issue_fetchrq(src_mid, dst_mid, next_va)
    } else {
        issue_fetchrq(src_mid, dst_mid, base_src_va + size)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::frame::ensure_test_frames;
    use crate::mm::pagemap::{insert, peek, USERLO};
    use alloc::boxed::Box;

    fn spawn() -> ProcessId {
        ensure_test_frames();
        let root = pagemap::new_root(pagemap::build_kernel_template().unwrap()).unwrap();
        pcb::alloc(None, root).unwrap()
    }

    fn drive_transfer(sender: ProcessId, receiver: ProcessId, src_mid: u64, dst_mid: u64, clearance: Tag) {
        let node = wire::MacAddress::for_node(1);

        net_send(sender, src_mid, dst_mid, USERLO, USERLO, FRAME_SIZE as u64).unwrap();

        let mut sendrq = Vec::new();
        wire::put_u64(&mut sendrq, src_mid);
        wire::put_u64(&mut sendrq, dst_mid);
        handle_sendrq(node, &sendrq).unwrap();

        net_recv(receiver, dst_mid, src_mid, clearance).unwrap();

        let mut recvrq = Vec::new();
        wire::put_u64(&mut recvrq, src_mid);
        wire::put_u64(&mut recvrq, dst_mid);
        wire::put_u64(&mut recvrq, clearance.bits() as u64);
        handle_recvrq(node, &recvrq).unwrap();

        let mut recvrp = Vec::new();
        wire::put_u64(&mut recvrp, src_mid);
        wire::put_u64(&mut recvrp, dst_mid);
        wire::put_u64(&mut recvrp, USERLO);
        wire::put_u64(&mut recvrp, USERLO);
        wire::put_u64(&mut recvrp, FRAME_SIZE as u64);
        wire::put_u64(&mut recvrp, 0);
        handle_recvrp(&recvrp).unwrap();

        let sender_root = pcb::with_pcb(sender, |p| p.root).unwrap();
        let page = read_source_page(sender_root, USERLO).unwrap();
        for part in 0..3u8 {
            let (start, end) = wire::part_bounds(FRAME_SIZE, part as usize);
            let mut fetchrp = Vec::new();
            wire::put_u64(&mut fetchrp, src_mid);
            wire::put_u64(&mut fetchrp, dst_mid);
            wire::put_u64(&mut fetchrp, USERLO);
            fetchrp.push(part);
            fetchrp.extend_from_slice(&page[start..end]);
            handle_fetchrp(&fetchrp).unwrap();
        }

        let mut fin = Vec::new();
        wire::put_u64(&mut fin, src_mid);
        wire::put_u64(&mut fin, dst_mid);
        wire::put_u64(&mut fin, USERLO + FRAME_SIZE as u64);
        fin.push(0xFF);
        handle_fetchrp(&fin).unwrap();
    }

    #[test]
    fn send_then_recv_transfers_page_when_labels_admit() {
        net::init(1, 1, Box::new(net::NullSink));
        let sender = spawn();
        let receiver = spawn();

        let sender_root = pcb::with_pcb(sender, |p| p.root).unwrap();
        let data = pagemap::alloc_page_zeroed().unwrap();
        pagemap::with_page_mut(data, |p| p[0] = 0x99);
        insert(sender_root, data, USERLO, PtePerm::READ | PtePerm::WRITE).unwrap();

        let src_mid = (1u64 << 56) | 1;
        let dst_mid = (1u64 << 56) | 2;
        drive_transfer(sender, receiver, src_mid, dst_mid, Tag::from_bits(0xFF));

        let receiver_root = pcb::with_pcb(receiver, |p| p.root).unwrap();
        match peek(receiver_root, USERLO).unwrap() {
            pagemap::Entry::Present { frame, .. } => assert_eq!(pagemap::page_bytes(frame)[0], 0x99),
            other => panic!("expected transferred page, got {:?}", other),
        }
        assert_eq!(pcb::with_pcb(receiver, |p| p.state).unwrap(), ProcState::Ready);
    }

    #[test]
    fn recv_before_send_is_found_via_mid_table() {
        net::init(1, 1, Box::new(net::NullSink));
        let sender = spawn();
        let receiver = spawn();
        let src_mid = (1u64 << 56) | 3;
        let dst_mid = (1u64 << 56) | 4;

        net_recv(receiver, dst_mid, src_mid, Tag::from_bits(0xFF)).unwrap();
        assert_eq!(pcb::with_pcb(receiver, |p| p.state).unwrap(), ProcState::Block);

        let node = wire::MacAddress::for_node(1);
        net_send(sender, src_mid, dst_mid, USERLO, USERLO, FRAME_SIZE as u64).unwrap();
        let mut sendrq = Vec::new();
        wire::put_u64(&mut sendrq, src_mid);
        wire::put_u64(&mut sendrq, dst_mid);
        handle_sendrq(node, &sendrq).unwrap();
        assert_eq!(pcb::with_pcb(receiver, |p| p.state).unwrap(), ProcState::Recv);
    }

    #[test]
    fn label_violation_delivers_zero_bytes() {
        net::init(1, 1, Box::new(net::NullSink));
        let sender = spawn();
        let receiver = spawn();
        let sender_root = pcb::with_pcb(sender, |p| p.root).unwrap();
        let data = pagemap::alloc_page_zeroed().unwrap();
        pagemap::with_page_mut(data, |p| p[0] = 0x55);
        insert(sender_root, data, USERLO, PtePerm::READ | PtePerm::WRITE).unwrap();
        pcb::with_pcb(sender, |p| p.labels.promote_label(Tag::from_bits(0b1))).unwrap();

        let src_mid = (1u64 << 56) | 5;
        let dst_mid = (1u64 << 56) | 6;
        drive_transfer(sender, receiver, src_mid, dst_mid, Tag::empty());

        let receiver_root = pcb::with_pcb(receiver, |p| p.root).unwrap();
        match peek(receiver_root, USERLO).unwrap() {
            pagemap::Entry::Present { frame, .. } => assert_eq!(pagemap::page_bytes(frame)[0], 0),
            other => panic!("expected zeroed page, got {:?}", other),
        }
    }
}
