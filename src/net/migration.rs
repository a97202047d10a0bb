//! Process migration: `net_migrate` on the source, MIGRQ/MIGRP handling on
//! both ends.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::mm::frame::FrameNumber;
use crate::mm::pagemap;
use crate::net::rr::RemoteRef;
use crate::net::{self, wire, NET_LISTS};
use crate::process::pcb::{self, ProcState, ProcessId};

/// home-RR -> PCB, so a second MIGRQ for an already-known home is
/// recognized as a duplicate (boundary: a second MIGRQ after the first has
/// advanced past `AWAY` is discarded; this table does not distinguish
/// phases past that point, so any repeat is dropped).
static HOME_TABLE: Mutex<BTreeMap<u64, ProcessId>> = Mutex::new(BTreeMap::new());

fn home_rr(pid: ProcessId) -> RemoteRef {
    RemoteRef::new(net::local_node(), pid.frame().as_addr().as_u64(), 0)
}

fn link_migr(pid: ProcessId) {
    let mut lists = NET_LISTS.lock();
    let _ = pcb::with_pcb(pid, |p| p.migr_next = lists.migr);
    lists.migr = Some(pid);
}

fn unlink_migr(pid: ProcessId) -> KernelResult<()> {
    let mut lists = NET_LISTS.lock();
    let mut cursor = lists.migr;
    let mut prev: Option<ProcessId> = None;
    while let Some(cur) = cursor {
        let next = pcb::with_pcb(cur, |p| p.migr_next)?;
        if cur == pid {
            match prev {
                Some(p) => pcb::with_pcb(p, |pc| pc.migr_next = next)?,
                None => lists.migr = next,
            }
            return Ok(());
        }
        prev = Some(cur);
        cursor = next;
    }
    Ok(())
}

/// Start migrating `pid` to `dst_node`: save its trap frame, move it to
/// `MIGR`, link it on the migrating list, and transmit MIGRQ.
pub fn net_migrate(pid: ProcessId, dst_node: u8) -> KernelResult<()> {
    wire::check_node(dst_node, net::node_count())?;
    let (home, root, trap_frame) = pcb::with_pcb(pid, |p| {
        p.state = ProcState::Migr;
        if p.migration.is_none() {
            p.migration = Some(Default::default());
        }
        let home = if p.migration.unwrap().home.is_none() {
            home_rr(pid)
        } else {
            p.migration.unwrap().home
        };
        let info = p.migration.as_mut().unwrap();
        info.home = home;
        info.dst_node = dst_node;
        (home, p.root, p.trap_frame)
    })?;
    HOME_TABLE.lock().insert(home.raw(), pid);
    link_migr(pid);

    let root_rr = RemoteRef::new(net::local_node(), root.as_addr().as_u64(), 0);
    let mut body = Vec::new();
    wire::put_rr(&mut body, home);
    wire::put_rr(&mut body, root_rr);
    for reg in trap_frame.regs {
        wire::put_u64(&mut body, reg);
    }
    wire::put_u64(&mut body, trap_frame.pc);
    wire::put_u64(&mut body, trap_frame.sp);

    let frame = wire::build(
        wire::MacAddress::for_node(dst_node),
        wire::MacAddress::for_node(net::local_node()),
        wire::MessageTag::Migrq,
        &body,
    );
    net::transmit(&frame);
    Ok(())
}

/// Re-send MIGRQ for every process still `MIGR`, in case the first one
/// was lost or the destination hadn't come up yet.
pub(crate) fn retransmit_pending() {
    let mut cursor = NET_LISTS.lock().migr;
    while let Some(pid) = cursor {
        let next = pcb::with_pcb(pid, |p| p.migr_next).ok().flatten();
        if let Ok((Some(migration), root, trap_frame)) = pcb::with_pcb(pid, |p| (p.migration, p.root, p.trap_frame)) {
            let root_rr = RemoteRef::new(net::local_node(), root.as_addr().as_u64(), 0);
            let mut body = Vec::new();
            wire::put_rr(&mut body, migration.home);
            wire::put_rr(&mut body, root_rr);
            for reg in trap_frame.regs {
                wire::put_u64(&mut body, reg);
            }
            wire::put_u64(&mut body, trap_frame.pc);
            wire::put_u64(&mut body, trap_frame.sp);
            let frame = wire::build(
                wire::MacAddress::for_node(migration.dst_node),
                wire::MacAddress::for_node(net::local_node()),
                wire::MessageTag::Migrq,
                &body,
            );
            net::transmit(&frame);
        }
        cursor = next;
    }
}

/// MIGRQ arrived: adopt the process if its home isn't already known here,
/// ack with MIGRP, and kick off a pull of its page-map root.
pub fn handle_migrq(src: wire::MacAddress, body: &[u8]) -> KernelResult<()> {
    let home = wire::get_rr(body, 0)?;
    let root_rr = wire::get_rr(body, 8)?;
    let mut regs = [0u64; 16];
    let mut off = 16;
    for r in regs.iter_mut() {
        *r = wire::get_u64(body, off)?;
        off += 8;
    }
    let pc = wire::get_u64(body, off)?;
    let sp = wire::get_u64(body, off + 8)?;

    if HOME_TABLE.lock().contains_key(&home.raw()) {
        crate::println!("[net] duplicate MIGRQ for home {:#x} dropped", home.raw());
        return Ok(());
    }

    let new_root = pagemap::alloc_table_zeroed()?;
    let pid = pcb::alloc(None, new_root)?;
    pcb::with_pcb(pid, |p| {
        p.state = ProcState::Away;
        p.trap_frame.regs = regs;
        p.trap_frame.pc = pc;
        p.trap_frame.sp = sp;
        let mut info = crate::process::pcb::MigrationInfo::default();
        info.home = home;
        info.pulling_from = root_rr;
        p.migration = Some(info);
    })?;
    HOME_TABLE.lock().insert(home.raw(), pid);

    let mut ack = Vec::new();
    wire::put_rr(&mut ack, home);
    let frame = wire::build(
        src,
        wire::MacAddress::for_node(net::local_node()),
        wire::MessageTag::Migrp,
        &ack,
    );
    net::transmit(&frame);

    crate::net::pull::request(root_rr, pid, crate::net::pull::PullTarget::WholeTable(new_root))
}

/// MIGRP arrived on the source: the process is now confirmed `AWAY` on the
/// destination, drop it from the migrating list here.
pub fn handle_migrp(body: &[u8]) -> KernelResult<()> {
    let home = wire::get_rr(body, 0)?;
    let pid = match HOME_TABLE.lock().get(&home.raw()).copied() {
        Some(pid) => pid,
        None => return Err(KernelError::ProcessNotFound { pid: 0 }),
    };
    pcb::with_pcb(pid, |p| p.state = ProcState::Away)?;
    unlink_migr(pid)
}
