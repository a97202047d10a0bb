//! Process control block and its arena.
//!
//! A PCB is identified by the physical frame address it was allocated at --
//! there is no separate integer process-id space. Parent/child links,
//! scheduler queues, and the net lists are all expressed as `ProcessId`
//! handles stored inline in the PCB, per the indexed-handle design note
//! (no pointer cycles).

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::label::LabelState;
use crate::mm::frame::{FrameNumber, FRAMES};
use crate::net::rr::RemoteRef;

pub const MAX_CHILDREN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Stop,
    Ready,
    Run,
    Wait,
    Block,
    Migr,
    Away,
    Pull,
    Send,
    Recv,
}

/// Stand-in for the architecture's saved register file. Real field layout
/// is arch-specific and assumed; this just needs to round-trip.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapFrame {
    pub regs: [u64; 16],
    pub pc: u64,
    pub sp: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Pff {
    pub used_fpu: bool,
    pub reexec: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MigrationInfo {
    pub home: RemoteRef,
    pub pulling_from: RemoteRef,
    pub dst_node: u8,
    pub arrived_mask: u8,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MessageInfo {
    pub mid: u64,
    pub peer_mid: u64,
    pub src_va: u64,
    pub dst_va: u64,
    pub size: u64,
}

/// A process handle: the frame its PCB lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProcessId(FrameNumber);

impl ProcessId {
    pub fn frame(self) -> FrameNumber {
        self.0
    }

    /// Reconstruct a handle from a frame number recovered from a side table
    /// (e.g. the net module's mid table, which only stores `u64`s).
    pub(crate) fn from_frame(frame: FrameNumber) -> Self {
        Self(frame)
    }
}

pub struct Pcb {
    pub parent: Option<ProcessId>,
    pub children: [Option<ProcessId>; MAX_CHILDREN],
    pub state: ProcState,
    pub trap_frame: TrapFrame,
    pub pff: Pff,
    pub root: FrameNumber,
    pub snapshot_root: Option<FrameNumber>,
    pub labels: LabelState,
    pub wait_proc: Option<ProcessId>,
    pub pacing_deadline: Option<u64>,
    pub migration: Option<MigrationInfo>,
    pub message: Option<MessageInfo>,
    pub ready_next: Option<ProcessId>,
    pub pacing_next: Option<ProcessId>,
    pub migr_next: Option<ProcessId>,
    pub pull_next: Option<ProcessId>,
    pub remote_next: Option<ProcessId>,
}

impl Pcb {
    fn new(parent: Option<ProcessId>, root: FrameNumber) -> Self {
        Self {
            parent,
            children: [None; MAX_CHILDREN],
            state: ProcState::Stop,
            trap_frame: TrapFrame::default(),
            pff: Pff::default(),
            root,
            snapshot_root: None,
            labels: LabelState::new(),
            wait_proc: None,
            pacing_deadline: None,
            migration: None,
            message: None,
            ready_next: None,
            pacing_next: None,
            migr_next: None,
            pull_next: None,
            remote_next: None,
        }
    }
}

static PROCS: Mutex<BTreeMap<u64, Box<Mutex<Pcb>>>> = Mutex::new(BTreeMap::new());

/// Allocate a fresh PCB in `STOP`, owned by `parent` (`None` for the root
/// process), with `root` as its working page-map root.
pub fn alloc(parent: Option<ProcessId>, root: FrameNumber) -> KernelResult<ProcessId> {
    let frame = FRAMES.alloc()?;
    PROCS
        .lock()
        .insert(frame.as_u64(), Box::new(Mutex::new(Pcb::new(parent, root))));
    let child = ProcessId(frame);
    if let Some(parent) = parent {
        attach_child(parent, child)?;
    }
    Ok(child)
}

fn attach_child(parent: ProcessId, child: ProcessId) -> KernelResult<()> {
    with_pcb(parent, |p| {
        let slot = p
            .children
            .iter()
            .position(|c| c.is_none())
            .ok_or(KernelError::InvalidArgument { name: "child_slots_exhausted" })?;
        p.children[slot] = Some(child);
        Ok(())
    })?
}

fn not_found(pid: ProcessId) -> KernelError {
    KernelError::ProcessNotFound {
        pid: pid.frame().as_u64() as u32,
    }
}

/// Run `f` against the PCB named by `pid`, holding its per-PCB lock for the
/// duration.
pub fn with_pcb<R>(pid: ProcessId, f: impl FnOnce(&mut Pcb) -> R) -> KernelResult<R> {
    let table = PROCS.lock();
    let cell = table.get(&pid.frame().as_u64()).ok_or_else(|| not_found(pid))?;
    Ok(f(&mut cell.lock()))
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::frame::ensure_test_frames;

    fn root() -> FrameNumber {
        ensure_test_frames();
        FRAMES.alloc().unwrap()
    }

    #[test]
    fn alloc_starts_in_stop() {
        let pid = alloc(None, root()).unwrap();
        let state = with_pcb(pid, |p| p.state).unwrap();
        assert_eq!(state, ProcState::Stop);
    }

    #[test]
    fn child_slot_is_stable_and_matches_parent_field() {
        let parent = alloc(None, root()).unwrap();
        let child = alloc(Some(parent), root()).unwrap();
        let recorded_parent = with_pcb(child, |p| p.parent).unwrap();
        assert_eq!(recorded_parent, Some(parent));
        let slot = with_pcb(parent, |p| p.children.iter().position(|c| *c == Some(child))).unwrap();
        assert!(slot.is_some());
    }

    #[test]
    fn unknown_pid_is_process_not_found() {
        let bogus = ProcessId(FrameNumber::new(999_999));
        assert!(matches!(with_pcb(bogus, |_| ()), Err(KernelError::ProcessNotFound { .. })));
    }
}
