//! System-call decoder and dispatcher.
//!
//! The command word's low four bits select a basic operation; everything
//! above that is flags. This module only owns the decode step and the
//! routing to VM (`crate::mm::pagemap`), PM (`crate::process`), NET
//! (`crate::net::message`) and `crate::label`; it holds no state of its
//! own.
//!
//! Register conventions, carried over unchanged: EAX = command/flags, EDX =
//! child number (low byte) and destination node (next byte up) or, for the
//! `SEND`/`RECV` shapes, a full message id, EBX = process-state save-area
//! pointer, ECX = size (or label-selector for `LABEL`/mid for `MID`), ESI =
//! local address, EDI = child address.

extern crate alloc;

use crate::error::{KernelError, KernelResult};
use crate::label::Tag;
use crate::mm::frame::FrameNumber;
use crate::mm::pagemap::{self, PtePerm};
use crate::net;
use crate::process::pcb::{self, ProcessId, TrapFrame};
use crate::process::{sched, wait};

const OP_MASK: u32 = 0x0000_000f;
const OP_CPUTS: u32 = 0;
const OP_PUT: u32 = 1;
const OP_GET: u32 = 2;
const OP_RET: u32 = 3;
const OP_LABEL: u32 = 6;
const OP_MID: u32 = 7;

const FLAG_START: u32 = 0x0000_0010;
const FLAG_REMOTE: u32 = 0x0000_0020;
const FLAG_REGS: u32 = 0x0000_1000;
const FLAG_FPU: u32 = 0x0000_2000;
const FLAG_MEM: u32 = 0x0000_4000;
const MEMOP_MASK: u32 = 0x0003_0000;
const MEMOP_ZERO: u32 = 0x0001_0000;
const MEMOP_COPY: u32 = 0x0002_0000;
const MEMOP_MERGE: u32 = 0x0003_0000;
const FLAG_SNAP: u32 = 0x0004_0000;
const FLAG_PERM: u32 = 0x0000_0100;
const FLAG_READ: u32 = 0x0000_0200;
const FLAG_WRITE: u32 = 0x0000_0400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemOp {
    None,
    Zero,
    Copy,
    Merge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Cputs,
    Put,
    Get,
    Ret,
    Label,
    Mid,
}

struct Command {
    op: Op,
    start: bool,
    remote: bool,
    regs: bool,
    fpu: bool,
    mem: bool,
    memop: MemOp,
    snap: bool,
    perm: bool,
    read: bool,
    write: bool,
}

fn decode(word: u32) -> KernelResult<Command> {
    let op = match word & OP_MASK {
        OP_CPUTS => Op::Cputs,
        OP_PUT => Op::Put,
        OP_GET => Op::Get,
        OP_RET => Op::Ret,
        OP_LABEL => Op::Label,
        OP_MID => Op::Mid,
        other => return Err(KernelError::UnknownSyscall { nr: other as usize }),
    };
    let memop = match word & MEMOP_MASK {
        0 => MemOp::None,
        MEMOP_ZERO => MemOp::Zero,
        MEMOP_COPY => MemOp::Copy,
        MEMOP_MERGE => MemOp::Merge,
        _ => MemOp::None,
    };
    Ok(Command {
        op,
        start: word & FLAG_START != 0,
        remote: word & FLAG_REMOTE != 0,
        regs: word & FLAG_REGS != 0,
        fpu: word & FLAG_FPU != 0,
        mem: word & FLAG_MEM != 0,
        memop,
        snap: word & FLAG_SNAP != 0,
        perm: word & FLAG_PERM != 0,
        read: word & FLAG_READ != 0,
        write: word & FLAG_WRITE != 0,
    })
}

fn perm_bits(cmd: &Command) -> PtePerm {
    let mut perm = PtePerm::empty();
    if cmd.read {
        perm |= PtePerm::READ;
    }
    if cmd.write {
        perm |= PtePerm::WRITE;
    }
    perm
}

/// Register slots, named after the convention above rather than `eax`..`edi`
/// so the field a given op actually reads is obvious at the call site.
pub struct SyscallArgs {
    pub cmd: u32,
    pub child_or_node: u32,
    pub mid: u64,
    pub state_ptr: u64,
    pub size: u64,
    pub local_va: u64,
    pub child_va: u64,
}

impl SyscallArgs {
    pub fn from_trap_frame(tf: &TrapFrame) -> Self {
        Self {
            cmd: tf.regs[0] as u32,
            child_or_node: tf.regs[3] as u32,
            mid: tf.regs[3],
            state_ptr: tf.regs[1],
            size: tf.regs[2],
            local_va: tf.regs[4],
            child_va: tf.regs[5],
        }
    }

    fn child_index(&self) -> usize {
        (self.child_or_node & 0xff) as usize
    }

    fn dst_node(&self) -> u8 {
        ((self.child_or_node >> 8) & 0xff) as u8
    }
}

/// Resolve a child slot in `parent`'s PCB. A bogus index or an empty slot is
/// a silent no-op per the invalid-argument policy, not a fatal error; the
/// caller maps `Err` straight to "did nothing this trap".
fn resolve_child(parent: ProcessId, args: &SyscallArgs) -> KernelResult<ProcessId> {
    let idx = args.child_index();
    if idx >= pcb::MAX_CHILDREN {
        return Err(KernelError::ProcessNotFound { pid: idx as u32 });
    }
    pcb::with_pcb(parent, |p| p.children[idx])?.ok_or(KernelError::ProcessNotFound { pid: idx as u32 })
}

fn align_check(va: u64, size: u64) -> KernelResult<()> {
    if va < pagemap::USERLO || va.saturating_add(size) > pagemap::USERHI {
        return Err(KernelError::InvalidAddress { addr: va });
    }
    if va % crate::mm::frame::FRAME_SIZE as u64 != 0 || size % crate::mm::frame::FRAME_SIZE as u64 != 0 || size == 0 {
        return Err(KernelError::Unaligned { addr: va });
    }
    Ok(())
}

/// Entry point the trap handler calls once it has decoded a register file
/// into a [`TrapFrame`]. Invalid arguments are absorbed here per the
/// no-op-on-user-error policy; only a kernel-internal failure propagates.
pub fn dispatch(caller: ProcessId, tf: &TrapFrame) -> KernelResult<()> {
    let args = SyscallArgs::from_trap_frame(tf);
    let cmd = match decode(args.cmd) {
        Ok(cmd) => cmd,
        Err(_) => return Ok(()),
    };
    let result = match cmd.op {
        Op::Cputs => handle_cputs(caller, &args),
        Op::Put => handle_put(caller, &cmd, &args),
        Op::Get => handle_get(caller, &cmd, &args),
        Op::Ret => handle_ret(caller, &args),
        Op::Label => handle_label(caller, &args),
        Op::Mid => handle_mid(caller, &args),
    };
    match result {
        Ok(()) => Ok(()),
        Err(KernelError::InvalidAddress { .. })
        | Err(KernelError::Unaligned { .. })
        | Err(KernelError::ProcessNotFound { .. })
        | Err(KernelError::InvalidArgument { .. })
        | Err(KernelError::InvalidState { .. })
        | Err(KernelError::NetUnreachable { .. })
        | Err(KernelError::OutOfMemory) => Ok(()),
        Err(other) => Err(other),
    }
}

fn caller_root(pid: ProcessId) -> KernelResult<FrameNumber> {
    pcb::with_pcb(pid, |p| p.root)
}

fn handle_cputs(caller: ProcessId, args: &SyscallArgs) -> KernelResult<()> {
    const CPUTS_MAX: usize = 256;
    let root = caller_root(caller)?;
    let mut bytes = alloc::vec::Vec::new();
    let base = args.local_va;
    'outer: for page in 0.. {
        let va = base + page * crate::mm::frame::FRAME_SIZE as u64;
        if va >= pagemap::USERHI {
            break;
        }
        let entry = pagemap::peek(root, va)?;
        let page_bytes = match entry {
            pagemap::Entry::Present { frame, .. } => crate::mm::pagemap::page_bytes(frame),
            _ => break,
        };
        for &b in &page_bytes {
            if b == 0 || bytes.len() >= CPUTS_MAX {
                break 'outer;
            }
            bytes.push(b);
        }
    }
    crate::console::cputs(&bytes);
    Ok(())
}

/// PUT: push register state and/or memory into a resident child, optionally
/// starting it.
fn handle_put(caller: ProcessId, cmd: &Command, args: &SyscallArgs) -> KernelResult<()> {
    if cmd.remote {
        return net::message::net_send(caller, 0, args.mid, args.local_va, args.child_va, args.size);
    }
    let child = resolve_child(caller, args)?;
    let parent_root = caller_root(caller)?;
    let child_root = pcb::with_pcb(child, |p| p.root)?;

    if cmd.regs {
        let tf = pcb::with_pcb(caller, |p| p.trap_frame)?;
        pcb::with_pcb(child, |p| {
            p.trap_frame = tf;
            p.pff.used_fpu = cmd.fpu;
        })?;
    }

    if cmd.mem && args.size > 0 {
        align_check(args.local_va, args.size)?;
        match cmd.memop {
            MemOp::Zero => pagemap::remove(child_root, args.child_va, args.size)?,
            MemOp::Copy | MemOp::None => {
                pagemap::copy(parent_root, args.local_va, child_root, args.child_va, args.size)?
            }
            MemOp::Merge => {}
        }
        if cmd.perm {
            pagemap::setperm(child_root, args.child_va, args.size, perm_bits(cmd))?;
        }
    }

    if cmd.snap {
        let snap_root = pagemap::snapshot_root(child_root)?;
        pcb::with_pcb(child, |p| p.snapshot_root = Some(snap_root))?;
    }

    if cmd.start {
        sched::proc_ready(child)?;
    }
    Ok(())
}

/// GET: pull register state and/or memory out of a resident child.
fn handle_get(caller: ProcessId, cmd: &Command, args: &SyscallArgs) -> KernelResult<()> {
    if cmd.remote {
        // GET against a child that has migrated to another node would need
        // to go through the SENDRQ/RECVRQ exchange asynchronously rather
        // than completing inline on this trap; not modeled here.
        return Err(KernelError::NetUnreachable { node: args.dst_node() });
    }
    let child = resolve_child(caller, args)?;
    let parent_root = caller_root(caller)?;
    let child_root = pcb::with_pcb(child, |p| p.root)?;

    if cmd.regs {
        let tf = pcb::with_pcb(child, |p| p.trap_frame)?;
        pcb::with_pcb(caller, |p| p.trap_frame = tf)?;
    }

    if cmd.mem && args.size > 0 {
        align_check(args.local_va, args.size)?;
        match cmd.memop {
            MemOp::Merge => {
                let snapshot_root = pcb::with_pcb(child, |p| p.snapshot_root)?
                    .ok_or(KernelError::InvalidState { expected: "snapshot present", actual: "none" })?;
                pagemap::merge(snapshot_root, child_root, args.child_va, parent_root, args.local_va, args.size)?
            }
            MemOp::Copy | MemOp::None => {
                pagemap::copy(child_root, args.child_va, parent_root, args.local_va, args.size)?
            }
            MemOp::Zero => pagemap::remove(parent_root, args.local_va, args.size)?,
        }
        if cmd.perm {
            pagemap::setperm(parent_root, args.local_va, args.size, perm_bits(cmd))?;
        }
    }
    Ok(())
}

/// RET: with a message id present this is the `sys_recv` sugar (wake on an
/// inbound message); with none, it's a plain return-to-parent.
fn handle_ret(caller: ProcessId, args: &SyscallArgs) -> KernelResult<()> {
    if args.mid != 0 {
        let clearance = pcb::with_pcb(caller, |p| p.labels.clearance())?;
        return net::message::net_recv(caller, args.mid, 0, clearance);
    }
    wait::proc_ret(caller)
}

fn handle_label(caller: ProcessId, args: &SyscallArgs) -> KernelResult<()> {
    let promote = args.state_ptr != 0;
    let selects_clearance = args.size != 0;
    if promote {
        let tag = Tag::from_bits(args.mid as u32);
        pcb::with_pcb(caller, |p| {
            if selects_clearance {
                p.labels.promote_clearance(tag);
            } else {
                p.labels.promote_label(tag);
            }
        })?;
    } else {
        let tag = pcb::with_pcb(caller, |p| {
            if selects_clearance {
                p.labels.clearance()
            } else {
                p.labels.label()
            }
        })?;
        crate::console::cputs(alloc::format!("{:#x}", tag.bits()).as_bytes());
    }
    Ok(())
}

fn handle_mid(caller: ProcessId, args: &SyscallArgs) -> KernelResult<()> {
    if args.mid == u64::MAX {
        net::message::register_mid(caller, args.size)
    } else {
        net::message::unregister_mid(args.mid);
        Ok(())
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::frame::ensure_test_frames;
    use crate::mm::pagemap;

    fn spawn(parent: Option<ProcessId>) -> ProcessId {
        ensure_test_frames();
        let root = pagemap::new_root(pagemap::build_kernel_template().unwrap()).unwrap();
        pcb::alloc(parent, root).unwrap()
    }

    #[test]
    fn decode_rejects_reserved_opcode() {
        assert!(decode(5).is_err());
    }

    #[test]
    fn decode_accepts_put_with_flags() {
        let cmd = decode(OP_PUT | FLAG_START | FLAG_MEM | MEMOP_COPY | FLAG_PERM | FLAG_READ).unwrap();
        assert_eq!(cmd.op, Op::Put);
        assert!(cmd.start);
        assert!(cmd.mem);
        assert_eq!(cmd.memop, MemOp::Copy);
        assert!(cmd.perm);
        assert!(cmd.read);
        assert!(!cmd.write);
    }

    #[test]
    fn put_copy_then_get_copy_round_trips() {
        let parent = spawn(None);
        let child = spawn(Some(parent));
        pcb::with_pcb(parent, |p| p.children[0] = Some(child)).unwrap();

        let va = pagemap::USERLO;
        let parent_root = caller_root(parent).unwrap();
        let frame = pagemap::alloc_page_zeroed().unwrap();
        pagemap::with_page_mut(frame, |page| page[0] = 0x11);
        pagemap::insert(parent_root, frame, va, PtePerm::READ | PtePerm::WRITE).unwrap();

        let mut tf = TrapFrame::default();
        tf.regs[0] = (OP_PUT | FLAG_MEM | MEMOP_COPY) as u64;
        tf.regs[2] = crate::mm::frame::FRAME_SIZE as u64;
        tf.regs[3] = 0;
        tf.regs[4] = va;
        tf.regs[5] = va;
        dispatch(parent, &tf).unwrap();

        let child_root = caller_root(child).unwrap();
        let entry = pagemap::peek(child_root, va).unwrap();
        match entry {
            pagemap::Entry::Present { frame, .. } => {
                assert_eq!(pagemap::page_bytes(frame)[0], 0x11);
            }
            other => panic!("expected present entry, got {:?}", other),
        }
    }

    #[test]
    fn put_snap_then_get_merge_sees_child_write() {
        let parent = spawn(None);
        let child = spawn(Some(parent));
        pcb::with_pcb(parent, |p| p.children[0] = Some(child)).unwrap();

        let va = pagemap::USERLO;
        let parent_root = caller_root(parent).unwrap();
        let frame = pagemap::alloc_page_zeroed().unwrap();
        pagemap::with_page_mut(frame, |page| {
            for b in page.iter_mut() {
                *b = 0x11;
            }
        });
        pagemap::insert(parent_root, frame, va, PtePerm::READ | PtePerm::WRITE).unwrap();

        // PUT(COPY|SNAP): child sees the parent's data, and the child's
        // `snapshot_root` is pinned to what the child looked like right now.
        let mut tf = TrapFrame::default();
        tf.regs[0] = (OP_PUT | FLAG_MEM | MEMOP_COPY | FLAG_SNAP) as u64;
        tf.regs[2] = crate::mm::frame::FRAME_SIZE as u64;
        tf.regs[3] = 0;
        tf.regs[4] = va;
        tf.regs[5] = va;
        dispatch(parent, &tf).unwrap();
        assert!(pcb::with_pcb(child, |p| p.snapshot_root).unwrap().is_some());

        // Simulate the child's own write-fault: bytes 0..7 become 0x22,
        // the rest of the page is untouched.
        let child_root = caller_root(child).unwrap();
        let child_write = pagemap::alloc_page_zeroed().unwrap();
        pagemap::with_page_mut(child_write, |page| {
            for b in page.iter_mut() {
                *b = 0x11;
            }
            page[..7].fill(0x22);
        });
        pagemap::insert(child_root, child_write, va, PtePerm::READ | PtePerm::WRITE).unwrap();

        // GET(MERGE): the parent's region now reads the child's write where
        // it touched, and the original content everywhere else.
        let mut tf = TrapFrame::default();
        tf.regs[0] = (OP_GET | FLAG_MEM | MEMOP_MERGE) as u64;
        tf.regs[2] = crate::mm::frame::FRAME_SIZE as u64;
        tf.regs[3] = 0;
        tf.regs[4] = va;
        tf.regs[5] = va;
        dispatch(parent, &tf).unwrap();

        let merged = match pagemap::peek(parent_root, va).unwrap() {
            pagemap::Entry::Present { frame, .. } => pagemap::page_bytes(frame),
            other => panic!("expected present entry, got {:?}", other),
        };
        assert_eq!(&merged[..7], &[0x22; 7]);
        assert_eq!(merged[7], 0x11);
        assert_eq!(merged[100], 0x11);
    }

    #[test]
    fn put_start_readies_child() {
        let parent = spawn(None);
        let child = spawn(Some(parent));
        pcb::with_pcb(parent, |p| p.children[0] = Some(child)).unwrap();

        let mut tf = TrapFrame::default();
        tf.regs[0] = (OP_PUT | FLAG_START) as u64;
        dispatch(parent, &tf).unwrap();

        assert_eq!(pcb::with_pcb(child, |p| p.state).unwrap(), pcb::ProcState::Ready);
    }

    #[test]
    fn label_promote_then_read_is_monotonic() {
        let pid = spawn(None);
        let mut tf = TrapFrame::default();
        tf.regs[0] = OP_LABEL as u64;
        tf.regs[1] = 1;
        tf.regs[2] = 0;
        tf.regs[3] = 0b101;
        dispatch(pid, &tf).unwrap();
        assert_eq!(pcb::with_pcb(pid, |p| p.labels.label()).unwrap(), Tag::from_bits(0b101));
    }

    #[test]
    fn invalid_address_is_absorbed_as_no_op() {
        let parent = spawn(None);
        let child = spawn(Some(parent));
        pcb::with_pcb(parent, |p| p.children[0] = Some(child)).unwrap();

        let mut tf = TrapFrame::default();
        tf.regs[0] = (OP_PUT | FLAG_MEM | MEMOP_COPY) as u64;
        tf.regs[2] = crate::mm::frame::FRAME_SIZE as u64;
        tf.regs[4] = 1;
        assert!(dispatch(parent, &tf).is_ok());
    }
}
