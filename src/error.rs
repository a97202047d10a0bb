//! Unified kernel error type.
//!
//! Every subsystem (frame table, page map, scheduler, wire protocol, label
//! lattice) keeps its own narrow error enum; each converts into
//! [`KernelError`] so the syscall dispatcher can propagate any of them with
//! a single `?`.

use core::fmt;

use crate::mm::frame::FrameError;
use crate::net::rr::RemoteRef;

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Frame table exhausted.
    OutOfMemory,
    /// Frame number outside any registered region, or already free.
    InvalidFrame,
    /// `dec_ref` observed a frame already at refcount zero.
    DoubleFree,
    /// Virtual address outside the process's mappable window.
    InvalidAddress { addr: u64 },
    /// Address not aligned to a page boundary where alignment is required.
    Unaligned { addr: u64 },
    /// Page walk hit a zero (unmapped) entry where a mapping was required.
    Unmapped { addr: u64 },
    /// Access violates the page's nominal or hardware permission bits.
    PermissionDenied { addr: u64 },
    /// No PCB with this process id.
    ProcessNotFound { pid: u32 },
    /// PCB found but not in the state the caller required.
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
    /// `proc_sched` called with an empty ready queue.
    SchedulerEmpty,
    /// A send's label does not flow into the receiver's clearance.
    LabelViolation { sender: u32, clearance: u32 },
    /// No MIGRP/PULLRP/... arrived within the retransmission budget.
    NetTimeout { node: u8 },
    /// Node id not present in the cluster's routing table.
    NetUnreachable { node: u8 },
    /// A remote node rejected a pull or migration request.
    RemoteDenied { rr: RemoteRef },
    /// Frame failed to parse as a well-formed wire message.
    MalformedFrame,
    /// Trap dispatched a syscall number the decoder does not recognize.
    UnknownSyscall { nr: usize },
    /// Argument to a syscall or internal API failed validation.
    InvalidArgument { name: &'static str },
    /// Subsystem accessed before its `init()` ran.
    NotInitialized { subsystem: &'static str },
    /// Caller supplied a buffer too small for the operation.
    BufferTooSmall { required: usize, provided: usize },
    /// Would need to block; caller asked for a non-blocking attempt.
    WouldBlock,
}

pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "frame table exhausted"),
            Self::InvalidFrame => write!(f, "invalid or already-free frame"),
            Self::DoubleFree => write!(f, "frame refcount already zero"),
            Self::InvalidAddress { addr } => write!(f, "invalid address 0x{:x}", addr),
            Self::Unaligned { addr } => write!(f, "address 0x{:x} not page-aligned", addr),
            Self::Unmapped { addr } => write!(f, "no mapping at 0x{:x}", addr),
            Self::PermissionDenied { addr } => {
                write!(f, "permission denied at 0x{:x}", addr)
            }
            Self::ProcessNotFound { pid } => write!(f, "process {} not found", pid),
            Self::InvalidState { expected, actual } => {
                write!(f, "invalid process state: expected {}, got {}", expected, actual)
            }
            Self::SchedulerEmpty => write!(f, "ready queue empty"),
            Self::LabelViolation { sender, clearance } => {
                write!(
                    f,
                    "label {:#06x} does not flow into clearance {:#06x}",
                    sender, clearance
                )
            }
            Self::NetTimeout { node } => write!(f, "timed out waiting on node {}", node),
            Self::NetUnreachable { node } => write!(f, "node {} unreachable", node),
            Self::RemoteDenied { rr } => write!(f, "node {} denied remote reference", rr.node()),
            Self::MalformedFrame => write!(f, "malformed wire frame"),
            Self::UnknownSyscall { nr } => write!(f, "unknown syscall number {}", nr),
            Self::InvalidArgument { name } => write!(f, "invalid argument: {}", name),
            Self::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {}", subsystem)
            }
            Self::BufferTooSmall { required, provided } => {
                write!(f, "buffer too small: need {}, got {}", required, provided)
            }
            Self::WouldBlock => write!(f, "operation would block"),
        }
    }
}

impl From<FrameError> for KernelError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::OutOfMemory => Self::OutOfMemory,
            FrameError::InvalidFrame => Self::InvalidFrame,
            FrameError::DoubleFree => Self::DoubleFree,
        }
    }
}

#[macro_export]
macro_rules! kernel_error {
    (ProcessNotFound { pid: $pid:expr }) => {
        $crate::error::KernelError::ProcessNotFound { pid: $pid }
    };
    (InvalidArgument { $name:expr }) => {
        $crate::error::KernelError::InvalidArgument { name: $name }
    };
    ($variant:ident) => {
        $crate::error::KernelError::$variant
    };
}
