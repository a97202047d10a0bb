//! The ready queue: one FIFO, one spinlock, intrusively linked through
//! each PCB's `ready_next` field.
//!
//! Wrapped in a struct (rather than bare free functions over one hardcoded
//! static) so tests can build a private, uncontended instance instead of
//! racing every other test thread touching the real system-wide queue.

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::process::pcb::{self, ProcState, ProcessId};

struct ReadyQueueState {
    head: Option<ProcessId>,
    tail: Option<ProcessId>,
}

pub struct Scheduler {
    state: Mutex<ReadyQueueState>,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(ReadyQueueState { head: None, tail: None }),
        }
    }

    /// Move `pid` to `READY` and append it to the tail of the ready queue.
    pub fn ready(&self, pid: ProcessId) -> KernelResult<()> {
        pcb::with_pcb(pid, |p| {
            p.state = ProcState::Ready;
            p.ready_next = None;
        })?;
        let mut q = self.state.lock();
        match q.tail {
            Some(tail) => pcb::with_pcb(tail, |p| p.ready_next = Some(pid))?,
            None => q.head = Some(pid),
        }
        q.tail = Some(pid);
        Ok(())
    }

    /// Pop the head of the ready queue. The real dispatcher spins with
    /// interrupts alternately enabled/disabled while this is empty; that
    /// spin loop is arch-specific and lives outside this module, which only
    /// ever reports whether a process was available right now.
    pub fn sched(&self) -> KernelResult<ProcessId> {
        let mut q = self.state.lock();
        let head = q.head.ok_or(KernelError::SchedulerEmpty)?;
        let next = pcb::with_pcb(head, |p| p.ready_next)?;
        q.head = next;
        if next.is_none() {
            q.tail = None;
        }
        Ok(head)
    }
}

/// The system-wide ready queue.
pub static SCHEDULER: Scheduler = Scheduler::new();

/// The process most recently handed to [`proc_run`], if any. The timer
/// interrupt handler reads this to know who to preempt.
static CURRENT: Mutex<Option<ProcessId>> = Mutex::new(None);

pub fn proc_ready(pid: ProcessId) -> KernelResult<()> {
    SCHEDULER.ready(pid)
}

pub fn proc_sched() -> KernelResult<ProcessId> {
    SCHEDULER.sched()
}

/// The currently running process, as of the last [`proc_run`] call.
pub fn current() -> Option<ProcessId> {
    *CURRENT.lock()
}

/// Dispatch `pid`: mark it `RUN` and hand back its saved trap frame, root,
/// and whether the trapping instruction should be re-executed. Installing
/// the page-map root and restoring registers is the caller's (arch) job.
pub fn proc_run(pid: ProcessId) -> KernelResult<(crate::mm::frame::FrameNumber, pcb::TrapFrame, bool)> {
    let result = pcb::with_pcb(pid, |p| {
        p.state = ProcState::Run;
        let reexec = p.pff.reexec;
        p.pff.reexec = false;
        (p.root, p.trap_frame, reexec)
    })?;
    *CURRENT.lock() = Some(pid);
    Ok(result)
}

/// Timer-driven preemption point: park the currently running process back
/// onto the ready queue.
pub fn proc_yield(pid: ProcessId) -> KernelResult<()> {
    proc_ready(pid)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::frame::{ensure_test_frames, FRAMES};

    fn spawn() -> ProcessId {
        ensure_test_frames();
        pcb::alloc(None, FRAMES.alloc().unwrap()).unwrap()
    }

    #[test]
    fn fifo_order_then_empty() {
        let scheduler = Scheduler::new();
        let a = spawn();
        let b = spawn();
        let c = spawn();
        scheduler.ready(a).unwrap();
        scheduler.ready(b).unwrap();
        scheduler.ready(c).unwrap();
        assert_eq!(scheduler.sched().unwrap(), a);
        assert_eq!(scheduler.sched().unwrap(), b);
        assert_eq!(scheduler.sched().unwrap(), c);
        assert_eq!(scheduler.sched().unwrap_err(), KernelError::SchedulerEmpty);
    }

    #[test]
    fn proc_run_marks_running_and_clears_reexec() {
        let pid = spawn();
        pcb::with_pcb(pid, |p| p.pff.reexec = true).unwrap();
        let (_, _, reexec) = proc_run(pid).unwrap();
        assert!(reexec);
        let state = pcb::with_pcb(pid, |p| p.state).unwrap();
        assert_eq!(state, ProcState::Run);
        let (_, _, reexec_again) = proc_run(pid).unwrap();
        assert!(!reexec_again);
    }
}
