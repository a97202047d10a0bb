//! Parent/child rendezvous, messaging block/unblock, and the pacing list
//! that backs deterministic (wall-clock-gated) waits.

use spin::Mutex;

use crate::error::KernelResult;
use crate::process::pcb::{self, ProcState, ProcessId};
use crate::process::sched;

/// Park `parent` in `WAIT` on `child`, optionally gated by a wall-clock
/// pacing deadline.
pub fn proc_wait(parent: ProcessId, child: ProcessId, pacing: Option<u64>) -> KernelResult<()> {
    pcb::with_pcb(parent, |p| {
        p.state = ProcState::Wait;
        p.wait_proc = Some(child);
        p.pacing_deadline = pacing;
    })?;
    if pacing.is_some() {
        link_pacing(parent)?;
    }
    Ok(())
}

/// `child` returns to its parent: it stops, and if the parent was waiting
/// specifically on it, the parent is woken.
pub fn proc_ret(child: ProcessId) -> KernelResult<()> {
    let parent = pcb::with_pcb(child, |p| {
        p.state = ProcState::Stop;
        p.parent
    })?;
    if let Some(parent) = parent {
        let waiting_on_us = pcb::with_pcb(parent, |p| p.state == ProcState::Wait && p.wait_proc == Some(child))?;
        if waiting_on_us {
            sched::proc_ready(parent)?;
        }
    }
    Ok(())
}

/// Park `receiver` in `BLOCK`, awaiting a send from `sender`.
pub fn proc_block(sender: ProcessId, receiver: ProcessId) -> KernelResult<()> {
    pcb::with_pcb(receiver, |p| {
        p.state = ProcState::Block;
        p.wait_proc = Some(sender);
    })
}

/// Wake a blocked or waiting process by moving it back onto the ready
/// queue.
pub fn proc_wake(pid: ProcessId) -> KernelResult<()> {
    sched::proc_ready(pid)
}

struct PacingList {
    head: Option<ProcessId>,
}

static PACING: Mutex<PacingList> = Mutex::new(PacingList { head: None });

fn link_pacing(pid: ProcessId) -> KernelResult<()> {
    let mut list = PACING.lock();
    pcb::with_pcb(pid, |p| p.pacing_next = list.head)?;
    list.head = Some(pid);
    Ok(())
}

/// Global timer tick: wake every paced process whose deadline has elapsed,
/// regardless of whether its awaited condition was otherwise satisfied.
pub fn pacing_tick(now: u64) -> KernelResult<()> {
    let mut list = PACING.lock();
    let mut remaining_head = None;
    let mut remaining_tail: Option<ProcessId> = None;
    let mut cursor = list.head;

    while let Some(pid) = cursor {
        let (next, deadline) = pcb::with_pcb(pid, |p| (p.pacing_next, p.pacing_deadline))?;
        cursor = next;
        let elapsed = deadline.is_some_and(|d| now >= d);
        if elapsed {
            pcb::with_pcb(pid, |p| {
                p.pacing_deadline = None;
                p.pacing_next = None;
            })?;
            sched::proc_ready(pid)?;
            continue;
        }
        pcb::with_pcb(pid, |p| p.pacing_next = None)?;
        match remaining_tail {
            Some(tail) => pcb::with_pcb(tail, |p| p.pacing_next = Some(pid))?,
            None => remaining_head = Some(pid),
        }
        remaining_tail = Some(pid);
    }
    list.head = remaining_head;
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::frame::{ensure_test_frames, FRAMES};

    fn spawn(parent: Option<ProcessId>) -> ProcessId {
        ensure_test_frames();
        pcb::alloc(parent, FRAMES.alloc().unwrap()).unwrap()
    }

    #[test]
    fn ret_wakes_waiting_parent() {
        let parent = spawn(None);
        let child = spawn(Some(parent));
        proc_wait(parent, child, None).unwrap();
        assert_eq!(pcb::with_pcb(parent, |p| p.state).unwrap(), ProcState::Wait);

        proc_ret(child).unwrap();
        assert_eq!(pcb::with_pcb(child, |p| p.state).unwrap(), ProcState::Stop);
        assert_eq!(pcb::with_pcb(parent, |p| p.state).unwrap(), ProcState::Ready);
    }

    #[test]
    fn ret_does_not_wake_parent_waiting_on_someone_else() {
        let parent = spawn(None);
        let child_a = spawn(Some(parent));
        let child_b = spawn(Some(parent));
        proc_wait(parent, child_b, None).unwrap();

        proc_ret(child_a).unwrap();
        assert_eq!(pcb::with_pcb(parent, |p| p.state).unwrap(), ProcState::Wait);
    }

    #[test]
    fn pacing_tick_wakes_only_elapsed_deadlines() {
        let parent = spawn(None);
        let child = spawn(Some(parent));
        proc_wait(parent, child, Some(100)).unwrap();

        pacing_tick(50).unwrap();
        assert_eq!(pcb::with_pcb(parent, |p| p.state).unwrap(), ProcState::Wait);

        pacing_tick(100).unwrap();
        assert_eq!(pcb::with_pcb(parent, |p| p.state).unwrap(), ProcState::Ready);
    }

    #[test]
    fn block_then_wake() {
        let sender = spawn(None);
        let receiver = spawn(None);
        proc_block(sender, receiver).unwrap();
        assert_eq!(pcb::with_pcb(receiver, |p| p.state).unwrap(), ProcState::Block);
        proc_wake(receiver).unwrap();
        assert_eq!(pcb::with_pcb(receiver, |p| p.state).unwrap(), ProcState::Ready);
    }
}
