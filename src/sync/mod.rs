//! Locking primitives and the lock-ordering rule every subsystem follows.
//!
//! Every contended piece of kernel state (frame table, ready queue, pacing
//! list, hash tables, per-PCB state, the net lists) is a [`spin::Mutex`].
//! Interrupts are disabled for the duration of any lock hold -- kernel code
//! is never preempted while it holds one.
//!
//! **Lock-ordering rule**: `net_lock -> PCB lock -> ready/pacing`. The
//! send/recv handlers acquire a PCB lock before `net_lock` exactly once (to
//! read the PCB's current mid/state before linking it on a net list);
//! everywhere else net_lock is taken first. The retransmission sweep
//! acquires `net_lock`, then each list entry's PCB lock in turn. Violating
//! this order (taking a PCB lock, then net_lock, from two different call
//! sites) is a deadlock waiting to happen -- there is no deadlock
//! detection, only this documented convention.

pub use spin::{Mutex, MutexGuard, Once};
