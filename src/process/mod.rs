//! Process control: the PCB arena, the ready-queue scheduler, and
//! parent/child/message rendezvous.

pub mod pcb;
pub mod sched;
pub mod wait;

pub use pcb::{Pcb, ProcessId};
