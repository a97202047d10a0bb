//! Architecture-specific glue. The core (VM/PM/NET) never references this
//! module directly -- only `lib.rs`'s boot sequence and the panic handler do.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use x86_64::{enable_interrupts, halt, init};
