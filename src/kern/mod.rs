//! Kern subsystem - kernel services the IPC core depends on
//!
//! Based on Mach4 kern/ directory
//! Contains the scheduler collaborator interface and kernel-object binding.

pub mod ipc_kobject;
pub mod sched_prim;
#[cfg(feature = "std")]
pub mod std_sched;

pub use ipc_kobject::{ipc_kobject_get, ipc_kobject_set, Kobject, KobjectType, PortKobject};
pub use sched_prim::{Deadline, Scheduler, WaitResult};
#[cfg(feature = "std")]
pub use std_sched::StdScheduler;
