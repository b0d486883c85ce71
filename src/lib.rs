//! Mach_R IPC - the inter-process communication core of Mach_R
//!
//! Every kernel service in Mach_R is addressed through ports. This crate holds
//! the machinery behind that: per-task IPC spaces (capability tables), the
//! ports they name, the reference-counted rights that populate space entries,
//! the `mach_msg` transfer engine that moves typed data, rights and
//! out-of-line memory between spaces, and the notification subsystem that
//! reports right lifecycle events.
//!
//! Scheduling and virtual memory are collaborators consumed through
//! [`kern::sched_prim::Scheduler`] and [`mach_vm::VmMap`].

#![no_std]
// Kernel IPC types carry both a right-set bitmask and a single-right view
#![allow(clippy::new_without_default)]
// Failed sends hand the kernel message back to the caller for rollback
#![allow(clippy::result_large_err)]

// Standard library replacement for no_std
extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

// Core types
pub mod types;

pub mod ipc;
pub mod kern;
pub mod mach_vm;

pub use ipc::entry::{MachPortName, MachPortRight, MachPortType, RightKind};
pub use ipc::mach_msg::{
    mach_msg, mach_msg_receive, mach_msg_rpc, mach_msg_send, MachMsgOption, MachMsgOptions,
    MachMsgReturn, MsgError,
};
pub use ipc::message::{MachMessage, MachMsgHeader, MsgItem, MsgTypeName};
pub use ipc::notify::NotifyType;
pub use ipc::port_ops::{
    mach_port_allocate, mach_port_allocate_name, mach_port_deallocate, mach_port_destroy,
    mach_port_get_attributes, mach_port_get_refs, mach_port_get_set_status,
    mach_port_insert_right, mach_port_mod_refs, mach_port_move_member, mach_port_names,
    mach_port_request_notification, mach_port_set_mscount, mach_port_set_qlimit,
    mach_port_set_seqno, mach_port_type,
};
pub use ipc::space::{IpcSpace, IpcSpaceConfig};
pub use ipc::{IpcError, IpcResult, MACH_PORT_DEAD, MACH_PORT_NULL};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Library name
pub const NAME: &str = "Mach_R IPC";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(NAME, "Mach_R IPC");
        assert!(!VERSION.is_empty());
    }
}
