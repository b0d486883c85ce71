//! Mach-style Inter-Process Communication
//!
//! This is the core of the microkernel - all communication happens through ports.
//!
//! Lock order is space before port before port-set-member scan; the only
//! inverted path (port destruction converting holder entries) uses try-lock
//! and retries.

use thiserror::Error;

pub mod entry;
pub mod ipc_hash;
pub mod kmsg;
pub mod mach_msg;
pub mod message;
pub mod mqueue;
pub mod notify;
pub mod port;
pub mod port_ops;
pub mod pset;
pub mod right;
pub mod space;

pub use entry::{MachPortName, MachPortType, RightKind};
pub use port::{Port, PortRef};
pub use pset::{PortSet, PsetRef};
pub use space::{IpcSpace, IpcSpaceConfig};

/// The null port name
pub const MACH_PORT_NULL: MachPortName = 0;

/// The dead port name (a right whose port is gone)
pub const MACH_PORT_DEAD: MachPortName = !0;

/// Is `name` neither NULL nor DEAD?
#[inline]
pub const fn mach_port_valid(name: MachPortName) -> bool {
    name != MACH_PORT_NULL && name != MACH_PORT_DEAD
}

// ============================================================================
// Kernel Return Codes (from Mach4 kern_return.h)
// ============================================================================

/// Kernel return code
pub type KernReturn = i32;

pub const KERN_SUCCESS: KernReturn = 0;
pub const KERN_NO_SPACE: KernReturn = 3;
pub const KERN_NOT_RECEIVER: KernReturn = 7;
pub const KERN_ALREADY_IN_SET: KernReturn = 11;
pub const KERN_NOT_IN_SET: KernReturn = 12;
pub const KERN_NAME_EXISTS: KernReturn = 13;
pub const KERN_INVALID_NAME: KernReturn = 15;
pub const KERN_INVALID_TASK: KernReturn = 16;
pub const KERN_INVALID_RIGHT: KernReturn = 17;
pub const KERN_INVALID_VALUE: KernReturn = 18;
pub const KERN_UREFS_OVERFLOW: KernReturn = 19;
pub const KERN_INVALID_CAPABILITY: KernReturn = 20;

// ============================================================================
// Errors
// ============================================================================

/// IPC error types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IpcError {
    /// Name does not denote a right in the space
    #[error("invalid port name")]
    InvalidName,
    /// Name denotes a right of the wrong kind for the operation
    #[error("invalid right for operation")]
    InvalidRight,
    /// Make-send/make-send-once attempted without the receive right
    #[error("caller does not hold the receive right")]
    NotOwner,
    /// Entry table exhausted
    #[error("no space in IPC space")]
    NoSpace,
    /// User reference count would exceed its limit
    #[error("user reference overflow")]
    UrefsOverflow,
    /// Bad delta, limit, or other numeric argument
    #[error("invalid value")]
    InvalidValue,
    /// The port was destroyed
    #[error("port is dead")]
    PortDied,
    /// The chosen name is already in use
    #[error("name already exists")]
    NameExists,
    /// Operation on a port that is not a valid capability here
    #[error("invalid capability")]
    InvalidCapability,
    /// The space has been destroyed
    #[error("IPC space is dead")]
    SpaceDead,
    /// Port is already a member of a port set
    #[error("port already in a set")]
    AlreadyInSet,
    /// Port is not a member of the named set
    #[error("port not in set")]
    NotInSet,
}

impl IpcError {
    /// Mach kernel return code for this error
    pub fn kern_return(self) -> KernReturn {
        match self {
            IpcError::InvalidName => KERN_INVALID_NAME,
            IpcError::InvalidRight => KERN_INVALID_RIGHT,
            IpcError::NotOwner => KERN_NOT_RECEIVER,
            IpcError::NoSpace => KERN_NO_SPACE,
            IpcError::UrefsOverflow => KERN_UREFS_OVERFLOW,
            IpcError::InvalidValue => KERN_INVALID_VALUE,
            IpcError::PortDied => KERN_INVALID_CAPABILITY,
            IpcError::NameExists => KERN_NAME_EXISTS,
            IpcError::InvalidCapability => KERN_INVALID_CAPABILITY,
            IpcError::SpaceDead => KERN_INVALID_TASK,
            IpcError::AlreadyInSet => KERN_ALREADY_IN_SET,
            IpcError::NotInSet => KERN_NOT_IN_SET,
        }
    }
}

/// Result type for IPC operations
pub type IpcResult<T> = Result<T, IpcError>;

/// Convert an IPC result into a kernel return code
pub fn kern_return<T>(result: &IpcResult<T>) -> KernReturn {
    match result {
        Ok(_) => KERN_SUCCESS,
        Err(e) => e.kern_return(),
    }
}
