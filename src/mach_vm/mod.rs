//! Mach VM - the virtual memory collaborator of the IPC core
//!
//! Based on Mach4 vm/ directory
//! Out-of-line message data moves between address maps as copy objects.

pub mod vm_map;

pub use vm_map::{AnonymousMap, MapError, VmAddress, VmMap, VmMapCopy, PAGE_SIZE};
