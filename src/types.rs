//! Common types used across the IPC core
//!
//! This module defines shared identifiers to avoid circular dependencies.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Thread identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ThreadId(pub u64);

impl ThreadId {
    /// Create a new thread ID with a unique auto-incremented value
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ThreadId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Unique port identifier
///
/// Ports are compared by identity everywhere in the core; the id is what the
/// reverse index of a space is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PortId(pub u64);

impl PortId {
    /// Generate a new unique port ID with an auto-incremented value
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        PortId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port#{}", self.0)
    }
}

/// Unique port set identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PortSetId(pub u64);

impl PortSetId {
    /// Generate a new unique port set ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        PortSetId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// IPC space identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SpaceId(pub u64);

impl SpaceId {
    /// Generate a new unique space ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        SpaceId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}
