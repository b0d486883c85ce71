//! IPC Hash Table - Fast object -> name lookup within a space
//!
//! Based on Mach4 ipc/ipc_hash.h/c by Rich Draves (1989)
//!
//! Reverse lookups from ports to the names that hold send or receive rights
//! for them. This is what lets a space hold at most one send/receive name
//! per port: copyout of a send right first asks the hash whether the space
//! already names the port.

use alloc::collections::BTreeMap;

use crate::ipc::entry::MachPortName;
use crate::types::PortId;

// ============================================================================
// Hash Statistics
// ============================================================================

/// Hash table statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct IpcHashStats {
    pub lookups: u64,
    pub hits: u64,
    pub inserts: u64,
    pub deletes: u64,
}

// ============================================================================
// Local Hash
// ============================================================================

/// Per-space reverse index, keyed by port identity
#[derive(Debug, Default)]
pub struct IpcHash {
    map: BTreeMap<PortId, MachPortName>,
    /// Statistics
    pub stats: IpcHashStats,
}

impl IpcHash {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the name holding send/receive rights for `port`
    pub fn lookup(&mut self, port: PortId) -> Option<MachPortName> {
        self.stats.lookups += 1;
        let found = self.map.get(&port).copied();
        if found.is_some() {
            self.stats.hits += 1;
        }
        found
    }

    /// Record that `name` holds send or receive rights for `port`
    pub fn insert(&mut self, port: PortId, name: MachPortName) {
        let previous = self.map.insert(port, name);
        debug_assert!(previous.is_none(), "{} hashed twice", port);
        self.stats.inserts += 1;
    }

    /// Delete entry
    pub fn delete(&mut self, port: PortId) -> Option<MachPortName> {
        let result = self.map.remove(&port);
        if result.is_some() {
            self.stats.deletes += 1;
        }
        result
    }

    /// Get entry count
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}
