//! IPC Space - Per-task IPC capability namespace
//!
//! Based on Mach4 ipc/ipc_space.h
//! Every task has an IPC space containing its port capabilities.
//! The space manages a table of IpcEntry records.
//!
//! The table lock is the space lock. It is always taken before any port
//! lock; port destruction, which needs the opposite order, only tries it.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::{Mutex, MutexGuard};

use super::entry::{
    IpcEntryTable, IpcObject, MachPortName, MachPortType, RightKind, IPC_ENTRY_TABLE_MAX,
    IPC_ENTRY_TABLE_MIN,
};
use super::message::MsgTypeName;
use super::port::PortRef;
use super::pset::PsetRef;
use super::right::{self, Deferred};
use super::{IpcError, IpcResult};
use crate::mach_vm::{AnonymousMap, VmMap};
use crate::types::SpaceId;

// ============================================================================
// Configuration
// ============================================================================

/// Entry table sizing for a new space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcSpaceConfig {
    /// Entries allocated up front
    pub initial_size: usize,
    /// Hard limit; allocation past it fails with `NoSpace`
    pub max_entries: usize,
}

impl IpcSpaceConfig {
    pub const fn new() -> Self {
        Self {
            initial_size: IPC_ENTRY_TABLE_MIN,
            max_entries: IPC_ENTRY_TABLE_MAX,
        }
    }

    pub const fn initial_size(mut self, initial_size: usize) -> Self {
        self.initial_size = initial_size;
        self
    }

    pub const fn max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }
}

impl Default for IpcSpaceConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Entry Snapshot
// ============================================================================

/// What a name denotes at the moment of lookup
#[derive(Debug, Clone)]
pub struct EntryStatus {
    pub name: MachPortName,
    pub rights: MachPortType,
    pub kind: RightKind,
    /// User references (receive, send-once and port-set rights report one)
    pub urefs: u32,
    pub port: Option<PortRef>,
    pub pset: Option<PsetRef>,
    /// A dead-name request is registered
    pub has_request: bool,
}

// ============================================================================
// IPC Space - Per-task capability namespace
// ============================================================================

/// IPC Space - contains all port capabilities for a task
///
/// From Mach4 ipc_space.h:
/// - is_active: is the space alive?
/// - is_table: array of entries
#[derive(Debug)]
pub struct IpcSpace {
    /// Unique space identifier
    id: SpaceId,

    /// Handle given to ports that must reach back into this space
    this: Weak<IpcSpace>,

    active: AtomicBool,

    /// Entry table (the space lock)
    table: Mutex<IpcEntryTable>,

    /// Address space out-of-line memory moves in and out of
    vm_map: Arc<dyn VmMap>,
}

impl IpcSpace {
    /// Create a new IPC space with default sizing and a private address space
    pub fn new() -> Arc<Self> {
        Self::with_config(IpcSpaceConfig::default())
    }

    pub fn with_config(config: IpcSpaceConfig) -> Arc<Self> {
        Self::with_map(config, Arc::new(AnonymousMap::new()))
    }

    /// Create a space whose out-of-line transfers use `vm_map`
    pub fn with_map(config: IpcSpaceConfig, vm_map: Arc<dyn VmMap>) -> Arc<Self> {
        let space = Arc::new_cyclic(|this| Self {
            id: SpaceId::new(),
            this: this.clone(),
            active: AtomicBool::new(true),
            table: Mutex::new(IpcEntryTable::new(config.initial_size, config.max_entries)),
            vm_map,
        });
        log::debug!("ipc_space: {:?} created", space.id);
        space
    }

    /// Get space ID
    #[inline]
    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub(crate) fn weak(&self) -> Weak<IpcSpace> {
        self.this.clone()
    }

    /// Address space of the task owning this space
    pub fn vm_map(&self) -> &Arc<dyn VmMap> {
        &self.vm_map
    }

    /// Check if space is active
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Lock the table of a live space
    pub(crate) fn lock_table(&self) -> IpcResult<MutexGuard<'_, IpcEntryTable>> {
        let table = self.table.lock();
        if !self.is_active() {
            return Err(IpcError::SpaceDead);
        }
        Ok(table)
    }

    /// Lock the table only if nobody holds it
    pub(crate) fn try_lock_table(&self) -> Option<MutexGuard<'_, IpcEntryTable>> {
        self.table.try_lock()
    }

    /// Look up a name. A right whose port has died is turned into a dead
    /// name first.
    pub fn lookup(&self, name: MachPortName) -> IpcResult<EntryStatus> {
        let mut deferred = Deferred::new();
        let mut table = self.lock_table()?;
        right::ipc_right_check(&mut table, name, &mut deferred);
        let entry = table.lookup(name)?;
        Ok(EntryStatus {
            name,
            rights: entry.rights(),
            kind: entry.kind(),
            urefs: entry.user_refs(),
            port: entry.port().cloned(),
            pset: entry.pset().cloned(),
            has_request: entry.request().is_some(),
        })
    }

    /// Name under which this space holds send or receive rights for `port`
    pub fn reverse_lookup(&self, port: &PortRef) -> Option<MachPortName> {
        self.lock_table().ok()?.reverse_lookup(port)
    }

    /// Names of every entry, after converting rights to dead ports
    pub fn names(&self) -> IpcResult<Vec<MachPortName>> {
        let mut deferred = Deferred::new();
        let mut table = self.lock_table()?;
        for name in table.names() {
            right::ipc_right_check(&mut table, name, &mut deferred);
        }
        Ok(table.names())
    }

    /// Get number of active entries
    pub fn entry_count(&self) -> u32 {
        self.table.lock().active_count()
    }

    /// Current table size
    pub fn table_size(&self) -> usize {
        self.table.lock().size()
    }

    /// Destroy the space: every entry's right is released as if deallocated.
    /// Receive rights destroy their ports, send-once rights produce
    /// send-once notifications and dead-name requests report port-deleted.
    /// Calling it again does nothing.
    pub fn destroy(&self) {
        let mut deferred = Deferred::new();
        let entries = {
            let mut table = self.table.lock();
            if !self.active.swap(false, Ordering::AcqRel) {
                return;
            }
            table.drain()
        };
        log::debug!("ipc_space: {:?} destroyed ({} entries)", self.id, entries.len());

        for (name, mut entry) in entries {
            let rights = entry.rights();
            let request = entry.take_request();
            match entry.object().cloned() {
                Some(IpcObject::Port(port)) => {
                    if request.is_some() {
                        port.cancel_dnrequest(self.id, name);
                    }
                    if rights.contains(MachPortType::SEND) {
                        deferred.release(port.clone(), MsgTypeName::PORT_SEND);
                    }
                    if rights.contains(MachPortType::SEND_ONCE) {
                        deferred.release(port.clone(), MsgTypeName::PORT_SEND_ONCE);
                    }
                    if rights.contains(MachPortType::RECEIVE) {
                        port.lock().receiver = None;
                        deferred.destroy_port(port);
                    }
                }
                Some(IpcObject::PortSet(pset)) => deferred.destroy_pset(pset),
                None => {}
            }
            deferred.port_deleted(request, name);
        }
    }
}

impl Drop for IpcSpace {
    fn drop(&mut self) {
        if self.is_active() {
            self.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::port::ipc_port_alloc_default;
    use crate::ipc::port_ops::{mach_port_allocate, mach_port_insert_right};
    use crate::ipc::entry::MachPortRight;

    #[test]
    fn test_space_creation() {
        let space = IpcSpace::new();
        assert!(space.is_active());
        assert_eq!(space.entry_count(), 0);
        assert_eq!(space.table_size(), IPC_ENTRY_TABLE_MIN);
        assert_ne!(space.id(), IpcSpace::new().id());
    }

    #[test]
    fn test_lookup_snapshot() {
        let space = IpcSpace::new();
        let name = mach_port_allocate(&space, MachPortRight::Receive).unwrap();
        let entry = space.lookup(name).unwrap();
        assert_eq!(entry.kind, RightKind::ReceiveRight);
        assert_eq!(entry.urefs, 1);
        let port = entry.port.unwrap();
        assert_eq!(space.reverse_lookup(&port), Some(name));
        assert_eq!(space.lookup(name + 1).err(), Some(IpcError::InvalidName));
    }

    #[test]
    fn test_destroy_kills_receive_rights() {
        let space = IpcSpace::new();
        let other = IpcSpace::new();
        let (name, port) = ipc_port_alloc_default(&space).unwrap();
        let send = mach_port_insert_right(&other, &port, MsgTypeName::MakeSend).unwrap();

        space.destroy();
        space.destroy();
        assert!(!space.is_active());
        assert!(port.is_dead());
        assert_eq!(space.lookup(name).err(), Some(IpcError::SpaceDead));

        // The holder sees a dead name on its next look
        assert_eq!(other.lookup(send).unwrap().kind, RightKind::DeadName);
        assert_eq!(port.send_right_count(), 0);
    }

    #[test]
    fn test_destroy_releases_send_rights() {
        let owner = IpcSpace::new();
        let (_, port) = ipc_port_alloc_default(&owner).unwrap();
        let holder = IpcSpace::new();
        mach_port_insert_right(&holder, &port, MsgTypeName::MakeSend).unwrap();
        assert_eq!(port.send_right_count(), 1);
        holder.destroy();
        assert_eq!(port.send_right_count(), 0);
        assert!(port.is_active());
    }

    #[test]
    fn test_dropping_space_destroys_it() {
        let (port, weak) = {
            let space = IpcSpace::new();
            let (_, port) = ipc_port_alloc_default(&space).unwrap();
            (port, Arc::downgrade(&space))
        };
        assert!(weak.upgrade().is_none());
        assert!(port.is_dead());
    }
}
