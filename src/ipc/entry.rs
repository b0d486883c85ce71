//! IPC Entry - Port name to capability translation
//!
//! Based on Mach4 ipc/ipc_entry.h
//! Each ipc_entry records a capability (port right) in a task's IPC space.
//! Entries are stored in a table indexed by port name.
//!
//! A name is `index | generation << 24`. Freeing an entry bumps its
//! generation, so a stale name never resolves to a later occupant of the
//! same slot.

use alloc::vec::Vec;
use bitflags::bitflags;

use super::ipc_hash::IpcHash;
use super::port::{PortRef, SendOnceRight};
use super::pset::PsetRef;
use super::{IpcError, IpcResult, MACH_PORT_DEAD, MACH_PORT_NULL};

/// Port name type - the user-visible handle to a port capability
pub type MachPortName = u32;

/// Port index - position in the entry table
pub type MachPortIndex = u32;

/// Entry bits field type
pub type IpcEntryBits = u32;

// ============================================================================
// Entry Bits Constants (from Mach4 ipc_entry.h)
// ============================================================================

/// Mask for user references (16 bits)
pub const IE_BITS_UREFS_MASK: u32 = 0x0000_FFFF;

/// Mask for capability type (5 bits)
pub const IE_BITS_TYPE_MASK: u32 = 0x001F_0000;

/// Mask for generation number (8 bits)
pub const IE_BITS_GEN_MASK: u32 = 0xFF00_0000;

/// One generation increment
pub const IE_BITS_GEN_ONE: u32 = 0x0100_0000;

/// Largest user reference count an entry can carry
pub const MACH_PORT_UREFS_MAX: u32 = IE_BITS_UREFS_MASK;

/// Extract the table index from a name
#[inline]
pub const fn mach_port_index(name: MachPortName) -> MachPortIndex {
    name & !IE_BITS_GEN_MASK
}

/// Extract the generation bits from a name
#[inline]
pub const fn mach_port_gen(name: MachPortName) -> u32 {
    name & IE_BITS_GEN_MASK
}

/// Compose a name from an index and generation bits
#[inline]
pub const fn mach_port_make(index: MachPortIndex, gen: u32) -> MachPortName {
    (index & !IE_BITS_GEN_MASK) | (gen & IE_BITS_GEN_MASK)
}

// ============================================================================
// Port Right Types (shifted into IE_BITS_TYPE position)
// ============================================================================

bitflags! {
    /// Rights held under one name (from Mach4 mach/port.h)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MachPortType: u32 {
        /// Send right
        const SEND = 0x0001_0000;
        /// Receive right
        const RECEIVE = 0x0002_0000;
        /// Send-once right
        const SEND_ONCE = 0x0004_0000;
        /// Port set
        const PORT_SET = 0x0008_0000;
        /// Dead name (port was destroyed)
        const DEAD_NAME = 0x0010_0000;
        /// A dead-name request is registered (reported by mach_port_type only)
        const DNREQUEST = 0x8000_0000;

        const SEND_RECEIVE = Self::SEND.bits() | Self::RECEIVE.bits();
        const SEND_RIGHTS = Self::SEND.bits() | Self::SEND_ONCE.bits();
        const PORT_RIGHTS = Self::SEND_RIGHTS.bits() | Self::RECEIVE.bits();
        const PORT_OR_DEAD = Self::PORT_RIGHTS.bits() | Self::DEAD_NAME.bits();
        const ALL_RIGHTS = Self::PORT_OR_DEAD.bits() | Self::PORT_SET.bits();
    }
}

/// Right selector for mach_port_* calls (from Mach4 mach/port.h)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MachPortRight {
    Send = 0,
    Receive = 1,
    SendOnce = 2,
    PortSet = 3,
    DeadName = 4,
}

impl MachPortRight {
    pub fn from_u32(val: u32) -> Option<Self> {
        match val {
            0 => Some(Self::Send),
            1 => Some(Self::Receive),
            2 => Some(Self::SendOnce),
            3 => Some(Self::PortSet),
            4 => Some(Self::DeadName),
            _ => None,
        }
    }

    /// Type bit for this right
    pub fn port_type(self) -> MachPortType {
        match self {
            Self::Send => MachPortType::SEND,
            Self::Receive => MachPortType::RECEIVE,
            Self::SendOnce => MachPortType::SEND_ONCE,
            Self::PortSet => MachPortType::PORT_SET,
            Self::DeadName => MachPortType::DEAD_NAME,
        }
    }
}

/// The dominant right held by an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RightKind {
    Unused,
    SendRight,
    ReceiveRight,
    SendOnceRight,
    PortSetRight,
    DeadName,
}

// ============================================================================
// IPC Object - Generic reference to port or port set
// ============================================================================

/// Reference to an IPC object (port or port set)
#[derive(Debug, Clone)]
pub enum IpcObject {
    /// Port reference
    Port(PortRef),
    /// Port set reference
    PortSet(PsetRef),
}

impl IpcObject {
    /// Try to get as a port reference
    pub fn as_port(&self) -> Option<&PortRef> {
        match self {
            IpcObject::Port(p) => Some(p),
            IpcObject::PortSet(_) => None,
        }
    }

    /// Try to get as a port set reference
    pub fn as_pset(&self) -> Option<&PsetRef> {
        match self {
            IpcObject::PortSet(s) => Some(s),
            IpcObject::Port(_) => None,
        }
    }
}

// ============================================================================
// IPC Entry - A single capability record
// ============================================================================

/// IPC Entry - records a single capability in a task's IPC space
///
/// From Mach4:
/// - ie_bits: type, urefs, generation
/// - ie_object: the actual port/port set
/// - ie_next/ie_request: free list link or dead-name request
///
/// `urefs` counts send and dead-name references; a send-once entry carries
/// exactly one, receive-only and port-set entries carry none.
#[derive(Debug, Default)]
pub struct IpcEntry {
    /// Capability bits: generation | type | urefs
    bits: IpcEntryBits,

    /// The IPC object this entry refers to
    object: Option<IpcObject>,

    /// For free entries: next free index
    next_free: MachPortIndex,

    /// Send-once right that receives the dead-name notification
    request: Option<SendOnceRight>,
}

impl IpcEntry {
    /// Create a free entry pointing to next free index
    fn new_free(next_free: MachPortIndex, generation: u32) -> Self {
        Self {
            bits: generation & IE_BITS_GEN_MASK,
            object: None,
            next_free,
            request: None,
        }
    }

    /// Check if this entry is free (no capability)
    #[inline]
    pub fn is_free(&self) -> bool {
        self.bits & IE_BITS_TYPE_MASK == 0
    }

    /// Rights held under this entry's name
    #[inline]
    pub fn rights(&self) -> MachPortType {
        MachPortType::from_bits_truncate(self.bits & IE_BITS_TYPE_MASK)
    }

    /// Rights as reported by `mach_port_type`
    pub fn port_type(&self) -> MachPortType {
        let mut ty = self.rights();
        if self.request.is_some() {
            ty |= MachPortType::DNREQUEST;
        }
        ty
    }

    /// The dominant right held under this name
    pub fn kind(&self) -> RightKind {
        let rights = self.rights();
        if rights.contains(MachPortType::DEAD_NAME) {
            RightKind::DeadName
        } else if rights.contains(MachPortType::PORT_SET) {
            RightKind::PortSetRight
        } else if rights.contains(MachPortType::SEND_ONCE) {
            RightKind::SendOnceRight
        } else if rights.contains(MachPortType::RECEIVE) {
            RightKind::ReceiveRight
        } else if rights.contains(MachPortType::SEND) {
            RightKind::SendRight
        } else {
            RightKind::Unused
        }
    }

    /// Raw send/dead-name user reference count
    #[inline]
    pub fn urefs(&self) -> u32 {
        self.bits & IE_BITS_UREFS_MASK
    }

    /// User references as seen by callers: receive, send-once and port-set
    /// entries always report one.
    pub fn user_refs(&self) -> u32 {
        match self.urefs() {
            0 if !self.is_free() => 1,
            n => n,
        }
    }

    /// Get generation bits
    #[inline]
    pub fn generation(&self) -> u32 {
        self.bits & IE_BITS_GEN_MASK
    }

    /// Get the IPC object
    pub fn object(&self) -> Option<&IpcObject> {
        self.object.as_ref()
    }

    /// Port behind a port right, if any
    pub fn port(&self) -> Option<&PortRef> {
        self.object.as_ref().and_then(IpcObject::as_port)
    }

    /// Port set behind a port-set right, if any
    pub fn pset(&self) -> Option<&PsetRef> {
        self.object.as_ref().and_then(IpcObject::as_pset)
    }

    /// Registered dead-name request
    pub fn request(&self) -> Option<&SendOnceRight> {
        self.request.as_ref()
    }

    pub(crate) fn take_request(&mut self) -> Option<SendOnceRight> {
        self.request.take()
    }

    pub(crate) fn set_request(&mut self, notify: Option<SendOnceRight>) -> Option<SendOnceRight> {
        core::mem::replace(&mut self.request, notify)
    }

    /// Replace type and user references, keeping object and generation
    pub(crate) fn set_rights(&mut self, rights: MachPortType, urefs: u32) {
        debug_assert!(urefs <= MACH_PORT_UREFS_MAX);
        self.bits = self.generation()
            | (rights.bits() & IE_BITS_TYPE_MASK)
            | (urefs & IE_BITS_UREFS_MASK);
    }

    /// Add user references
    pub(crate) fn add_urefs(&mut self, delta: u32) -> IpcResult<()> {
        let urefs = self
            .urefs()
            .checked_add(delta)
            .filter(|n| *n <= MACH_PORT_UREFS_MAX)
            .ok_or(IpcError::UrefsOverflow)?;
        self.set_rights(self.rights(), urefs);
        Ok(())
    }

    /// Remove user references, returns true when none remain
    pub(crate) fn remove_urefs(&mut self, delta: u32) -> IpcResult<bool> {
        let urefs = self
            .urefs()
            .checked_sub(delta)
            .ok_or(IpcError::InvalidValue)?;
        self.set_rights(self.rights(), urefs);
        Ok(urefs == 0)
    }

    /// Check if entry has send right
    #[inline]
    pub fn has_send(&self) -> bool {
        self.rights().contains(MachPortType::SEND)
    }

    /// Check if entry has receive right
    #[inline]
    pub fn has_receive(&self) -> bool {
        self.rights().contains(MachPortType::RECEIVE)
    }

    /// Check if entry has send-once right
    #[inline]
    pub fn has_send_once(&self) -> bool {
        self.rights().contains(MachPortType::SEND_ONCE)
    }

    /// Check if entry is a dead name
    #[inline]
    pub fn is_dead_name(&self) -> bool {
        self.rights().contains(MachPortType::DEAD_NAME)
    }

    /// Does this entry take part in the reverse hash?
    fn is_hashed(&self) -> bool {
        self.rights().intersects(MachPortType::SEND_RECEIVE) && self.port().is_some()
    }
}

// ============================================================================
// Entry Table - Dynamic array of entries
// ============================================================================

/// Initial table size (number of entries)
pub const IPC_ENTRY_TABLE_MIN: usize = 16;

/// Maximum table size
pub const IPC_ENTRY_TABLE_MAX: usize = 65536;

/// Entries added each time the table grows
pub const IPC_ENTRY_GROW_CHUNK: usize = 64;

/// Entry table with free list management
///
/// Index 0 is reserved so that no name collides with `MACH_PORT_NULL`.
#[derive(Debug)]
pub struct IpcEntryTable {
    /// The entries array
    entries: Vec<IpcEntry>,

    /// Index of first free entry (0 = free list empty)
    free_head: MachPortIndex,

    /// Number of active (non-free) entries
    active_count: u32,

    /// Hard limit on table size
    max_entries: usize,

    /// Port -> name reverse index
    hash: IpcHash,
}

impl IpcEntryTable {
    /// Create a new entry table
    pub fn new(initial_size: usize, max_entries: usize) -> Self {
        let max_entries = max_entries.clamp(2, IPC_ENTRY_TABLE_MAX);
        let size = initial_size.clamp(2, max_entries);
        let mut table = Self {
            entries: Vec::with_capacity(size),
            free_head: 0,
            active_count: 0,
            max_entries,
            hash: IpcHash::new(),
        };
        table.entries.push(IpcEntry::new_free(0, 0));
        table.extend_to(size);
        table
    }

    /// Get table size
    #[inline]
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Get number of active entries
    #[inline]
    pub fn active_count(&self) -> u32 {
        self.active_count
    }

    /// Entries that can still be allocated, counting growth
    pub fn free_capacity(&self) -> usize {
        self.max_entries - 1 - self.active_count as usize
    }

    fn slot(&self, name: MachPortName) -> IpcResult<usize> {
        if name == MACH_PORT_NULL || name == MACH_PORT_DEAD {
            return Err(IpcError::InvalidName);
        }
        let index = mach_port_index(name) as usize;
        let entry = self.entries.get(index).ok_or(IpcError::InvalidName)?;
        if index == 0 || entry.is_free() || entry.generation() != mach_port_gen(name) {
            return Err(IpcError::InvalidName);
        }
        Ok(index)
    }

    /// Look up an entry by name (index + exact generation check)
    pub fn lookup(&self, name: MachPortName) -> IpcResult<&IpcEntry> {
        self.slot(name).map(|index| &self.entries[index])
    }

    /// Look up an entry mutably
    ///
    /// Callers must not add or drop send/receive rights through this handle
    /// in a way that creates or removes the entry's reverse-hash record; use
    /// [`IpcEntryTable::dealloc`] and [`IpcEntryTable::make_dead_name`].
    pub(crate) fn lookup_mut(&mut self, name: MachPortName) -> IpcResult<&mut IpcEntry> {
        let index = self.slot(name)?;
        Ok(&mut self.entries[index])
    }

    /// Name holding send or receive rights for a port
    pub fn reverse_lookup(&mut self, port: &PortRef) -> Option<MachPortName> {
        self.hash.lookup(port.id())
    }

    /// Allocate a new entry holding `rights`
    pub fn alloc(
        &mut self,
        rights: MachPortType,
        urefs: u32,
        object: IpcObject,
    ) -> IpcResult<MachPortName> {
        self.alloc_entry(rights, urefs, Some(object))
    }

    /// Allocate a dead name with `urefs` references
    pub fn alloc_dead_name(&mut self, urefs: u32) -> IpcResult<MachPortName> {
        self.alloc_entry(MachPortType::DEAD_NAME, urefs, None)
    }

    fn alloc_entry(
        &mut self,
        rights: MachPortType,
        urefs: u32,
        object: Option<IpcObject>,
    ) -> IpcResult<MachPortName> {
        if self.free_head == 0 {
            self.grow()?;
        }
        let index = self.free_head;
        self.free_head = self.entries[index as usize].next_free;
        Ok(self.install(index, None, rights, urefs, object))
    }

    /// Allocate a new entry with a specific name
    pub fn alloc_name(
        &mut self,
        name: MachPortName,
        rights: MachPortType,
        urefs: u32,
        object: IpcObject,
    ) -> IpcResult<()> {
        self.alloc_name_entry(name, rights, urefs, Some(object))
    }

    /// Allocate a dead name under a specific name
    pub fn alloc_name_dead(&mut self, name: MachPortName, urefs: u32) -> IpcResult<()> {
        self.alloc_name_entry(name, MachPortType::DEAD_NAME, urefs, None)
    }

    fn alloc_name_entry(
        &mut self,
        name: MachPortName,
        rights: MachPortType,
        urefs: u32,
        object: Option<IpcObject>,
    ) -> IpcResult<()> {
        if name == MACH_PORT_NULL || name == MACH_PORT_DEAD {
            return Err(IpcError::InvalidValue);
        }
        let index = mach_port_index(name);
        if index as usize >= self.max_entries {
            return Err(IpcError::NoSpace);
        }
        while index as usize >= self.entries.len() {
            self.grow()?;
        }
        if !self.entries[index as usize].is_free() {
            return Err(IpcError::NameExists);
        }
        self.unlink_free(index);
        self.install(index, Some(mach_port_gen(name)), rights, urefs, object);
        Ok(())
    }

    /// Can `name` be reinstated? True when its slot is free and has been
    /// freed exactly once since `name` was valid.
    pub(crate) fn is_reclaimable(&self, name: MachPortName) -> bool {
        let index = mach_port_index(name) as usize;
        match self.entries.get(index) {
            Some(entry) if index != 0 && entry.is_free() => {
                entry.generation() == mach_port_gen(name).wrapping_add(IE_BITS_GEN_ONE)
            }
            _ => false,
        }
    }

    fn install(
        &mut self,
        index: MachPortIndex,
        gen: Option<u32>,
        rights: MachPortType,
        urefs: u32,
        object: Option<IpcObject>,
    ) -> MachPortName {
        let entry = &mut self.entries[index as usize];
        if let Some(gen) = gen {
            entry.bits = gen;
        }
        entry.object = object;
        entry.request = None;
        entry.next_free = 0;
        entry.set_rights(rights, urefs);
        let name = mach_port_make(index, entry.generation());
        if entry.is_hashed() {
            if let Some(port) = entry.port() {
                self.hash.insert(port.id(), name);
            }
        }
        self.active_count += 1;
        name
    }

    fn unlink_free(&mut self, index: MachPortIndex) {
        if self.free_head == index {
            self.free_head = self.entries[index as usize].next_free;
            return;
        }
        let mut prev = self.free_head;
        while prev != 0 {
            let next = self.entries[prev as usize].next_free;
            if next == index {
                self.entries[prev as usize].next_free = self.entries[index as usize].next_free;
                return;
            }
            prev = next;
        }
    }

    /// Deallocate an entry, returning what it held
    pub fn dealloc(&mut self, name: MachPortName) -> IpcResult<IpcEntry> {
        let index = self.slot(name)?;
        let entry = &mut self.entries[index];
        if entry.is_hashed() {
            if let Some(port) = entry.port() {
                self.hash.delete(port.id());
            }
        }
        let next_gen = entry.generation().wrapping_add(IE_BITS_GEN_ONE);
        let old = core::mem::replace(entry, IpcEntry::new_free(self.free_head, next_gen));
        self.free_head = index as MachPortIndex;
        self.active_count -= 1;
        Ok(old)
    }

    /// Turn a port right into a dead name, returning the port it named
    pub(crate) fn make_dead_name(&mut self, name: MachPortName, urefs: u32) -> IpcResult<PortRef> {
        let index = self.slot(name)?;
        let entry = &mut self.entries[index];
        let port = match entry.object.take() {
            Some(IpcObject::Port(port)) => port,
            other => {
                entry.object = other;
                return Err(IpcError::InvalidRight);
            }
        };
        if self.hash.lookup(port.id()) == Some(name) {
            self.hash.delete(port.id());
        }
        entry.set_rights(MachPortType::DEAD_NAME, urefs.clamp(1, MACH_PORT_UREFS_MAX));
        Ok(port)
    }

    /// Grow the table by a fixed chunk; existing names are unaffected
    pub fn grow(&mut self) -> IpcResult<()> {
        let old_size = self.entries.len();
        let new_size = (old_size + IPC_ENTRY_GROW_CHUNK).min(self.max_entries);
        if new_size == old_size {
            return Err(IpcError::NoSpace);
        }
        self.extend_to(new_size);
        log::debug!("ipc_entry: table grown {} -> {}", old_size, new_size);
        Ok(())
    }

    fn extend_to(&mut self, new_size: usize) {
        let old_size = self.entries.len();
        for i in old_size..new_size {
            let next = if i + 1 < new_size {
                (i + 1) as MachPortIndex
            } else {
                self.free_head
            };
            self.entries.push(IpcEntry::new_free(next, 0));
        }
        if new_size > old_size {
            self.free_head = old_size as MachPortIndex;
        }
    }

    /// Iterate over active entries with their names
    pub fn iter(&self) -> impl Iterator<Item = (MachPortName, &IpcEntry)> {
        self.entries
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, e)| !e.is_free())
            .map(|(i, e)| (mach_port_make(i as MachPortIndex, e.generation()), e))
    }

    /// Names of all active entries
    pub fn names(&self) -> Vec<MachPortName> {
        self.iter().map(|(name, _)| name).collect()
    }

    /// Empty the table, returning every active entry
    pub(crate) fn drain(&mut self) -> Vec<(MachPortName, IpcEntry)> {
        let names = self.names();
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            if let Ok(entry) = self.dealloc(name) {
                out.push((name, entry));
            }
        }
        self.hash.clear();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::port::Port;

    fn send_entry(table: &mut IpcEntryTable, port: &PortRef) -> MachPortName {
        table
            .alloc(MachPortType::SEND, 1, IpcObject::Port(port.clone()))
            .unwrap()
    }

    #[test]
    fn test_name_layout() {
        let name = mach_port_make(5, 3 * IE_BITS_GEN_ONE);
        assert_eq!(mach_port_index(name), 5);
        assert_eq!(mach_port_gen(name), 3 * IE_BITS_GEN_ONE);
        assert_ne!(name, MACH_PORT_NULL);
    }

    #[test]
    fn test_entry_alloc_dealloc() {
        let mut table = IpcEntryTable::new(IPC_ENTRY_TABLE_MIN, IPC_ENTRY_TABLE_MAX);
        let port = Port::new(1);
        let name = send_entry(&mut table, &port);
        assert_ne!(name, MACH_PORT_NULL);
        assert_eq!(table.active_count(), 1);
        assert_eq!(table.lookup(name).unwrap().kind(), RightKind::SendRight);
        assert_eq!(table.reverse_lookup(&port), Some(name));

        let old = table.dealloc(name).unwrap();
        assert!(old.port().is_some());
        assert_eq!(table.active_count(), 0);
        assert_eq!(table.lookup(name).err(), Some(IpcError::InvalidName));
        assert_eq!(table.reverse_lookup(&port), None);
    }

    #[test]
    fn test_stale_name_rejected() {
        let mut table = IpcEntryTable::new(4, 64);
        let port = Port::new(1);
        let first = send_entry(&mut table, &port);
        table.dealloc(first).unwrap();
        let second = send_entry(&mut table, &port);

        // Same slot, new generation
        assert_eq!(mach_port_index(first), mach_port_index(second));
        assert_ne!(first, second);
        assert!(table.lookup(first).is_err());
        assert!(table.lookup(second).is_ok());
    }

    #[test]
    fn test_urefs() {
        let mut entry = IpcEntry::default();
        entry.set_rights(MachPortType::SEND, 1);
        entry.add_urefs(2).unwrap();
        assert_eq!(entry.urefs(), 3);
        assert_eq!(entry.add_urefs(MACH_PORT_UREFS_MAX), Err(IpcError::UrefsOverflow));
        assert!(!entry.remove_urefs(2).unwrap());
        assert!(entry.remove_urefs(1).unwrap());
        assert_eq!(entry.remove_urefs(1), Err(IpcError::InvalidValue));
    }

    #[test]
    fn test_grow_preserves_names() {
        let mut table = IpcEntryTable::new(4, 1024);
        let port = Port::new(1);
        let mut names = Vec::new();
        for _ in 0..100 {
            let p = Port::new(1);
            names.push(send_entry(&mut table, &p));
        }
        names.push(send_entry(&mut table, &port));
        assert!(table.size() > 100);
        for name in &names {
            assert!(table.lookup(*name).is_ok());
        }
    }

    #[test]
    fn test_table_exhaustion() {
        let mut table = IpcEntryTable::new(2, 4);
        let ports: Vec<_> = (0..4).map(|_| Port::new(1)).collect();
        for p in &ports[..3] {
            send_entry(&mut table, p);
        }
        assert_eq!(table.free_capacity(), 0);
        assert_eq!(
            table.alloc(MachPortType::SEND, 1, IpcObject::Port(ports[3].clone())),
            Err(IpcError::NoSpace)
        );
    }

    #[test]
    fn test_alloc_name_and_reclaim() {
        let mut table = IpcEntryTable::new(16, 256);
        let port = Port::new(1);
        let name = mach_port_make(40, 7 * IE_BITS_GEN_ONE);
        table
            .alloc_name(name, MachPortType::RECEIVE, 0, IpcObject::Port(port.clone()))
            .unwrap();
        assert_eq!(table.lookup(name).unwrap().user_refs(), 1);
        assert_eq!(
            table.alloc_name(name, MachPortType::RECEIVE, 0, IpcObject::Port(port.clone())),
            Err(IpcError::NameExists)
        );

        table.dealloc(name).unwrap();
        assert!(table.is_reclaimable(name));
        table
            .alloc_name(name, MachPortType::RECEIVE, 0, IpcObject::Port(port))
            .unwrap();
        assert!(table.lookup(name).is_ok());
    }

    #[test]
    fn test_make_dead_name() {
        let mut table = IpcEntryTable::new(16, 256);
        let port = Port::new(1);
        let name = send_entry(&mut table, &port);
        table.lookup_mut(name).unwrap().add_urefs(2).unwrap();
        let held = table.make_dead_name(name, 3).unwrap();
        assert!(alloc::sync::Arc::ptr_eq(&held, &port));

        let entry = table.lookup(name).unwrap();
        assert_eq!(entry.kind(), RightKind::DeadName);
        assert_eq!(entry.urefs(), 3);
        assert_eq!(table.reverse_lookup(&port), None);
    }
}
