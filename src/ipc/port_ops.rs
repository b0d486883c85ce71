//! Port Operations - User-callable port manipulation
//!
//! Based on Mach4 ipc/mach_port.c
//!
//! This module provides the user-level operations for port manipulation:
//! - mach_port_allocate: Create new ports, port sets and dead names
//! - mach_port_deallocate: Release a port right
//! - mach_port_destroy: Destroy a port right completely
//! - mach_port_insert_right: Seed a space with a right to a port
//! - mach_port_get_refs: Query reference count
//! - mach_port_mod_refs: Modify reference count
//! - mach_port_request_notification: Dead-name and no-senders requests
//! - mach_port_move_member: Port set membership
//!
//! Every call locks the space once. Ports and port sets that die as a result
//! are destroyed, and notifications are sent, after the lock is dropped.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use super::entry::{IpcEntryTable, IpcObject, MachPortName, MachPortRight, MachPortType};
use super::kmsg::{KmsgObject, KmsgRight, Origin};
use super::message::MsgTypeName;
use super::mqueue::MQUEUE_DEFAULT_LIMIT;
use super::notify::NotifyType;
use super::port::{ipc_port_alloc_default, Port, PortRef, PortStatus, SendOnceRight};
use super::pset::PortSet;
use super::right::{self, Deferred};
use super::space::IpcSpace;
use super::{mach_port_valid, IpcError, IpcResult, MACH_PORT_NULL};

// ============================================================================
// mach_port_allocate - Allocate a new port right
// ============================================================================

/// Allocate a new port right in the task's space
///
/// # Arguments
/// * `space` - IPC space to allocate in
/// * `right` - `Receive` (new port), `PortSet` or `DeadName`
///
/// # Returns
/// The new name
pub fn mach_port_allocate(space: &IpcSpace, right: MachPortRight) -> IpcResult<MachPortName> {
    match right {
        MachPortRight::Receive => ipc_port_alloc_default(space).map(|(name, _)| name),
        MachPortRight::PortSet => {
            let pset = PortSet::new();
            let name = space
                .lock_table()?
                .alloc(MachPortType::PORT_SET, 0, IpcObject::PortSet(pset.clone()))?;
            log::debug!("mach_port: {:?} allocated as {:#x}", pset.id(), name);
            Ok(name)
        }
        MachPortRight::DeadName => space.lock_table()?.alloc_dead_name(1),
        // Send rights are made from a receive right, never allocated
        MachPortRight::Send | MachPortRight::SendOnce => Err(IpcError::InvalidValue),
    }
}

/// Allocate a right under a caller-chosen name
pub fn mach_port_allocate_name(
    space: &IpcSpace,
    right: MachPortRight,
    name: MachPortName,
) -> IpcResult<()> {
    if !mach_port_valid(name) {
        return Err(IpcError::InvalidValue);
    }
    match right {
        MachPortRight::Receive => {
            let port = Port::new(MQUEUE_DEFAULT_LIMIT);
            let mut table = space.lock_table()?;
            table.alloc_name(name, MachPortType::RECEIVE, 0, IpcObject::Port(port.clone()))?;
            port.lock().receiver = Some(space.id());
            Ok(())
        }
        MachPortRight::PortSet => space.lock_table()?.alloc_name(
            name,
            MachPortType::PORT_SET,
            0,
            IpcObject::PortSet(PortSet::new()),
        ),
        MachPortRight::DeadName => space.lock_table()?.alloc_name_dead(name, 1),
        MachPortRight::Send | MachPortRight::SendOnce => Err(IpcError::InvalidValue),
    }
}

// ============================================================================
// mach_port_deallocate / mach_port_destroy
// ============================================================================

/// Deallocate a port right (decrement user reference count)
///
/// Releases one reference of a send right or dead name, or the send-once
/// right. When the count reaches zero the entry is removed from the space.
/// Deallocating `MACH_PORT_NULL` or `MACH_PORT_DEAD` is a no-op.
pub fn mach_port_deallocate(space: &IpcSpace, name: MachPortName) -> IpcResult<()> {
    if !mach_port_valid(name) {
        return Ok(());
    }
    let mut deferred = Deferred::new();
    let mut table = space.lock_table()?;
    right::ipc_right_dealloc(space, &mut table, name, &mut deferred)
}

/// Destroy every right held under `name`
///
/// A receive right destroys the port itself; a port set is torn down.
pub fn mach_port_destroy(space: &IpcSpace, name: MachPortName) -> IpcResult<()> {
    if !mach_port_valid(name) {
        return Ok(());
    }
    let mut deferred = Deferred::new();
    let mut table = space.lock_table()?;
    right::ipc_right_destroy(space, &mut table, name, &mut deferred)
}

// ============================================================================
// Reference Counts
// ============================================================================

/// Modify the user reference count for a port right
///
/// # Arguments
/// * `space` - IPC space containing the right
/// * `name` - Port name
/// * `right` - Type of right to modify
/// * `delta` - Change in reference count (can be negative)
pub fn mach_port_mod_refs(
    space: &IpcSpace,
    name: MachPortName,
    right: MachPortRight,
    delta: i32,
) -> IpcResult<()> {
    if !mach_port_valid(name) {
        return match right {
            MachPortRight::Send | MachPortRight::SendOnce => Ok(()),
            _ => Err(IpcError::InvalidValue),
        };
    }
    let mut deferred = Deferred::new();
    let mut table = space.lock_table()?;
    right::ipc_right_delta(space, &mut table, name, right, delta, &mut deferred)
}

/// Get the user reference count for a port right; zero if `name` does not
/// hold that right
pub fn mach_port_get_refs(
    space: &IpcSpace,
    name: MachPortName,
    right: MachPortRight,
) -> IpcResult<u32> {
    if !mach_port_valid(name) {
        return Err(IpcError::InvalidName);
    }
    let mut deferred = Deferred::new();
    let mut table = space.lock_table()?;
    right::ipc_right_refs(&mut table, name, right, &mut deferred)
}

// ============================================================================
// Queries
// ============================================================================

/// Rights held under `name`, with `DNREQUEST` if a dead-name request is
/// registered
pub fn mach_port_type(space: &IpcSpace, name: MachPortName) -> IpcResult<MachPortType> {
    let mut deferred = Deferred::new();
    let mut table = space.lock_table()?;
    right::ipc_right_check(&mut table, name, &mut deferred);
    Ok(table.lookup(name)?.port_type())
}

/// Every name in the space with its type
pub fn mach_port_names(space: &IpcSpace) -> IpcResult<Vec<(MachPortName, MachPortType)>> {
    let mut deferred = Deferred::new();
    let mut table = space.lock_table()?;
    for name in table.names() {
        right::ipc_right_check(&mut table, name, &mut deferred);
    }
    Ok(table
        .iter()
        .map(|(name, entry)| (name, entry.port_type()))
        .collect())
}

// ============================================================================
// mach_port_insert_right - Insert a right into space
// ============================================================================

/// Make a right to `port` and install it in `space`
///
/// `MakeSend` merges with an existing send or receive entry for the port;
/// `MakeSendOnce` always gets a new name.
pub fn mach_port_insert_right(
    space: &IpcSpace,
    port: &PortRef,
    disposition: MsgTypeName,
) -> IpcResult<MachPortName> {
    if !port.is_active() {
        return Err(IpcError::InvalidCapability);
    }
    let right = match disposition {
        MsgTypeName::MakeSend => {
            port.make_send();
            KmsgRight::new(KmsgObject::Port(port.clone()), MsgTypeName::PORT_SEND)
        }
        MsgTypeName::MakeSendOnce => {
            port.make_send_once();
            KmsgRight::new(KmsgObject::Port(port.clone()), MsgTypeName::PORT_SEND_ONCE)
        }
        _ => return Err(IpcError::InvalidValue),
    };
    let mut deferred = Deferred::new();
    let mut table = match space.lock_table() {
        Ok(table) => table,
        Err(err) => {
            deferred.drop_right(right);
            return Err(err);
        }
    };
    right::ipc_right_copyout(space, &mut table, right, &mut deferred)
}

// ============================================================================
// Port Attributes
// ============================================================================

fn receive_port(
    table: &mut IpcEntryTable,
    name: MachPortName,
    deferred: &mut Deferred,
) -> IpcResult<PortRef> {
    right::ipc_right_check(table, name, deferred);
    let entry = table.lookup(name)?;
    if !entry.rights().contains(MachPortType::RECEIVE) {
        return Err(IpcError::InvalidRight);
    }
    entry.port().cloned().ok_or(IpcError::InvalidRight)
}

fn with_receive_port<T>(
    space: &IpcSpace,
    name: MachPortName,
    f: impl FnOnce(&PortRef) -> IpcResult<T>,
) -> IpcResult<T> {
    let mut deferred = Deferred::new();
    let port = {
        let mut table = space.lock_table()?;
        receive_port(&mut table, name, &mut deferred)?
    };
    f(&port)
}

/// Change the queue limit of the port whose receive right is `name`
pub fn mach_port_set_qlimit(space: &IpcSpace, name: MachPortName, qlimit: usize) -> IpcResult<()> {
    with_receive_port(space, name, |port| port.set_qlimit(qlimit))
}

pub fn mach_port_set_mscount(space: &IpcSpace, name: MachPortName, mscount: u32) -> IpcResult<()> {
    with_receive_port(space, name, |port| {
        port.set_mscount(mscount);
        Ok(())
    })
}

pub fn mach_port_set_seqno(space: &IpcSpace, name: MachPortName, seqno: u32) -> IpcResult<()> {
    with_receive_port(space, name, |port| {
        port.set_seqno(seqno);
        Ok(())
    })
}

/// Port status (queue limit, message count, counters) for a receive right
pub fn mach_port_get_attributes(space: &IpcSpace, name: MachPortName) -> IpcResult<PortStatus> {
    with_receive_port(space, name, |port| Ok(port.status()))
}

// ============================================================================
// mach_port_request_notification
// ============================================================================

/// Take the send-once right a notification will be sent through
fn copyin_notify(
    space: &IpcSpace,
    table: &mut IpcEntryTable,
    notify: MachPortName,
    disposition: MsgTypeName,
    deferred: &mut Deferred,
) -> IpcResult<Option<SendOnceRight>> {
    if notify == MACH_PORT_NULL {
        return Ok(None);
    }
    if !matches!(disposition, MsgTypeName::MakeSendOnce | MsgTypeName::MoveSendOnce) {
        return Err(IpcError::InvalidValue);
    }
    let (mut right, origin) = right::ipc_right_copyin(space, table, notify, disposition, deferred)?;
    let KmsgObject::Port(port) = right.take() else {
        return Err(IpcError::InvalidCapability);
    };
    if let Origin::Moved { name, request } = origin {
        deferred.port_deleted(request, name);
    }
    Ok(Some(SendOnceRight::adopt(port)))
}

/// Register (or with `MACH_PORT_NULL`, cancel) a notification request
///
/// # Arguments
/// * `space` - IPC space
/// * `name` - Right the request is about
/// * `kind` - `DeadName` (any port right or dead name) or `NoSenders`
///   (receive right only)
/// * `sync` - For no-senders, fire at once if the make-send count has
///   reached it and there are no senders
/// * `notify` - Port the notification goes to
/// * `disposition` - `MakeSendOnce` or `MoveSendOnce`
///
/// # Returns
/// The name of the previously registered send-once right, now back in
/// `space`, or `MACH_PORT_NULL`
pub fn mach_port_request_notification(
    space: &IpcSpace,
    name: MachPortName,
    kind: NotifyType,
    sync: u32,
    notify: MachPortName,
    disposition: MsgTypeName,
) -> IpcResult<MachPortName> {
    let mut deferred = Deferred::new();
    let mut table = space.lock_table()?;
    right::ipc_right_check(&mut table, name, &mut deferred);
    let rights = table.lookup(name)?.rights();
    match kind {
        NotifyType::NoSenders if !rights.contains(MachPortType::RECEIVE) => {
            return Err(IpcError::InvalidRight)
        }
        NotifyType::DeadName if !rights.intersects(MachPortType::PORT_OR_DEAD) => {
            return Err(IpcError::InvalidRight)
        }
        NotifyType::NoSenders | NotifyType::DeadName => {}
        _ => return Err(IpcError::InvalidValue),
    }
    let request = copyin_notify(space, &mut table, notify, disposition, &mut deferred)?;

    let entry = table.lookup_mut(name)?;
    let previous = if kind == NotifyType::NoSenders {
        let port = entry.port().cloned().ok_or(IpcError::InvalidRight)?;
        port.request_no_senders(request, sync)
    } else if entry.is_dead_name() {
        // Already dead: the request fires at once
        if let Some(request) = request {
            deferred.dead_name(request, name);
        }
        None
    } else {
        let port = entry.port().cloned().ok_or(IpcError::InvalidRight)?;
        match request {
            None => {
                let previous = entry.take_request();
                if previous.is_some() {
                    port.cancel_dnrequest(space.id(), name);
                }
                previous
            }
            Some(request) => match port.register_dnrequest(space, name) {
                Ok(()) => entry.set_request(Some(request)),
                Err(_) => {
                    // Died since the check above
                    right::ipc_right_check(&mut table, name, &mut deferred);
                    deferred.dead_name(request, name);
                    None
                }
            },
        }
    };

    match previous.and_then(SendOnceRight::into_port) {
        None => Ok(MACH_PORT_NULL),
        Some(port) => {
            let right = KmsgRight::new(KmsgObject::Port(port), MsgTypeName::PORT_SEND_ONCE);
            right::ipc_right_copyout(space, &mut table, right, &mut deferred)
        }
    }
}

// ============================================================================
// Port Set Operations
// ============================================================================

/// Move a port into or out of a port set
///
/// # Arguments
/// * `space` - IPC space
/// * `member` - Receive right of the port to move
/// * `after` - Port set to move it to, or `MACH_PORT_NULL` to take it out of
///   its current set
pub fn mach_port_move_member(
    space: &IpcSpace,
    member: MachPortName,
    after: MachPortName,
) -> IpcResult<()> {
    let mut deferred = Deferred::new();
    let mut table = space.lock_table()?;
    let port = receive_port(&mut table, member, &mut deferred)?;
    let target = if after == MACH_PORT_NULL {
        None
    } else {
        let entry = table.lookup(after)?;
        Some(entry.pset().cloned().ok_or(IpcError::InvalidRight)?)
    };
    let current = port.lock().pset.as_ref().and_then(Weak::upgrade);

    match (&current, &target) {
        (None, None) => return Err(IpcError::NotInSet),
        (Some(current), Some(target)) if Arc::ptr_eq(current, target) => {
            return Err(IpcError::AlreadyInSet)
        }
        _ => {}
    }
    if let Some(current) = current {
        current.remove_member(&port)?;
    }
    if let Some(target) = target {
        target.add_member(&port)?;
    }
    Ok(())
}

/// Names (in `space`) of the members of the port set `name`
pub fn mach_port_get_set_status(
    space: &IpcSpace,
    name: MachPortName,
) -> IpcResult<Vec<MachPortName>> {
    let mut table = space.lock_table()?;
    let pset = table.lookup(name)?.pset().cloned().ok_or(IpcError::InvalidRight)?;
    Ok(pset
        .members()
        .iter()
        .filter_map(|port| table.reverse_lookup(port))
        .collect())
}
