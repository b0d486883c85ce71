//! IPC Rights - Capability transfer (copyin/copyout) and right management
//!
//! Based on Mach4 ipc/ipc_right.c
//!
//! Everything here runs with the space's table locked. Work that must not
//! happen under the space lock (destroying a port, which converts holder
//! entries in every space, and sending notifications) is queued on a
//! [`Deferred`] and carried out when it is dropped.
//!
//! Send-right accounting follows Mach: a port's send count counts entries
//! holding send rights plus send rights in transit, not user references.

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::entry::{
    IpcEntryTable, IpcObject, MachPortName, MachPortRight, MachPortType, MACH_PORT_UREFS_MAX,
};
use super::kmsg::{KmsgObject, KmsgRight, Origin};
use super::message::MsgTypeName;
use super::notify;
use super::port::{PortRef, SendOnceRight};
use super::pset::PsetRef;
use super::space::IpcSpace;
use super::{IpcError, IpcResult, MACH_PORT_DEAD, MACH_PORT_NULL};
use crate::types::PortId;

/// Release a right that no entry holds
pub(crate) fn ipc_object_destroy(port: PortRef, ty: MsgTypeName) {
    match ty.result_type() {
        MsgTypeName::MoveReceive => port.destroy(),
        MsgTypeName::MoveSendOnce => notify::ipc_notify_send_once(port),
        _ => port.release_send(),
    }
}

// ============================================================================
// Deferred Work
// ============================================================================

#[derive(Debug)]
enum Notice {
    PortDeleted(SendOnceRight, MachPortName),
    DeadName(SendOnceRight, MachPortName),
}

/// Work that must wait until the space lock is released
///
/// Declare it before taking the table guard so it is dropped after the
/// guard. Dropping releases rights, destroys ports and sets, then sends
/// notifications.
#[derive(Debug, Default)]
pub(crate) struct Deferred {
    rights: Vec<KmsgRight>,
    ports: Vec<PortRef>,
    psets: Vec<PsetRef>,
    notices: Vec<Notice>,
}

impl Deferred {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn destroy_port(&mut self, port: PortRef) {
        self.ports.push(port);
    }

    pub(crate) fn destroy_pset(&mut self, pset: PsetRef) {
        self.psets.push(pset);
    }

    /// Release a right of type `ty` to `port`
    pub(crate) fn release(&mut self, port: PortRef, ty: MsgTypeName) {
        self.rights
            .push(KmsgRight::new(KmsgObject::Port(port), ty.result_type()));
    }

    pub(crate) fn drop_right(&mut self, right: KmsgRight) {
        self.rights.push(right);
    }

    pub(crate) fn port_deleted(&mut self, request: Option<SendOnceRight>, name: MachPortName) {
        if let Some(request) = request {
            self.notices.push(Notice::PortDeleted(request, name));
        }
    }

    pub(crate) fn dead_name(&mut self, request: SendOnceRight, name: MachPortName) {
        self.notices.push(Notice::DeadName(request, name));
    }
}

impl Drop for Deferred {
    fn drop(&mut self) {
        self.rights.clear();
        for port in self.ports.drain(..) {
            port.destroy();
        }
        for pset in self.psets.drain(..) {
            pset.destroy();
        }
        for notice in self.notices.drain(..) {
            match notice {
                Notice::PortDeleted(request, name) => {
                    notify::ipc_notify_port_deleted(request, name)
                }
                Notice::DeadName(request, name) => notify::ipc_notify_dead_name(request, name),
            }
        }
    }
}

// ============================================================================
// Entry Helpers
// ============================================================================

/// Convert `name` to a dead name if the port it names has died.
///
/// Send rights keep their user references; other rights become a single
/// reference. Returns true if the entry was converted.
pub(crate) fn ipc_right_check(
    table: &mut IpcEntryTable,
    name: MachPortName,
    deferred: &mut Deferred,
) -> bool {
    let (rights, urefs) = match table.lookup(name) {
        Ok(entry) => match entry.port() {
            Some(port) if !port.is_active() => (entry.rights(), entry.urefs()),
            _ => return false,
        },
        Err(_) => return false,
    };
    let request = table.lookup_mut(name).ok().and_then(|e| e.take_request());
    let urefs = if rights.contains(MachPortType::SEND) { urefs } else { 1 };
    let Ok(port) = table.make_dead_name(name, urefs) else {
        return false;
    };
    if rights.contains(MachPortType::SEND) {
        port.release_send();
    }
    if rights.contains(MachPortType::SEND_ONCE) {
        port.release_send_once();
    }
    if let Some(request) = request {
        deferred.dead_name(request, name);
    }
    log::trace!("ipc_right: {:#x} is now a dead name ({})", name, port.id());
    true
}

/// Free the entry `name`, returning what it named and its dead-name request
fn remove_entry(
    space: &IpcSpace,
    table: &mut IpcEntryTable,
    name: MachPortName,
) -> IpcResult<(Option<IpcObject>, Option<SendOnceRight>)> {
    let mut entry = table.dealloc(name)?;
    let request = entry.take_request();
    if request.is_some() {
        if let Some(port) = entry.port() {
            port.cancel_dnrequest(space.id(), name);
        }
    }
    Ok((entry.object().cloned(), request))
}

/// Add a send or receive right to an entry that already names `port`
fn merge_right(
    space: &IpcSpace,
    table: &mut IpcEntryTable,
    name: MachPortName,
    port: &PortRef,
    ty: MsgTypeName,
    deferred: &mut Deferred,
) -> IpcResult<()> {
    let entry = table.lookup_mut(name)?;
    let rights = entry.rights();
    if ty == MsgTypeName::PORT_RECEIVE {
        entry.set_rights(rights | MachPortType::RECEIVE, entry.urefs());
        port.lock().receiver = Some(space.id());
    } else if rights.contains(MachPortType::SEND) {
        // The entry already accounts for one send right; at the uref
        // ceiling the reference stays pegged.
        if entry.add_urefs(1).is_err() {
            log::warn!("ipc_right: {:#x} pegged at {} urefs", name, MACH_PORT_UREFS_MAX);
        }
        deferred.release(port.clone(), MsgTypeName::PORT_SEND);
    } else {
        entry.set_rights(rights | MachPortType::SEND, 1);
    }
    Ok(())
}

// ============================================================================
// Copyin
// ============================================================================

/// Take the right `name` out of `space` for a message, as `disposition`
/// directs. Nothing changes if this fails.
pub(crate) fn ipc_right_copyin(
    space: &IpcSpace,
    table: &mut IpcEntryTable,
    name: MachPortName,
    disposition: MsgTypeName,
    deferred: &mut Deferred,
) -> IpcResult<(KmsgRight, Origin)> {
    let ty = disposition.result_type();
    if name == MACH_PORT_NULL {
        return Ok((KmsgRight::new(KmsgObject::Null, ty), Origin::Nothing));
    }
    if name == MACH_PORT_DEAD {
        if disposition == MsgTypeName::MoveReceive || disposition.is_make() {
            return Err(IpcError::InvalidRight);
        }
        return Ok((KmsgRight::new(KmsgObject::Dead, ty), Origin::Nothing));
    }

    ipc_right_check(table, name, deferred);
    let entry = table.lookup(name)?;
    let rights = entry.rights();
    let urefs = entry.urefs();
    if rights.contains(MachPortType::DEAD_NAME) {
        return copyin_dead_name(space, table, name, disposition);
    }
    let port = entry.port().cloned().ok_or(IpcError::InvalidRight)?;
    let right = KmsgRight::new(KmsgObject::Port(port.clone()), ty);

    let origin = match disposition {
        MsgTypeName::MakeSend | MsgTypeName::MakeSendOnce => {
            if !rights.contains(MachPortType::RECEIVE) {
                return Err(IpcError::NotOwner);
            }
            if disposition == MsgTypeName::MakeSend {
                port.make_send();
            } else {
                port.make_send_once();
            }
            Origin::Made
        }
        MsgTypeName::CopySend => {
            if !rights.contains(MachPortType::SEND) {
                return Err(IpcError::InvalidRight);
            }
            port.copy_send();
            Origin::Copied
        }
        MsgTypeName::MoveSend => {
            if !rights.contains(MachPortType::SEND) {
                return Err(IpcError::InvalidRight);
            }
            let request = if urefs > 1 {
                table.lookup_mut(name)?.remove_urefs(1)?;
                port.copy_send();
                None
            } else if rights.contains(MachPortType::RECEIVE) {
                table.lookup_mut(name)?.set_rights(MachPortType::RECEIVE, 0);
                None
            } else {
                remove_entry(space, table, name)?.1
            };
            Origin::Moved { name, request }
        }
        MsgTypeName::MoveSendOnce => {
            if !rights.contains(MachPortType::SEND_ONCE) {
                return Err(IpcError::InvalidRight);
            }
            let request = remove_entry(space, table, name)?.1;
            Origin::Moved { name, request }
        }
        MsgTypeName::MoveReceive => {
            if !rights.contains(MachPortType::RECEIVE) {
                return Err(IpcError::InvalidRight);
            }
            let request = if rights.contains(MachPortType::SEND) {
                table.lookup_mut(name)?.set_rights(MachPortType::SEND, urefs);
                None
            } else {
                remove_entry(space, table, name)?.1
            };
            let pset = {
                let mut data = port.lock();
                data.receiver = None;
                data.mqueue.change_receiver();
                data.pset.take()
            };
            if let Some(pset) = pset.and_then(|w| w.upgrade()) {
                pset.forget_member(&port);
            }
            Origin::Moved { name, request }
        }
    };
    log::trace!("ipc_right: copyin {:#x} as {:?} ({})", name, disposition, port.id());
    Ok((right, origin))
}

fn copyin_dead_name(
    space: &IpcSpace,
    table: &mut IpcEntryTable,
    name: MachPortName,
    disposition: MsgTypeName,
) -> IpcResult<(KmsgRight, Origin)> {
    let ty = disposition.result_type();
    let dead = KmsgRight::new(KmsgObject::Dead, ty);
    match disposition {
        MsgTypeName::CopySend => Ok((dead, Origin::Nothing)),
        MsgTypeName::MoveSend | MsgTypeName::MoveSendOnce => {
            let request = if table.lookup_mut(name)?.remove_urefs(1)? {
                remove_entry(space, table, name)?.1
            } else {
                None
            };
            Ok((dead, Origin::Moved { name, request }))
        }
        _ => Err(IpcError::InvalidRight),
    }
}

// ============================================================================
// Rollback
// ============================================================================

/// Give a copied-in right back to the sender.
///
/// A moved right returns under its old name when that name is still free
/// (or still names the port); otherwise it is copied out afresh.
pub(crate) fn ipc_right_rollback(
    space: &IpcSpace,
    table: &mut IpcEntryTable,
    mut right: KmsgRight,
    origin: Origin,
    deferred: &mut Deferred,
) {
    match origin {
        Origin::Nothing => {
            right.take();
        }
        Origin::Copied => deferred.drop_right(right),
        Origin::Made => {
            if let KmsgObject::Port(port) = right.take() {
                if right.ty() == MsgTypeName::PORT_SEND {
                    port.unmake_send();
                } else {
                    port.release_send_once();
                }
            }
        }
        Origin::Moved { name, request } => restore(space, table, right, name, request, deferred),
    }
}

fn restore(
    space: &IpcSpace,
    table: &mut IpcEntryTable,
    mut right: KmsgRight,
    name: MachPortName,
    request: Option<SendOnceRight>,
    deferred: &mut Deferred,
) {
    let at_name = match right.object() {
        KmsgObject::Null => false,
        KmsgObject::Dead => restore_dead_name(table, name),
        KmsgObject::Port(port) => {
            let port = port.clone();
            restore_port(space, table, name, &port, right.ty(), deferred)
        }
    };
    if at_name {
        right.take();
        if let Some(request) = request {
            reinstall_request(space, table, name, request, deferred);
        }
        return;
    }
    if !right.is_null() {
        match ipc_right_copyout(space, table, right, deferred) {
            Ok(new_name) => log::warn!("ipc_right: {:#x} restored as {:#x}", name, new_name),
            Err(err) => log::warn!("ipc_right: right for {:#x} lost on rollback: {}", name, err),
        }
    }
    deferred.port_deleted(request, name);
}

fn restore_dead_name(table: &mut IpcEntryTable, name: MachPortName) -> bool {
    if let Ok(entry) = table.lookup_mut(name) {
        return entry.is_dead_name() && entry.add_urefs(1).is_ok();
    }
    table.is_reclaimable(name) && table.alloc_name_dead(name, 1).is_ok()
}

fn restore_port(
    space: &IpcSpace,
    table: &mut IpcEntryTable,
    name: MachPortName,
    port: &PortRef,
    ty: MsgTypeName,
    deferred: &mut Deferred,
) -> bool {
    let current = table.lookup(name).ok().map(|entry| {
        let same = entry.port().is_some_and(|p| Arc::ptr_eq(p, port));
        (entry.rights(), same)
    });
    match current {
        Some((rights, true))
            if rights.intersects(MachPortType::SEND_RECEIVE) && ty != MsgTypeName::PORT_SEND_ONCE =>
        {
            merge_right(space, table, name, port, ty, deferred).is_ok()
        }
        Some(_) => false,
        None => {
            let mergeable = ty != MsgTypeName::PORT_SEND_ONCE;
            if !table.is_reclaimable(name) || (mergeable && table.reverse_lookup(port).is_some()) {
                return false;
            }
            let (rights, urefs) = match ty {
                MsgTypeName::MoveReceive => (MachPortType::RECEIVE, 0),
                MsgTypeName::MoveSendOnce => (MachPortType::SEND_ONCE, 1),
                _ => (MachPortType::SEND, 1),
            };
            if table
                .alloc_name(name, rights, urefs, IpcObject::Port(port.clone()))
                .is_err()
            {
                return false;
            }
            if ty == MsgTypeName::PORT_RECEIVE {
                port.lock().receiver = Some(space.id());
            }
            true
        }
    }
}

fn reinstall_request(
    space: &IpcSpace,
    table: &mut IpcEntryTable,
    name: MachPortName,
    request: SendOnceRight,
    deferred: &mut Deferred,
) {
    let Ok(entry) = table.lookup_mut(name) else {
        deferred.port_deleted(Some(request), name);
        return;
    };
    if entry.request().is_some() {
        deferred.port_deleted(Some(request), name);
        return;
    }
    let registered = match entry.port() {
        Some(port) => port.register_dnrequest(space, name).is_ok(),
        None => false,
    };
    if registered {
        entry.set_request(Some(request));
    } else {
        deferred.dead_name(request, name);
    }
}

// ============================================================================
// Copyout
// ============================================================================

/// Would copying out `rights` fit in the table?
pub(crate) fn ipc_right_copyout_fits<'a>(
    table: &mut IpcEntryTable,
    rights: impl Iterator<Item = &'a KmsgRight>,
) -> bool {
    let mut needed = 0usize;
    let mut seen: Vec<PortId> = Vec::new();
    for right in rights {
        let Some(port) = right.port() else {
            continue;
        };
        let ty = right.ty();
        if !port.is_active() && ty != MsgTypeName::PORT_RECEIVE {
            continue;
        }
        if ty == MsgTypeName::PORT_SEND_ONCE {
            needed += 1;
        } else if table.reverse_lookup(port).is_none() && !seen.contains(&port.id()) {
            seen.push(port.id());
            needed += 1;
        }
    }
    needed <= table.free_capacity()
}

/// Install a right from a message in `space`, returning its name.
///
/// Send and receive rights merge with an existing entry for the same port;
/// send rights to dead ports come out as `MACH_PORT_DEAD`. On failure the
/// right is released once the space is unlocked.
pub(crate) fn ipc_right_copyout(
    space: &IpcSpace,
    table: &mut IpcEntryTable,
    mut right: KmsgRight,
    deferred: &mut Deferred,
) -> IpcResult<MachPortName> {
    let ty = right.ty();
    let port = match right.object() {
        KmsgObject::Null => return Ok(MACH_PORT_NULL),
        KmsgObject::Dead => return Ok(MACH_PORT_DEAD),
        KmsgObject::Port(port) => port.clone(),
    };
    if !port.is_active() && ty != MsgTypeName::PORT_RECEIVE {
        deferred.drop_right(right);
        return Ok(MACH_PORT_DEAD);
    }

    let result = match (ty, table.reverse_lookup(&port)) {
        (MsgTypeName::MoveSendOnce, _) => {
            table.alloc(MachPortType::SEND_ONCE, 1, IpcObject::Port(port.clone()))
        }
        (_, Some(name)) => merge_right(space, table, name, &port, ty, deferred).map(|_| name),
        (MsgTypeName::MoveReceive, None) => {
            table.alloc(MachPortType::RECEIVE, 0, IpcObject::Port(port.clone()))
        }
        (_, None) => table.alloc(MachPortType::SEND, 1, IpcObject::Port(port.clone())),
    };
    match result {
        Ok(name) => {
            right.take();
            if ty == MsgTypeName::PORT_RECEIVE {
                port.lock().receiver = Some(space.id());
            }
            log::trace!("ipc_right: copyout {} as {:#x} ({:?})", port.id(), name, ty);
            Ok(name)
        }
        Err(err) => {
            deferred.drop_right(right);
            Err(err)
        }
    }
}

// ============================================================================
// Right Management
// ============================================================================

/// Release one user reference of `name` (mach_port_deallocate)
pub(crate) fn ipc_right_dealloc(
    space: &IpcSpace,
    table: &mut IpcEntryTable,
    name: MachPortName,
    deferred: &mut Deferred,
) -> IpcResult<()> {
    ipc_right_check(table, name, deferred);
    let entry = table.lookup(name)?;
    let rights = entry.rights();
    if rights.contains(MachPortType::SEND_ONCE) {
        let (object, request) = remove_entry(space, table, name)?;
        if let Some(port) = object.as_ref().and_then(IpcObject::as_port) {
            deferred.release(port.clone(), MsgTypeName::PORT_SEND_ONCE);
        }
        deferred.port_deleted(request, name);
        Ok(())
    } else if rights.contains(MachPortType::DEAD_NAME) {
        if table.lookup_mut(name)?.remove_urefs(1)? {
            let (_, request) = remove_entry(space, table, name)?;
            deferred.port_deleted(request, name);
        }
        Ok(())
    } else if rights.contains(MachPortType::SEND) {
        drop_send_urefs(space, table, name, 1, deferred)
    } else {
        Err(IpcError::InvalidRight)
    }
}

/// Remove `delta` send references; the last one gives up the send right
fn drop_send_urefs(
    space: &IpcSpace,
    table: &mut IpcEntryTable,
    name: MachPortName,
    delta: u32,
    deferred: &mut Deferred,
) -> IpcResult<()> {
    let entry = table.lookup_mut(name)?;
    let rights = entry.rights();
    if entry.urefs() < delta {
        return Err(IpcError::InvalidValue);
    }
    if entry.urefs() > delta {
        return entry.remove_urefs(delta).map(|_| ());
    }
    let port = entry.port().cloned().ok_or(IpcError::InvalidRight)?;
    if rights.contains(MachPortType::RECEIVE) {
        entry.set_rights(MachPortType::RECEIVE, 0);
    } else {
        let (_, request) = remove_entry(space, table, name)?;
        deferred.port_deleted(request, name);
    }
    deferred.release(port, MsgTypeName::PORT_SEND);
    Ok(())
}

/// Remove every right held under `name` (mach_port_destroy)
pub(crate) fn ipc_right_destroy(
    space: &IpcSpace,
    table: &mut IpcEntryTable,
    name: MachPortName,
    deferred: &mut Deferred,
) -> IpcResult<()> {
    ipc_right_check(table, name, deferred);
    let rights = table.lookup(name)?.rights();
    let (object, request) = remove_entry(space, table, name)?;
    deferred.port_deleted(request, name);
    match object {
        Some(IpcObject::Port(port)) => {
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
    Ok(())
}

/// Adjust the user references of one right under `name` (mach_port_mod_refs)
pub(crate) fn ipc_right_delta(
    space: &IpcSpace,
    table: &mut IpcEntryTable,
    name: MachPortName,
    right: MachPortRight,
    delta: i32,
    deferred: &mut Deferred,
) -> IpcResult<()> {
    ipc_right_check(table, name, deferred);
    let entry = table.lookup(name)?;
    let rights = entry.rights();
    if !rights.contains(right.port_type()) {
        return Err(IpcError::InvalidRight);
    }
    match right {
        MachPortRight::Receive | MachPortRight::PortSet | MachPortRight::SendOnce => match delta {
            0 => Ok(()),
            -1 => drop_single_right(space, table, name, right, deferred),
            _ => Err(IpcError::InvalidValue),
        },
        MachPortRight::Send | MachPortRight::DeadName => {
            if delta >= 0 {
                return table.lookup_mut(name)?.add_urefs(delta as u32);
            }
            let delta = delta.unsigned_abs();
            if right == MachPortRight::Send {
                return drop_send_urefs(space, table, name, delta, deferred);
            }
            if table.lookup_mut(name)?.remove_urefs(delta)? {
                let (_, request) = remove_entry(space, table, name)?;
                deferred.port_deleted(request, name);
            }
            Ok(())
        }
    }
}

fn drop_single_right(
    space: &IpcSpace,
    table: &mut IpcEntryTable,
    name: MachPortName,
    right: MachPortRight,
    deferred: &mut Deferred,
) -> IpcResult<()> {
    match right {
        MachPortRight::Receive => {
            let entry = table.lookup_mut(name)?;
            let port = entry.port().cloned().ok_or(IpcError::InvalidRight)?;
            if entry.has_send() {
                // The send right stays and becomes a dead name when the
                // port goes.
                let urefs = entry.urefs();
                entry.set_rights(MachPortType::SEND, urefs);
            } else {
                let (_, request) = remove_entry(space, table, name)?;
                deferred.port_deleted(request, name);
            }
            port.lock().receiver = None;
            deferred.destroy_port(port);
            Ok(())
        }
        MachPortRight::SendOnce => ipc_right_dealloc(space, table, name, deferred),
        _ => ipc_right_destroy(space, table, name, deferred),
    }
}

/// User references of one right under `name` (mach_port_get_refs)
pub(crate) fn ipc_right_refs(
    table: &mut IpcEntryTable,
    name: MachPortName,
    right: MachPortRight,
    deferred: &mut Deferred,
) -> IpcResult<u32> {
    ipc_right_check(table, name, deferred);
    let entry = table.lookup(name)?;
    if !entry.rights().contains(right.port_type()) {
        return Ok(0);
    }
    Ok(match right {
        MachPortRight::Send | MachPortRight::DeadName => entry.urefs(),
        _ => 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::port::ipc_port_alloc_default;

    fn copyin(
        space: &IpcSpace,
        name: MachPortName,
        disposition: MsgTypeName,
    ) -> IpcResult<(KmsgRight, Origin)> {
        let mut deferred = Deferred::new();
        let mut table = space.lock_table()?;
        ipc_right_copyin(space, &mut table, name, disposition, &mut deferred)
    }

    fn copyout(space: &IpcSpace, right: KmsgRight) -> IpcResult<MachPortName> {
        let mut deferred = Deferred::new();
        let mut table = space.lock_table()?;
        ipc_right_copyout(space, &mut table, right, &mut deferred)
    }

    #[test]
    fn test_make_send_requires_receive() {
        let a = IpcSpace::new();
        let (name, port) = ipc_port_alloc_default(&a).unwrap();
        let (right, _) = copyin(&a, name, MsgTypeName::MakeSend).unwrap();
        assert_eq!(port.send_right_count(), 1);

        let b = IpcSpace::new();
        let send = copyout(&b, right).unwrap();
        assert_eq!(
            copyin(&b, send, MsgTypeName::MakeSend).err(),
            Some(IpcError::NotOwner)
        );
        assert_eq!(
            copyin(&b, send, MsgTypeName::MoveReceive).err(),
            Some(IpcError::InvalidRight)
        );
    }

    #[test]
    fn test_copyout_merges_send_rights() {
        let a = IpcSpace::new();
        let (name, port) = ipc_port_alloc_default(&a).unwrap();
        let b = IpcSpace::new();
        let (r1, _) = copyin(&a, name, MsgTypeName::MakeSend).unwrap();
        let (r2, _) = copyin(&a, name, MsgTypeName::MakeSend).unwrap();
        let n1 = copyout(&b, r1).unwrap();
        let n2 = copyout(&b, r2).unwrap();
        assert_eq!(n1, n2);
        assert_eq!(b.lookup(n1).unwrap().urefs, 2);
        // One entry holds the send right
        assert_eq!(port.send_right_count(), 1);
        assert_eq!(port.status().mscount, 2);
    }

    #[test]
    fn test_send_once_never_merges() {
        let a = IpcSpace::new();
        let (name, port) = ipc_port_alloc_default(&a).unwrap();
        let (r1, _) = copyin(&a, name, MsgTypeName::MakeSendOnce).unwrap();
        let (r2, _) = copyin(&a, name, MsgTypeName::MakeSendOnce).unwrap();
        let n1 = copyout(&a, r1).unwrap();
        let n2 = copyout(&a, r2).unwrap();
        assert_ne!(n1, n2);
        assert_ne!(n1, name);
        assert_eq!(port.send_once_right_count(), 2);
    }

    #[test]
    fn test_move_send_keeps_count() {
        let a = IpcSpace::new();
        let (name, port) = ipc_port_alloc_default(&a).unwrap();
        let (right, _) = copyin(&a, name, MsgTypeName::MakeSend).unwrap();
        let send = copyout(&a, right).unwrap();
        assert_eq!(send, name);
        assert_eq!(a.lookup(name).unwrap().rights, MachPortType::SEND_RECEIVE);

        let (moved, origin) = copyin(&a, name, MsgTypeName::MoveSend).unwrap();
        assert!(matches!(origin, Origin::Moved { .. }));
        assert_eq!(a.lookup(name).unwrap().rights, MachPortType::RECEIVE);
        assert_eq!(port.send_right_count(), 1);
        drop(moved);
        assert_eq!(port.send_right_count(), 0);
    }

    #[test]
    fn test_rollback_restores_original_name() {
        let a = IpcSpace::new();
        let (name, port) = ipc_port_alloc_default(&a).unwrap();
        let (right, origin) = copyin(&a, name, MsgTypeName::MoveReceive).unwrap();
        assert!(a.lookup(name).is_err());
        assert_eq!(port.receiver(), None);

        let mut deferred = Deferred::new();
        let mut table = a.lock_table().unwrap();
        ipc_right_rollback(&a, &mut table, right, origin, &mut deferred);
        drop(table);
        assert_eq!(a.lookup(name).unwrap().rights, MachPortType::RECEIVE);
        assert_eq!(port.receiver(), Some(a.id()));
        assert!(port.is_active());
    }

    #[test]
    fn test_dead_port_copies_out_dead() {
        let a = IpcSpace::new();
        let (name, port) = ipc_port_alloc_default(&a).unwrap();
        let (right, _) = copyin(&a, name, MsgTypeName::MakeSend).unwrap();
        port.destroy();
        let b = IpcSpace::new();
        assert_eq!(copyout(&b, right).unwrap(), MACH_PORT_DEAD);
        assert_eq!(b.entry_count(), 0);
    }

    #[test]
    fn test_capacity_check() {
        let a = IpcSpace::new();
        let (name, _port) = ipc_port_alloc_default(&a).unwrap();
        let b = IpcSpace::with_config(crate::ipc::IpcSpaceConfig::new().max_entries(3));
        let rights: Vec<KmsgRight> = (0..3)
            .map(|_| copyin(&a, name, MsgTypeName::MakeSendOnce).unwrap().0)
            .collect();
        let mut table = b.lock_table().unwrap();
        assert!(!ipc_right_copyout_fits(&mut table, rights.iter()));
        assert!(ipc_right_copyout_fits(&mut table, rights[..2].iter()));
    }
}
