//! Port - the fundamental IPC primitive
//!
//! Based on Mach4 ipc/ipc_port.h/c
//!
//! A port is a kernel-resident message queue plus the bookkeeping for the
//! rights that name it. Holders share it through [`PortRef`]; the mutable
//! state sits behind the port lock, which nests inside the space lock.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::{Mutex, MutexGuard};

use super::entry::{IpcObject, MachPortName, MachPortType};
use super::right::{self, Deferred};
use super::mqueue::{IpcMqueue, MQUEUE_DEFAULT_LIMIT, MQUEUE_MAX_LIMIT};
use super::notify;
use super::pset::PortSet;
use super::space::IpcSpace;
use super::{IpcError, IpcResult};
use crate::kern::ipc_kobject::PortKobject;
use crate::types::{PortId, SpaceId};

/// Shared handle to a port
pub type PortRef = Arc<Port>;

// ============================================================================
// Port State
// ============================================================================

/// A space entry that asked to hear about this port's death
#[derive(Debug, Clone)]
pub(crate) struct DeadNameRegistration {
    pub(crate) space: Weak<IpcSpace>,
    pub(crate) space_id: SpaceId,
    pub(crate) name: MachPortName,
}

/// Mutable port state, guarded by the port lock
#[derive(Debug)]
pub struct PortData {
    /// Space holding the receive right; None while in transit
    pub(crate) receiver: Option<SpaceId>,
    /// Pending messages and blocked threads
    pub(crate) mqueue: IpcMqueue,
    /// Outstanding send rights
    pub(crate) srights: u32,
    /// Outstanding send-once rights
    pub(crate) sorights: u32,
    /// Make-send count
    pub(crate) mscount: u32,
    /// No-senders notification request
    pub(crate) nsrequest: Option<SendOnceRight>,
    /// Entries holding dead-name requests for this port
    pub(crate) dnrequests: Vec<DeadNameRegistration>,
    /// Port set membership (if any)
    pub(crate) pset: Option<Weak<PortSet>>,
    /// Bound kernel object
    pub(crate) kobject: PortKobject,
}

/// Snapshot of a port, as reported by `mach_port_get_attributes`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortStatus {
    pub active: bool,
    pub receiver: Option<SpaceId>,
    pub qlimit: usize,
    pub msgcount: usize,
    pub seqno: u32,
    pub mscount: u32,
    pub srights: u32,
    pub sorights: u32,
    pub has_nsrequest: bool,
    pub dnrequests: usize,
    pub in_set: bool,
}

/// A Mach-style port
pub struct Port {
    id: PortId,
    active: AtomicBool,
    data: Mutex<PortData>,
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Port {
    /// Create a new port with no receiver
    pub fn new(qlimit: usize) -> PortRef {
        let port = Arc::new(Self {
            id: PortId::new(),
            active: AtomicBool::new(true),
            data: Mutex::new(PortData {
                receiver: None,
                mqueue: IpcMqueue::with_limit(qlimit),
                srights: 0,
                sorights: 0,
                mscount: 0,
                nsrequest: None,
                dnrequests: Vec::new(),
                pset: None,
                kobject: PortKobject::default(),
            }),
        });
        log::trace!("ipc_port: {} created (qlimit {})", port.id, qlimit);
        port
    }

    /// Get the port identity
    pub fn id(&self) -> PortId {
        self.id
    }

    /// Check if port is active
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Check if port is dead
    pub fn is_dead(&self) -> bool {
        !self.is_active()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PortData> {
        self.data.lock()
    }

    /// Current state of the port
    pub fn status(&self) -> PortStatus {
        let data = self.lock();
        PortStatus {
            active: self.is_active(),
            receiver: data.receiver,
            qlimit: data.mqueue.limit(),
            msgcount: data.mqueue.count(),
            seqno: data.mqueue.seqno(),
            mscount: data.mscount,
            srights: data.srights,
            sorights: data.sorights,
            has_nsrequest: data.nsrequest.is_some(),
            dnrequests: data.dnrequests.len(),
            in_set: data.pset.is_some(),
        }
    }

    /// Get send right count
    pub fn send_right_count(&self) -> u32 {
        self.lock().srights
    }

    /// Get send-once right count
    pub fn send_once_right_count(&self) -> u32 {
        self.lock().sorights
    }

    /// Space currently holding the receive right
    pub fn receiver(&self) -> Option<SpaceId> {
        self.lock().receiver
    }

    // ========================================================================
    // Right accounting (Mach4 ipc_port_make_send and friends)
    // ========================================================================

    /// Make a new send right (from receive right)
    pub(crate) fn make_send(&self) {
        let mut data = self.lock();
        data.mscount = data.mscount.wrapping_add(1);
        data.srights += 1;
    }

    /// Take back a send right minted by [`Port::make_send`] that never left
    /// the kernel. Produces no notification.
    pub(crate) fn unmake_send(&self) {
        let mut data = self.lock();
        data.mscount = data.mscount.wrapping_sub(1);
        data.srights = data.srights.saturating_sub(1);
    }

    /// Add a send right (copy of an existing one)
    pub(crate) fn copy_send(&self) {
        self.lock().srights += 1;
    }

    /// Make a new send-once right (from receive right)
    pub(crate) fn make_send_once(&self) {
        self.lock().sorights += 1;
    }

    /// Release a send right; the last one fires the no-senders request
    pub(crate) fn release_send(&self) {
        let fired = {
            let mut data = self.lock();
            data.srights = data.srights.saturating_sub(1);
            if data.srights == 0 && self.is_active() {
                let mscount = data.mscount;
                data.nsrequest.take().map(|notify| (notify, mscount))
            } else {
                None
            }
        };
        if let Some((notify, mscount)) = fired {
            notify::ipc_notify_no_senders(notify, mscount);
        }
    }

    /// Account for a send-once right that was used or silently discarded
    pub(crate) fn release_send_once(&self) {
        let mut data = self.lock();
        data.sorights = data.sorights.saturating_sub(1);
    }

    // ========================================================================
    // Attributes
    // ========================================================================

    /// Set the queue limit
    pub(crate) fn set_qlimit(&self, qlimit: usize) -> IpcResult<()> {
        if qlimit > MQUEUE_MAX_LIMIT {
            return Err(IpcError::InvalidValue);
        }
        self.lock().mqueue.set_limit(qlimit);
        Ok(())
    }

    pub(crate) fn set_mscount(&self, mscount: u32) {
        self.lock().mscount = mscount;
    }

    pub(crate) fn set_seqno(&self, seqno: u32) {
        self.lock().mqueue.set_seqno(seqno);
    }

    /// Install (or clear) the no-senders request.
    ///
    /// If the port has no senders and `sync` does not exceed the make-send
    /// count, the new request fires at once. Returns the previous request.
    pub(crate) fn request_no_senders(
        &self,
        notify: Option<SendOnceRight>,
        sync: u32,
    ) -> Option<SendOnceRight> {
        let (previous, fire) = {
            let mut data = self.lock();
            let previous = data.nsrequest.take();
            let mut fire = None;
            match notify {
                Some(notify) if data.srights == 0 && sync <= data.mscount => {
                    fire = Some((notify, data.mscount));
                }
                other => data.nsrequest = other,
            }
            (previous, fire)
        };
        if let Some((notify, mscount)) = fire {
            notify::ipc_notify_no_senders(notify, mscount);
        }
        previous
    }

    /// Record that entry `name` of `space` wants a dead-name notification.
    ///
    /// Fails with `PortDied` once the port is dead.
    pub(crate) fn register_dnrequest(&self, space: &IpcSpace, name: MachPortName) -> IpcResult<()> {
        let mut data = self.lock();
        if !self.is_active() {
            return Err(IpcError::PortDied);
        }
        if !data
            .dnrequests
            .iter()
            .any(|r| r.space_id == space.id() && r.name == name)
        {
            data.dnrequests.push(DeadNameRegistration {
                space: space.weak(),
                space_id: space.id(),
                name,
            });
        }
        Ok(())
    }

    pub(crate) fn cancel_dnrequest(&self, space_id: SpaceId, name: MachPortName) {
        self.lock()
            .dnrequests
            .retain(|r| !(r.space_id == space_id && r.name == name));
    }

    // ========================================================================
    // Destruction
    // ========================================================================

    /// Destroy the port: every queued message is destroyed, blocked threads
    /// wake with "port died", holders' names become dead names and
    /// dead-name requests fire. Calling it again does nothing.
    pub fn destroy(&self) {
        let (messages, pset, nsrequest) = {
            let mut data = self.lock();
            if !self.active.swap(false, Ordering::AcqRel) {
                return;
            }
            data.receiver = None;
            data.kobject = PortKobject::default();
            (data.mqueue.destroy(), data.pset.take(), data.nsrequest.take())
        };
        log::debug!("ipc_port: {} destroyed ({} queued messages)", self.id, messages.len());

        if let Some(pset) = pset.and_then(|w| w.upgrade()) {
            pset.forget_member(self);
        }

        self.convert_holders();

        // Queued messages may carry rights whose release notifies or
        // destroys other ports; nothing is locked any more.
        drop(messages);
        drop(nsrequest);
    }

    /// Turn every entry holding a dead-name request for this port into a
    /// dead name and send its notification. Other holders convert lazily
    /// the next time their space looks at them.
    ///
    /// This runs port-then-space, against the usual order, so the space
    /// lock is only tried; on contention the port lock is dropped and the
    /// pass restarts.
    fn convert_holders(&self) {
        let mut deferred = Deferred::new();
        loop {
            let mut data = self.lock();
            let Some(reg) = data.dnrequests.last().cloned() else {
                return;
            };
            let Some(space) = reg.space.upgrade() else {
                data.dnrequests.pop();
                continue;
            };
            let Some(mut table) = space.try_lock_table() else {
                drop(data);
                core::hint::spin_loop();
                continue;
            };
            data.dnrequests.pop();
            drop(data);

            let holds_us = table
                .lookup(reg.name)
                .ok()
                .and_then(|e| e.port())
                .is_some_and(|p| core::ptr::eq(Arc::as_ptr(p), self));
            if holds_us {
                right::ipc_right_check(&mut table, reg.name, &mut deferred);
            }
        }
    }
}

/// Allocate a port and install its receive right in `space`
pub fn ipc_port_alloc(space: &IpcSpace, qlimit: usize) -> IpcResult<(MachPortName, PortRef)> {
    let port = Port::new(qlimit);
    let mut table = space.lock_table()?;
    let name = table.alloc(MachPortType::RECEIVE, 0, IpcObject::Port(port.clone()))?;
    port.lock().receiver = Some(space.id());
    drop(table);
    log::debug!("ipc_port: {} allocated as {:#x} in {:?}", port.id(), name, space.id());
    Ok((name, port))
}

/// Allocate a port with the default queue limit
pub fn ipc_port_alloc_default(space: &IpcSpace) -> IpcResult<(MachPortName, PortRef)> {
    ipc_port_alloc(space, MQUEUE_DEFAULT_LIMIT)
}

// ============================================================================
// Kernel-held Send-once Rights
// ============================================================================

/// A send-once right held by the kernel (notification requests)
///
/// Dropping it unused sends a send-once notification to its port.
#[derive(Debug)]
pub struct SendOnceRight(Option<PortRef>);

impl SendOnceRight {
    /// Take ownership of an already counted send-once right
    pub(crate) fn adopt(port: PortRef) -> Self {
        Self(Some(port))
    }

    /// Mint a new send-once right for `port`
    pub(crate) fn make(port: &PortRef) -> Self {
        port.make_send_once();
        Self::adopt(port.clone())
    }

    pub fn port(&self) -> Option<&PortRef> {
        self.0.as_ref()
    }

    /// Surrender the right without notifying
    pub(crate) fn into_port(mut self) -> Option<PortRef> {
        self.0.take()
    }
}

impl Drop for SendOnceRight {
    fn drop(&mut self) {
        if let Some(port) = self.0.take() {
            notify::ipc_notify_send_once(port);
        }
    }
}
