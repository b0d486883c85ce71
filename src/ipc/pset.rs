//! IPC Port Sets - Collections of ports for multiplexed receive
//!
//! Based on Mach4 ipc/ipc_pset.c
//! Port sets allow receiving from multiple ports with a single receive.
//!
//! Key concepts from Mach4:
//! - Port sets contain receive rights, not ports directly
//! - A port can be in at most one port set at a time
//! - Receiving from a port set removes the message from the source port
//!
//! Lock order is set before member port. Senders wake a set receiver only
//! after dropping the port lock.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use spin::{Mutex, MutexGuard};

use super::kmsg::IpcKmsg;
use super::mach_msg::MsgError;
use super::port::{Port, PortRef};
use super::{IpcError, IpcResult};
use crate::kern::sched_prim::{Deadline, WaitQueue, WaitReason, WaitResult, Waiter};
use crate::types::PortSetId;

/// Shared handle to a port set
pub type PsetRef = Arc<PortSet>;

/// What a thread blocked on a set is woken with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SetWake {
    /// Some member may have a message; rescan
    Ready,
    Destroyed,
}

#[derive(Debug)]
struct PsetData {
    active: bool,
    /// Members in insertion order
    members: Vec<PortRef>,
    waiters: WaitQueue<SetWake>,
}

/// A port set
pub struct PortSet {
    id: PortSetId,
    data: Mutex<PsetData>,
}

impl fmt::Debug for PortSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortSet").field("id", &self.id).finish()
    }
}

impl PortSet {
    /// Create an empty port set
    pub fn new() -> PsetRef {
        Arc::new(Self {
            id: PortSetId::new(),
            data: Mutex::new(PsetData {
                active: true,
                members: Vec::new(),
                waiters: WaitQueue::new(),
            }),
        })
    }

    pub fn id(&self) -> PortSetId {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, PsetData> {
        self.data.lock()
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    /// Get member count
    pub fn member_count(&self) -> usize {
        self.lock().members.len()
    }

    /// Snapshot of the members
    pub fn members(&self) -> Vec<PortRef> {
        self.lock().members.clone()
    }

    pub fn is_member(&self, port: &Port) -> bool {
        self.lock().members.iter().any(|m| core::ptr::eq(Arc::as_ptr(m), port))
    }

    /// Add a port to the set.
    ///
    /// Threads receiving directly on the port are woken with "port changed".
    pub(crate) fn add_member(self: &Arc<Self>, port: &PortRef) -> IpcResult<()> {
        let mut data = self.lock();
        if !data.active {
            return Err(IpcError::InvalidName);
        }
        let mut pdata = port.lock();
        if !port.is_active() {
            return Err(IpcError::PortDied);
        }
        if pdata.pset.as_ref().is_some_and(|w| w.strong_count() > 0) {
            return Err(IpcError::AlreadyInSet);
        }
        pdata.pset = Some(Arc::downgrade(self));
        pdata.mqueue.change_receiver();
        let pending = !pdata.mqueue.is_empty();
        drop(pdata);
        data.members.push(port.clone());
        if pending {
            if let Some(waiter) = data.waiters.wakeup_one() {
                waiter.post(SetWake::Ready);
            }
        }
        log::trace!("ipc_pset: {} joined {:?}", port.id(), self.id);
        Ok(())
    }

    /// Remove a port from the set
    pub(crate) fn remove_member(&self, port: &PortRef) -> IpcResult<()> {
        let mut data = self.lock();
        let pos = data
            .members
            .iter()
            .position(|m| Arc::ptr_eq(m, port))
            .ok_or(IpcError::NotInSet)?;
        let member = data.members.remove(pos);
        member.lock().pset = None;
        drop(data);
        log::trace!("ipc_pset: {} left {:?}", port.id(), self.id);
        Ok(())
    }

    /// Drop a member that is being destroyed (its own state is already cleared)
    pub(crate) fn forget_member(&self, port: &Port) {
        self.lock()
            .members
            .retain(|m| !core::ptr::eq(Arc::as_ptr(m), port));
    }

    /// A member received a queued message
    pub(crate) fn wakeup_receiver(&self) {
        let mut data = self.lock();
        if let Some(waiter) = data.waiters.wakeup_one() {
            waiter.post(SetWake::Ready);
        }
    }

    /// Destroy the set: members leave, blocked receivers wake
    pub fn destroy(&self) {
        let members = {
            let mut data = self.lock();
            if !data.active {
                return;
            }
            data.active = false;
            data.waiters.wakeup_all(SetWake::Destroyed);
            let members = core::mem::take(&mut data.members);
            for member in &members {
                member.lock().pset = None;
            }
            members
        };
        log::debug!("ipc_pset: {:?} destroyed ({} members)", self.id, members.len());
    }

    /// Receive the first message of any member, scanning in insertion order
    pub(crate) fn receive(
        &self,
        max_size: usize,
        deadline: Deadline,
    ) -> Result<(PortRef, Box<IpcKmsg>), MsgError> {
        loop {
            let waiter = {
                let mut data = self.lock();
                if !data.active {
                    return Err(MsgError::RcvPortDied);
                }
                for member in &data.members {
                    match member.lock().mqueue.try_dequeue(max_size) {
                        Ok(Some(kmsg)) => return Ok((member.clone(), kmsg)),
                        Ok(None) => {}
                        Err(size) => return Err(MsgError::RcvTooLarge { size }),
                    }
                }
                if deadline.expired() {
                    return Err(MsgError::RcvTimedOut);
                }
                let waiter = Waiter::current(WaitReason::IpcReceive, max_size);
                data.waiters.add(waiter.clone());
                waiter
            };

            let wake = match waiter.sleep(deadline) {
                Ok(wake) => wake,
                Err(result) => {
                    let mut data = self.lock();
                    if data.waiters.remove(&waiter) {
                        return Err(set_wait_error(result));
                    }
                    drop(data);
                    match waiter.take() {
                        // Pass an unused wakeup on
                        Some(SetWake::Ready) => {
                            self.wakeup_receiver();
                            return Err(set_wait_error(result));
                        }
                        Some(SetWake::Destroyed) => return Err(MsgError::RcvPortDied),
                        None => return Err(set_wait_error(result)),
                    }
                }
            };
            if wake == SetWake::Destroyed {
                return Err(MsgError::RcvPortDied);
            }
        }
    }
}

fn set_wait_error(result: WaitResult) -> MsgError {
    match result {
        WaitResult::Interrupted => MsgError::RcvInterrupted,
        _ => MsgError::RcvTimedOut,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::mqueue::{ipc_mqueue_receive, ipc_mqueue_send};

    #[test]
    fn test_membership() {
        let pset = PortSet::new();
        let other = PortSet::new();
        let port = Port::new(5);
        pset.add_member(&port).unwrap();
        assert!(pset.is_member(&port));
        assert!(port.status().in_set);
        assert_eq!(other.add_member(&port), Err(IpcError::AlreadyInSet));

        pset.remove_member(&port).unwrap();
        assert_eq!(pset.remove_member(&port), Err(IpcError::NotInSet));
        other.add_member(&port).unwrap();
        assert_eq!(other.member_count(), 1);
    }

    #[test]
    fn test_receive_scans_members_in_order() {
        let pset = PortSet::new();
        let a = Port::new(5);
        let b = Port::new(5);
        pset.add_member(&a).unwrap();
        pset.add_member(&b).unwrap();

        ipc_mqueue_send(&b, IpcKmsg::kernel(2, alloc::vec![]), false, Deadline::Never).unwrap();
        ipc_mqueue_send(&a, IpcKmsg::kernel(1, alloc::vec![]), false, Deadline::Never).unwrap();

        let (from, kmsg) = pset.receive(usize::MAX, Deadline::Never).unwrap();
        assert!(Arc::ptr_eq(&from, &a));
        assert_eq!(kmsg.id(), 1);
        let (from, kmsg) = pset.receive(usize::MAX, Deadline::Never).unwrap();
        assert!(Arc::ptr_eq(&from, &b));
        assert_eq!(kmsg.id(), 2);

        let now = Deadline::after(Some(core::time::Duration::ZERO));
        assert_eq!(pset.receive(usize::MAX, now).err(), Some(MsgError::RcvTimedOut));
    }

    #[test]
    fn test_member_rejects_direct_receive() {
        let pset = PortSet::new();
        let port = Port::new(5);
        pset.add_member(&port).unwrap();
        assert_eq!(
            ipc_mqueue_receive(&port, usize::MAX, Deadline::Never).err(),
            Some(MsgError::RcvInSet)
        );
    }

    #[test]
    fn test_destroy_releases_members() {
        let pset = PortSet::new();
        let port = Port::new(5);
        pset.add_member(&port).unwrap();
        pset.destroy();
        pset.destroy();
        assert!(!pset.is_active());
        assert!(!port.status().in_set);
        assert_eq!(
            pset.receive(usize::MAX, Deadline::Never).err(),
            Some(MsgError::RcvPortDied)
        );
    }

    #[test]
    fn test_destroyed_member_leaves_set() {
        let pset = PortSet::new();
        let port = Port::new(5);
        pset.add_member(&port).unwrap();
        port.destroy();
        assert_eq!(pset.member_count(), 0);
    }
}
