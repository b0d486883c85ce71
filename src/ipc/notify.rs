//! IPC Notifications - Port death and other notifications
//!
//! Based on Mach4 ipc/ipc_notify.c
//!
//! A notification is an ordinary message sent through a kernel-held
//! send-once right. It bypasses the destination's queue limit; if the
//! destination is already dead the right is simply discarded.

use alloc::vec::Vec;

use super::entry::MachPortName;
use super::kmsg::{IpcKmsg, KmsgObject, KmsgRight};
use super::message::MsgTypeName;
use super::mqueue::ipc_mqueue_send;
use super::port::{PortRef, SendOnceRight};
use crate::kern::sched_prim::Deadline;

// ============================================================================
// Notification Message IDs (mach/notify.h)
// ============================================================================

pub const MACH_NOTIFY_FIRST: i32 = 0o100;
/// A send-once or send right with a dead-name request was deleted
pub const MACH_NOTIFY_PORT_DELETED: i32 = MACH_NOTIFY_FIRST + 0o01;
pub const MACH_NOTIFY_NO_SENDERS: i32 = MACH_NOTIFY_FIRST + 0o06;
pub const MACH_NOTIFY_SEND_ONCE: i32 = MACH_NOTIFY_FIRST + 0o07;
pub const MACH_NOTIFY_DEAD_NAME: i32 = MACH_NOTIFY_FIRST + 0o10;

/// Types of port notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum NotifyType {
    PortDeleted = MACH_NOTIFY_PORT_DELETED,
    NoSenders = MACH_NOTIFY_NO_SENDERS,
    SendOnce = MACH_NOTIFY_SEND_ONCE,
    DeadName = MACH_NOTIFY_DEAD_NAME,
}

impl NotifyType {
    /// Get message ID for this notification type
    pub fn msg_id(self) -> i32 {
        self as i32
    }

    pub fn from_msg_id(id: i32) -> Option<Self> {
        match id {
            MACH_NOTIFY_PORT_DELETED => Some(Self::PortDeleted),
            MACH_NOTIFY_NO_SENDERS => Some(Self::NoSenders),
            MACH_NOTIFY_SEND_ONCE => Some(Self::SendOnce),
            MACH_NOTIFY_DEAD_NAME => Some(Self::DeadName),
            _ => None,
        }
    }
}

// ============================================================================
// Delivery
// ============================================================================

/// Send a notification through the send-once right to `port`
fn deliver(port: PortRef, kind: NotifyType, body: Vec<u8>) {
    if !port.is_active() {
        port.release_send_once();
        log::trace!("ipc_notify: {:?} to dead {} dropped", kind, port.id());
        return;
    }
    let dest = KmsgRight::new(KmsgObject::Port(port.clone()), MsgTypeName::PORT_SEND_ONCE);
    let kmsg = IpcKmsg::kernel(kind.msg_id(), body).with_dest(dest);
    match ipc_mqueue_send(&port, kmsg, true, Deadline::Never) {
        Ok(()) => log::debug!("ipc_notify: {:?} sent to {}", kind, port.id()),
        Err((err, mut kmsg)) => {
            // The destination died under us; discard without another
            // notification.
            kmsg.dest.take();
            port.release_send_once();
            log::warn!("ipc_notify: {:?} to {} dropped: {}", kind, port.id(), err);
        }
    }
}

fn deliver_right(notify: SendOnceRight, kind: NotifyType, body: Vec<u8>) {
    if let Some(port) = notify.into_port() {
        deliver(port, kind, body);
    }
}

/// A right with a dead-name request was deleted
pub fn ipc_notify_port_deleted(notify: SendOnceRight, name: MachPortName) {
    deliver_right(notify, NotifyType::PortDeleted, name.to_le_bytes().to_vec());
}

/// The last send right to a port went away; carries the make-send count
pub fn ipc_notify_no_senders(notify: SendOnceRight, mscount: u32) {
    deliver_right(notify, NotifyType::NoSenders, mscount.to_le_bytes().to_vec());
}

/// A send-once right was destroyed unused
pub fn ipc_notify_send_once(port: PortRef) {
    deliver(port, NotifyType::SendOnce, Vec::new());
}

/// A name turned into a dead name
pub fn ipc_notify_dead_name(notify: SendOnceRight, name: MachPortName) {
    deliver_right(notify, NotifyType::DeadName, name.to_le_bytes().to_vec());
}
