//! IPC Kernel Message - Internal message representation
//!
//! Based on Mach4 ipc/ipc_kmsg.h
//! Kernel messages are the internal representation of Mach messages
//! as they pass through the kernel.
//!
//! Between copyin and copyout a message owns its rights: every port item
//! holds a [`KmsgRight`], and dropping an undelivered message releases them
//! (send rights drop their count, send-once rights turn into send-once
//! notifications, receive rights destroy their port).

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::mem;

use super::entry::MachPortName;
use super::message::{MachMsgBits, MsgTypeName, MACH_MSG_HEADER_SIZE};
use super::port::{PortRef, SendOnceRight};
use super::right;
use crate::mach_vm::VmMapCopy;

// ============================================================================
// Rights in Transit
// ============================================================================

/// What a right in transit refers to
#[derive(Debug, Clone, Default)]
pub enum KmsgObject {
    /// MACH_PORT_NULL
    #[default]
    Null,
    /// A dead name (MACH_PORT_DEAD on copyout)
    Dead,
    /// A live (or recently destroyed) port
    Port(PortRef),
}

impl KmsgObject {
    pub fn port(&self) -> Option<&PortRef> {
        match self {
            KmsgObject::Port(port) => Some(port),
            _ => None,
        }
    }
}

/// Where a copied-in right came from, kept so a failed send can put it back
#[derive(Debug)]
pub(crate) enum Origin {
    /// Taken out of the sender's entry `name`; `request` is the dead-name
    /// request that left with the last user reference
    Moved {
        name: MachPortName,
        request: Option<SendOnceRight>,
    },
    /// A new send right sharing the sender's
    Copied,
    /// Minted from the sender's receive right
    Made,
    /// Nothing was taken (null or dead reply)
    Nothing,
}

/// A right owned by a message
#[derive(Debug)]
pub struct KmsgRight {
    object: KmsgObject,
    ty: MsgTypeName,
}

impl KmsgRight {
    pub(crate) fn new(object: KmsgObject, ty: MsgTypeName) -> Self {
        Self { object, ty }
    }

    pub(crate) fn null() -> Self {
        Self::new(KmsgObject::Null, MsgTypeName::PORT_SEND)
    }

    /// Right type after copyin (`PORT_SEND`, `PORT_SEND_ONCE`, `PORT_RECEIVE`)
    pub fn ty(&self) -> MsgTypeName {
        self.ty
    }

    pub fn object(&self) -> &KmsgObject {
        &self.object
    }

    pub fn port(&self) -> Option<&PortRef> {
        self.object.port()
    }

    pub fn is_null(&self) -> bool {
        matches!(self.object, KmsgObject::Null)
    }

    /// Take the object out without releasing the right
    pub(crate) fn take(&mut self) -> KmsgObject {
        mem::take(&mut self.object)
    }
}

impl Drop for KmsgRight {
    fn drop(&mut self) {
        if let KmsgObject::Port(port) = mem::take(&mut self.object) {
            right::ipc_object_destroy(port, self.ty);
        }
    }
}

// ============================================================================
// Kernel Message
// ============================================================================

/// A body item after copyin
#[derive(Debug)]
pub enum KmsgItem {
    Inline(Vec<u8>),
    Port(KmsgRight),
    /// Out-of-line memory; `None` for a zero-length region
    Ool(Option<VmMapCopy>),
}

impl KmsgItem {
    fn wire_size(&self) -> usize {
        match self {
            KmsgItem::Inline(data) => 8 + ((data.len() + 3) & !3),
            KmsgItem::Port(_) => 12,
            KmsgItem::Ool(_) => 24,
        }
    }
}

/// Kernel message
#[derive(Debug)]
pub struct IpcKmsg {
    /// Header bits as sent
    bits: MachMsgBits,
    /// Wire size
    size: u32,
    /// Destination right
    pub(crate) dest: KmsgRight,
    /// Reply right
    pub(crate) reply: KmsgRight,
    /// Sequence number assigned at dequeue
    seqno: u32,
    /// Message ID
    id: i32,
    /// Translated body
    pub(crate) body: Vec<KmsgItem>,
}

impl IpcKmsg {
    pub(crate) fn new(
        bits: MachMsgBits,
        id: i32,
        dest: KmsgRight,
        reply: KmsgRight,
        body: Vec<KmsgItem>,
    ) -> Box<Self> {
        let size = MACH_MSG_HEADER_SIZE + body.iter().map(KmsgItem::wire_size).sum::<usize>();
        Box::new(Self {
            bits,
            size: size as u32,
            dest,
            reply,
            seqno: 0,
            id,
            body,
        })
    }

    /// A kernel-generated message with inline data and no rights
    pub fn kernel(id: i32, data: Vec<u8>) -> Box<Self> {
        let body = if data.is_empty() {
            Vec::new()
        } else {
            alloc::vec![KmsgItem::Inline(data)]
        };
        Self::new(MachMsgBits::default(), id, KmsgRight::null(), KmsgRight::null(), body)
    }

    /// Address the message with `dest`
    pub(crate) fn with_dest(mut self: Box<Self>, dest: KmsgRight) -> Box<Self> {
        self.bits = MachMsgBits::new(dest.ty() as u32, 0);
        self.dest = dest;
        self
    }

    /// Message size
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn seqno(&self) -> u32 {
        self.seqno
    }

    pub(crate) fn set_seqno(&mut self, seqno: u32) {
        self.seqno = seqno;
    }

    pub fn bits(&self) -> MachMsgBits {
        self.bits
    }

    /// Is this a complex message (rights or memory in the body)?
    pub fn is_complex(&self) -> bool {
        self.body.iter().any(|item| !matches!(item, KmsgItem::Inline(_)))
    }

    pub fn dest_port(&self) -> Option<&PortRef> {
        self.dest.port()
    }

    /// Every right the message owns, in copyin order: destination, reply,
    /// then body items
    pub(crate) fn rights_mut(&mut self) -> impl Iterator<Item = &mut KmsgRight> {
        let Self {
            dest, reply, body, ..
        } = self;
        [dest, reply].into_iter().chain(body.iter_mut().filter_map(|item| match item {
            KmsgItem::Port(right) => Some(right),
            _ => None,
        }))
    }

    /// Concatenated inline data
    pub fn inline_data(&self) -> Vec<u8> {
        self.body
            .iter()
            .filter_map(|item| match item {
                KmsgItem::Inline(data) => Some(data.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }
}
