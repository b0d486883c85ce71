//! Mach Message System Call
//!
//! Based on Mach4 ipc/mach_msg.c by CMU (1987-1991)
//!
//! This module implements the mach_msg() system call, which is the fundamental
//! IPC primitive in Mach. It handles both message sending and receiving in
//! a single system call for efficiency.
//!
//! ## Send
//!
//! The header and body are copied in under the sender's space lock. Every
//! right taken from the sender is recorded, so a send that fails (bad body
//! item, timeout, interruption, destination death) puts the rights back.
//! The only blocking step, waiting for queue space, comes last.
//!
//! ## Receive
//!
//! Rights are translated into the receiver's space when the message is
//! dequeued. If they would not fit the message goes back to the head of the
//! queue. The header comes back swapped: `msgh_remote_port` is the reply
//! right, `msgh_local_port` the receive right the message arrived on.
//!
//! ## Combined Send/Receive
//!
//! When both SEND and RCV are specified, the message is sent first,
//! then a response is received (RPC optimization).

use alloc::boxed::Box;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::mem;
use core::time::Duration;
use spin::Mutex;
use thiserror::Error;

use super::entry::{IpcEntryTable, MachPortName, MachPortType};
use super::kmsg::{IpcKmsg, KmsgItem, KmsgObject, KmsgRight, Origin};
use super::message::{
    MachMessage, MachMsgBits, MachMsgHeader, MsgItem, MsgTypeName, MACH_MSG_DESC_MAX,
    MACH_MSG_SIZE_MAX,
};
use super::mqueue::{ipc_mqueue_receive, ipc_mqueue_send};
use super::port::PortRef;
use super::right::{self, Deferred};
use super::space::IpcSpace;
use super::{mach_port_valid, MACH_PORT_NULL};
use crate::kern::sched_prim::Deadline;
use crate::mach_vm::VmAddress;

// ============================================================================
// Message Return Codes (mach/message.h)
// ============================================================================

/// Operation successful
pub const MACH_MSG_SUCCESS: i32 = 0;

pub const MACH_SEND_INVALID_DATA: i32 = 0x1000_0002;
pub const MACH_SEND_INVALID_DEST: i32 = 0x1000_0003;
pub const MACH_SEND_TIMED_OUT: i32 = 0x1000_0004;
pub const MACH_SEND_INTERRUPTED: i32 = 0x1000_0007;
pub const MACH_SEND_MSG_TOO_SMALL: i32 = 0x1000_0008;
pub const MACH_SEND_INVALID_REPLY: i32 = 0x1000_0009;
pub const MACH_SEND_INVALID_RIGHT: i32 = 0x1000_000a;
pub const MACH_SEND_INVALID_MEMORY: i32 = 0x1000_000c;
pub const MACH_SEND_TOO_LARGE: i32 = 0x1000_000e;
pub const MACH_SEND_INVALID_TYPE: i32 = 0x1000_000f;
pub const MACH_SEND_INVALID_HEADER: i32 = 0x1000_0010;

pub const MACH_RCV_INVALID_NAME: i32 = 0x1000_4002;
pub const MACH_RCV_TIMED_OUT: i32 = 0x1000_4003;
pub const MACH_RCV_TOO_LARGE: i32 = 0x1000_4004;
pub const MACH_RCV_INTERRUPTED: i32 = 0x1000_4005;
pub const MACH_RCV_PORT_CHANGED: i32 = 0x1000_4006;
pub const MACH_RCV_INVALID_DATA: i32 = 0x1000_4008;
pub const MACH_RCV_PORT_DIED: i32 = 0x1000_4009;
pub const MACH_RCV_IN_SET: i32 = 0x1000_400a;
pub const MACH_RCV_HEADER_ERROR: i32 = 0x1000_400b;
pub const MACH_RCV_BODY_ERROR: i32 = 0x1000_400c;

/// Error qualifier: the receiver's space ran out of names
pub const MACH_MSG_IPC_SPACE: i32 = 0x0000_2000;
/// Error qualifier: the receiver's address map ran out of room
pub const MACH_MSG_VM_SPACE: i32 = 0x0000_1000;

/// mach_msg failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MsgError {
    #[error("malformed message header")]
    SendInvalidHeader,
    #[error("invalid destination port")]
    SendInvalidDest,
    #[error("invalid reply port")]
    SendInvalidReply,
    #[error("invalid port right in message body")]
    SendInvalidRight,
    #[error("invalid out-of-line memory")]
    SendInvalidMemory,
    #[error("send timed out")]
    SendTimedOut,
    #[error("send interrupted")]
    SendInterrupted,
    #[error("message too large")]
    SendTooLarge,
    #[error("message smaller than its header")]
    SendMsgTooSmall,
    #[error("malformed message body")]
    SendInvalidData,
    #[error("unknown body item type")]
    SendInvalidType,
    #[error("destination port died while waiting")]
    SendPortDied,
    #[error("invalid receive name")]
    RcvInvalidName,
    #[error("receive timed out")]
    RcvTimedOut,
    #[error("message of {size} bytes does not fit the receive buffer")]
    RcvTooLarge { size: u32 },
    #[error("receive interrupted")]
    RcvInterrupted,
    #[error("receive right changed hands")]
    RcvPortChanged,
    #[error("invalid receive data")]
    RcvInvalidData,
    #[error("port died")]
    RcvPortDied,
    #[error("port is a member of a port set")]
    RcvInSet,
    #[error("no room for the message's rights in the receiver's space")]
    RcvNoSpace,
    #[error("no room for the message's memory in the receiver's address map")]
    RcvNoMemory,
}

impl MsgError {
    /// The `mach_msg_return_t` value
    pub fn code(self) -> i32 {
        match self {
            Self::SendInvalidHeader => MACH_SEND_INVALID_HEADER,
            Self::SendInvalidDest | Self::SendPortDied => MACH_SEND_INVALID_DEST,
            Self::SendInvalidReply => MACH_SEND_INVALID_REPLY,
            Self::SendInvalidRight => MACH_SEND_INVALID_RIGHT,
            Self::SendInvalidMemory => MACH_SEND_INVALID_MEMORY,
            Self::SendTimedOut => MACH_SEND_TIMED_OUT,
            Self::SendInterrupted => MACH_SEND_INTERRUPTED,
            Self::SendTooLarge => MACH_SEND_TOO_LARGE,
            Self::SendMsgTooSmall => MACH_SEND_MSG_TOO_SMALL,
            Self::SendInvalidData => MACH_SEND_INVALID_DATA,
            Self::SendInvalidType => MACH_SEND_INVALID_TYPE,
            Self::RcvInvalidName => MACH_RCV_INVALID_NAME,
            Self::RcvTimedOut => MACH_RCV_TIMED_OUT,
            Self::RcvTooLarge { .. } => MACH_RCV_TOO_LARGE,
            Self::RcvInterrupted => MACH_RCV_INTERRUPTED,
            Self::RcvPortChanged => MACH_RCV_PORT_CHANGED,
            Self::RcvInvalidData => MACH_RCV_INVALID_DATA,
            Self::RcvPortDied => MACH_RCV_PORT_DIED,
            Self::RcvInSet => MACH_RCV_IN_SET,
            Self::RcvNoSpace => MACH_RCV_HEADER_ERROR | MACH_MSG_IPC_SPACE,
            Self::RcvNoMemory => MACH_RCV_BODY_ERROR | MACH_MSG_VM_SPACE,
        }
    }

    pub fn is_send_error(self) -> bool {
        self.code() & 0x4000 == 0
    }
}

/// Raw return value from mach_msg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MachMsgReturn(pub i32);

impl MachMsgReturn {
    /// Success
    pub const SUCCESS: Self = Self(MACH_MSG_SUCCESS);

    /// Check if successful
    pub fn is_success(self) -> bool {
        self.0 == MACH_MSG_SUCCESS
    }
}

impl<T> From<Result<T, MsgError>> for MachMsgReturn {
    fn from(result: Result<T, MsgError>) -> Self {
        match result {
            Ok(_) => Self::SUCCESS,
            Err(err) => Self(err.code()),
        }
    }
}

// ============================================================================
// mach_msg Options
// ============================================================================

bitflags! {
    /// mach_msg option bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MachMsgOption: u32 {
        /// Send a message
        const SEND_MSG = 0x0000_0001;
        /// Receive a message
        const RCV_MSG = 0x0000_0002;
        /// Bound the send by `send_timeout`
        const SEND_TIMEOUT = 0x0000_0010;
        /// Bound the receive by `rcv_timeout`
        const RCV_TIMEOUT = 0x0000_0100;
        /// Ignore the queue limit (kernel senders only)
        const SEND_ALWAYS = 0x0001_0000;
    }
}

/// Options for mach_msg operation
#[derive(Debug, Clone, Copy, Default)]
pub struct MachMsgOptions {
    pub flags: MachMsgOption,
    /// Send timeout (if SEND_TIMEOUT set); zero means do not wait
    pub send_timeout: Option<Duration>,
    /// Receive timeout (if RCV_TIMEOUT set)
    pub rcv_timeout: Option<Duration>,
}

impl MachMsgOptions {
    /// Create options for send only
    pub fn send() -> Self {
        Self {
            flags: MachMsgOption::SEND_MSG,
            ..Default::default()
        }
    }

    /// Create options for receive only
    pub fn receive() -> Self {
        Self {
            flags: MachMsgOption::RCV_MSG,
            ..Default::default()
        }
    }

    /// Create options for send+receive (RPC)
    pub fn rpc() -> Self {
        Self {
            flags: MachMsgOption::SEND_MSG | MachMsgOption::RCV_MSG,
            ..Default::default()
        }
    }

    /// Add send timeout
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.flags |= MachMsgOption::SEND_TIMEOUT;
        self.send_timeout = Some(timeout);
        self
    }

    /// Add receive timeout
    pub fn with_rcv_timeout(mut self, timeout: Duration) -> Self {
        self.flags |= MachMsgOption::RCV_TIMEOUT;
        self.rcv_timeout = Some(timeout);
        self
    }

    /// Fail at once instead of waiting for queue space
    pub fn no_wait(self) -> Self {
        self.with_send_timeout(Duration::ZERO)
    }

    pub fn send_deadline(&self) -> Deadline {
        if self.flags.contains(MachMsgOption::SEND_TIMEOUT) {
            Deadline::after(Some(self.send_timeout.unwrap_or(Duration::ZERO)))
        } else {
            Deadline::Never
        }
    }

    pub fn rcv_deadline(&self) -> Deadline {
        if self.flags.contains(MachMsgOption::RCV_TIMEOUT) {
            Deadline::after(Some(self.rcv_timeout.unwrap_or(Duration::ZERO)))
        } else {
            Deadline::Never
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Statistics for mach_msg operations
#[derive(Debug, Clone, Default)]
pub struct MachMsgStats {
    /// Total send operations
    pub sends: u64,
    /// Total receive operations
    pub receives: u64,
    /// Combined send+receive (RPC)
    pub rpcs: u64,
    /// Send timeouts
    pub send_timeouts: u64,
    /// Receive timeouts
    pub rcv_timeouts: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub rcv_errors: u64,
}

static STATS: Mutex<MachMsgStats> = Mutex::new(MachMsgStats {
    sends: 0,
    receives: 0,
    rpcs: 0,
    send_timeouts: 0,
    rcv_timeouts: 0,
    send_errors: 0,
    rcv_errors: 0,
});

/// Get mach_msg statistics
pub fn stats() -> MachMsgStats {
    STATS.lock().clone()
}

fn record_send<T>(result: &Result<T, MsgError>) {
    let mut stats = STATS.lock();
    stats.sends += 1;
    if let Err(err) = result {
        stats.send_errors += 1;
        if *err == MsgError::SendTimedOut {
            stats.send_timeouts += 1;
        }
    }
}

fn record_receive<T>(result: &Result<T, MsgError>) {
    let mut stats = STATS.lock();
    stats.receives += 1;
    if let Err(err) = result {
        stats.rcv_errors += 1;
        if *err == MsgError::RcvTimedOut {
            stats.rcv_timeouts += 1;
        }
    }
}

// ============================================================================
// Send
// ============================================================================

/// Everything copied in from the sender, in copyin order
struct CopiedIn {
    dest: KmsgRight,
    reply: KmsgRight,
    body: Vec<KmsgItem>,
    /// One origin per right: destination, reply, then body port items
    origins: Vec<Origin>,
    /// Sender regions to unmap once the message is queued
    dealloc: Vec<(VmAddress, u64)>,
}

/// Check the parts of a message that can be checked without the space
fn validate(msg: &MachMessage) -> Result<(MsgTypeName, Option<MsgTypeName>), MsgError> {
    let bits = msg.header.msgh_bits;
    if bits.0 & !MachMsgBits::USER != 0 {
        return Err(MsgError::SendInvalidHeader);
    }
    let dest_type = MsgTypeName::from_u32(bits.remote())
        .filter(|t| t.is_send_disposition())
        .ok_or(MsgError::SendInvalidHeader)?;
    let reply_type = if msg.header.msgh_local_port == MACH_PORT_NULL {
        None
    } else {
        Some(
            MsgTypeName::from_u32(bits.local())
                .filter(|t| t.is_send_disposition())
                .ok_or(MsgError::SendInvalidHeader)?,
        )
    };
    if !mach_port_valid(msg.header.msgh_remote_port) {
        return Err(MsgError::SendInvalidDest);
    }
    if msg.wire_size() > MACH_MSG_SIZE_MAX || msg.body.len() > MACH_MSG_DESC_MAX {
        return Err(MsgError::SendTooLarge);
    }
    let complex = msg.body.iter().any(MsgItem::is_complex);
    if complex && !bits.is_complex() {
        return Err(MsgError::SendInvalidData);
    }
    Ok((dest_type, reply_type))
}

/// Give a destination right back to the sender, unless it is a send-once
/// right: those are destroyed, which notifies the receiver, and a dead-name
/// request that left with the name reports it deleted.
fn release_dest(
    space: &IpcSpace,
    table: &mut IpcEntryTable,
    dest: KmsgRight,
    origin: Origin,
    deferred: &mut Deferred,
) {
    if dest.ty() != MsgTypeName::PORT_SEND_ONCE {
        right::ipc_right_rollback(space, table, dest, origin, deferred);
        return;
    }
    if let Origin::Moved { name, request } = origin {
        deferred.port_deleted(request, name);
    }
    deferred.drop_right(dest);
}

/// Put every copied-in right back into the sender's space.
///
/// A send-once destination is not given back when `consume_dest` is set;
/// it is destroyed, which notifies its receiver.
fn rollback(
    space: &IpcSpace,
    rights: Vec<KmsgRight>,
    origins: Vec<Origin>,
    consume_dest: bool,
    deferred: &mut Deferred,
) {
    let mut table = match space.lock_table() {
        Ok(table) => table,
        Err(_) => {
            // The sender's space is gone; the rights die with the message
            for right in rights {
                deferred.drop_right(right);
            }
            return;
        }
    };
    let pairs: Vec<(usize, (KmsgRight, Origin))> =
        rights.into_iter().zip(origins).enumerate().collect();
    for (index, (right, origin)) in pairs.into_iter().rev() {
        if index == 0 && consume_dest {
            release_dest(space, &mut table, right, origin, deferred);
        } else {
            right::ipc_right_rollback(space, &mut table, right, origin, deferred);
        }
    }
}

fn copyin_message(
    space: &IpcSpace,
    msg: &MachMessage,
    dest_type: MsgTypeName,
    reply_type: Option<MsgTypeName>,
    deferred: &mut Deferred,
) -> Result<CopiedIn, MsgError> {
    let mut table = space.lock_table().map_err(|_| MsgError::SendInvalidDest)?;

    let (dest, dest_origin) = right::ipc_right_copyin(
        space,
        &mut table,
        msg.header.msgh_remote_port,
        dest_type,
        deferred,
    )
    .map_err(|_| MsgError::SendInvalidDest)?;
    let Some(dest_port) = dest.port().cloned() else {
        release_dest(space, &mut table, dest, dest_origin, deferred);
        return Err(MsgError::SendInvalidDest);
    };

    let reply = match reply_type {
        None => Ok((KmsgRight::null(), Origin::Nothing)),
        Some(ty) => right::ipc_right_copyin(
            space,
            &mut table,
            msg.header.msgh_local_port,
            ty,
            deferred,
        ),
    };
    let (reply, reply_origin) = match reply {
        Ok(reply) => reply,
        Err(_) => {
            release_dest(space, &mut table, dest, dest_origin, deferred);
            return Err(MsgError::SendInvalidReply);
        }
    };

    let mut copied = CopiedIn {
        dest,
        reply,
        body: Vec::with_capacity(msg.body.len()),
        origins: alloc::vec![dest_origin, reply_origin],
        dealloc: Vec::new(),
    };
    let mut failure = None;
    for item in &msg.body {
        match item {
            MsgItem::Inline(data) => copied.body.push(KmsgItem::Inline(data.clone())),
            MsgItem::Port { name, disposition } => {
                match right::ipc_right_copyin(space, &mut table, *name, *disposition, deferred) {
                    Ok((right, origin)) => {
                        let circular = right.ty() == MsgTypeName::PORT_RECEIVE
                            && right
                                .port()
                                .is_some_and(|p| alloc::sync::Arc::ptr_eq(p, &dest_port));
                        copied.body.push(KmsgItem::Port(right));
                        copied.origins.push(origin);
                        if circular {
                            failure = Some(MsgError::SendInvalidRight);
                            break;
                        }
                    }
                    Err(_) => {
                        failure = Some(MsgError::SendInvalidRight);
                        break;
                    }
                }
            }
            MsgItem::OutOfLine {
                address,
                size,
                deallocate,
            } => {
                if *size == 0 {
                    copied.body.push(KmsgItem::Ool(None));
                    continue;
                }
                match space.vm_map().copyin(*address, *size) {
                    Ok(copy) => {
                        copied.body.push(KmsgItem::Ool(Some(copy)));
                        if *deallocate {
                            copied.dealloc.push((*address, *size));
                        }
                    }
                    Err(err) => {
                        log::debug!(
                            "mach_msg: ool copyin {:#x}+{:#x} failed: {}",
                            address,
                            size,
                            err
                        );
                        failure = Some(MsgError::SendInvalidMemory);
                        break;
                    }
                }
            }
        }
    }
    drop(table);

    if let Some(err) = failure {
        let CopiedIn {
            dest,
            reply,
            body,
            origins,
            ..
        } = copied;
        let mut rights = alloc::vec![dest, reply];
        rights.extend(body.into_iter().filter_map(|item| match item {
            KmsgItem::Port(right) => Some(right),
            _ => None,
        }));
        rollback(space, rights, origins, true, deferred);
        return Err(err);
    }
    Ok(copied)
}

/// Send a message from `space`.
///
/// On failure the sender keeps its rights and memory, except that a
/// send-once destination is consumed by any failure after the header
/// checked out.
pub fn mach_msg_send(
    space: &IpcSpace,
    msg: MachMessage,
    options: &MachMsgOptions,
) -> Result<(), MsgError> {
    let result = send_message(space, &msg, options);
    record_send(&result);
    result
}

fn send_message(
    space: &IpcSpace,
    msg: &MachMessage,
    options: &MachMsgOptions,
) -> Result<(), MsgError> {
    let (dest_type, reply_type) = validate(msg)?;
    let mut deferred = Deferred::new();
    let copied = copyin_message(space, msg, dest_type, reply_type, &mut deferred)?;

    let CopiedIn {
        dest,
        reply,
        body,
        mut origins,
        dealloc,
    } = copied;
    let Some(port) = dest.port().cloned() else {
        return Err(MsgError::SendInvalidDest);
    };
    let always = options.flags.contains(MachMsgOption::SEND_ALWAYS)
        || dest.ty() == MsgTypeName::PORT_SEND_ONCE;
    let reply_bits = if reply.is_null() { 0 } else { reply.ty() as u32 };
    let mut bits = MachMsgBits::new(dest.ty() as u32, reply_bits);
    bits.set_complex(msg.header.msgh_bits.is_complex());
    let kmsg = IpcKmsg::new(bits, msg.header.msgh_id, dest, reply, body);
    log::trace!("mach_msg: send id {} to {} ({} bytes)", kmsg.id(), port.id(), kmsg.size());

    match ipc_mqueue_send(&port, kmsg, always, options.send_deadline()) {
        Ok(()) => {
            for (address, size) in dealloc {
                if let Err(err) = space.vm_map().deallocate(address, size) {
                    log::warn!("mach_msg: ool deallocate {:#x} failed: {}", address, err);
                }
            }
            // Dead-name requests that left with the last reference of a
            // moved right report the name as deleted.
            for origin in origins.drain(..) {
                if let Origin::Moved { name, request } = origin {
                    deferred.port_deleted(request, name);
                }
            }
            Ok(())
        }
        Err((err, mut kmsg)) => {
            log::debug!("mach_msg: send to {} failed: {}", port.id(), err);
            let rights: Vec<KmsgRight> = kmsg
                .rights_mut()
                .map(|right| mem::replace(right, KmsgRight::null()))
                .collect();
            drop(kmsg);
            rollback(space, rights, origins, true, &mut deferred);
            Err(err)
        }
    }
}

// ============================================================================
// Receive
// ============================================================================

enum RcvSource {
    Port(PortRef),
    Set(super::pset::PsetRef),
}

fn resolve_receive(space: &IpcSpace, name: MachPortName) -> Result<RcvSource, MsgError> {
    let entry = space.lookup(name).map_err(|_| MsgError::RcvInvalidName)?;
    if entry.rights.contains(MachPortType::RECEIVE) {
        if let Some(port) = entry.port {
            return Ok(RcvSource::Port(port));
        }
    }
    if entry.rights.contains(MachPortType::PORT_SET) {
        if let Some(pset) = entry.pset {
            return Ok(RcvSource::Set(pset));
        }
    }
    Err(MsgError::RcvInvalidName)
}

/// Map every out-of-line region of `kmsg` into the receiver's address map.
///
/// The message keeps its copies, so on failure the regions mapped so far are
/// removed and the message can be requeued intact.
fn copyout_regions(space: &IpcSpace, kmsg: &IpcKmsg) -> Result<Vec<Option<VmAddress>>, MsgError> {
    let mut addresses = Vec::with_capacity(kmsg.body.len());
    for item in &kmsg.body {
        let KmsgItem::Ool(Some(copy)) = item else {
            addresses.push(None);
            continue;
        };
        match space.vm_map().copyout(copy.clone()) {
            Ok(address) => addresses.push(Some(address)),
            Err(err) => {
                log::debug!("mach_msg: ool copyout into {:?} failed: {}", space.id(), err);
                for (address, item) in addresses.iter().zip(&kmsg.body) {
                    if let (Some(address), KmsgItem::Ool(Some(copy))) = (address, item) {
                        if let Err(err) = space.vm_map().deallocate(*address, copy.size() as u64) {
                            log::warn!("mach_msg: unmapping {:#x} failed: {}", address, err);
                        }
                    }
                }
                return Err(MsgError::RcvNoMemory);
            }
        }
    }
    Ok(addresses)
}

/// Translate a dequeued message into `space`
fn copyout_message(
    space: &IpcSpace,
    port: &PortRef,
    mut kmsg: Box<IpcKmsg>,
) -> Result<MachMessage, MsgError> {
    let mut deferred = Deferred::new();
    let mut table = match space.lock_table() {
        Ok(table) => table,
        Err(_) => {
            port.lock().mqueue.requeue(kmsg);
            return Err(MsgError::RcvInvalidName);
        }
    };
    let rights = core::iter::once(&kmsg.reply).chain(kmsg.body.iter().filter_map(|item| match item {
        KmsgItem::Port(right) => Some(right),
        _ => None,
    }));
    if !right::ipc_right_copyout_fits(&mut table, rights) {
        drop(table);
        log::debug!("mach_msg: receiver {:?} out of names", space.id());
        port.lock().mqueue.requeue(kmsg);
        return Err(MsgError::RcvNoSpace);
    }
    let addresses = match copyout_regions(space, &kmsg) {
        Ok(addresses) => addresses,
        Err(err) => {
            drop(table);
            port.lock().mqueue.requeue(kmsg);
            return Err(err);
        }
    };

    // The destination right is used up by delivery
    let dest_type = kmsg.dest.ty();
    match kmsg.dest.take() {
        KmsgObject::Port(dest) if dest_type == MsgTypeName::PORT_SEND_ONCE => {
            dest.release_send_once()
        }
        KmsgObject::Port(dest) => deferred.release(dest, MsgTypeName::PORT_SEND),
        _ => {}
    }
    let local = table.reverse_lookup(port).unwrap_or(MACH_PORT_NULL);
    let reply_type = if kmsg.reply.is_null() { 0 } else { kmsg.reply.ty() as u32 };
    let reply = mem::replace(&mut kmsg.reply, KmsgRight::null());
    let remote = copyout_or_dead(space, &mut table, reply, &mut deferred);

    let mut body = Vec::with_capacity(kmsg.body.len());
    for (item, address) in mem::take(&mut kmsg.body).into_iter().zip(addresses) {
        match item {
            KmsgItem::Inline(data) => body.push(MsgItem::Inline(data)),
            KmsgItem::Port(right) => {
                let disposition = right.ty();
                let name = copyout_or_dead(space, &mut table, right, &mut deferred);
                body.push(MsgItem::Port { name, disposition });
            }
            KmsgItem::Ool(copy) => body.push(MsgItem::OutOfLine {
                address: address.unwrap_or(0),
                size: copy.map_or(0, |c| c.size() as u64),
                deallocate: false,
            }),
        }
    }
    drop(table);

    let mut bits = MachMsgBits::new(reply_type, dest_type as u32);
    bits.set_complex(kmsg.is_complex());
    let header = MachMsgHeader {
        msgh_bits: bits,
        msgh_size: kmsg.size(),
        msgh_remote_port: remote,
        msgh_local_port: local,
        msgh_seqno: kmsg.seqno(),
        msgh_id: kmsg.id(),
    };
    log::trace!(
        "mach_msg: received id {} seqno {} in {:?}",
        header.msgh_id,
        header.msgh_seqno,
        space.id()
    );
    Ok(MachMessage { header, body })
}

fn copyout_or_dead(
    space: &IpcSpace,
    table: &mut IpcEntryTable,
    right: KmsgRight,
    deferred: &mut Deferred,
) -> MachPortName {
    right::ipc_right_copyout(space, table, right, deferred).unwrap_or_else(|err| {
        log::warn!("mach_msg: right lost on copyout: {}", err);
        super::MACH_PORT_DEAD
    })
}

/// Receive a message on `rcv_name` (a receive right or a port set) into
/// `space`. Messages larger than `rcv_size` bytes stay queued and the
/// needed size is reported.
pub fn mach_msg_receive(
    space: &IpcSpace,
    rcv_name: MachPortName,
    rcv_size: usize,
    options: &MachMsgOptions,
) -> Result<MachMessage, MsgError> {
    let result = receive_message(space, rcv_name, rcv_size, options);
    record_receive(&result);
    result
}

fn receive_message(
    space: &IpcSpace,
    rcv_name: MachPortName,
    rcv_size: usize,
    options: &MachMsgOptions,
) -> Result<MachMessage, MsgError> {
    let deadline = options.rcv_deadline();
    let (port, kmsg) = match resolve_receive(space, rcv_name)? {
        RcvSource::Port(port) => {
            let kmsg = ipc_mqueue_receive(&port, rcv_size, deadline)?;
            (port, kmsg)
        }
        RcvSource::Set(pset) => pset.receive(rcv_size, deadline)?,
    };
    copyout_message(space, &port, kmsg)
}

// ============================================================================
// Combined Operations
// ============================================================================

/// The mach_msg system call: send `msg` if SEND_MSG is set, then receive on
/// `rcv_name` if RCV_MSG is set.
pub fn mach_msg(
    space: &IpcSpace,
    msg: Option<MachMessage>,
    options: &MachMsgOptions,
    rcv_name: MachPortName,
    rcv_size: usize,
) -> Result<Option<MachMessage>, MsgError> {
    let send = options.flags.contains(MachMsgOption::SEND_MSG);
    let receive = options.flags.contains(MachMsgOption::RCV_MSG);
    if send && receive {
        STATS.lock().rpcs += 1;
    }
    if send {
        let msg = msg.ok_or(MsgError::SendInvalidHeader)?;
        mach_msg_send(space, msg, options)?;
    }
    if receive {
        return mach_msg_receive(space, rcv_name, rcv_size, options).map(Some);
    }
    Ok(None)
}

/// Send a request and wait for the reply on the request's reply port
pub fn mach_msg_rpc(
    space: &IpcSpace,
    msg: MachMessage,
    rcv_size: usize,
    options: &MachMsgOptions,
) -> Result<MachMessage, MsgError> {
    let reply = msg.header.msgh_local_port;
    if !mach_port_valid(reply) {
        return Err(MsgError::SendInvalidReply);
    }
    let options = MachMsgOptions {
        flags: options.flags | MachMsgOption::SEND_MSG | MachMsgOption::RCV_MSG,
        ..*options
    };
    mach_msg(space, Some(msg), &options, reply, rcv_size)?.ok_or(MsgError::RcvInvalidData)
}

/// Send a message given in wire form
pub fn mach_msg_send_bytes(
    space: &IpcSpace,
    bytes: &[u8],
    options: &MachMsgOptions,
) -> Result<(), MsgError> {
    let msg = MachMessage::decode(bytes)?;
    mach_msg_send(space, msg, options)
}

/// Receive a message in wire form
pub fn mach_msg_receive_bytes(
    space: &IpcSpace,
    rcv_name: MachPortName,
    rcv_size: usize,
    options: &MachMsgOptions,
) -> Result<Vec<u8>, MsgError> {
    mach_msg_receive(space, rcv_name, rcv_size, options).map(|msg| msg.encode())
}
