//! IPC Message Queue - Port message queue management
//!
//! Based on Mach4 ipc/ipc_mqueue.c
//! Each port has a message queue for pending messages.
//!
//! Senders that find the queue at its limit block on the queue; a dequeue
//! grants the longest waiting sender a reserved slot, so a woken sender
//! cannot lose its place to a newcomer. Receivers that find the queue empty
//! block in FIFO order and are handed messages directly.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Weak;

use super::kmsg::IpcKmsg;
use super::mach_msg::MsgError;
use super::port::PortRef;
use crate::kern::sched_prim::{Deadline, WaitQueue, WaitReason, WaitResult, Waiter};

// ============================================================================
// Queue Limits
// ============================================================================

/// Default queue limit (number of messages)
pub const MQUEUE_DEFAULT_LIMIT: usize = 5;

/// Maximum queue limit
pub const MQUEUE_MAX_LIMIT: usize = 1024;

// ============================================================================
// Wakeups
// ============================================================================

/// What a blocked receiver is woken with
#[derive(Debug)]
pub(crate) enum RcvWake {
    /// Direct handoff
    Message(Box<IpcKmsg>),
    /// The next message exceeds the receiver's buffer; it stays queued
    TooLarge(u32),
    PortDied,
    /// The receive right moved or the port joined a set
    PortChanged,
}

/// What a blocked sender is woken with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendWake {
    /// A queue slot has been reserved for the sender
    Ready,
    PortDied,
}

// ============================================================================
// Message Queue
// ============================================================================

/// Message queue for a port
///
/// From Mach4:
/// - Messages are stored in a FIFO queue
/// - Queue has a limit on number of messages
/// - Threads can wait for messages (receive) or for space (send)
#[derive(Debug)]
pub struct IpcMqueue {
    /// Message queue (FIFO)
    messages: VecDeque<Box<IpcKmsg>>,

    /// Maximum number of messages
    limit: usize,

    /// Slots promised to woken senders
    reserved: usize,

    /// Sequence number handed to the next dequeued message
    seqno: u32,

    /// Threads waiting for messages (receivers)
    pub(crate) receivers: WaitQueue<RcvWake>,

    /// Threads waiting for space (senders)
    pub(crate) senders: WaitQueue<SendWake>,
}

impl IpcMqueue {
    /// Create a queue with specified limit
    pub fn with_limit(limit: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            limit: limit.min(MQUEUE_MAX_LIMIT),
            reserved: 0,
            seqno: 0,
            receivers: WaitQueue::new(),
            senders: WaitQueue::new(),
        }
    }

    /// Check if queue is full (reserved slots count as used)
    pub fn is_full(&self) -> bool {
        self.messages.len() + self.reserved >= self.limit
    }

    /// Check if queue is empty
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Get number of queued messages
    pub fn count(&self) -> usize {
        self.messages.len()
    }

    /// Get queue limit
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Sequence number of the next message to be received
    pub fn seqno(&self) -> u32 {
        self.seqno
    }

    pub(crate) fn set_seqno(&mut self, seqno: u32) {
        self.seqno = seqno;
    }

    /// Number of blocked receivers
    pub fn receiver_count(&self) -> usize {
        self.receivers.count()
    }

    /// Number of blocked senders
    pub fn sender_count(&self) -> usize {
        self.senders.count()
    }

    /// Set queue limit; a larger limit admits waiting senders
    pub(crate) fn set_limit(&mut self, new_limit: usize) {
        self.limit = new_limit.min(MQUEUE_MAX_LIMIT);
        self.wake_senders();
    }

    fn next_seqno(&mut self) -> u32 {
        let seqno = self.seqno;
        self.seqno = seqno.wrapping_add(1);
        seqno
    }

    /// Hand a message to the first receiver that can take it, or queue it.
    ///
    /// Receivers whose buffer is too small are woken with the size they
    /// would need. Returns true if the message was queued.
    pub(crate) fn deliver(&mut self, mut kmsg: Box<IpcKmsg>) -> bool {
        while let Some(waiter) = self.receivers.wakeup_one() {
            let size = kmsg.size();
            if size as usize <= waiter.max_size() {
                kmsg.set_seqno(self.next_seqno());
                waiter.post(RcvWake::Message(kmsg));
                return false;
            }
            waiter.post(RcvWake::TooLarge(size));
        }
        self.messages.push_back(kmsg);
        true
    }

    /// Dequeue the head message if it fits in `max_size` bytes.
    ///
    /// A message that does not fit stays queued and its size is returned.
    pub(crate) fn try_dequeue(&mut self, max_size: usize) -> Result<Option<Box<IpcKmsg>>, u32> {
        match self.messages.front() {
            None => return Ok(None),
            Some(front) if front.size() as usize > max_size => return Err(front.size()),
            Some(_) => {}
        }
        let Some(mut kmsg) = self.messages.pop_front() else {
            return Ok(None);
        };
        kmsg.set_seqno(self.next_seqno());
        self.wake_senders();
        Ok(Some(kmsg))
    }

    /// Put back a message whose copyout failed; it keeps its sequence number
    pub(crate) fn requeue(&mut self, kmsg: Box<IpcKmsg>) {
        self.seqno = self.seqno.wrapping_sub(1);
        if self.messages.is_empty() {
            self.deliver(kmsg);
        } else {
            self.messages.push_front(kmsg);
        }
    }

    /// A woken sender claims its reserved slot
    pub(crate) fn take_reservation(&mut self) {
        self.reserved = self.reserved.saturating_sub(1);
    }

    fn wake_senders(&mut self) {
        while self.messages.len() + self.reserved < self.limit {
            match self.senders.wakeup_one() {
                Some(waiter) => {
                    self.reserved += 1;
                    waiter.post(SendWake::Ready);
                }
                None => break,
            }
        }
    }

    /// Wake blocked receivers because the receive right changed hands
    pub(crate) fn change_receiver(&mut self) {
        while let Some(waiter) = self.receivers.wakeup_one() {
            waiter.post(RcvWake::PortChanged);
        }
    }

    /// Wake everybody with "port died" and surrender the queued messages.
    ///
    /// The caller drops the messages after releasing the port lock.
    pub(crate) fn destroy(&mut self) -> VecDeque<Box<IpcKmsg>> {
        while let Some(waiter) = self.receivers.wakeup_one() {
            waiter.post(RcvWake::PortDied);
        }
        self.senders.wakeup_all(SendWake::PortDied);
        self.reserved = 0;
        core::mem::take(&mut self.messages)
    }
}

impl Default for IpcMqueue {
    fn default() -> Self {
        Self::with_limit(MQUEUE_DEFAULT_LIMIT)
    }
}

// ============================================================================
// Blocking Send / Receive
// ============================================================================

fn send_wait_error(result: WaitResult) -> MsgError {
    match result {
        WaitResult::Interrupted => MsgError::SendInterrupted,
        _ => MsgError::SendTimedOut,
    }
}

fn rcv_wait_error(result: WaitResult) -> MsgError {
    match result {
        WaitResult::Interrupted => MsgError::RcvInterrupted,
        _ => MsgError::RcvTimedOut,
    }
}

/// Queue a message on `port`, blocking while the queue is full.
///
/// `always` bypasses the queue limit (send-once destinations and kernel
/// notifications). On failure the message is handed back for rollback.
pub(crate) fn ipc_mqueue_send(
    port: &PortRef,
    kmsg: Box<IpcKmsg>,
    always: bool,
    deadline: Deadline,
) -> Result<(), (MsgError, Box<IpcKmsg>)> {
    let mut granted = false;
    let mut waited = false;
    loop {
        let waiter = {
            let mut data = port.lock();
            if !port.is_active() {
                let err = if waited {
                    MsgError::SendPortDied
                } else {
                    MsgError::SendInvalidDest
                };
                return Err((err, kmsg));
            }
            if granted || always || !data.mqueue.is_full() {
                if granted {
                    data.mqueue.take_reservation();
                }
                let queued = data.mqueue.deliver(kmsg);
                let pset = if queued {
                    data.pset.as_ref().and_then(Weak::upgrade)
                } else {
                    None
                };
                drop(data);
                if let Some(pset) = pset {
                    pset.wakeup_receiver();
                }
                return Ok(());
            }
            if deadline.expired() {
                return Err((MsgError::SendTimedOut, kmsg));
            }
            let waiter = Waiter::current(WaitReason::IpcSend, 0);
            data.mqueue.senders.add(waiter.clone());
            waiter
        };

        waited = true;
        let wake = match waiter.sleep(deadline) {
            Ok(wake) => wake,
            Err(result) => {
                let mut data = port.lock();
                if data.mqueue.senders.remove(&waiter) {
                    return Err((send_wait_error(result), kmsg));
                }
                drop(data);
                match waiter.take() {
                    Some(wake) => wake,
                    None => return Err((send_wait_error(result), kmsg)),
                }
            }
        };
        match wake {
            SendWake::Ready => granted = true,
            SendWake::PortDied => return Err((MsgError::SendPortDied, kmsg)),
        }
    }
}

/// Take the next message from `port`, blocking while the queue is empty.
pub(crate) fn ipc_mqueue_receive(
    port: &PortRef,
    max_size: usize,
    deadline: Deadline,
) -> Result<Box<IpcKmsg>, MsgError> {
    let waiter = {
        let mut data = port.lock();
        if !port.is_active() {
            return Err(MsgError::RcvPortDied);
        }
        if data.pset.is_some() {
            return Err(MsgError::RcvInSet);
        }
        match data.mqueue.try_dequeue(max_size) {
            Ok(Some(kmsg)) => return Ok(kmsg),
            Err(size) => return Err(MsgError::RcvTooLarge { size }),
            Ok(None) => {}
        }
        if deadline.expired() {
            return Err(MsgError::RcvTimedOut);
        }
        let waiter = Waiter::current(WaitReason::IpcReceive, max_size);
        data.mqueue.receivers.add(waiter.clone());
        waiter
    };

    let wake = match waiter.sleep(deadline) {
        Ok(wake) => wake,
        Err(result) => {
            let mut data = port.lock();
            if data.mqueue.receivers.remove(&waiter) {
                return Err(rcv_wait_error(result));
            }
            drop(data);
            waiter.take().ok_or(rcv_wait_error(result))?
        }
    };
    match wake {
        RcvWake::Message(kmsg) => Ok(kmsg),
        RcvWake::TooLarge(size) => Err(MsgError::RcvTooLarge { size }),
        RcvWake::PortDied => Err(MsgError::RcvPortDied),
        RcvWake::PortChanged => Err(MsgError::RcvPortChanged),
    }
}
