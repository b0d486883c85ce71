//! Scheduling Primitives - Wait/Wakeup for blocking IPC
//!
//! Based on Mach4 kern/sched_prim.h/c
//!
//! The IPC core does not own threads. It blocks and wakes them through the
//! [`Scheduler`] collaborator installed with [`install`]. Each blocked thread
//! is represented by a [`Waiter`] parked on the [`WaitQueue`] of the object it
//! waits for; the waker posts a value into the waiter's slot while holding the
//! owning object's lock, so a waiter that finds itself no longer queued is
//! guaranteed to find its slot filled.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::time::Duration;
use spin::{Mutex, Once};

use crate::types::ThreadId;

// ============================================================================
// Wait Results
// ============================================================================

/// Result of a wait operation (from Mach4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum WaitResult {
    /// Thread was awakened normally
    Normal = 0,
    /// Thread was interrupted
    Interrupted = 2,
    /// Wait timed out
    TimedOut = 3,
}

/// Wait reason (for debugging/statistics)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum WaitReason {
    /// No reason
    None = 0,
    /// Waiting for IPC message
    IpcReceive = 1,
    /// Waiting for IPC send
    IpcSend = 2,
}

// ============================================================================
// Scheduler Collaborator
// ============================================================================

/// Thread blocking services consumed by the IPC core
///
/// A wakeup delivered before the target thread blocks must not be lost: the
/// next `thread_block` of that thread returns immediately.
pub trait Scheduler: Send + Sync {
    /// Identity of the calling thread
    fn current_thread(&self) -> ThreadId;

    /// Monotonic time since boot
    fn uptime(&self) -> Duration;

    /// Block the calling thread until woken, aborted, or `timeout` elapses.
    ///
    /// Spurious returns are permitted; callers re-check their condition.
    fn thread_block(&self, reason: WaitReason, timeout: Option<Duration>) -> WaitResult;

    /// Make a blocked (or about to block) thread runnable
    fn thread_wakeup(&self, thread: ThreadId);

    /// Interrupt the current or next wait of `thread`
    fn thread_abort(&self, thread: ThreadId);
}

static SCHEDULER: Once<Box<dyn Scheduler>> = Once::new();

/// Install the scheduler collaborator.
///
/// Returns false when a scheduler is already in place (including the
/// default one, which is installed on first use).
pub fn install(scheduler: Box<dyn Scheduler>) -> bool {
    let mut installed = false;
    SCHEDULER.call_once(|| {
        installed = true;
        scheduler
    });
    if installed {
        log::debug!("sched_prim: scheduler installed");
    }
    installed
}

/// Get the active scheduler
pub fn scheduler() -> &'static dyn Scheduler {
    SCHEDULER.call_once(default_scheduler).as_ref()
}

#[cfg(feature = "std")]
fn default_scheduler() -> Box<dyn Scheduler> {
    Box::new(super::std_sched::StdScheduler::new())
}

#[cfg(not(feature = "std"))]
fn default_scheduler() -> Box<dyn Scheduler> {
    Box::new(PollingScheduler::new())
}

/// Fallback scheduler for builds without threads
///
/// Finite waits expire immediately and infinite waits spin. A kernel is
/// expected to install its real scheduler before any blocking IPC.
#[derive(Debug, Default)]
pub struct PollingScheduler {
    ticks: core::sync::atomic::AtomicU64,
}

impl PollingScheduler {
    pub const fn new() -> Self {
        Self {
            ticks: core::sync::atomic::AtomicU64::new(0),
        }
    }
}

impl Scheduler for PollingScheduler {
    fn current_thread(&self) -> ThreadId {
        ThreadId(0)
    }

    fn uptime(&self) -> Duration {
        use core::sync::atomic::Ordering;
        Duration::from_micros(self.ticks.fetch_add(1, Ordering::Relaxed))
    }

    fn thread_block(&self, _reason: WaitReason, timeout: Option<Duration>) -> WaitResult {
        match timeout {
            Some(_) => WaitResult::TimedOut,
            None => {
                core::hint::spin_loop();
                WaitResult::Normal
            }
        }
    }

    fn thread_wakeup(&self, _thread: ThreadId) {}

    fn thread_abort(&self, _thread: ThreadId) {}
}

// ============================================================================
// Deadlines
// ============================================================================

/// Absolute point in scheduler time at which a wait gives up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Wait forever
    Never,
    /// Give up once uptime reaches this value
    At(Duration),
}

impl Deadline {
    /// Deadline for a relative timeout; `None` waits forever
    pub fn after(timeout: Option<Duration>) -> Self {
        match timeout {
            Some(t) => Deadline::At(scheduler().uptime().saturating_add(t)),
            None => Deadline::Never,
        }
    }

    /// Has the deadline already passed?
    pub fn expired(&self) -> bool {
        match self {
            Deadline::Never => false,
            Deadline::At(at) => scheduler().uptime() >= *at,
        }
    }

    fn remaining(&self) -> Option<Duration> {
        match self {
            Deadline::Never => None,
            Deadline::At(at) => Some(at.saturating_sub(scheduler().uptime())),
        }
    }
}

// ============================================================================
// Waiter Entry
// ============================================================================

/// A thread waiting on an IPC object
#[derive(Debug)]
pub struct Waiter<T> {
    /// The waiting thread
    thread_id: ThreadId,
    /// Wait reason
    reason: WaitReason,
    /// Largest message this waiter accepts (receivers only)
    max_size: usize,
    /// Value posted by the waker
    slot: Mutex<Option<T>>,
}

impl<T> Waiter<T> {
    /// Create a waiter for the calling thread
    pub fn current(reason: WaitReason, max_size: usize) -> Arc<Self> {
        Arc::new(Self {
            thread_id: scheduler().current_thread(),
            reason,
            max_size,
            slot: Mutex::new(None),
        })
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Hand a value to the waiter and make its thread runnable.
    ///
    /// Must be called with the lock of the queue owner held.
    pub fn post(&self, value: T) {
        *self.slot.lock() = Some(value);
        scheduler().thread_wakeup(self.thread_id);
    }

    /// Take the posted value, if any
    pub fn take(&self) -> Option<T> {
        self.slot.lock().take()
    }

    /// Block until a value is posted or the wait ends abnormally.
    ///
    /// On `Err` the caller must remove the waiter from its queue under the
    /// owner's lock; if it is already gone, a value was posted and must be
    /// collected with [`Waiter::take`].
    pub fn sleep(&self, deadline: Deadline) -> Result<T, WaitResult> {
        let sched = scheduler();
        loop {
            if let Some(value) = self.take() {
                return Ok(value);
            }
            let timeout = deadline.remaining();
            if timeout == Some(Duration::ZERO) {
                return Err(WaitResult::TimedOut);
            }
            match sched.thread_block(self.reason, timeout) {
                WaitResult::Normal => continue,
                WaitResult::TimedOut if deadline.expired() => return Err(WaitResult::TimedOut),
                WaitResult::TimedOut => continue,
                WaitResult::Interrupted => return Err(WaitResult::Interrupted),
            }
        }
    }
}

// ============================================================================
// Wait Queue
// ============================================================================

/// FIFO queue of threads waiting on one IPC object
#[derive(Debug)]
pub struct WaitQueue<T> {
    waiters: VecDeque<Arc<Waiter<T>>>,
}

impl<T> WaitQueue<T> {
    /// Create a new wait queue
    pub const fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
        }
    }

    /// Add a waiter at the tail
    pub fn add(&mut self, waiter: Arc<Waiter<T>>) {
        self.waiters.push_back(waiter);
    }

    /// Remove a specific waiter; false if it was already woken
    pub fn remove(&mut self, waiter: &Arc<Waiter<T>>) -> bool {
        match self.waiters.iter().position(|w| Arc::ptr_eq(w, waiter)) {
            Some(pos) => {
                self.waiters.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Dequeue the longest waiting thread
    pub fn wakeup_one(&mut self) -> Option<Arc<Waiter<T>>> {
        self.waiters.pop_front()
    }

    /// Post `value` to every waiter, emptying the queue
    pub fn wakeup_all(&mut self, value: T) -> usize
    where
        T: Clone,
    {
        let count = self.waiters.len();
        for waiter in self.waiters.drain(..) {
            waiter.post(value.clone());
        }
        count
    }

    /// Get count of waiters
    pub fn count(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

impl<T> Default for WaitQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
