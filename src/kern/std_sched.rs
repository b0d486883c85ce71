//! Host scheduler backed by std threads
//!
//! Blocking maps onto `std::thread::park`; the unpark token gives the
//! lost-wakeup guarantee [`Scheduler`] requires.

use alloc::collections::BTreeMap;
use core::time::Duration;
use spin::Mutex;
use std::thread::{self, Thread};
use std::time::Instant;

use super::sched_prim::{Scheduler, WaitReason, WaitResult};
use crate::types::ThreadId;

struct ThreadSlot {
    handle: Thread,
    aborted: bool,
}

/// Registered host threads, keyed by the id handed out on first use
static THREADS: Mutex<BTreeMap<ThreadId, ThreadSlot>> = Mutex::new(BTreeMap::new());

/// Per-thread registration, removed when the thread exits
struct Registration {
    id: ThreadId,
}

impl Registration {
    fn register() -> Self {
        let id = ThreadId::new();
        THREADS.lock().insert(
            id,
            ThreadSlot {
                handle: thread::current(),
                aborted: false,
            },
        );
        Registration { id }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        THREADS.lock().remove(&self.id);
    }
}

std::thread_local! {
    static CURRENT: Registration = Registration::register();
}

/// Scheduler for hosted builds
#[derive(Debug)]
pub struct StdScheduler {
    boot: Instant,
}

impl StdScheduler {
    pub fn new() -> Self {
        Self {
            boot: Instant::now(),
        }
    }

    fn take_abort(&self, id: ThreadId) -> bool {
        match THREADS.lock().get_mut(&id) {
            Some(slot) => core::mem::replace(&mut slot.aborted, false),
            None => false,
        }
    }
}

impl Default for StdScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for StdScheduler {
    fn current_thread(&self) -> ThreadId {
        CURRENT.with(|r| r.id)
    }

    fn uptime(&self) -> Duration {
        self.boot.elapsed()
    }

    fn thread_block(&self, reason: WaitReason, timeout: Option<Duration>) -> WaitResult {
        let id = self.current_thread();
        if self.take_abort(id) {
            return WaitResult::Interrupted;
        }
        log::trace!("sched: {:?} blocking ({:?}, timeout {:?})", id, reason, timeout);
        match timeout {
            Some(t) => thread::park_timeout(t),
            None => thread::park(),
        }
        if self.take_abort(id) {
            WaitResult::Interrupted
        } else {
            WaitResult::Normal
        }
    }

    fn thread_wakeup(&self, id: ThreadId) {
        if let Some(slot) = THREADS.lock().get(&id) {
            slot.handle.unpark();
        }
    }

    fn thread_abort(&self, id: ThreadId) {
        if let Some(slot) = THREADS.lock().get_mut(&id) {
            slot.aborted = true;
            slot.handle.unpark();
        }
    }
}
