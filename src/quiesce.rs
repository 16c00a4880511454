// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Thread registry and quiescence barrier.
//!
//! Every attached descriptor publishes its status word here. Stopping the
//! world (for a clock rollover or to enter serial irrevocable mode) raises
//! the quiesce flag and waits until every other registered descriptor is out
//! of its active region; threads observe the flag at the top of `prepare`,
//! park on the condition variable and resume once the flag clears.

use log::info;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[cfg(feature = "no_deadlocks")]
use no_deadlocks::{Condvar, Mutex};
#[cfg(not(feature = "no_deadlocks"))]
use std::sync::{Condvar, Mutex};

pub(crate) mod status {
    pub const IDLE: usize = 0;
    /// Lowest bit indicates activity.
    pub const ACTIVE: usize = 1;
    pub const COMMITTED: usize = 1 << 1;
    pub const ABORTED: usize = 2 << 1;
    pub const COMMITTING: usize = COMMITTED | ACTIVE;
    pub const ABORTING: usize = ABORTED | ACTIVE;
    /// Fourth bit indicates irrevocability.
    pub const IRREVOCABLE: usize = 0x08 | ACTIVE;

    pub fn is_active(s: usize) -> bool {
        s & 0x01 == ACTIVE
    }
}

/// The registry-visible part of a transaction descriptor.
pub(crate) struct TxShared {
    pub status: AtomicUsize,
}

impl TxShared {
    pub fn new() -> Self {
        Self {
            status: AtomicUsize::new(status::IDLE),
        }
    }
}

pub(crate) struct ThreadRegistry {
    threads: Mutex<Vec<Arc<TxShared>>>,
    cond: Condvar,
    /// Non-zero while a coordinator keeps the world stopped.
    quiesce: AtomicUsize,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
            cond: Condvar::new(),
            quiesce: AtomicUsize::new(0),
        }
    }

    pub fn register(&self, shared: Arc<TxShared>) {
        let mut threads = self.threads.lock().expect("thread registry mutex poisoned");
        threads.push(shared);
    }

    pub fn unregister(&self, shared: &Arc<TxShared>) {
        let mut threads = self.threads.lock().expect("thread registry mutex poisoned");
        threads.retain(|t| !Arc::ptr_eq(t, shared));
        // wake a coordinator in case it was waiting for this thread
        self.cond.notify_all();
    }

    pub fn thread_count(&self) -> usize {
        self.threads
            .lock()
            .expect("thread registry mutex poisoned")
            .len()
    }

    /// Called at the top of `prepare`: park while a coordinator keeps the
    /// world stopped. The caller's status is parked as IDLE and restored
    /// afterwards.
    pub fn wait_if_stopped(&self, shared: &TxShared) {
        if self.quiesce.load(Ordering::Acquire) == 0 {
            return;
        }
        let parked = shared.status.swap(status::IDLE, Ordering::SeqCst);
        let mut threads = self.threads.lock().expect("thread registry mutex poisoned");
        while self.quiesce.load(Ordering::Acquire) != 0 {
            threads = self
                .cond
                .wait(threads)
                .expect("thread registry mutex poisoned");
        }
        drop(threads);
        shared.status.store(parked, Ordering::SeqCst);
    }

    /// Raise the quiesce flag and wait until every registered descriptor
    /// except `exclude` is out of its active region. Blocks while another
    /// coordinator holds the flag. The caller must not be active itself.
    pub fn stop_world(&self, exclude: Option<&Arc<TxShared>>) {
        let mut threads = self.threads.lock().expect("thread registry mutex poisoned");
        while self.quiesce.load(Ordering::Acquire) != 0 {
            threads = self
                .cond
                .wait(threads)
                .expect("thread registry mutex poisoned");
        }
        self.quiesce.store(1, Ordering::SeqCst);
        Self::await_inactive(&threads, exclude);
    }

    /// Like [`Self::stop_world`] but callable from an active transaction:
    /// fails instead of blocking when another coordinator is already
    /// stopping the world (waiting would deadlock, since that coordinator
    /// is waiting for us to become inactive).
    pub fn try_stop_world(&self, exclude: Option<&Arc<TxShared>>) -> bool {
        let threads = match self.threads.try_lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        if self.quiesce.load(Ordering::Acquire) != 0 {
            return false;
        }
        self.quiesce.store(1, Ordering::SeqCst);
        Self::await_inactive(&threads, exclude);
        true
    }

    pub fn resume_world(&self) {
        let _threads = self.threads.lock().expect("thread registry mutex poisoned");
        self.quiesce.store(0, Ordering::SeqCst);
        self.cond.notify_all();
    }

    /// Stop the world, run the critical action, resume. Used for clock
    /// rollover.
    pub fn barrier<F: FnOnce()>(&self, exclude: Option<&Arc<TxShared>>, f: F) {
        info!("quiescence barrier requested");
        self.stop_world(exclude);
        f();
        self.resume_world();
    }

    fn await_inactive(threads: &[Arc<TxShared>], exclude: Option<&Arc<TxShared>>) {
        for t in threads {
            if let Some(me) = exclude {
                if Arc::ptr_eq(t, me) {
                    continue;
                }
            }
            // not optimal: statuses are checked sequentially
            while status::is_active(t.status.load(Ordering::SeqCst)) {
                std::thread::yield_now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_unregister() {
        let registry = ThreadRegistry::new();
        let a = Arc::new(TxShared::new());
        let b = Arc::new(TxShared::new());
        registry.register(a.clone());
        registry.register(b.clone());
        assert_eq!(registry.thread_count(), 2);
        registry.unregister(&a);
        assert_eq!(registry.thread_count(), 1);
        registry.unregister(&b);
        assert_eq!(registry.thread_count(), 0);
    }

    #[test]
    fn test_barrier_waits_for_active_thread() {
        let registry = Arc::new(ThreadRegistry::new());
        let worker = Arc::new(TxShared::new());
        registry.register(worker.clone());
        worker.status.store(status::ACTIVE, Ordering::SeqCst);

        let r = registry.clone();
        let w = worker.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            w.status.store(status::COMMITTED, Ordering::SeqCst);
            // a thread reaching `prepare` during the barrier parks until release
            r.wait_if_stopped(&w);
            w.status.load(Ordering::SeqCst)
        });

        let mut ran = false;
        registry.barrier(None, || ran = true);
        assert!(ran);
        assert_eq!(handle.join().expect("worker panicked"), status::COMMITTED);
    }
}
