// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The engine handle.
//!
//! An [`Stm`] bundles all engine-wide state: the ownership table, the
//! version clock, the thread registry, callback tables and the
//! irrevocability flag. Handles are cheap to clone and share; independent
//! instances are fully isolated from each other.

use crate::backoff::Backoff;
use crate::callbacks::{CallbackTables, EventHandlers};
use crate::clock::VersionClock;
use crate::config::{StmConfig, Word};
use crate::errors::TxError;
use crate::lock::{LockTable, LockWord, OwnerId};
use crate::quiesce::ThreadRegistry;
use crate::transaction::Transaction;
use log::info;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

pub(crate) struct StmShared {
    pub config: StmConfig,
    pub clock: VersionClock,
    pub locks: LockTable,
    pub registry: ThreadRegistry,
    pub callbacks: CallbackTables,
    /// Global irrevocability token; non-zero while some transaction runs
    /// irrevocably.
    pub irrevocable: AtomicUsize,
    next_owner: AtomicU32,
    nb_specific: AtomicUsize,
}

/// Engine parameter value, see [`Stm::parameter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parameter {
    Text(&'static str),
    Number(usize),
}

pub struct Stm {
    pub(crate) shared: Arc<StmShared>,
}

impl Clone for Stm {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Default for Stm {
    fn default() -> Self {
        Self::new(StmConfig::default())
    }
}

impl Stm {
    pub fn new(mut config: StmConfig) -> Self {
        config.version_max = config.version_max.min(StmConfig::highest_version_max());
        let locks = LockTable::new(&config);
        info!(
            "stm engine up: design={} lock_slots={} version_max={}",
            config.design.name(),
            locks.len(),
            config.version_max
        );
        Self {
            shared: Arc::new(StmShared {
                clock: VersionClock::new(),
                locks,
                registry: ThreadRegistry::new(),
                callbacks: CallbackTables::new(config.max_callbacks),
                irrevocable: AtomicUsize::new(0),
                next_owner: AtomicU32::new(1),
                nb_specific: AtomicUsize::new(0),
                config,
            }),
        }
    }

    /// Allocate and register a descriptor for the calling thread. The
    /// descriptor lives until it is dropped and drives every region the
    /// thread executes.
    pub fn attach<'a>(&self) -> Transaction<'a> {
        Transaction::attach(self.clone())
    }

    pub(crate) fn allocate_owner(&self) -> OwnerId {
        let id = self.shared.next_owner.fetch_add(1, Ordering::SeqCst);
        debug_assert!(id != u32::MAX, "owner id space exhausted");
        OwnerId(id)
    }

    /// Current value of the global version clock.
    pub fn clock(&self) -> Word {
        self.shared.clock.now()
    }

    /// Number of currently attached threads.
    pub fn thread_count(&self) -> usize {
        self.shared.registry.thread_count()
    }

    /// Register external module callbacks. Must be called before threads
    /// attach; descriptors snapshot the tables at attach time.
    pub fn register(&self, handlers: EventHandlers) -> Result<(), TxError> {
        self.shared.callbacks.register(handlers)
    }

    /// Reserve a per-transaction opaque slot; returns its key.
    pub fn create_specific(&self) -> Result<usize, TxError> {
        let max = self.shared.config.max_specific_slots;
        let key = self.shared.nb_specific.fetch_add(1, Ordering::SeqCst);
        if key >= max {
            self.shared.nb_specific.store(max, Ordering::SeqCst);
            return Err(TxError::SpecificSlotsExhausted);
        }
        Ok(key)
    }

    pub(crate) fn specific_slots_created(&self) -> usize {
        self.shared.nb_specific.load(Ordering::SeqCst)
    }

    /// Engine parameter introspection by name.
    pub fn parameter(&self, name: &str) -> Option<Parameter> {
        let cfg = &self.shared.config;
        match name {
            "design" => Some(Parameter::Text(cfg.design.name())),
            "contention_manager" => Some(Parameter::Text("suicide")),
            "initial_rw_set_size" => Some(Parameter::Number(cfg.initial_set_capacity)),
            "lock_array_log_size" => Some(Parameter::Number(cfg.lock_array_log_size as usize)),
            "stripe_shift_extra" => Some(Parameter::Number(cfg.stripe_shift_extra as usize)),
            "max_specific_slots" => Some(Parameter::Number(cfg.max_specific_slots)),
            "max_callbacks" => Some(Parameter::Number(cfg.max_callbacks)),
            "version_max" => Some(Parameter::Number(cfg.version_max)),
            _ => None,
        }
    }

    /// Timestamp-consistent read outside any transaction: returns the value
    /// together with the version of its stripe.
    pub fn unit_load(&self, addr: &AtomicUsize) -> (Word, Word) {
        let slot = self.shared.locks.slot(self.shared.locks.stripe_of(addr));
        let mut backoff = Backoff::default();
        loop {
            let l1 = LockWord::from_raw(slot.load(Ordering::Acquire));
            if l1.is_owned() {
                backoff.wait();
                continue;
            }
            let value = addr.load(Ordering::Acquire);
            let l2 = LockWord::from_raw(slot.load(Ordering::Acquire));
            if l1 == l2 {
                return (value, l1.version());
            }
        }
    }

    /// Store outside any transaction; returns the commit timestamp the
    /// stripe was stamped with. Must not be called from inside a region on
    /// the same thread.
    pub fn unit_store(&self, addr: &AtomicUsize, value: Word) -> Word {
        match self.unit_write(addr, value, Word::MAX, None) {
            Ok(t) => t,
            Err(_) => unreachable!("unconditional unit store cannot fail"),
        }
    }

    pub fn unit_store_masked(&self, addr: &AtomicUsize, value: Word, mask: Word) -> Word {
        match self.unit_write(addr, value, mask, None) {
            Ok(t) => t,
            Err(_) => unreachable!("unconditional unit store cannot fail"),
        }
    }

    /// Guarded unit store: fails with the current stripe version when the
    /// stripe has already advanced past `bound`.
    pub fn unit_store_after(
        &self,
        addr: &AtomicUsize,
        value: Word,
        mask: Word,
        bound: Word,
    ) -> Result<Word, Word> {
        self.unit_write(addr, value, mask, Some(bound))
    }

    fn unit_write(
        &self,
        addr: &AtomicUsize,
        value: Word,
        mask: Word,
        bound: Option<Word>,
    ) -> Result<Word, Word> {
        let shared = &self.shared;
        let slot = shared.locks.slot(shared.locks.stripe_of(addr));
        let mut backoff = Backoff::default();
        loop {
            let l = LockWord::from_raw(slot.load(Ordering::Acquire));
            if l.is_owned() {
                backoff.wait();
                continue;
            }
            if let Some(bound) = bound {
                if l.version() > bound {
                    return Err(l.version());
                }
            }
            if slot
                .compare_exchange(l.raw(), LockWord::UNIT.raw(), Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            if mask == Word::MAX {
                addr.store(value, Ordering::Relaxed);
            } else {
                let current = addr.load(Ordering::Relaxed);
                addr.store((current & !mask) | (value & mask), Ordering::Relaxed);
            }
            // timestamp may exceed the rollover threshold by up to the
            // thread bound; the slack is accounted for in version_max
            let t = shared.clock.advance() + 1;
            slot.store(LockWord::from_version(t).raw(), Ordering::Release);
            if t >= shared.config.version_max {
                shared.registry.barrier(None, || {
                    if shared.clock.now() >= shared.config.version_max {
                        info!("version clock rollover");
                        shared.locks.reset();
                        shared.clock.reset();
                    }
                });
            }
            return Ok(t);
        }
    }
}
