// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Per-thread transaction descriptor and the region state machine.
//!
//! A [`Transaction`] is allocated once per thread via [`Stm::attach`] and
//! reused for every region the thread runs. [`Transaction::run`] drives a
//! region as an explicit retry loop: the body is a closure over the
//! descriptor, every primitive returns `Result`, and an internal conflict
//! rolls the descriptor back, re-prepares it and surfaces as
//! [`TxError::Aborted`], which the loop consumes before re-invoking the
//! body. Nesting is flat: nested starts and commits only move a counter and
//! a nested abort restarts the outermost region.

use crate::backoff::Backoff;
use crate::callbacks::{self, RegionCallbacks};
use crate::config::{Design, Word};
use crate::errors::{AbortReason, TxError};
use crate::lock::{LockWord, OwnerId};
use crate::quiesce::{status, TxShared};
use crate::set::{ReadSet, WriteSet};
use crate::stm::Stm;
use log::{debug, trace};
use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Serial flag on the descriptor's irrevocability state.
const SERIAL_BIT: u8 = 0x08;
/// Low bits track progress: 1 requested, 2 token held, 3 running.
const MODE_MASK: u8 = 0x07;

/// User attributes for one region. Unknown concerns of higher layers do not
/// reach the engine; the engine honors exactly these.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxAttributes {
    /// The region promises not to store. A store under this attribute
    /// clears it and restarts the region writable.
    pub read_only: bool,
    /// Return the abort to the caller instead of retrying.
    pub no_retry: bool,
    /// Never slide the snapshot forward.
    pub no_extend: bool,
}

#[derive(Default)]
struct TxStats {
    aborts: u64,
    aborts_ro: u64,
    aborts_locked_read: u64,
    aborts_locked_write: u64,
    aborts_validate_read: u64,
    aborts_validate_write: u64,
    aborts_validate_commit: u64,
    retries: u64,
    max_retries: u64,
}

pub struct Transaction<'a> {
    stm: Stm,
    shared: Arc<TxShared>,
    id: OwnerId,
    attr: TxAttributes,
    /// Snapshot validity range; every observed version must be at most
    /// `end`, and `end` only moves forward within a region.
    start: Word,
    end: Word,
    ro: bool,
    can_extend: bool,
    irrevocable: u8,
    nesting: u32,
    /// Set by a rollback that re-prepared the descriptor; consumed by the
    /// retry loop.
    pending_retry: bool,
    r_set: ReadSet,
    w_set: WriteSet<'a>,
    specifics: Vec<Option<Arc<dyn Any + Send + Sync>>>,
    callbacks: RegionCallbacks,
    stats: TxStats,
}

impl<'a> Transaction<'a> {
    pub(crate) fn attach(stm: Stm) -> Self {
        let shared = Arc::new(TxShared::new());
        stm.shared.registry.register(shared.clone());
        let callbacks = stm.shared.callbacks.snapshot();
        let id = stm.allocate_owner();
        let capacity = stm.shared.config.initial_set_capacity;
        let bloom = stm.shared.config.bloom_filter;
        let slots = stm.shared.config.max_specific_slots;
        let tx = Self {
            stm,
            shared,
            id,
            attr: TxAttributes::default(),
            start: 0,
            end: 0,
            ro: false,
            can_extend: true,
            irrevocable: 0,
            nesting: 0,
            pending_retry: false,
            r_set: ReadSet::new(capacity),
            w_set: WriteSet::new(capacity, bloom),
            specifics: vec![None; slots],
            callbacks,
            stats: TxStats::default(),
        };
        trace!("descriptor attached (owner {})", tx.id.0);
        callbacks::fire(&tx.callbacks.init);
        tx
    }

    /// Run one region to a committed outcome (or a non-retryable abort).
    ///
    /// The body may be re-invoked any number of times; it must confine its
    /// side effects to loads and stores through the descriptor. A nested
    /// `run` joins the enclosing region.
    pub fn run<T, F>(&mut self, attr: TxAttributes, mut body: F) -> Result<T, TxError>
    where
        F: FnMut(&mut Transaction<'a>) -> Result<T, TxError>,
    {
        if self.nesting > 0 {
            self.nesting += 1;
            let result = body(self);
            if result.is_ok() {
                // a nested commit only unwinds the counter
                self.nesting -= 1;
            }
            return result;
        }

        self.start(attr);
        loop {
            let result = body(self).and_then(|value| self.commit().map(|_| value));
            match result {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if self.pending_retry {
                        self.pending_retry = false;
                        trace!("retrying region after {}", err);
                        continue;
                    }
                    if self.nesting > 0 && self.is_active() {
                        // the body surfaced its own error; the region must
                        // not stay open behind it
                        let _ = self.rollback_inner(AbortReason::OTHER, false);
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Begin a region (or join the enclosing one when nested).
    pub fn start(&mut self, attr: TxAttributes) {
        if self.nesting > 0 {
            self.nesting += 1;
            return;
        }
        self.attr = attr;
        self.nesting = 1;
        self.pending_retry = false;
        self.prepare();
        callbacks::fire(&self.callbacks.start);
    }

    /// Word load with snapshot consistency.
    pub fn load(&mut self, addr: &'a AtomicUsize) -> Result<Word, TxError> {
        if self.nesting == 0 {
            return Err(TxError::NotActive);
        }
        if self.serial_irrevocable() {
            return Ok(addr.load(Ordering::Acquire));
        }
        match self.stm.shared.config.design {
            Design::WriteBackCtl => self.load_ctl(addr),
            Design::WriteBackEtl => self.load_etl(addr),
        }
    }

    /// Buffer a full-word store.
    pub fn store(&mut self, addr: &'a AtomicUsize, value: Word) -> Result<(), TxError> {
        self.store_masked(addr, value, Word::MAX)
    }

    /// Buffer a store of the bits selected by `mask`.
    pub fn store_masked(&mut self, addr: &'a AtomicUsize, value: Word, mask: Word) -> Result<(), TxError> {
        if self.nesting == 0 {
            return Err(TxError::NotActive);
        }
        if self.serial_irrevocable() {
            if mask == Word::MAX {
                addr.store(value, Ordering::Release);
            } else {
                let current = addr.load(Ordering::Relaxed);
                addr.store((current & !mask) | (value & mask), Ordering::Release);
            }
            return Ok(());
        }
        match self.stm.shared.config.design {
            Design::WriteBackCtl => self.write_ctl(addr, value, mask),
            Design::WriteBackEtl => self.write_etl(addr, value, mask),
        }
    }

    /// Commit the region. `Err` means the descriptor was already rolled
    /// back on behalf of the caller; when it was re-prepared the retry loop
    /// picks it up.
    pub fn commit(&mut self) -> Result<(), TxError> {
        if self.nesting == 0 {
            return Err(TxError::NotActive);
        }
        self.nesting -= 1;
        if self.nesting > 0 {
            return Ok(());
        }
        callbacks::fire(&self.callbacks.precommit);
        debug_assert!(self.is_active());

        if self.w_set.is_empty() {
            // a read-only outcome commits immediately
            return self.finish_commit();
        }
        self.shared.status.store(status::COMMITTING, Ordering::SeqCst);
        match self.stm.shared.config.design {
            Design::WriteBackCtl => self.commit_ctl()?,
            Design::WriteBackEtl => self.commit_etl()?,
        }
        self.finish_commit()
    }

    /// Abort the region explicitly. Retries like any conflict abort unless
    /// the region carries the `no_retry` attribute.
    pub fn abort(&mut self, reason: AbortReason) -> Result<(), TxError> {
        if self.nesting == 0 {
            return Err(TxError::NotActive);
        }
        Err(self.rollback(reason | AbortReason::EXPLICIT))
    }

    pub fn is_active(&self) -> bool {
        status::is_active(self.shared.status.load(Ordering::SeqCst))
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.status.load(Ordering::SeqCst) == status::ABORTED
    }

    /// Current flat-nesting depth; zero outside any region.
    pub fn nesting(&self) -> u32 {
        self.nesting
    }

    /// Allow or forbid snapshot extension for the rest of the region,
    /// optionally clamping the snapshot to an externally observed bound.
    pub fn set_extension(&mut self, enable: bool, bound: Option<Word>) {
        self.can_extend = enable;
        if let Some(bound) = bound {
            if bound < self.end {
                self.end = bound;
            }
        }
    }

    /// Make this transaction irrevocable; with `serial` it additionally
    /// quiesces every other thread and accesses memory directly.
    pub fn set_irrevocable(&mut self, serial: bool) -> Result<(), TxError> {
        let stm = self.stm.clone();
        let shared = &stm.shared;
        let serial_bit = if serial { SERIAL_BIT } else { 0 };

        if self.nesting == 0 || !self.is_active() {
            // remembered and acquired when the next region prepares
            self.irrevocable = 1 | serial_bit;
            return Ok(());
        }
        if self.irrevocable & MODE_MASK == 3 {
            return Ok(());
        }
        if self.irrevocable == 0 {
            self.irrevocable = 1 | serial_bit;
            if shared
                .irrevocable
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
            {
                // token taken; restart and queue behind the holder
                return Err(self.rollback(AbortReason::IRREVOCABLE));
            }
            self.irrevocable += 1;
            if !self.validate() {
                self.stats.aborts_validate_commit += 1;
                return Err(self.rollback(AbortReason::VALIDATE));
            }
            if serial && !self.w_set.is_empty() {
                // buffered writes cannot be mixed with the direct accesses
                // of a serial run; restart in serial mode from the top
                return Err(self.rollback(AbortReason::IRREVOCABLE));
            }
        }
        debug_assert_eq!(self.irrevocable & MODE_MASK, 2);
        if self.irrevocable & SERIAL_BIT != 0
            && !shared.registry.try_stop_world(Some(&self.shared))
        {
            // cannot block while active: a concurrent coordinator would
            // wait for us in turn
            return Err(self.rollback(AbortReason::IRREVOCABLE));
        }
        self.irrevocable += 1;
        self.shared.status.store(status::IRREVOCABLE, Ordering::SeqCst);
        Ok(())
    }

    /// Store an opaque value in a slot previously created with
    /// [`Stm::create_specific`].
    pub fn set_specific(&mut self, key: usize, value: Arc<dyn Any + Send + Sync>) -> Result<(), TxError> {
        if key >= self.stm.specific_slots_created() || key >= self.specifics.len() {
            return Err(TxError::UnknownSpecificKey(key));
        }
        self.specifics[key] = Some(value);
        Ok(())
    }

    pub fn get_specific(&self, key: usize) -> Option<Arc<dyn Any + Send + Sync>> {
        self.specifics.get(key).and_then(|slot| slot.clone())
    }

    /// Per-descriptor statistic by name.
    pub fn stat(&self, name: &str) -> Option<u64> {
        match name {
            "read_set_size" => Some(self.r_set.capacity() as u64),
            "write_set_size" => Some(self.w_set.capacity() as u64),
            "read_set_nb_entries" => Some(self.r_set.len() as u64),
            "write_set_nb_entries" => Some(self.w_set.len() as u64),
            "read_only" => Some(self.ro as u64),
            "nb_aborts" => Some(self.stats.aborts),
            "nb_aborts_ro" => Some(self.stats.aborts_ro),
            "nb_aborts_locked_read" => Some(self.stats.aborts_locked_read),
            "nb_aborts_locked_write" => Some(self.stats.aborts_locked_write),
            "nb_aborts_validate_read" => Some(self.stats.aborts_validate_read),
            "nb_aborts_validate_write" => Some(self.stats.aborts_validate_write),
            "nb_aborts_validate_commit" => Some(self.stats.aborts_validate_commit),
            "nb_retries" => Some(self.stats.retries),
            "max_retries" => Some(self.stats.max_retries),
            _ => None,
        }
    }

    fn serial_irrevocable(&self) -> bool {
        self.irrevocable & SERIAL_BIT != 0 && self.irrevocable & MODE_MASK == 3
    }

    /// Reset the descriptor for a fresh region attempt.
    fn prepare(&mut self) {
        let stm = self.stm.clone();
        let shared = &stm.shared;
        loop {
            shared.registry.wait_if_stopped(&self.shared);
            self.start = shared.clock.now();
            self.end = self.start;
            self.can_extend = !self.attr.no_extend;
            if self.start < shared.config.version_max {
                break;
            }
            // the clock is running out of version encoding space
            shared.registry.barrier(Some(&self.shared), || {
                if shared.clock.now() >= shared.config.version_max {
                    log::info!("version clock rollover");
                    shared.locks.reset();
                    shared.clock.reset();
                }
            });
        }
        self.ro = self.attr.read_only;
        self.r_set.clear();
        self.w_set.clear();
        if self.irrevocable != 0 {
            self.reacquire_irrevocability();
            self.shared.status.store(status::IRREVOCABLE, Ordering::SeqCst);
        } else {
            self.shared.status.store(status::ACTIVE, Ordering::SeqCst);
        }
        // a serial run holds the quiesce flag itself and must not park on it
        if self.irrevocable & SERIAL_BIT == 0 {
            shared.registry.wait_if_stopped(&self.shared);
        }
    }

    /// Blocking re-acquisition after a rollback that handed the token back.
    /// Safe to block here: the descriptor is not active yet.
    fn reacquire_irrevocability(&mut self) {
        let stm = self.stm.clone();
        let shared = &stm.shared;
        debug_assert_eq!(self.irrevocable & MODE_MASK, 1);
        while shared
            .irrevocable
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            std::thread::yield_now();
        }
        self.irrevocable += 1;
        if self.irrevocable & SERIAL_BIT != 0 {
            shared.registry.stop_world(Some(&self.shared));
        }
        self.irrevocable += 1;
    }

    fn load_ctl(&mut self, addr: &'a AtomicUsize) -> Result<Word, TxError> {
        let stm = self.stm.clone();
        let locks = &stm.shared.locks;

        let written = self.w_set.find(addr);
        if let Some(index) = written {
            let w = self.w_set.get(index);
            if w.mask == Word::MAX {
                // fully buffered; no need to touch the read set
                return Ok(w.value);
            }
        }

        let slot_index = locks.stripe_of(addr);
        let slot = locks.slot(slot_index);
        let mut backoff = Backoff::default();
        let (value, version) = loop {
            // lock, value, lock: the equal pair brackets a consistent read
            let l1 = LockWord::from_raw(slot.load(Ordering::Acquire));
            if l1.is_owned() {
                // unit store or commit in flight; both are short
                backoff.wait();
                continue;
            }
            let value = addr.load(Ordering::Acquire);
            let l2 = LockWord::from_raw(slot.load(Ordering::Acquire));
            if l1 != l2 {
                continue;
            }
            let version = l1.version();
            if version > self.end {
                if self.ro || !self.can_extend || !self.extend() {
                    self.stats.aborts_validate_read += 1;
                    return Err(self.rollback(AbortReason::VAL_READ));
                }
                // this read is not yet in the read set, so the extension
                // did not cover it; make sure the stripe held still
                if LockWord::from_raw(slot.load(Ordering::Acquire)) != l2 {
                    continue;
                }
            }
            break (value, version);
        };

        let value = match written {
            Some(index) => {
                let w = self.w_set.get(index);
                (value & !w.mask) | (w.value & w.mask)
            }
            None => value,
        };
        if !self.ro
            && !(stm.shared.config.elide_duplicate_reads && self.r_set.contains(slot_index))
        {
            self.r_set.push(slot_index, version);
        }
        Ok(value)
    }

    fn load_etl(&mut self, addr: &'a AtomicUsize) -> Result<Word, TxError> {
        let stm = self.stm.clone();
        let locks = &stm.shared.locks;
        let slot_index = locks.stripe_of(addr);
        let slot = locks.slot(slot_index);

        let mut backoff = Backoff::default();
        let (value, version) = loop {
            let l1 = LockWord::from_raw(slot.load(Ordering::Acquire));
            if l1.is_owned() {
                if l1 == LockWord::UNIT {
                    backoff.wait();
                    continue;
                }
                if l1.owner() == self.id {
                    // our stripe: serve the read from the write log
                    let mut index = l1.entry();
                    loop {
                        let w = self.w_set.get(index);
                        if std::ptr::eq(w.addr, addr) {
                            if w.mask == Word::MAX {
                                return Ok(w.value);
                            }
                            let memory = addr.load(Ordering::Acquire);
                            return Ok((memory & !w.mask) | (w.value & w.mask));
                        }
                        match w.next {
                            Some(next) => index = next as usize,
                            None => break,
                        }
                    }
                    // locked by us for a different address of the stripe
                    return Ok(addr.load(Ordering::Acquire));
                }
                // owned elsewhere: grant a short grace period, then yield
                if backoff.spin() {
                    continue;
                }
                self.stats.aborts_locked_read += 1;
                return Err(self.rollback(AbortReason::WW_CONFLICT));
            }
            let value = addr.load(Ordering::Acquire);
            let l2 = LockWord::from_raw(slot.load(Ordering::Acquire));
            if l1 != l2 {
                continue;
            }
            let version = l1.version();
            if version > self.end {
                if self.ro || !self.can_extend || !self.extend() {
                    self.stats.aborts_validate_read += 1;
                    return Err(self.rollback(AbortReason::VAL_READ));
                }
                if LockWord::from_raw(slot.load(Ordering::Acquire)) != l2 {
                    continue;
                }
            }
            break (value, version);
        };
        if !self.ro
            && !(stm.shared.config.elide_duplicate_reads && self.r_set.contains(slot_index))
        {
            self.r_set.push(slot_index, version);
        }
        Ok(value)
    }

    fn write_ctl(&mut self, addr: &'a AtomicUsize, value: Word, mask: Word) -> Result<(), TxError> {
        if self.ro {
            // misdeclared read-only region: restart writable
            self.attr.read_only = false;
            self.ro = false;
            self.stats.aborts_ro += 1;
            return Err(self.rollback(AbortReason::RO_WRITE));
        }
        let stm = self.stm.clone();
        let locks = &stm.shared.locks;
        let slot_index = locks.stripe_of(addr);
        let slot = locks.slot(slot_index);

        let mut backoff = Backoff::default();
        let l = loop {
            let l = LockWord::from_raw(slot.load(Ordering::Acquire));
            if !l.is_owned() {
                break l;
            }
            backoff.wait();
        };

        if let Some(index) = self.w_set.find(addr) {
            self.w_set.merge(index, value, mask);
            return Ok(());
        }

        let version = l.version();
        if version > self.end && (!self.can_extend || self.r_set.contains(slot_index)) {
            // an older version of this stripe already sits in the read set
            self.stats.aborts_validate_write += 1;
            return Err(self.rollback(AbortReason::VAL_WRITE));
        }
        self.w_set.push(addr, value, mask, slot_index, version, true);

        if self.irrevocable == 0 && stm.shared.irrevocable.load(Ordering::Acquire) != 0 {
            return Err(self.rollback(AbortReason::IRREVOCABLE));
        }
        Ok(())
    }

    fn write_etl(&mut self, addr: &'a AtomicUsize, value: Word, mask: Word) -> Result<(), TxError> {
        if self.ro {
            self.attr.read_only = false;
            self.ro = false;
            self.stats.aborts_ro += 1;
            return Err(self.rollback(AbortReason::RO_WRITE));
        }
        let stm = self.stm.clone();
        let locks = &stm.shared.locks;
        let slot_index = locks.stripe_of(addr);
        let slot = locks.slot(slot_index);

        let mut backoff = Backoff::default();
        loop {
            let l = LockWord::from_raw(slot.load(Ordering::Acquire));
            if l.is_owned() {
                if l == LockWord::UNIT {
                    backoff.wait();
                    continue;
                }
                if l.owner() != self.id {
                    // contended stripe: brief grace period, then the
                    // current owner wins
                    if backoff.spin() {
                        continue;
                    }
                    self.stats.aborts_locked_write += 1;
                    return Err(self.rollback(AbortReason::WW_CONFLICT));
                }
                // stripe already ours: merge in place or chain a new entry
                let head = l.entry();
                let mut index = head;
                loop {
                    let (covers, next) = {
                        let w = self.w_set.get(index);
                        (std::ptr::eq(w.addr, addr), w.next)
                    };
                    if covers {
                        self.w_set.merge(index, value, mask);
                        return Ok(());
                    }
                    match next {
                        Some(next) => index = next as usize,
                        None => break,
                    }
                }
                let version = self.w_set.get(head).version;
                let appended = self.w_set.push(addr, value, mask, slot_index, version, true);
                self.w_set.get_mut(index).next = Some(appended as u32);
                return Ok(());
            }

            let version = l.version();
            if version > self.end && (!self.can_extend || self.r_set.contains(slot_index)) {
                self.stats.aborts_validate_write += 1;
                return Err(self.rollback(AbortReason::VAL_WRITE));
            }
            // the entry index is published in the lock word, so it is
            // reserved before the entry itself is appended
            let index = self.w_set.len();
            if slot
                .compare_exchange(
                    l.raw(),
                    LockWord::from_owner(self.id, index).raw(),
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                )
                .is_err()
            {
                continue;
            }
            self.w_set.push(addr, value, mask, slot_index, version, false);
            self.w_set.nb_acquired += 1;

            if self.irrevocable == 0 && stm.shared.irrevocable.load(Ordering::Acquire) != 0 {
                return Err(self.rollback(AbortReason::IRREVOCABLE));
            }
            return Ok(());
        }
    }

    /// Slide the snapshot forward to the current clock if the read set
    /// still validates.
    fn extend(&mut self) -> bool {
        let stm = self.stm.clone();
        let now = stm.shared.clock.now();
        if now >= stm.shared.config.version_max {
            return false;
        }
        if self.validate() {
            trace!("snapshot extended to {}", now);
            self.end = now;
            true
        } else {
            false
        }
    }

    /// Check that every recorded read still holds its observed version.
    fn validate(&self) -> bool {
        let shared = &self.stm.shared;
        for r in self.r_set.iter() {
            let l = LockWord::from_raw(shared.locks.slot(r.slot).load(Ordering::Acquire));
            if l.is_owned() {
                if l == LockWord::UNIT || l.owner() != self.id {
                    return false;
                }
                // we own the slot; the commit-time acquisition recorded
                // the version it displaced
                if shared.config.design == Design::WriteBackCtl
                    && self.w_set.get(l.entry()).version != r.version
                {
                    return false;
                }
            } else if l.version() != r.version {
                return false;
            }
        }
        true
    }

    fn commit_ctl(&mut self) -> Result<(), TxError> {
        let stm = self.stm.clone();
        let shared = &stm.shared;

        if self.irrevocable == 0 && shared.irrevocable.load(Ordering::Acquire) != 0 {
            return Err(self.rollback(AbortReason::IRREVOCABLE));
        }

        // acquire every written stripe, in reverse log order
        for index in (0..self.w_set.len()).rev() {
            let slot_index = self.w_set.get(index).slot;
            let slot = shared.locks.slot(slot_index);
            loop {
                let l = LockWord::from_raw(slot.load(Ordering::Acquire));
                if l.is_owned() {
                    if l != LockWord::UNIT && l.owner() == self.id {
                        // stripe already taken through a later entry
                        break;
                    }
                    self.stats.aborts_locked_write += 1;
                    return Err(self.rollback(AbortReason::WW_CONFLICT));
                }
                if slot
                    .compare_exchange(
                        l.raw(),
                        LockWord::from_owner(self.id, index).raw(),
                        Ordering::SeqCst,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    let w = self.w_set.get_mut(index);
                    w.no_drop = false;
                    w.version = l.version();
                    self.w_set.nb_acquired += 1;
                    break;
                }
            }
        }

        if self.irrevocable == 0 && shared.irrevocable.load(Ordering::Acquire) != 0 {
            return Err(self.rollback(AbortReason::IRREVOCABLE));
        }

        let t = shared.clock.advance() + 1;

        // a concurrent commit may have slipped in since the snapshot was
        // taken; locks are already held, so validation is final
        if self.irrevocable == 0 && self.start != t - 1 && !self.validate() {
            self.stats.aborts_validate_commit += 1;
            return Err(self.rollback(AbortReason::VALIDATE));
        }

        let stamped = LockWord::from_version(t).raw();
        for index in 0..self.w_set.len() {
            let w = self.w_set.get(index);
            if w.mask == Word::MAX {
                w.addr.store(w.value, Ordering::Relaxed);
            } else if w.mask != 0 {
                // the slot is ours, nobody observes the intermediate state
                let current = w.addr.load(Ordering::Relaxed);
                w.addr.store((current & !w.mask) | (w.value & w.mask), Ordering::Relaxed);
            }
            if !w.no_drop {
                shared.locks.slot(w.slot).store(stamped, Ordering::Release);
            }
        }
        self.w_set.nb_acquired = 0;
        debug!("committed at {} ({} writes)", t, self.w_set.len());
        Ok(())
    }

    fn commit_etl(&mut self) -> Result<(), TxError> {
        let stm = self.stm.clone();
        let shared = &stm.shared;

        if self.irrevocable == 0 && shared.irrevocable.load(Ordering::Acquire) != 0 {
            return Err(self.rollback(AbortReason::IRREVOCABLE));
        }

        let t = shared.clock.advance() + 1;

        if self.irrevocable == 0 && self.start != t - 1 && !self.validate() {
            self.stats.aborts_validate_commit += 1;
            return Err(self.rollback(AbortReason::VALIDATE));
        }

        let stamped = LockWord::from_version(t).raw();
        for index in 0..self.w_set.len() {
            let w = self.w_set.get(index);
            if w.mask == Word::MAX {
                w.addr.store(w.value, Ordering::Relaxed);
            } else if w.mask != 0 {
                let current = w.addr.load(Ordering::Relaxed);
                w.addr.store((current & !w.mask) | (w.value & w.mask), Ordering::Relaxed);
            }
            // the stripe is released by its last covered entry
            if w.next.is_none() {
                shared.locks.slot(w.slot).store(stamped, Ordering::Release);
            }
        }
        self.w_set.nb_acquired = 0;
        debug!("committed at {} ({} writes)", t, self.w_set.len());
        Ok(())
    }

    fn finish_commit(&mut self) -> Result<(), TxError> {
        let stm = self.stm.clone();
        self.stats.retries = 0;
        self.pending_retry = false;
        if self.irrevocable != 0 {
            stm.shared.irrevocable.store(0, Ordering::Release);
            if self.irrevocable & SERIAL_BIT != 0 {
                stm.shared.registry.resume_world();
            }
            self.irrevocable = 0;
        }
        self.shared.status.store(status::COMMITTED, Ordering::SeqCst);
        callbacks::fire(&self.callbacks.commit);
        Ok(())
    }

    fn rollback(&mut self, reason: AbortReason) -> TxError {
        let retry = !self.attr.no_retry;
        self.rollback_inner(reason, retry)
    }

    fn rollback_inner(&mut self, reason: AbortReason, retry: bool) -> TxError {
        debug_assert!(self.is_active());
        self.shared.status.store(status::ABORTING, Ordering::SeqCst);
        self.release_locks();

        if self.irrevocable & MODE_MASK >= 2 {
            // hand the token back; the next prepare re-acquires it
            let stm = self.stm.clone();
            stm.shared.irrevocable.store(0, Ordering::Release);
            if self.irrevocable & SERIAL_BIT != 0 && self.irrevocable & MODE_MASK == 3 {
                stm.shared.registry.resume_world();
            }
            self.irrevocable = 1 | (self.irrevocable & SERIAL_BIT);
        }

        self.stats.aborts += 1;
        self.stats.retries += 1;
        if self.stats.retries > self.stats.max_retries {
            self.stats.max_retries = self.stats.retries;
        }

        self.shared.status.store(status::ABORTED, Ordering::SeqCst);
        self.nesting = 1;
        callbacks::fire(&self.callbacks.abort);
        debug!("rolled back ({})", reason);

        if !retry {
            self.nesting = 0;
            self.pending_retry = false;
            return TxError::Aborted(reason);
        }
        self.prepare();
        self.pending_retry = true;
        TxError::Aborted(reason)
    }

    /// Release exactly the slots this transaction owns.
    fn release_locks(&mut self) {
        if self.w_set.nb_acquired == 0 {
            return;
        }
        let stm = self.stm.clone();
        let locks = &stm.shared.locks;
        let mut remaining = self.w_set.nb_acquired;
        let mut index = self.w_set.len();
        while remaining > 0 && index > 0 {
            index -= 1;
            let w = self.w_set.get(index);
            if w.no_drop {
                continue;
            }
            let restored = LockWord::from_version(w.version).raw();
            remaining -= 1;
            if remaining == 0 {
                // the final release publishes all preceding ones
                locks.slot(w.slot).store(restored, Ordering::Release);
            } else {
                locks.slot(w.slot).store(restored, Ordering::Relaxed);
            }
        }
        self.w_set.nb_acquired = 0;
    }
}

impl<'a> Drop for Transaction<'a> {
    fn drop(&mut self) {
        if self.is_active() {
            // a descriptor must not disappear while owning stripes
            self.release_locks();
            if self.irrevocable & MODE_MASK >= 2 {
                let stm = self.stm.clone();
                stm.shared.irrevocable.store(0, Ordering::Release);
                if self.irrevocable & SERIAL_BIT != 0 && self.irrevocable & MODE_MASK == 3 {
                    stm.shared.registry.resume_world();
                }
            }
            self.shared.status.store(status::ABORTED, Ordering::SeqCst);
        }
        callbacks::fire(&self.callbacks.exit);
        let stm = self.stm.clone();
        stm.shared.registry.unregister(&self.shared);
        trace!("descriptor detached (owner {})", self.id.0);
    }
}
