// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Per-transaction read and write logs.
//!
//! Both logs are append-only and single-writer (the owning thread); they
//! are recycled between regions rather than reallocated.

use crate::config::Word;
use std::sync::atomic::AtomicUsize;

/// One observed stripe: the slot index and the version it carried.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadEntry {
    pub slot: usize,
    pub version: Word,
}

pub(crate) struct ReadSet {
    entries: Vec<ReadEntry>,
}

impl ReadSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn push(&mut self, slot: usize, version: Word) {
        self.entries.push(ReadEntry { slot, version });
    }

    pub fn contains(&self, slot: usize) -> bool {
        self.entries.iter().any(|r| r.slot == slot)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ReadEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }
}

/// One buffered store.
///
/// `version` is the stripe version the store (ETL) or the commit-time
/// acquisition (CTL) observed; it is what a rollback publishes back into the
/// slot. `no_drop` is true while the entry holds no slot ownership. `next`
/// chains further entries covered by the same stripe (ETL only).
pub(crate) struct WriteEntry<'a> {
    pub addr: &'a AtomicUsize,
    pub value: Word,
    pub mask: Word,
    pub slot: usize,
    pub version: Word,
    pub no_drop: bool,
    pub next: Option<u32>,
}

pub(crate) struct WriteSet<'a> {
    entries: Vec<WriteEntry<'a>>,
    /// Number of slots currently owned; on rollback exactly the entries
    /// with `no_drop == false` are released.
    pub nb_acquired: usize,
    bloom: Word,
    bloom_enabled: bool,
}

impl<'a> WriteSet<'a> {
    pub fn new(capacity: usize, bloom_enabled: bool) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            nb_acquired: 0,
            bloom: 0,
            bloom_enabled,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.nb_acquired = 0;
        self.bloom = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    pub fn get(&self, index: usize) -> &WriteEntry<'a> {
        &self.entries[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut WriteEntry<'a> {
        &mut self.entries[index]
    }

    /// Degenerate 32-bit Bloom filter hash over the address.
    fn filter_bits(addr: usize) -> Word {
        1 << (((addr >> 2) ^ (addr >> 5)) & 0x1F)
    }

    /// Index of the entry buffering `addr`, if any.
    pub fn find(&self, addr: &AtomicUsize) -> Option<usize> {
        if self.bloom_enabled {
            let bits = Self::filter_bits(addr as *const AtomicUsize as usize);
            if self.bloom & bits != bits {
                return None;
            }
        }
        self.entries
            .iter()
            .position(|w| std::ptr::eq(w.addr, addr as *const AtomicUsize))
    }

    /// Append an entry and return its index.
    pub fn push(
        &mut self,
        addr: &'a AtomicUsize,
        value: Word,
        mask: Word,
        slot: usize,
        version: Word,
        no_drop: bool,
    ) -> usize {
        if self.bloom_enabled {
            self.bloom |= Self::filter_bits(addr as *const AtomicUsize as usize);
        }
        self.entries.push(WriteEntry {
            addr,
            value,
            mask,
            slot,
            version,
            no_drop,
            next: None,
        });
        self.entries.len() - 1
    }

    /// Fold another masked store into an existing entry.
    pub fn merge(&mut self, index: usize, value: Word, mask: Word) {
        let w = &mut self.entries[index];
        w.value = (w.value & !mask) | (value & mask);
        w.mask |= mask;
    }
}
