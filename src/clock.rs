// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::config::Word;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Global version clock. Snapshots read it with acquire semantics, commits
/// advance it with a full fence. The commit timestamp is the pre-increment
/// value plus one so it is distinct from any snapshot taken before the bump.
pub(crate) struct VersionClock {
    now: AtomicUsize,
}

impl VersionClock {
    pub fn new() -> Self {
        Self {
            now: AtomicUsize::new(0),
        }
    }

    pub fn now(&self) -> Word {
        self.now.load(Ordering::Acquire)
    }

    /// Fetch-and-increment; returns the pre-increment value.
    pub fn advance(&self) -> Word {
        self.now.fetch_add(1, Ordering::SeqCst)
    }

    /// Only called under quiescence, with every transaction idle.
    pub fn reset(&self) {
        self.now.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::VersionClock;

    #[test]
    fn test_advance_returns_pre_increment() {
        let clock = VersionClock::new();
        assert_eq!(clock.advance(), 0);
        assert_eq!(clock.advance(), 1);
        assert_eq!(clock.now(), 2);
        clock.reset();
        assert_eq!(clock.now(), 0);
    }
}
