// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::ops::BitOr;
use thiserror::Error as DeriveError;

/// Cause of an abort, carried as a bitfield.
///
/// Reasons are informational: control flow after an abort is uniform and
/// does not depend on the cause. [`AbortReason::EXPLICIT`] is or-ed onto the
/// caller-supplied reason by [`crate::Transaction::abort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AbortReason(u32);

impl AbortReason {
    /// A load observed a version newer than the snapshot and extension failed.
    pub const VAL_READ: AbortReason = AbortReason(1 << 0);
    /// A store hit a stripe newer than the snapshot that was already read.
    pub const VAL_WRITE: AbortReason = AbortReason(1 << 1);
    /// Commit-time validation of the read set failed.
    pub const VALIDATE: AbortReason = AbortReason(1 << 2);
    /// Another transaction owns a stripe this transaction writes.
    pub const WW_CONFLICT: AbortReason = AbortReason(1 << 3);
    /// A region declared read-only issued a store.
    pub const RO_WRITE: AbortReason = AbortReason(1 << 4);
    /// An external fault handler requested the abort.
    pub const SIGNAL: AbortReason = AbortReason(1 << 5);
    /// The transaction was killed from outside.
    pub const KILLED: AbortReason = AbortReason(1 << 6);
    /// The transaction yielded to an irrevocable peer.
    pub const IRREVOCABLE: AbortReason = AbortReason(1 << 7);
    /// The caller aborted explicitly.
    pub const EXPLICIT: AbortReason = AbortReason(1 << 8);
    /// Any other cause.
    pub const OTHER: AbortReason = AbortReason(1 << 9);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: AbortReason) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AbortReason {
    type Output = AbortReason;

    fn bitor(self, rhs: AbortReason) -> AbortReason {
        AbortReason(self.0 | rhs.0)
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: &[(u32, &str)] = &[
            (1 << 0, "val-read"),
            (1 << 1, "val-write"),
            (1 << 2, "validate"),
            (1 << 3, "ww-conflict"),
            (1 << 4, "ro-write"),
            (1 << 5, "signal"),
            (1 << 6, "killed"),
            (1 << 7, "irrevocable"),
            (1 << 8, "explicit"),
            (1 << 9, "other"),
        ];

        let mut first = true;
        for (bit, name) in NAMES {
            if self.0 & bit != 0 {
                if !first {
                    write!(f, "+")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        if first {
            write!(f, "none")?;
        }
        Ok(())
    }
}

#[derive(Debug, DeriveError, PartialEq, Eq)]
pub enum TxError {
    /// The transaction was rolled back. When the descriptor has been
    /// re-prepared the retry loop in [`crate::Transaction::run`] consumes
    /// this value and re-executes the region body.
    #[error("transaction aborted ({0})")]
    Aborted(AbortReason),

    #[error("no transaction is active on this descriptor")]
    NotActive,

    #[error("maximum number of callback registrations reached")]
    CallbackTableFull,

    #[error("maximum number of transaction-specific slots reached")]
    SpecificSlotsExhausted,

    #[error("transaction-specific key {0} was never created")]
    UnknownSpecificKey(usize),
}
