// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Word-based software transactional memory
//!
//! A time-based, lock-versioned STM runtime. Application threads execute
//! speculative regions that read and write shared machine words (plain
//! [`std::sync::atomic::AtomicUsize`] cells) through the engine's load and
//! store primitives; every committed region appears to execute atomically
//! in some serializable order, and a region that cannot be serialized is
//! rolled back and re-executed transparently.
//!
//! The engine keeps a striped ownership table mapping each word to a lock
//! word that packs either a version timestamp or the current owner, a
//! global version clock read at region entry and bumped at commit, and
//! per-thread read/write logs. Reads are invisible: they validate against
//! the observed versions instead of leaving any trace in shared memory.
//! Snapshots slide forward when possible, commits acquire all written
//! stripes, re-validate and install, and a stop-the-world quiescence
//! barrier rolls the clock over before it can overflow the version
//! encoding.
//!
//! ```
//! use std::sync::atomic::AtomicUsize;
//! use word_stm::atomically;
//!
//! # fn main() -> Result<(), word_stm::TxError> {
//! let counter = AtomicUsize::new(0);
//! let seen = atomically(|tx| {
//!     let v = tx.load(&counter)?;
//!     tx.store(&counter, v + 1)?;
//!     Ok(v + 1)
//! })?;
//! assert_eq!(seen, 1);
//! # Ok(())
//! # }
//! ```
//!
//! Multiple independent engines can coexist; [`Stm::new`] builds one from
//! an [`StmConfig`] and [`Stm::attach`] hands out the per-thread
//! descriptor that drives regions.

mod backoff;
mod callbacks;
mod clock;
mod config;
mod errors;
mod lock;
mod quiesce;
mod set;
mod stm;
mod transaction;

pub use callbacks::{EventHandlers, TxCallback};
pub use config::{Design, StmConfig, Word, MAX_THREADS};
pub use errors::{AbortReason, TxError};
pub use stm::{Parameter, Stm};
pub use transaction::{Transaction, TxAttributes};

use lazy_static::lazy_static;

lazy_static! {
    static ref DEFAULT_STM: Stm = Stm::default();
}

/// The process-wide default engine.
pub fn default_stm() -> &'static Stm {
    &DEFAULT_STM
}

/// Run one region against the default engine on a freshly attached
/// descriptor. Long-lived threads should prefer [`Stm::attach`] and reuse
/// the descriptor across regions.
pub fn atomically<'a, T, F>(body: F) -> Result<T, TxError>
where
    F: FnMut(&mut Transaction<'a>) -> Result<T, TxError>,
{
    let mut tx = DEFAULT_STM.attach();
    tx.run(TxAttributes::default(), body)
}
