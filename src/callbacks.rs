// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Callback registration for external modules.
//!
//! Registrations are bounded per event kind and must happen before threads
//! attach: each descriptor snapshots the tables at attach time and fires its
//! own copies, so the hot path never takes a lock.

use crate::errors::TxError;
use std::sync::{Arc, Mutex};

pub type TxCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// One registration; any subset of the hooks may be present.
#[derive(Clone, Default)]
pub struct EventHandlers {
    pub on_thread_init: Option<TxCallback>,
    pub on_thread_exit: Option<TxCallback>,
    pub on_start: Option<TxCallback>,
    pub on_precommit: Option<TxCallback>,
    pub on_commit: Option<TxCallback>,
    pub on_abort: Option<TxCallback>,
}

#[derive(Clone, Default)]
pub(crate) struct RegionCallbacks {
    pub init: Vec<TxCallback>,
    pub exit: Vec<TxCallback>,
    pub start: Vec<TxCallback>,
    pub precommit: Vec<TxCallback>,
    pub commit: Vec<TxCallback>,
    pub abort: Vec<TxCallback>,
}

pub(crate) struct CallbackTables {
    max: usize,
    inner: Mutex<RegionCallbacks>,
}

impl CallbackTables {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            inner: Mutex::new(RegionCallbacks::default()),
        }
    }

    /// Rejects the whole registration when any addressed table is full.
    pub fn register(&self, handlers: EventHandlers) -> Result<(), TxError> {
        let mut tables = self.inner.lock().expect("callback table mutex poisoned");
        let full = |table: &Vec<TxCallback>, hook: &Option<TxCallback>| {
            hook.is_some() && table.len() >= self.max
        };
        if full(&tables.init, &handlers.on_thread_init)
            || full(&tables.exit, &handlers.on_thread_exit)
            || full(&tables.start, &handlers.on_start)
            || full(&tables.precommit, &handlers.on_precommit)
            || full(&tables.commit, &handlers.on_commit)
            || full(&tables.abort, &handlers.on_abort)
        {
            return Err(TxError::CallbackTableFull);
        }
        if let Some(cb) = handlers.on_thread_init {
            tables.init.push(cb);
        }
        if let Some(cb) = handlers.on_thread_exit {
            tables.exit.push(cb);
        }
        if let Some(cb) = handlers.on_start {
            tables.start.push(cb);
        }
        if let Some(cb) = handlers.on_precommit {
            tables.precommit.push(cb);
        }
        if let Some(cb) = handlers.on_commit {
            tables.commit.push(cb);
        }
        if let Some(cb) = handlers.on_abort {
            tables.abort.push(cb);
        }
        Ok(())
    }

    pub fn snapshot(&self) -> RegionCallbacks {
        self.inner
            .lock()
            .expect("callback table mutex poisoned")
            .clone()
    }
}

pub(crate) fn fire(callbacks: &[TxCallback]) {
    for cb in callbacks {
        (**cb)();
    }
}
