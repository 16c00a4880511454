// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use rand::{distributions::Bernoulli, prelude::Distribution};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use threadpool::ThreadPool;
use word_stm::{AbortReason, Design, EventHandlers, Stm, StmConfig, TxAttributes, TxError};

#[allow(unused_imports)]
use log::*;

fn init_logger() {
    #[cfg(feature = "verbose")]
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

fn config() -> StmConfig {
    StmConfig {
        lock_array_log_size: 14,
        initial_set_capacity: 64,
        ..StmConfig::default()
    }
}

/// Neighboring words share a stripe; logical cells used by tests that rely
/// on independent stripes are kept a full stripe apart.
fn spaced_cells(n: usize) -> Vec<AtomicUsize> {
    (0..n * 8).map(|_| AtomicUsize::new(0)).collect()
}

struct Accounts {
    a: AtomicUsize,
    b: AtomicUsize,
}

#[test]
fn test_bank_transfer_conserves_the_total() {
    init_logger();
    const ITERS: usize = 1000;

    let stm = Stm::new(config());
    let accounts = Arc::new(Accounts {
        a: AtomicUsize::new(100),
        b: AtomicUsize::new(0),
    });

    let mut handles = Vec::new();
    for _ in 0..2 {
        let stm = stm.clone();
        let accounts = accounts.clone();
        handles.push(thread::spawn(move || {
            let mut tx = stm.attach();
            for _ in 0..ITERS {
                tx.run(TxAttributes::default(), |tx| {
                    let x = tx.load(&accounts.a)?;
                    let y = tx.load(&accounts.b)?;
                    tx.store(&accounts.a, x.wrapping_sub(1))?;
                    tx.store(&accounts.b, y.wrapping_add(1))
                })
                .expect("transfer failed");
            }
        }));
    }

    // a concurrent auditor only ever observes a conserved total
    {
        let stm = stm.clone();
        let accounts = accounts.clone();
        handles.push(thread::spawn(move || {
            let mut tx = stm.attach();
            for _ in 0..500 {
                tx.run(
                    TxAttributes {
                        read_only: true,
                        ..TxAttributes::default()
                    },
                    |tx| {
                        let x = tx.load(&accounts.a)?;
                        let y = tx.load(&accounts.b)?;
                        assert_eq!(x.wrapping_add(y), 100, "audit saw a torn transfer");
                        Ok(())
                    },
                )
                .expect("audit failed");
            }
        }));
    }

    for handle in handles {
        handle.join().expect("worker panicked");
    }

    let a = accounts.a.load(Ordering::SeqCst);
    let b = accounts.b.load(Ordering::SeqCst);
    assert_eq!(b, 2 * ITERS);
    assert_eq!(a.wrapping_add(b), 100);
}

#[test]
fn test_write_after_read_hazard_forces_a_retry() {
    init_logger();

    let stm = Stm::new(config());
    let cell = Arc::new(AtomicUsize::new(0));
    let attempts = Arc::new(AtomicUsize::new(0));
    let loaded = Arc::new(Barrier::new(2));
    let stored = Arc::new(Barrier::new(2));

    let incrementer = {
        let stm = stm.clone();
        let cell = cell.clone();
        let attempts = attempts.clone();
        let loaded = loaded.clone();
        let stored = stored.clone();
        thread::spawn(move || {
            let mut tx = stm.attach();
            tx.run(TxAttributes::default(), |tx| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                let v = tx.load(&cell)?;
                if attempt == 0 {
                    // let the interferer commit between our load and store
                    loaded.wait();
                    stored.wait();
                }
                tx.store(&cell, v + 1)
            })
            .expect("increment failed");
        })
    };

    let interferer = {
        let stm = stm.clone();
        let cell = cell.clone();
        let loaded = loaded.clone();
        let stored = stored.clone();
        thread::spawn(move || {
            loaded.wait();
            let mut tx = stm.attach();
            tx.run(TxAttributes::default(), |tx| tx.store(&cell, 42))
                .expect("store failed");
            stored.wait();
        })
    };

    incrementer.join().expect("incrementer panicked");
    interferer.join().expect("interferer panicked");

    // no lost update: the increment applies on top of the interfering store
    assert_eq!(cell.load(Ordering::SeqCst), 43);
    assert!(attempts.load(Ordering::SeqCst) >= 2);
}

#[test]
fn test_snapshot_extends_over_unrelated_commits() {
    init_logger();

    let stm = Stm::new(config());
    let cells = spaced_cells(2);
    cells[0].store(1, Ordering::SeqCst);
    let attempts = AtomicUsize::new(0);

    let mut tx = stm.attach();
    let total = tx
        .run(TxAttributes::default(), |tx| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            let a = tx.load(&cells[0])?;
            if attempt == 0 {
                // advance the clock through an unrelated stripe
                stm.unit_store(&cells[8], 7);
            }
            let b = tx.load(&cells[8])?;
            Ok(a + b)
        })
        .expect("transaction failed");

    assert_eq!(total, 8);
    // the newer version on the second stripe was absorbed by extension
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[test]
fn test_no_extend_attribute_forces_a_retry_instead() {
    init_logger();

    let stm = Stm::new(config());
    let cells = spaced_cells(2);
    cells[0].store(1, Ordering::SeqCst);
    let attempts = AtomicUsize::new(0);

    let mut tx = stm.attach();
    let total = tx
        .run(
            TxAttributes {
                no_extend: true,
                ..TxAttributes::default()
            },
            |tx| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                let a = tx.load(&cells[0])?;
                if attempt == 0 {
                    stm.unit_store(&cells[8], 7);
                }
                let b = tx.load(&cells[8])?;
                Ok(a + b)
            },
        )
        .expect("transaction failed");

    assert_eq!(total, 8);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(tx.stat("nb_aborts_validate_read"), Some(1));
}

#[test]
fn test_threaded_counter_loses_no_updates() {
    init_logger();
    const TASKS: usize = 64;
    const INCREMENTS: usize = 50;

    let stm = Stm::new(config());
    let cell = Arc::new(AtomicUsize::new(0));
    let writers = Arc::new(AtomicUsize::new(0));
    let pool = ThreadPool::new(8);

    // bernoulli distribution over read-only vs read-write tasks
    let distribution = Bernoulli::new(0.3).expect("bad distribution");

    for _ in 0..TASKS {
        let stm = stm.clone();
        let cell = cell.clone();
        let writers = writers.clone();
        let read_only = distribution.sample(&mut rand::thread_rng());

        pool.execute(move || {
            let mut tx = stm.attach();
            if read_only {
                tx.run(
                    TxAttributes {
                        read_only: true,
                        ..TxAttributes::default()
                    },
                    |tx| {
                        tx.load(&cell)?;
                        Ok(())
                    },
                )
                .expect("read task failed");
            } else {
                for _ in 0..INCREMENTS {
                    tx.run(TxAttributes::default(), |tx| {
                        let v = tx.load(&cell)?;
                        tx.store(&cell, v + 1)
                    })
                    .expect("increment failed");
                }
                writers.fetch_add(1, Ordering::SeqCst);
            }
        });
    }
    pool.join();

    assert_eq!(
        cell.load(Ordering::SeqCst),
        writers.load(Ordering::SeqCst) * INCREMENTS
    );
}

#[test]
fn test_etl_design_conserves_the_total_under_contention() {
    init_logger();
    const ITERS: usize = 500;

    let stm = Stm::new(StmConfig {
        design: Design::WriteBackEtl,
        ..config()
    });
    let accounts = Arc::new(Accounts {
        a: AtomicUsize::new(100),
        b: AtomicUsize::new(0),
    });

    let mut handles = Vec::new();
    for _ in 0..2 {
        let stm = stm.clone();
        let accounts = accounts.clone();
        handles.push(thread::spawn(move || {
            let mut tx = stm.attach();
            for _ in 0..ITERS {
                tx.run(TxAttributes::default(), |tx| {
                    let x = tx.load(&accounts.a)?;
                    let y = tx.load(&accounts.b)?;
                    tx.store(&accounts.a, x.wrapping_sub(1))?;
                    tx.store(&accounts.b, y.wrapping_add(1))
                })
                .expect("transfer failed");
            }
        }));
    }
    for handle in handles {
        handle.join().expect("worker panicked");
    }

    let a = accounts.a.load(Ordering::SeqCst);
    let b = accounts.b.load(Ordering::SeqCst);
    assert_eq!(b, 2 * ITERS);
    assert_eq!(a.wrapping_add(b), 100);
}

#[test]
fn test_clock_rollover_is_transparent_to_transactions() {
    init_logger();
    const THREADS: usize = 4;
    const ITERS: usize = 400;

    // small threshold so the clock rolls over several times mid-run
    let stm = Stm::new(StmConfig {
        version_max: 512,
        lock_array_log_size: 12,
        ..StmConfig::default()
    });
    let cell = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..THREADS {
        let stm = stm.clone();
        let cell = cell.clone();
        handles.push(thread::spawn(move || {
            let mut tx = stm.attach();
            for _ in 0..ITERS {
                tx.run(TxAttributes::default(), |tx| {
                    let v = tx.load(&cell)?;
                    tx.store(&cell, v + 1)
                })
                .expect("increment failed");
            }
        }));
    }
    for handle in handles {
        handle.join().expect("worker panicked");
    }

    assert_eq!(cell.load(Ordering::SeqCst), THREADS * ITERS);
    // without the rollover the clock would have reached the commit count
    assert!(stm.clock() < THREADS * ITERS);
}

#[test]
fn test_callbacks_fire_once_per_region_event() {
    init_logger();

    struct Counts {
        init: AtomicUsize,
        exit: AtomicUsize,
        start: AtomicUsize,
        precommit: AtomicUsize,
        commit: AtomicUsize,
        abort: AtomicUsize,
    }

    let stm = Stm::new(config());
    let counts = Arc::new(Counts {
        init: AtomicUsize::new(0),
        exit: AtomicUsize::new(0),
        start: AtomicUsize::new(0),
        precommit: AtomicUsize::new(0),
        commit: AtomicUsize::new(0),
        abort: AtomicUsize::new(0),
    });

    let hook = |field: fn(&Counts) -> &AtomicUsize| {
        let counts = counts.clone();
        Arc::new(move || {
            field(&counts).fetch_add(1, Ordering::SeqCst);
        }) as Arc<dyn Fn() + Send + Sync>
    };
    stm.register(EventHandlers {
        on_thread_init: Some(hook(|c| &c.init)),
        on_thread_exit: Some(hook(|c| &c.exit)),
        on_start: Some(hook(|c| &c.start)),
        on_precommit: Some(hook(|c| &c.precommit)),
        on_commit: Some(hook(|c| &c.commit)),
        on_abort: Some(hook(|c| &c.abort)),
    })
    .expect("registration failed");

    let cell = AtomicUsize::new(0);
    {
        let mut tx = stm.attach();
        tx.run(TxAttributes::default(), |tx| tx.store(&cell, 1))
            .expect("transaction failed");
    }
    assert_eq!(counts.init.load(Ordering::SeqCst), 1);
    assert_eq!(counts.exit.load(Ordering::SeqCst), 1);
    assert_eq!(counts.start.load(Ordering::SeqCst), 1);
    assert_eq!(counts.precommit.load(Ordering::SeqCst), 1);
    assert_eq!(counts.commit.load(Ordering::SeqCst), 1);
    assert_eq!(counts.abort.load(Ordering::SeqCst), 0);

    // an aborted region fires neither precommit nor commit
    {
        let mut tx = stm.attach();
        let result: Result<(), TxError> = tx.run(
            TxAttributes {
                no_retry: true,
                ..TxAttributes::default()
            },
            |tx| {
                tx.abort(AbortReason::OTHER)?;
                unreachable!("abort must not fall through");
            },
        );
        assert!(result.is_err());
    }
    assert_eq!(counts.abort.load(Ordering::SeqCst), 1);
    assert_eq!(counts.precommit.load(Ordering::SeqCst), 1);
    assert_eq!(counts.commit.load(Ordering::SeqCst), 1);
    assert_eq!(counts.exit.load(Ordering::SeqCst), 2);
}

#[test]
fn test_unit_stores_interoperate_with_transactions() {
    init_logger();

    let stm = Stm::new(config());
    let cell = AtomicUsize::new(0);

    let t = stm.unit_store(&cell, 9);
    let (value, version) = stm.unit_load(&cell);
    assert_eq!(value, 9);
    assert_eq!(version, t);

    let mut tx = stm.attach();
    let seen = tx
        .run(TxAttributes::default(), |tx| tx.load(&cell))
        .expect("transaction failed");
    assert_eq!(seen, 9);

    let newer = stm
        .unit_store_after(&cell, 10, usize::MAX, t)
        .expect("bound is current");
    assert!(newer > t);
    assert_eq!(stm.unit_store_after(&cell, 11, usize::MAX, t), Err(newer));
    assert_eq!(stm.unit_load(&cell).0, 10);
}
