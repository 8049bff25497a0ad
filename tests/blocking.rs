//! Blocking retry: wake-ups, timeouts and interrupts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use vstm::{Stm, StmError};

#[test]
#[cfg_attr(miri, ignore)]
fn test_retry_wakes_on_commit() {
    let stm = Arc::new(Stm::new());
    let reference = stm.object(0i64);
    let released = Arc::new(AtomicBool::new(false));

    let waiter = {
        let stm = stm.clone();
        let reference = reference.clone();
        let released = released.clone();
        thread::spawn(move || {
            stm.atomically(|tx| {
                if reference.get(tx)? != 1 {
                    return tx.retry();
                }
                Ok(())
            })
            .unwrap();
            // Only a commit of the awaited value can have let us through.
            assert!(released.load(Ordering::SeqCst));
            Instant::now()
        })
    };

    thread::sleep(Duration::from_millis(500));
    released.store(true, Ordering::SeqCst);
    let set_at = Instant::now();
    stm.atomically(|tx| reference.set(tx, 1)).unwrap();

    let woke_at = waiter.join().unwrap();
    assert!(woke_at.duration_since(set_at) < Duration::from_secs(5));
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_await_until_sees_every_step() {
    let stm = Arc::new(Stm::new());
    let counter = stm.object(0u32);

    let waiter = {
        let stm = stm.clone();
        let counter = counter.clone();
        thread::spawn(move || {
            stm.atomically(|tx| {
                counter.await_until(tx, |n| *n >= 3)?;
                counter.get(tx)
            })
        })
    };

    for _ in 0..3 {
        thread::sleep(Duration::from_millis(20));
        stm.atomically(|tx| counter.alter(tx, |n| n + 1)).unwrap();
    }

    assert_eq!(waiter.join().unwrap().unwrap(), 3);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_retry_times_out() {
    let stm = Stm::new();
    let reference = stm.object(0i64);
    let factory = stm
        .factory()
        .timeout(Duration::from_millis(50))
        .build()
        .unwrap();

    let started = Instant::now();
    let result: Result<(), _> = factory.atomically(|tx| {
        reference.get(tx)?;
        tx.retry()
    });

    assert!(matches!(result, Err(StmError::RetryTimeout { .. })));
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_timeout_is_shared_by_all_waits() {
    let stm = Arc::new(Stm::new());
    let reference = stm.object(0i64);
    let factory = stm
        .factory()
        .timeout(Duration::from_millis(300))
        .build()
        .unwrap();

    // Keeps waking the waiter without ever satisfying it.
    let stop = Arc::new(AtomicBool::new(false));
    let noise = {
        let stm = stm.clone();
        let reference = reference.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                stm.atomically(|tx| reference.alter(tx, |n| (n + 1) % 2 + 10))
                    .unwrap();
                thread::sleep(Duration::from_millis(20));
            }
        })
    };

    let started = Instant::now();
    let wakeups = AtomicUsize::new(0);
    let result: Result<(), _> = factory.atomically(|tx| {
        wakeups.fetch_add(1, Ordering::SeqCst);
        reference.get(tx)?;
        tx.retry()
    });
    stop.store(true, Ordering::SeqCst);
    noise.join().unwrap();

    assert!(matches!(result, Err(StmError::RetryTimeout { .. })));
    assert!(wakeups.load(Ordering::SeqCst) > 1);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_interruptible_retry() {
    let stm = Arc::new(Stm::new());
    let reference = stm.object(0i64);
    let (handles_tx, handles_rx) = mpsc::channel();

    let waiter = {
        let stm = stm.clone();
        let reference = reference.clone();
        thread::spawn(move || {
            let factory = stm.factory().interruptible(true).build().unwrap();
            factory.atomically(|tx| {
                let _ = handles_tx.send(tx.interrupt_handle());
                reference.get(tx)?;
                tx.retry::<()>()
            })
        })
    };

    let handle = handles_rx.recv().unwrap();
    thread::sleep(Duration::from_millis(50));
    handle.interrupt();

    assert!(matches!(
        waiter.join().unwrap(),
        Err(StmError::RetryInterrupted)
    ));
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_non_interruptible_retry_keeps_waiting() {
    let stm = Arc::new(Stm::new());
    let reference = stm.object(0i64);
    let (handles_tx, handles_rx) = mpsc::channel();

    let waiter = {
        let stm = stm.clone();
        let reference = reference.clone();
        thread::spawn(move || {
            let factory = stm.factory().build().unwrap();
            factory.atomically(|tx| {
                let _ = handles_tx.send(tx.interrupt_handle());
                if reference.get(tx)? == 0 {
                    return tx.retry();
                }
                reference.get(tx)
            })
        })
    };

    let handle = handles_rx.recv().unwrap();
    thread::sleep(Duration::from_millis(50));
    handle.interrupt();
    thread::sleep(Duration::from_millis(50));
    stm.atomically(|tx| reference.set(tx, 7)).unwrap();

    assert_eq!(waiter.join().unwrap().unwrap(), 7);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_or_else_waits_on_both_alternatives() {
    let stm = Arc::new(Stm::new());
    let left = stm.object(0i64);
    let right = stm.object(0i64);

    let waiter = {
        let stm = stm.clone();
        let left = left.clone();
        let right = right.clone();
        thread::spawn(move || {
            stm.atomically(|tx| {
                tx.or_else(
                    |tx| {
                        left.await_until(tx, |v| *v == 1)?;
                        Ok("left")
                    },
                    |tx| {
                        right.await_until(tx, |v| *v == 1)?;
                        Ok("right")
                    },
                )
            })
        })
    };

    thread::sleep(Duration::from_millis(100));
    stm.atomically(|tx| right.set(tx, 1)).unwrap();
    assert_eq!(waiter.join().unwrap().unwrap(), "right");
}

#[test]
fn test_retry_without_blocking_allowed() {
    let stm = Stm::new();
    let reference = stm.object(0i64);
    let factory = stm.factory().blocking_allowed(false).build().unwrap();

    let result: Result<(), _> = factory.atomically(|tx| {
        reference.get(tx)?;
        tx.retry()
    });
    assert!(matches!(result, Err(StmError::NoRetryPossible { .. })));
}
