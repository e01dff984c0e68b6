/*!
 * RCU Manager Integration Tests
 * Registration lifecycle, nesting, thread churn, and grace-period waits
 */

#![cfg(target_os = "linux")]

use rcu_sync::{RcuConfig, RcuManager};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn ready_manager() -> RcuManager {
    let _ = env_logger::builder().is_test(true).try_init();
    let rcu = RcuManager::new();
    rcu.register_process().expect("membarrier unavailable");
    rcu
}

#[test]
fn test_single_thread_sanity() {
    let rcu = ready_manager();
    rcu.register_thread();

    rcu.read_lock();
    rcu.read_unlock();

    let start = Instant::now();
    rcu.synchronize();
    // Nothing can be blocking the grace period.
    assert!(start.elapsed() < Duration::from_secs(1));

    rcu.unregister_thread();
    assert_eq!(rcu.registered_readers(), 0);
}

#[test]
fn test_register_process_is_repeatable() {
    let rcu = ready_manager();
    rcu.register_process().expect("second registration must succeed");
}

#[test]
fn test_reregistration_is_indistinguishable() {
    let rcu = ready_manager();
    for _ in 0..50 {
        rcu.register_thread();
        rcu.read_lock();
        rcu.read_unlock();
        rcu.synchronize();
        rcu.unregister_thread();
    }
    assert_eq!(rcu.registered_readers(), 0);
}

#[test]
fn test_thread_churn_under_synchronize() {
    let rcu = ready_manager();
    rcu.register_thread();

    let churners: Vec<_> = (0..8)
        .map(|_| {
            let rcu = rcu.clone();
            thread::spawn(move || {
                for _ in 0..20 {
                    rcu.register_thread();
                    thread::sleep(Duration::from_millis(1));
                    rcu.unregister_thread();
                }
            })
        })
        .collect();

    for _ in 0..50 {
        rcu.synchronize();
    }

    for churner in churners {
        churner.join().unwrap();
    }

    rcu.unregister_thread();
    assert_eq!(rcu.registered_readers(), 0);
    assert_eq!(rcu.stats().grace_periods, 50);
}

#[test]
fn test_nested_locks_hold_grace_period_open() {
    let rcu = RcuManager::with_config(RcuConfig::fast_poll());
    rcu.register_process().expect("membarrier unavailable");

    let unlocks_done = Arc::new(AtomicU64::new(0));
    let synchronized_after = Arc::new(AtomicU64::new(u64::MAX));
    let reader_ready = Arc::new(AtomicBool::new(false));

    let reader = {
        let rcu = rcu.clone();
        let unlocks_done = Arc::clone(&unlocks_done);
        let reader_ready = Arc::clone(&reader_ready);
        thread::spawn(move || {
            rcu.register_thread();
            rcu.read_lock();
            rcu.read_lock();
            rcu.read_lock();
            reader_ready.store(true, Ordering::Release);

            // Unwind the nest slowly; only the final unlock may release a
            // waiting synchronize. The progress count is published before
            // each unlock so the writer reads a settled value.
            for done in 1..=3u64 {
                thread::sleep(Duration::from_millis(40));
                unlocks_done.store(done, Ordering::Release);
                rcu.read_unlock();
            }
            rcu.unregister_thread();
        })
    };

    while !reader_ready.load(Ordering::Acquire) {
        thread::sleep(Duration::from_millis(1));
    }

    let writer = {
        let rcu = rcu.clone();
        let unlocks_done = Arc::clone(&unlocks_done);
        let synchronized_after = Arc::clone(&synchronized_after);
        thread::spawn(move || {
            rcu.register_thread();
            rcu.synchronize();
            synchronized_after.store(unlocks_done.load(Ordering::Acquire), Ordering::Release);
            rcu.unregister_thread();
        })
    };

    reader.join().unwrap();
    writer.join().unwrap();

    // synchronize must have returned only after the outermost unlock.
    assert_eq!(synchronized_after.load(Ordering::Acquire), 3);
}

#[test]
fn test_nesting_is_equivalent_to_flat_section() {
    let rcu = ready_manager();
    rcu.register_thread();

    // Same externally observable effect either way: the thread is
    // continuously non-quiescent, then quiescent, and a following
    // synchronize completes.
    rcu.read_lock();
    rcu.read_lock();
    rcu.read_unlock();
    rcu.read_unlock();
    rcu.synchronize();

    rcu.read_lock();
    rcu.read_unlock();
    rcu.synchronize();

    assert_eq!(rcu.stats().grace_periods, 2);
    rcu.unregister_thread();
}

#[test]
fn test_concurrent_writers_serialize() {
    let rcu = ready_manager();

    let writers: Vec<_> = (0..4)
        .map(|_| {
            let rcu = rcu.clone();
            thread::spawn(move || {
                rcu.register_thread();
                for _ in 0..10 {
                    rcu.synchronize();
                }
                rcu.unregister_thread();
            })
        })
        .collect();

    for writer in writers {
        writer.join().unwrap();
    }
    assert_eq!(rcu.stats().grace_periods, 40);
}

#[test]
fn test_readers_make_progress_during_synchronize() {
    let rcu = ready_manager();
    rcu.register_thread();

    let stop = Arc::new(AtomicBool::new(false));
    let sections = Arc::new(AtomicU64::new(0));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let rcu = rcu.clone();
            let stop = Arc::clone(&stop);
            let sections = Arc::clone(&sections);
            thread::spawn(move || {
                rcu.register_thread();
                while !stop.load(Ordering::Acquire) {
                    rcu.read_lock();
                    sections.fetch_add(1, Ordering::Relaxed);
                    rcu.read_unlock();
                }
                rcu.unregister_thread();
            })
        })
        .collect();

    for _ in 0..20 {
        rcu.synchronize();
    }
    stop.store(true, Ordering::Release);

    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(rcu.stats().grace_periods, 20);
    assert!(sections.load(Ordering::Relaxed) > 0);
    rcu.unregister_thread();
}
