//! Concurrency tests for the process pool.
//!
//! Exercises queue disciplines, dynamic limits, cancellation, and the
//! slot-handoff path under concurrent acquirers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use squad::domain::error::PoolError;
use squad::domain::models::config::{PoolConfig, QueueStrategy};
use squad::domain::models::event::EventKind;
use squad::services::event_bus::{EventBus, EventFilter};
use squad::services::process_pool::ProcessPool;

fn pool(max_concurrent: usize, queue_strategy: QueueStrategy) -> Arc<ProcessPool> {
    let config = PoolConfig {
        max_concurrent,
        queue_strategy,
    };
    Arc::new(ProcessPool::new(&config, Arc::new(EventBus::default())))
}

async fn wait_for_queued(pool: &ProcessPool, queued: usize) {
    while pool.stats().queued < queued {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn fifo_release_grants_next_waiter() {
    // Two slots, three acquirers in order A, B, C; releasing A lets C run.
    let pool = pool(2, QueueStrategy::Fifo);

    let a = pool.acquire().await.expect("slot a");
    let b = pool.acquire().await.expect("slot b");

    let pool_c = Arc::clone(&pool);
    let c = tokio::spawn(async move { pool_c.acquire().await });
    wait_for_queued(&pool, 1).await;

    pool.release(a);
    let c_handle = c.await.expect("join").expect("slot c");

    let stats = pool.stats();
    assert_eq!(stats.running, 2);
    assert_eq!(stats.queued, 0);

    pool.release(b);
    pool.release(c_handle);
    assert_eq!(pool.stats().running, 0);
}

#[tokio::test]
async fn priority_queue_grants_highest_first() {
    // One slot held; waiters at priorities 0, 10, 5 are granted 10, 5, 0.
    let pool = pool(1, QueueStrategy::Priority);
    let held = pool.acquire_with_priority(0).await.expect("slot x");

    let order: Arc<StdMutex<Vec<&'static str>>> = Arc::new(StdMutex::new(Vec::new()));
    let mut waiters = Vec::new();
    for (label, priority) in [("w1", 0), ("w2", 10), ("w3", 5)] {
        let pool_clone = Arc::clone(&pool);
        let order = Arc::clone(&order);
        waiters.push(tokio::spawn(async move {
            let handle = pool_clone.acquire_with_priority(priority).await.expect(label);
            order.lock().expect("order lock").push(label);
            pool_clone.release(handle);
        }));
        wait_for_queued(&pool, waiters.len()).await;
    }

    pool.release(held);
    for waiter in waiters {
        waiter.await.expect("join");
    }

    assert_eq!(*order.lock().expect("order lock"), vec!["w2", "w3", "w1"]);
    let stats = pool.stats();
    assert_eq!(stats.running, 0);
    assert_eq!(stats.queued, 0);
}

#[tokio::test]
async fn single_slot_blocks_second_acquirer_until_release() {
    let pool = pool(1, QueueStrategy::Fifo);
    let first = pool.acquire().await.expect("first slot");

    let granted = Arc::new(AtomicBool::new(false));
    let pool_second = Arc::clone(&pool);
    let granted_flag = Arc::clone(&granted);
    let second = tokio::spawn(async move {
        let handle = pool_second.acquire().await.expect("second slot");
        granted_flag.store(true, Ordering::SeqCst);
        handle
    });

    wait_for_queued(&pool, 1).await;
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert!(!granted.load(Ordering::SeqCst), "second acquirer must wait");

    pool.release(first);
    let handle = second.await.expect("join");
    assert!(granted.load(Ordering::SeqCst));
    pool.release(handle);
}

#[tokio::test]
async fn cancelled_acquire_unregisters_waiter() {
    let pool = pool(1, QueueStrategy::Fifo);
    let held = pool.acquire().await.expect("slot");

    // The acquire future is dropped by the timeout before any grant.
    let attempt = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
    assert!(attempt.is_err(), "acquire should still be waiting");
    assert_eq!(pool.stats().queued, 0, "cancelled waiter must be removed");

    pool.release(held);
    let stats = pool.stats();
    assert_eq!(stats.running, 0, "no stale completion handle may take the slot");
    assert_eq!(stats.available, 1);
}

#[tokio::test]
async fn clear_queue_fails_all_waiters() {
    let pool = pool(1, QueueStrategy::Fifo);
    let held = pool.acquire().await.expect("slot");

    let pool_w = Arc::clone(&pool);
    let waiter = tokio::spawn(async move { pool_w.acquire().await });
    wait_for_queued(&pool, 1).await;

    assert_eq!(pool.clear_queue(), 1);
    let outcome = waiter.await.expect("join");
    assert!(matches!(outcome, Err(PoolError::QueueCleared)));

    // The held slot is untouched.
    assert_eq!(pool.stats().running, 1);
    pool.release(held);
}

#[tokio::test]
async fn raising_limit_grants_queued_waiters() {
    let pool = pool(1, QueueStrategy::Fifo);
    let held = pool.acquire().await.expect("slot");

    let pool_w = Arc::clone(&pool);
    let waiter = tokio::spawn(async move { pool_w.acquire().await });
    wait_for_queued(&pool, 1).await;

    pool.set_limit(2).expect("raise limit");
    let second = waiter.await.expect("join").expect("granted by limit raise");

    let stats = pool.stats();
    assert_eq!(stats.running, 2);
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.max_concurrent, 2);

    pool.release(held);
    pool.release(second);
}

#[tokio::test]
async fn every_acquire_is_matched_by_one_release() {
    // Churn a small pool from several tasks; afterwards nothing leaks.
    let pool = pool(3, QueueStrategy::Fifo);
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let pool = Arc::clone(&pool);
        tasks.push(tokio::spawn(async move {
            for _ in 0..25 {
                let handle = pool.acquire().await.expect("slot");
                tokio::task::yield_now().await;
                pool.release(handle);
            }
        }));
    }
    for task in tasks {
        task.await.expect("join");
    }

    let stats = pool.stats();
    assert_eq!(stats.running, 0);
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.available, 3);
}

#[tokio::test]
async fn pool_transitions_are_published() {
    let bus = Arc::new(EventBus::default());
    let config = PoolConfig {
        max_concurrent: 1,
        queue_strategy: QueueStrategy::Fifo,
    };
    let pool = ProcessPool::new(&config, Arc::clone(&bus));
    let mut events = bus.subscribe(EventFilter::kinds([
        EventKind::PoolSlotAcquired,
        EventKind::PoolSlotReleased,
    ]));

    let handle = pool.acquire().await.expect("slot");
    pool.release(handle);

    let first = events.recv().await.expect("acquired event");
    let second = events.recv().await.expect("released event");
    assert_eq!(first.kind(), EventKind::PoolSlotAcquired);
    assert_eq!(second.kind(), EventKind::PoolSlotReleased);
}
