//! Process pool: admission control for subprocess creation.
//!
//! A counted slot budget plus an ordered waiter queue. Slots released while
//! waiters are queued are handed over directly, so the running count never
//! dips between a release and the matching grant. Low-priority waiters can
//! starve under the priority discipline; that is the intended trade-off.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::domain::error::PoolError;
use crate::domain::models::config::{PoolConfig, QueueStrategy};
use crate::domain::models::event::EventPayload;

use super::event_bus::EventBus;

/// A granted slot. Surrender it with [`ProcessPool::release`].
#[derive(Debug)]
pub struct SlotHandle {
    slot: u64,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolStats {
    pub max_concurrent: usize,
    pub running: usize,
    pub queued: usize,
    pub available: usize,
    pub utilization_pct: f64,
}

struct Waiter {
    id: u64,
    priority: i32,
    enqueued_at: tokio::time::Instant,
    tx: oneshot::Sender<u64>,
}

struct PoolState {
    max_concurrent: usize,
    running: usize,
    queue: VecDeque<Waiter>,
    next_waiter: u64,
    next_slot: u64,
}

impl PoolState {
    fn next_slot_id(&mut self) -> u64 {
        let id = self.next_slot;
        self.next_slot += 1;
        id
    }
}

/// Concurrency-limited admission gate for subprocess creation.
pub struct ProcessPool {
    state: Mutex<PoolState>,
    strategy: QueueStrategy,
    bus: Arc<EventBus>,
}

impl ProcessPool {
    pub fn new(config: &PoolConfig, bus: Arc<EventBus>) -> Self {
        Self {
            state: Mutex::new(PoolState {
                max_concurrent: config.max_concurrent.max(1),
                running: 0,
                queue: VecDeque::new(),
                next_waiter: 0,
                next_slot: 0,
            }),
            strategy: config.queue_strategy,
            bus,
        }
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire a slot at default priority.
    pub async fn acquire(&self) -> Result<SlotHandle, PoolError> {
        self.acquire_with_priority(0).await
    }

    /// Acquire a slot, queueing behind the configured discipline when full.
    ///
    /// Cancellation-safe: dropping the returned future before the grant
    /// unregisters the waiter; a grant that raced the cancellation is
    /// handed straight back to the pool.
    pub async fn acquire_with_priority(&self, priority: i32) -> Result<SlotHandle, PoolError> {
        let (waiter_id, rx) = {
            let mut state = self.state();
            if state.running < state.max_concurrent {
                state.running += 1;
                let handle = SlotHandle {
                    slot: state.next_slot_id(),
                };
                let (running, queued) = (state.running, state.queue.len());
                drop(state);
                debug!(slot = handle.slot, running, "pool slot acquired");
                self.bus
                    .emit(EventPayload::PoolSlotAcquired { running, queued });
                return Ok(handle);
            }

            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter;
            state.next_waiter += 1;
            let waiter = Waiter {
                id,
                priority,
                enqueued_at: tokio::time::Instant::now(),
                tx,
            };
            match self.strategy {
                QueueStrategy::Fifo => state.queue.push_back(waiter),
                QueueStrategy::Priority => insert_by_priority(&mut state.queue, waiter),
            }
            debug!(waiter = id, priority, queued = state.queue.len(), "pool full; waiting");
            (id, rx)
        };

        let slot = WaitForGrant {
            pool: self,
            waiter_id,
            rx: Some(rx),
            done: false,
        }
        .await?;
        Ok(SlotHandle { slot })
    }

    /// Surrender a slot: hand it to the head waiter, or free it.
    pub fn release(&self, handle: SlotHandle) {
        debug!(slot = handle.slot, "pool slot released");
        let mut state = self.state();
        self.release_locked(&mut state);
    }

    /// Change the concurrency limit.
    ///
    /// An increase grants freed capacity to queued waiters immediately; a
    /// decrease never interrupts running work and takes effect as slots
    /// drain.
    pub fn set_limit(&self, limit: usize) -> Result<(), PoolError> {
        if limit < 1 {
            return Err(PoolError::LimitTooLow(limit));
        }

        let mut state = self.state();
        let old = state.max_concurrent;
        state.max_concurrent = limit;
        if limit <= old {
            debug!(old, new = limit, "pool limit lowered; drains naturally");
            return Ok(());
        }

        let mut grants = limit - old;
        while grants > 0 {
            let Some(waiter) = state.queue.pop_front() else {
                break;
            };
            let slot = state.next_slot_id();
            if waiter.tx.send(slot).is_ok() {
                state.running += 1;
                grants -= 1;
                let (running, queued) = (state.running, state.queue.len());
                self.bus
                    .emit(EventPayload::PoolSlotAcquired { running, queued });
            }
        }
        debug!(old, new = limit, "pool limit raised");
        Ok(())
    }

    /// Fail every queued waiter with [`PoolError::QueueCleared`].
    ///
    /// Running slots are untouched. Returns how many waiters were failed.
    pub fn clear_queue(&self) -> usize {
        let drained: Vec<Waiter> = {
            let mut state = self.state();
            state.queue.drain(..).collect()
        };
        let count = drained.len();
        if count > 0 {
            warn!(count, "pool queue cleared; failing waiters");
        }
        // Dropping the senders resolves each waiter with QueueCleared.
        drop(drained);
        count
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state();
        let available = state.max_concurrent.saturating_sub(state.running);
        #[allow(clippy::cast_precision_loss)]
        let utilization_pct = if state.max_concurrent == 0 {
            0.0
        } else {
            (state.running as f64 / state.max_concurrent as f64) * 100.0
        };
        PoolStats {
            max_concurrent: state.max_concurrent,
            running: state.running,
            queued: state.queue.len(),
            available,
            utilization_pct,
        }
    }

    /// Either advances a waiter (running unchanged) or decrements running,
    /// never both. Over-release is warned and ignored.
    fn release_locked(&self, state: &mut PoolState) {
        if state.running == 0 {
            warn!("pool release with no running slots; ignoring");
            return;
        }

        while let Some(waiter) = state.queue.pop_front() {
            let slot = state.next_slot_id();
            let waited = waiter.enqueued_at.elapsed();
            if waiter.tx.send(slot).is_ok() {
                debug!(waiter = waiter.id, ?waited, "pool slot handed to waiter");
                let (running, queued) = (state.running, state.queue.len());
                self.bus
                    .emit(EventPayload::PoolSlotReleased { running, queued });
                self.bus
                    .emit(EventPayload::PoolSlotAcquired { running, queued });
                return;
            }
            // The waiter's acquire future was dropped after the queue scan;
            // skip it and try the next one.
        }

        state.running -= 1;
        let (running, queued) = (state.running, state.queue.len());
        self.bus
            .emit(EventPayload::PoolSlotReleased { running, queued });
    }
}

/// Descending priority; ties go behind existing entries of equal priority.
fn insert_by_priority(queue: &mut VecDeque<Waiter>, waiter: Waiter) {
    let pos = queue.partition_point(|queued| queued.priority >= waiter.priority);
    queue.insert(pos, waiter);
}

/// Waits for a slot grant; cancellation unregisters the waiter atomically.
///
/// Grants are sent while the pool lock is held, so under that lock a waiter
/// is either still queued or its grant is already in the channel. Drop uses
/// that invariant: a queued waiter is removed, a delivered-but-unclaimed
/// grant is handed back to the pool, a cleared waiter needs nothing.
struct WaitForGrant<'a> {
    pool: &'a ProcessPool,
    waiter_id: u64,
    rx: Option<oneshot::Receiver<u64>>,
    done: bool,
}

impl Future for WaitForGrant<'_> {
    type Output = Result<u64, PoolError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(rx) = this.rx.as_mut() else {
            return Poll::Ready(Err(PoolError::QueueCleared));
        };
        match Pin::new(rx).poll(cx) {
            Poll::Ready(Ok(slot)) => {
                this.done = true;
                Poll::Ready(Ok(slot))
            }
            Poll::Ready(Err(_)) => {
                this.done = true;
                Poll::Ready(Err(PoolError::QueueCleared))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for WaitForGrant<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        {
            let mut state = self.pool.state();
            if let Some(pos) = state
                .queue
                .iter()
                .position(|waiter| waiter.id == self.waiter_id)
            {
                state.queue.remove(pos);
                debug!(waiter = self.waiter_id, "pool acquisition cancelled; waiter removed");
                return;
            }
        }
        // Not queued: either a grant raced the cancellation or the queue was
        // cleared. Only a delivered grant carries a slot to give back.
        if let Some(mut rx) = self.rx.take() {
            if rx.try_recv().is_ok() {
                debug!(waiter = self.waiter_id, "cancelled after grant; returning slot");
                let mut state = self.pool.state();
                self.pool.release_locked(&mut state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(max_concurrent: usize, queue_strategy: QueueStrategy) -> ProcessPool {
        let config = PoolConfig {
            max_concurrent,
            queue_strategy,
        };
        ProcessPool::new(&config, Arc::new(EventBus::default()))
    }

    #[tokio::test]
    async fn test_acquire_within_limit_is_immediate() {
        let pool = pool(2, QueueStrategy::Fifo);
        let a = pool.acquire().await.expect("first slot");
        let b = pool.acquire().await.expect("second slot");

        let stats = pool.stats();
        assert_eq!(stats.running, 2);
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.available, 0);
        assert!((stats.utilization_pct - 100.0).abs() < f64::EPSILON);

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.stats().running, 0);
    }

    #[tokio::test]
    async fn test_release_frees_slot() {
        let pool = pool(1, QueueStrategy::Fifo);
        let handle = pool.acquire().await.expect("slot");
        assert_eq!(pool.stats().available, 0);
        pool.release(handle);
        assert_eq!(pool.stats().available, 1);
    }

    #[tokio::test]
    async fn test_set_limit_too_low() {
        let pool = pool(2, QueueStrategy::Fifo);
        assert_eq!(pool.set_limit(0), Err(PoolError::LimitTooLow(0)));
    }

    #[tokio::test]
    async fn test_set_limit_is_idempotent() {
        let pool = pool(2, QueueStrategy::Fifo);
        pool.set_limit(5).expect("raise");
        pool.set_limit(5).expect("raise again");
        assert_eq!(pool.stats().max_concurrent, 5);
    }

    #[tokio::test]
    async fn test_decrease_never_interrupts_running() {
        let pool = pool(2, QueueStrategy::Fifo);
        let a = pool.acquire().await.expect("slot a");
        let b = pool.acquire().await.expect("slot b");

        pool.set_limit(1).expect("lower limit");
        let stats = pool.stats();
        assert_eq!(stats.running, 2);
        assert_eq!(stats.max_concurrent, 1);
        assert_eq!(stats.available, 0);

        pool.release(a);
        assert_eq!(pool.stats().running, 1);
        pool.release(b);
        assert_eq!(pool.stats().running, 0);
    }

    #[tokio::test]
    async fn test_clear_queue_on_empty_queue() {
        let pool = pool(1, QueueStrategy::Fifo);
        assert_eq!(pool.clear_queue(), 0);
    }

    #[test]
    fn test_priority_insertion_is_stable() {
        let mut queue = VecDeque::new();
        let mk = |id: u64, priority: i32| {
            let (tx, _rx) = oneshot::channel();
            // Receivers are dropped immediately; only ordering matters here.
            std::mem::forget(_rx);
            Waiter {
                id,
                priority,
                enqueued_at: tokio::time::Instant::now(),
                tx,
            }
        };
        insert_by_priority(&mut queue, mk(0, 0));
        insert_by_priority(&mut queue, mk(1, 10));
        insert_by_priority(&mut queue, mk(2, 5));
        insert_by_priority(&mut queue, mk(3, 10));

        let order: Vec<u64> = queue.iter().map(|w| w.id).collect();
        assert_eq!(order, vec![1, 3, 2, 0]);
    }
}
