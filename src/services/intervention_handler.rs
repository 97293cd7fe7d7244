//! Intervention handler: request table, timers, and operator delivery.
//!
//! Observes classified agent output, keeps a table of pending requests,
//! enforces per-request timeouts, and relays operator responses back to
//! the orchestrator. Answered requests stay queryable; cancelled ones are
//! removed. The request table and timer map share one mutex; timer
//! callbacks reacquire it briefly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::error::InterventionError;
use crate::domain::models::config::InterventionConfig;
use crate::domain::models::event::EventPayload;
use crate::domain::models::intervention::{InterventionRequest, InterventionStatus};

use super::event_bus::EventBus;
use super::intervention_classifier;

/// Aggregate counters over the request table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterventionStats {
    pub total: usize,
    pub pending: usize,
    pub answered: usize,
    pub timed_out: usize,
}

#[derive(Default)]
struct HandlerState {
    requests: HashMap<String, InterventionRequest>,
    timers: HashMap<String, JoinHandle<()>>,
}

/// Detects and tracks moments where an agent needs human input.
pub struct InterventionHandler {
    state: Mutex<HandlerState>,
    config: InterventionConfig,
    bus: Arc<EventBus>,
    /// Handed to timer tasks so they can never outlive the handler.
    self_ref: Weak<InterventionHandler>,
}

impl InterventionHandler {
    pub fn new(config: InterventionConfig, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            state: Mutex::new(HandlerState::default()),
            config,
            bus,
            self_ref: self_ref.clone(),
        })
    }

    fn state(&self) -> MutexGuard<'_, HandlerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Classify an output chunk without storing anything.
    pub fn classify(&self, agent_id: &str, chunk: &str) -> Option<InterventionRequest> {
        intervention_classifier::classify(agent_id, chunk)
    }

    /// Classify a chunk and enqueue any detected request.
    pub fn observe(&self, agent_id: &str, chunk: &str) -> Option<InterventionRequest> {
        let request = intervention_classifier::classify(agent_id, chunk)?;
        if self.enqueue(request.clone()) {
            Some(request)
        } else {
            None
        }
    }

    /// Store a request, arm its timer, and announce it.
    ///
    /// Returns false when the agent is already at `max_pending_per_agent`;
    /// the detection is dropped with a warning and no event, so pathological
    /// output cannot swamp the operator.
    pub fn enqueue(&self, request: InterventionRequest) -> bool {
        let request_id = request.id.clone();
        let agent_id = request.agent_id.clone();
        let kind = request.kind;

        {
            let mut state = self.state();
            let pending = state
                .requests
                .values()
                .filter(|r| r.agent_id == agent_id && r.is_pending())
                .count();
            if pending >= self.config.max_pending_per_agent {
                warn!(
                    agent_id,
                    pending,
                    limit = self.config.max_pending_per_agent,
                    "agent at pending-intervention capacity; dropping detection"
                );
                return false;
            }

            state.requests.insert(request_id.clone(), request);

            if self.config.timeouts_enabled {
                let weak = self.self_ref.clone();
                let timer_id = request_id.clone();
                let timeout = self.config.default_timeout();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if let Some(handler) = weak.upgrade() {
                        handler.timeout(&timer_id);
                    }
                });
                state.timers.insert(request_id.clone(), timer);
            }
        }

        debug!(request_id, agent_id, kind = %kind, "intervention enqueued");
        self.bus.emit(EventPayload::InterventionRequested {
            request_id,
            agent_id,
            kind,
        });
        true
    }

    /// Deliver an operator response to a pending request.
    pub fn respond(
        &self,
        request_id: &str,
        response: &str,
    ) -> Result<InterventionRequest, InterventionError> {
        let (updated, timer) = {
            let mut guard = self.state();
            let state = &mut *guard;
            let request = state
                .requests
                .get_mut(request_id)
                .ok_or_else(|| InterventionError::NotFound(request_id.to_string()))?;
            if !request.is_pending() {
                return Err(InterventionError::NotPending {
                    id: request_id.to_string(),
                    status: request.status,
                });
            }
            request.answer(response);
            (request.clone(), state.timers.remove(request_id))
        };
        if let Some(timer) = timer {
            timer.abort();
        }

        debug!(request_id, agent_id = updated.agent_id, "intervention answered");
        self.bus.emit(EventPayload::InterventionAnswered {
            request_id: updated.id.clone(),
            agent_id: updated.agent_id.clone(),
        });
        Ok(updated)
    }

    /// Expire a pending request. Idempotent on unknown or non-pending ids.
    pub fn timeout(&self, request_id: &str) -> bool {
        let expired = {
            let mut guard = self.state();
            let state = &mut *guard;
            let Some(request) = state.requests.get_mut(request_id) else {
                return false;
            };
            if !request.is_pending() {
                return false;
            }
            request.time_out();
            state.timers.remove(request_id);
            (request.id.clone(), request.agent_id.clone())
        };

        debug!(request_id, agent_id = expired.1, "intervention timed out");
        self.bus.emit(EventPayload::InterventionTimedOut {
            request_id: expired.0,
            agent_id: expired.1,
        });
        true
    }

    /// Remove a pending request without an event (agent shutdown path).
    ///
    /// Returns false and changes nothing when the request is unknown or
    /// already terminal.
    pub fn cancel(&self, request_id: &str) -> bool {
        let timer = {
            let mut state = self.state();
            let Some(request) = state.requests.get(request_id) else {
                return false;
            };
            if !request.is_pending() {
                return false;
            }
            state.requests.remove(request_id);
            state.timers.remove(request_id)
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        debug!(request_id, "intervention cancelled");
        true
    }

    /// Cancel every pending request for an agent. Returns how many.
    pub fn cancel_all_for_agent(&self, agent_id: &str) -> usize {
        let ids: Vec<String> = {
            let state = self.state();
            state
                .requests
                .values()
                .filter(|r| r.agent_id == agent_id && r.is_pending())
                .map(|r| r.id.clone())
                .collect()
        };
        let mut cancelled = 0;
        for id in ids {
            if self.cancel(&id) {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Pending requests, oldest first, optionally for one agent.
    pub fn pending(&self, agent_id: Option<&str>) -> Vec<InterventionRequest> {
        let state = self.state();
        let mut pending: Vec<InterventionRequest> = state
            .requests
            .values()
            .filter(|r| r.is_pending() && agent_id.is_none_or(|a| r.agent_id == a))
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending
    }

    pub fn has_pending(&self, agent_id: &str) -> bool {
        let state = self.state();
        state
            .requests
            .values()
            .any(|r| r.agent_id == agent_id && r.is_pending())
    }

    /// Look up any request, terminal ones included.
    pub fn get(&self, request_id: &str) -> Option<InterventionRequest> {
        self.state().requests.get(request_id).cloned()
    }

    pub fn stats(&self) -> InterventionStats {
        let state = self.state();
        let mut stats = InterventionStats {
            total: state.requests.len(),
            ..InterventionStats::default()
        };
        for request in state.requests.values() {
            match request.status {
                InterventionStatus::Pending => stats.pending += 1,
                InterventionStatus::Answered => stats.answered += 1,
                InterventionStatus::Timeout => stats.timed_out += 1,
                // Cancellation removes the entry, so the table never holds
                // a cancelled record.
                InterventionStatus::Cancelled => {}
            }
        }
        stats
    }

    /// Disarm every timer. Requests stay queryable; nothing times out after.
    pub fn shutdown(&self) {
        let timers: Vec<JoinHandle<()>> = {
            let mut state = self.state();
            state.timers.drain().map(|(_, timer)| timer).collect()
        };
        for timer in &timers {
            timer.abort();
        }
        debug!(disarmed = timers.len(), "intervention handler shut down");
    }
}

impl Drop for InterventionHandler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::intervention::InterventionKind;
    use std::time::Duration;

    fn handler(config: InterventionConfig) -> (Arc<InterventionHandler>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::default());
        (InterventionHandler::new(config, Arc::clone(&bus)), bus)
    }

    fn request(agent_id: &str) -> InterventionRequest {
        InterventionRequest::new(agent_id, InterventionKind::Question, "ready?", vec![], "")
    }

    #[tokio::test]
    async fn test_enqueue_then_respond() {
        let (handler, _bus) = handler(InterventionConfig::default());
        let req = request("agt_1");
        let id = req.id.clone();

        assert!(handler.enqueue(req));
        assert!(handler.has_pending("agt_1"));

        let answered = handler.respond(&id, "yes").expect("respond");
        assert_eq!(answered.status, InterventionStatus::Answered);
        assert_eq!(answered.response.as_deref(), Some("yes"));
        assert!(!handler.has_pending("agt_1"));

        // Answered requests remain queryable.
        assert_eq!(
            handler.get(&id).map(|r| r.status),
            Some(InterventionStatus::Answered)
        );
    }

    #[tokio::test]
    async fn test_respond_twice_is_not_pending() {
        let (handler, _bus) = handler(InterventionConfig::default());
        let req = request("agt_1");
        let id = req.id.clone();
        handler.enqueue(req);

        handler.respond(&id, "first").expect("first respond");
        let err = handler.respond(&id, "second").expect_err("second respond");
        assert_eq!(
            err,
            InterventionError::NotPending {
                id: id.clone(),
                status: InterventionStatus::Answered,
            }
        );

        // Later timeout on the answered request is a no-op.
        assert!(!handler.timeout(&id));
    }

    #[tokio::test]
    async fn test_respond_unknown_id() {
        let (handler, _bus) = handler(InterventionConfig::default());
        let err = handler.respond("itv_missing", "x").expect_err("unknown id");
        assert_eq!(err, InterventionError::NotFound("itv_missing".to_string()));
    }

    #[tokio::test]
    async fn test_cancel_removes_pending_only() {
        let (handler, _bus) = handler(InterventionConfig::default());
        let req = request("agt_1");
        let id = req.id.clone();
        handler.enqueue(req);

        assert!(handler.cancel(&id));
        assert!(handler.get(&id).is_none());
        assert!(!handler.cancel(&id));

        let req = request("agt_1");
        let id = req.id.clone();
        handler.enqueue(req);
        handler.respond(&id, "done").expect("respond");
        assert!(!handler.cancel(&id), "terminal requests are kept");
        assert!(handler.get(&id).is_some());
    }

    #[tokio::test]
    async fn test_cancel_all_for_agent() {
        let (handler, _bus) = handler(InterventionConfig::default());
        handler.enqueue(request("agt_1"));
        handler.enqueue(request("agt_1"));
        handler.enqueue(request("agt_2"));

        assert_eq!(handler.cancel_all_for_agent("agt_1"), 2);
        assert!(!handler.has_pending("agt_1"));
        assert!(handler.has_pending("agt_2"));
    }

    #[tokio::test]
    async fn test_back_pressure_drops_excess_detections() {
        let config = InterventionConfig {
            max_pending_per_agent: 2,
            ..InterventionConfig::default()
        };
        let (handler, bus) = handler(config);
        let mut events = bus.subscribe(super::super::event_bus::EventFilter::kind(
            crate::domain::models::event::EventKind::InterventionRequested,
        ));

        assert!(handler.enqueue(request("agt_1")));
        assert!(handler.enqueue(request("agt_1")));
        assert!(!handler.enqueue(request("agt_1")), "third detection dropped");
        assert!(handler.enqueue(request("agt_2")), "other agents unaffected");

        assert_eq!(handler.pending(Some("agt_1")).len(), 2);
        // Dropped detections emit nothing: exactly three requested events.
        let mut seen = 0;
        while events.try_recv().is_some() {
            seen += 1;
        }
        assert_eq!(seen, 3);
    }

    #[tokio::test]
    async fn test_pending_is_oldest_first() {
        let (handler, _bus) = handler(InterventionConfig::default());
        let first = request("agt_1");
        let second = request("agt_1");
        let first_id = first.id.clone();
        let second_id = second.id.clone();
        handler.enqueue(first);
        handler.enqueue(second);

        let pending = handler.pending(Some("agt_1"));
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first_id);
        assert_eq!(pending[1].id, second_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_default_timeout() {
        let config = InterventionConfig {
            default_timeout_ms: 50,
            ..InterventionConfig::default()
        };
        let (handler, _bus) = handler(config);
        let req = request("agt_1");
        let id = req.id.clone();
        handler.enqueue(req);

        tokio::time::sleep(Duration::from_millis(60)).await;
        tokio::task::yield_now().await;

        assert_eq!(
            handler.get(&id).map(|r| r.status),
            Some(InterventionStatus::Timeout)
        );
        let err = handler.respond(&id, "late").expect_err("post-timeout respond");
        assert!(matches!(err, InterventionError::NotPending { .. }));
        assert_eq!(handler.stats().timed_out, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_respond_disarms_timer() {
        let config = InterventionConfig {
            default_timeout_ms: 50,
            ..InterventionConfig::default()
        };
        let (handler, _bus) = handler(config);
        let req = request("agt_1");
        let id = req.id.clone();
        handler.enqueue(req);

        handler.respond(&id, "quick").expect("respond");
        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;

        assert_eq!(
            handler.get(&id).map(|r| r.status),
            Some(InterventionStatus::Answered)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_disabled_never_expire() {
        let config = InterventionConfig {
            default_timeout_ms: 50,
            timeouts_enabled: false,
            ..InterventionConfig::default()
        };
        let (handler, _bus) = handler(config);
        let req = request("agt_1");
        let id = req.id.clone();
        handler.enqueue(req);

        tokio::time::sleep(Duration::from_millis(500)).await;
        tokio::task::yield_now().await;
        assert!(handler.get(&id).is_some_and(|r| r.is_pending()));
    }

    #[tokio::test]
    async fn test_stats_counts() {
        let (handler, _bus) = handler(InterventionConfig::default());
        let answered = request("agt_1");
        let answered_id = answered.id.clone();
        let timed = request("agt_1");
        let timed_id = timed.id.clone();
        handler.enqueue(answered);
        handler.enqueue(timed);
        handler.enqueue(request("agt_2"));

        handler.respond(&answered_id, "ok").expect("respond");
        handler.timeout(&timed_id);

        let stats = handler.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.answered, 1);
        assert_eq!(stats.timed_out, 1);
    }

    #[tokio::test]
    async fn test_observe_classifies_and_enqueues() {
        let (handler, _bus) = handler(InterventionConfig::default());
        let detected = handler
            .observe("agt_1", "Waiting for your approval to proceed.")
            .expect("approval observed");
        assert_eq!(detected.kind, InterventionKind::Approval);
        assert!(handler.has_pending("agt_1"));

        assert!(handler.observe("agt_1", "Compiling crate...").is_none());
    }
}
