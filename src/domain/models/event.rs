//! Domain events carried by the event bus.
//!
//! Events are immutable once emitted. Each carries a monotonic timestamp
//! and a payload variant; filtering is by payload discriminant.

use std::path::PathBuf;
use std::time::Duration;

use tokio::time::Instant;

use super::intervention::InterventionKind;

/// Which output stream an agent chunk arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Discriminant of an event payload, used for subscription filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AgentStarted,
    AgentOutput,
    AgentCompleted,
    AgentFailed,
    InterventionRequested,
    InterventionAnswered,
    InterventionTimedOut,
    PoolSlotAcquired,
    PoolSlotReleased,
    WorktreeAllocated,
    WorktreeReleased,
    WorktreeAllocationFailed,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AgentStarted => "agent-started",
            Self::AgentOutput => "agent-output",
            Self::AgentCompleted => "agent-completed",
            Self::AgentFailed => "agent-failed",
            Self::InterventionRequested => "intervention-requested",
            Self::InterventionAnswered => "intervention-answered",
            Self::InterventionTimedOut => "intervention-timedout",
            Self::PoolSlotAcquired => "pool-slot-acquired",
            Self::PoolSlotReleased => "pool-slot-released",
            Self::WorktreeAllocated => "worktree-allocated",
            Self::WorktreeReleased => "worktree-released",
            Self::WorktreeAllocationFailed => "worktree-allocation-failed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Event payload; each variant carries only the fields it needs.
#[derive(Debug, Clone)]
pub enum EventPayload {
    AgentStarted {
        agent_id: String,
    },
    AgentOutput {
        agent_id: String,
        stream: StreamKind,
        message: String,
    },
    AgentCompleted {
        agent_id: String,
        exit_code: i32,
        duration: Duration,
    },
    AgentFailed {
        agent_id: String,
        error: String,
    },
    InterventionRequested {
        request_id: String,
        agent_id: String,
        kind: InterventionKind,
    },
    InterventionAnswered {
        request_id: String,
        agent_id: String,
    },
    InterventionTimedOut {
        request_id: String,
        agent_id: String,
    },
    PoolSlotAcquired {
        running: usize,
        queued: usize,
    },
    PoolSlotReleased {
        running: usize,
        queued: usize,
    },
    WorktreeAllocated {
        allocation_id: String,
        worktree_path: PathBuf,
        branch_name: String,
    },
    WorktreeReleased {
        allocation_id: String,
        worktree_path: PathBuf,
    },
    WorktreeAllocationFailed {
        repo_path: PathBuf,
        reason: String,
    },
}

impl EventPayload {
    /// Return the discriminant of this payload variant.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::AgentStarted { .. } => EventKind::AgentStarted,
            Self::AgentOutput { .. } => EventKind::AgentOutput,
            Self::AgentCompleted { .. } => EventKind::AgentCompleted,
            Self::AgentFailed { .. } => EventKind::AgentFailed,
            Self::InterventionRequested { .. } => EventKind::InterventionRequested,
            Self::InterventionAnswered { .. } => EventKind::InterventionAnswered,
            Self::InterventionTimedOut { .. } => EventKind::InterventionTimedOut,
            Self::PoolSlotAcquired { .. } => EventKind::PoolSlotAcquired,
            Self::PoolSlotReleased { .. } => EventKind::PoolSlotReleased,
            Self::WorktreeAllocated { .. } => EventKind::WorktreeAllocated,
            Self::WorktreeReleased { .. } => EventKind::WorktreeReleased,
            Self::WorktreeAllocationFailed { .. } => EventKind::WorktreeAllocationFailed,
        }
    }
}

/// An emitted domain event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Monotonic instant assigned at emission.
    pub timestamp: Instant,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            timestamp: Instant::now(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_payload_kind_mapping() {
        let payload = EventPayload::AgentStarted {
            agent_id: "agt_1".to_string(),
        };
        assert_eq!(payload.kind(), EventKind::AgentStarted);

        let payload = EventPayload::PoolSlotReleased {
            running: 1,
            queued: 0,
        };
        assert_eq!(payload.kind(), EventKind::PoolSlotReleased);
    }

    #[test]
    fn test_kind_strings() {
        assert_eq!(EventKind::InterventionTimedOut.as_str(), "intervention-timedout");
        assert_eq!(EventKind::WorktreeAllocated.as_str(), "worktree-allocated");
    }

    #[tokio::test]
    async fn test_event_timestamp_is_monotonic() {
        let first = Event::new(EventPayload::AgentStarted {
            agent_id: "agt_1".to_string(),
        });
        let second = Event::new(EventPayload::AgentStarted {
            agent_id: "agt_2".to_string(),
        });
        assert!(second.timestamp >= first.timestamp);
    }
}
