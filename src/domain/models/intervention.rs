//! Intervention domain model.
//!
//! An intervention is a moment where a running agent needs human input
//! before continuing. Requests are classified from streamed agent output
//! and resolved by an operator response, a timeout, or a cancellation.

use tokio::time::Instant;

use super::ids;

/// What kind of input the agent is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterventionKind {
    /// A free-form question (sentence ending in `?`).
    Question,
    /// Permission or confirmation to proceed.
    Approval,
    /// A concrete value the agent wants entered.
    Input,
    /// A selection among enumerated options.
    Choice,
}

impl InterventionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Question => "question",
            Self::Approval => "approval",
            Self::Input => "input",
            Self::Choice => "choice",
        }
    }
}

impl std::fmt::Display for InterventionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of an intervention request.
///
/// `Pending` is the only non-terminal state; a request leaves it at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterventionStatus {
    Pending,
    Answered,
    Timeout,
    /// Cancellation removes the request from the handler's table, so no
    /// stored record carries this status; it completes the status domain.
    Cancelled,
}

impl InterventionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Answered => "answered",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for InterventionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A request for human input extracted from an agent's output stream.
#[derive(Debug, Clone)]
pub struct InterventionRequest {
    /// Unique identifier (`itv_…`).
    pub id: String,
    /// Agent whose output produced this request.
    pub agent_id: String,
    /// Classified request kind.
    pub kind: InterventionKind,
    /// The line the agent is waiting on.
    pub prompt: String,
    /// Extracted option texts; non-empty only for [`InterventionKind::Choice`].
    pub options: Vec<String>,
    /// Output preceding the prompt, leading-truncated to 500 chars.
    pub context: String,
    /// Current lifecycle state.
    pub status: InterventionStatus,
    /// Operator response; present iff status is `Answered`.
    pub response: Option<String>,
    /// When the request was classified.
    pub created_at: Instant,
    /// When the request left `Pending`.
    pub resolved_at: Option<Instant>,
}

impl InterventionRequest {
    pub fn new(
        agent_id: impl Into<String>,
        kind: InterventionKind,
        prompt: impl Into<String>,
        options: Vec<String>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            id: ids::intervention_id(),
            agent_id: agent_id.into(),
            kind,
            prompt: prompt.into(),
            options,
            context: context.into(),
            status: InterventionStatus::Pending,
            response: None,
            created_at: Instant::now(),
            resolved_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == InterventionStatus::Pending
    }

    /// Resolve with an operator response.
    pub(crate) fn answer(&mut self, response: impl Into<String>) {
        self.status = InterventionStatus::Answered;
        self.response = Some(response.into());
        self.resolved_at = Some(Instant::now());
    }

    /// Resolve by timer expiry.
    pub(crate) fn time_out(&mut self) {
        self.status = InterventionStatus::Timeout;
        self.resolved_at = Some(Instant::now());
    }
}
