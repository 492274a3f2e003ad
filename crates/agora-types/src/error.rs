// Agora Error Types
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgoraError>;

/// Failure class reported by an `LlmClient`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelErrorKind {
    #[error("transient")]
    Transient,
    #[error("auth")]
    Auth,
    #[error("policy")]
    Policy,
    #[error("rate")]
    Rate,
    #[error("unavailable")]
    Unavailable,
}

#[derive(Error, Debug, Clone)]
pub enum AgoraError {
    #[error("plan infeasible: {0}")]
    PlanInfeasible(String),

    #[error("plan confidence too low: {0}")]
    PlanLowConfidence(String),

    #[error("tool `{0}` is not permitted by the plan")]
    ToolNotPermitted(String),

    #[error("invalid input for tool `{tool}`: {reason}")]
    ToolInputInvalid { tool: String, reason: String },

    #[error("output of tool `{tool}` rejected: {reason}")]
    ToolOutputRejected { tool: String, reason: String },

    #[error("tool `{0}` timed out")]
    ToolTimeout(String),

    #[error("tool `{0}` is unavailable")]
    ToolUnavailable(String),

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("approval `{id}` rejected: {reason}")]
    ApprovalRejected { id: String, reason: String },

    #[error("approval `{0}` expired")]
    ApprovalExpired(String),

    #[error("model error ({kind}): {detail}")]
    Model { kind: ModelErrorKind, detail: String },

    #[error("retriever error: {0}")]
    Retriever(String),

    #[error("cancelled")]
    Cancelled,

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("queue full: {0} runs already active")]
    QueueFull(usize),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AgoraError {
    /// Short stable identifier used in `run_failed` events and summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PlanInfeasible(_) => "plan_infeasible",
            Self::PlanLowConfidence(_) => "plan_low_confidence",
            Self::ToolNotPermitted(_) => "tool_not_permitted",
            Self::ToolInputInvalid { .. } => "tool_input_invalid",
            Self::ToolOutputRejected { .. } => "tool_output_rejected",
            Self::ToolTimeout(_) => "tool_timeout",
            Self::ToolUnavailable(_) => "tool_unavailable",
            Self::BudgetExceeded(_) => "budget_exceeded",
            Self::RateLimited(_) => "rate_limited",
            Self::ApprovalRejected { .. } => "approval_rejected",
            Self::ApprovalExpired(_) => "approval_expired",
            Self::Model { kind, .. } => match kind {
                ModelErrorKind::Transient => "model_transient",
                ModelErrorKind::Auth => "model_auth",
                ModelErrorKind::Policy => "model_policy",
                ModelErrorKind::Rate => "model_rate",
                ModelErrorKind::Unavailable => "model_unavailable",
            },
            Self::Retriever(_) => "retriever_error",
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded(_) => "deadline_exceeded",
            Self::QueueFull(_) => "queue_full",
            Self::NotFound(_) => "not_found",
            Self::Storage(_) => "storage_error",
            Self::Serialization(_) => "serialization_error",
            Self::InvalidOperation(_) => "invalid_operation",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether a bounded local retry is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Model {
                kind: ModelErrorKind::Transient | ModelErrorKind::Rate,
                ..
            } | Self::Retriever(_)
                | Self::RateLimited(_)
        )
    }

    /// Errors that must never be retried automatically.
    pub fn is_policy(&self) -> bool {
        matches!(
            self,
            Self::Model {
                kind: ModelErrorKind::Policy,
                ..
            } | Self::ToolOutputRejected { .. }
        )
    }

    /// Errors that end the whole run rather than the current turn.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            Self::PlanInfeasible(_) | Self::Cancelled | Self::DeadlineExceeded(_) | Self::Internal(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(AgoraError::Model {
            kind: ModelErrorKind::Transient,
            detail: "502".into()
        }
        .is_transient());
        assert!(AgoraError::Retriever("timeout".into()).is_transient());
        assert!(!AgoraError::Model {
            kind: ModelErrorKind::Policy,
            detail: "refused".into()
        }
        .is_transient());
    }

    #[test]
    fn policy_errors_are_not_run_fatal() {
        let err = AgoraError::ToolOutputRejected {
            tool: "db_query".into(),
            reason: "pii".into(),
        };
        assert!(err.is_policy());
        assert!(!err.is_run_fatal());
    }

    #[test]
    fn kind_is_stable() {
        assert_eq!(AgoraError::Cancelled.kind(), "cancelled");
        assert_eq!(
            AgoraError::Model {
                kind: ModelErrorKind::Unavailable,
                detail: String::new()
            }
            .kind(),
            "model_unavailable"
        );
    }
}
