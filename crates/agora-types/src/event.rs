// Run events
// Every observable thing a run does is one sequenced event on the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::Message;
use crate::plan::{DecisionPlan, UsdMicros};

/// Run lifecycle as observers see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    PausedForApproval,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// Per-factor speaker score, each component in [0, 1].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub phase_match: f64,
    pub topical_fit: f64,
    pub diversity: f64,
    pub critic_demand: f64,
    pub budget_fit: f64,
    pub total: f64,
}

/// Metadata for one retrieved chunk surfaced in a `rag_injected` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagChunkMeta {
    pub source: String,
    pub score: f64,
    pub hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolInvocationStatus {
    Ok,
    Failed,
    Rejected,
    TimedOut,
    Cached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    NumericDisagreement,
    OpposingPolarity,
    ContradictoryRecommendation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalOutcome {
    Approved,
    Rejected,
    Expired,
}

/// Budget threshold notifications, emitted at most once each per run:
/// `warn` at 70%, `hit_soft` at 90%, `hit_hard` at 100%.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetEventKind {
    Warn,
    HitSoft,
    HitHard,
}

/// Drop priority under backpressure. Low-priority events are shed first;
/// critical events are never shed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    Low,
    Normal,
    Critical,
}

/// Accumulated cost for a run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CostTotals {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub usd: UsdMicros,
}

impl CostTotals {
    pub fn total_tokens(&self) -> u64 {
        self.tokens_in + self.tokens_out
    }
}

/// One ledger delta, recorded per model or tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostLedgerEntry {
    pub turn: u32,
    pub agent: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub usd: UsdMicros,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEventPayload {
    DecisionMade {
        plan: DecisionPlan,
    },
    SpeakerSelected {
        agent: String,
        scores: ScoreBreakdown,
    },
    RagInjected {
        chunks: Vec<RagChunkMeta>,
        cache_hit: bool,
        latency_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    TokenDelta {
        agent: String,
        tokens_in: u64,
        tokens_out: u64,
        usd: UsdMicros,
    },
    ToolInvoked {
        name: String,
        input_hash: String,
        duration_ms: u64,
        status: ToolInvocationStatus,
    },
    ConflictDetected {
        agents: Vec<String>,
        kind: ConflictKind,
        excerpt: String,
    },
    ApprovalRequested {
        approval_id: String,
    },
    ApprovalResolved {
        approval_id: String,
        outcome: ApprovalOutcome,
    },
    BudgetEvent {
        kind: BudgetEventKind,
    },
    MessageAppended {
        message: Message,
    },
    /// Synthesized marker replacing events shed from a slow subscriber's
    /// buffer. `dropped` counts shed events since the previous marker.
    BackpressureDrop {
        dropped: u64,
    },
    RunCompleted {
        summary: String,
        cancelled: bool,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        warnings: Vec<String>,
    },
    RunFailed {
        error_kind: String,
        detail: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partial_summary: Option<String>,
    },
}

impl RunEventPayload {
    pub fn priority(&self) -> EventPriority {
        match self {
            RunEventPayload::TokenDelta { .. } | RunEventPayload::RagInjected { .. } => {
                EventPriority::Low
            }
            RunEventPayload::DecisionMade { .. }
            | RunEventPayload::ApprovalRequested { .. }
            | RunEventPayload::ApprovalResolved { .. }
            | RunEventPayload::RunCompleted { .. }
            | RunEventPayload::RunFailed { .. } => EventPriority::Critical,
            _ => EventPriority::Normal,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunEventPayload::RunCompleted { .. } | RunEventPayload::RunFailed { .. }
        )
    }

    /// Stable name matching the serde tag, for logs and filters.
    pub fn type_name(&self) -> &'static str {
        match self {
            RunEventPayload::DecisionMade { .. } => "decision_made",
            RunEventPayload::SpeakerSelected { .. } => "speaker_selected",
            RunEventPayload::RagInjected { .. } => "rag_injected",
            RunEventPayload::TokenDelta { .. } => "token_delta",
            RunEventPayload::ToolInvoked { .. } => "tool_invoked",
            RunEventPayload::ConflictDetected { .. } => "conflict_detected",
            RunEventPayload::ApprovalRequested { .. } => "approval_requested",
            RunEventPayload::ApprovalResolved { .. } => "approval_resolved",
            RunEventPayload::BudgetEvent { .. } => "budget_event",
            RunEventPayload::MessageAppended { .. } => "message_appended",
            RunEventPayload::BackpressureDrop { .. } => "backpressure_drop",
            RunEventPayload::RunCompleted { .. } => "run_completed",
            RunEventPayload::RunFailed { .. } => "run_failed",
        }
    }
}

/// Envelope for everything emitted on a run's event bus. `seq` is strictly
/// increasing within the run; the terminal event carries the maximum seq.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub event_id: String,
    pub run_id: String,
    pub turn_index: u32,
    pub seq: u64,
    pub ts_ms: u64,
    #[serde(flatten)]
    pub payload: RunEventPayload,
}

/// Persisted post-completion record for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummaryRecord {
    pub run_id: String,
    pub tenant_id: String,
    pub plan: DecisionPlan,
    pub cost_totals: CostTotals,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub message_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Poll-friendly view of a live run, mirroring the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatusReport {
    pub run_id: String,
    pub state: RunStatus,
    pub turn_index: u32,
    pub cost_totals: CostTotals,
    pub last_event_seq: u64,
}

/// Free-form note for audit sinks that accept raw values.
pub fn event_to_value(event: &RunEvent) -> Value {
    serde_json::to_value(event).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_serializes_with_type_tag() {
        let payload = RunEventPayload::BudgetEvent {
            kind: BudgetEventKind::HitSoft,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "budget_event");
        assert_eq!(json["kind"], "hit_soft");
    }

    #[test]
    fn priorities_order_token_deltas_first() {
        let token = RunEventPayload::TokenDelta {
            agent: "finance".into(),
            tokens_in: 10,
            tokens_out: 20,
            usd: UsdMicros(5),
        };
        let decision = RunEventPayload::ApprovalRequested {
            approval_id: "appr-1".into(),
        };
        assert!(token.priority() < decision.priority());
    }

    #[test]
    fn envelope_flattens_payload() {
        let event = RunEvent {
            event_id: "evt-1".into(),
            run_id: "run-1".into(),
            turn_index: 2,
            seq: 7,
            ts_ms: 1_000,
            payload: RunEventPayload::BackpressureDrop { dropped: 3 },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "backpressure_drop");
        assert_eq!(json["seq"], 7);
        let back: RunEvent = serde_json::from_value(json).unwrap();
        assert!(matches!(
            back.payload,
            RunEventPayload::BackpressureDrop { dropped: 3 }
        ));
    }
}
