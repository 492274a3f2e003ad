//! Shared data model for the Agora orchestration core.
//!
//! Everything here is plain data with serde derives: conversation messages,
//! decision plans, catalog entries, sequenced run events and the error
//! taxonomy. Behavior lives in `agora-core` and `agora-orchestrator`.

pub mod catalog;
pub mod error;
pub mod event;
pub mod message;
pub mod plan;

pub use catalog::{AgentSpec, AgentTier, SafetyLevel, SideEffects, ToolCostModel, ToolSpec};
pub use error::{AgoraError, ModelErrorKind, Result};
pub use event::{
    ApprovalOutcome, BudgetEventKind, ConflictKind, CostLedgerEntry, CostTotals, EventPriority,
    RagChunkMeta, RunEvent, RunEventPayload, RunStatus, RunStatusReport, RunSummaryRecord,
    ScoreBreakdown, ToolInvocationStatus,
};
pub use message::{BudgetHint, Message, Request, Role};
pub use plan::{
    Budget, DecisionPlan, FinalizerPolicy, ModelKnobs, Rationale, RationaleReason, RiskTier,
    SourceKind, UsdMicros,
};
