//! Core services for the Agora orchestration engine.
//!
//! Everything here is run-agnostic machinery: the per-run event bus, cost
//! tracking, circuit breakers, rate limiting, the safety guardian, the
//! shared scratchpad, conflict detection, catalog snapshots, persistence and
//! the HITL approval store. The turn loop itself lives in
//! `agora-orchestrator`.

pub mod approvals;
pub mod breaker;
pub mod capabilities;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod cost;
pub mod event_bus;
pub mod guardian;
pub mod rate_limit;
pub mod scratchpad;
pub mod store;

pub use approvals::{
    ApprovalDecision, ApprovalFilter, ApprovalRecord, ApprovalRequestDetails, ApprovalStatus,
    ApprovalStore,
};
pub use breaker::{Admission, BreakerRegistry, BreakerStateKind, CircuitBreaker};
pub use capabilities::{
    AuditSink, LlmChunk, LlmClient, LlmStream, NullAuditSink, RetrievedChunk, Retriever,
    UsageReport,
};
pub use catalog::{CatalogRegistry, CatalogSnapshot};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AutoApproveRule, BreakerConfig, Deadlines, DecisionConfig, EngineConfig, FeatureFlags,
    FlagSnapshot, FlagStore, HitlConfig, ModelRate, RagConfig, RateLimitConfig, SelectorWeights,
};
pub use conflict::{ConflictDetector, ConflictFinding};
pub use cost::CostTracker;
pub use event_bus::{EventSubscription, RunEventBus};
pub use guardian::{GuardianDecision, RiskSignals, SafetyGuardian};
pub use rate_limit::{RateCategory, RateLimiter};
pub use scratchpad::{approx_tokens, extract_notes, NoteKind, Scratchpad, ScratchpadNote};
pub use store::RunStore;
