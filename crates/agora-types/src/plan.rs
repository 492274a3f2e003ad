// Decision plan
// The immutable contract a run executes under.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AgoraError, Result};

/// Monetary amount in micro-USD (six fixed decimals).
///
/// All cost arithmetic is integer arithmetic so plans and ledgers stay
/// byte-deterministic across platforms.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UsdMicros(pub u64);

impl UsdMicros {
    pub const ZERO: UsdMicros = UsdMicros(0);

    pub fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Lossy helper for display and ratio math only.
    pub fn as_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    pub fn saturating_add(self, other: UsdMicros) -> UsdMicros {
        UsdMicros(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: UsdMicros) -> UsdMicros {
        UsdMicros(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for UsdMicros {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}.{:06}", self.0 / 1_000_000, self.0 % 1_000_000)
    }
}

impl std::iter::Sum for UsdMicros {
    fn sum<I: Iterator<Item = UsdMicros>>(iter: I) -> Self {
        iter.fold(UsdMicros::ZERO, UsdMicros::saturating_add)
    }
}

/// Retrieval source, in preference order inside a plan.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    BackendDb,
    Vector,
    Web,
    LlmOnly,
}

impl SourceKind {
    pub const ALL: [SourceKind; 4] = [
        SourceKind::BackendDb,
        SourceKind::Vector,
        SourceKind::Web,
        SourceKind::LlmOnly,
    ];
}

/// Sensitivity classification that drives HITL gating and tool policy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskTier {
    /// One-step promotion, saturating at `Critical`.
    pub fn promoted(self) -> RiskTier {
        match self {
            RiskTier::Low => RiskTier::Medium,
            RiskTier::Medium => RiskTier::High,
            RiskTier::High | RiskTier::Critical => RiskTier::Critical,
        }
    }
}

/// Model sampling knobs carried by the plan.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelKnobs {
    pub temperature: f32,
    pub max_tokens_per_turn: u64,
}

impl Default for ModelKnobs {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens_per_turn: 1024,
        }
    }
}

/// Hard spending limits for a run. All fields are upper bounds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Budget {
    pub max_usd: UsdMicros,
    pub max_tokens: u64,
    pub per_turn_max_tokens: u64,
}

impl Budget {
    pub fn new(max_usd: UsdMicros, max_tokens: u64, per_turn_max_tokens: u64) -> Self {
        Self {
            max_usd,
            max_tokens,
            per_turn_max_tokens,
        }
    }
}

/// One scored reason inside a plan rationale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RationaleReason {
    pub tag: String,
    pub contribution: f64,
}

/// Machine-readable explanation of why the plan looks the way it does.
/// `reasons` carries the top contributions; they sum to `confidence`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rationale {
    pub reasons: Vec<RationaleReason>,
    pub confidence: f64,
}

/// Who produces the final user-facing answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FinalizerPolicy {
    /// Deterministic reduction over the scratchpad and last messages.
    InternalReducer,
    /// A dedicated agent writes the final summary.
    Synthesizer { agent: String },
}

/// The typed execution plan produced by the decision engine. Immutable for
/// the lifetime of the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionPlan {
    /// Preferred retrieval order, best first.
    pub sources: Vec<SourceKind>,
    /// Tools admissible this run; a subset of the tool catalog.
    pub tools_allowed: BTreeSet<String>,
    pub model: String,
    pub knobs: ModelKnobs,
    pub max_turns: u32,
    pub budget: Budget,
    /// Agents eligible to speak, in stable order.
    pub participants: Vec<String>,
    pub risk_tier: RiskTier,
    pub rationale: Rationale,
    pub finalizer: FinalizerPolicy,
    /// Catalog snapshot version the plan was computed against.
    pub catalog_version: u64,
}

impl DecisionPlan {
    /// Structural invariants from the data model: non-empty participants,
    /// positive turn bound, and referenced names resolving in the catalogs.
    pub fn validate(
        &self,
        known_agents: &BTreeSet<String>,
        known_tools: &BTreeSet<String>,
    ) -> Result<()> {
        if self.max_turns == 0 {
            return Err(AgoraError::PlanInfeasible("max_turns must be >= 1".into()));
        }
        if self.participants.is_empty() {
            return Err(AgoraError::PlanInfeasible("no participants selected".into()));
        }
        for agent in &self.participants {
            if !known_agents.contains(agent) {
                return Err(AgoraError::PlanInfeasible(format!(
                    "participant `{agent}` is not in the agent catalog"
                )));
            }
        }
        for tool in &self.tools_allowed {
            if !known_tools.contains(tool) {
                return Err(AgoraError::PlanInfeasible(format!(
                    "tool `{tool}` is not in the tool catalog"
                )));
            }
        }
        Ok(())
    }
}
