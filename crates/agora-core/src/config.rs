// Engine configuration
// One injected struct, captured per run. No ambient globals.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use agora_types::RiskTier;

/// Weights for the speaker-selection factors. The factor set and ordering
/// are fixed; the numeric defaults are tunables.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SelectorWeights {
    pub phase_match: f64,
    pub topical_fit: f64,
    pub diversity: f64,
    pub critic_demand: f64,
    pub budget_fit: f64,
}

impl Default for SelectorWeights {
    fn default() -> Self {
        Self {
            phase_match: 0.25,
            topical_fit: 0.30,
            diversity: 0.20,
            critic_demand: 0.15,
            budget_fit: 0.10,
        }
    }
}

/// Per-model USD rates used when the provider does not report usage and for
/// decision-engine cost prediction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRate {
    pub model: String,
    pub usd_micros_per_1k_tokens_in: u64,
    pub usd_micros_per_1k_tokens_out: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionConfig {
    /// Seed mixed into lexical scoring; fixed seed + fixed inputs gives
    /// byte-equal plans.
    pub seed: u64,
    /// Maximum number of participants selected for a run.
    pub max_participants: usize,
    /// Model used when predicted cost stays under half the budget.
    pub default_model: String,
    /// Fallback when predicted cost exceeds half the budget.
    pub cheap_model: String,
    pub model_rates: Vec<ModelRate>,
    /// Minimum spend a run needs before planning is considered feasible.
    pub floor_cost_usd_micros: u64,
    /// Budget applied when the request carries no hint.
    pub default_budget_usd_micros: u64,
    pub default_budget_tokens: u64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            max_participants: 4,
            default_model: "std-large".to_string(),
            cheap_model: "std-small".to_string(),
            model_rates: vec![
                ModelRate {
                    model: "std-large".to_string(),
                    usd_micros_per_1k_tokens_in: 3_000,
                    usd_micros_per_1k_tokens_out: 15_000,
                },
                ModelRate {
                    model: "std-small".to_string(),
                    usd_micros_per_1k_tokens_in: 250,
                    usd_micros_per_1k_tokens_out: 1_250,
                },
            ],
            floor_cost_usd_micros: 1_000,
            default_budget_usd_micros: 1_000_000,
            default_budget_tokens: 32_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    pub top_k: usize,
    /// Scores below this are dropped. Providers are expected to normalize
    /// into [0, 1]; out-of-range scores are clamped.
    pub score_threshold: f64,
    /// A chunk already injected this run is re-injected only if its score
    /// improves by at least this much.
    pub rescore_delta: f64,
    pub cache_ttl_secs: u64,
    pub per_turn_max_tokens: u64,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            score_threshold: 0.35,
            rescore_delta: 0.15,
            cache_ttl_secs: 300,
            per_turn_max_tokens: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// Rolling error ratio that also opens the breaker.
    pub error_ratio: f64,
    /// Rolling window the ratio is computed over.
    pub window_secs: u64,
    pub open_cooldown_secs: u64,
    /// Cap for the exponential cooldown growth on repeated re-opens.
    pub max_open_cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            error_ratio: 0.5,
            window_secs: 60,
            open_cooldown_secs: 10,
            max_open_cooldown_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 30,
            refill_per_sec: 5.0,
        }
    }
}

/// Auto-approval rule: approvals whose action matches `action_pattern`
/// (wildcard `*` supported) at or below `max_risk` resolve immediately.
/// Critical-risk approvals always ignore these rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoApproveRule {
    pub action_pattern: String,
    pub max_risk: RiskTier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitlConfig {
    pub default_ttl_secs: u64,
    #[serde(default)]
    pub auto_approve: Vec<AutoApproveRule>,
}

impl Default for HitlConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 15 * 60,
            auto_approve: Vec::new(),
        }
    }
}

/// Nested deadline budget: tool/model < turn < run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Deadlines {
    pub run_secs: u64,
    pub turn_secs: u64,
    pub tool_secs: u64,
    pub model_secs: u64,
}

impl Default for Deadlines {
    fn default() -> Self {
        Self {
            run_secs: 15 * 60,
            turn_secs: 120,
            tool_secs: 30,
            model_secs: 60,
        }
    }
}

/// Runtime toggles. Each run captures a versioned snapshot at start, so a
/// flag flip mid-run never changes behavior of in-flight runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub decision_engine: bool,
    pub rag_per_turn: bool,
    pub conflict_detection: bool,
    pub hitl_enabled: bool,
    pub strict_breaker: bool,
    /// When set, token deltas are emitted per streamed batch instead of
    /// once per model call.
    pub verbose_streaming: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            decision_engine: true,
            rag_per_turn: true,
            conflict_detection: true,
            hitl_enabled: true,
            strict_breaker: false,
            verbose_streaming: true,
        }
    }
}

impl FeatureFlags {
    /// Apply per-request overrides by flag name; unknown names are ignored.
    pub fn with_overrides(
        mut self,
        overrides: &std::collections::HashMap<String, bool>,
    ) -> Self {
        for (name, value) in overrides {
            match name.as_str() {
                "decision_engine" => self.decision_engine = *value,
                "rag_per_turn" => self.rag_per_turn = *value,
                "conflict_detection" => self.conflict_detection = *value,
                "hitl_enabled" => self.hitl_enabled = *value,
                "strict_breaker" => self.strict_breaker = *value,
                "verbose_streaming" => self.verbose_streaming = *value,
                other => tracing::debug!("ignoring unknown flag override `{other}`"),
            }
        }
        self
    }
}

/// Immutable flag snapshot handed to a run.
#[derive(Debug, Clone)]
pub struct FlagSnapshot {
    pub version: u64,
    pub flags: FeatureFlags,
}

/// Process-wide flag store with copy-on-update snapshots.
#[derive(Clone)]
pub struct FlagStore {
    inner: Arc<RwLock<FlagSnapshot>>,
}

impl FlagStore {
    pub fn new(flags: FeatureFlags) -> Self {
        Self {
            inner: Arc::new(RwLock::new(FlagSnapshot { version: 1, flags })),
        }
    }

    pub fn snapshot(&self) -> FlagSnapshot {
        self.inner.read().expect("flag store poisoned").clone()
    }

    pub fn update(&self, mutate: impl FnOnce(&mut FeatureFlags)) -> u64 {
        let mut guard = self.inner.write().expect("flag store poisoned");
        mutate(&mut guard.flags);
        guard.version += 1;
        guard.version
    }
}

impl Default for FlagStore {
    fn default() -> Self {
        Self::new(FeatureFlags::default())
    }
}

/// Configuration for the whole engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Cap on concurrently active runs; starts beyond it fail `QueueFull`.
    pub max_concurrent_runs: usize,
    pub per_turn_max_tokens: u64,
    pub max_tool_calls_per_turn: u32,
    /// Scratchpad compression threshold in estimated tokens.
    pub scratchpad_max_tokens: u64,
    /// Relative tolerance for numeric-claim conflicts.
    pub conflict_epsilon: f64,
    /// Speaker-diversity window in turns.
    pub selector_window: usize,
    pub selector_weights: SelectorWeights,
    pub decision: DecisionConfig,
    pub rag: RagConfig,
    pub breaker: BreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub hitl: HitlConfig,
    pub deadlines: Deadlines,
    #[serde(default)]
    pub flags: FeatureFlags,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 32,
            per_turn_max_tokens: 1024,
            max_tool_calls_per_turn: 3,
            scratchpad_max_tokens: 2048,
            conflict_epsilon: 0.05,
            selector_window: 3,
            selector_weights: SelectorWeights::default(),
            decision: DecisionConfig::default(),
            rag: RagConfig::default(),
            breaker: BreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            hitl: HitlConfig::default(),
            deadlines: Deadlines::default(),
            flags: FeatureFlags::default(),
        }
    }
}

impl EngineConfig {
    pub fn rate_for(&self, model: &str) -> Option<&ModelRate> {
        self.decision.model_rates.iter().find(|r| r.model == model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_store_versions_snapshots() {
        let store = FlagStore::default();
        let first = store.snapshot();
        store.update(|flags| flags.rag_per_turn = false);
        let second = store.snapshot();

        assert!(first.flags.rag_per_turn);
        assert!(!second.flags.rag_per_turn);
        assert!(second.version > first.version);
    }

    #[test]
    fn request_overrides_only_touch_known_flags() {
        let mut overrides = std::collections::HashMap::new();
        overrides.insert("hitl_enabled".to_string(), false);
        overrides.insert("bogus".to_string(), true);
        let flags = FeatureFlags::default().with_overrides(&overrides);
        assert!(!flags.hitl_enabled);
        assert!(flags.conflict_detection);
    }
}
