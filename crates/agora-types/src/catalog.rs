// Agent and tool catalog entries
// Agents are data (prompt, capabilities, policies), not behavior trees.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plan::UsdMicros;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentTier {
    Generalist,
    Specialist,
    Critic,
}

/// A registered agent. Loaded from a catalog at startup; hot reloads swap a
/// versioned snapshot, so in-flight runs keep the definitions they started
/// with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    /// Capability tags matched against request intents (e.g. `financial`).
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Tools this agent may request; intersected with the plan's allowlist.
    #[serde(default)]
    pub tool_policy: BTreeSet<String>,
    pub system_prompt: String,
    pub tier: AgentTier,
    #[serde(default)]
    pub version: u32,
}

impl AgentSpec {
    pub fn is_critic(&self) -> bool {
        self.tier == AgentTier::Critic
    }
}

/// Externally observable effect class of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffects {
    Pure,
    Read,
    Write,
    External,
}

impl SideEffects {
    /// Only effect-free invocations are safe to retry automatically.
    pub fn retryable(&self) -> bool {
        matches!(self, SideEffects::Pure | SideEffects::Read)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyLevel {
    Safe,
    Gated,
    HitlRequired,
}

/// Deterministic cost model for a tool invocation. The estimate scales with
/// input size so the preflight check is conservative for large payloads.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ToolCostModel {
    pub fixed_tokens: u64,
    pub tokens_per_input_kb: u64,
    pub usd_micros_per_call: u64,
}

impl ToolCostModel {
    pub fn estimate(&self, input: &Value) -> (u64, UsdMicros) {
        let input_kb = (input.to_string().len() as u64).div_ceil(1024);
        let tokens = self.fixed_tokens + self.tokens_per_input_kb * input_kb;
        (tokens, UsdMicros(self.usd_micros_per_call))
    }

    pub fn is_free(&self) -> bool {
        self.usd_micros_per_call == 0
    }
}

/// A registered tool. Execution is provided separately by a handler; the
/// spec here is what plans, guards and events reason about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// Minimal JSON schema: `required` field list plus `properties` types.
    #[serde(default)]
    pub input_schema: Value,
    #[serde(default)]
    pub output_schema: Value,
    pub side_effects: SideEffects,
    #[serde(default)]
    pub cost: ToolCostModel,
    pub safety_level: SafetyLevel,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cost_model_scales_with_input() {
        let model = ToolCostModel {
            fixed_tokens: 100,
            tokens_per_input_kb: 50,
            usd_micros_per_call: 2_000,
        };
        let (tokens, usd) = model.estimate(&json!({"q": "x".repeat(2048)}));
        assert!(tokens >= 200);
        assert_eq!(usd, UsdMicros(2_000));
    }

    #[test]
    fn only_effect_free_tools_retry() {
        assert!(SideEffects::Pure.retryable());
        assert!(SideEffects::Read.retryable());
        assert!(!SideEffects::Write.retryable());
        assert!(!SideEffects::External.retryable());
    }
}
