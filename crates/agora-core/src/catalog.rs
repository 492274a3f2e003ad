// Catalog registry
// Versioned, copy-on-reload snapshots of the agent and tool catalogs. Runs
// capture the snapshot they started with; hot reloads only affect new runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use serde_json::json;

use agora_types::{
    AgentSpec, AgentTier, AgoraError, Result, SafetyLevel, SideEffects, ToolCostModel, ToolSpec,
};

/// Immutable view of both catalogs at one version.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    pub version: u64,
    pub agents: BTreeMap<String, AgentSpec>,
    pub tools: BTreeMap<String, ToolSpec>,
}

impl CatalogSnapshot {
    pub fn agent(&self, name: &str) -> Option<&AgentSpec> {
        self.agents.get(name)
    }

    pub fn tool(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    pub fn agent_names(&self) -> BTreeSet<String> {
        self.agents.keys().cloned().collect()
    }

    pub fn tool_names(&self) -> BTreeSet<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn critics(&self) -> impl Iterator<Item = &AgentSpec> {
        self.agents.values().filter(|a| a.is_critic())
    }
}

#[derive(Clone)]
pub struct CatalogRegistry {
    inner: Arc<RwLock<Arc<CatalogSnapshot>>>,
}

impl CatalogRegistry {
    pub fn new(agents: Vec<AgentSpec>, tools: Vec<ToolSpec>) -> Self {
        let snapshot = CatalogSnapshot {
            version: 1,
            agents: agents.into_iter().map(|a| (a.name.clone(), a)).collect(),
            tools: tools.into_iter().map(|t| (t.name.clone(), t)).collect(),
        };
        Self {
            inner: Arc::new(RwLock::new(Arc::new(snapshot))),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(default_agents(), default_tools())
    }

    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.inner.read().expect("catalog poisoned").clone()
    }

    /// Swap in new catalogs. In-flight runs keep their captured snapshot.
    pub fn reload(&self, agents: Vec<AgentSpec>, tools: Vec<ToolSpec>) -> u64 {
        let mut guard = self.inner.write().expect("catalog poisoned");
        let version = guard.version + 1;
        *guard = Arc::new(CatalogSnapshot {
            version,
            agents: agents.into_iter().map(|a| (a.name.clone(), a)).collect(),
            tools: tools.into_iter().map(|t| (t.name.clone(), t)).collect(),
        });
        tracing::info!(version, "catalog reloaded");
        version
    }

    /// Reload from YAML documents (a list of agents and a list of tools).
    pub fn reload_from_yaml(&self, agents_yaml: &str, tools_yaml: &str) -> Result<u64> {
        let agents = parse_agents_yaml(agents_yaml)?;
        let tools = parse_tools_yaml(tools_yaml)?;
        Ok(self.reload(agents, tools))
    }
}

#[derive(Debug, Deserialize)]
struct AgentDoc {
    name: String,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    tools: Vec<String>,
    system_prompt: String,
    tier: AgentTier,
    #[serde(default)]
    version: u32,
}

pub fn parse_agents_yaml(yaml: &str) -> Result<Vec<AgentSpec>> {
    let docs: Vec<AgentDoc> = serde_yaml::from_str(yaml)
        .map_err(|e| AgoraError::Serialization(format!("invalid agent catalog: {e}")))?;
    let mut seen = BTreeSet::new();
    let mut agents = Vec::new();
    for doc in docs {
        if !seen.insert(doc.name.clone()) {
            return Err(AgoraError::InvalidOperation(format!(
                "duplicate agent `{}` in catalog",
                doc.name
            )));
        }
        agents.push(AgentSpec {
            name: doc.name,
            capabilities: doc.capabilities.into_iter().collect(),
            tool_policy: doc.tools.into_iter().collect(),
            system_prompt: doc.system_prompt,
            tier: doc.tier,
            version: doc.version,
        });
    }
    Ok(agents)
}

pub fn parse_tools_yaml(yaml: &str) -> Result<Vec<ToolSpec>> {
    let tools: Vec<ToolSpec> = serde_yaml::from_str(yaml)
        .map_err(|e| AgoraError::Serialization(format!("invalid tool catalog: {e}")))?;
    let mut seen = BTreeSet::new();
    for tool in &tools {
        if !seen.insert(tool.name.clone()) {
            return Err(AgoraError::InvalidOperation(format!(
                "duplicate tool `{}` in catalog",
                tool.name
            )));
        }
    }
    Ok(tools)
}

pub fn default_agents() -> Vec<AgentSpec> {
    vec![
        AgentSpec {
            name: "strategy".to_string(),
            capabilities: ["strategic", "ops"].map(String::from).into(),
            tool_policy: ["web_search"].map(String::from).into(),
            system_prompt: "You are a strategy specialist. Weigh options, state trade-offs, \
and mark conclusions with DECISION: lines."
                .to_string(),
            tier: AgentTier::Specialist,
            version: 1,
        },
        AgentSpec {
            name: "finance".to_string(),
            capabilities: ["financial"].map(String::from).into(),
            tool_policy: ["db_query", "calculator"].map(String::from).into(),
            system_prompt: "You are a finance specialist. Ground every figure in retrieved \
data and mark verified numbers with FACT: lines."
                .to_string(),
            tier: AgentTier::Specialist,
            version: 1,
        },
        AgentSpec {
            name: "technical".to_string(),
            capabilities: ["technical", "research"].map(String::from).into(),
            tool_policy: ["db_query", "web_search"].map(String::from).into(),
            system_prompt: "You are a technical specialist. Be concrete about systems and \
constraints; mark open items with TODO: lines."
                .to_string(),
            tier: AgentTier::Specialist,
            version: 1,
        },
        AgentSpec {
            name: "research".to_string(),
            capabilities: ["research", "creative"].map(String::from).into(),
            tool_policy: ["web_search"].map(String::from).into(),
            system_prompt: "You are a research specialist. Gather evidence before opining \
and cite sources in line."
                .to_string(),
            tier: AgentTier::Specialist,
            version: 1,
        },
        AgentSpec {
            name: "compliance".to_string(),
            capabilities: ["compliance", "ops"].map(String::from).into(),
            tool_policy: ["db_query"].map(String::from).into(),
            system_prompt: "You are a compliance specialist. Flag regulatory exposure and \
mark assumptions with ASSUMPTION: lines."
                .to_string(),
            tier: AgentTier::Specialist,
            version: 1,
        },
        AgentSpec {
            name: "critic".to_string(),
            capabilities: ["critique"].map(String::from).into(),
            tool_policy: BTreeSet::new(),
            system_prompt: "You are the critic. Challenge weak claims, resolve \
contradictions between other agents, and state what evidence is missing."
                .to_string(),
            tier: AgentTier::Critic,
            version: 1,
        },
        AgentSpec {
            name: "synthesizer".to_string(),
            capabilities: ["synthesis"].map(String::from).into(),
            tool_policy: BTreeSet::new(),
            system_prompt: "You produce the final user-facing answer from the discussion \
so far. Be concise and decision-oriented."
                .to_string(),
            tier: AgentTier::Generalist,
            version: 1,
        },
    ]
}

pub fn default_tools() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "calculator".to_string(),
            description: "Evaluate arithmetic expressions".to_string(),
            input_schema: json!({
                "required": ["expression"],
                "properties": {"expression": {"type": "string"}}
            }),
            output_schema: json!({"properties": {"value": {"type": "number"}}}),
            side_effects: SideEffects::Pure,
            cost: ToolCostModel {
                fixed_tokens: 16,
                tokens_per_input_kb: 0,
                usd_micros_per_call: 0,
            },
            safety_level: SafetyLevel::Safe,
        },
        ToolSpec {
            name: "db_query".to_string(),
            description: "Read-only query against the tenant's backend database".to_string(),
            input_schema: json!({
                "required": ["query"],
                "properties": {"query": {"type": "string"}}
            }),
            output_schema: json!({"properties": {"rows": {"type": "array"}}}),
            side_effects: SideEffects::Read,
            cost: ToolCostModel {
                fixed_tokens: 64,
                tokens_per_input_kb: 16,
                usd_micros_per_call: 500,
            },
            safety_level: SafetyLevel::Gated,
        },
        ToolSpec {
            name: "web_search".to_string(),
            description: "Search the public web".to_string(),
            input_schema: json!({
                "required": ["query"],
                "properties": {"query": {"type": "string"}}
            }),
            output_schema: json!({"properties": {"results": {"type": "array"}}}),
            side_effects: SideEffects::Read,
            cost: ToolCostModel {
                fixed_tokens: 128,
                tokens_per_input_kb: 8,
                usd_micros_per_call: 2_000,
            },
            safety_level: SafetyLevel::Safe,
        },
        ToolSpec {
            name: "send_notification".to_string(),
            description: "Send a notification to an external channel".to_string(),
            input_schema: json!({
                "required": ["channel", "body"],
                "properties": {
                    "channel": {"type": "string"},
                    "body": {"type": "string"}
                }
            }),
            output_schema: json!({"properties": {"delivered": {"type": "boolean"}}}),
            side_effects: SideEffects::External,
            cost: ToolCostModel {
                fixed_tokens: 32,
                tokens_per_input_kb: 4,
                usd_micros_per_call: 1_000,
            },
            safety_level: SafetyLevel::HitlRequired,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshots_are_versioned_and_stable() {
        let registry = CatalogRegistry::with_defaults();
        let before = registry.snapshot();
        registry.reload(default_agents(), vec![]);
        let after = registry.snapshot();

        assert_eq!(before.version, 1);
        assert_eq!(after.version, 2);
        // The earlier snapshot is untouched by the reload.
        assert!(!before.tools.is_empty());
        assert!(after.tools.is_empty());
    }

    #[test]
    fn yaml_agents_parse() {
        let yaml = r#"
- name: analyst
  capabilities: [financial, research]
  tools: [db_query]
  system_prompt: "Analyze the numbers."
  tier: specialist
"#;
        let agents = parse_agents_yaml(yaml).unwrap();
        assert_eq!(agents.len(), 1);
        assert!(agents[0].capabilities.contains("financial"));
        assert_eq!(agents[0].tier, AgentTier::Specialist);
    }

    #[test]
    fn duplicate_agent_names_are_rejected() {
        let yaml = r#"
- name: analyst
  system_prompt: "a"
  tier: specialist
- name: analyst
  system_prompt: "b"
  tier: critic
"#;
        assert!(parse_agents_yaml(yaml).is_err());
    }

    #[test]
    fn default_catalog_has_a_critic_and_synthesizer() {
        let registry = CatalogRegistry::with_defaults();
        let snapshot = registry.snapshot();
        assert!(snapshot.critics().next().is_some());
        assert!(snapshot.agent("synthesizer").is_some());
    }
}
