// Decision engine
// Pure request -> plan scoring. No side effects, no model calls; fixed
// inputs plus a fixed seed produce byte-equal plans.

use std::collections::{BTreeMap, BTreeSet};

use agora_core::catalog::CatalogSnapshot;
use agora_core::config::EngineConfig;
use agora_core::guardian::SafetyGuardian;
use agora_types::{
    AgentTier, AgoraError, Budget, DecisionPlan, FinalizerPolicy, ModelKnobs, Rationale,
    RationaleReason, Request, Result, RiskTier, SafetyLevel, SourceKind, UsdMicros,
};

const INTENT_LEXICON: &[(&str, &[&str])] = &[
    (
        "strategic",
        &[
            "strategy", "roadmap", "vision", "market", "competitor", "expansion", "growth",
            "positioning",
        ],
    ),
    (
        "financial",
        &[
            "revenue", "cost", "budget", "profit", "margin", "forecast", "cash", "earnings",
            "pricing", "q1", "q2", "q3", "q4",
        ],
    ),
    (
        "technical",
        &[
            "architecture", "system", "code", "api", "deploy", "bug", "latency", "database",
            "infrastructure", "performance",
        ],
    ),
    (
        "creative",
        &["design", "brand", "copy", "campaign", "creative", "story", "naming"],
    ),
    (
        "research",
        &[
            "research", "compare", "investigate", "analyze", "evidence", "study", "sources",
            "summarize",
        ],
    ),
    (
        "ops",
        &[
            "process", "operations", "workflow", "schedule", "staffing", "logistics", "incident",
            "oncall",
        ],
    ),
    (
        "compliance",
        &["compliance", "regulation", "legal", "policy", "audit", "gdpr", "hipaa"],
    ),
];

const RECENCY_WORDS: &[&str] = &["latest", "today", "current", "now", "recent", "news"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Complexity {
    Simple,
    Standard,
    Complex,
}

impl Complexity {
    fn turns(&self) -> u32 {
        match self {
            Complexity::Simple => 3,
            Complexity::Standard => 6,
            Complexity::Complex => 10,
        }
    }
}

pub struct DecisionEngine {
    config: EngineConfig,
}

impl DecisionEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Produce the plan for a request against one catalog snapshot.
    pub fn plan(
        &self,
        request: &Request,
        catalogs: &CatalogSnapshot,
        guardian: &SafetyGuardian,
    ) -> Result<DecisionPlan> {
        let text = normalized_text(request);
        let intent_scores = self.score_intents(&text);
        let (intents, ambiguous) = pick_intents(&intent_scores);

        let budget = self.budget_for(request)?;
        if budget.max_usd.0 < self.config.decision.floor_cost_usd_micros {
            return Err(AgoraError::PlanInfeasible(format!(
                "budget {} is below the {} floor",
                budget.max_usd,
                UsdMicros(self.config.decision.floor_cost_usd_micros)
            )));
        }

        // Risk derivation starts from intents and the guardian pre-scan;
        // tool policies can only promote it further below.
        let signals = guardian.pre_scan(&request.message);
        let mut risk = if intents.contains(&"compliance".to_string())
            || intents.contains(&"financial".to_string())
        {
            RiskTier::Medium
        } else {
            RiskTier::Low
        };
        if signals.pii_detected || signals.injection_detected {
            risk = risk.promoted();
        }
        if ambiguous {
            risk = risk.promoted();
        }

        let complexity = classify_complexity(request, &intents);
        let turn_cap = (budget.max_tokens / budget.per_turn_max_tokens.max(1)).max(1) as u32;
        let max_turns = complexity.turns().min(turn_cap).max(1);

        let participants = self.select_participants(&intents, catalogs)?;

        // Tools admissible this run: union of participant policies that
        // resolve in the catalog.
        let mut tools_allowed: BTreeSet<String> = BTreeSet::new();
        for name in &participants {
            if let Some(agent) = catalogs.agent(name) {
                for tool in &agent.tool_policy {
                    if catalogs.tool(tool).is_some() {
                        tools_allowed.insert(tool.clone());
                    }
                }
            }
        }
        let needs_hitl = tools_allowed
            .iter()
            .filter_map(|name| catalogs.tool(name))
            .any(|tool| tool.safety_level == SafetyLevel::HitlRequired);
        if needs_hitl && risk < RiskTier::High {
            risk = RiskTier::High;
        }

        // A critic joins whenever the run carries real risk.
        let participants = self.ensure_critic(participants, catalogs, risk);

        let sources = self.rank_sources(&intents, &text);
        let (model, knobs) = self.choose_model(&budget, max_turns);

        let rationale = build_rationale(&intent_scores, &intents, &sources, ambiguous);

        let finalizer = match catalogs.agent("synthesizer") {
            Some(agent) if agent.tier != AgentTier::Critic => FinalizerPolicy::Synthesizer {
                agent: agent.name.clone(),
            },
            _ => FinalizerPolicy::InternalReducer,
        };

        let plan = DecisionPlan {
            sources,
            tools_allowed,
            model,
            knobs,
            max_turns,
            budget,
            participants,
            risk_tier: risk,
            rationale,
            finalizer,
            catalog_version: catalogs.version,
        };
        plan.validate(&catalogs.agent_names(), &catalogs.tool_names())?;
        Ok(plan)
    }

    /// Minimal plan used when the decision engine flag is off: one
    /// generalist, no tools, no retrieval beyond the model.
    pub fn fallback_plan(&self, request: &Request, catalogs: &CatalogSnapshot) -> Result<DecisionPlan> {
        let budget = self.budget_for(request)?;
        let agent = catalogs
            .agents
            .values()
            .find(|a| a.tier == AgentTier::Generalist)
            .or_else(|| catalogs.agents.values().next())
            .ok_or_else(|| AgoraError::PlanInfeasible("agent catalog is empty".into()))?;
        Ok(DecisionPlan {
            sources: vec![SourceKind::LlmOnly],
            tools_allowed: BTreeSet::new(),
            model: self.config.decision.cheap_model.clone(),
            knobs: ModelKnobs {
                temperature: 0.3,
                max_tokens_per_turn: budget.per_turn_max_tokens,
            },
            max_turns: 1,
            budget,
            participants: vec![agent.name.clone()],
            risk_tier: RiskTier::Low,
            rationale: Rationale {
                reasons: vec![RationaleReason {
                    tag: "decision_engine_disabled".into(),
                    contribution: 1.0,
                }],
                confidence: 1.0,
            },
            finalizer: FinalizerPolicy::InternalReducer,
            catalog_version: catalogs.version,
        })
    }

    fn budget_for(&self, request: &Request) -> Result<Budget> {
        let decision = &self.config.decision;
        let hint = request.budget_hint.as_ref();
        let budget = Budget::new(
            UsdMicros(
                hint.and_then(|h| h.max_usd_micros)
                    .unwrap_or(decision.default_budget_usd_micros),
            ),
            hint.and_then(|h| h.max_tokens)
                .unwrap_or(decision.default_budget_tokens),
            hint.and_then(|h| h.per_turn_max_tokens)
                .unwrap_or(self.config.per_turn_max_tokens),
        );
        if budget.per_turn_max_tokens == 0 || budget.max_tokens == 0 {
            return Err(AgoraError::PlanInfeasible("token budget is zero".into()));
        }
        Ok(budget)
    }

    fn score_intents(&self, text: &str) -> BTreeMap<String, f64> {
        let words: Vec<&str> = text.split_whitespace().collect();
        let mut scores = BTreeMap::new();
        for (tag, keywords) in INTENT_LEXICON {
            let hits = words
                .iter()
                .filter(|w| keywords.contains(&w.trim_matches(|c: char| !c.is_alphanumeric())))
                .count();
            if hits > 0 {
                // The seed perturbs ties only; it never reorders real
                // score differences.
                let jitter = (mix(self.config.decision.seed, tag) % 1_000) as f64 * 1e-9;
                scores.insert(tag.to_string(), hits as f64 + jitter);
            }
        }
        scores
    }

    fn select_participants(
        &self,
        intents: &[String],
        catalogs: &CatalogSnapshot,
    ) -> Result<Vec<String>> {
        let wanted: BTreeSet<&str> = intents.iter().map(String::as_str).collect();
        let mut covered: BTreeSet<String> = BTreeSet::new();
        let mut selected: Vec<String> = Vec::new();

        // Greedy max-coverage with minimum overlap; BTreeMap iteration keeps
        // the walk deterministic.
        loop {
            let mut best: Option<(usize, usize, &str)> = None;
            for agent in catalogs.agents.values() {
                if selected.iter().any(|s| s == &agent.name) || agent.is_critic() {
                    continue;
                }
                let new_cover = agent
                    .capabilities
                    .iter()
                    .filter(|c| wanted.contains(c.as_str()) && !covered.contains(*c))
                    .count();
                let overlap = agent
                    .capabilities
                    .iter()
                    .filter(|c| covered.contains(*c))
                    .count();
                if new_cover == 0 {
                    continue;
                }
                let candidate = (new_cover, overlap, agent.name.as_str());
                best = match best {
                    None => Some(candidate),
                    Some(current) => {
                        // More coverage wins; then less overlap; then name.
                        let (cc, co, cn) = current;
                        if new_cover > cc
                            || (new_cover == cc && overlap < co)
                            || (new_cover == cc && overlap == co && agent.name.as_str() < cn)
                        {
                            Some(candidate)
                        } else {
                            Some(current)
                        }
                    }
                };
            }
            let Some((_, _, name)) = best else { break };
            let agent = catalogs.agent(name).expect("candidate from catalog");
            for capability in &agent.capabilities {
                covered.insert(capability.clone());
            }
            selected.push(name.to_string());
            if selected.len() >= self.config.decision.max_participants
                || wanted.iter().all(|w| covered.contains(*w))
            {
                break;
            }
        }

        if selected.is_empty() {
            return Err(AgoraError::PlanInfeasible(format!(
                "no agent covers any of the required capabilities {intents:?}"
            )));
        }
        Ok(selected)
    }

    fn ensure_critic(
        &self,
        mut participants: Vec<String>,
        catalogs: &CatalogSnapshot,
        risk: RiskTier,
    ) -> Vec<String> {
        if risk >= RiskTier::Medium
            && !participants
                .iter()
                .any(|name| catalogs.agent(name).is_some_and(|a| a.is_critic()))
        {
            if let Some(critic) = catalogs.critics().next() {
                if participants.len() >= self.config.decision.max_participants {
                    participants.pop();
                }
                participants.push(critic.name.clone());
            }
        }
        participants
    }

    fn rank_sources(&self, intents: &[String], text: &str) -> Vec<SourceKind> {
        let has = |tag: &str| intents.iter().any(|i| i == tag);
        let specificity = text.chars().any(|c| c.is_ascii_digit()) || text.contains(" our ");
        let recency = RECENCY_WORDS.iter().any(|w| text.contains(w));

        let mut scored: Vec<(SourceKind, f64, f64)> = SourceKind::ALL
            .iter()
            .map(|source| {
                let (utility, cost) = match source {
                    SourceKind::BackendDb => {
                        let mut utility = if has("financial") || has("ops") { 0.9 } else { 0.2 };
                        if specificity {
                            utility += 0.2;
                        }
                        (utility, 0.2)
                    }
                    SourceKind::Vector => {
                        let utility = if has("research") || has("technical") || has("strategic") {
                            0.7
                        } else {
                            0.3
                        };
                        (utility, 0.1)
                    }
                    SourceKind::Web => {
                        let mut utility = if recency { 0.8 } else { 0.1 };
                        if has("research") {
                            utility += 0.15;
                        }
                        (utility, 0.3)
                    }
                    SourceKind::LlmOnly => (0.15, 0.0),
                };
                (*source, utility - cost, cost)
            })
            .collect();

        scored.retain(|(_, score, _)| *score > 0.0);
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal))
                .then(a.0.cmp(&b.0))
        });
        scored.into_iter().map(|(source, _, _)| source).collect()
    }

    fn choose_model(&self, budget: &Budget, max_turns: u32) -> (String, ModelKnobs) {
        let decision = &self.config.decision;
        let predicted_tokens = max_turns as u64 * budget.per_turn_max_tokens;
        let default_rate = self.config.rate_for(&decision.default_model);
        let predicted_cost = default_rate
            .map(|rate| {
                let per_1k =
                    (rate.usd_micros_per_1k_tokens_in + rate.usd_micros_per_1k_tokens_out) / 2;
                UsdMicros(predicted_tokens * per_1k / 1_000)
            })
            .unwrap_or(UsdMicros::ZERO);

        // Prefer the cheaper model when the prediction eats more than half
        // the budget.
        let model = if predicted_cost.0 * 2 > budget.max_usd.0 {
            decision.cheap_model.clone()
        } else {
            decision.default_model.clone()
        };
        (
            model,
            ModelKnobs {
                temperature: 0.3,
                max_tokens_per_turn: budget.per_turn_max_tokens,
            },
        )
    }
}

fn normalized_text(request: &Request) -> String {
    let mut text = request.message.to_lowercase();
    for message in request.history.iter().rev().take(4) {
        text.push(' ');
        text.push_str(&message.content.to_lowercase());
    }
    text
}

fn pick_intents(scores: &BTreeMap<String, f64>) -> (Vec<String>, bool) {
    if scores.is_empty() {
        return (vec!["research".to_string()], true);
    }
    let max = scores.values().cloned().fold(0.0_f64, f64::max);
    let mut intents: Vec<(String, f64)> = scores
        .iter()
        .filter(|(_, score)| **score >= max * 0.5)
        .map(|(tag, score)| (tag.clone(), *score))
        .collect();
    intents.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    let intents: Vec<String> = intents.into_iter().take(3).map(|(tag, _)| tag).collect();
    (intents, false)
}

fn classify_complexity(request: &Request, intents: &[String]) -> Complexity {
    let words = request.message.split_whitespace().count();
    if words > 30 || intents.len() >= 3 || request.history.len() > 12 {
        Complexity::Complex
    } else if words <= 12 && intents.len() <= 1 {
        Complexity::Simple
    } else {
        Complexity::Standard
    }
}

fn build_rationale(
    scores: &BTreeMap<String, f64>,
    intents: &[String],
    sources: &[SourceKind],
    ambiguous: bool,
) -> Rationale {
    let confidence = if ambiguous {
        0.4
    } else if intents.len() == 1 {
        0.9
    } else {
        0.75
    };

    let mut reasons: Vec<RationaleReason> = Vec::new();
    for intent in intents.iter().take(2) {
        reasons.push(RationaleReason {
            tag: format!("intent:{intent}"),
            contribution: scores.get(intent).copied().unwrap_or(0.0),
        });
    }
    if let Some(source) = sources.first() {
        reasons.push(RationaleReason {
            tag: format!("source:{source:?}").to_lowercase(),
            contribution: 1.0,
        });
    }
    if ambiguous {
        reasons.push(RationaleReason {
            tag: "ambiguous_intent".to_string(),
            contribution: 1.0,
        });
    }
    reasons.truncate(3);

    // Contributions are normalized so the top reasons sum to confidence.
    let total: f64 = reasons.iter().map(|r| r.contribution).sum();
    if total > 0.0 {
        for reason in &mut reasons {
            reason.contribution = reason.contribution / total * confidence;
        }
    }
    Rationale {
        reasons,
        confidence,
    }
}

/// Cheap deterministic string mixer for seeded tie-breaks.
fn mix(seed: u64, text: &str) -> u64 {
    let mut hash = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(0x51_7C_C1B7);
    for byte in text.bytes() {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(0x100_0000_01B3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::catalog::CatalogRegistry;
    use agora_types::BudgetHint;

    fn engine() -> DecisionEngine {
        DecisionEngine::new(EngineConfig::default())
    }

    fn request(message: &str) -> Request {
        Request::new("acme", "user-1", message)
    }

    #[test]
    fn factual_finance_request_plans_backend_first() {
        let catalogs = CatalogRegistry::with_defaults();
        let snapshot = catalogs.snapshot();
        let request = request("What is our Q3 revenue?").with_budget_hint(BudgetHint {
            max_usd_micros: Some(200_000),
            max_tokens: Some(8_000),
            per_turn_max_tokens: Some(1_000),
        });

        let plan = engine()
            .plan(&request, &snapshot, &SafetyGuardian::new())
            .unwrap();

        assert_eq!(
            plan.sources,
            vec![SourceKind::BackendDb, SourceKind::Vector, SourceKind::LlmOnly]
        );
        assert!(plan.participants.contains(&"finance".to_string()));
        assert!(plan
            .participants
            .iter()
            .any(|p| snapshot.agent(p).is_some_and(|a| a.is_critic())));
        assert_eq!(plan.max_turns, 3);
        assert!(plan.budget.max_usd <= UsdMicros(200_000));
    }

    #[test]
    fn plans_are_deterministic_for_fixed_seed() {
        let catalogs = CatalogRegistry::with_defaults();
        let snapshot = catalogs.snapshot();
        let guardian = SafetyGuardian::new();
        let mut request = request("Compare our deployment architecture options");
        request.run_id = "fixed".into();

        let a = engine().plan(&request, &snapshot, &guardian).unwrap();
        let b = engine().plan(&request, &snapshot, &guardian).unwrap();
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn hitl_tool_promotes_risk_to_high() {
        // The default strategy agent has no HITL tool; grant it one so the
        // plan must promote.
        let mut agents = agora_core::catalog::default_agents();
        for agent in &mut agents {
            if agent.name == "strategy" {
                agent.tool_policy.insert("send_notification".to_string());
            }
        }
        let registry = CatalogRegistry::new(agents, agora_core::catalog::default_tools());
        let targeted = registry.snapshot();

        let plan = engine()
            .plan(
                &request("Plan our market expansion strategy"),
                &targeted,
                &SafetyGuardian::new(),
            )
            .unwrap();
        assert!(plan.risk_tier >= RiskTier::High);
    }

    #[test]
    fn empty_catalog_is_infeasible() {
        let registry = CatalogRegistry::new(vec![], vec![]);
        let err = engine()
            .plan(
                &request("What is our Q3 revenue?"),
                &registry.snapshot(),
                &SafetyGuardian::new(),
            )
            .unwrap_err();
        assert!(matches!(err, AgoraError::PlanInfeasible(_)));
    }

    #[test]
    fn tiny_budget_is_infeasible() {
        let catalogs = CatalogRegistry::with_defaults();
        let request = request("revenue forecast").with_budget_hint(BudgetHint {
            max_usd_micros: Some(10),
            max_tokens: Some(1_000),
            per_turn_max_tokens: Some(500),
        });
        let err = engine()
            .plan(&request, &catalogs.snapshot(), &SafetyGuardian::new())
            .unwrap_err();
        assert!(matches!(err, AgoraError::PlanInfeasible(_)));
    }

    #[test]
    fn ambiguous_request_lowers_confidence_and_raises_risk() {
        let catalogs = CatalogRegistry::with_defaults();
        let plan = engine()
            .plan(
                &request("hmm, thoughts?"),
                &catalogs.snapshot(),
                &SafetyGuardian::new(),
            )
            .unwrap();
        assert!(plan.rationale.confidence < 0.5);
        assert!(plan.risk_tier >= RiskTier::Medium);
    }

    #[test]
    fn rationale_contributions_sum_to_confidence() {
        let catalogs = CatalogRegistry::with_defaults();
        let plan = engine()
            .plan(
                &request("What is our Q3 revenue?"),
                &catalogs.snapshot(),
                &SafetyGuardian::new(),
            )
            .unwrap();
        let total: f64 = plan.rationale.reasons.iter().map(|r| r.contribution).sum();
        assert!((total - plan.rationale.confidence).abs() < 1e-9);
        assert!(plan.rationale.reasons.len() <= 3);
    }

    #[test]
    fn fallback_plan_uses_one_generalist() {
        let catalogs = CatalogRegistry::with_defaults();
        let plan = engine()
            .fallback_plan(&request("anything"), &catalogs.snapshot())
            .unwrap();
        assert_eq!(plan.max_turns, 1);
        assert_eq!(plan.participants.len(), 1);
        assert!(plan.tools_allowed.is_empty());
    }

    #[test]
    fn turn_count_is_capped_by_token_budget() {
        let catalogs = CatalogRegistry::with_defaults();
        let request = request(
            "Compare the market strategy, regulatory compliance exposure and system architecture \
implications of expanding our deployment footprint into three new regions next year",
        )
        .with_budget_hint(BudgetHint {
            max_usd_micros: Some(5_000_000),
            max_tokens: Some(4_000),
            per_turn_max_tokens: Some(1_000),
        });
        let plan = engine()
            .plan(&request, &catalogs.snapshot(), &SafetyGuardian::new())
            .unwrap();
        assert_eq!(plan.max_turns, 4);
    }
}
