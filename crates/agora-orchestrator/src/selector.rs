// Speaker selector
// Pure scoring over a snapshot of run state: phase fit, topical fit,
// diversity, critic demand and budget fit, with stable tie-breaks.

use std::collections::BTreeSet;

use agora_core::catalog::CatalogSnapshot;
use agora_core::config::SelectorWeights;
use agora_types::{
    AgentTier, AgoraError, DecisionPlan, Message, Result, Role, ScoreBreakdown,
};

/// Discussion phase inferred from turn position and recent context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Intro,
    Analysis,
    Synthesis,
    Critique,
    Closing,
}

/// Why a run stops taking turns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    MaxTurns,
    NoNewInformation,
    FinalizeRequested,
    BudgetHard,
}

/// Read-only snapshot of the state the selector scores against.
pub struct TurnView<'a> {
    pub turn_index: u32,
    pub speaker_history: &'a [String],
    pub messages: &'a [Message],
    pub conflict_recent: bool,
    pub remaining_budget_fraction: f64,
}

/// Marker an agent emits to hand the floor to finalization.
pub const FINALIZE_MARKER: &str = "[FINALIZE]";

pub struct SpeakerSelector {
    weights: SelectorWeights,
    window: usize,
}

impl SpeakerSelector {
    pub fn new(weights: SelectorWeights, window: usize) -> Self {
        Self {
            weights,
            window: window.max(1),
        }
    }

    /// Pick the next speaker among the plan's participants.
    pub fn select(
        &self,
        view: &TurnView<'_>,
        plan: &DecisionPlan,
        catalogs: &CatalogSnapshot,
    ) -> Result<(String, ScoreBreakdown)> {
        let phase = self.phase_for(view, plan);
        let keywords = recent_keywords(view.messages);

        let mut best: Option<(String, ScoreBreakdown, usize)> = None;
        for name in &plan.participants {
            let Some(agent) = catalogs.agent(name) else {
                continue;
            };

            let recent = self.recent_frequency(view.speaker_history, name);
            let phase_match = phase_match(agent.tier, phase);
            let topical_fit = keyword_overlap(&agent.capabilities, &keywords);
            let diversity = 1.0 - recent as f64 / self.window as f64;
            let critic_demand = match (agent.tier, view.conflict_recent) {
                (AgentTier::Critic, true) => 1.0,
                (AgentTier::Critic, false) => 0.3,
                (_, true) => 0.1,
                (_, false) => 0.5,
            };
            let budget_fit = if view.remaining_budget_fraction < 0.3 {
                match agent.tier {
                    AgentTier::Specialist => 0.3,
                    AgentTier::Critic => 0.6,
                    AgentTier::Generalist => 1.0,
                }
            } else {
                1.0
            };

            let scores = ScoreBreakdown {
                phase_match,
                topical_fit,
                diversity: diversity.clamp(0.0, 1.0),
                critic_demand,
                budget_fit,
                total: self.weights.phase_match * phase_match
                    + self.weights.topical_fit * topical_fit
                    + self.weights.diversity * diversity.clamp(0.0, 1.0)
                    + self.weights.critic_demand * critic_demand
                    + self.weights.budget_fit * budget_fit,
            };

            best = match best {
                None => Some((name.clone(), scores, recent)),
                Some((bn, bs, br)) => {
                    let better = scores.total > bs.total + 1e-9
                        || ((scores.total - bs.total).abs() <= 1e-9
                            && (recent < br || (recent == br && name < &bn)));
                    if better {
                        Some((name.clone(), scores, recent))
                    } else {
                        Some((bn, bs, br))
                    }
                }
            };
        }

        best.map(|(name, scores, _)| (name, scores))
            .ok_or_else(|| AgoraError::Internal("no selectable participant".into()))
    }

    /// Check every termination criterion against the current state.
    pub fn should_terminate(
        &self,
        view: &TurnView<'_>,
        plan: &DecisionPlan,
        budget_hard_hit: bool,
    ) -> Option<TerminationReason> {
        if budget_hard_hit {
            return Some(TerminationReason::BudgetHard);
        }
        if view.turn_index >= plan.max_turns {
            return Some(TerminationReason::MaxTurns);
        }
        if view
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::Agent(_)))
            .is_some_and(|m| m.content.contains(FINALIZE_MARKER))
        {
            return Some(TerminationReason::FinalizeRequested);
        }
        if self.no_new_information(view.messages) {
            return Some(TerminationReason::NoNewInformation);
        }
        None
    }

    fn phase_for(&self, view: &TurnView<'_>, plan: &DecisionPlan) -> Phase {
        if view.conflict_recent {
            return Phase::Critique;
        }
        if view.turn_index == 0 {
            return Phase::Intro;
        }
        let last = plan.max_turns.saturating_sub(1);
        if view.turn_index >= last {
            return Phase::Closing;
        }
        if view.turn_index as f64 >= plan.max_turns as f64 * 0.66 {
            return Phase::Synthesis;
        }
        Phase::Analysis
    }

    fn recent_frequency(&self, history: &[String], agent: &str) -> usize {
        history
            .iter()
            .rev()
            .take(self.window)
            .filter(|name| name.as_str() == agent)
            .count()
    }

    /// Two consecutive agent turns contributing ≥95% overlapping text with
    /// their predecessors means the discussion has stalled.
    fn no_new_information(&self, messages: &[Message]) -> bool {
        let agent_texts: Vec<&str> = messages
            .iter()
            .filter(|m| matches!(m.role, Role::Agent(_)))
            .map(|m| m.content.as_str())
            .collect();
        if agent_texts.len() < 3 {
            return false;
        }
        let n = agent_texts.len();
        text_overlap(agent_texts[n - 1], agent_texts[n - 2]) >= 0.95
            && text_overlap(agent_texts[n - 2], agent_texts[n - 3]) >= 0.95
    }
}

fn phase_match(tier: AgentTier, phase: Phase) -> f64 {
    match (tier, phase) {
        (AgentTier::Specialist, Phase::Analysis) => 1.0,
        (AgentTier::Specialist, Phase::Intro) => 0.8,
        (AgentTier::Specialist, Phase::Synthesis) => 0.6,
        (AgentTier::Specialist, Phase::Closing) => 0.4,
        (AgentTier::Specialist, Phase::Critique) => 0.3,
        (AgentTier::Critic, Phase::Critique) => 1.0,
        (AgentTier::Critic, Phase::Synthesis) => 0.7,
        (AgentTier::Critic, Phase::Closing) => 0.6,
        (AgentTier::Critic, Phase::Analysis) => 0.4,
        (AgentTier::Critic, Phase::Intro) => 0.1,
        (AgentTier::Generalist, Phase::Intro) => 1.0,
        (AgentTier::Generalist, Phase::Closing) => 1.0,
        (AgentTier::Generalist, Phase::Synthesis) => 0.8,
        (AgentTier::Generalist, Phase::Analysis) => 0.5,
        (AgentTier::Generalist, Phase::Critique) => 0.3,
    }
}

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "is", "are", "was", "were", "to", "of", "in", "on", "for",
    "with", "our", "we", "it", "this", "that", "what", "how",
];

fn recent_keywords(messages: &[Message]) -> BTreeSet<String> {
    let mut keywords = BTreeSet::new();
    for message in messages.iter().rev().take(3) {
        for word in message.content.to_lowercase().split_whitespace() {
            let cleaned: String = word.chars().filter(|c| c.is_alphanumeric()).collect();
            if cleaned.len() > 2 && !STOPWORDS.contains(&cleaned.as_str()) {
                keywords.insert(cleaned);
            }
        }
    }
    keywords
}

fn keyword_overlap(capabilities: &BTreeSet<String>, keywords: &BTreeSet<String>) -> f64 {
    if capabilities.is_empty() || keywords.is_empty() {
        return 0.0;
    }
    // Capability tags rarely appear verbatim; prefix matching catches
    // "financial" against "finance" style stems.
    let hits = capabilities
        .iter()
        .filter(|cap| {
            keywords
                .iter()
                .any(|kw| kw.starts_with(stem(cap)) || cap.starts_with(stem(kw)))
        })
        .count();
    hits as f64 / capabilities.len() as f64
}

fn stem(word: &str) -> &str {
    match word.char_indices().nth(5) {
        Some((index, _)) => &word[..index],
        None => word,
    }
}

/// Token-set overlap after normalization, in [0, 1].
fn text_overlap(a: &str, b: &str) -> f64 {
    let tokens = |text: &str| -> BTreeSet<String> {
        text.to_lowercase()
            .split_whitespace()
            .map(|w| w.chars().filter(|c| c.is_alphanumeric()).collect::<String>())
            .filter(|w| !w.is_empty())
            .collect()
    };
    let set_a = tokens(a);
    let set_b = tokens(b);
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    intersection as f64 / set_a.len().max(set_b.len()) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::catalog::CatalogRegistry;
    use agora_core::config::EngineConfig;
    use agora_core::guardian::SafetyGuardian;
    use agora_types::Request;

    use crate::decision::DecisionEngine;

    fn plan_for(message: &str) -> (DecisionPlan, std::sync::Arc<CatalogSnapshot>) {
        let registry = CatalogRegistry::with_defaults();
        let snapshot = registry.snapshot();
        let engine = DecisionEngine::new(EngineConfig::default());
        let plan = engine
            .plan(
                &Request::new("acme", "u", message),
                &snapshot,
                &SafetyGuardian::new(),
            )
            .unwrap();
        (plan, snapshot)
    }

    fn selector() -> SpeakerSelector {
        SpeakerSelector::new(SelectorWeights::default(), 3)
    }

    #[test]
    fn conflict_elevates_the_critic() {
        let (plan, snapshot) = plan_for("What is our Q3 revenue?");
        let history = vec!["finance".to_string()];
        let messages = vec![
            Message::user("What is our Q3 revenue?"),
            Message::agent("finance", "Q3 revenue was $1.2m"),
        ];
        let view = TurnView {
            turn_index: 1,
            speaker_history: &history,
            messages: &messages,
            conflict_recent: true,
            remaining_budget_fraction: 0.9,
        };
        let (speaker, scores) = selector().select(&view, &plan, &snapshot).unwrap();
        assert_eq!(speaker, "critic");
        assert!(scores.critic_demand > 0.9);
    }

    #[test]
    fn diversity_rotates_speakers() {
        let (plan, snapshot) = plan_for("What is our Q3 revenue?");
        let history = vec!["finance".to_string(), "finance".to_string(), "finance".to_string()];
        let messages = vec![Message::agent("finance", "numbers numbers numbers")];
        let view = TurnView {
            turn_index: 2,
            speaker_history: &history,
            messages: &messages,
            conflict_recent: false,
            remaining_budget_fraction: 0.9,
        };
        let (speaker, _) = selector().select(&view, &plan, &snapshot).unwrap();
        assert_ne!(speaker, "finance");
    }

    #[test]
    fn termination_on_max_turns() {
        let (plan, _) = plan_for("What is our Q3 revenue?");
        let view = TurnView {
            turn_index: plan.max_turns,
            speaker_history: &[],
            messages: &[],
            conflict_recent: false,
            remaining_budget_fraction: 1.0,
        };
        assert_eq!(
            selector().should_terminate(&view, &plan, false),
            Some(TerminationReason::MaxTurns)
        );
    }

    #[test]
    fn termination_on_budget_hard_hit_wins() {
        let (plan, _) = plan_for("What is our Q3 revenue?");
        let view = TurnView {
            turn_index: 0,
            speaker_history: &[],
            messages: &[],
            conflict_recent: false,
            remaining_budget_fraction: 0.0,
        };
        assert_eq!(
            selector().should_terminate(&view, &plan, true),
            Some(TerminationReason::BudgetHard)
        );
    }

    #[test]
    fn termination_on_repeated_content() {
        let (plan, _) = plan_for("What is our Q3 revenue?");
        let repeated = "Q3 revenue was 1.2m according to the backend figures";
        let messages = vec![
            Message::agent("finance", repeated),
            Message::agent("research", repeated),
            Message::agent("critic", repeated),
        ];
        let view = TurnView {
            turn_index: 2,
            speaker_history: &[],
            messages: &messages,
            conflict_recent: false,
            remaining_budget_fraction: 1.0,
        };
        assert_eq!(
            selector().should_terminate(&view, &plan, false),
            Some(TerminationReason::NoNewInformation)
        );
    }

    #[test]
    fn finalize_marker_ends_the_run() {
        let (plan, _) = plan_for("What is our Q3 revenue?");
        let messages = vec![Message::agent(
            "finance",
            "Revenue confirmed at $1.2m. [FINALIZE]",
        )];
        let view = TurnView {
            turn_index: 1,
            speaker_history: &[],
            messages: &messages,
            conflict_recent: false,
            remaining_budget_fraction: 1.0,
        };
        assert_eq!(
            selector().should_terminate(&view, &plan, false),
            Some(TerminationReason::FinalizeRequested)
        );
    }

    #[test]
    fn overlap_metric_is_symmetric_enough() {
        assert!(text_overlap("a b c d", "a b c d") >= 0.99);
        assert!(text_overlap("a b c d", "e f g h") <= 0.01);
    }
}
