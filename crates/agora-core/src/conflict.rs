// Conflict detector
// Compares each new agent message against recent claims from other agents:
// numeric disagreement beyond a tolerance, opposing polarity on the same
// subject, and contradictory recommendations.

use std::collections::HashMap;

use regex::Regex;

use agora_types::{ConflictKind, Message, Role};

#[derive(Debug, Clone)]
pub struct ConflictFinding {
    pub agents: Vec<String>,
    pub kind: ConflictKind,
    pub excerpt: String,
}

/// One numeric claim: a normalized subject phrase and its value.
#[derive(Debug, Clone, PartialEq)]
struct NumericClaim {
    subject: String,
    value: f64,
    excerpt: String,
}

pub struct ConflictDetector {
    epsilon: f64,
    numeric_claim: Regex,
    negation: Regex,
    recommend_for: Regex,
    recommend_against: Regex,
}

impl ConflictDetector {
    pub fn new(epsilon: f64) -> Self {
        Self {
            epsilon,
            // "<subject words> is/was/at/equals/= <number>[unit]"
            numeric_claim: Regex::new(
                r"(?i)([a-z][a-z0-9 %/_-]{2,40}?)\s+(?:is|was|at|equals|=|:)\s*\$?(-?\d+(?:[.,]\d+)?)\s*(%|k|m|b|million|billion)?",
            )
            .expect("static regex"),
            negation: Regex::new(r"(?i)\b(is not|isn't|was not|wasn't|will not|won't|cannot|can't|should not|shouldn't)\b")
                .expect("static regex"),
            recommend_for: Regex::new(r"(?i)\b(recommend|suggest|advise|propose)\b\s+(?:we\s+|to\s+)?([a-z][a-z0-9 _-]{2,40})")
                .expect("static regex"),
            recommend_against: Regex::new(r"(?i)\b(?:recommend|suggest|advise)\s+against\s+([a-z][a-z0-9 _-]{2,40})|\bdo not\s+(?:recommend|suggest)\s+([a-z][a-z0-9 _-]{2,40})")
                .expect("static regex"),
        }
    }

    /// Inspect a freshly appended agent message against earlier messages
    /// from other agents. Returns the first contradiction found.
    pub fn inspect(
        &self,
        author: &str,
        content: &str,
        recent: &[Message],
    ) -> Option<ConflictFinding> {
        let new_claims = self.numeric_claims(content);
        let new_negated = self.negated_subjects(content);
        let new_against = self.recommendations_against(content);
        let new_for = self.recommendations_for(content);

        for message in recent.iter().rev() {
            let Role::Agent(other) = &message.role else {
                continue;
            };
            if other == author {
                continue;
            }

            // Numeric disagreement on the same subject.
            for prior in self.numeric_claims(&message.content) {
                for claim in &new_claims {
                    if claim.subject == prior.subject
                        && !self.within_tolerance(claim.value, prior.value)
                    {
                        return Some(ConflictFinding {
                            agents: vec![other.clone(), author.to_string()],
                            kind: ConflictKind::NumericDisagreement,
                            excerpt: format!("{} vs {}", prior.excerpt, claim.excerpt),
                        });
                    }
                }
            }

            // Opposing polarity: one asserts, the other negates the subject.
            let prior_negated = self.negated_subjects(&message.content);
            for subject in &new_negated {
                if self.asserts_subject(&message.content, subject) {
                    return Some(ConflictFinding {
                        agents: vec![other.clone(), author.to_string()],
                        kind: ConflictKind::OpposingPolarity,
                        excerpt: subject.clone(),
                    });
                }
            }
            for subject in &prior_negated {
                if self.asserts_subject(content, subject) {
                    return Some(ConflictFinding {
                        agents: vec![other.clone(), author.to_string()],
                        kind: ConflictKind::OpposingPolarity,
                        excerpt: subject.clone(),
                    });
                }
            }

            // Contradictory recommendations.
            let prior_for = self.recommendations_for(&message.content);
            let prior_against = self.recommendations_against(&message.content);
            if let Some(subject) = overlap(&new_against, &prior_for) {
                return Some(ConflictFinding {
                    agents: vec![other.clone(), author.to_string()],
                    kind: ConflictKind::ContradictoryRecommendation,
                    excerpt: subject,
                });
            }
            if let Some(subject) = overlap(&prior_against, &new_for) {
                return Some(ConflictFinding {
                    agents: vec![other.clone(), author.to_string()],
                    kind: ConflictKind::ContradictoryRecommendation,
                    excerpt: subject,
                });
            }
        }
        None
    }

    fn within_tolerance(&self, a: f64, b: f64) -> bool {
        let scale = a.abs().max(b.abs()).max(f64::EPSILON);
        ((a - b).abs() / scale) <= self.epsilon
    }

    fn numeric_claims(&self, text: &str) -> Vec<NumericClaim> {
        let mut claims = Vec::new();
        let mut seen: HashMap<String, ()> = HashMap::new();
        for captures in self.numeric_claim.captures_iter(text) {
            let subject = normalize_subject(&captures[1]);
            if subject.is_empty() || seen.contains_key(&subject) {
                continue;
            }
            let raw = captures[2].replace(',', ".");
            let Ok(mut value) = raw.parse::<f64>() else {
                continue;
            };
            match captures.get(3).map(|m| m.as_str().to_lowercase()) {
                Some(unit) if unit == "k" => value *= 1e3,
                Some(unit) if unit == "m" || unit == "million" => value *= 1e6,
                Some(unit) if unit == "b" || unit == "billion" => value *= 1e9,
                _ => {}
            }
            seen.insert(subject.clone(), ());
            claims.push(NumericClaim {
                subject,
                value,
                excerpt: captures[0].trim().to_string(),
            });
        }
        claims
    }

    fn negated_subjects(&self, text: &str) -> Vec<String> {
        let mut subjects = Vec::new();
        for m in self.negation.find_iter(text) {
            let before = &text[..m.start()];
            let subject = normalize_subject(last_phrase(before));
            if !subject.is_empty() {
                subjects.push(subject);
            }
        }
        subjects
    }

    fn asserts_subject(&self, text: &str, subject: &str) -> bool {
        let lowered = text.to_lowercase();
        if !lowered.contains(subject) {
            return false;
        }
        // The same subject appearing only in negated form is not an
        // assertion.
        for m in self.negation.find_iter(&lowered) {
            let before = normalize_subject(last_phrase(&lowered[..m.start()]));
            if before == subject {
                return false;
            }
        }
        true
    }

    fn recommendations_for(&self, text: &str) -> Vec<String> {
        // Strip "against" phrases first so they do not match the positive
        // pattern.
        let cleaned = self.recommend_against.replace_all(text, " ");
        self.recommend_for
            .captures_iter(&cleaned)
            .map(|c| normalize_subject(&c[2]))
            .filter(|s| !s.is_empty() && s != "against")
            .collect()
    }

    fn recommendations_against(&self, text: &str) -> Vec<String> {
        self.recommend_against
            .captures_iter(text)
            .filter_map(|c| c.get(1).or_else(|| c.get(2)))
            .map(|m| normalize_subject(m.as_str()))
            .filter(|s| !s.is_empty())
            .collect()
    }
}

fn overlap(a: &[String], b: &[String]) -> Option<String> {
    a.iter().find(|s| b.contains(s)).cloned()
}

fn last_phrase(text: &str) -> &str {
    let trimmed = text.trim_end();
    match trimmed.rfind(['.', '\n', ',', ';']) {
        Some(index) => trimmed[index + 1..].trim(),
        None => trimmed,
    }
}

fn normalize_subject(raw: &str) -> String {
    raw.to_lowercase()
        .split_whitespace()
        .filter(|w| !matches!(*w, "the" | "a" | "an" | "our" | "their" | "this" | "that"))
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_types::Message;

    fn agent_message(name: &str, content: &str) -> Message {
        Message::agent(name, content)
    }

    #[test]
    fn numeric_disagreement_beyond_epsilon() {
        let detector = ConflictDetector::new(0.05);
        let recent = vec![agent_message("finance", "Q3 revenue was $1.2m overall")];
        let finding = detector
            .inspect("research", "According to filings, q3 revenue was $2.0m", &recent)
            .expect("conflict expected");
        assert_eq!(finding.kind, ConflictKind::NumericDisagreement);
        assert_eq!(finding.agents, vec!["finance".to_string(), "research".to_string()]);
    }

    #[test]
    fn numeric_agreement_within_epsilon_passes() {
        let detector = ConflictDetector::new(0.05);
        let recent = vec![agent_message("finance", "q3 revenue was $1.00m")];
        assert!(detector
            .inspect("research", "q3 revenue was $1.02m", &recent)
            .is_none());
    }

    #[test]
    fn contradictory_recommendations_flagged() {
        let detector = ConflictDetector::new(0.05);
        let recent = vec![agent_message("strategy", "I recommend expanding to APAC")];
        let finding = detector
            .inspect("ops", "We should recommend against expanding to APAC", &recent)
            .expect("conflict expected");
        assert_eq!(finding.kind, ConflictKind::ContradictoryRecommendation);
    }

    #[test]
    fn same_author_never_conflicts_with_itself() {
        let detector = ConflictDetector::new(0.05);
        let recent = vec![agent_message("finance", "q3 revenue was $1.2m")];
        assert!(detector
            .inspect("finance", "q3 revenue was $9.9m", &recent)
            .is_none());
    }

    #[test]
    fn non_agent_messages_are_ignored() {
        let detector = ConflictDetector::new(0.05);
        let recent = vec![Message::user("q3 revenue was $5m, right?")];
        assert!(detector
            .inspect("finance", "q3 revenue was $1.2m", &recent)
            .is_none());
    }
}
