// Safety guardian
// Runs before and after model/tool calls: sanitizes input, scans for prompt
// injection, redacts PII, and decides whether an action may proceed.

use regex::Regex;

use agora_types::{RiskTier, SafetyLevel};

/// Guardian verdict for a piece of text about to cross a trust boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardianDecision {
    Allow,
    AllowWithRedaction { text: String, redactions: usize },
    EscalateToHitl { reason: String },
    Reject { reason: String },
}

/// Pre-scan signals consumed by the decision engine's risk derivation.
#[derive(Debug, Clone, Copy, Default)]
pub struct RiskSignals {
    pub pii_detected: bool,
    pub injection_detected: bool,
    pub risk_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InjectionKind {
    InstructionOverride,
    DataExfiltration,
    RoleSwitch,
}

struct PiiPattern {
    label: &'static str,
    regex: Regex,
}

pub struct SafetyGuardian {
    injection_patterns: Vec<(InjectionKind, Regex)>,
    pii_patterns: Vec<PiiPattern>,
    denied_topics: Vec<Regex>,
}

impl SafetyGuardian {
    pub fn new() -> Self {
        let injection_patterns = vec![
            (
                InjectionKind::InstructionOverride,
                Regex::new(r"(?i)\b(ignore|disregard|forget)\b.{0,40}\b(previous|prior|above|all)\b.{0,40}\b(instructions?|rules|prompts?)\b")
                    .expect("static regex"),
            ),
            (
                InjectionKind::InstructionOverride,
                Regex::new(r"(?i)\boverride\b.{0,30}\bsystem prompt\b").expect("static regex"),
            ),
            (
                InjectionKind::DataExfiltration,
                Regex::new(r"(?i)\b(reveal|print|leak|send|exfiltrate)\b.{0,50}\b(system prompt|api key|credentials?|secrets?)\b")
                    .expect("static regex"),
            ),
            (
                InjectionKind::RoleSwitch,
                Regex::new(r"(?i)\byou are (now|no longer)\b|\bpretend to be\b|\bact as (an? )?(admin|root|developer mode)\b")
                    .expect("static regex"),
            ),
        ];
        let pii_patterns = vec![
            PiiPattern {
                label: "email",
                regex: Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}")
                    .expect("static regex"),
            },
            PiiPattern {
                label: "ssn",
                regex: Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("static regex"),
            },
            PiiPattern {
                label: "card",
                regex: Regex::new(r"\b(?:\d[ -]?){13,16}\b").expect("static regex"),
            },
            PiiPattern {
                label: "phone",
                regex: Regex::new(r"\+?\d{1,3}[ .-]?\(?\d{3}\)?[ .-]?\d{3}[ .-]?\d{4}\b")
                    .expect("static regex"),
            },
        ];
        let denied_topics = vec![
            Regex::new(r"(?i)\b(build|make|synthesize)\b.{0,30}\b(bomb|explosive|nerve agent)\b")
                .expect("static regex"),
        ];
        Self {
            injection_patterns,
            pii_patterns,
            denied_topics,
        }
    }

    /// Strip control characters that can smuggle instructions past review.
    pub fn sanitize(&self, text: &str) -> String {
        text.chars()
            .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
            .collect()
    }

    /// Replace detected PII with `[REDACTED:<label>]`, returning the count.
    pub fn redact(&self, text: &str) -> (String, usize) {
        let mut redacted = text.to_string();
        let mut count = 0;
        for pattern in &self.pii_patterns {
            let matches = pattern.regex.find_iter(&redacted).count();
            if matches > 0 {
                count += matches;
                redacted = pattern
                    .regex
                    .replace_all(&redacted, format!("[REDACTED:{}]", pattern.label).as_str())
                    .into_owned();
            }
        }
        (redacted, count)
    }

    /// Cheap scan used by the decision engine before planning.
    pub fn pre_scan(&self, text: &str) -> RiskSignals {
        let sanitized = self.sanitize(text);
        let injection = self
            .injection_patterns
            .iter()
            .any(|(_, regex)| regex.is_match(&sanitized));
        let pii = self
            .pii_patterns
            .iter()
            .any(|pattern| pattern.regex.is_match(&sanitized));
        let mut score: f64 = 0.0;
        if injection {
            score += 0.5;
        }
        if pii {
            score += 0.3;
        }
        RiskSignals {
            pii_detected: pii,
            injection_detected: injection,
            risk_score: score.min(1.0),
        }
    }

    /// Gate text entering a model or tool. `safety_level` is the level of
    /// the action about to run; `risk` is the run's planned tier.
    pub fn check_input(
        &self,
        text: &str,
        safety_level: SafetyLevel,
        risk: RiskTier,
    ) -> GuardianDecision {
        let sanitized = self.sanitize(text);

        for denied in &self.denied_topics {
            if denied.is_match(&sanitized) {
                return GuardianDecision::Reject {
                    reason: "disallowed content category".into(),
                };
            }
        }

        for (kind, regex) in &self.injection_patterns {
            if regex.is_match(&sanitized) {
                return match kind {
                    InjectionKind::DataExfiltration => GuardianDecision::Reject {
                        reason: "data exfiltration pattern".into(),
                    },
                    InjectionKind::InstructionOverride | InjectionKind::RoleSwitch => {
                        GuardianDecision::EscalateToHitl {
                            reason: "prompt injection pattern".into(),
                        }
                    }
                };
            }
        }

        let (redacted, redactions) = self.redact(&sanitized);
        if redactions > 0 {
            // PII flowing into a gated action on a high-risk run needs a
            // human decision, not silent redaction.
            if safety_level != SafetyLevel::Safe && risk >= RiskTier::High {
                return GuardianDecision::EscalateToHitl {
                    reason: format!("{redactions} PII match(es) on a gated action"),
                };
            }
            return GuardianDecision::AllowWithRedaction {
                text: redacted,
                redactions,
            };
        }

        if sanitized != text {
            return GuardianDecision::AllowWithRedaction {
                text: sanitized,
                redactions: 0,
            };
        }
        GuardianDecision::Allow
    }

    /// Scan output leaving a model or tool. Redacts what it can; rejects
    /// what it cannot.
    pub fn check_output(&self, text: &str) -> GuardianDecision {
        let sanitized = self.sanitize(text);
        for denied in &self.denied_topics {
            if denied.is_match(&sanitized) {
                return GuardianDecision::Reject {
                    reason: "disallowed content in output".into(),
                };
            }
        }
        let (redacted, redactions) = self.redact(&sanitized);
        if redactions > 0 {
            return GuardianDecision::AllowWithRedaction {
                text: redacted,
                redactions,
            };
        }
        GuardianDecision::Allow
    }
}

impl Default for SafetyGuardian {
    fn default() -> Self {
        Self::new()
    }
}
