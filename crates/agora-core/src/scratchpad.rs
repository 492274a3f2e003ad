// Shared scratchpad
// Append-only notes written by the orchestrator on behalf of agents. Readers
// get stable views; a compression pass keeps the pad inside its token bound
// by archiving originals behind a single summary entry.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteKind {
    Fact,
    Assumption,
    Decision,
    Question,
    Todo,
}

impl NoteKind {
    fn marker(&self) -> &'static str {
        match self {
            NoteKind::Fact => "FACT:",
            NoteKind::Assumption => "ASSUMPTION:",
            NoteKind::Decision => "DECISION:",
            NoteKind::Question => "QUESTION:",
            NoteKind::Todo => "TODO:",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScratchpadNote {
    pub turn: u32,
    pub agent: String,
    pub kind: NoteKind,
    pub text: String,
    #[serde(default)]
    pub refs: Vec<String>,
}

/// Rough token estimate; providers bill near four characters per token.
pub fn approx_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scratchpad {
    entries: Vec<ScratchpadNote>,
    archived: Vec<ScratchpadNote>,
    max_tokens: u64,
}

impl Scratchpad {
    pub fn new(max_tokens: u64) -> Self {
        Self {
            entries: Vec::new(),
            archived: Vec::new(),
            max_tokens,
        }
    }

    pub fn entries(&self) -> &[ScratchpadNote] {
        &self.entries
    }

    pub fn archived(&self) -> &[ScratchpadNote] {
        &self.archived
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn append(&mut self, note: ScratchpadNote) {
        self.entries.push(note);
        self.maybe_compress();
    }

    pub fn append_all(&mut self, notes: Vec<ScratchpadNote>) {
        self.entries.extend(notes);
        self.maybe_compress();
    }

    fn estimated_tokens(&self) -> u64 {
        self.entries.iter().map(|n| approx_tokens(&n.text)).sum()
    }

    /// Compress when over budget: all but the most recent few entries are
    /// folded into one summary note and archived. Archived notes stay
    /// readable (they already appeared in event history).
    fn maybe_compress(&mut self) {
        if self.max_tokens == 0 || self.estimated_tokens() <= self.max_tokens {
            return;
        }
        let keep_tail = 4.min(self.entries.len());
        let split = self.entries.len() - keep_tail;
        if split == 0 {
            return;
        }
        let folded: Vec<ScratchpadNote> = self.entries.drain(..split).collect();
        let summary = summarize_notes(&folded);
        let last_turn = folded.last().map(|n| n.turn).unwrap_or(0);
        self.archived.extend(folded);
        self.entries.insert(
            0,
            ScratchpadNote {
                turn: last_turn,
                agent: "orchestrator".to_string(),
                kind: NoteKind::Fact,
                text: summary,
                refs: Vec::new(),
            },
        );
    }

    /// Compact rendering for prompt assembly, newest last.
    pub fn summary_text(&self, max_tokens: u64) -> String {
        let mut lines = Vec::new();
        let mut used = 0u64;
        for note in self.entries.iter().rev() {
            let line = format!("{} [{}] {}", note.marker_label(), note.agent, note.text);
            let cost = approx_tokens(&line);
            if used + cost > max_tokens {
                break;
            }
            used += cost;
            lines.push(line);
        }
        lines.reverse();
        lines.join("\n")
    }

    /// Decision reasons recorded for the final summary.
    pub fn decisions(&self) -> impl Iterator<Item = &ScratchpadNote> {
        self.entries
            .iter()
            .filter(|n| n.kind == NoteKind::Decision)
    }
}

impl ScratchpadNote {
    fn marker_label(&self) -> &'static str {
        match self.kind {
            NoteKind::Fact => "fact",
            NoteKind::Assumption => "assumption",
            NoteKind::Decision => "decision",
            NoteKind::Question => "question",
            NoteKind::Todo => "todo",
        }
    }
}

fn summarize_notes(notes: &[ScratchpadNote]) -> String {
    let facts = notes.iter().filter(|n| n.kind == NoteKind::Fact).count();
    let decisions = notes
        .iter()
        .filter(|n| n.kind == NoteKind::Decision)
        .count();
    let open = notes
        .iter()
        .filter(|n| matches!(n.kind, NoteKind::Question | NoteKind::Todo))
        .count();
    let recent: Vec<&str> = notes
        .iter()
        .rev()
        .take(3)
        .map(|n| n.text.as_str())
        .collect();
    format!(
        "compressed {} earlier notes ({} facts, {} decisions, {} open items); latest: {}",
        notes.len(),
        facts,
        decisions,
        open,
        recent.join(" | ")
    )
}

/// Extract typed notes from an agent message using line markers
/// (`FACT:`, `DECISION:`, `TODO:`, `QUESTION:`, `ASSUMPTION:`).
pub fn extract_notes(turn: u32, agent: &str, text: &str) -> Vec<ScratchpadNote> {
    let mut notes = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim().trim_start_matches(['-', '*', ' ']);
        for kind in [
            NoteKind::Fact,
            NoteKind::Assumption,
            NoteKind::Decision,
            NoteKind::Question,
            NoteKind::Todo,
        ] {
            if let Some(rest) = strip_marker(trimmed, kind.marker()) {
                if !rest.is_empty() {
                    notes.push(ScratchpadNote {
                        turn,
                        agent: agent.to_string(),
                        kind,
                        text: rest.to_string(),
                        refs: Vec::new(),
                    });
                }
                break;
            }
        }
    }
    notes
}

fn strip_marker<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    let head = line.get(..marker.len())?;
    if head.eq_ignore_ascii_case(marker) {
        Some(line[marker.len()..].trim())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(turn: u32, kind: NoteKind, text: &str) -> ScratchpadNote {
        ScratchpadNote {
            turn,
            agent: "finance".to_string(),
            kind,
            text: text.to_string(),
            refs: Vec::new(),
        }
    }

    #[test]
    fn extraction_reads_markers_case_insensitively() {
        let text = "Revenue looks strong.\nFACT: Q3 revenue was $1.2M\n- todo: verify with billing\nDecision: use backend numbers";
        let notes = extract_notes(2, "finance", text);
        assert_eq!(notes.len(), 3);
        assert_eq!(notes[0].kind, NoteKind::Fact);
        assert_eq!(notes[1].kind, NoteKind::Todo);
        assert_eq!(notes[2].kind, NoteKind::Decision);
        assert_eq!(notes[0].text, "Q3 revenue was $1.2M");
    }

    #[test]
    fn compression_folds_old_entries_behind_a_summary() {
        let mut pad = Scratchpad::new(40);
        for turn in 0..12 {
            pad.append(note(turn, NoteKind::Fact, &format!("observation number {turn} with some detail")));
        }
        assert!(pad.len() < 12);
        assert!(!pad.archived().is_empty());
        assert!(pad.entries()[0].text.starts_with("compressed"));
        // Estimated size is back under control.
        assert!(pad.estimated_tokens() <= 40 + 40);
    }

    #[test]
    fn summary_text_respects_token_budget_and_order() {
        let mut pad = Scratchpad::new(10_000);
        pad.append(note(0, NoteKind::Fact, "first"));
        pad.append(note(1, NoteKind::Decision, "second"));
        let text = pad.summary_text(1_000);
        let first_pos = text.find("first").unwrap();
        let second_pos = text.find("second").unwrap();
        assert!(first_pos < second_pos);
    }

    #[test]
    fn zero_budget_never_compresses() {
        let mut pad = Scratchpad::new(0);
        for turn in 0..50 {
            pad.append(note(turn, NoteKind::Fact, "x"));
        }
        assert_eq!(pad.len(), 50);
    }
}
