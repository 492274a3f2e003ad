// Run store
// Persistence for run summaries and the sequenced per-run event log.
// Directory-per-run layout, atomic JSON writes, append-only JSONL events.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use agora_types::{AgoraError, Result, RunEvent, RunSummaryRecord};

pub struct RunStore {
    base_dir: PathBuf,
}

impl RunStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)
            .map_err(|e| AgoraError::Storage(format!("failed to create run store dir: {e}")))?;
        Ok(Self { base_dir })
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.base_dir.join(run_id)
    }

    pub fn save_summary(&self, summary: &RunSummaryRecord) -> Result<()> {
        let dir = self.run_dir(&summary.run_id);
        fs::create_dir_all(&dir)
            .map_err(|e| AgoraError::Storage(format!("failed to create run dir: {e}")))?;
        let content = serde_json::to_string_pretty(summary)
            .map_err(|e| AgoraError::Serialization(format!("failed to serialize summary: {e}")))?;
        atomic_write(&dir.join("summary.json"), &content)
    }

    pub fn load_summary(&self, run_id: &str) -> Result<RunSummaryRecord> {
        let path = self.run_dir(run_id).join("summary.json");
        let content = fs::read_to_string(&path)
            .map_err(|_| AgoraError::NotFound(format!("run `{run_id}`")))?;
        serde_json::from_str(&content)
            .map_err(|e| AgoraError::Serialization(format!("failed to parse summary: {e}")))
    }

    /// Append one event to the run's JSONL log.
    pub fn append_event(&self, event: &RunEvent) -> Result<()> {
        let dir = self.run_dir(&event.run_id);
        fs::create_dir_all(&dir)
            .map_err(|e| AgoraError::Storage(format!("failed to create run dir: {e}")))?;
        let path = dir.join("events.jsonl");
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| AgoraError::Storage(format!("failed to open events log: {e}")))?;
        let line = serde_json::to_string(event)
            .map_err(|e| AgoraError::Serialization(format!("failed to serialize event: {e}")))?;
        writeln!(file, "{line}")
            .map_err(|e| AgoraError::Storage(format!("failed to append event: {e}")))?;
        Ok(())
    }

    /// Load events for a run, optionally only those after `since_seq`,
    /// optionally only the last `tail`.
    pub fn load_events(
        &self,
        run_id: &str,
        since_seq: Option<u64>,
        tail: Option<usize>,
    ) -> Result<Vec<RunEvent>> {
        let path = self.run_dir(run_id).join("events.jsonl");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path)
            .map_err(|e| AgoraError::Storage(format!("failed to open events log: {e}")))?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line =
                line.map_err(|e| AgoraError::Storage(format!("failed reading events log: {e}")))?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(event) = serde_json::from_str::<RunEvent>(&line) {
                if since_seq.is_some_and(|min| event.seq <= min) {
                    continue;
                }
                events.push(event);
            }
        }
        events.sort_by_key(|e| e.seq);
        if let Some(tail_count) = tail {
            if events.len() > tail_count {
                events = events.split_off(events.len() - tail_count);
            }
        }
        Ok(events)
    }

    pub fn latest_event_seq(&self, run_id: &str) -> Result<u64> {
        Ok(self
            .load_events(run_id, None, None)?
            .last()
            .map(|e| e.seq)
            .unwrap_or(0))
    }

    pub fn list_runs(&self) -> Result<Vec<String>> {
        let mut runs = Vec::new();
        for entry in fs::read_dir(&self.base_dir)
            .map_err(|e| AgoraError::Storage(format!("failed to read run store dir: {e}")))?
        {
            let entry =
                entry.map_err(|e| AgoraError::Storage(format!("failed to read dir entry: {e}")))?;
            if entry.path().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    runs.push(name.to_string());
                }
            }
        }
        runs.sort();
        Ok(runs)
    }
}

/// Atomic write using a temp file and rename.
pub(crate) fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, content)
        .map_err(|e| AgoraError::Storage(format!("failed to write temp file: {e}")))?;
    fs::rename(&temp_path, path)
        .map_err(|e| AgoraError::Storage(format!("failed to rename temp file: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_types::{
        Budget, CostTotals, DecisionPlan, FinalizerPolicy, ModelKnobs, Rationale, RiskTier,
        RunEventPayload, RunStatus, SourceKind, UsdMicros,
    };
    use chrono::Utc;
    use tempfile::tempdir;

    fn plan() -> DecisionPlan {
        DecisionPlan {
            sources: vec![SourceKind::LlmOnly],
            tools_allowed: Default::default(),
            model: "std-small".into(),
            knobs: ModelKnobs::default(),
            max_turns: 3,
            budget: Budget::new(UsdMicros(100_000), 8_000, 1_000),
            participants: vec!["finance".into()],
            risk_tier: RiskTier::Low,
            rationale: Rationale {
                reasons: vec![],
                confidence: 0.9,
            },
            finalizer: FinalizerPolicy::InternalReducer,
            catalog_version: 1,
        }
    }

    fn event(run_id: &str, seq: u64) -> RunEvent {
        RunEvent {
            event_id: format!("evt-{seq}"),
            run_id: run_id.to_string(),
            turn_index: 0,
            seq,
            ts_ms: seq * 100,
            payload: RunEventPayload::BudgetEvent {
                kind: agora_types::BudgetEventKind::Warn,
            },
        }
    }

    #[test]
    fn summary_round_trips() {
        let temp = tempdir().unwrap();
        let store = RunStore::new(temp.path()).unwrap();
        let summary = RunSummaryRecord {
            run_id: "run-1".into(),
            tenant_id: "acme".into(),
            plan: plan(),
            cost_totals: CostTotals::default(),
            status: RunStatus::Completed,
            created_at: Utc::now(),
            completed_at: Some(Utc::now()),
            message_count: 4,
            summary: Some("all good".into()),
        };
        store.save_summary(&summary).unwrap();
        let loaded = store.load_summary("run-1").unwrap();
        assert_eq!(loaded.tenant_id, "acme");
        assert_eq!(loaded.message_count, 4);
    }

    #[test]
    fn missing_summary_is_not_found() {
        let temp = tempdir().unwrap();
        let store = RunStore::new(temp.path()).unwrap();
        assert!(matches!(
            store.load_summary("nope"),
            Err(AgoraError::NotFound(_))
        ));
    }

    #[test]
    fn events_append_and_query_by_seq() {
        let temp = tempdir().unwrap();
        let store = RunStore::new(temp.path()).unwrap();
        for seq in 1..=5 {
            store.append_event(&event("run-1", seq)).unwrap();
        }

        assert_eq!(store.latest_event_seq("run-1").unwrap(), 5);

        let since = store.load_events("run-1", Some(3), None).unwrap();
        assert_eq!(since.len(), 2);
        assert_eq!(since[0].seq, 4);

        let tail = store.load_events("run-1", None, Some(2)).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[1].seq, 5);
    }

    #[test]
    fn list_runs_only_sees_directories() {
        let temp = tempdir().unwrap();
        let store = RunStore::new(temp.path()).unwrap();
        store.append_event(&event("run-a", 1)).unwrap();
        store.append_event(&event("run-b", 1)).unwrap();
        fs::write(temp.path().join("stray.txt"), "x").unwrap();

        let runs = store.list_runs().unwrap();
        assert_eq!(runs, vec!["run-a".to_string(), "run-b".to_string()]);
    }
}
