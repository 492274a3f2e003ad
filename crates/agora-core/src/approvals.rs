// HITL approval store
// Durable queue of human approvals with watch-channel waiters, TTL expiry
// and auto-approval rules. Decisions are immutable once made; repeated
// decide calls return the stable record.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use agora_types::{AgoraError, ApprovalOutcome, Result, RiskTier};

use crate::clock::Clock;
use crate::config::{AutoApproveRule, HitlConfig};
use crate::store::atomic_write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    pub fn is_terminal(&self) -> bool {
        *self != ApprovalStatus::Pending
    }

    pub fn outcome(&self) -> Option<ApprovalOutcome> {
        match self {
            ApprovalStatus::Pending => None,
            ApprovalStatus::Approved => Some(ApprovalOutcome::Approved),
            ApprovalStatus::Rejected => Some(ApprovalOutcome::Rejected),
            ApprovalStatus::Expired => Some(ApprovalOutcome::Expired),
        }
    }
}

/// What a caller submits when requesting an approval.
#[derive(Debug, Clone)]
pub struct ApprovalRequestDetails {
    pub run_id: String,
    pub turn_index: u32,
    pub requester_agent: String,
    /// Action label, e.g. `tool:send_notification`.
    pub action: String,
    pub payload: Value,
    pub risk_level: RiskTier,
    /// Pause token context: whatever the orchestrator needs to re-enter the
    /// pipeline (input hash, budget snapshot).
    pub context: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub id: String,
    pub run_id: String,
    pub turn_index: u32,
    pub requester_agent: String,
    pub action: String,
    pub payload: Value,
    pub risk_level: RiskTier,
    #[serde(default)]
    pub context: Value,
    pub status: ApprovalStatus,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decider_id: Option<String>,
}

/// Resolution delivered to an awaiting run.
#[derive(Debug, Clone)]
pub struct ApprovalDecision {
    pub outcome: ApprovalOutcome,
    pub reason: Option<String>,
    /// Payload to resume with; approvers may have modified it.
    pub payload: Value,
}

#[derive(Debug, Clone, Default)]
pub struct ApprovalFilter {
    pub run_id: Option<String>,
    pub status: Option<ApprovalStatus>,
}

#[derive(Clone)]
pub struct ApprovalStore {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
    config: HitlConfig,
    records: Arc<RwLock<HashMap<String, ApprovalRecord>>>,
    waiters: Arc<RwLock<HashMap<String, watch::Sender<Option<ApprovalOutcome>>>>>,
}

impl ApprovalStore {
    /// Open (or create) the store. Pending records left by a previous
    /// process are reloaded so the orchestrator can resume them.
    pub fn open(dir: impl Into<PathBuf>, config: HitlConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| AgoraError::Storage(format!("failed to create approvals dir: {e}")))?;

        let mut records = HashMap::new();
        for entry in fs::read_dir(&dir)
            .map_err(|e| AgoraError::Storage(format!("failed to read approvals dir: {e}")))?
        {
            let entry =
                entry.map_err(|e| AgoraError::Storage(format!("failed dir entry: {e}")))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path)
                .map_err(|e| AgoraError::Storage(format!("failed to read approval: {e}")))?;
            match serde_json::from_str::<ApprovalRecord>(&content) {
                Ok(record) => {
                    records.insert(record.id.clone(), record);
                }
                Err(e) => tracing::warn!(path = %path.display(), "skipping unreadable approval: {e}"),
            }
        }

        Ok(Self {
            dir,
            clock,
            config,
            records: Arc::new(RwLock::new(records)),
            waiters: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Enqueue an approval. Auto-approval rules may resolve it immediately;
    /// critical risk always goes to a human.
    pub async fn request(
        &self,
        details: ApprovalRequestDetails,
        ttl: Option<Duration>,
    ) -> Result<ApprovalRecord> {
        let now = self.clock.now();
        let ttl = ttl.unwrap_or(Duration::from_secs(self.config.default_ttl_secs));
        let mut record = ApprovalRecord {
            id: Uuid::new_v4().to_string(),
            run_id: details.run_id,
            turn_index: details.turn_index,
            requester_agent: details.requester_agent,
            action: details.action,
            payload: details.payload,
            risk_level: details.risk_level,
            context: details.context,
            status: ApprovalStatus::Pending,
            requested_at: now,
            expires_at: now + chrono::Duration::milliseconds(ttl.as_millis() as i64),
            decision_reason: None,
            decider_id: None,
        };

        if record.risk_level != RiskTier::Critical {
            if let Some(rule) = self.matching_auto_rule(&record) {
                tracing::info!(approval = %record.id, action = %record.action, "auto-approved");
                record.status = ApprovalStatus::Approved;
                record.decision_reason = Some(format!("auto-approval rule `{}`", rule.action_pattern));
                record.decider_id = Some("auto".to_string());
            }
        }

        self.persist(&record)?;
        let (tx, _rx) = watch::channel(record.status.outcome());
        self.waiters.write().await.insert(record.id.clone(), tx);
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(record)
    }

    fn matching_auto_rule(&self, record: &ApprovalRecord) -> Option<&AutoApproveRule> {
        self.config
            .auto_approve
            .iter()
            .find(|rule| rule.max_risk >= record.risk_level && wildcard_matches(&rule.action_pattern, &record.action))
    }

    /// Block until the approval is decided, expires, or the token fires.
    pub async fn await_decision(
        &self,
        approval_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ApprovalDecision> {
        loop {
            let (status, expires_at, payload, reason) = {
                let records = self.records.read().await;
                let record = records
                    .get(approval_id)
                    .ok_or_else(|| AgoraError::NotFound(format!("approval `{approval_id}`")))?;
                (
                    record.status,
                    record.expires_at,
                    record.payload.clone(),
                    record.decision_reason.clone(),
                )
            };

            if let Some(outcome) = status.outcome() {
                return Ok(ApprovalDecision {
                    outcome,
                    reason,
                    payload,
                });
            }

            let now = self.clock.now();
            if now >= expires_at {
                self.mark_expired(approval_id).await?;
                continue;
            }
            let remaining = (expires_at - now)
                .to_std()
                .unwrap_or(Duration::from_millis(0));

            let mut rx = {
                let waiters = self.waiters.read().await;
                match waiters.get(approval_id) {
                    Some(tx) => tx.subscribe(),
                    // Waiter already cleaned up; re-read the record.
                    None => continue,
                }
            };
            // A decision may have landed between the status read and the
            // subscription; the borrow catches it.
            if rx.borrow().is_some() {
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(AgoraError::Cancelled),
                res = self.clock.sleep(remaining, cancel) => {
                    res?;
                    self.mark_expired(approval_id).await?;
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        // Sender dropped; loop re-reads the stored record.
                        continue;
                    }
                }
            }
        }
    }

    /// Record a human decision. Terminal records are immutable: deciding an
    /// already-decided approval is a no-op returning the stable state.
    pub async fn decide(
        &self,
        approval_id: &str,
        outcome: ApprovalOutcome,
        reason: Option<String>,
        decider_id: &str,
    ) -> Result<ApprovalRecord> {
        if outcome == ApprovalOutcome::Expired {
            return Err(AgoraError::InvalidOperation(
                "expiry is driven by the sweep, not decide".into(),
            ));
        }
        let mut records = self.records.write().await;
        let record = records
            .get_mut(approval_id)
            .ok_or_else(|| AgoraError::NotFound(format!("approval `{approval_id}`")))?;

        if record.status.is_terminal() {
            return Ok(record.clone());
        }

        record.status = match outcome {
            ApprovalOutcome::Approved => ApprovalStatus::Approved,
            ApprovalOutcome::Rejected => ApprovalStatus::Rejected,
            ApprovalOutcome::Expired => unreachable!("checked above"),
        };
        record.decision_reason = reason;
        record.decider_id = Some(decider_id.to_string());
        let snapshot = record.clone();
        drop(records);

        self.persist(&snapshot)?;
        self.notify(approval_id, snapshot.status.outcome()).await;
        Ok(snapshot)
    }

    pub async fn get(&self, approval_id: &str) -> Result<ApprovalRecord> {
        self.records
            .read()
            .await
            .get(approval_id)
            .cloned()
            .ok_or_else(|| AgoraError::NotFound(format!("approval `{approval_id}`")))
    }

    pub async fn list(&self, filter: ApprovalFilter) -> Vec<ApprovalRecord> {
        let records = self.records.read().await;
        let mut out: Vec<ApprovalRecord> = records
            .values()
            .filter(|r| {
                filter
                    .run_id
                    .as_ref()
                    .is_none_or(|run_id| &r.run_id == run_id)
                    && filter.status.is_none_or(|status| r.status == status)
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        out
    }

    /// Expire every overdue pending approval. Returns the expired ids.
    pub async fn expire_sweep(&self) -> Result<Vec<String>> {
        let now = self.clock.now();
        let overdue: Vec<String> = {
            let records = self.records.read().await;
            records
                .values()
                .filter(|r| r.status == ApprovalStatus::Pending && r.expires_at <= now)
                .map(|r| r.id.clone())
                .collect()
        };
        for id in &overdue {
            self.mark_expired(id).await?;
        }
        Ok(overdue)
    }

    async fn mark_expired(&self, approval_id: &str) -> Result<()> {
        let snapshot = {
            let mut records = self.records.write().await;
            let Some(record) = records.get_mut(approval_id) else {
                return Ok(());
            };
            if record.status.is_terminal() {
                return Ok(());
            }
            record.status = ApprovalStatus::Expired;
            record.decision_reason = Some("expired".to_string());
            record.clone()
        };
        self.persist(&snapshot)?;
        self.notify(approval_id, Some(ApprovalOutcome::Expired)).await;
        Ok(())
    }

    async fn notify(&self, approval_id: &str, outcome: Option<ApprovalOutcome>) {
        if let Some(tx) = self.waiters.read().await.get(approval_id) {
            let _ = tx.send(outcome);
        }
    }

    fn persist(&self, record: &ApprovalRecord) -> Result<()> {
        let content = serde_json::to_string_pretty(record)
            .map_err(|e| AgoraError::Serialization(format!("failed to serialize approval: {e}")))?;
        atomic_write(&self.dir.join(format!("{}.json", record.id)), &content)
    }
}

fn wildcard_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return pattern == value;
    }
    let mut remaining = value;
    let mut is_first = true;
    for part in pattern.split('*') {
        if part.is_empty() {
            continue;
        }
        if is_first {
            match remaining.strip_prefix(part) {
                Some(stripped) => remaining = stripped,
                None => return false,
            }
            is_first = false;
            continue;
        }
        match remaining.find(part) {
            Some(index) => remaining = &remaining[index + part.len()..],
            None => return false,
        }
    }
    pattern.ends_with('*') || remaining.is_empty()
}
