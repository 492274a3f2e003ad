// Streaming runner
// Public surface of the core: starts runs under a concurrency cap, hands
// out event subscriptions, forwards events to persistence and audit,
// answers status queries and drives approval expiry.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use agora_core::approvals::{ApprovalFilter, ApprovalRecord, ApprovalStore};
use agora_core::breaker::BreakerRegistry;
use agora_core::capabilities::{AuditSink, LlmClient, Retriever};
use agora_core::catalog::CatalogRegistry;
use agora_core::clock::Clock;
use agora_core::config::{EngineConfig, FlagStore};
use agora_core::event_bus::{EventSubscription, RunEventBus};
use agora_core::guardian::SafetyGuardian;
use agora_core::rate_limit::RateLimiter;
use agora_core::store::RunStore;
use agora_types::{
    AgoraError, ApprovalOutcome, CostTotals, Request, Result, RunEventPayload, RunStatus,
    RunStatusReport, RunSummaryRecord,
};

use crate::decision::DecisionEngine;
use crate::engine::{GroupChatEngine, RunDeps};
use crate::tools::ToolRegistry;

/// Seconds between approval expiry sweeps.
const SWEEP_INTERVAL_SECS: u64 = 30;

/// External capabilities injected at startup.
pub struct RunnerServices {
    pub llm: Arc<dyn LlmClient>,
    pub retriever: Arc<dyn Retriever>,
    pub tool_registry: Arc<ToolRegistry>,
    pub audit: Arc<dyn AuditSink>,
    pub clock: Arc<dyn Clock>,
}

struct TrackedProgress {
    turn_index: u32,
    cost_totals: CostTotals,
    last_event_seq: u64,
}

struct RunHandle {
    cancel: CancellationToken,
    status: Arc<RwLock<RunStatus>>,
    progress: Arc<RwLock<TrackedProgress>>,
    #[allow(dead_code)]
    join: tokio::task::JoinHandle<()>,
}

pub struct RunnerService {
    config: EngineConfig,
    catalogs: CatalogRegistry,
    flags: FlagStore,
    decision: DecisionEngine,
    deps: RunDeps,
    audit: Arc<dyn AuditSink>,
    store: Arc<RunStore>,
    runs: Mutex<HashMap<String, RunHandle>>,
    shutdown: CancellationToken,
}

impl RunnerService {
    pub fn new(
        config: EngineConfig,
        catalogs: CatalogRegistry,
        services: RunnerServices,
        data_dir: &Path,
    ) -> Result<Arc<Self>> {
        let approvals = ApprovalStore::open(
            data_dir.join("approvals"),
            config.hitl.clone(),
            services.clock.clone(),
        )?;
        let store = Arc::new(RunStore::new(data_dir.join("runs"))?);
        let deps = RunDeps {
            llm: services.llm,
            retriever: services.retriever,
            tool_registry: services.tool_registry,
            guardian: Arc::new(SafetyGuardian::new()),
            breakers: BreakerRegistry::new(config.breaker.clone(), services.clock.clone()),
            rate_limiter: RateLimiter::new(config.rate_limit.clone(), services.clock.clone()),
            approvals,
            clock: services.clock,
        };

        let runner = Arc::new(Self {
            decision: DecisionEngine::new(config.clone()),
            flags: FlagStore::new(config.flags.clone()),
            catalogs,
            deps,
            audit: services.audit,
            store,
            runs: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            config,
        });
        runner.spawn_expiry_sweeper();
        Ok(runner)
    }

    /// Start a run. Returns the run id and a live event subscription.
    pub async fn start(self: &Arc<Self>, request: Request) -> Result<(String, EventSubscription)> {
        let active = self.active_runs();
        if active >= self.config.max_concurrent_runs {
            return Err(AgoraError::QueueFull(active));
        }

        let snapshot = self.flags.snapshot();
        let flags = match &request.flags {
            Some(overrides) => snapshot.flags.clone().with_overrides(overrides),
            None => snapshot.flags.clone(),
        };
        let catalogs = self.catalogs.snapshot();

        let plan = if flags.decision_engine {
            self.decision.plan(&request, &catalogs, &self.deps.guardian)?
        } else {
            self.decision.fallback_plan(&request, &catalogs)?
        };

        let run_id = request.run_id.clone();
        let bus = Arc::new(RunEventBus::new(run_id.clone(), self.deps.clock.clone()));
        let subscription = bus.subscribe();
        let status = Arc::new(RwLock::new(RunStatus::Running));
        let progress = Arc::new(RwLock::new(TrackedProgress {
            turn_index: 0,
            cost_totals: CostTotals::default(),
            last_event_seq: 0,
        }));
        let cancel = CancellationToken::new();

        self.spawn_forwarder(bus.subscribe(), progress.clone());

        let engine = GroupChatEngine::new(
            request.clone(),
            plan.clone(),
            self.config.clone(),
            flags,
            catalogs,
            self.deps.clone(),
            bus.clone(),
            cancel.clone(),
            status.clone(),
        );

        let join = {
            let runner = self.clone();
            let created_at = runner.deps.clock.now();
            tokio::spawn(async move {
                let report = engine.run().await;
                let summary = RunSummaryRecord {
                    run_id: report.run_id.clone(),
                    tenant_id: request.tenant_id.clone(),
                    plan,
                    cost_totals: report.cost_totals,
                    status: report.status,
                    created_at,
                    completed_at: Some(runner.deps.clock.now()),
                    message_count: report.message_count,
                    summary: report.summary.clone(),
                };
                if let Err(e) = runner.store.save_summary(&summary) {
                    tracing::error!(run = %report.run_id, "failed to persist run summary: {e}");
                }
            })
        };

        self.runs.lock().expect("runs poisoned").insert(
            run_id.clone(),
            RunHandle {
                cancel,
                status,
                progress,
                join,
            },
        );

        Ok((run_id, subscription))
    }

    /// Request cancellation. Idempotent; repeated calls have no further
    /// effect.
    pub fn cancel(&self, run_id: &str) -> Result<()> {
        let runs = self.runs.lock().expect("runs poisoned");
        let handle = runs
            .get(run_id)
            .ok_or_else(|| AgoraError::NotFound(format!("run `{run_id}`")))?;
        handle.cancel.cancel();
        Ok(())
    }

    /// Live (or last known) status of a run.
    pub fn status(&self, run_id: &str) -> Result<RunStatusReport> {
        {
            let runs = self.runs.lock().expect("runs poisoned");
            if let Some(handle) = runs.get(run_id) {
                let progress = handle.progress.read().expect("progress poisoned");
                return Ok(RunStatusReport {
                    run_id: run_id.to_string(),
                    state: *handle.status.read().expect("status poisoned"),
                    turn_index: progress.turn_index,
                    cost_totals: progress.cost_totals,
                    last_event_seq: progress.last_event_seq,
                });
            }
        }
        // Fall back to the persisted summary for completed runs from a
        // previous process.
        let summary = self.store.load_summary(run_id)?;
        let last_event_seq = self.store.latest_event_seq(run_id)?;
        Ok(RunStatusReport {
            run_id: run_id.to_string(),
            state: summary.status,
            turn_index: 0,
            cost_totals: summary.cost_totals,
            last_event_seq,
        })
    }

    /// Replay persisted events, e.g. for an observer reattaching after the
    /// run finished.
    pub fn replay(&self, run_id: &str, since_seq: Option<u64>) -> Result<Vec<agora_types::RunEvent>> {
        self.store.load_events(run_id, since_seq, None)
    }

    pub fn approvals(&self) -> ApprovalService {
        ApprovalService {
            store: self.deps.approvals.clone(),
        }
    }

    pub fn flag_store(&self) -> &FlagStore {
        &self.flags
    }

    pub fn catalog_registry(&self) -> &CatalogRegistry {
        &self.catalogs
    }

    /// Stop background tasks. In-flight runs keep going until they finish
    /// or are cancelled individually.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn active_runs(&self) -> usize {
        self.runs
            .lock()
            .expect("runs poisoned")
            .values()
            .filter(|handle| !handle.status.read().expect("status poisoned").is_terminal())
            .count()
    }

    /// Forward every event to the store and the audit sink, tracking
    /// progress for status queries. At-least-once to audit: transient
    /// failures are retried with backoff.
    fn spawn_forwarder(
        self: &Arc<Self>,
        mut subscription: EventSubscription,
        progress: Arc<RwLock<TrackedProgress>>,
    ) {
        let runner = self.clone();
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                {
                    let mut progress = progress.write().expect("progress poisoned");
                    progress.last_event_seq = progress.last_event_seq.max(event.seq);
                    progress.turn_index = progress.turn_index.max(event.turn_index);
                    if let RunEventPayload::TokenDelta {
                        tokens_in,
                        tokens_out,
                        usd,
                        ..
                    } = &event.payload
                    {
                        progress.cost_totals.tokens_in += tokens_in;
                        progress.cost_totals.tokens_out += tokens_out;
                        progress.cost_totals.usd = progress.cost_totals.usd.saturating_add(*usd);
                    }
                }

                if let Err(e) = runner.store.append_event(&event) {
                    tracing::error!(run = %event.run_id, seq = event.seq, "failed to persist event: {e}");
                }

                let mut attempt = 0u32;
                loop {
                    match runner.audit.write(&event).await {
                        Ok(()) => break,
                        Err(e) if attempt < 3 && e.is_transient() => {
                            attempt += 1;
                            let backoff = Duration::from_millis(50u64 << attempt);
                            if runner
                                .deps
                                .clock
                                .sleep(backoff, &runner.shutdown)
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(run = %event.run_id, seq = event.seq, "audit sink dropped event: {e}");
                            break;
                        }
                    }
                }
            }
        });
    }

    fn spawn_expiry_sweeper(self: &Arc<Self>) {
        let runner = self.clone();
        tokio::spawn(async move {
            let interval = Duration::from_secs(SWEEP_INTERVAL_SECS);
            loop {
                if runner
                    .deps
                    .clock
                    .sleep(interval, &runner.shutdown)
                    .await
                    .is_err()
                {
                    return;
                }
                match runner.deps.approvals.expire_sweep().await {
                    Ok(expired) if !expired.is_empty() => {
                        tracing::info!(count = expired.len(), "expired overdue approvals");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("approval sweep failed: {e}"),
                }
            }
        });
    }
}

/// Thin facade over the approval store for operator surfaces.
#[derive(Clone)]
pub struct ApprovalService {
    store: ApprovalStore,
}

impl ApprovalService {
    pub async fn list(&self, filter: ApprovalFilter) -> Vec<ApprovalRecord> {
        self.store.list(filter).await
    }

    pub async fn get(&self, approval_id: &str) -> Result<ApprovalRecord> {
        self.store.get(approval_id).await
    }

    pub async fn decide(
        &self,
        approval_id: &str,
        outcome: ApprovalOutcome,
        reason: Option<String>,
        decider_id: &str,
    ) -> Result<ApprovalRecord> {
        self.store.decide(approval_id, outcome, reason, decider_id).await
    }
}
