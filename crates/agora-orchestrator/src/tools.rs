// Tool executor
// Gated pipeline for every tool invocation: plan permission, schema
// validation, guardian check, HITL approval, breaker and rate-limit
// admission, cost preflight, deadline-bounded execution with bounded
// retries, cost recording and output post-check. Invocations are idempotent
// per (run, turn, input hash).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use agora_core::approvals::{ApprovalRequestDetails, ApprovalStore};
use agora_core::breaker::{Admission, BreakerRegistry};
use agora_core::catalog::CatalogSnapshot;
use agora_core::clock::Clock;
use agora_core::config::{Deadlines, FeatureFlags};
use agora_core::cost::CostTracker;
use agora_core::event_bus::RunEventBus;
use agora_core::guardian::{GuardianDecision, SafetyGuardian};
use agora_core::rate_limit::{RateCategory, RateLimiter};
use agora_types::{
    AgoraError, ApprovalOutcome, CostLedgerEntry, DecisionPlan, Result, RunEventPayload,
    RunStatus, SafetyLevel, ToolInvocationStatus, ToolSpec,
};

use crate::rag::hash_text;

/// Executable behavior behind a catalog `ToolSpec`.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn run(&self, input: Value, cancel: &CancellationToken) -> Result<Value>;
}

#[derive(Default, Clone)]
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(name).cloned()
    }
}

#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub result: Value,
    pub input_hash: String,
    pub output_hash: String,
    pub duration_ms: u64,
    pub from_cache: bool,
}

/// Per-run executor. Shared services arrive by handle; the idempotency
/// cache lives for the run.
pub struct ToolExecutor {
    run_id: String,
    tenant_id: String,
    plan: Arc<DecisionPlan>,
    catalogs: Arc<CatalogSnapshot>,
    registry: Arc<ToolRegistry>,
    guardian: Arc<SafetyGuardian>,
    breakers: BreakerRegistry,
    rate_limiter: RateLimiter,
    approvals: ApprovalStore,
    cost: Arc<Mutex<CostTracker>>,
    bus: Arc<RunEventBus>,
    clock: Arc<dyn Clock>,
    flags: FeatureFlags,
    deadlines: Deadlines,
    status: Arc<RwLock<RunStatus>>,
    cache: Mutex<HashMap<(u32, String), ToolOutcome>>,
}

impl ToolExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: String,
        tenant_id: String,
        plan: Arc<DecisionPlan>,
        catalogs: Arc<CatalogSnapshot>,
        registry: Arc<ToolRegistry>,
        guardian: Arc<SafetyGuardian>,
        breakers: BreakerRegistry,
        rate_limiter: RateLimiter,
        approvals: ApprovalStore,
        cost: Arc<Mutex<CostTracker>>,
        bus: Arc<RunEventBus>,
        clock: Arc<dyn Clock>,
        flags: FeatureFlags,
        deadlines: Deadlines,
        status: Arc<RwLock<RunStatus>>,
    ) -> Self {
        Self {
            run_id,
            tenant_id,
            plan,
            catalogs,
            registry,
            guardian,
            breakers,
            rate_limiter,
            approvals,
            cost,
            bus,
            clock,
            flags,
            deadlines,
            status,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Run one tool invocation through the full pipeline.
    pub async fn invoke(
        &self,
        turn_index: u32,
        requester_agent: &str,
        tool_name: &str,
        input: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolOutcome> {
        // 1. Plan permission.
        if !self.plan.tools_allowed.contains(tool_name) {
            return Err(AgoraError::ToolNotPermitted(tool_name.to_string()));
        }
        let spec = self
            .catalogs
            .tool(tool_name)
            .ok_or_else(|| AgoraError::ToolNotPermitted(tool_name.to_string()))?
            .clone();

        // 2. Schema validation.
        validate_input(&spec, &input)?;

        let input_hash = hash_text(&input.to_string());

        // Idempotency: the same (run, turn, input) executes at most once.
        if let Some(cached) = self
            .cache
            .lock()
            .expect("tool cache poisoned")
            .get(&(turn_index, input_hash.clone()))
        {
            let mut outcome = cached.clone();
            outcome.from_cache = true;
            self.emit(
                turn_index,
                RunEventPayload::ToolInvoked {
                    name: tool_name.to_string(),
                    input_hash: outcome.input_hash.clone(),
                    duration_ms: 0,
                    status: ToolInvocationStatus::Cached,
                },
            );
            return Ok(outcome);
        }

        // 3. Guardian gate on the input.
        let mut input = input;
        let mut escalate = false;
        match self.guardian.check_input(
            &input.to_string(),
            spec.safety_level,
            self.plan.risk_tier,
        ) {
            GuardianDecision::Allow => {}
            GuardianDecision::AllowWithRedaction { .. } => {
                input = redact_value(&self.guardian, input);
            }
            GuardianDecision::EscalateToHitl { reason } => {
                tracing::info!(tool = tool_name, %reason, "guardian escalated to HITL");
                escalate = true;
            }
            GuardianDecision::Reject { reason } => {
                return Err(AgoraError::ToolInputInvalid {
                    tool: tool_name.to_string(),
                    reason: format!("guardian rejected input: {reason}"),
                });
            }
        }

        // 4. HITL approval pause.
        let needs_approval = self.flags.hitl_enabled
            && (escalate || spec.safety_level == SafetyLevel::HitlRequired);
        if needs_approval {
            input = self
                .await_approval(turn_index, requester_agent, tool_name, input, cancel)
                .await?;
        }

        // 5. Breaker and rate-limit admission.
        let breaker = self.breakers.for_dependency(&format!("tool:{tool_name}"));
        if breaker.admit() == Admission::Reject {
            return Err(AgoraError::ToolUnavailable(tool_name.to_string()));
        }
        self.acquire_rate_slot(RateCategory::Tool, cancel).await?;

        // 6. Cost preflight. Free tools stay runnable after a hard budget
        // hit; everything else is blocked.
        let (est_tokens, est_usd) = spec.cost.estimate(&input);
        if !spec.cost.is_free() {
            self.cost
                .lock()
                .expect("cost tracker poisoned")
                .check_preflight(est_tokens, est_usd)?;
        }

        // 7. Execute under the tool deadline, with one retry for
        // effect-free tools on transient errors.
        let handler = self
            .registry
            .get(tool_name)
            .ok_or_else(|| AgoraError::ToolUnavailable(tool_name.to_string()))?;
        let started = self.clock.now_ms();
        let mut attempt: u32 = 0;
        let result = loop {
            match self.execute_once(&handler, input.clone(), cancel).await {
                Ok(value) => break value,
                Err(e) => {
                    let retryable =
                        e.is_transient() && spec.side_effects.retryable() && attempt < 1;
                    if !retryable {
                        breaker.record_failure(self.flags.strict_breaker);
                        self.emit(
                            turn_index,
                            RunEventPayload::ToolInvoked {
                                name: tool_name.to_string(),
                                input_hash: input_hash.clone(),
                                duration_ms: self.clock.now_ms().saturating_sub(started),
                                status: match e {
                                    AgoraError::ToolTimeout(_) => ToolInvocationStatus::TimedOut,
                                    _ => ToolInvocationStatus::Failed,
                                },
                            },
                        );
                        return Err(e);
                    }
                    attempt += 1;
                    let backoff = Duration::from_millis(
                        (200u64 << attempt).min(2_000) + rand::thread_rng().gen_range(0..50),
                    );
                    tracing::debug!(tool = tool_name, attempt, "transient tool error, retrying");
                    self.clock.sleep(backoff, cancel).await?;
                }
            }
        };
        breaker.record_success();
        let duration_ms = self.clock.now_ms().saturating_sub(started);

        // 8. Record the cost delta.
        let crossed = {
            let mut cost = self.cost.lock().expect("cost tracker poisoned");
            cost.record(CostLedgerEntry {
                turn: turn_index,
                agent: requester_agent.to_string(),
                tokens_in: est_tokens,
                tokens_out: 0,
                usd: est_usd,
                model: format!("tool:{tool_name}"),
            })
        };
        for kind in crossed {
            self.emit(turn_index, RunEventPayload::BudgetEvent { kind });
        }

        // 9. Guardian post-check on the output.
        let (result, status) = match self.guardian.check_output(&result.to_string()) {
            GuardianDecision::Allow => (result, ToolInvocationStatus::Ok),
            GuardianDecision::AllowWithRedaction { .. } => {
                (redact_value(&self.guardian, result), ToolInvocationStatus::Ok)
            }
            GuardianDecision::Reject { reason } | GuardianDecision::EscalateToHitl { reason } => {
                self.emit(
                    turn_index,
                    RunEventPayload::ToolInvoked {
                        name: tool_name.to_string(),
                        input_hash: input_hash.clone(),
                        duration_ms,
                        status: ToolInvocationStatus::Rejected,
                    },
                );
                return Err(AgoraError::ToolOutputRejected {
                    tool: tool_name.to_string(),
                    reason,
                });
            }
        };

        self.emit(
            turn_index,
            RunEventPayload::ToolInvoked {
                name: tool_name.to_string(),
                input_hash: input_hash.clone(),
                duration_ms,
                status,
            },
        );

        let outcome = ToolOutcome {
            output_hash: hash_text(&result.to_string()),
            result,
            input_hash: input_hash.clone(),
            duration_ms,
            from_cache: false,
        };
        self.cache
            .lock()
            .expect("tool cache poisoned")
            .insert((turn_index, input_hash), outcome.clone());
        Ok(outcome)
    }

    async fn execute_once(
        &self,
        handler: &Arc<dyn ToolHandler>,
        input: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let deadline = Duration::from_secs(self.deadlines.tool_secs);
        tokio::select! {
            _ = cancel.cancelled() => Err(AgoraError::Cancelled),
            outcome = tokio::time::timeout(deadline, handler.run(input, cancel)) => {
                match outcome {
                    Ok(result) => result,
                    Err(_) => Err(AgoraError::ToolTimeout("deadline exceeded".into())),
                }
            }
        }
    }

    /// Enqueue the approval, pause the run, and wait for the decision.
    /// Returns the (possibly modified) input to resume with.
    async fn await_approval(
        &self,
        turn_index: u32,
        requester_agent: &str,
        tool_name: &str,
        input: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let (totals, budget) = {
            let cost = self.cost.lock().expect("cost tracker poisoned");
            (cost.totals(), *cost.budget())
        };
        let input_hash = hash_text(&input.to_string());
        let record = self
            .approvals
            .request(
                ApprovalRequestDetails {
                    run_id: self.run_id.clone(),
                    turn_index,
                    requester_agent: requester_agent.to_string(),
                    action: format!("tool:{tool_name}"),
                    payload: input,
                    risk_level: self.plan.risk_tier,
                    context: serde_json::json!({
                        "tool": tool_name,
                        "input_hash": input_hash,
                        "budget_snapshot": {
                            "spent_usd_micros": totals.usd.0,
                            "spent_tokens": totals.total_tokens(),
                            "max_usd_micros": budget.max_usd.0,
                        },
                    }),
                },
                None,
            )
            .await?;

        self.emit(
            turn_index,
            RunEventPayload::ApprovalRequested {
                approval_id: record.id.clone(),
            },
        );

        self.set_status(RunStatus::PausedForApproval);
        let decision = self.approvals.await_decision(&record.id, cancel).await;
        self.set_status(RunStatus::Running);
        let decision = decision?;

        self.emit(
            turn_index,
            RunEventPayload::ApprovalResolved {
                approval_id: record.id.clone(),
                outcome: decision.outcome,
            },
        );

        match decision.outcome {
            ApprovalOutcome::Approved => Ok(decision.payload),
            ApprovalOutcome::Rejected => Err(AgoraError::ApprovalRejected {
                id: record.id,
                reason: decision.reason.unwrap_or_else(|| "rejected".to_string()),
            }),
            ApprovalOutcome::Expired => Err(AgoraError::ApprovalExpired(record.id)),
        }
    }

    /// Non-blocking bucket acquire with up to three jittered retries.
    async fn acquire_rate_slot(
        &self,
        category: RateCategory,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for attempt in 0..3u32 {
            match self.rate_limiter.try_acquire(&self.tenant_id, category) {
                Ok(()) => return Ok(()),
                Err(e) if attempt == 2 => return Err(e),
                Err(_) => {
                    let backoff = Duration::from_millis(
                        (100u64 << attempt) + rand::thread_rng().gen_range(0..100),
                    );
                    self.clock.sleep(backoff, cancel).await?;
                }
            }
        }
        unreachable!("loop returns on the last attempt")
    }

    fn set_status(&self, status: RunStatus) {
        *self.status.write().expect("status poisoned") = status;
    }

    fn emit(&self, turn_index: u32, payload: RunEventPayload) {
        self.bus.emit(turn_index, payload);
    }
}

/// Minimal schema validation: required field presence plus declared
/// property types.
fn validate_input(spec: &ToolSpec, input: &Value) -> Result<()> {
    let schema = &spec.input_schema;
    if schema.is_null() {
        return Ok(());
    }
    let object = input.as_object().ok_or_else(|| AgoraError::ToolInputInvalid {
        tool: spec.name.clone(),
        reason: "input must be a JSON object".into(),
    })?;

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for field in required.iter().filter_map(|f| f.as_str()) {
            if !object.contains_key(field) {
                return Err(AgoraError::ToolInputInvalid {
                    tool: spec.name.clone(),
                    reason: format!("missing required field `{field}`"),
                });
            }
        }
    }
    if let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) {
        for (field, declared) in properties {
            let Some(value) = object.get(field) else {
                continue;
            };
            let Some(expected) = declared.get("type").and_then(|t| t.as_str()) else {
                continue;
            };
            let matches = match expected {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !matches {
                return Err(AgoraError::ToolInputInvalid {
                    tool: spec.name.clone(),
                    reason: format!("field `{field}` must be a {expected}"),
                });
            }
        }
    }
    Ok(())
}

/// Walk a JSON value redacting every string leaf in place.
fn redact_value(guardian: &SafetyGuardian, value: Value) -> Value {
    match value {
        Value::String(text) => {
            let (redacted, _) = guardian.redact(&text);
            Value::String(redacted)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| redact_value(guardian, item))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, item)| (key, redact_value(guardian, item)))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::catalog::{default_tools, CatalogRegistry};
    use agora_core::clock::ManualClock;
    use agora_core::config::{BreakerConfig, HitlConfig, RateLimitConfig};
    use agora_types::{Budget, FinalizerPolicy, ModelKnobs, Rationale, RiskTier, SourceKind, UsdMicros};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct ScriptedHandler {
        calls: AtomicUsize,
        fail_first: bool,
        response: Value,
    }

    #[async_trait]
    impl ToolHandler for ScriptedHandler {
        async fn run(&self, _input: Value, _cancel: &CancellationToken) -> Result<Value> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && call == 0 {
                return Err(AgoraError::Retriever("transient backend blip".into()));
            }
            Ok(self.response.clone())
        }
    }

    fn plan(tools: &[&str]) -> DecisionPlan {
        DecisionPlan {
            sources: vec![SourceKind::LlmOnly],
            tools_allowed: tools.iter().map(|t| t.to_string()).collect(),
            model: "std-small".into(),
            knobs: ModelKnobs::default(),
            max_turns: 3,
            budget: Budget::new(UsdMicros(1_000_000), 100_000, 1_000),
            participants: vec!["finance".into()],
            risk_tier: RiskTier::Medium,
            rationale: Rationale {
                reasons: vec![],
                confidence: 0.9,
            },
            finalizer: FinalizerPolicy::InternalReducer,
            catalog_version: 1,
        }
    }

    struct Fixture {
        executor: ToolExecutor,
        clock: ManualClock,
        _store_dir: tempfile::TempDir,
    }

    fn fixture(plan: DecisionPlan, registry: ToolRegistry, flags: FeatureFlags) -> Fixture {
        let clock = ManualClock::new(1_000);
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
        let store_dir = tempdir().unwrap();
        let approvals = ApprovalStore::open(
            store_dir.path(),
            HitlConfig::default(),
            clock_arc.clone(),
        )
        .unwrap();
        let catalogs = CatalogRegistry::new(vec![], default_tools());
        let executor = ToolExecutor::new(
            "run-1".into(),
            "acme".into(),
            Arc::new(plan),
            catalogs.snapshot(),
            Arc::new(registry),
            Arc::new(SafetyGuardian::new()),
            BreakerRegistry::new(BreakerConfig::default(), clock_arc.clone()),
            RateLimiter::new(RateLimitConfig::default(), clock_arc.clone()),
            approvals,
            Arc::new(Mutex::new(CostTracker::new(Budget::new(
                UsdMicros(1_000_000),
                100_000,
                1_000,
            )))),
            Arc::new(RunEventBus::new("run-1", clock_arc.clone())),
            clock_arc,
            flags,
            Deadlines {
                run_secs: 60,
                turn_secs: 30,
                tool_secs: 5,
                model_secs: 10,
            },
            Arc::new(RwLock::new(RunStatus::Running)),
        );
        Fixture {
            executor,
            clock,
            _store_dir: store_dir,
        }
    }

    #[tokio::test]
    async fn unlisted_tool_is_not_permitted() {
        let fixture = fixture(plan(&["calculator"]), ToolRegistry::new(), FeatureFlags::default());
        let err = fixture
            .executor
            .invoke(0, "finance", "web_search", json!({"query": "x"}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgoraError::ToolNotPermitted(_)));
    }

    #[tokio::test]
    async fn missing_required_field_is_invalid() {
        let fixture = fixture(plan(&["calculator"]), ToolRegistry::new(), FeatureFlags::default());
        let err = fixture
            .executor
            .invoke(0, "finance", "calculator", json!({"wrong": 1}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgoraError::ToolInputInvalid { .. }));
    }

    #[tokio::test]
    async fn successful_invocation_is_cached_per_turn() {
        let mut registry = ToolRegistry::new();
        registry.register(
            "calculator",
            Arc::new(ScriptedHandler {
                calls: AtomicUsize::new(0),
                fail_first: false,
                response: json!({"value": 42}),
            }),
        );
        let fixture = fixture(plan(&["calculator"]), registry, FeatureFlags::default());

        let input = json!({"expression": "6*7"});
        let first = fixture
            .executor
            .invoke(1, "finance", "calculator", input.clone(), &CancellationToken::new())
            .await
            .unwrap();
        let second = fixture
            .executor
            .invoke(1, "finance", "calculator", input, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(first.output_hash, second.output_hash);
    }

    #[tokio::test]
    async fn transient_errors_retry_once_for_read_tools() {
        let handler = Arc::new(ScriptedHandler {
            calls: AtomicUsize::new(0),
            fail_first: true,
            response: json!({"rows": []}),
        });
        let mut registry = ToolRegistry::new();
        registry.register("db_query", handler.clone());
        let fixture = fixture(plan(&["db_query"]), registry, FeatureFlags::default());

        let clock = fixture.clock.clone();
        let ticker = tokio::spawn(async move {
            for _ in 0..100 {
                tokio::task::yield_now().await;
                clock.advance(Duration::from_millis(300));
            }
        });
        let outcome = fixture
            .executor
            .invoke(0, "finance", "db_query", json!({"query": "select 1"}), &CancellationToken::new())
            .await
            .unwrap();
        ticker.abort();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.result, json!({"rows": []}));
    }

    #[tokio::test]
    async fn hitl_tool_requires_approval_and_resumes() {
        let mut registry = ToolRegistry::new();
        registry.register(
            "send_notification",
            Arc::new(ScriptedHandler {
                calls: AtomicUsize::new(0),
                fail_first: false,
                response: json!({"delivered": true}),
            }),
        );
        let fixture = fixture(plan(&["send_notification"]), registry, FeatureFlags::default());
        let approvals = fixture.executor.approvals.clone();
        let status = fixture.executor.status.clone();

        let decider = tokio::spawn(async move {
            // Wait until the run is actually paused on a pending approval,
            // then approve it.
            loop {
                let paused = *status.read().unwrap() == RunStatus::PausedForApproval;
                let pending = approvals
                    .list(agora_core::approvals::ApprovalFilter {
                        status: Some(agora_core::approvals::ApprovalStatus::Pending),
                        ..Default::default()
                    })
                    .await;
                if paused {
                    if let Some(record) = pending.first() {
                        approvals
                            .decide(&record.id, ApprovalOutcome::Approved, None, "alice")
                            .await
                            .unwrap();
                        break;
                    }
                }
                tokio::task::yield_now().await;
            }
        });

        let outcome = fixture
            .executor
            .invoke(
                0,
                "finance",
                "send_notification",
                json!({"channel": "ops", "body": "deploy done"}),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        decider.await.unwrap();

        assert_eq!(outcome.result, json!({"delivered": true}));
        assert_eq!(*fixture.executor.status.read().unwrap(), RunStatus::Running);
    }

    #[tokio::test]
    async fn rejected_approval_fails_the_call() {
        let mut registry = ToolRegistry::new();
        registry.register(
            "send_notification",
            Arc::new(ScriptedHandler {
                calls: AtomicUsize::new(0),
                fail_first: false,
                response: json!({"delivered": true}),
            }),
        );
        let fixture = fixture(plan(&["send_notification"]), registry, FeatureFlags::default());
        let approvals = fixture.executor.approvals.clone();

        let decider = tokio::spawn(async move {
            loop {
                let pending = approvals
                    .list(agora_core::approvals::ApprovalFilter::default())
                    .await;
                if let Some(record) = pending.first() {
                    approvals
                        .decide(
                            &record.id,
                            ApprovalOutcome::Rejected,
                            Some("not during the freeze".into()),
                            "alice",
                        )
                        .await
                        .unwrap();
                    break;
                }
                tokio::task::yield_now().await;
            }
        });

        let err = fixture
            .executor
            .invoke(
                0,
                "finance",
                "send_notification",
                json!({"channel": "ops", "body": "deploy"}),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        decider.await.unwrap();
        assert!(matches!(err, AgoraError::ApprovalRejected { .. }));
    }

    #[tokio::test]
    async fn breaker_open_fails_fast() {
        let mut registry = ToolRegistry::new();
        registry.register(
            "db_query",
            Arc::new(ScriptedHandler {
                calls: AtomicUsize::new(0),
                fail_first: false,
                response: json!({"rows": []}),
            }),
        );
        let fixture = fixture(plan(&["db_query"]), registry, FeatureFlags::default());

        let breaker = fixture.executor.breakers.for_dependency("tool:db_query");
        for _ in 0..BreakerConfig::default().failure_threshold {
            breaker.record_failure(false);
        }

        let err = fixture
            .executor
            .invoke(0, "finance", "db_query", json!({"query": "select 1"}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgoraError::ToolUnavailable(_)));
    }

    #[tokio::test]
    async fn budget_preflight_blocks_expensive_tools() {
        let mut registry = ToolRegistry::new();
        registry.register(
            "db_query",
            Arc::new(ScriptedHandler {
                calls: AtomicUsize::new(0),
                fail_first: false,
                response: json!({"rows": []}),
            }),
        );
        let fixture = fixture(plan(&["db_query"]), registry, FeatureFlags::default());
        {
            let mut cost = fixture.executor.cost.lock().unwrap();
            cost.record(CostLedgerEntry {
                turn: 0,
                agent: "finance".into(),
                tokens_in: 0,
                tokens_out: 0,
                usd: UsdMicros(1_000_000),
                model: "std-small".into(),
            });
        }

        let err = fixture
            .executor
            .invoke(0, "finance", "db_query", json!({"query": "select 1"}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgoraError::BudgetExceeded(_)));
    }

    #[tokio::test]
    async fn pii_in_output_is_redacted() {
        let mut registry = ToolRegistry::new();
        registry.register(
            "db_query",
            Arc::new(ScriptedHandler {
                calls: AtomicUsize::new(0),
                fail_first: false,
                response: json!({"rows": ["contact: jane@example.com"]}),
            }),
        );
        let fixture = fixture(plan(&["db_query"]), registry, FeatureFlags::default());

        let outcome = fixture
            .executor
            .invoke(0, "finance", "db_query", json!({"query": "select email"}), &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.result.to_string().contains("[REDACTED:email]"));
    }
}
