// Group-chat engine
// Drives one run: select a speaker, inject per-turn context, stream the
// model, hand off tool calls, track cost, detect conflicts, terminate and
// finalize. Logically single-threaded per run; every blocking call observes
// the run's cancellation token.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use agora_core::approvals::ApprovalStore;
use agora_core::breaker::{Admission, BreakerRegistry};
use agora_core::capabilities::{LlmChunk, LlmClient, Retriever, UsageReport};
use agora_core::catalog::CatalogSnapshot;
use agora_core::clock::Clock;
use agora_core::config::{EngineConfig, FeatureFlags};
use agora_core::conflict::ConflictDetector;
use agora_core::cost::CostTracker;
use agora_core::event_bus::RunEventBus;
use agora_core::guardian::{GuardianDecision, SafetyGuardian};
use agora_core::rate_limit::{RateCategory, RateLimiter};
use agora_core::scratchpad::{approx_tokens, extract_notes, NoteKind, Scratchpad, ScratchpadNote};
use agora_types::{
    AgoraError, CostLedgerEntry, CostTotals, DecisionPlan, FinalizerPolicy, Message,
    ModelErrorKind, Request, Result, Role, RunEventPayload, RunStatus, SafetyLevel, UsdMicros,
};

use crate::rag::RagInjector;
use crate::selector::{SpeakerSelector, TurnView};
use crate::tools::{ToolExecutor, ToolRegistry};

/// How many trailing messages the speaker prompt carries.
const HISTORY_WINDOW: usize = 12;
/// Streamed tokens per intermediate `token_delta` batch.
const TOKEN_BATCH: usize = 32;
/// Consecutive failed turns before the run gives up.
const MAX_CONSECUTIVE_TURN_FAILURES: u32 = 2;

/// Injected dependencies shared by every run.
#[derive(Clone)]
pub struct RunDeps {
    pub llm: Arc<dyn LlmClient>,
    pub retriever: Arc<dyn Retriever>,
    pub tool_registry: Arc<ToolRegistry>,
    pub guardian: Arc<SafetyGuardian>,
    pub breakers: BreakerRegistry,
    pub rate_limiter: RateLimiter,
    pub approvals: ApprovalStore,
    pub clock: Arc<dyn Clock>,
}

/// Mutable state owned by the engine for the duration of the run.
struct RunState {
    turn_index: u32,
    speaker_history: Vec<String>,
    messages: Vec<Message>,
    scratchpad: Scratchpad,
    conflict_recent: bool,
    consecutive_turn_failures: u32,
}

/// What the engine hands back to the runner once the run is over.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub summary: Option<String>,
    pub cost_totals: CostTotals,
    pub message_count: usize,
    pub turn_index: u32,
    pub warnings: Vec<String>,
}

pub struct GroupChatEngine {
    request: Request,
    plan: Arc<DecisionPlan>,
    config: EngineConfig,
    flags: FeatureFlags,
    catalogs: Arc<CatalogSnapshot>,
    deps: RunDeps,
    bus: Arc<RunEventBus>,
    cancel: CancellationToken,
    status: Arc<RwLock<RunStatus>>,
    cost: Arc<Mutex<CostTracker>>,
    executor: ToolExecutor,
    rag: RagInjector,
    selector: SpeakerSelector,
    conflict: ConflictDetector,
    state: RunState,
    started_ms: u64,
}

impl GroupChatEngine {
    pub fn new(
        request: Request,
        plan: DecisionPlan,
        config: EngineConfig,
        flags: FeatureFlags,
        catalogs: Arc<CatalogSnapshot>,
        deps: RunDeps,
        bus: Arc<RunEventBus>,
        cancel: CancellationToken,
        status: Arc<RwLock<RunStatus>>,
    ) -> Self {
        let plan = Arc::new(plan);
        let cost = Arc::new(Mutex::new(CostTracker::new(plan.budget)));
        let executor = ToolExecutor::new(
            request.run_id.clone(),
            request.tenant_id.clone(),
            plan.clone(),
            catalogs.clone(),
            deps.tool_registry.clone(),
            deps.guardian.clone(),
            deps.breakers.clone(),
            deps.rate_limiter.clone(),
            deps.approvals.clone(),
            cost.clone(),
            bus.clone(),
            deps.clock.clone(),
            flags.clone(),
            config.deadlines,
            status.clone(),
        );
        let rag = RagInjector::new(
            deps.retriever.clone(),
            deps.breakers.clone(),
            deps.clock.clone(),
            config.rag.clone(),
            flags.strict_breaker,
        );
        let selector = SpeakerSelector::new(config.selector_weights, config.selector_window);
        let conflict = ConflictDetector::new(config.conflict_epsilon);
        let started_ms = deps.clock.now_ms();

        let mut messages = request.history.clone();
        messages.push(Message::user(request.message.clone()));

        Self {
            request,
            plan,
            flags,
            catalogs,
            deps,
            bus,
            cancel,
            status,
            cost,
            executor,
            rag,
            selector,
            conflict,
            state: RunState {
                turn_index: 0,
                speaker_history: Vec::new(),
                messages,
                scratchpad: Scratchpad::new(config.scratchpad_max_tokens),
                conflict_recent: false,
                consecutive_turn_failures: 0,
            },
            config,
            started_ms,
        }
    }

    /// Drive the run to completion. Never panics; every failure path ends
    /// in a terminal event.
    pub async fn run(mut self) -> RunReport {
        self.bus.emit(
            0,
            RunEventPayload::DecisionMade {
                plan: (*self.plan).clone(),
            },
        );

        let mut failure: Option<AgoraError> = None;
        let mut cancelled = false;

        loop {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            if self.run_deadline_exceeded() {
                failure = Some(AgoraError::DeadlineExceeded("run deadline".into()));
                break;
            }

            let hard_hit = self.cost.lock().expect("cost poisoned").hard_hit();
            let view = TurnView {
                turn_index: self.state.turn_index,
                speaker_history: &self.state.speaker_history,
                messages: &self.state.messages,
                conflict_recent: self.state.conflict_recent,
                remaining_budget_fraction: self
                    .cost
                    .lock()
                    .expect("cost poisoned")
                    .remaining_fraction(),
            };
            if let Some(reason) = self.selector.should_terminate(&view, &self.plan, hard_hit) {
                tracing::debug!(run = %self.request.run_id, ?reason, "terminating turn loop");
                break;
            }

            let (speaker, scores) = match self.selector.select(&view, &self.plan, &self.catalogs) {
                Ok(selected) => selected,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            self.bus.emit(
                self.state.turn_index,
                RunEventPayload::SpeakerSelected {
                    agent: speaker.clone(),
                    scores,
                },
            );
            // Conflict elevation is consumed by the selection it influenced.
            self.state.conflict_recent = false;

            let turn_deadline = Duration::from_secs(self.config.deadlines.turn_secs);
            let cancel = self.cancel.clone();
            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(AgoraError::Cancelled),
                outcome = tokio::time::timeout(turn_deadline, self.take_turn(speaker.clone())) => {
                    outcome.unwrap_or(Err(AgoraError::DeadlineExceeded("turn deadline".into())))
                }
            };

            self.state.speaker_history.push(speaker.clone());
            self.state.turn_index += 1;

            match outcome {
                Ok(()) => {
                    self.state.consecutive_turn_failures = 0;
                }
                Err(AgoraError::Cancelled) => {
                    cancelled = true;
                    break;
                }
                Err(e) if e.is_run_fatal() => {
                    failure = Some(e);
                    break;
                }
                Err(e) if e.is_policy() => {
                    // Never retried; the refusal is recorded and the
                    // discussion moves on.
                    self.state.scratchpad.append(ScratchpadNote {
                        turn: self.state.turn_index,
                        agent: speaker.clone(),
                        kind: NoteKind::Decision,
                        text: format!("safe refusal recorded: {e}"),
                        refs: Vec::new(),
                    });
                }
                Err(
                    e @ (AgoraError::ApprovalRejected { .. }
                    | AgoraError::ApprovalExpired(_)
                    | AgoraError::BudgetExceeded(_)),
                ) => {
                    // Turn-local: note the reason and let the selector try
                    // a different path.
                    self.state.scratchpad.append(ScratchpadNote {
                        turn: self.state.turn_index,
                        agent: speaker.clone(),
                        kind: NoteKind::Decision,
                        text: format!("blocked action: {e}"),
                        refs: Vec::new(),
                    });
                }
                Err(e) => {
                    tracing::warn!(run = %self.request.run_id, turn = self.state.turn_index, "turn failed: {e}");
                    self.state.consecutive_turn_failures += 1;
                    if self.state.consecutive_turn_failures >= MAX_CONSECUTIVE_TURN_FAILURES {
                        failure = Some(e);
                        break;
                    }
                }
            }
        }

        self.finalize(cancelled, failure).await
    }

    fn run_deadline_exceeded(&self) -> bool {
        let elapsed_ms = self.deps.clock.now_ms().saturating_sub(self.started_ms);
        elapsed_ms > self.config.deadlines.run_secs * 1_000
    }

    /// One speaker turn: optional RAG, then a model-call loop that hands
    /// tool requests to the executor, capped by `max_tool_calls_per_turn`.
    async fn take_turn(&mut self, speaker: String) -> Result<()> {
        let agent = self
            .catalogs
            .agent(&speaker)
            .ok_or_else(|| AgoraError::Internal(format!("speaker `{speaker}` left the catalog")))?
            .clone();

        let rag_note = if self.flags.rag_per_turn && self.plan.sources.iter().any(|s| {
            !matches!(s, agora_types::SourceKind::LlmOnly)
        }) {
            let outcome = self
                .rag
                .inject(&self.state.messages, &agent.system_prompt, &self.cancel)
                .await;
            self.bus.emit(
                self.state.turn_index,
                RunEventPayload::RagInjected {
                    chunks: outcome.chunks.clone(),
                    cache_hit: outcome.cache_hit,
                    latency_ms: outcome.latency_ms,
                    error: outcome.error.clone(),
                },
            );
            outcome.note
        } else {
            None
        };

        // Guardian pre-call check on the newest conversational input.
        if let Some(last) = self.state.messages.last() {
            match self
                .deps
                .guardian
                .check_input(&last.content, SafetyLevel::Safe, self.plan.risk_tier)
            {
                GuardianDecision::Reject { reason } => {
                    return Err(AgoraError::Model {
                        kind: ModelErrorKind::Policy,
                        detail: format!("guardian blocked prompt: {reason}"),
                    });
                }
                GuardianDecision::EscalateToHitl { reason } => {
                    tracing::warn!(run = %self.request.run_id, %reason, "suspicious prompt; continuing under critic review");
                    self.state.conflict_recent = true;
                }
                _ => {}
            }
        }

        let mut tool_calls = 0u32;
        loop {
            let prompt = self.assemble_prompt(&agent.system_prompt, rag_note.as_deref());
            let turn_text = self.model_call(&speaker, &prompt).await?;

            match turn_text {
                ModelTurn::ToolCall { name, input } => {
                    if tool_calls >= self.config.max_tool_calls_per_turn {
                        // Bound the loop: close the turn instead of asking
                        // the model again.
                        tracing::warn!(run = %self.request.run_id, tool = %name, "tool call cap reached; closing turn");
                        let text = format!(
                            "(turn truncated: tool call limit reached before `{name}` could run)"
                        );
                        self.append_message(Message::agent(&speaker, text));
                        return Ok(());
                    }
                    tool_calls += 1;
                    match self
                        .executor
                        .invoke(self.state.turn_index, &speaker, &name, input, &self.cancel)
                        .await
                    {
                        Ok(outcome) => {
                            let message =
                                Message::tool(&name, outcome.result.to_string());
                            self.append_message(message);
                        }
                        Err(e) => {
                            // Approval outcomes and run-fatal errors bubble
                            // up; other failures are surfaced to the model
                            // and the turn continues.
                            if e.is_run_fatal()
                                || matches!(
                                    e,
                                    AgoraError::ApprovalRejected { .. }
                                        | AgoraError::ApprovalExpired(_)
                                )
                            {
                                return Err(e);
                            }
                            let message = Message::tool(
                                &name,
                                format!("tool `{name}` failed: {e}"),
                            );
                            self.append_message(message);
                        }
                    }
                }
                ModelTurn::Final(text) => {
                    let message = Message::agent(&speaker, text.clone());
                    self.append_message(message);
                    self.state
                        .scratchpad
                        .append_all(extract_notes(self.state.turn_index, &speaker, &text));
                    if self.flags.conflict_detection {
                        self.detect_conflict(&speaker, &text);
                    }
                    return Ok(());
                }
            }
        }
    }

    fn detect_conflict(&mut self, speaker: &str, text: &str) {
        let history = &self.state.messages[..self.state.messages.len().saturating_sub(1)];
        if let Some(finding) = self.conflict.inspect(speaker, text, history) {
            tracing::info!(run = %self.request.run_id, kind = ?finding.kind, "conflict detected");
            self.bus.emit(
                self.state.turn_index,
                RunEventPayload::ConflictDetected {
                    agents: finding.agents,
                    kind: finding.kind,
                    excerpt: finding.excerpt,
                },
            );
            self.state.conflict_recent = true;
        }
    }

    fn append_message(&mut self, message: Message) {
        self.bus.emit(
            self.state.turn_index,
            RunEventPayload::MessageAppended {
                message: message.clone(),
            },
        );
        self.state.messages.push(message);
    }

    fn assemble_prompt(&self, system_prompt: &str, rag_note: Option<&str>) -> Vec<Message> {
        let mut prompt = vec![Message::system(system_prompt)];
        let pad = self.state.scratchpad.summary_text(256);
        if !pad.is_empty() {
            prompt.push(Message::system(format!("Shared scratchpad:\n{pad}")));
        }
        if let Some(note) = rag_note {
            prompt.push(Message::system(note));
        }
        let tail_start = self.state.messages.len().saturating_sub(HISTORY_WINDOW);
        prompt.extend(self.state.messages[tail_start..].iter().cloned());
        prompt
    }

    /// One model call with breaker + rate-limit admission and bounded
    /// transient retries. Streams token deltas while consuming.
    async fn model_call(&self, speaker: &str, prompt: &[Message]) -> Result<ModelTurn> {
        if self.cost.lock().expect("cost poisoned").hard_hit() {
            return Err(AgoraError::BudgetExceeded(
                "hard budget threshold reached; no further model calls".into(),
            ));
        }

        let breaker = self.deps.breakers.for_dependency("model");
        if breaker.admit() == Admission::Reject {
            return Err(AgoraError::Model {
                kind: ModelErrorKind::Unavailable,
                detail: "model circuit breaker is open".into(),
            });
        }
        self.acquire_model_slot().await?;

        let mut attempt = 0u32;
        loop {
            let result = self.stream_model_once(speaker, prompt).await;
            match result {
                Ok(turn) => {
                    breaker.record_success();
                    return Ok(turn);
                }
                Err(e) => {
                    breaker.record_failure(self.flags.strict_breaker);
                    let retryable = e.is_transient() && attempt < 2;
                    if !retryable {
                        return Err(e);
                    }
                    attempt += 1;
                    let backoff = Duration::from_millis(
                        (200u64 << attempt).min(2_000) + rand::thread_rng().gen_range(0..50),
                    );
                    self.deps.clock.sleep(backoff, &self.cancel).await?;
                }
            }
        }
    }

    async fn stream_model_once(&self, speaker: &str, prompt: &[Message]) -> Result<ModelTurn> {
        let deadline = Duration::from_secs(self.config.deadlines.model_secs);
        let generate = async {
            let mut stream = self
                .deps
                .llm
                .generate(prompt, &self.plan.model, &self.plan.knobs, &self.cancel)
                .await?;

            let mut text = String::new();
            let mut streamed_tokens = 0u64;
            let mut batch = 0usize;
            let mut usage: Option<UsageReport> = None;
            let mut tool_call: Option<(String, serde_json::Value)> = None;

            while let Some(chunk) = stream.next().await {
                if self.cancel.is_cancelled() {
                    return Err(AgoraError::Cancelled);
                }
                match chunk? {
                    LlmChunk::Token(token) => {
                        text.push_str(&token);
                        batch += 1;
                        if self.flags.verbose_streaming && batch >= TOKEN_BATCH {
                            streamed_tokens += batch as u64;
                            self.bus.emit(
                                self.state.turn_index,
                                RunEventPayload::TokenDelta {
                                    agent: speaker.to_string(),
                                    tokens_in: 0,
                                    tokens_out: batch as u64,
                                    usd: UsdMicros::ZERO,
                                },
                            );
                            batch = 0;
                        }
                    }
                    LlmChunk::ToolCall { name, input } => {
                        tool_call = Some((name, input));
                    }
                    LlmChunk::Done { usage: report } => {
                        usage = Some(report);
                    }
                }
            }

            let usage = usage.unwrap_or_default();
            let (tokens_in, tokens_out) = if usage.reported {
                (usage.tokens_in, usage.tokens_out)
            } else {
                let prompt_text: String =
                    prompt.iter().map(|m| m.content.as_str()).collect::<Vec<_>>().join("\n");
                (approx_tokens(&prompt_text), approx_tokens(&text).max(1))
            };
            let usd = self.call_cost(tokens_in, tokens_out);

            // Final delta carries the usage report; the remainder keeps
            // summed tokens_out consistent with streamed batches.
            self.bus.emit(
                self.state.turn_index,
                RunEventPayload::TokenDelta {
                    agent: speaker.to_string(),
                    tokens_in,
                    tokens_out: tokens_out.saturating_sub(streamed_tokens),
                    usd,
                },
            );

            let crossed = {
                let mut cost = self.cost.lock().expect("cost poisoned");
                cost.record(CostLedgerEntry {
                    turn: self.state.turn_index,
                    agent: speaker.to_string(),
                    tokens_in,
                    tokens_out,
                    usd,
                    model: self.plan.model.clone(),
                })
            };
            for kind in crossed {
                self.bus
                    .emit(self.state.turn_index, RunEventPayload::BudgetEvent { kind });
            }

            match tool_call {
                Some((name, input)) => Ok(ModelTurn::ToolCall { name, input }),
                None => Ok(ModelTurn::Final(text)),
            }
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Err(AgoraError::Cancelled),
            outcome = tokio::time::timeout(deadline, generate) => {
                outcome.unwrap_or(Err(AgoraError::DeadlineExceeded("model deadline".into())))
            }
        }
    }

    fn call_cost(&self, tokens_in: u64, tokens_out: u64) -> UsdMicros {
        match self.config.rate_for(&self.plan.model) {
            Some(rate) => UsdMicros(
                tokens_in * rate.usd_micros_per_1k_tokens_in / 1_000
                    + tokens_out * rate.usd_micros_per_1k_tokens_out / 1_000,
            ),
            None => UsdMicros::ZERO,
        }
    }

    async fn acquire_model_slot(&self) -> Result<()> {
        for attempt in 0..3u32 {
            match self
                .deps
                .rate_limiter
                .try_acquire(&self.request.tenant_id, RateCategory::Model)
            {
                Ok(()) => return Ok(()),
                Err(e) if attempt == 2 => return Err(e),
                Err(_) => {
                    let backoff = Duration::from_millis(
                        (100u64 << attempt) + rand::thread_rng().gen_range(0..100),
                    );
                    self.deps.clock.sleep(backoff, &self.cancel).await?;
                }
            }
        }
        unreachable!("loop returns on the last attempt")
    }

    /// Produce the final answer and the terminal event.
    async fn finalize(self, cancelled: bool, failure: Option<AgoraError>) -> RunReport {
        let warnings = self.cost.lock().expect("cost poisoned").soft_warnings();
        let has_messages = self
            .state
            .messages
            .iter()
            .any(|m| matches!(m.role, Role::Agent(_) | Role::Assistant));

        if let Some(error) = failure {
            let partial = has_messages.then(|| self.reduce_summary(&warnings));
            self.bus.emit(
                self.state.turn_index,
                RunEventPayload::RunFailed {
                    error_kind: error.kind().to_string(),
                    detail: error.to_string(),
                    partial_summary: partial.clone(),
                },
            );
            self.set_status(RunStatus::Failed);
            self.bus.close();
            return self.report(RunStatus::Failed, partial, warnings);
        }

        // Synthesizer runs only when the budget still allows a model call
        // and the run was not cancelled mid-flight.
        let hard_hit = self.cost.lock().expect("cost poisoned").hard_hit();
        let summary = match (&self.plan.finalizer, cancelled || hard_hit) {
            (FinalizerPolicy::Synthesizer { agent }, false) => {
                match self.synthesize(agent.clone()).await {
                    Ok(summary) => summary,
                    Err(e) => {
                        tracing::warn!(run = %self.request.run_id, "synthesizer failed, using reducer: {e}");
                        self.reduce_summary(&warnings)
                    }
                }
            }
            _ => self.reduce_summary(&warnings),
        };

        let status = if cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };
        self.bus.emit(
            self.state.turn_index,
            RunEventPayload::RunCompleted {
                summary: summary.clone(),
                cancelled,
                warnings: warnings.clone(),
            },
        );
        self.set_status(status);
        self.bus.close();
        self.report(status, Some(summary), warnings)
    }

    /// Deterministic fallback finalizer: decisions from the scratchpad plus
    /// the last agent contribution.
    fn reduce_summary(&self, warnings: &[String]) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(last) = self
            .state
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::Agent(_)))
        {
            parts.push(last.content.replace(crate::selector::FINALIZE_MARKER, "").trim().to_string());
        }
        let decisions: Vec<String> = self
            .state
            .scratchpad
            .decisions()
            .map(|note| format!("- {}", note.text))
            .collect();
        if !decisions.is_empty() {
            parts.push(format!("Decisions:\n{}", decisions.join("\n")));
        }
        if !warnings.is_empty() {
            parts.push(format!("Warnings:\n{}", warnings.join("\n")));
        }
        if parts.is_empty() {
            parts.push("No substantive discussion took place.".to_string());
        }
        parts.join("\n\n")
    }

    /// Ask the synthesizer agent for the user-facing answer; no tools.
    async fn synthesize(&self, agent_name: String) -> Result<String> {
        let agent = self
            .catalogs
            .agent(&agent_name)
            .ok_or_else(|| AgoraError::Internal(format!("synthesizer `{agent_name}` missing")))?;
        let prompt = self.assemble_prompt(&agent.system_prompt, None);
        match self.model_call(&agent_name, &prompt).await? {
            ModelTurn::Final(text) if !text.trim().is_empty() => Ok(text),
            _ => Err(AgoraError::Internal("synthesizer produced no text".into())),
        }
    }

    fn set_status(&self, status: RunStatus) {
        *self.status.write().expect("status poisoned") = status;
    }

    fn report(
        &self,
        status: RunStatus,
        summary: Option<String>,
        warnings: Vec<String>,
    ) -> RunReport {
        RunReport {
            run_id: self.request.run_id.clone(),
            status,
            summary,
            cost_totals: self.cost.lock().expect("cost poisoned").totals(),
            message_count: self.state.messages.len(),
            turn_index: self.state.turn_index,
            warnings,
        }
    }
}

/// What one model call produced.
enum ModelTurn {
    ToolCall { name: String, input: serde_json::Value },
    Final(String),
}
