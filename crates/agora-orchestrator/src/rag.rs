// Per-turn RAG injector
// Builds a query from the tail of the conversation plus the speaker's role
// bias, retrieves scored chunks, dedups by content hash within the run, and
// caps the injected tokens. Retrieval failures never fail the turn.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use agora_core::breaker::{Admission, BreakerRegistry};
use agora_core::capabilities::{RetrievedChunk, Retriever};
use agora_core::clock::Clock;
use agora_core::config::RagConfig;
use agora_core::scratchpad::approx_tokens;
use agora_types::{AgoraError, Message, RagChunkMeta, Result, Role};

/// Upper bound on query tokens before truncation.
const QUERY_MAX_TOKENS: u64 = 256;

/// What one injection attempt produced. The note (if any) is visible to the
/// speaker for this turn only; the metadata feeds the `rag_injected` event.
#[derive(Debug, Clone)]
pub struct RagOutcome {
    pub note: Option<String>,
    pub chunks: Vec<RagChunkMeta>,
    pub cache_hit: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

struct CacheEntry {
    chunks: Vec<RetrievedChunk>,
    cached_at_ms: u64,
}

/// Per-run injector: the dedup set and cache live for the run's lifetime.
pub struct RagInjector {
    retriever: Arc<dyn Retriever>,
    breakers: BreakerRegistry,
    clock: Arc<dyn Clock>,
    config: RagConfig,
    strict_breaker: bool,
    /// content hash -> best score injected so far this run.
    seen: HashMap<String, f64>,
    cache: HashMap<String, CacheEntry>,
}

impl RagInjector {
    pub fn new(
        retriever: Arc<dyn Retriever>,
        breakers: BreakerRegistry,
        clock: Arc<dyn Clock>,
        config: RagConfig,
        strict_breaker: bool,
    ) -> Self {
        Self {
            retriever,
            breakers,
            clock,
            config,
            strict_breaker,
            seen: HashMap::new(),
            cache: HashMap::new(),
        }
    }

    /// Retrieve and format the context note for one turn.
    pub async fn inject(
        &mut self,
        messages: &[Message],
        speaker_role_bias: &str,
        cancel: &CancellationToken,
    ) -> RagOutcome {
        let query = build_query(messages, speaker_role_bias);
        let query_hash = hash_text(&query);
        let started = self.clock.now_ms();

        let (chunks, cache_hit, error) = match self.cached(&query_hash) {
            Some(chunks) => (chunks, true, None),
            None => match self.retrieve(&query, cancel).await {
                Ok(chunks) => {
                    self.cache.insert(
                        query_hash.clone(),
                        CacheEntry {
                            chunks: chunks.clone(),
                            cached_at_ms: self.clock.now_ms(),
                        },
                    );
                    (chunks, false, None)
                }
                Err(e) => {
                    tracing::warn!("retrieval failed, continuing without context: {e}");
                    (Vec::new(), false, Some(e.to_string()))
                }
            },
        };

        let latency_ms = self.clock.now_ms().saturating_sub(started);

        let mut accepted: Vec<&RetrievedChunk> = Vec::new();
        let mut used_tokens = 0u64;
        for chunk in &chunks {
            let score = chunk.score.clamp(0.0, 1.0);
            if score < self.config.score_threshold {
                continue;
            }
            // Within a run, a chunk is injected at most once unless its
            // score improves materially.
            if let Some(best) = self.seen.get(&chunk.hash) {
                if score < best + self.config.rescore_delta {
                    continue;
                }
            }
            let cost = approx_tokens(&chunk.content);
            if used_tokens + cost > self.config.per_turn_max_tokens {
                continue;
            }
            used_tokens += cost;
            accepted.push(chunk);
        }
        for chunk in &accepted {
            self.seen
                .insert(chunk.hash.clone(), chunk.score.clamp(0.0, 1.0));
        }

        let note = if accepted.is_empty() {
            None
        } else {
            let mut note = String::from("Relevant retrieved context for this turn:\n");
            for chunk in &accepted {
                note.push_str(&format!("- [{}] {}\n", chunk.source, chunk.content.trim()));
            }
            Some(note)
        };

        RagOutcome {
            chunks: accepted
                .iter()
                .map(|c| RagChunkMeta {
                    source: c.source.clone(),
                    score: c.score,
                    hash: c.hash.clone(),
                })
                .collect(),
            note,
            cache_hit,
            latency_ms,
            error,
        }
    }

    /// One retriever call under breaker admission, with a single transient
    /// retry with jittered backoff.
    async fn retrieve(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<RetrievedChunk>> {
        let breaker = self.breakers.for_dependency("retriever");
        if breaker.admit() == Admission::Reject {
            return Err(AgoraError::Retriever(
                "retriever circuit breaker is open".into(),
            ));
        }

        let mut attempt = 0u32;
        loop {
            match self
                .retriever
                .top_k(query, self.config.top_k, &HashMap::new(), cancel)
                .await
            {
                Ok(chunks) => {
                    breaker.record_success();
                    return Ok(chunks);
                }
                Err(e) => {
                    let retryable = e.is_transient() && attempt < 1;
                    if !retryable {
                        breaker.record_failure(self.strict_breaker);
                        return Err(e);
                    }
                    attempt += 1;
                    let backoff = Duration::from_millis(
                        (200u64 << attempt).min(2_000) + rand::thread_rng().gen_range(0..50),
                    );
                    tracing::debug!(attempt, "transient retrieval error, retrying");
                    if self.clock.sleep(backoff, cancel).await.is_err() {
                        breaker.record_failure(self.strict_breaker);
                        return Err(e);
                    }
                }
            }
        }
    }

    fn cached(&mut self, query_hash: &str) -> Option<Vec<RetrievedChunk>> {
        let ttl_ms = self.config.cache_ttl_secs * 1_000;
        let now = self.clock.now_ms();
        match self.cache.get(query_hash) {
            Some(entry) if now.saturating_sub(entry.cached_at_ms) <= ttl_ms => {
                Some(entry.chunks.clone())
            }
            Some(_) => {
                self.cache.remove(query_hash);
                None
            }
            None => None,
        }
    }
}

/// Last user message + last assistant/agent message + role bias, truncated.
fn build_query(messages: &[Message], speaker_role_bias: &str) -> String {
    let last_user = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or("");
    let last_agent = messages
        .iter()
        .rev()
        .find(|m| matches!(m.role, Role::Assistant | Role::Agent(_)))
        .map(|m| m.content.as_str())
        .unwrap_or("");

    let mut query = format!("{last_user}\n{last_agent}\n{speaker_role_bias}");
    while approx_tokens(&query) > QUERY_MAX_TOKENS {
        let keep = query.len() * 3 / 4;
        let boundary = query
            .char_indices()
            .take_while(|(i, _)| *i <= keep)
            .last()
            .map(|(i, _)| i)
            .unwrap_or(0);
        query.truncate(boundary);
    }
    query
}

pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::clock::ManualClock;
    use agora_core::config::BreakerConfig;
    use agora_types::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticRetriever {
        chunks: Vec<RetrievedChunk>,
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Retriever for StaticRetriever {
        async fn top_k(
            &self,
            _query: &str,
            _k: usize,
            _filters: &HashMap<String, String>,
            _cancel: &CancellationToken,
        ) -> Result<Vec<RetrievedChunk>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AgoraError::Retriever("backend down".into()));
            }
            Ok(self.chunks.clone())
        }
    }

    fn chunk(content: &str, score: f64) -> RetrievedChunk {
        RetrievedChunk {
            content: content.to_string(),
            source: "kb".to_string(),
            score,
            hash: hash_text(content),
        }
    }

    fn config() -> RagConfig {
        RagConfig {
            top_k: 5,
            score_threshold: 0.35,
            rescore_delta: 0.15,
            cache_ttl_secs: 60,
            per_turn_max_tokens: 64,
        }
    }

    fn messages() -> Vec<Message> {
        vec![
            Message::user("What is our Q3 revenue?"),
            Message::agent("finance", "Checking the backend figures now."),
        ]
    }

    fn injector(retriever: Arc<StaticRetriever>, clock: Arc<ManualClock>) -> RagInjector {
        let clock: Arc<dyn Clock> = clock;
        RagInjector::new(
            retriever,
            BreakerRegistry::new(BreakerConfig::default(), clock.clone()),
            clock,
            config(),
            false,
        )
    }

    #[tokio::test]
    async fn low_scores_are_dropped_and_high_kept() {
        let retriever = Arc::new(StaticRetriever {
            chunks: vec![chunk("Q3 revenue was $1.2M", 0.9), chunk("unrelated trivia", 0.1)],
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let clock = Arc::new(ManualClock::new(0));
        let mut injector = injector(retriever, clock);

        let outcome = injector
            .inject(&messages(), "finance specialist", &CancellationToken::new())
            .await;
        assert_eq!(outcome.chunks.len(), 1);
        assert!(outcome.note.as_deref().unwrap().contains("Q3 revenue"));
        assert!(!outcome.cache_hit);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn duplicate_chunks_inject_once_per_run() {
        let retriever = Arc::new(StaticRetriever {
            chunks: vec![chunk("Q3 revenue was $1.2M", 0.9)],
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let clock = Arc::new(ManualClock::new(0));
        let mut injector = injector(retriever, clock.clone());

        let first = injector
            .inject(&messages(), "finance", &CancellationToken::new())
            .await;
        // Expire the query cache so the second call re-retrieves.
        clock.advance(Duration::from_secs(120));
        let second = injector
            .inject(&messages(), "finance", &CancellationToken::new())
            .await;

        assert_eq!(first.chunks.len(), 1);
        assert!(second.chunks.is_empty());
    }

    #[tokio::test]
    async fn cache_hits_within_ttl() {
        let retriever = Arc::new(StaticRetriever {
            chunks: vec![chunk("Q3 revenue was $1.2M", 0.9)],
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let clock = Arc::new(ManualClock::new(0));
        let mut injector = injector(retriever.clone(), clock);

        let first = injector
            .inject(&messages(), "finance", &CancellationToken::new())
            .await;
        let second = injector
            .inject(&messages(), "finance", &CancellationToken::new())
            .await;

        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retrieval_failure_retries_once_then_degrades() {
        let retriever = Arc::new(StaticRetriever {
            chunks: vec![],
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let clock = Arc::new(ManualClock::new(0));
        let mut injector = injector(retriever.clone(), clock.clone());

        // Drive the retry backoff on the manual clock.
        let ticker = tokio::spawn(async move {
            for _ in 0..100 {
                tokio::task::yield_now().await;
                clock.advance(Duration::from_millis(300));
            }
        });
        let outcome = injector
            .inject(&messages(), "finance", &CancellationToken::new())
            .await;
        ticker.abort();

        // One transient retry, then the turn proceeds without context.
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 2);
        assert!(outcome.note.is_none());
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn open_breaker_skips_the_retriever_entirely() {
        let retriever = Arc::new(StaticRetriever {
            chunks: vec![chunk("Q3 revenue was $1.2M", 0.9)],
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let clock = Arc::new(ManualClock::new(0));
        let mut injector = injector(retriever.clone(), clock);

        let breaker = injector.breakers.for_dependency("retriever");
        for _ in 0..BreakerConfig::default().failure_threshold {
            breaker.record_failure(false);
        }

        let outcome = injector
            .inject(&messages(), "finance", &CancellationToken::new())
            .await;

        // Fail-fast: the retriever is never called and the turn degrades.
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 0);
        assert!(outcome.note.is_none());
        assert!(outcome
            .error
            .as_deref()
            .is_some_and(|e| e.contains("circuit breaker")));
    }

    #[tokio::test]
    async fn token_budget_limits_injected_chunks() {
        let big = "x ".repeat(200);
        let retriever = Arc::new(StaticRetriever {
            chunks: vec![chunk(&big, 0.9), chunk("short and relevant", 0.8)],
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let clock = Arc::new(ManualClock::new(0));
        let mut injector = injector(retriever, clock);

        let outcome = injector
            .inject(&messages(), "finance", &CancellationToken::new())
            .await;
        // The oversized chunk is skipped; the short one still fits.
        assert_eq!(outcome.chunks.len(), 1);
        assert_eq!(outcome.chunks[0].hash, hash_text("short and relevant"));
    }
}
