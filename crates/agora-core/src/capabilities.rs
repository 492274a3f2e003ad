// External capability seams
// The core never talks to providers directly; it consumes these traits,
// injected at startup.

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use agora_types::{Message, ModelKnobs, Result, RunEvent};

/// Token usage reported by a provider for one generation.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageReport {
    pub tokens_in: u64,
    pub tokens_out: u64,
    /// False when the provider did not report usage and the caller should
    /// fall back to the configured estimator.
    pub reported: bool,
}

/// One element of a model response stream.
#[derive(Debug, Clone)]
pub enum LlmChunk {
    Token(String),
    /// The model requests a tool invocation; the turn continues after the
    /// result is appended.
    ToolCall { name: String, input: Value },
    /// Final chunk, closing the stream with the usage report.
    Done { usage: UsageReport },
}

pub type LlmStream = Pin<Box<dyn Stream<Item = Result<LlmChunk>> + Send>>;

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Start a generation. Errors are classified via
    /// `AgoraError::Model { kind, .. }`.
    async fn generate(
        &self,
        prompt: &[Message],
        model: &str,
        knobs: &ModelKnobs,
        cancel: &CancellationToken,
    ) -> Result<LlmStream>;
}

/// One retrieved context chunk. Scores are provider-normalized to [0, 1].
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub content: String,
    pub source: String,
    pub score: f64,
    pub hash: String,
}

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn top_k(
        &self,
        query: &str,
        k: usize,
        filters: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<Vec<RetrievedChunk>>;
}

/// Downstream audit log. Must accept every event at least once; callers
/// retry on transient errors.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write(&self, event: &RunEvent) -> Result<()>;
}

/// Sink that accepts and discards everything.
#[derive(Debug, Default)]
pub struct NullAuditSink;

#[async_trait]
impl AuditSink for NullAuditSink {
    async fn write(&self, _event: &RunEvent) -> Result<()> {
        Ok(())
    }
}
