//! Agora orchestration: decision engine, speaker selection, per-turn RAG,
//! tool execution and the streaming group-chat runner.
//!
//! The entry point is [`RunnerService`]: inject an `LlmClient`, a
//! `Retriever`, tool handlers and an audit sink, then `start` requests and
//! consume the typed event stream.

pub mod decision;
pub mod engine;
pub mod rag;
pub mod runner;
pub mod selector;
pub mod tools;


pub use decision::DecisionEngine;
pub use engine::{GroupChatEngine, RunDeps, RunReport};
pub use rag::{RagInjector, RagOutcome};
pub use runner::{ApprovalService, RunnerService, RunnerServices};
pub use selector::{SpeakerSelector, TerminationReason, TurnView};
pub use tools::{ToolExecutor, ToolHandler, ToolOutcome, ToolRegistry};
