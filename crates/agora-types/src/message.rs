use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Author of a message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
    /// A named specialist agent speaking inside a group chat.
    Agent(String),
}

impl Role {
    pub fn agent_name(&self) -> Option<&str> {
        match self {
            Role::Agent(name) => Some(name),
            _ => None,
        }
    }
}

/// A single conversation message. Messages are immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn agent(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(Role::Agent(name.into()), content)
    }

    pub fn tool(tool_name: &str, content: impl Into<String>) -> Self {
        let mut message = Self::new(Role::Tool, content);
        message
            .metadata
            .insert("tool".to_string(), Value::String(tool_name.to_string()));
        message
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Immutable input that starts a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub run_id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub conversation_id: String,
    pub message: String,
    #[serde(default)]
    pub history: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_hint: Option<BudgetHint>,
    /// Per-request feature flag overrides, applied on top of the captured
    /// process snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<HashMap<String, bool>>,
}

impl Request {
    pub fn new(tenant_id: impl Into<String>, user_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            conversation_id: Uuid::new_v4().to_string(),
            message: message.into(),
            history: Vec::new(),
            budget_hint: None,
            flags: None,
        }
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn with_budget_hint(mut self, hint: BudgetHint) -> Self {
        self.budget_hint = Some(hint);
        self
    }
}

/// Caller-supplied budget preference; the decision engine clamps it against
/// configured ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetHint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_usd_micros: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_turn_max_tokens: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_role_round_trips() {
        let message = Message::agent("finance", "Q3 revenue was 1.2M");
        let json = serde_json::to_string(&message).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.role.agent_name(), Some("finance"));
    }

    #[test]
    fn tool_message_carries_tool_name() {
        let message = Message::tool("db_query", "{\"rows\": 3}");
        assert_eq!(
            message.metadata.get("tool").and_then(|v| v.as_str()),
            Some("db_query")
        );
    }
}
