//! Conversation sessions.
//!
//! A [`Session`] owns the conversation with one model plus running token and
//! cost totals.  Only the agent that owns a session mutates it.  Persisting a
//! session is the caller's business: [`Session::snapshot`] produces a
//! serializable [`SessionSnapshot`] and [`Session::restore`] rebuilds from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::llm::types::{Conversation, Message, Usage};

/// Cumulative usage across every response in a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// USD.
    pub cost: f64,
}

/// One conversation with one model.
#[derive(Debug, Clone)]
pub struct Session {
    id: Uuid,
    model: String,
    conversation: Conversation,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    totals: SessionTotals,
}

impl Session {
    /// Start an empty session for `model`.
    pub fn new(model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            model: model.into(),
            conversation: Conversation::new(),
            created_at: now,
            updated_at: now,
            totals: SessionTotals::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Switch models mid-conversation.
    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = model.into();
        self.touch();
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn totals(&self) -> SessionTotals {
        self.totals
    }

    /// Set or replace the system prompt.
    pub fn set_system(&mut self, text: impl Into<String>) {
        self.conversation.set_system(text);
        self.touch();
    }

    /// Append a message.
    pub fn push(&mut self, message: Message) {
        self.conversation.push(message);
        self.touch();
    }

    /// Add one response's usage to the running totals.
    pub fn record_usage(&mut self, usage: &Usage) {
        self.totals.input_tokens += usage.input_tokens;
        self.totals.output_tokens += usage.output_tokens;
        self.totals.cost += usage.cost;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// A serializable copy of the session.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            model: self.model.clone(),
            messages: self.conversation.messages().to_vec(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            totals: self.totals,
        }
    }

    /// Rebuild a session from a snapshot.
    pub fn restore(snapshot: SessionSnapshot) -> Self {
        Self {
            id: snapshot.id,
            model: snapshot.model,
            conversation: Conversation::from_messages(snapshot.messages),
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
            totals: snapshot.totals,
        }
    }
}

/// Persistable form of a [`Session`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub model: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub totals: SessionTotals,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{Content, Role};
    use serde_json::json;

    #[test]
    fn new_session_has_v7_id_and_empty_totals() {
        let session = Session::new("anthropic/claude-3-5-sonnet-20241022");
        assert_eq!(session.id().get_version_num(), 7);
        assert_eq!(session.totals(), SessionTotals::default());
        assert!(session.conversation().is_empty());
        assert_eq!(session.created_at(), session.updated_at());
    }

    #[test]
    fn record_usage_accumulates() {
        let mut session = Session::new("gpt-4o");
        for _ in 0..2 {
            session.record_usage(&Usage {
                input_tokens: 10,
                output_tokens: 5,
                cached_tokens: 0,
                cost: 0.25,
            });
        }
        let totals = session.totals();
        assert_eq!(totals.input_tokens, 20);
        assert_eq!(totals.output_tokens, 10);
        assert!((totals.cost - 0.5).abs() < 1e-12);
    }

    #[test]
    fn snapshot_survives_json_and_restores() {
        let mut session = Session::new("gpt-4o");
        session.set_system("be brief");
        session.push(Message::user("hi"));
        session.push(Message::new(
            Role::Assistant,
            vec![Content::tool_use("t1", "lookup", json!({"q": "x"}))],
        ));

        let json = serde_json::to_string(&session.snapshot()).unwrap();
        let restored = Session::restore(serde_json::from_str(&json).unwrap());

        assert_eq!(restored.id(), session.id());
        assert_eq!(restored.conversation(), session.conversation());
        assert_eq!(restored.conversation().system().as_deref(), Some("be brief"));
    }
}
