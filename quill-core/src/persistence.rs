//! Session Persistence
//!
//! The `MessageStore` trait defines append-only session persistence;
//! the filesystem implementation lives in `quill-storage-fs`. A
//! session is saved as one record keyed by its id, rewritten on every
//! message append.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AgentType, Message, TokenUsage};

/// Summary of a persisted session, for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: String,
    pub agent_type: AgentType,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub usage: TokenUsage,
}

/// The full persisted form of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub agent_type: AgentType,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub usage: TokenUsage,
    pub messages: Vec<Message>,
}

impl SessionRecord {
    pub fn meta(&self) -> SessionMeta {
        SessionMeta {
            id: self.id.clone(),
            agent_type: self.agent_type,
            title: self.title.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            usage: self.usage,
        }
    }
}

/// Append-only persistence of sessions keyed by session id.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist the record, replacing any previous version atomically.
    async fn save(&self, record: &SessionRecord) -> Result<()>;

    /// Load a session by id.
    async fn load(&self, id: &str) -> Result<SessionRecord>;

    /// All persisted sessions, newest `updated_at` first.
    async fn list(&self) -> Result<Vec<SessionMeta>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    #[test]
    fn record_serde_round_trip() {
        let record = SessionRecord {
            id: "s1".into(),
            agent_type: AgentType::Build,
            title: "fix the parser".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            usage: TokenUsage::new(10, 5),
            messages: vec![Message::user("hello"), Message::system("be brief")],
        };

        let json = serde_json::to_string(&record).unwrap();
        let back: SessionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "s1");
        assert_eq!(back.messages.len(), 2);
        assert_eq!(back.messages[0].role, Role::User);
        assert_eq!(back.usage.total(), 15);
    }

    #[test]
    fn meta_mirrors_record() {
        let record = SessionRecord {
            id: "s2".into(),
            agent_type: AgentType::Explore,
            title: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            usage: TokenUsage::default(),
            messages: vec![Message::user("x")],
        };
        let meta = record.meta();
        assert_eq!(meta.id, record.id);
        assert_eq!(meta.agent_type, AgentType::Explore);
    }
}
