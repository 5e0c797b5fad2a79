//! Filesystem implementation of `MessageStore`.
//!
//! One JSON file per session at `<dir>/sessions/<session-id>.json`.
//! Saves write to a temp file and rename into place, so a crash never
//! leaves a half-written record.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use quill_core::persistence::{MessageStore, SessionMeta, SessionRecord};

pub struct FsMessageStore {
    sessions_dir: PathBuf,
}

impl FsMessageStore {
    /// Create a store rooted at `base_dir`; the `sessions`
    /// subdirectory is created if missing.
    pub fn new(base_dir: &Path) -> Result<Self> {
        let sessions_dir = base_dir.join("sessions");
        std::fs::create_dir_all(&sessions_dir)
            .with_context(|| format!("failed to create {}", sessions_dir.display()))?;
        Ok(Self { sessions_dir })
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl MessageStore for FsMessageStore {
    async fn save(&self, record: &SessionRecord) -> Result<()> {
        let path = self.session_path(&record.id);
        let tmp = self.sessions_dir.join(format!("{}.json.tmp", record.id));

        let json = serde_json::to_vec_pretty(record).context("failed to serialize session")?;
        tokio::fs::write(&tmp, &json)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to move {} into place", tmp.display()))?;

        debug!(session_id = %record.id, bytes = json.len(), "saved session");
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<SessionRecord> {
        let path = self.session_path(id);
        let content = tokio::fs::read(&path)
            .await
            .with_context(|| format!("session '{id}' not found"))?;
        serde_json::from_slice(&content)
            .with_context(|| format!("corrupt session record: {}", path.display()))
    }

    async fn list(&self) -> Result<Vec<SessionMeta>> {
        let mut metas = Vec::new();

        let mut entries = tokio::fs::read_dir(&self.sessions_dir)
            .await
            .with_context(|| format!("failed to read {}", self.sessions_dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(content) => match serde_json::from_slice::<SessionRecord>(&content) {
                    Ok(record) => metas.push(record.meta()),
                    Err(e) => {
                        warn!(path = %path.display(), err = %e, "skipping unreadable session")
                    }
                },
                Err(e) => warn!(path = %path.display(), err = %e, "skipping unreadable session"),
            }
        }

        metas.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(metas)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use quill_core::types::{AgentType, Message, TokenUsage};

    fn record(id: &str, title: &str) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            agent_type: AgentType::Build,
            title: title.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            usage: TokenUsage::new(10, 5),
            messages: vec![Message::user("hello")],
        }
    }

    #[tokio::test]
    async fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsMessageStore::new(dir.path()).unwrap();

        store.save(&record("s1", "first session")).await.unwrap();

        let loaded = store.load("s1").await.unwrap();
        assert_eq!(loaded.id, "s1");
        assert_eq!(loaded.title, "first session");
        assert_eq!(loaded.messages.len(), 1);
        assert_eq!(loaded.usage.total(), 15);
    }

    #[tokio::test]
    async fn save_replaces_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsMessageStore::new(dir.path()).unwrap();

        let mut rec = record("s1", "v1");
        store.save(&rec).await.unwrap();
        rec.title = "v2".into();
        rec.messages.push(Message::user("more"));
        store.save(&rec).await.unwrap();

        let loaded = store.load("s1").await.unwrap();
        assert_eq!(loaded.title, "v2");
        assert_eq!(loaded.messages.len(), 2);

        // No temp file left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("sessions"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn list_sorted_by_updated_at_desc() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsMessageStore::new(dir.path()).unwrap();

        let mut old = record("old", "older");
        old.updated_at = Utc::now() - Duration::hours(2);
        let new = record("new", "newer");

        store.save(&old).await.unwrap();
        store.save(&new).await.unwrap();

        let metas = store.list().await.unwrap();
        assert_eq!(metas.len(), 2);
        assert_eq!(metas[0].id, "new");
        assert_eq!(metas[1].id, "old");
    }

    #[tokio::test]
    async fn load_missing_session_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsMessageStore::new(dir.path()).unwrap();
        assert!(store.load("nope").await.is_err());
    }

    #[tokio::test]
    async fn list_skips_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsMessageStore::new(dir.path()).unwrap();

        store.save(&record("good", "ok")).await.unwrap();
        std::fs::write(dir.path().join("sessions/bad.json"), "not json").unwrap();

        let metas = store.list().await.unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].id, "good");
    }
}
