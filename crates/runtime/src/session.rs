//! Session records and the store contract the mode machine mutates.
//!
//! Records are keyed by session key and may carry fields owned by other
//! subsystems; those ride along untouched in [`SessionEntry::extra`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub sani_mode: bool,
    #[serde(default)]
    pub labyrinth_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_mode_update_at: Option<DateTime<Utc>>,
    /// Latest turns of the conversation, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recent_messages: Vec<SessionMessage>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SessionEntry {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    pub fn flags(&self) -> ModeFlags {
        ModeFlags {
            sani_mode: self.sani_mode,
            labyrinth_mode: self.labyrinth_mode,
        }
    }

    /// Append `message`, dropping the oldest turns beyond `keep`.
    pub fn push_message(&mut self, message: SessionMessage, keep: usize) {
        self.recent_messages.push(message);
        let excess = self.recent_messages.len().saturating_sub(keep);
        self.recent_messages.drain(..excess);
    }
}

/// The two persona modes of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeFlags {
    pub sani_mode: bool,
    pub labyrinth_mode: bool,
}

impl ModeFlags {
    pub fn any(&self) -> bool {
        self.sani_mode || self.labyrinth_mode
    }
}

/// One turn of recent conversation, used for Labyrinth snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMessage {
    /// `"user"` or `"assistant"`.
    pub role: String,
    pub text: String,
}

impl SessionMessage {
    pub fn new(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            text: text.into(),
        }
    }
}

pub type EntryUpdate = Box<dyn FnOnce(&mut SessionEntry) + Send>;

/// Read/update contract for session records.
///
/// `update_entry` must apply the closure atomically with respect to other
/// updates of the same key, creating the record when absent.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<SessionEntry>>;
    async fn update_entry(&self, key: &str, update: EntryUpdate) -> Result<SessionEntry>;

    /// The newest `limit` turns of `key`, oldest first.
    async fn recent_messages(&self, key: &str, limit: usize) -> Result<Vec<SessionMessage>> {
        let Some(entry) = self.load(key).await? else {
            return Ok(Vec::new());
        };
        let skip = entry.recent_messages.len().saturating_sub(limit);
        Ok(entry.recent_messages.into_iter().skip(skip).collect())
    }

    /// Record one turn, keeping at most `keep` turns for the session.
    async fn record_message(&self, key: &str, message: SessionMessage, keep: usize) -> Result<()> {
        if keep == 0 {
            return Ok(());
        }
        self.update_entry(
            key,
            Box::new(move |e: &mut SessionEntry| e.push_message(message, keep)),
        )
        .await?;
        Ok(())
    }
}

/// All sessions in one JSON object on disk, rewritten atomically on update.
#[derive(Debug)]
pub struct JsonFileSessionStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<BTreeMap<String, SessionEntry>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) if raw.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("parse session store {}", self.path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(err)
                .with_context(|| format!("read session store {}", self.path.display())),
        }
    }

    async fn write_all(&self, sessions: &BTreeMap<String, SessionEntry>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tmp_path = {
            let filename = self
                .path
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_else(|| "sessions.json".to_string());
            self.path.with_file_name(format!("{filename}.tmp"))
        };

        let rendered = serde_json::to_vec_pretty(sessions)?;
        let write_result: Result<()> = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .await?;
            file.write_all(&rendered).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;

        if let Err(err) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        if let Err(err) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err)
                .with_context(|| format!("replace session store {}", self.path.display()));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for JsonFileSessionStore {
    async fn load(&self, key: &str) -> Result<Option<SessionEntry>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.remove(key))
    }

    async fn update_entry(&self, key: &str, update: EntryUpdate) -> Result<SessionEntry> {
        let _guard = self.lock.lock().await;
        let mut sessions = self.read_all().await?;
        let entry = sessions
            .entry(key.to_string())
            .or_insert_with(|| SessionEntry::new(key));
        if entry.session_id.is_empty() {
            entry.session_id = key.to_string();
        }
        update(entry);
        let updated = entry.clone();
        self.write_all(&sessions).await?;
        debug!(session = key, "session entry updated");
        Ok(updated)
    }
}
