use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Message, log_debug, xdg_state_dir};

/// Local-only state for one message, keyed by dedup key so it survives
/// uid reassignment across sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDerived {
    #[serde(default)]
    pub starred: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub note: String,
}

impl MessageDerived {
    pub fn from_message(msg: &Message) -> Self {
        Self {
            starred: msg.starred,
            tags: msg.tags.clone(),
            note: msg.note.clone(),
        }
    }

    pub fn is_default(&self) -> bool {
        !self.starred && self.tags.is_empty() && self.note.is_empty()
    }
}

/// Everything that must outlive the process: per-message derived fields
/// plus the saved column layout of the message list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DerivedState {
    #[serde(default)]
    pub messages: HashMap<String, MessageDerived>,
    #[serde(default)]
    pub column_layout: Vec<String>,
}

impl DerivedState {
    /// Records the message's derived fields; default entries are dropped to
    /// keep the file from accumulating dead keys.
    pub fn record(&mut self, dedup_key: &str, derived: MessageDerived) {
        if derived.is_default() {
            self.messages.remove(dedup_key);
        } else {
            self.messages.insert(dedup_key.to_string(), derived);
        }
    }

    pub fn lookup(&self, dedup_key: &str) -> Option<&MessageDerived> {
        self.messages.get(dedup_key)
    }

    /// Moves an entry to a new dedup key when a message changes folder.
    pub fn rekey(&mut self, old_key: &str, new_key: &str) {
        if let Some(entry) = self.messages.remove(old_key) {
            self.messages.insert(new_key.to_string(), entry);
        }
    }

    pub fn forget(&mut self, dedup_key: &str) {
        self.messages.remove(dedup_key);
    }
}

/// Storage seam for derived state so the gateway stays testable without
/// touching the filesystem.
#[async_trait]
pub trait DerivedStateStore: Send + Sync {
    async fn load(&self) -> Result<DerivedState>;
    async fn save(&self, state: &DerivedState) -> Result<()>;
}

/// Pretty JSON under the state dir, written via tmp + rename so a crash
/// mid-write never leaves a truncated file.
pub struct JsonDerivedStateStore {
    path: PathBuf,
}

impl JsonDerivedStateStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn default_path() -> PathBuf {
        xdg_state_dir().join("kitmail").join("derived.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for JsonDerivedStateStore {
    fn default() -> Self {
        Self::new(Self::default_path())
    }
}

#[async_trait]
impl DerivedStateStore for JsonDerivedStateStore {
    /// A missing file is a fresh install, not an error.
    async fn load(&self) -> Result<DerivedState> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(DerivedState::default());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read {}", self.path.display()));
            }
        };
        let state: DerivedState = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;
        Ok(state)
    }

    async fn save(&self, state: &DerivedState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to rename into {}", self.path.display()))?;
        log_debug(&format!(
            "derived state saved: {} message entries",
            state.messages.len()
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("kitmail-derived-{}-{}.json", name, std::process::id()))
    }

    #[test]
    fn record_drops_default_entries() {
        let mut state = DerivedState::default();
        state.record(
            "a/Inbox/1",
            MessageDerived {
                starred: true,
                tags: Vec::new(),
                note: String::new(),
            },
        );
        assert!(state.lookup("a/Inbox/1").is_some());

        state.record("a/Inbox/1", MessageDerived::default());
        assert!(state.lookup("a/Inbox/1").is_none());
    }

    #[test]
    fn rekey_follows_a_folder_move() {
        let mut state = DerivedState::default();
        state.record(
            "a/Inbox/1",
            MessageDerived {
                starred: true,
                tags: vec!["work".to_string()],
                note: String::new(),
            },
        );
        state.rekey("a/Inbox/1", "a/Archive/1");
        assert!(state.lookup("a/Inbox/1").is_none());
        assert!(state.lookup("a/Archive/1").unwrap().starred);
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let path = temp_path("roundtrip");
        let store = JsonDerivedStateStore::new(path.clone());

        let mut state = DerivedState::default();
        state.record(
            "a/Inbox/42",
            MessageDerived {
                starred: true,
                tags: vec!["travel".to_string(), "urgent".to_string()],
                note: "rebook the flight".to_string(),
            },
        );
        state.column_layout = vec!["from".to_string(), "subject".to_string()];

        store.save(&state).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.lookup("a/Inbox/42"), state.lookup("a/Inbox/42"));
        assert_eq!(loaded.column_layout, state.column_layout);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn load_of_missing_file_is_empty_state() {
        let store = JsonDerivedStateStore::new(temp_path("missing"));
        let state = store.load().await.unwrap();
        assert!(state.messages.is_empty());
        assert!(state.column_layout.is_empty());
    }
}
