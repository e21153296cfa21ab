//! Mailbox engine: canonical message store, derived views, and the mutation gateway.

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod derived;
pub mod error;
pub mod filter;
pub mod folder;
pub mod gateway;
pub mod smart;
pub mod store;
pub mod thread;

pub use derived::{DerivedState, DerivedStateStore, JsonDerivedStateStore, MessageDerived};
pub use error::MutationError;
pub use filter::FilterQuery;
pub use folder::{
    FAVORITES_FOLDER, FolderCatalog, FolderEntry, INBOX_FOLDER, PROTECTED_FOLDERS, TRASH_FOLDER,
    is_smart_folder_name,
};
pub use gateway::{MergeReport, MutationDelta, MutationGateway};
pub use smart::SmartFolder;
pub use store::MessageStore;
pub use thread::{NO_SUBJECT, ThreadIndex, normalize_subject, participant_set, thread_id};

/// One remote mailbox, loaded from configuration and immutable for the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub tls: TlsMode,
    pub username: String,
    pub password: String,
    pub fetch_limit: usize,
    pub timeout_secs: u64,
    pub skip_tls_verify: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    Wrapped,
    StartTls,
    Plain,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub mime: String,
    pub size_bytes: u64,
}

/// The central entity. `uid` is process-local and assigned once on first
/// observation; `starred`/`tags`/`note` are local-only and survive re-sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub uid: String,
    pub account_id: String,
    pub folder: String,
    pub remote_id: Option<String>,
    pub from_address: String,
    pub from_display_name: String,
    pub to_addresses: Vec<String>,
    pub subject: String,
    pub sent_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub body: String,
    pub attachments: Vec<Attachment>,
    pub read: bool,
    pub starred: bool,
    pub tags: Vec<String>,
    pub note: String,
}

impl Message {
    pub fn dedup_key(&self) -> String {
        dedup_key(
            &self.account_id,
            &self.folder,
            self.remote_id.as_deref(),
            &self.from_address,
            &self.subject,
            self.sent_at,
        )
    }
}

/// A message as fetched and parsed, before it gains a uid and derived state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub remote_id: Option<String>,
    pub from_address: String,
    pub from_display_name: String,
    pub to_addresses: Vec<String>,
    pub subject: String,
    pub sent_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub body: String,
    pub attachments: Vec<Attachment>,
    pub read: bool,
}

impl IncomingMessage {
    pub fn dedup_key(&self, account_id: &str, folder: &str) -> String {
        dedup_key(
            account_id,
            folder,
            self.remote_id.as_deref(),
            &self.from_address,
            &self.subject,
            self.sent_at,
        )
    }
}

/// Identity used to decide whether an incoming message is new or an update.
/// Prefers the server-assigned identifier; falls back to message headers.
pub fn dedup_key(
    account_id: &str,
    folder: &str,
    remote_id: Option<&str>,
    from_address: &str,
    subject: &str,
    sent_at: DateTime<Utc>,
) -> String {
    match remote_id {
        Some(id) => format!("{}/{}/{}", account_id, folder, id),
        None => format!(
            "{}:{}:{}:{}",
            account_id,
            from_address,
            subject,
            sent_at.to_rfc3339()
        ),
    }
}

/// Immutable unit of newly retrieved remote messages for one account/folder
/// pair. Merged exactly once; `messages` are ordered oldest-first so the
/// newest one ends up at the front of folder membership.
#[derive(Debug, Clone)]
pub struct FetchBatch {
    pub account_id: String,
    pub folder: String,
    pub messages: Vec<IncomingMessage>,
    pub parse_failures: usize,
}

/// Read-time conversation projection; never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub member_uids: Vec<String>,
}

impl Thread {
    pub fn size(&self) -> usize {
        self.member_uids.len()
    }
}

pub fn xdg_state_dir() -> PathBuf {
    std::env::var_os("XDG_STATE_HOME")
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local").join("state"))
        })
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

static LOG_FILE: OnceLock<Mutex<Option<std::fs::File>>> = OnceLock::new();

pub fn log_debug(msg: &str) {
    if std::env::var("KITMAIL_LOG").is_err() {
        return;
    }
    let path = xdg_state_dir().join("kitmail").join("kitmail.log");
    let lock = LOG_FILE.get_or_init(|| {
        let _ = std::fs::create_dir_all(
            path.parent()
                .unwrap_or_else(|| std::path::Path::new("/tmp")),
        );
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .ok();
        Mutex::new(file)
    });
    if let Ok(mut guard) = lock.lock() {
        if let Some(file) = guard.as_mut() {
            let ts = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let _ = writeln!(file, "[{}] {}", ts, msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn sent(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, 0, 0).unwrap()
    }

    #[test]
    fn dedup_key_prefers_server_identifier() {
        let key = dedup_key(
            "work",
            "Inbox",
            Some("4711"),
            "alice@example.com",
            "hello",
            sent(9),
        );
        assert_eq!(key, "work/Inbox/4711");
    }

    #[test]
    fn dedup_key_falls_back_to_header_identity() {
        let key = dedup_key("work", "Inbox", None, "alice@example.com", "hello", sent(9));
        assert!(key.starts_with("work:alice@example.com:hello:"));
        assert!(key.contains("2026-03-01"));
    }
}
