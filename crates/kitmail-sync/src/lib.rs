//! Background mailbox fetching: one worker per account, batches handed to
//! the single-writer owner task over a bounded event channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;

use kitmail_core::{Account, FetchBatch, log_debug};

pub mod imap;
pub mod parse;

pub use self::imap::ImapClient;
pub use self::parse::parse_incoming;

const SYNC_CMD_QUEUE_CAPACITY: usize = 64;
const SYNC_EVENT_QUEUE_CAPACITY: usize = 256;

/// Per-account sync failures. Recovered by skipping the account for the
/// rest of the cycle; never fatal to other accounts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("timed out after {0}s")]
    Timeout(u64),
    #[error("malformed message: {0}")]
    Parse(String),
}

/// An undecoded message as returned by the protocol session.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub remote_id: Option<String>,
    pub raw: Vec<u8>,
    pub size_bytes: u64,
    pub read: bool,
}

/// Per-account fetch progression, surfaced for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchState {
    Idle,
    Connecting,
    Listing,
    Fetching,
    Failed,
}

/// Protocol seam. Blocking by design; every call runs inside
/// `spawn_blocking` with its own timeout.
pub trait ProtocolClient: Send + Sync + 'static {
    fn connect(&self, account: &Account) -> Result<Box<dyn ProtocolSession>, SyncError>;
}

pub trait ProtocolSession: Send {
    fn list_folders(&mut self) -> Result<Vec<String>, SyncError>;
    /// At most the newest `limit` messages of the folder.
    fn fetch_messages(&mut self, folder: &str, limit: usize) -> Result<Vec<RawMessage>, SyncError>;
    fn logout(&mut self) -> Result<(), SyncError>;
}

#[derive(Debug, Clone)]
pub enum SyncCommand {
    SyncAll,
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    AccountState {
        account_id: String,
        state: FetchState,
    },
    Batch(FetchBatch),
    AccountFailed {
        account_id: String,
        error: SyncError,
    },
    /// Exactly one per cycle, counts only; the data itself has already
    /// flowed through `Batch` events.
    CycleCompleted(SyncReport),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub accounts_synced: usize,
    pub accounts_failed: usize,
    pub accounts_cancelled: usize,
    pub batches: usize,
    pub messages: usize,
    pub parse_failures: usize,
}

enum AccountOutcome {
    Synced {
        batches: usize,
        messages: usize,
        parse_failures: usize,
    },
    Failed,
    Cancelled,
}

/// Handle to the background sync dispatcher.
#[derive(Clone)]
pub struct SyncEngine {
    tx: mpsc::Sender<SyncCommand>,
    cancel_flags: Arc<HashMap<String, Arc<AtomicBool>>>,
}

impl SyncEngine {
    pub fn start(
        accounts: Vec<Account>,
        client: Arc<dyn ProtocolClient>,
    ) -> (Self, mpsc::Receiver<SyncEvent>) {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<SyncCommand>(SYNC_CMD_QUEUE_CAPACITY);
        let (evt_tx, evt_rx) = mpsc::channel::<SyncEvent>(SYNC_EVENT_QUEUE_CAPACITY);
        let cancel_flags: Arc<HashMap<String, Arc<AtomicBool>>> = Arc::new(
            accounts
                .iter()
                .map(|a| (a.id.clone(), Arc::new(AtomicBool::new(false))))
                .collect(),
        );

        let flags = cancel_flags.clone();
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    SyncCommand::SyncAll => {
                        run_cycle(&accounts, client.clone(), &flags, &evt_tx).await;
                    }
                }
            }
        });

        (
            Self {
                tx: cmd_tx,
                cancel_flags,
            },
            evt_rx,
        )
    }

    pub fn send(&self, cmd: SyncCommand) -> Result<()> {
        match self.tx.try_send(cmd) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(cmd)) => {
                log_debug(&format!("sync cmd queue full, dropping: {:?}", cmd));
                Err(anyhow!("sync command queue full"))
            }
            Err(TrySendError::Closed(_)) => Err(anyhow!("sync command queue closed")),
        }
    }

    /// Signals the account's worker to stop between folders. Any batch it
    /// has not yet emitted is discarded rather than merged.
    pub fn cancel_account(&self, account_id: &str) {
        if let Some(flag) = self.cancel_flags.get(account_id) {
            flag.store(true, Ordering::Relaxed);
        }
    }
}

/// One full cycle: every account gets its own worker; the cycle ends with a
/// single aggregate report.
async fn run_cycle(
    accounts: &[Account],
    client: Arc<dyn ProtocolClient>,
    cancel_flags: &HashMap<String, Arc<AtomicBool>>,
    events: &mpsc::Sender<SyncEvent>,
) {
    let mut workers = JoinSet::new();
    for account in accounts {
        let cancel = cancel_flags
            .get(&account.id)
            .cloned()
            .unwrap_or_else(|| Arc::new(AtomicBool::new(false)));
        workers.spawn(sync_account(
            account.clone(),
            client.clone(),
            cancel,
            events.clone(),
        ));
    }

    let mut report = SyncReport::default();
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(AccountOutcome::Synced {
                batches,
                messages,
                parse_failures,
            }) => {
                report.accounts_synced += 1;
                report.batches += batches;
                report.messages += messages;
                report.parse_failures += parse_failures;
            }
            Ok(AccountOutcome::Failed) | Err(_) => report.accounts_failed += 1,
            Ok(AccountOutcome::Cancelled) => report.accounts_cancelled += 1,
        }
    }
    // A cancel covers exactly one cycle; the next SyncAll starts clean.
    for flag in cancel_flags.values() {
        flag.store(false, Ordering::Relaxed);
    }
    log_debug(&format!("sync cycle complete: {:?}", report));
    let _ = events.send(SyncEvent::CycleCompleted(report)).await;
}

/// Per-account worker: Idle -> Connecting -> Listing -> Fetching -> Idle,
/// or -> Failed on the first error (no retry within the cycle). Runs its
/// protocol calls on the blocking pool so the owner task never stalls.
async fn sync_account(
    account: Account,
    client: Arc<dyn ProtocolClient>,
    cancel: Arc<AtomicBool>,
    events: mpsc::Sender<SyncEvent>,
) -> AccountOutcome {
    if cancel.load(Ordering::Relaxed) {
        return AccountOutcome::Cancelled;
    }
    let timeout_secs = account.timeout_secs;
    send_state(&events, &account.id, FetchState::Connecting).await;

    let connect_client = client.clone();
    let connect_account = account.clone();
    let session =
        match run_blocking(timeout_secs, move || connect_client.connect(&connect_account)).await {
            Ok(session) => session,
            Err(err) => return fail(&events, &account.id, err).await,
        };

    send_state(&events, &account.id, FetchState::Listing).await;
    let mut session = session;
    let folders = match run_blocking(timeout_secs, move || {
        let folders = session.list_folders()?;
        Ok((session, folders))
    })
    .await
    {
        Ok((returned, folders)) => {
            session = returned;
            folders
        }
        Err(err) => return fail(&events, &account.id, err).await,
    };

    send_state(&events, &account.id, FetchState::Fetching).await;
    let mut batches = 0;
    let mut messages = 0;
    let mut parse_failures = 0;
    for folder in folders {
        if cancel.load(Ordering::Relaxed) {
            log_debug(&format!("sync cancelled account={}", account.id));
            return AccountOutcome::Cancelled;
        }
        let limit = account.fetch_limit;
        let fetch_folder = folder.clone();
        let raws = match run_blocking(timeout_secs, move || {
            let raws = session.fetch_messages(&fetch_folder, limit)?;
            Ok((session, raws))
        })
        .await
        {
            Ok((returned, raws)) => {
                session = returned;
                raws
            }
            Err(err) => return fail(&events, &account.id, err).await,
        };
        let batch = build_batch(&account.id, &folder, raws);
        if batch.messages.is_empty() && batch.parse_failures == 0 {
            continue;
        }
        batches += 1;
        messages += batch.messages.len();
        parse_failures += batch.parse_failures;
        let _ = events.send(SyncEvent::Batch(batch)).await;
    }

    let _ = run_blocking(timeout_secs, move || session.logout()).await;
    send_state(&events, &account.id, FetchState::Idle).await;
    AccountOutcome::Synced {
        batches,
        messages,
        parse_failures,
    }
}

async fn send_state(events: &mpsc::Sender<SyncEvent>, account_id: &str, state: FetchState) {
    let _ = events
        .send(SyncEvent::AccountState {
            account_id: account_id.to_string(),
            state,
        })
        .await;
}

async fn fail(
    events: &mpsc::Sender<SyncEvent>,
    account_id: &str,
    error: SyncError,
) -> AccountOutcome {
    log_debug(&format!("sync failed account={} error={}", account_id, error));
    send_state(events, account_id, FetchState::Failed).await;
    let _ = events
        .send(SyncEvent::AccountFailed {
            account_id: account_id.to_string(),
            error,
        })
        .await;
    AccountOutcome::Failed
}

/// Runs one blocking protocol call with its own deadline. A timed-out call
/// abandons the blocking task and fails the account for this cycle.
async fn run_blocking<T, F>(timeout_secs: u64, f: F) -> Result<T, SyncError>
where
    F: FnOnce() -> Result<T, SyncError> + Send + 'static,
    T: Send + 'static,
{
    let task = tokio::task::spawn_blocking(f);
    match tokio::time::timeout(Duration::from_secs(timeout_secs), task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(SyncError::Connection(join_err.to_string())),
        Err(_) => Err(SyncError::Timeout(timeout_secs)),
    }
}

/// Parses one folder's raw messages into a batch. A malformed message is
/// dropped and counted; the rest of the batch still merges. Messages are
/// ordered oldest-first so the newest ends up at the front of folder
/// membership after the merge.
pub fn build_batch(account_id: &str, folder: &str, raws: Vec<RawMessage>) -> FetchBatch {
    let mut messages = Vec::new();
    let mut parse_failures = 0;
    for raw in &raws {
        match parse::parse_incoming(raw) {
            Ok(msg) => messages.push(msg),
            Err(err) => {
                log_debug(&format!(
                    "dropping malformed message in {}/{}: {}",
                    account_id, folder, err
                ));
                parse_failures += 1;
            }
        }
    }
    messages.sort_by_key(|m| m.sent_at);
    FetchBatch {
        account_id: account_id.to_string(),
        folder: folder.to_string(),
        messages,
        parse_failures,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    use kitmail_core::derived::DerivedState;
    use kitmail_core::{JsonDerivedStateStore, MutationGateway, TlsMode};

    use super::*;

    fn account(id: &str, fetch_limit: usize) -> Account {
        Account {
            id: id.to_string(),
            host: "mail.example.com".to_string(),
            port: 993,
            tls: TlsMode::Wrapped,
            username: "user".to_string(),
            password: "secret".to_string(),
            fetch_limit,
            timeout_secs: 5,
            skip_tls_verify: false,
        }
    }

    fn raw_msg(id: u32, subject: &str) -> RawMessage {
        let sent = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
            + ChronoDuration::minutes(id as i64);
        let text = format!(
            concat!(
                "From: Alice <alice@example.com>\r\n",
                "To: me@example.com\r\n",
                "Subject: {}\r\n",
                "Date: {}\r\n",
                "\r\n",
                "body {}\r\n",
            ),
            subject,
            sent.to_rfc2822(),
            id
        );
        RawMessage {
            remote_id: Some(id.to_string()),
            raw: text.into_bytes(),
            size_bytes: 0,
            read: false,
        }
    }

    fn garbage() -> RawMessage {
        RawMessage {
            remote_id: Some("999".to_string()),
            raw: b"Subject: headers only, no sender\r\n\r\n".to_vec(),
            size_bytes: 0,
            read: false,
        }
    }

    #[derive(Clone)]
    struct ScriptedAccount {
        connect_error: Option<SyncError>,
        connect_delay: Option<Duration>,
        folders: Vec<(String, Vec<RawMessage>)>,
    }

    impl ScriptedAccount {
        fn healthy(folders: Vec<(String, Vec<RawMessage>)>) -> Self {
            Self {
                connect_error: None,
                connect_delay: None,
                folders,
            }
        }
    }

    struct ScriptedClient {
        accounts: HashMap<String, ScriptedAccount>,
    }

    impl ProtocolClient for ScriptedClient {
        fn connect(&self, account: &Account) -> Result<Box<dyn ProtocolSession>, SyncError> {
            let script = self
                .accounts
                .get(&account.id)
                .cloned()
                .ok_or_else(|| SyncError::Connection("unknown account".to_string()))?;
            if let Some(delay) = script.connect_delay {
                std::thread::sleep(delay);
            }
            if let Some(err) = script.connect_error {
                return Err(err);
            }
            Ok(Box::new(ScriptedSession {
                folders: script.folders,
            }))
        }
    }

    struct ScriptedSession {
        folders: Vec<(String, Vec<RawMessage>)>,
    }

    impl ProtocolSession for ScriptedSession {
        fn list_folders(&mut self) -> Result<Vec<String>, SyncError> {
            Ok(self.folders.iter().map(|(name, _)| name.clone()).collect())
        }

        // Like a real server: newest `limit` by uid.
        fn fetch_messages(
            &mut self,
            folder: &str,
            limit: usize,
        ) -> Result<Vec<RawMessage>, SyncError> {
            let mut raws = self
                .folders
                .iter()
                .find(|(name, _)| name == folder)
                .map(|(_, raws)| raws.clone())
                .unwrap_or_default();
            raws.sort_by_key(|r| {
                std::cmp::Reverse(
                    r.remote_id
                        .as_deref()
                        .and_then(|id| id.parse::<u32>().ok())
                        .unwrap_or(0),
                )
            });
            raws.truncate(limit);
            Ok(raws)
        }

        fn logout(&mut self) -> Result<(), SyncError> {
            Ok(())
        }
    }

    fn start_engine(
        accounts: Vec<Account>,
        scripted: HashMap<String, ScriptedAccount>,
    ) -> (SyncEngine, mpsc::Receiver<SyncEvent>) {
        SyncEngine::start(accounts, Arc::new(ScriptedClient { accounts: scripted }))
    }

    async fn run_one_cycle(
        engine: &SyncEngine,
        rx: &mut mpsc::Receiver<SyncEvent>,
    ) -> (Vec<FetchBatch>, Vec<String>, SyncReport) {
        engine.send(SyncCommand::SyncAll).unwrap();
        let mut batches = Vec::new();
        let mut failed = Vec::new();
        loop {
            match rx.recv().await.expect("event channel closed") {
                SyncEvent::Batch(batch) => batches.push(batch),
                SyncEvent::AccountFailed { account_id, .. } => failed.push(account_id),
                SyncEvent::CycleCompleted(report) => return (batches, failed, report),
                SyncEvent::AccountState { .. } => {}
            }
        }
    }

    fn test_gateway() -> MutationGateway {
        let path = std::env::temp_dir().join(format!("kitmail-sync-test-{}.json", std::process::id()));
        MutationGateway::new(
            Box::new(JsonDerivedStateStore::new(path)),
            DerivedState::default(),
        )
    }

    #[tokio::test]
    async fn cycle_emits_one_batch_per_folder_and_a_report() {
        let scripted = HashMap::from([(
            "work".to_string(),
            ScriptedAccount::healthy(vec![
                ("Inbox".to_string(), vec![raw_msg(1, "a"), raw_msg(2, "b")]),
                ("Archive".to_string(), vec![raw_msg(3, "c")]),
            ]),
        )]);
        let (engine, mut rx) = start_engine(vec![account("work", 100)], scripted);

        let (batches, failed, report) = run_one_cycle(&engine, &mut rx).await;
        assert!(failed.is_empty());
        assert_eq!(batches.len(), 2);
        assert_eq!(report.accounts_synced, 1);
        assert_eq!(report.batches, 2);
        assert_eq!(report.messages, 3);
        assert_eq!(report.parse_failures, 0);
    }

    #[tokio::test]
    async fn fetch_limit_keeps_the_newest_messages() {
        let raws: Vec<RawMessage> = (0..80).map(|i| raw_msg(i, &format!("msg {}", i))).collect();
        let scripted = HashMap::from([(
            "work".to_string(),
            ScriptedAccount::healthy(vec![("Inbox".to_string(), raws)]),
        )]);
        let (engine, mut rx) = start_engine(vec![account("work", 50)], scripted);

        let (batches, _, report) = run_one_cycle(&engine, &mut rx).await;
        assert_eq!(report.messages, 50);

        let mut gw = test_gateway();
        for batch in batches {
            // Oldest first inside each batch.
            assert!(
                batch
                    .messages
                    .windows(2)
                    .all(|w| w[0].sent_at <= w[1].sent_at)
            );
            gw.merge_batch(batch).unwrap();
        }
        assert_eq!(gw.store().len(), 50);
        let cutoff = Utc.with_ymd_and_hms(2026, 3, 1, 0, 30, 0).unwrap();
        assert!(gw.store().all().iter().all(|m| m.sent_at >= cutoff));

        // Newest at the front of the folder view.
        let inbox = gw.folder_messages("Inbox").unwrap();
        assert_eq!(inbox[0].subject, "msg 79");
    }

    #[tokio::test]
    async fn failed_account_does_not_fail_the_cycle() {
        let scripted = HashMap::from([
            (
                "bad".to_string(),
                ScriptedAccount {
                    connect_error: Some(SyncError::Auth("invalid credentials".to_string())),
                    connect_delay: None,
                    folders: Vec::new(),
                },
            ),
            (
                "good".to_string(),
                ScriptedAccount::healthy(vec![("Inbox".to_string(), vec![raw_msg(1, "ok")])]),
            ),
        ]);
        let accounts = vec![account("bad", 10), account("good", 10)];
        let (engine, mut rx) = start_engine(accounts, scripted);

        let (batches, failed, report) = run_one_cycle(&engine, &mut rx).await;
        assert_eq!(failed, vec!["bad".to_string()]);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].account_id, "good");
        assert_eq!(report.accounts_synced, 1);
        assert_eq!(report.accounts_failed, 1);
    }

    #[tokio::test]
    async fn malformed_message_is_dropped_not_the_batch() {
        let scripted = HashMap::from([(
            "work".to_string(),
            ScriptedAccount::healthy(vec![(
                "Inbox".to_string(),
                vec![raw_msg(1, "fine"), garbage(), raw_msg(2, "also fine")],
            )]),
        )]);
        let (engine, mut rx) = start_engine(vec![account("work", 10)], scripted);

        let (batches, _, report) = run_one_cycle(&engine, &mut rx).await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].messages.len(), 2);
        assert_eq!(batches[0].parse_failures, 1);
        assert_eq!(report.parse_failures, 1);
    }

    #[tokio::test]
    async fn cancelled_account_contributes_no_batches() {
        let scripted = HashMap::from([(
            "work".to_string(),
            ScriptedAccount::healthy(vec![("Inbox".to_string(), vec![raw_msg(1, "a")])]),
        )]);
        let (engine, mut rx) = start_engine(vec![account("work", 10)], scripted);

        engine.cancel_account("work");
        let (batches, failed, report) = run_one_cycle(&engine, &mut rx).await;
        assert!(batches.is_empty());
        assert!(failed.is_empty());
        assert_eq!(report.accounts_cancelled, 1);
        assert_eq!(report.accounts_synced, 0);
    }

    #[tokio::test]
    async fn cancellation_does_not_outlive_the_cycle() {
        let scripted = HashMap::from([(
            "work".to_string(),
            ScriptedAccount::healthy(vec![("Inbox".to_string(), vec![raw_msg(1, "a")])]),
        )]);
        let (engine, mut rx) = start_engine(vec![account("work", 10)], scripted);

        engine.cancel_account("work");
        let (batches, _, report) = run_one_cycle(&engine, &mut rx).await;
        assert!(batches.is_empty());
        assert_eq!(report.accounts_cancelled, 1);

        let (batches, failed, report) = run_one_cycle(&engine, &mut rx).await;
        assert!(failed.is_empty());
        assert_eq!(batches.len(), 1);
        assert_eq!(report.accounts_synced, 1);
        assert_eq!(report.accounts_cancelled, 0);
    }

    #[tokio::test]
    async fn timed_out_account_is_reported_failed() {
        let scripted = HashMap::from([(
            "slow".to_string(),
            ScriptedAccount {
                connect_error: None,
                connect_delay: Some(Duration::from_millis(2000)),
                folders: vec![("Inbox".to_string(), vec![raw_msg(1, "late")])],
            },
        )]);
        let mut slow = account("slow", 10);
        slow.timeout_secs = 1;
        let (engine, mut rx) = start_engine(vec![slow], scripted);

        let (batches, failed, report) = run_one_cycle(&engine, &mut rx).await;
        assert!(batches.is_empty());
        assert_eq!(failed, vec!["slow".to_string()]);
        assert_eq!(report.accounts_failed, 1);
    }

    #[tokio::test]
    async fn send_returns_error_when_queue_is_full() {
        let (tx, _rx) = mpsc::channel(1);
        let engine = SyncEngine {
            tx,
            cancel_flags: Arc::new(HashMap::new()),
        };
        engine.send(SyncCommand::SyncAll).unwrap();

        let err = engine.send(SyncCommand::SyncAll).unwrap_err();
        assert!(err.to_string().contains("queue full"));
    }

    #[tokio::test]
    async fn send_returns_error_when_queue_is_closed() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let engine = SyncEngine {
            tx,
            cancel_flags: Arc::new(HashMap::new()),
        };

        let err = engine.send(SyncCommand::SyncAll).unwrap_err();
        assert!(err.to_string().contains("queue closed"));
    }
}
