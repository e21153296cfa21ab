//! IMAP-backed protocol client. Protocol-level correctness (flags,
//! UIDVALIDITY, partial fetch) belongs to the `imap` crate and the server;
//! this layer only turns a mailbox into `RawMessage` values.

use imap::{ClientBuilder, ConnectionMode};

use kitmail_core::{Account, TlsMode, log_debug};

use crate::{ProtocolClient, ProtocolSession, RawMessage, SyncError};

pub struct ImapClient;

impl ProtocolClient for ImapClient {
    fn connect(&self, account: &Account) -> Result<Box<dyn ProtocolSession>, SyncError> {
        log_debug(&format!(
            "imap connect account={} host={} port={}",
            account.id, account.host, account.port
        ));
        let mode = match account.tls {
            TlsMode::Wrapped => ConnectionMode::Tls,
            TlsMode::StartTls => ConnectionMode::StartTls,
            TlsMode::Plain => ConnectionMode::Plaintext,
        };
        let client = ClientBuilder::new(account.host.as_str(), account.port)
            .tls_kind(imap::TlsKind::Native)
            .mode(mode)
            .danger_skip_tls_verify(account.skip_tls_verify)
            .connect()
            .map_err(|e| SyncError::Connection(e.to_string()))?;
        let session = client
            .login(&account.username, &account.password)
            .map_err(|e| SyncError::Auth(e.0.to_string()))?;
        log_debug(&format!("imap login ok account={}", account.id));
        Ok(Box::new(ImapSession { session }))
    }
}

pub struct ImapSession {
    session: imap::Session<imap::Connection>,
}

impl ProtocolSession for ImapSession {
    fn list_folders(&mut self) -> Result<Vec<String>, SyncError> {
        let list = self
            .session
            .list(None, Some("*"))
            .map_err(|e| SyncError::Connection(e.to_string()))?;
        let mut folders = Vec::new();
        for folder in list.iter() {
            if folder
                .attributes()
                .iter()
                .any(|attr| matches!(attr, imap_proto::NameAttribute::NoSelect))
            {
                continue;
            }
            folders.push(folder.name().to_string());
        }
        log_debug(&format!("imap list folders count={}", folders.len()));
        Ok(folders)
    }

    /// Fetches the newest `limit` messages of one folder, full bodies
    /// included, without setting the seen flag.
    fn fetch_messages(&mut self, folder: &str, limit: usize) -> Result<Vec<RawMessage>, SyncError> {
        let mailbox = self
            .session
            .select(folder)
            .map_err(|e| SyncError::Connection(e.to_string()))?;
        if mailbox.exists == 0 {
            return Ok(Vec::new());
        }
        let uids = self
            .session
            .uid_search("ALL")
            .map_err(|e| SyncError::Connection(e.to_string()))?;
        let uids = newest_uids(uids.into_iter().collect(), limit);
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let uid_set = uids
            .iter()
            .map(|uid| uid.to_string())
            .collect::<Vec<_>>()
            .join(",");
        log_debug(&format!(
            "imap uid_fetch folder={} count={}",
            folder,
            uids.len()
        ));
        let fetches = self
            .session
            .uid_fetch(uid_set, "(UID FLAGS RFC822.SIZE BODY.PEEK[])")
            .map_err(|e| SyncError::Connection(e.to_string()))?;
        let mut out = Vec::new();
        for fetch in fetches.iter() {
            let Some(body) = fetch.body() else {
                continue;
            };
            let read = fetch
                .flags()
                .iter()
                .any(|f| matches!(f, imap::types::Flag::Seen));
            out.push(RawMessage {
                remote_id: fetch.uid.map(|uid| uid.to_string()),
                raw: body.to_vec(),
                size_bytes: fetch.size.map(u64::from).unwrap_or(body.len() as u64),
                read,
            });
        }
        Ok(out)
    }

    fn logout(&mut self) -> Result<(), SyncError> {
        self.session
            .logout()
            .map_err(|e| SyncError::Connection(e.to_string()))
    }
}

/// The `limit` highest uids, highest first. A zero limit selects nothing.
fn newest_uids(mut uids: Vec<u32>, limit: usize) -> Vec<u32> {
    uids.sort_unstable_by(|a, b| b.cmp(a));
    uids.truncate(limit);
    uids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newest_uids_keeps_the_highest() {
        assert_eq!(newest_uids(vec![3, 7, 1, 9, 4], 3), vec![9, 7, 4]);
        assert_eq!(newest_uids(vec![3, 7], 10), vec![7, 3]);
    }

    #[test]
    fn zero_limit_selects_nothing() {
        assert!(newest_uids(vec![3, 7, 1], 0).is_empty());
    }
}
