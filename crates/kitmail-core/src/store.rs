use std::collections::HashMap;

use crate::error::MutationError;
use crate::{IncomingMessage, Message};

/// Canonical set of Message records plus the uid index used by every other
/// component. Single-writer: all mutation flows through `MutationGateway`,
/// which owns this store; nothing else may hold a second authoritative copy.
#[derive(Debug, Default)]
pub struct MessageStore {
    messages: HashMap<String, Message>,
    by_dedup: HashMap<String, String>,
    arrival: Vec<String>,
    next_uid: u64,
    revision: u64,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a newly observed message or refreshes an already-known one.
    /// Returns the uid and whether a record was created. On a known dedup
    /// key only the server-observable seen flag is taken from the incoming
    /// copy; subject/body/attachments are immutable after first observation
    /// and starred/tags/note are never overwritten by a remote merge.
    pub fn upsert(
        &mut self,
        account_id: &str,
        folder: &str,
        incoming: IncomingMessage,
    ) -> (String, bool) {
        let key = incoming.dedup_key(account_id, folder);
        if let Some(uid) = self.by_dedup.get(&key).cloned() {
            if let Some(existing) = self.messages.get_mut(&uid) {
                existing.read = incoming.read;
            }
            self.revision += 1;
            return (uid, false);
        }
        self.next_uid += 1;
        let uid = format!("m{}", self.next_uid);
        let msg = Message {
            uid: uid.clone(),
            account_id: account_id.to_string(),
            folder: folder.to_string(),
            remote_id: incoming.remote_id,
            from_address: incoming.from_address,
            from_display_name: incoming.from_display_name,
            to_addresses: incoming.to_addresses,
            subject: incoming.subject,
            sent_at: incoming.sent_at,
            size_bytes: incoming.size_bytes,
            body: incoming.body,
            attachments: incoming.attachments,
            read: incoming.read,
            starred: false,
            tags: Vec::new(),
            note: String::new(),
        };
        self.by_dedup.insert(key, uid.clone());
        self.arrival.push(uid.clone());
        self.messages.insert(uid.clone(), msg);
        self.revision += 1;
        (uid, true)
    }

    pub fn get(&self, uid: &str) -> Option<&Message> {
        self.messages.get(uid)
    }

    /// All messages in stable arrival order.
    pub fn all(&self) -> Vec<&Message> {
        self.arrival
            .iter()
            .filter_map(|uid| self.messages.get(uid))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Atomic read-modify-write of one record.
    pub fn mutate<F>(&mut self, uid: &str, f: F) -> Result<(), MutationError>
    where
        F: FnOnce(&mut Message),
    {
        let msg = self
            .messages
            .get_mut(uid)
            .ok_or_else(|| MutationError::UnknownMessage(uid.to_string()))?;
        f(msg);
        self.revision += 1;
        Ok(())
    }

    /// Permanent removal; the uid is never reused.
    pub fn remove(&mut self, uid: &str) -> Option<Message> {
        let removed = self.messages.remove(uid)?;
        self.by_dedup.retain(|_, v| v != uid);
        self.arrival.retain(|u| u != uid);
        self.revision += 1;
        Some(removed)
    }

    /// Bumped on every write; memoization key for derived indexes.
    pub fn revision(&self) -> u64 {
        self.revision
    }
}
