use std::time::{Duration, Instant};

use anyhow::Result;

use crate::derived::{DerivedState, DerivedStateStore, MessageDerived};
use crate::error::MutationError;
use crate::folder::{FolderCatalog, TRASH_FOLDER};
use crate::store::MessageStore;
use crate::{FetchBatch, Message, log_debug};

/// Batched writes instead of one file write per keystroke.
const FLUSH_DEBOUNCE: Duration = Duration::from_secs(2);

/// What a mutation changed, so the presentation layer can apply a minimal
/// delta instead of a full reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationDelta {
    pub uid: String,
    pub old_folder: String,
    pub new_folder: String,
    pub old_starred: bool,
    pub new_starred: bool,
}

/// Outcome of merging one `FetchBatch`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub created: usize,
    pub updated: usize,
    pub parse_failures: usize,
}

/// Sole authorized write path. Owns the store, the folder catalog and the
/// loaded derived state; lives on the owner task, so every mutation and
/// every batch merge is serialized by construction.
pub struct MutationGateway {
    store: MessageStore,
    catalog: FolderCatalog,
    derived: DerivedState,
    persistence: Box<dyn DerivedStateStore>,
    dirty: bool,
    last_flush: Instant,
}

impl MutationGateway {
    pub fn new(persistence: Box<dyn DerivedStateStore>, derived: DerivedState) -> Self {
        Self {
            store: MessageStore::new(),
            catalog: FolderCatalog::new(),
            derived,
            persistence,
            dirty: false,
            last_flush: Instant::now(),
        }
    }

    /// Loads derived state through the persistence collaborator.
    pub async fn open(persistence: Box<dyn DerivedStateStore>) -> Result<Self> {
        let derived = persistence.load().await?;
        Ok(Self::new(persistence, derived))
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn catalog(&self) -> &FolderCatalog {
        &self.catalog
    }

    pub fn column_layout(&self) -> &[String] {
        &self.derived.column_layout
    }

    pub fn set_column_layout(&mut self, layout: Vec<String>) {
        self.derived.column_layout = layout;
        self.mark_dirty();
    }

    /// Messages of one real folder, newest arrival first.
    pub fn folder_messages(&self, folder: &str) -> Result<Vec<&Message>, MutationError> {
        let entry = self
            .catalog
            .entry(folder)
            .ok_or_else(|| MutationError::NotARealFolder(folder.to_string()))?;
        Ok(entry
            .uids
            .iter()
            .filter_map(|uid| self.store.get(uid))
            .collect())
    }

    pub fn set_star(&mut self, uid: &str, starred: bool) -> Result<MutationDelta, MutationError> {
        let (old_starred, folder) = self.snapshot(uid)?;
        self.store.mutate(uid, |m| m.starred = starred)?;
        self.record_derived(uid);
        Ok(MutationDelta {
            uid: uid.to_string(),
            old_folder: folder.clone(),
            new_folder: folder,
            old_starred,
            new_starred: starred,
        })
    }

    /// Tags are kept ordered and unique.
    pub fn set_tags(
        &mut self,
        uid: &str,
        tags: Vec<String>,
    ) -> Result<MutationDelta, MutationError> {
        let (starred, folder) = self.snapshot(uid)?;
        let mut unique = Vec::new();
        for tag in tags {
            if !unique.contains(&tag) {
                unique.push(tag);
            }
        }
        self.store.mutate(uid, |m| m.tags = unique)?;
        self.record_derived(uid);
        Ok(self.unchanged_delta(uid, folder, starred))
    }

    pub fn set_note(&mut self, uid: &str, note: String) -> Result<MutationDelta, MutationError> {
        let (starred, folder) = self.snapshot(uid)?;
        self.store.mutate(uid, |m| m.note = note)?;
        self.record_derived(uid);
        Ok(self.unchanged_delta(uid, folder, starred))
    }

    pub fn set_read(&mut self, uid: &str, read: bool) -> Result<MutationDelta, MutationError> {
        let (starred, folder) = self.snapshot(uid)?;
        self.store.mutate(uid, |m| m.read = read)?;
        Ok(self.unchanged_delta(uid, folder, starred))
    }

    /// Moves a message between real folders, keeping the message record and
    /// the derived-state key in step with catalog membership.
    pub fn move_message(
        &mut self,
        uid: &str,
        target: &str,
    ) -> Result<MutationDelta, MutationError> {
        let (starred, _) = self.snapshot(uid)?;
        let old_key = self.store.get(uid).map(|m| m.dedup_key());
        match self.catalog.move_message(uid, target)? {
            Some(old_folder) => {
                self.store.mutate(uid, |m| m.folder = target.to_string())?;
                if let (Some(old_key), Some(msg)) = (old_key, self.store.get(uid)) {
                    let new_key = msg.dedup_key();
                    self.derived.rekey(&old_key, &new_key);
                    self.mark_dirty();
                }
                Ok(MutationDelta {
                    uid: uid.to_string(),
                    old_folder,
                    new_folder: target.to_string(),
                    old_starred: starred,
                    new_starred: starred,
                })
            }
            None => Ok(self.unchanged_delta(uid, target.to_string(), starred)),
        }
    }

    /// Soft delete: moves into Trash. Deleting a message that is already in
    /// Trash is the second, permanent delete.
    pub fn delete_message(&mut self, uid: &str) -> Result<MutationDelta, MutationError> {
        let (_, folder) = self.snapshot(uid)?;
        if folder == TRASH_FOLDER {
            return self.purge_message(uid);
        }
        self.move_message(uid, TRASH_FOLDER)
    }

    /// Permanent delete: the record is removed and its uid never reused.
    pub fn purge_message(&mut self, uid: &str) -> Result<MutationDelta, MutationError> {
        let (starred, folder) = self.snapshot(uid)?;
        let key = self.store.get(uid).map(|m| m.dedup_key());
        self.catalog.remove_uid(uid);
        self.store
            .remove(uid)
            .ok_or_else(|| MutationError::UnknownMessage(uid.to_string()))?;
        if let Some(key) = key {
            self.derived.forget(&key);
            self.mark_dirty();
        }
        Ok(MutationDelta {
            uid: uid.to_string(),
            old_folder: folder,
            new_folder: String::new(),
            old_starred: starred,
            new_starred: false,
        })
    }

    pub fn add_folder(&mut self, name: &str) -> Result<(), MutationError> {
        self.catalog.add_folder(name)
    }

    /// Renames the folder and rewrites the folder field of every member,
    /// rekeying their derived-state entries.
    pub fn rename_folder(&mut self, old: &str, new: &str) -> Result<(), MutationError> {
        let members = self.catalog.rename_folder(old, new)?;
        for uid in members {
            let old_key = self.store.get(&uid).map(|m| m.dedup_key());
            self.store.mutate(&uid, |m| m.folder = new.to_string())?;
            if let (Some(old_key), Some(msg)) = (old_key, self.store.get(&uid)) {
                self.derived.rekey(&old_key, &msg.dedup_key());
            }
        }
        self.mark_dirty();
        Ok(())
    }

    /// Deletes the folder; members are soft-deleted into Trash.
    pub fn delete_folder(&mut self, name: &str) -> Result<(), MutationError> {
        let relocated = self.catalog.delete_folder(name)?;
        for uid in relocated {
            let old_key = self.store.get(&uid).map(|m| m.dedup_key());
            self.store
                .mutate(&uid, |m| m.folder = TRASH_FOLDER.to_string())?;
            if let (Some(old_key), Some(msg)) = (old_key, self.store.get(&uid)) {
                self.derived.rekey(&old_key, &msg.dedup_key());
            }
        }
        self.mark_dirty();
        Ok(())
    }

    /// The only creator of Messages. All-or-nothing per batch: the folder
    /// name is validated before any record is written. Newly created
    /// messages get their derived fields overlaid from persisted state by
    /// dedup key; re-observed ones only refresh the seen flag (store rule).
    pub fn merge_batch(&mut self, batch: FetchBatch) -> Result<MergeReport, MutationError> {
        self.catalog.ensure_folder(&batch.folder)?;
        let mut report = MergeReport {
            parse_failures: batch.parse_failures,
            ..MergeReport::default()
        };
        for incoming in batch.messages {
            let key = incoming.dedup_key(&batch.account_id, &batch.folder);
            let (uid, created) = self.store.upsert(&batch.account_id, &batch.folder, incoming);
            if created {
                if let Some(saved) = self.derived.lookup(&key).cloned() {
                    self.store.mutate(&uid, |m| {
                        m.starred = saved.starred;
                        m.tags = saved.tags;
                        m.note = saved.note;
                    })?;
                }
                self.catalog.push_front(&batch.folder, &uid);
                report.created += 1;
            } else {
                report.updated += 1;
            }
        }
        log_debug(&format!(
            "merged batch {}/{}: {} created, {} updated, {} parse failures",
            batch.account_id, batch.folder, report.created, report.updated, report.parse_failures
        ));
        Ok(report)
    }

    /// Writes derived state if dirty and the debounce window has elapsed.
    pub async fn maybe_flush(&mut self) -> Result<()> {
        if self.dirty && self.last_flush.elapsed() >= FLUSH_DEBOUNCE {
            self.flush().await?;
        }
        Ok(())
    }

    /// Forced flush; call on shutdown.
    pub async fn flush(&mut self) -> Result<()> {
        if self.dirty {
            self.persistence.save(&self.derived).await?;
            self.dirty = false;
            self.last_flush = Instant::now();
        }
        Ok(())
    }

    fn snapshot(&self, uid: &str) -> Result<(bool, String), MutationError> {
        let msg = self
            .store
            .get(uid)
            .ok_or_else(|| MutationError::UnknownMessage(uid.to_string()))?;
        Ok((msg.starred, msg.folder.clone()))
    }

    fn unchanged_delta(&self, uid: &str, folder: String, starred: bool) -> MutationDelta {
        MutationDelta {
            uid: uid.to_string(),
            old_folder: folder.clone(),
            new_folder: folder,
            old_starred: starred,
            new_starred: starred,
        }
    }

    fn record_derived(&mut self, uid: &str) {
        if let Some(msg) = self.store.get(uid) {
            let key = msg.dedup_key();
            let derived = MessageDerived::from_message(msg);
            self.derived.record(&key, derived);
            self.mark_dirty();
        }
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}
