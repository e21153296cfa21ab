use serde::{Deserialize, Serialize};

use crate::error::MutationError;

/// System folders; cannot be renamed or deleted.
pub const PROTECTED_FOLDERS: [&str; 5] = ["Inbox", "Sent", "Drafts", "Spam", "Trash"];
pub const INBOX_FOLDER: &str = "Inbox";
pub const TRASH_FOLDER: &str = "Trash";

/// Reserved name of the always-computed starred view; never a real folder.
pub const FAVORITES_FOLDER: &str = "Favorites";

pub fn is_smart_folder_name(name: &str) -> bool {
    name.eq_ignore_ascii_case(FAVORITES_FOLDER)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderEntry {
    pub name: String,
    /// Member uids, newest arrival first.
    pub uids: Vec<String>,
    pub protected: bool,
}

/// Real-folder membership and folder lifecycle invariants. Every message
/// belongs to exactly one entry here; smart folders have no entry at all.
#[derive(Debug)]
pub struct FolderCatalog {
    folders: Vec<FolderEntry>,
}

impl Default for FolderCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl FolderCatalog {
    pub fn new() -> Self {
        let folders = PROTECTED_FOLDERS
            .iter()
            .map(|name| FolderEntry {
                name: (*name).to_string(),
                uids: Vec::new(),
                protected: true,
            })
            .collect();
        Self { folders }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.folders.iter().position(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn entry(&self, name: &str) -> Option<&FolderEntry> {
        self.folders.iter().find(|f| f.name == name)
    }

    pub fn list_folders(&self) -> Vec<&FolderEntry> {
        self.folders.iter().collect()
    }

    /// The real folder a message currently lives in.
    pub fn folder_of(&self, uid: &str) -> Option<&str> {
        self.folders
            .iter()
            .find(|f| f.uids.iter().any(|u| u == uid))
            .map(|f| f.name.as_str())
    }

    pub fn add_folder(&mut self, name: &str) -> Result<(), MutationError> {
        if is_smart_folder_name(name) {
            return Err(MutationError::ProtectedFolder(name.to_string()));
        }
        if self.contains(name) {
            return Err(MutationError::DuplicateFolder(name.to_string()));
        }
        self.folders.push(FolderEntry {
            name: name.to_string(),
            uids: Vec::new(),
            protected: false,
        });
        Ok(())
    }

    /// Sync-merge path: a remote folder name seen for the first time becomes
    /// a real folder; reserved smart-folder names are rejected before any
    /// record is written.
    pub(crate) fn ensure_folder(&mut self, name: &str) -> Result<(), MutationError> {
        if is_smart_folder_name(name) {
            return Err(MutationError::NotARealFolder(name.to_string()));
        }
        if !self.contains(name) {
            self.folders.push(FolderEntry {
                name: name.to_string(),
                uids: Vec::new(),
                protected: false,
            });
        }
        Ok(())
    }

    /// Renames a non-protected folder, keeping membership. Returns the
    /// member uids so the caller can rewrite each message's folder field.
    pub fn rename_folder(&mut self, old: &str, new: &str) -> Result<Vec<String>, MutationError> {
        if is_smart_folder_name(old) {
            return Err(MutationError::ProtectedFolder(old.to_string()));
        }
        if is_smart_folder_name(new) {
            return Err(MutationError::ProtectedFolder(new.to_string()));
        }
        let idx = self
            .position(old)
            .ok_or_else(|| MutationError::NotARealFolder(old.to_string()))?;
        if self.folders[idx].protected {
            return Err(MutationError::ProtectedFolder(old.to_string()));
        }
        if self.contains(new) {
            return Err(MutationError::DuplicateFolder(new.to_string()));
        }
        self.folders[idx].name = new.to_string();
        Ok(self.folders[idx].uids.clone())
    }

    /// Removes a non-protected folder; members are relocated to Trash (soft
    /// delete), keeping their relative order ahead of Trash's existing
    /// members. Returns the relocated uids.
    pub fn delete_folder(&mut self, name: &str) -> Result<Vec<String>, MutationError> {
        if is_smart_folder_name(name) {
            return Err(MutationError::ProtectedFolder(name.to_string()));
        }
        let idx = self
            .position(name)
            .ok_or_else(|| MutationError::NotARealFolder(name.to_string()))?;
        if self.folders[idx].protected {
            return Err(MutationError::ProtectedFolder(name.to_string()));
        }
        let entry = self.folders.remove(idx);
        let trash_idx = self
            .position(TRASH_FOLDER)
            .ok_or_else(|| MutationError::NotARealFolder(TRASH_FOLDER.to_string()))?;
        let mut relocated = entry.uids.clone();
        relocated.extend(self.folders[trash_idx].uids.drain(..));
        self.folders[trash_idx].uids = relocated;
        Ok(entry.uids)
    }

    /// Moves one message. Idempotent: moving to the current folder is a
    /// no-op success (`Ok(None)`); otherwise returns the previous folder.
    pub fn move_message(
        &mut self,
        uid: &str,
        target: &str,
    ) -> Result<Option<String>, MutationError> {
        if is_smart_folder_name(target) {
            return Err(MutationError::NotARealFolder(target.to_string()));
        }
        let target_idx = self
            .position(target)
            .ok_or_else(|| MutationError::NotARealFolder(target.to_string()))?;
        let current_idx = self
            .folders
            .iter()
            .position(|f| f.uids.iter().any(|u| u == uid))
            .ok_or_else(|| MutationError::UnknownMessage(uid.to_string()))?;
        if current_idx == target_idx {
            return Ok(None);
        }
        let old = self.folders[current_idx].name.clone();
        self.folders[current_idx].uids.retain(|u| u != uid);
        self.folders[target_idx].uids.insert(0, uid.to_string());
        Ok(Some(old))
    }

    /// Membership insert for a newly created message; newest stays in front.
    pub(crate) fn push_front(&mut self, folder: &str, uid: &str) {
        if let Some(idx) = self.position(folder) {
            self.folders[idx].uids.insert(0, uid.to_string());
        }
    }

    /// Drops a uid from whichever folder holds it (permanent delete).
    pub(crate) fn remove_uid(&mut self, uid: &str) {
        for folder in &mut self.folders {
            folder.uids.retain(|u| u != uid);
        }
    }
}
