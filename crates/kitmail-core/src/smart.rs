use chrono::{DateTime, Duration, Utc};

use crate::Message;
use crate::folder::TRASH_FOLDER;
use crate::store::MessageStore;

/// Rule-based virtual folders. Membership is computed on every read from
/// current store state and never cached across a mutation; staleness here
/// is a user-visible bug class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmartFolder {
    Unread,
    WithAttachments,
    RecentDays(i64),
    /// Also how the "Favorites" virtual folder is rendered.
    Starred,
    LargerThan(u64),
}

impl SmartFolder {
    pub fn matches(&self, msg: &Message, now: DateTime<Utc>) -> bool {
        match self {
            SmartFolder::Unread => !msg.read,
            SmartFolder::WithAttachments => !msg.attachments.is_empty(),
            SmartFolder::RecentDays(days) => now - msg.sent_at <= Duration::days(*days),
            SmartFolder::Starred => msg.starred,
            SmartFolder::LargerThan(bytes) => msg.size_bytes >= *bytes,
        }
    }

    /// Filtered, unsorted view over the store, excluding Trash.
    pub fn evaluate<'a>(&self, store: &'a MessageStore, now: DateTime<Utc>) -> Vec<&'a Message> {
        store
            .all()
            .into_iter()
            .filter(|m| m.folder != TRASH_FOLDER)
            .filter(|m| self.matches(m, now))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use crate::{Attachment, IncomingMessage};

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap()
    }

    fn incoming(subject: &str, days_ago: i64, size: u64, read: bool) -> IncomingMessage {
        IncomingMessage {
            remote_id: None,
            from_address: "alice@example.com".to_string(),
            from_display_name: "Alice".to_string(),
            to_addresses: vec!["me@example.com".to_string()],
            subject: subject.to_string(),
            sent_at: now() - Duration::days(days_ago),
            size_bytes: size,
            body: String::new(),
            attachments: Vec::new(),
            read,
        }
    }

    #[test]
    fn unread_and_starred_views() {
        let mut store = MessageStore::new();
        let (unread, _) = store.upsert("a", "Inbox", incoming("one", 1, 100, false));
        let (read, _) = store.upsert("a", "Inbox", incoming("two", 1, 100, true));
        store.mutate(&read, |m| m.starred = true).unwrap();

        let unread_view = SmartFolder::Unread.evaluate(&store, now());
        assert_eq!(unread_view.len(), 1);
        assert_eq!(unread_view[0].uid, unread);

        let starred_view = SmartFolder::Starred.evaluate(&store, now());
        assert_eq!(starred_view.len(), 1);
        assert_eq!(starred_view[0].uid, read);
    }

    #[test]
    fn recent_days_uses_sent_at() {
        let mut store = MessageStore::new();
        store.upsert("a", "Inbox", incoming("fresh", 2, 100, true));
        store.upsert("a", "Inbox", incoming("stale", 30, 100, true));
        let recent = SmartFolder::RecentDays(7).evaluate(&store, now());
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].subject, "fresh");
    }

    #[test]
    fn larger_than_is_inclusive() {
        let mut store = MessageStore::new();
        store.upsert("a", "Inbox", incoming("big", 1, 2048, true));
        store.upsert("a", "Inbox", incoming("small", 1, 512, true));
        let large = SmartFolder::LargerThan(2048).evaluate(&store, now());
        assert_eq!(large.len(), 1);
        assert_eq!(large[0].subject, "big");
    }

    #[test]
    fn attachments_view_and_trash_exclusion() {
        let mut store = MessageStore::new();
        let mut with_att = incoming("att", 1, 100, false);
        with_att.attachments.push(Attachment {
            filename: "report.pdf".to_string(),
            mime: "application/pdf".to_string(),
            size_bytes: 4096,
        });
        let (uid, _) = store.upsert("a", "Inbox", with_att);
        store.upsert("a", "Inbox", incoming("plain", 1, 100, false));

        assert_eq!(SmartFolder::WithAttachments.evaluate(&store, now()).len(), 1);

        store
            .mutate(&uid, |m| m.folder = TRASH_FOLDER.to_string())
            .unwrap();
        assert!(SmartFolder::WithAttachments.evaluate(&store, now()).is_empty());
    }
}
