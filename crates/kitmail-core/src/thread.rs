use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;

use sha2::{Digest, Sha256};

use crate::store::MessageStore;
use crate::{Message, Thread};

/// Sentinel for subjects that normalize to nothing, so empty-subject
/// conversations between different participant sets stay separate.
pub const NO_SUBJECT: &str = "(no subject)";

const REPLY_MARKERS: [&str; 8] = [
    "re:", "fwd:", "fw:", "odp:", "przekaż:", "przekaz:", "aw:", "wg:",
];

/// Strips a leading run of reply/forward markers, lower-cases and trims.
pub fn normalize_subject(raw: &str) -> String {
    let mut subject = raw.trim().to_lowercase();
    loop {
        let mut stripped = false;
        for marker in REPLY_MARKERS {
            if let Some(rest) = subject.strip_prefix(marker) {
                subject = rest.trim_start().to_string();
                stripped = true;
                break;
            }
        }
        if !stripped {
            break;
        }
    }
    let subject = subject.trim();
    if subject.is_empty() {
        NO_SUBJECT.to_string()
    } else {
        subject.to_string()
    }
}

/// Sender plus primary recipients, lower-cased, deduplicated, sorted for
/// order-independence.
pub fn participant_set(msg: &Message) -> Vec<String> {
    let mut set = BTreeSet::new();
    let from = msg.from_address.trim().to_lowercase();
    if !from.is_empty() {
        set.insert(from);
    }
    for addr in &msg.to_addresses {
        let addr = addr.trim().to_lowercase();
        if !addr.is_empty() {
            set.insert(addr);
        }
    }
    set.into_iter().collect()
}

/// Pure function of (normalized subject, participant set): 128 bits of
/// SHA-256, hex encoded. Stable for identical inputs regardless of arrival
/// order.
pub fn thread_id(msg: &Message) -> String {
    thread_id_for(&normalize_subject(&msg.subject), &participant_set(msg))
}

pub fn thread_id_for(normalized_subject: &str, participants: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized_subject.as_bytes());
    hasher.update(b":");
    hasher.update(participants.join(",").as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for byte in &digest[..16] {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

/// Conversation groupings derived from the store on read. Never persisted;
/// recomputed whenever the store revision moves, so it cannot go stale
/// relative to its messages.
#[derive(Debug, Default)]
pub struct ThreadIndex {
    revision: Option<u64>,
    groups: HashMap<String, Vec<String>>,
    by_uid: HashMap<String, String>,
}

impl ThreadIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn refresh(&mut self, store: &MessageStore) {
        if self.revision == Some(store.revision()) {
            return;
        }
        self.groups.clear();
        self.by_uid.clear();
        let mut members: HashMap<String, Vec<&Message>> = HashMap::new();
        for msg in store.all() {
            members.entry(thread_id(msg)).or_default().push(msg);
        }
        for (id, mut msgs) in members {
            // Newest first; uid breaks sent_at ties deterministically.
            msgs.sort_by(|a, b| b.sent_at.cmp(&a.sent_at).then_with(|| b.uid.cmp(&a.uid)));
            for msg in &msgs {
                self.by_uid.insert(msg.uid.clone(), id.clone());
            }
            self.groups
                .insert(id, msgs.into_iter().map(|m| m.uid.clone()).collect());
        }
        self.revision = Some(store.revision());
    }

    /// The newest member, shown as the collapsed row of a thread.
    pub fn parent_of<'a>(&mut self, store: &'a MessageStore, thread: &str) -> Option<&'a Message> {
        self.refresh(store);
        self.groups
            .get(thread)
            .and_then(|uids| uids.first())
            .and_then(|uid| store.get(uid))
    }

    pub fn count_of(&mut self, store: &MessageStore, thread: &str) -> usize {
        self.refresh(store);
        self.groups.get(thread).map_or(0, Vec::len)
    }

    pub fn thread_of(&mut self, store: &MessageStore, uid: &str) -> Option<String> {
        self.refresh(store);
        self.by_uid.get(uid).cloned()
    }

    /// All threads, newest parent first.
    pub fn threads(&mut self, store: &MessageStore) -> Vec<Thread> {
        self.refresh(store);
        let mut out: Vec<Thread> = self
            .groups
            .iter()
            .map(|(id, uids)| Thread {
                id: id.clone(),
                member_uids: uids.clone(),
            })
            .collect();
        out.sort_by(|a, b| {
            let sent_of = |t: &Thread| {
                t.member_uids
                    .first()
                    .and_then(|uid| store.get(uid))
                    .map(|m| m.sent_at)
            };
            sent_of(b).cmp(&sent_of(a)).then_with(|| a.id.cmp(&b.id))
        });
        out
    }
}
