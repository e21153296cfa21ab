use crate::Message;

/// Display-subset query composed by the presentation layer. All predicates
/// are AND-combined; an empty query is the identity.
#[derive(Debug, Clone, Default)]
pub struct FilterQuery {
    pub text: String,
    pub tag: Option<String>,
    pub favorites_only: bool,
}

impl FilterQuery {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.tag.is_none() && !self.favorites_only
    }
}

/// Pure, side-effect free; safe to call on every keystroke.
pub fn apply<'a>(candidates: Vec<&'a Message>, query: &FilterQuery) -> Vec<&'a Message> {
    if query.is_empty() {
        return candidates;
    }
    let needle = query.text.trim().to_lowercase();
    candidates
        .into_iter()
        .filter(|msg| matches(msg, &needle, query))
        .collect()
}

fn matches(msg: &Message, needle: &str, query: &FilterQuery) -> bool {
    if !needle.is_empty()
        && !msg.subject.to_lowercase().contains(needle)
        && !msg.from_display_name.to_lowercase().contains(needle)
        && !msg.from_address.to_lowercase().contains(needle)
        && !msg.note.to_lowercase().contains(needle)
    {
        return false;
    }
    if let Some(tag) = &query.tag {
        if !msg.tags.iter().any(|t| t == tag) {
            return false;
        }
    }
    if query.favorites_only && !msg.starred {
        return false;
    }
    true
}
