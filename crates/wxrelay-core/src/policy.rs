//! Forwarding decision: which inbound events become notifications.
//!
//! Groups the account is a member of are relayed unconditionally. Other groups
//! are suppressed unless a text message carries a mention-all marker.

use crate::{
    directory::GroupSnapshot,
    domain::{Content, InboundEvent, Origin},
};

/// Literal the chat backend inserts when a message mentions everyone.
pub const DEFAULT_MENTION_ALL_MARKERS: &[&str] = &["@所有人", "@all"];

/// Subject/body pair produced by a positive decision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Forward {
    pub subject: String,
    pub body: String,
}

#[derive(Clone, Debug)]
pub struct ForwardingPolicy {
    mention_all_markers: Vec<String>,
}

impl Default for ForwardingPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MENTION_ALL_MARKERS.iter().map(|m| m.to_string()))
    }
}

impl ForwardingPolicy {
    pub fn new(markers: impl IntoIterator<Item = String>) -> Self {
        Self {
            mention_all_markers: markers
                .into_iter()
                .filter(|m| !m.trim().is_empty())
                .collect(),
        }
    }

    pub fn decide(&self, event: &InboundEvent, directory: &GroupSnapshot) -> Option<Forward> {
        let body = event.content.render()?;

        let forward = match &event.origin {
            Origin::Unknown => false,
            Origin::Direct => true,
            Origin::Group { group_id } => {
                directory.contains(group_id) || self.mentions_all(event)
            }
        };
        if !forward {
            return None;
        }

        Some(Forward {
            subject: event.sender.resolved_name().to_string(),
            body,
        })
    }

    fn mentions_all(&self, event: &InboundEvent) -> bool {
        match &event.content {
            Content::Text { body } => self
                .mention_all_markers
                .iter()
                .any(|m| body.contains(m.as_str())),
            _ => false,
        }
    }
}
