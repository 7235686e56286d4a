use serde::{Deserialize, Serialize};

/// Where an inbound message came from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Origin {
    /// One-to-one chat with a contact.
    Direct,
    /// Group chat; `group_id` is the directory key.
    Group {
        #[serde(rename = "groupId")]
        group_id: String,
    },
    /// Official accounts, broadcast-style senders, anything unrecognised.
    #[serde(other)]
    Unknown,
}

/// Decoded message payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Content {
    Text { body: String },
    Picture,
    Voice,
    Video,
    Emoticon,
    #[serde(other)]
    Unknown,
}

impl Content {
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text { body: body.into() }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text { .. })
    }

    /// Body used in the outgoing notification, `None` when there is nothing to render.
    pub fn render(&self) -> Option<String> {
        let placeholder = match self {
            Self::Text { body } => return Some(body.clone()),
            Self::Picture => "[image]",
            Self::Voice => "[voice]",
            Self::Video => "[video]",
            Self::Emoticon => "[sticker]",
            Self::Unknown => return None,
        };
        Some(placeholder.to_string())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sender {
    /// Name the backend reports for the sender.
    pub display_name: String,
    /// Operator-assigned remark name, if any.
    #[serde(default)]
    pub alias: Option<String>,
}

impl Sender {
    pub fn named(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            alias: None,
        }
    }

    /// Prefer the operator alias over the backend display name.
    pub fn resolved_name(&self) -> &str {
        match self.alias.as_deref() {
            Some(alias) if !alias.trim().is_empty() => alias,
            _ => &self.display_name,
        }
    }
}

/// One inbound chat message as delivered by the session provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    pub origin: Origin,
    pub sender: Sender,
    pub content: Content,
    /// Sent by the logged-in account itself (e.g. from another device).
    #[serde(default)]
    pub from_self: bool,
}

/// A group as listed by the session provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub id: String,
    pub name: String,
}

/// A notification waiting to be delivered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotificationJob {
    pub subject: String,
    pub body: String,
    pub attempts_remaining: u32,
}

impl NotificationJob {
    pub fn new(subject: impl Into<String>, body: impl Into<String>, attempts: u32) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
            attempts_remaining: attempts,
        }
    }
}
