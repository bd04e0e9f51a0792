//! Conversation history and caption bookkeeping

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

/// An image attached to a user turn, as a data URI or URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef(pub String);

pub type Attachments = SmallVec<[ImageRef; 2]>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    pub attachments: Attachments,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>, attachments: Attachments) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            attachments,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            attachments: SmallVec::new(),
        }
    }
}

/// Ordered conversation owned by one session.
///
/// User and assistant entries strictly alternate. A user entry that follows
/// another user entry (the reply in between was interrupted before anything
/// was heard) is merged into it.
#[derive(Debug, Default, Clone)]
pub struct History {
    messages: Vec<ConversationMessage>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push_user(&mut self, content: &str, attachments: Attachments) {
        if let Some(last) = self.messages.last_mut() {
            if last.role == Role::User {
                if !content.is_empty() {
                    if !last.content.is_empty() {
                        last.content.push('\n');
                    }
                    last.content.push_str(content);
                }
                last.attachments.extend(attachments);
                return;
            }
        }
        self.messages.push(ConversationMessage::user(content, attachments));
    }

    /// Append the assistant reply. Ignored unless the last entry is a user turn.
    pub fn push_assistant(&mut self, content: &str) -> bool {
        match self.messages.last() {
            Some(last) if last.role == Role::User => {
                self.messages.push(ConversationMessage::assistant(content));
                true
            }
            _ => false,
        }
    }

    /// Text of the last entry, if it is an assistant reply.
    pub fn last_assistant(&self) -> Option<&str> {
        self.messages
            .last()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
    }

    /// Rewrite the last assistant entry to what the user actually heard.
    pub fn truncate_last_assistant(&mut self, content: &str) -> bool {
        match self.messages.last_mut() {
            Some(last) if last.role == Role::Assistant => {
                last.content = content.to_string();
                true
            }
            _ => false,
        }
    }
}

/// A word of synthesized speech with its offsets inside one synthesis turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Caption {
    pub text: String,
    pub start_offset_ms: u64,
    pub end_offset_ms: u64,
}

impl Caption {
    pub fn new(text: impl Into<String>, start_offset_ms: u64, end_offset_ms: u64) -> Self {
        Self {
            text: text.into(),
            start_offset_ms,
            end_offset_ms,
        }
    }
}

/// Text the listener fully heard after `elapsed_ms` of playback.
pub fn heard_prefix(captions: &[Caption], elapsed_ms: u64) -> String {
    captions
        .iter()
        .take_while(|c| c.end_offset_ms <= elapsed_ms)
        .map(|c| c.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}
