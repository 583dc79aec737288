use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};

/// Upper bound on stored messages per contact.
pub const MAX_CONTEXT_MESSAGES: usize = 10;

/// Sender label used for replies produced by the model.
pub const ASSISTANT_SENDER: &str = "AI Assistant";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextMessage {
    pub sender_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ContextMessage {
    pub fn new(sender_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender_name: sender_name.into(),
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn as_history_line(&self) -> String {
        format!("{}: {}", self.sender_name, self.text)
    }
}

/// Rolling per-contact history, trimmed from the front.
#[derive(Debug, Default)]
pub struct ConversationContexts {
    entries: HashMap<String, VecDeque<ContextMessage>>,
}

impl ConversationContexts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recent(&self, contact: &str, count: usize) -> Vec<ContextMessage> {
        let Some(messages) = self.entries.get(contact) else {
            return Vec::new();
        };
        let skip = messages.len().saturating_sub(count);
        messages.iter().skip(skip).cloned().collect()
    }

    pub fn record(&mut self, contact: &str, message: ContextMessage) {
        let messages = self.entries.entry(contact.to_owned()).or_default();
        messages.push_back(message);
        while messages.len() > MAX_CONTEXT_MESSAGES {
            messages.pop_front();
        }
    }

    /// Records an inbound message and the reply sent for it.
    pub fn record_exchange(&mut self, contact: &str, inbound: &str, reply: &str) {
        self.record(contact, ContextMessage::new(contact, inbound));
        self.record(contact, ContextMessage::new(ASSISTANT_SENDER, reply));
    }

    pub fn message_count(&self, contact: &str) -> usize {
        self.entries.get(contact).map_or(0, VecDeque::len)
    }
}
