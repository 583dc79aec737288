use anyhow::Result;
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapedMessage {
    pub outgoing: bool,
    pub text: String,
}

impl ScrapedMessage {
    pub fn inbound(text: impl Into<String>) -> Self {
        Self {
            outgoing: false,
            text: text.into(),
        }
    }

    pub fn outgoing(text: impl Into<String>) -> Self {
        Self {
            outgoing: true,
            text: text.into(),
        }
    }
}

/// The operations the reply loop needs from a messaging web client.
///
/// `open_chat` makes the chat current; `recent_messages` and `send_message`
/// act on whichever chat was opened last.
#[async_trait]
pub trait ChatSurface: Send + Sync {
    type Chat: Send + Sync;

    /// Chats currently showing an unread indicator.
    async fn unread_chats(&self) -> Result<Vec<Self::Chat>>;

    /// Opens the chat and returns the contact name from its header.
    async fn open_chat(&self, chat: &Self::Chat) -> Result<String>;

    /// Up to `limit` of the newest messages, oldest first. Elements that
    /// cannot be read are left out.
    async fn recent_messages(&self, limit: usize) -> Result<Vec<ScrapedMessage>>;

    async fn send_message(&self, text: &str) -> Result<()>;

    /// False once the underlying browser connection is gone.
    fn is_connected(&self) -> bool {
        true
    }
}
