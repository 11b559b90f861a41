//! Outbound side of the platform: what a persona may do in its chat.

use async_trait::async_trait;

use crate::chatbot::error::BotError;

/// Presence signal shown while a reply is being prepared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatActivity {
    Typing,
    RecordingVoice,
}

/// A messenger bound to one chat and one bot account.
///
/// Send operations return the platform id of the delivered message.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_text(&self, text: &str) -> Result<String, BotError>;

    async fn send_sticker(&self, sticker_id: &str) -> Result<String, BotError>;

    /// `audio` is OGG Opus.
    async fn send_voice(&self, audio: Vec<u8>) -> Result<String, BotError>;

    async fn notify_activity(&self, activity: ChatActivity) -> Result<(), BotError>;
}
