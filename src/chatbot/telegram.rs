//! Telegram adapter using teloxide.
//!
//! Inbound updates are converted to [`ChatMessage`]s here; outbound actions go
//! through [`TelegramMessenger`], one per bot per chat. Message ids are
//! `"<chat id>:<message id>"`, unique across chats.

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, ChatMemberKind, ChatMemberStatus, FileId, InputFile, User};
use tracing::{info, warn};

use crate::chatbot::error::BotError;
use crate::chatbot::message::{BotIdentity, ChatIdentity, ChatMessage, Participant};
use crate::chatbot::messenger::{ChatActivity, Messenger};

pub struct TelegramMessenger {
    bot: Bot,
    chat_id: ChatId,
}

impl TelegramMessenger {
    pub fn new(bot: Bot, chat_id: ChatId) -> Self {
        Self { bot, chat_id }
    }

    /// Whether this bot account may post in the chat.
    pub async fn can_write(&self) -> Result<bool, BotError> {
        if self.chat_id.is_user() {
            return Ok(true);
        }

        let me = self
            .bot
            .get_me()
            .await
            .map_err(|e| BotError::Join(format!("Failed to get bot info: {e}")))?;
        let member = self
            .bot
            .get_chat_member(self.chat_id, me.id)
            .await
            .map_err(|e| BotError::Join(format!("Failed to get chat member: {e}")))?;

        let allowed = may_post(&member.kind);
        if !allowed {
            info!("🔒 Bot @{} cannot write in chat {}", me.username(), self.chat_id);
        }
        Ok(allowed)
    }

    fn message_id(&self, message: &Message) -> String {
        message_id(message.chat.id, message.id.0)
    }
}

#[async_trait]
impl Messenger for TelegramMessenger {
    async fn send_text(&self, text: &str) -> Result<String, BotError> {
        self.bot
            .send_message(self.chat_id, text)
            .await
            .map(|msg| self.message_id(&msg))
            .map_err(|e| delivery_error("send", e))
    }

    async fn send_sticker(&self, sticker_id: &str) -> Result<String, BotError> {
        let sticker = InputFile::file_id(FileId(sticker_id.to_string()));
        self.bot
            .send_sticker(self.chat_id, sticker)
            .await
            .map(|msg| self.message_id(&msg))
            .map_err(|e| delivery_error("send sticker", e))
    }

    async fn send_voice(&self, audio: Vec<u8>) -> Result<String, BotError> {
        info!("🔊 Sending voice to chat {} ({} bytes)", self.chat_id, audio.len());
        let input_file = InputFile::memory(audio).file_name("voice.ogg");
        self.bot
            .send_voice(self.chat_id, input_file)
            .await
            .map(|msg| self.message_id(&msg))
            .map_err(|e| delivery_error("send voice", e))
    }

    async fn notify_activity(&self, activity: ChatActivity) -> Result<(), BotError> {
        let action = match activity {
            ChatActivity::Typing => ChatAction::Typing,
            ChatActivity::RecordingVoice => ChatAction::RecordVoice,
        };
        self.bot
            .send_chat_action(self.chat_id, action)
            .await
            .map(|_| ())
            .map_err(|e| delivery_error("send chat action", e))
    }
}

fn delivery_error(what: &str, e: teloxide::RequestError) -> BotError {
    let msg = format!("Failed to {what}: {e}");
    warn!("{}", msg);
    BotError::Delivery(msg)
}

fn may_post(kind: &ChatMemberKind) -> bool {
    match kind.status() {
        ChatMemberStatus::Owner | ChatMemberStatus::Administrator | ChatMemberStatus::Member => true,
        ChatMemberStatus::Restricted => matches!(kind, ChatMemberKind::Restricted(r) if r.can_send_messages),
        ChatMemberStatus::Left | ChatMemberStatus::Banned => false,
    }
}

pub fn message_id(chat_id: ChatId, message_id: i32) -> String {
    format!("{}:{}", chat_id.0, message_id)
}

/// The session a chat maps to for `bot`. Private chats get one per bot.
pub fn chat_identity(chat_id: ChatId, bot: &BotIdentity) -> ChatIdentity {
    if chat_id.is_user() {
        ChatIdentity::private(chat_id.0.to_string(), bot.id.clone())
    } else {
        ChatIdentity::group(chat_id.0.to_string())
    }
}

pub fn participant(user: &User) -> Participant {
    let name = match user.username.as_deref() {
        Some(username) => username.to_string(),
        None => user.full_name(),
    };
    Participant::new(name)
}

/// Convert an inbound Telegram message. `None` for messages without text.
pub fn to_chat_message(msg: &Message) -> Option<ChatMessage> {
    let text = msg.text().or_else(|| msg.caption())?;
    let sender = match msg.from.as_ref() {
        Some(user) => participant(user).name,
        None => msg
            .sender_chat
            .as_ref()
            .and_then(|c| c.title())
            .unwrap_or("unknown")
            .to_string(),
    };

    let message = ChatMessage::user(message_id(msg.chat.id, msg.id.0), sender, text, msg.date);
    let replied_to = msg
        .reply_to_message()
        .and_then(|reply| reply.from.as_ref())
        .map(|user| user.id.0.to_string());
    Some(match replied_to {
        Some(sender_id) => message.replying_to(sender_id),
        None => message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_ids_are_chat_scoped() {
        assert_eq!(message_id(ChatId(-1001), 7), "-1001:7");
        assert_ne!(message_id(ChatId(1), 7), message_id(ChatId(2), 7));
    }

    fn member_kind(json: serde_json::Value) -> ChatMemberKind {
        serde_json::from_value(json).unwrap()
    }

    fn restricted(can_send_messages: bool) -> ChatMemberKind {
        member_kind(serde_json::json!({
            "status": "restricted",
            "until_date": 0,
            "is_member": true,
            "can_send_messages": can_send_messages,
            "can_send_audios": false,
            "can_send_documents": false,
            "can_send_photos": false,
            "can_send_videos": false,
            "can_send_video_notes": false,
            "can_send_voice_notes": false,
            "can_send_other_messages": false,
            "can_add_web_page_previews": false,
            "can_change_info": false,
            "can_invite_users": false,
            "can_pin_messages": false,
            "can_manage_topics": false,
            "can_send_polls": false
        }))
    }

    #[test]
    fn test_write_access_by_member_status() {
        assert!(may_post(&member_kind(serde_json::json!({"status": "member"}))));
        assert!(!may_post(&member_kind(serde_json::json!({"status": "left"}))));
        assert!(may_post(&restricted(true)));
        assert!(!may_post(&restricted(false)));
    }

    #[test]
    fn test_private_chats_are_scoped_per_bot() {
        let marvin = BotIdentity::new("11", "Marvin");
        let eddie = BotIdentity::new("12", "Eddie");

        let private = chat_identity(ChatId(5), &marvin);
        assert!(private.is_private());
        assert_ne!(private, chat_identity(ChatId(5), &eddie));

        let group = chat_identity(ChatId(-100), &marvin);
        assert!(!group.is_private());
        assert_eq!(group, chat_identity(ChatId(-100), &eddie));
    }
}
