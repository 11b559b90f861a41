//! Message and identity types, plus prompt rendering with injection prevention.
//!
//! User content is rendered as XML with entity escaping so `<`, `>`, `&`
//! become `&lt;`, `&gt;`, `&amp;` and cannot close the surrounding tag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who produced a message, from the point of view of the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    System,
    User,
    /// Written back into history by a persona after it replied.
    BotOwn,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::System => "system",
            MessageKind::User => "user",
            MessageKind::BotOwn => "bot_own",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "system" => MessageKind::System,
            "bot_own" => MessageKind::BotOwn,
            _ => MessageKind::User,
        }
    }
}

/// A chat participant as shown in history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Participant {
    pub name: String,
}

impl Participant {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A configured bot account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BotIdentity {
    pub id: String,
    pub name: String,
}

impl BotIdentity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// External chat id, optionally scoped to one bot for private 1:1 chats.
///
/// The same physical private chat yields a distinct identity per bot, so each
/// persona gets its own session there.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatIdentity {
    pub chat_id: String,
    pub private_to: Option<String>,
}

impl ChatIdentity {
    pub fn group(chat_id: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            private_to: None,
        }
    }

    pub fn private(chat_id: impl Into<String>, bot_id: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            private_to: Some(bot_id.into()),
        }
    }

    pub fn is_private(&self) -> bool {
        self.private_to.is_some()
    }
}

impl fmt::Display for ChatIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.private_to {
            Some(bot) => write!(f, "{}@{}", self.chat_id, bot),
            None => write!(f, "{}", self.chat_id),
        }
    }
}

/// An immutable chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Platform-unique id. Copies of the same inbound event share it.
    pub id: String,
    pub kind: MessageKind,
    pub sender: Participant,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Id of the sender this message replies to, if any.
    pub reply_to_id: Option<String>,
}

impl ChatMessage {
    pub fn user(
        id: impl Into<String>,
        sender: impl Into<String>,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: MessageKind::User,
            sender: Participant::new(sender),
            text: text.into(),
            timestamp,
            reply_to_id: None,
        }
    }

    /// A persona's own answer, written back into history.
    pub fn bot_own(
        id: impl Into<String>,
        bot: &BotIdentity,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: MessageKind::BotOwn,
            sender: Participant::new(bot.name.clone()),
            text: text.into(),
            timestamp,
            reply_to_id: None,
        }
    }

    /// The directive message that opens every reduced context.
    pub fn directive(persona: &str, text: impl Into<String>) -> Self {
        Self {
            id: "directive".to_string(),
            kind: MessageKind::System,
            sender: Participant::new(persona),
            text: text.into(),
            timestamp: DateTime::<Utc>::MIN_UTC,
            reply_to_id: None,
        }
    }

    pub fn replying_to(mut self, sender_id: impl Into<String>) -> Self {
        self.reply_to_id = Some(sender_id.into());
        self
    }

    /// Copy of this message re-tagged as a user turn.
    ///
    /// Used when another persona's message lands in this persona's context,
    /// so it is never presented as this persona's own words.
    pub fn as_user_turn(&self) -> Self {
        Self {
            kind: MessageKind::User,
            ..self.clone()
        }
    }

    /// Format message as XML for inclusion in a completion prompt.
    ///
    /// Example output:
    /// ```xml
    /// <msg name="Alice" time="10:31">hey everyone</msg>
    /// ```
    pub fn format(&self) -> String {
        format!(
            "<msg name=\"{}\" time=\"{}\">{}</msg>",
            xml_escape_attr(&self.sender.name),
            self.timestamp.format("%H:%M"),
            xml_escape(&self.text)
        )
    }
}

/// Escape a string for safe inclusion in XML content.
fn xml_escape(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => result.push_str("&lt;"),
            '>' => result.push_str("&gt;"),
            '&' => result.push_str("&amp;"),
            _ => result.push(c),
        }
    }
    result
}

/// Escape a string for safe inclusion in XML attributes (also escapes quotes).
fn xml_escape_attr(s: &str) -> String {
    xml_escape(s).replace('"', "&quot;")
}
