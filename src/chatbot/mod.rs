//! Chatbot module - several personas sharing Telegram chats.

pub mod completion;
pub mod database;
pub mod error;
pub mod imitator;
pub mod message;
pub mod messenger;
pub mod persona;
pub mod pool;
pub mod reply_mode;
pub mod session;
pub mod strategy;
pub mod telegram;
pub mod timing;
pub mod tts;


pub use completion::{ChatCompletionClient, Completion};
pub use database::Database;
pub use error::BotError;
pub use message::{BotIdentity, ChatIdentity, ChatMessage, MessageKind, Participant};
pub use messenger::{ChatActivity, Messenger};
pub use persona::{Persona, PersonaServices};
pub use pool::{AllowList, ChatMember, ChatPool, StaticAllowList};
pub use session::ChatSession;
pub use strategy::ReplyStrategy;
pub use telegram::TelegramMessenger;
pub use timing::{Clock, RandomSource, ThreadRandom, TokioClock};
pub use tts::{SpeechSynthesizer, TtsClient};
