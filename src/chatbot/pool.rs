//! Registry of chat sessions and the personas sitting in them.
//!
//! Every bot's platform adapter routes its events through one shared
//! [`ChatPool`]. The pool creates a session the first time a chat is seen and a
//! persona the first time a bot needs to act in that chat, both exactly once
//! even when several bots deliver the same event concurrently. A persona that
//! shuts itself down is evicted, so the next event for that bot builds a fresh
//! one.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chatbot::error::BotError;
use crate::chatbot::message::{BotIdentity, ChatIdentity, ChatMessage, Participant};
use crate::chatbot::persona::Persona;
use crate::chatbot::session::ChatSession;

/// How long `gracefully_close` waits for members and sessions to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Decides which chats the bots may act in at all.
pub trait AllowList: Send + Sync {
    fn is_allowed_chat(&self, chat_id: &str) -> bool;
}

/// Fixed set of chat ids.
pub struct StaticAllowList(HashSet<String>);

impl StaticAllowList {
    pub fn new<I, S>(chats: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(chats.into_iter().map(Into::into).collect())
    }
}

impl AllowList for StaticAllowList {
    fn is_allowed_chat(&self, chat_id: &str) -> bool {
        self.0.contains(chat_id)
    }
}

/// A bot's presence in one chat, as seen by the pool.
#[async_trait]
pub trait ChatMember: Send + Sync + 'static {
    /// Feed an inbound message into the member's chat.
    async fn trigger(&self, message: ChatMessage) -> Result<(), BotError>;

    /// Say hello after being added to the chat.
    async fn greet(&self, invited_by: Participant) -> Result<(), BotError>;

    /// Leave the chat. Idempotent.
    async fn shutdown(&self);

    /// Cancelled once the member has shut down.
    fn shutdown_signal(&self) -> CancellationToken;
}

pub type SessionFactory = Box<dyn Fn(&ChatIdentity) -> ChatSession + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MemberKey {
    chat: ChatIdentity,
    bot_id: String,
}

impl MemberKey {
    fn new(chat: &ChatIdentity, bot_id: &str) -> Self {
        Self {
            chat: chat.clone(),
            bot_id: bot_id.to_string(),
        }
    }
}

pub struct ChatPool<M: ChatMember = Persona> {
    allow_list: Arc<dyn AllowList>,
    session_factory: SessionFactory,
    sessions: DashMap<ChatIdentity, Arc<ChatSession>>,
    members: Arc<DashMap<MemberKey, Arc<M>>>,
    /// Serializes session and member creation; lookups never take it.
    creation: Mutex<()>,
}

impl<M: ChatMember> ChatPool<M> {
    pub fn new(allow_list: Arc<dyn AllowList>, session_factory: SessionFactory) -> Self {
        Self {
            allow_list,
            session_factory,
            sessions: DashMap::new(),
            members: Arc::new(DashMap::new()),
            creation: Mutex::new(()),
        }
    }

    /// Route an inbound message to `bot`'s member in `chat`, creating the
    /// session and member on first use.
    ///
    /// `join` builds the member. It may return `Ok(None)` when the bot cannot
    /// take part (e.g. no write access); the message is then dropped and
    /// nothing is registered.
    pub async fn handle_message<F, Fut>(
        &self,
        chat: &ChatIdentity,
        bot: &BotIdentity,
        message: ChatMessage,
        join: F,
        cancel: &CancellationToken,
    ) -> Result<(), BotError>
    where
        F: FnOnce(Arc<ChatSession>) -> Fut,
        Fut: Future<Output = Result<Option<Arc<M>>, BotError>>,
    {
        let Some(member) = self.ensure_member(chat, bot, join, cancel).await? else {
            return Ok(());
        };
        member.trigger(message).await
    }

    /// The bot was added to `chat`: join it and greet.
    pub async fn invite_to_chat<F, Fut>(
        &self,
        chat: &ChatIdentity,
        bot: &BotIdentity,
        invited_by: Participant,
        join: F,
        cancel: &CancellationToken,
    ) -> Result<(), BotError>
    where
        F: FnOnce(Arc<ChatSession>) -> Fut,
        Fut: Future<Output = Result<Option<Arc<M>>, BotError>>,
    {
        info!("📨 {} invited to {} by {}", bot.name, chat, invited_by.name);
        let Some(member) = self.ensure_member(chat, bot, join, cancel).await? else {
            return Ok(());
        };
        member.greet(invited_by).await
    }

    /// The bot was removed from `chat`: shut its member down if there is one.
    pub async fn kick_from_chat(&self, chat: &ChatIdentity, bot: &BotIdentity) {
        let member = self
            .members
            .get(&MemberKey::new(chat, &bot.id))
            .map(|entry| entry.value().clone());
        match member {
            Some(member) => {
                info!("🚪 {} removed from {}", bot.name, chat);
                member.shutdown().await;
            }
            None => debug!("{} removed from {}, was not active there", bot.name, chat),
        }
    }

    /// Shut down every member and close every session, waiting at most
    /// a few seconds for them.
    pub async fn gracefully_close(&self) {
        let members: Vec<Arc<M>> = self.members.iter().map(|e| e.value().clone()).collect();
        let sessions: Vec<Arc<ChatSession>> = self.sessions.iter().map(|e| e.value().clone()).collect();
        info!(
            "Closing {} personas across {} chat sessions",
            members.len(),
            sessions.len()
        );

        let mut tasks = JoinSet::new();
        for member in members {
            tasks.spawn(async move { member.shutdown().await });
        }
        for session in sessions {
            tasks.spawn(async move { session.close().await });
        }

        let drained = timeout(SHUTDOWN_GRACE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Shutdown grace period elapsed with tasks still running");
        }
    }

    pub fn session(&self, chat: &ChatIdentity) -> Option<Arc<ChatSession>> {
        self.sessions.get(chat).map(|entry| entry.value().clone())
    }

    /// The live member for `bot_id` in `chat`, if any.
    pub fn member(&self, chat: &ChatIdentity, bot_id: &str) -> Option<Arc<M>> {
        self.live_member(&MemberKey::new(chat, bot_id))
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    async fn ensure_member<F, Fut>(
        &self,
        chat: &ChatIdentity,
        bot: &BotIdentity,
        join: F,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<M>>, BotError>
    where
        F: FnOnce(Arc<ChatSession>) -> Fut,
        Fut: Future<Output = Result<Option<Arc<M>>, BotError>>,
    {
        if !self.allow_list.is_allowed_chat(&chat.chat_id) {
            debug!("Ignoring {} for {}: chat not allowed", chat, bot.name);
            return Ok(None);
        }

        let key = MemberKey::new(chat, &bot.id);
        if let Some(member) = self.live_member(&key) {
            return Ok(Some(member));
        }

        let session = self.ensure_session(chat, cancel).await?;

        let _creating = self.lock_creation(cancel).await?;
        if let Some(member) = self.live_member(&key) {
            return Ok(Some(member));
        }
        let Some(member) = join(session).await? else {
            debug!("{} did not join {}", bot.name, chat);
            return Ok(None);
        };
        self.members.insert(key.clone(), member.clone());
        self.evict_on_shutdown(key, member.clone());
        Ok(Some(member))
    }

    async fn ensure_session(
        &self,
        chat: &ChatIdentity,
        cancel: &CancellationToken,
    ) -> Result<Arc<ChatSession>, BotError> {
        if let Some(session) = self.session(chat) {
            return Ok(session);
        }

        let _creating = self.lock_creation(cancel).await?;
        if let Some(session) = self.session(chat) {
            return Ok(session);
        }
        let session = Arc::new((self.session_factory)(chat));
        self.sessions.insert(chat.clone(), session.clone());
        info!("📂 Opened chat session {}", chat);
        Ok(session)
    }

    /// A member that has shut down counts as absent even before its
    /// eviction task has run.
    fn live_member(&self, key: &MemberKey) -> Option<Arc<M>> {
        self.members
            .get(key)
            .map(|entry| entry.value().clone())
            .filter(|member| !member.shutdown_signal().is_cancelled())
    }

    async fn lock_creation(&self, cancel: &CancellationToken) -> Result<MutexGuard<'_, ()>, BotError> {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(BotError::Cancelled),
            guard = self.creation.lock() => Ok(guard),
        }
    }

    /// Drop `member` from the registry once it shuts down, unless it has
    /// already been replaced.
    fn evict_on_shutdown(&self, key: MemberKey, member: Arc<M>) {
        let members = Arc::clone(&self.members);
        let signal = member.shutdown_signal();
        tokio::spawn(async move {
            signal.cancelled().await;
            let evicted = members
                .remove_if(&key, |_, current| Arc::ptr_eq(current, &member))
                .is_some();
            if evicted {
                debug!("Evicted {} from {}", key.bot_id, key.chat);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_allow_list() {
        let allow = StaticAllowList::new(["-100", "42"]);
        assert!(allow.is_allowed_chat("-100"));
        assert!(allow.is_allowed_chat("42"));
        assert!(!allow.is_allowed_chat("7"));
    }

    #[test]
    fn test_member_key_separates_private_scopes() {
        let a = MemberKey::new(&ChatIdentity::private("5", "bot-a"), "bot-a");
        let b = MemberKey::new(&ChatIdentity::private("5", "bot-b"), "bot-a");
        assert_ne!(a, b);
    }
}
