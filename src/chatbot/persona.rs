//! One bot playing one persona in one chat.
//!
//! A persona listens to its chat session, asks its reply strategy whether a
//! new message deserves an answer, and if so generates, paces and delivers
//! it, then writes the answer back into the session for everyone else.
//! Any failure on that path shuts the persona down so the pool builds a
//! fresh one on the next message.

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chatbot::completion::Completion;
use crate::chatbot::error::BotError;
use crate::chatbot::imitator::ReplyImitator;
use crate::chatbot::message::{BotIdentity, ChatMessage, Participant};
use crate::chatbot::messenger::{ChatActivity, Messenger};
use crate::chatbot::pool::ChatMember;
use crate::chatbot::reply_mode::{ReplyMode, ReplyModePicker};
use crate::chatbot::session::{ChatSession, SubscriptionId};
use crate::chatbot::strategy::ReplyStrategy;
use crate::chatbot::timing::{Clock, RandomSource};
use crate::chatbot::tts::SpeechSynthesizer;
use crate::config::PersonaConfig;

/// Completion attempts before a bad response is sent anyway.
const MAX_ATTEMPTS: usize = 3;

/// External services a persona talks to.
#[derive(Clone)]
pub struct PersonaServices {
    pub messenger: Arc<dyn Messenger>,
    pub completion: Arc<dyn Completion>,
    pub speech: Option<Arc<dyn SpeechSynthesizer>>,
    pub clock: Arc<dyn Clock>,
    pub random: Arc<dyn RandomSource>,
}

pub struct Persona {
    bot: BotIdentity,
    config: Arc<PersonaConfig>,
    session: Arc<ChatSession>,
    services: PersonaServices,
    strategy: Mutex<ReplyStrategy>,
    modes: Mutex<ReplyModePicker>,
    /// Cancelled on shutdown; doubles as the shutdown notification.
    cancel: CancellationToken,
    responding: AtomicBool,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl Persona {
    /// Create a persona and subscribe it to `session`.
    ///
    /// `bot.name` must be the persona's name: own messages are recognised by it.
    pub fn join(
        bot: BotIdentity,
        config: Arc<PersonaConfig>,
        session: Arc<ChatSession>,
        services: PersonaServices,
    ) -> Arc<Self> {
        let strategy = ReplyStrategy::new(
            bot.clone(),
            config.clone(),
            session.identity().is_private(),
            services.clock.clone(),
        );
        let persona = Arc::new(Self {
            modes: Mutex::new(ReplyModePicker::new(config.voice_cadence)),
            strategy: Mutex::new(strategy),
            bot,
            config,
            session,
            services,
            cancel: CancellationToken::new(),
            responding: AtomicBool::new(false),
            subscription: Mutex::new(None),
        });

        let (id, rx) = persona.session.subscribe(&persona.bot.name);
        *lock(&persona.subscription) = Some(id);
        tokio::spawn(listen(Arc::downgrade(&persona), rx, persona.cancel.clone()));

        info!("🤖 {} joined {}", persona.bot.name, persona.session.identity());
        persona
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// React to a message that landed in the session log.
    async fn on_message(&self, message: ChatMessage) -> Result<(), BotError> {
        if self.is_shut_down() {
            return Ok(());
        }
        let Some(_in_flight) = InFlight::acquire(&self.responding) else {
            debug!("{} is busy, skipping {}", self.bot.name, message.id);
            return Ok(());
        };

        let snapshot = self.session.snapshot();
        let context = lock(&self.strategy).decide(&message, &snapshot);
        let Some(context) = context else {
            return Ok(());
        };

        info!(
            "💬 {} answering in {} ({} messages of context)",
            self.bot.name,
            self.session.identity(),
            context.len()
        );
        let result = self.reply(context).await;
        self.shut_down_on_error(result)
    }

    async fn reply(&self, context: Vec<ChatMessage>) -> Result<(), BotError> {
        let mut mode = lock(&self.modes).pick();
        if mode == ReplyMode::Voice && self.services.speech.is_none() {
            mode = ReplyMode::Text;
        }

        let imitator = self.start_imitating(mode.activity());
        let text = self.generate(&context).await?;
        imitator.finish_replying(&text).await;

        let sent_id = match (mode, &self.services.speech) {
            (ReplyMode::Voice, Some(speech)) => {
                let audio = self
                    .cancellable(speech.synthesize(&text, self.config.voice.as_deref()))
                    .await?;
                self.cancellable(self.services.messenger.send_voice(audio)).await?
            }
            _ => self.cancellable(self.services.messenger.send_text(&text)).await?,
        };
        self.remember_own(sent_id, text);
        Ok(())
    }

    /// Ask for a completion, retrying responses that trip the bad-keyword filter.
    async fn generate(&self, context: &[ChatMessage]) -> Result<String, BotError> {
        let mut attempt = 1;
        loop {
            let text = self
                .cancellable(self.services.completion.complete(context))
                .await?;
            if attempt >= MAX_ATTEMPTS || !self.is_bad_response(&text) {
                return Ok(text);
            }
            warn!(
                "{} got a bad response (attempt {}/{}), retrying",
                self.bot.name, attempt, MAX_ATTEMPTS
            );
            attempt += 1;
        }
    }

    async fn greet_chat(&self, invited_by: &Participant) -> Result<(), BotError> {
        if let Some(ref sticker) = self.config.greeting_sticker {
            self.cancellable(self.services.messenger.send_sticker(sticker)).await?;
        }

        let imitator = self.start_imitating(ChatActivity::Typing);
        let instruction = format!("{}\n\nYou were invited by {}.", self.config.greeting, invited_by.name);
        let text = self
            .cancellable(
                self.services
                    .completion
                    .custom_response(&self.config.directive, &instruction),
            )
            .await?;
        imitator.finish_replying(&text).await;

        let sent_id = self.cancellable(self.services.messenger.send_text(&text)).await?;
        self.remember_own(sent_id, text);
        Ok(())
    }

    fn start_imitating(&self, activity: ChatActivity) -> ReplyImitator {
        ReplyImitator::start(
            self.services.messenger.clone(),
            activity,
            self.services.random.clone(),
            self.cancel.child_token(),
        )
    }

    fn is_bad_response(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        self.config
            .bad_response_keywords
            .iter()
            .any(|k| text.contains(k.as_str()))
    }

    /// Write our answer back into the chat so other personas see it.
    fn remember_own(&self, message_id: String, text: String) {
        let message = ChatMessage::bot_own(message_id, &self.bot, text, self.services.clock.now());
        if !self.session.append(message) {
            debug!("{}: own message not logged in {}", self.bot.name, self.session.identity());
        }
    }

    async fn cancellable<T, F>(&self, operation: F) -> Result<T, BotError>
    where
        F: Future<Output = Result<T, BotError>>,
    {
        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => Err(BotError::Cancelled),
            result = operation => result,
        }
    }

    fn shut_down_on_error(&self, result: Result<(), BotError>) -> Result<(), BotError> {
        if let Err(ref e) = result
            && !matches!(e, BotError::Cancelled)
        {
            warn!("{} failed in {}: {e}, shutting down", self.bot.name, self.session.identity());
            self.shut_down();
        }
        result
    }

    fn shut_down(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        if let Some(id) = lock(&self.subscription).take() {
            self.session.unsubscribe(id);
        }
        self.cancel.cancel();
        info!("👋 {} left {}", self.bot.name, self.session.identity());
    }
}

#[async_trait]
impl ChatMember for Persona {
    async fn trigger(&self, message: ChatMessage) -> Result<(), BotError> {
        if self.is_shut_down() {
            return Ok(());
        }
        // Appending broadcasts to every subscribed persona, this one included.
        self.session.handle_inbound(message).await;
        Ok(())
    }

    async fn greet(&self, invited_by: Participant) -> Result<(), BotError> {
        let Some(_in_flight) = InFlight::acquire(&self.responding) else {
            return Ok(());
        };
        info!("🎉 {} greeting {}", self.bot.name, self.session.identity());
        let result = self.greet_chat(&invited_by).await;
        self.shut_down_on_error(result)
    }

    async fn shutdown(&self) {
        self.shut_down();
    }

    fn shutdown_signal(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Dispatch session broadcasts to the persona until it shuts down.
///
/// Each message is handled on its own task; the in-flight guard keeps at most
/// one reply going, and messages skipped meanwhile stay visible to the next
/// decision through the session log.
async fn listen(
    persona: Weak<Persona>,
    mut rx: mpsc::UnboundedReceiver<ChatMessage>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let Some(persona) = persona.upgrade() else {
            break;
        };
        tokio::spawn(async move {
            if let Err(e) = persona.on_message(message).await {
                error!("{} could not reply in {}: {e}", persona.bot.name, persona.session.identity());
            }
        });
    }
}

/// Holds the in-flight flag for as long as it lives.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
