use std::sync::Arc;

use teloxide::dispatching::ShutdownToken;
use teloxide::prelude::*;
use teloxide::types::{ChatMemberStatus, ChatMemberUpdated};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use chorus::chatbot::session::LOG_FLOOR;
use chorus::chatbot::telegram::{chat_identity, participant, to_chat_message};
use chorus::chatbot::{
    BotError, BotIdentity, ChatCompletionClient, ChatIdentity, ChatPool, ChatSession, Clock, Completion,
    Database, Persona, PersonaServices, SpeechSynthesizer, TelegramMessenger, ThreadRandom, TokioClock,
    TtsClient,
};
use chorus::config::{Config, PersonaConfig};

/// Everything one bot account's handlers need.
struct BotState {
    bot: BotIdentity,
    persona: Arc<PersonaConfig>,
    pool: Arc<ChatPool>,
    completion: Arc<dyn Completion>,
    speech: Option<Arc<dyn SpeechSynthesizer>>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl BotState {
    /// Build this bot's persona for `chat_id`, unless it cannot post there.
    async fn join(
        &self,
        telegram: Bot,
        chat_id: ChatId,
        session: Arc<ChatSession>,
    ) -> Result<Option<Arc<Persona>>, BotError> {
        let messenger = TelegramMessenger::new(telegram, chat_id);
        if !messenger.can_write().await? {
            return Ok(None);
        }

        Ok(Some(Persona::join(
            self.bot.clone(),
            self.persona.clone(),
            session,
            PersonaServices {
                messenger: Arc::new(messenger),
                completion: self.completion.clone(),
                speech: self.speech.clone(),
                clock: self.clock.clone(),
                random: Arc::new(ThreadRandom),
            },
        )))
    }
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "chorus.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let file_appender = tracing_appender::rolling::never(&log_dir, "chorus.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .init();

    info!("🚀 Starting chorus...");
    info!("Loaded config from {config_path} ({} bots)", config.bots.len());

    if let Err(e) = run(config).await {
        error!("Fatal: {e}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), String> {
    let db = Arc::new(Database::open(&config.data_dir.join("chorus.db"))?);
    for chat_id in &config.allowed_chats {
        db.allow_chat(chat_id)?;
    }

    let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
    let completion: Arc<dyn Completion> = Arc::new(ChatCompletionClient::new(config.completion.clone()));
    let speech = config.tts_endpoint.clone().map(|endpoint| {
        info!("Voice replies enabled via {endpoint}");
        Arc::new(TtsClient::new(endpoint)) as Arc<dyn SpeechSynthesizer>
    });

    let session_factory = {
        let db = db.clone();
        let clock = clock.clone();
        Box::new(move |chat: &ChatIdentity| {
            let history = db.recent_messages(chat, LOG_FLOOR).unwrap_or_else(|e| {
                warn!("Failed to restore history for {chat}: {e}");
                Vec::new()
            });
            ChatSession::new(chat.clone(), clock.as_ref())
                .with_archive(db.clone())
                .with_history(history)
        })
    };
    let pool: Arc<ChatPool> = Arc::new(ChatPool::new(db.clone(), session_factory));
    let cancel = CancellationToken::new();

    let mut dispatchers = JoinSet::new();
    let mut shutdown_tokens: Vec<ShutdownToken> = Vec::new();
    for bot_config in &config.bots {
        let telegram = Bot::new(&bot_config.telegram_bot_token);
        let me = telegram
            .get_me()
            .await
            .map_err(|e| format!("Failed to get bot info for {}: {e}", bot_config.persona.name))?;
        info!("🤖 @{} plays {}", me.username(), bot_config.persona.name);

        let state = Arc::new(BotState {
            bot: BotIdentity::new(me.id.0.to_string(), bot_config.persona.name.clone()),
            persona: bot_config.persona.clone(),
            pool: pool.clone(),
            completion: completion.clone(),
            speech: speech.clone(),
            clock: clock.clone(),
            cancel: cancel.clone(),
        });

        let handler = dptree::entry()
            .branch(Update::filter_message().endpoint(handle_message))
            .branch(Update::filter_my_chat_member().endpoint(handle_my_chat_member));

        let mut dispatcher = Dispatcher::builder(telegram, handler)
            .dependencies(dptree::deps![state])
            .build();
        shutdown_tokens.push(dispatcher.shutdown_token());
        dispatchers.spawn(async move { dispatcher.dispatch().await });
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {e}");
    }
    info!("Shutting down...");

    for token in &shutdown_tokens {
        if let Ok(done) = token.shutdown() {
            done.await;
        }
    }
    cancel.cancel();
    pool.gracefully_close().await;
    while dispatchers.join_next().await.is_some() {}

    info!("Bye");
    Ok(())
}

async fn handle_message(telegram: Bot, msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(message) = to_chat_message(&msg) else {
        return Ok(());
    };
    let chat_id = msg.chat.id;
    let chat = chat_identity(chat_id, &state.bot);

    // Consolidation holds the caller for a moment; keep the dispatcher free.
    tokio::spawn(async move {
        let join = |session| state.join(telegram, chat_id, session);
        if let Err(e) = state
            .pool
            .handle_message(&chat, &state.bot, message, join, &state.cancel)
            .await
        {
            warn!("{} could not handle a message in {}: {e}", state.bot.name, chat);
        }
    });
    Ok(())
}

async fn handle_my_chat_member(
    telegram: Bot,
    update: ChatMemberUpdated,
    state: Arc<BotState>,
) -> ResponseResult<()> {
    let present = |status: ChatMemberStatus| {
        matches!(
            status,
            ChatMemberStatus::Owner
                | ChatMemberStatus::Administrator
                | ChatMemberStatus::Member
                | ChatMemberStatus::Restricted
        )
    };
    let was_present = present(update.old_chat_member.status());
    let is_present = present(update.new_chat_member.status());
    let chat_id = update.chat.id;
    let chat = chat_identity(chat_id, &state.bot);

    if !was_present && is_present {
        let invited_by = participant(&update.from);
        tokio::spawn(async move {
            let join = |session| state.join(telegram, chat_id, session);
            if let Err(e) = state
                .pool
                .invite_to_chat(&chat, &state.bot, invited_by, join, &state.cancel)
                .await
            {
                warn!("{} could not join {}: {e}", state.bot.name, chat);
            }
        });
    } else if was_present && !is_present {
        state.pool.kick_from_chat(&chat, &state.bot).await;
    }
    Ok(())
}
