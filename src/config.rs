use chrono::TimeDelta;
use regex::Regex;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// A trigger phrase did not compile.
    InvalidRegex { pattern: String, source: regex::Error },
    /// Validation error.
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFile { path, source } => {
                write!(f, "failed to read config file '{}': {}", path.display(), source)
            }
            Self::ParseJson { path, source } => {
                write!(f, "failed to parse config file '{}': {}", path.display(), source)
            }
            Self::InvalidRegex { pattern, source } => {
                write!(f, "invalid trigger pattern '{}': {}", pattern, source)
            }
            Self::Validation(msg) => write!(f, "config validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFile { source, .. } => Some(source),
            Self::ParseJson { source, .. } => Some(source),
            Self::InvalidRegex { source, .. } => Some(source),
            Self::Validation(_) => None,
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    /// Directory for state files (logs, database). Defaults to current directory.
    data_dir: Option<String>,
    /// Chats the bots may talk in. Seeded into the database allow-list.
    #[serde(default)]
    allowed_chats: Vec<i64>,
    #[serde(default)]
    completion: CompletionFile,
    /// TTS endpoint (e.g., "http://localhost:8880"). Voice replies are off without it.
    tts_endpoint: Option<String>,
    #[serde(default)]
    bots: Vec<BotFile>,
}

#[derive(Deserialize)]
struct CompletionFile {
    #[serde(default = "default_completion_endpoint")]
    endpoint: String,
    #[serde(default)]
    api_key: String,
    #[serde(default = "default_model")]
    model: String,
    #[serde(default = "default_max_tokens")]
    max_tokens: u32,
}

impl Default for CompletionFile {
    fn default() -> Self {
        Self {
            endpoint: default_completion_endpoint(),
            api_key: String::new(),
            model: default_model(),
            max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Deserialize)]
struct BotFile {
    telegram_bot_token: String,
    persona: PersonaFile,
}

#[derive(Deserialize)]
struct PersonaFile {
    name: String,
    #[serde(default)]
    directive: String,
    /// Substring keywords that wake the persona outside its cooldown.
    #[serde(default)]
    triggers: Vec<String>,
    /// Whole-word phrases that always wake the persona.
    #[serde(default)]
    mandatory_triggers: Vec<String>,
    #[serde(default = "default_context_size")]
    context_size: usize,
    #[serde(default = "default_context_chars")]
    context_chars: usize,
    /// Every Nth+1 reply is spoken (0 = never).
    #[serde(default)]
    voice_cadence: u32,
    #[serde(default = "default_cooldown_minutes")]
    cooldown_minutes: i64,
    #[serde(default = "default_true")]
    cooldown_enabled: bool,
    bad_response_keywords: Option<Vec<String>>,
    greeting: Option<String>,
    greeting_sticker: Option<String>,
    voice: Option<String>,
}

fn default_completion_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_tokens() -> u32 {
    512
}

fn default_context_size() -> usize {
    20
}

fn default_context_chars() -> usize {
    8000
}

fn default_cooldown_minutes() -> i64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_bad_response_keywords() -> Vec<String> {
    ["as an ai", "language model", "i cannot assist", "i'm sorry, but"]
        .into_iter()
        .map(String::from)
        .collect()
}

const DEFAULT_GREETING: &str =
    "You have just been added to this chat. Say hello to everyone in one or two sentences, in character.";

/// A phrase that must appear as a whole word, compared case-insensitively.
#[derive(Debug, Clone)]
pub struct MandatoryTrigger {
    phrase: String,
    pattern: Regex,
}

impl MandatoryTrigger {
    pub fn new(phrase: &str) -> Result<Self, ConfigError> {
        let pattern = format!(r"(?i)(?:^|[^\w]){}(?:[^\w]|$)", regex::escape(phrase.trim()));
        let pattern = Regex::new(&pattern)
            .map_err(|e| ConfigError::InvalidRegex { pattern: phrase.to_string(), source: e })?;
        Ok(Self {
            phrase: phrase.trim().to_lowercase(),
            pattern,
        })
    }

    pub fn phrase(&self) -> &str {
        &self.phrase
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }
}

/// Immutable persona settings, shared by reference between all instances of
/// one bot. Mutable reply state lives on the persona instance, never here.
#[derive(Debug, Clone)]
pub struct PersonaConfig {
    pub name: String,
    /// System-level personality prompt, prepended to every reduced context.
    pub directive: String,
    /// Lowercased substring keywords.
    pub triggers: Vec<String>,
    pub mandatory_triggers: Vec<MandatoryTrigger>,
    /// Max messages sent to the completion service.
    pub context_size: usize,
    /// Character budget for the reduced context.
    pub context_chars: usize,
    pub voice_cadence: u32,
    pub cooldown: TimeDelta,
    pub cooldown_enabled: bool,
    /// Lowercased phrases that mark a completion as unusable.
    pub bad_response_keywords: Vec<String>,
    pub greeting: String,
    pub greeting_sticker: Option<String>,
    /// TTS reference voice id.
    pub voice: Option<String>,
}

impl PersonaConfig {
    pub fn new(name: impl Into<String>, directive: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            directive: directive.into(),
            triggers: Vec::new(),
            mandatory_triggers: Vec::new(),
            context_size: default_context_size(),
            context_chars: default_context_chars(),
            voice_cadence: 0,
            cooldown: TimeDelta::minutes(default_cooldown_minutes()),
            cooldown_enabled: true,
            bad_response_keywords: default_bad_response_keywords(),
            greeting: DEFAULT_GREETING.to_string(),
            greeting_sticker: None,
            voice: None,
        }
    }

    pub fn with_triggers<I, S>(mut self, triggers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.triggers = triggers
            .into_iter()
            .map(|t| t.as_ref().trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        self
    }

    pub fn with_mandatory_triggers<I, S>(mut self, phrases: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.mandatory_triggers = phrases
            .into_iter()
            .filter(|p| !p.as_ref().trim().is_empty())
            .map(|p| MandatoryTrigger::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self)
    }

    fn from_file(file: PersonaFile) -> Result<Self, ConfigError> {
        if file.name.trim().is_empty() {
            return Err(ConfigError::Validation("persona name must not be empty".into()));
        }
        if file.context_size == 0 {
            return Err(ConfigError::Validation(format!(
                "persona '{}': context_size must be at least 1",
                file.name
            )));
        }
        if file.cooldown_minutes < 0 {
            return Err(ConfigError::Validation(format!(
                "persona '{}': cooldown_minutes must not be negative",
                file.name
            )));
        }

        let mut persona = Self::new(file.name, file.directive)
            .with_triggers(file.triggers)
            .with_mandatory_triggers(file.mandatory_triggers)?;
        persona.context_size = file.context_size;
        persona.context_chars = file.context_chars;
        persona.voice_cadence = file.voice_cadence;
        persona.cooldown = TimeDelta::minutes(file.cooldown_minutes);
        persona.cooldown_enabled = file.cooldown_enabled;
        if let Some(keywords) = file.bad_response_keywords {
            persona.bad_response_keywords = keywords.into_iter().map(|k| k.to_lowercase()).collect();
        }
        if let Some(greeting) = file.greeting {
            persona.greeting = greeting;
        }
        persona.greeting_sticker = file.greeting_sticker;
        persona.voice = file.voice;
        Ok(persona)
    }
}

/// OpenAI-compatible chat completion settings.
#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
}

/// One Telegram bot account and the persona it plays.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub telegram_bot_token: String,
    pub persona: Arc<PersonaConfig>,
}

pub struct Config {
    /// Path to the config file.
    pub config_path: PathBuf,
    /// Directory for state files (logs, database).
    pub data_dir: PathBuf,
    pub allowed_chats: Vec<String>,
    pub completion: CompletionConfig,
    pub tts_endpoint: Option<String>,
    pub bots: Vec<BotConfig>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::ReadFile { path: config_path.clone(), source: e })?;
        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?;

        if file.bots.is_empty() {
            return Err(ConfigError::Validation("bots must contain at least one bot".into()));
        }

        let mut bots = Vec::with_capacity(file.bots.len());
        for bot in file.bots {
            validate_token(&bot.telegram_bot_token)?;
            bots.push(BotConfig {
                telegram_bot_token: bot.telegram_bot_token,
                persona: Arc::new(PersonaConfig::from_file(bot.persona)?),
            });
        }

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            config_path,
            data_dir,
            allowed_chats: file.allowed_chats.iter().map(|id| id.to_string()).collect(),
            completion: CompletionConfig {
                endpoint: file.completion.endpoint,
                api_key: file.completion.api_key,
                model: file.completion.model,
                max_tokens: file.completion.max_tokens,
            },
            tts_endpoint: file.tts_endpoint.filter(|e| !e.is_empty()),
            bots,
        })
    }
}

/// Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric.
fn validate_token(token: &str) -> Result<(), ConfigError> {
    if token.is_empty() {
        return Err(ConfigError::Validation("telegram_bot_token is required".into()));
    }
    let parts: Vec<&str> = token.split(':').collect();
    if parts.len() != 2 || parts[0].parse::<u64>().is_err() || parts[1].is_empty() {
        return Err(ConfigError::Validation(
            "telegram_bot_token appears invalid (expected format: 123456789:ABCdefGHI...)".into(),
        ));
    }
    Ok(())
}
