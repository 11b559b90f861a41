//! Text-to-speech for voice replies.
//!
//! Talks to a Fish Speech compatible `/v1/tts` endpoint and converts the WAV
//! it returns into OGG Opus, the format Telegram plays as a voice message.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::chatbot::error::BotError;

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// OGG Opus audio for `text`, spoken with `voice` if given.
    async fn synthesize(&self, text: &str, voice: Option<&str>) -> Result<Vec<u8>, BotError>;
}

/// Reference voice used when the persona does not name one.
const DEFAULT_VOICE: &str = "xtts_female";

pub struct TtsClient {
    endpoint: String,
    client: reqwest::Client,
}

impl TtsClient {
    /// `endpoint` is the server's base URL, e.g. "http://localhost:8880".
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn tts_url(&self) -> String {
        format!("{}/v1/tts", self.endpoint)
    }
}

#[async_trait]
impl SpeechSynthesizer for TtsClient {
    async fn synthesize(&self, text: &str, voice: Option<&str>) -> Result<Vec<u8>, BotError> {
        let preview: String = text.chars().take(50).collect();
        info!("🔊 TTS: \"{}\"", preview);

        let response = self
            .client
            .post(self.tts_url())
            .json(&serde_json::json!({
                "text": text,
                "format": "wav",
                "reference_id": voice.unwrap_or(DEFAULT_VOICE),
            }))
            .send()
            .await
            .map_err(|e| BotError::Speech(format!("TTS request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BotError::Speech(format!("TTS error {status}: {body}")));
        }

        let wav = response
            .bytes()
            .await
            .map_err(|e| BotError::Speech(format!("Failed to read TTS response: {e}")))?;
        debug!("Got {} bytes of WAV audio", wav.len());

        wav_to_ogg(wav.to_vec()).await
    }
}

/// Pipe WAV through ffmpeg into OGG Opus.
///
/// Prepends 300ms of silence: Telegram clips the start of voice messages.
async fn wav_to_ogg(wav: Vec<u8>) -> Result<Vec<u8>, BotError> {
    let mut child = Command::new("ffmpeg")
        .args([
            "-y",
            "-f", "lavfi",
            "-i", "anullsrc=r=44100:cl=mono",
            "-i", "pipe:0",
            "-filter_complex", "[0]atrim=0:0.3[silence];[silence][1:a]concat=n=2:v=0:a=1",
            "-c:a", "libopus",
            "-b:a", "64k",
            "-f", "ogg",
            "pipe:1",
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| BotError::Speech(format!("Failed to run ffmpeg: {e}")))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| BotError::Speech("ffmpeg stdin unavailable".to_string()))?;
    let wav_len = wav.len();
    let writer = tokio::spawn(async move {
        let result = stdin.write_all(&wav).await;
        drop(stdin);
        result
    });

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| BotError::Speech(format!("ffmpeg failed: {e}")))?;
    if let Ok(Err(e)) = writer.await {
        debug!("ffmpeg closed stdin early: {e}");
    }

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BotError::Speech(format!("ffmpeg conversion failed: {stderr}")));
    }

    debug!("Converted WAV ({} bytes) to OGG ({} bytes)", wav_len, output.stdout.len());
    Ok(output.stdout)
}
