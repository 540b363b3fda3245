//! Environment-derived configuration.
//!
//! Everything the bridge needs is collected once at startup into
//! [`BridgeConfig`]; missing required keys fail fast with a [`ConfigError`]
//! naming the variable, so a misconfigured deployment never gets far enough
//! to place a call.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors; fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Telephony carrier selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhoneProvider {
    Telnyx,
    Twilio,
}

/// Streaming STT backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SttBackend {
    OpenAi,
    Deepgram,
}

/// Carrier credentials and numbers.
#[derive(Debug, Clone)]
pub struct PhoneConfig {
    pub provider: PhoneProvider,
    pub account_sid: String,
    pub auth_token: String,
    /// The number calls are placed from.
    pub phone_number: String,
    /// The number calls are placed to.
    pub user_phone_number: String,
    /// Telnyx webhook-signing public key (base64). Optional; when absent,
    /// Telnyx webhooks are accepted unverified.
    pub telnyx_public_key: Option<String>,
}

/// Text-to-speech provider settings (OpenAI-compatible endpoint).
#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub api_key: String,
    /// Alternate OpenAI-compatible endpoint. The URL also selects the
    /// response flavor: a host containing "lemonfox" answers with WAV.
    pub base_url: Option<String>,
    pub voice: String,
    pub model: String,
    /// Advertised PCM rate; overridden by the WAV header when present.
    pub sample_rate: u32,
}

/// Streaming speech-to-text settings.
#[derive(Debug, Clone)]
pub struct SttConfig {
    pub backend: SttBackend,
    pub api_key: String,
    pub model: Option<String>,
    /// Endpointing threshold: silence after speech that closes an utterance.
    pub silence_duration_ms: u64,
}

/// HTTP server and exposure settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Public base URL the carrier can reach, e.g. `https://bridge.example.com`.
    pub public_url: String,
}

impl ServerConfig {
    /// WebSocket URL the carrier streams call media to.
    pub fn media_ws_url(&self) -> String {
        let ws_base = self
            .public_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{}/media-stream", ws_base.trim_end_matches('/'))
    }

    /// Status-callback URL for carrier call events.
    pub fn status_callback_url(&self) -> String {
        format!("{}/status", self.public_url.trim_end_matches('/'))
    }

    /// URL of the instruction document the carrier fetches on pickup.
    pub fn call_instruction_url(&self) -> String {
        format!("{}/call-instruction", self.public_url.trim_end_matches('/'))
    }
}

/// Top-level configuration snapshot, immutable after startup.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub phone: PhoneConfig,
    pub tts: TtsConfig,
    pub stt: SttConfig,
    pub server: ServerConfig,
    /// How long a listening turn waits for an utterance.
    pub transcript_timeout_ms: u64,
}

impl BridgeConfig {
    /// Reads configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads configuration through an arbitrary lookup; `from_env` in
    /// production, a map in tests.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get_trimmed = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        let require = |key: &'static str| get_trimmed(key).ok_or(ConfigError::Missing(key));

        let provider = match get_trimmed("PHONE_PROVIDER").as_deref() {
            None | Some("telnyx") => PhoneProvider::Telnyx,
            Some("twilio") => PhoneProvider::Twilio,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "PHONE_PROVIDER",
                    value: other.to_string(),
                })
            }
        };

        let phone = PhoneConfig {
            provider,
            account_sid: require("PHONE_ACCOUNT_SID")?,
            auth_token: require("PHONE_AUTH_TOKEN")?,
            phone_number: require("PHONE_NUMBER")?,
            user_phone_number: require("USER_PHONE_NUMBER")?,
            telnyx_public_key: get_trimmed("TELNYX_PUBLIC_KEY"),
        };

        let tts = TtsConfig {
            api_key: require("TTS_API_KEY")?,
            base_url: get_trimmed("TTS_BASE_URL"),
            voice: get_trimmed("TTS_VOICE").unwrap_or_else(|| "alloy".to_string()),
            model: get_trimmed("TTS_MODEL").unwrap_or_else(|| "tts-1".to_string()),
            sample_rate: parse_or("TTS_SAMPLE_RATE", &get_trimmed, 24_000)?,
        };

        let stt_api_key = require("STT_API_KEY")?;
        let backend = match get_trimmed("STT_PROVIDER").as_deref() {
            Some("openai") => SttBackend::OpenAi,
            Some("deepgram") => SttBackend::Deepgram,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "STT_PROVIDER",
                    value: other.to_string(),
                })
            }
            // OpenAI keys are recognizable by prefix; anything else is
            // treated as a Deepgram key.
            None if stt_api_key.starts_with("sk-") => SttBackend::OpenAi,
            None => SttBackend::Deepgram,
        };

        let stt = SttConfig {
            backend,
            api_key: stt_api_key,
            model: get_trimmed("STT_MODEL"),
            silence_duration_ms: parse_or("STT_SILENCE_DURATION_MS", &get_trimmed, 800)?,
        };

        let server = ServerConfig {
            port: parse_or("PORT", &get_trimmed, 3333)?,
            public_url: require("PUBLIC_URL")?,
        };

        Ok(Self {
            phone,
            tts,
            stt,
            server,
            transcript_timeout_ms: parse_or("TRANSCRIPT_TIMEOUT_MS", &get_trimmed, 180_000)?,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    key: &'static str,
    get: &impl Fn(&str) -> Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            key,
            value: raw.clone(),
        }),
    }
}
