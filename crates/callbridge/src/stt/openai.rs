//! OpenAI realtime-transcription dialect.
//!
//! The session is configured in-band after connect (`g711_ulaw` input,
//! server-side VAD with the configured silence threshold); audio rides in
//! base64 JSON envelopes; each VAD-segmented utterance arrives as a
//! `transcription.completed` event, so completions are endpoint-final.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio_tungstenite::tungstenite::protocol::Message;

use super::{SttEngine, SttEvent};
use crate::config::SttConfig;

const REALTIME_URL: &str = "wss://api.openai.com/v1/realtime?intent=transcription";
const DEFAULT_MODEL: &str = "gpt-4o-mini-transcribe";

pub struct OpenAiRealtimeEngine {
    api_key: String,
    model: String,
    silence_duration_ms: u64,
}

impl OpenAiRealtimeEngine {
    pub fn new(config: &SttConfig) -> Self {
        Self {
            api_key: config.api_key.clone(),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            silence_duration_ms: config.silence_duration_ms,
        }
    }

    fn session_update(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "transcription_session.update",
            "session": {
                "input_audio_format": "g711_ulaw",
                "input_audio_transcription": { "model": self.model },
                "turn_detection": {
                    "type": "server_vad",
                    "silence_duration_ms": self.silence_duration_ms,
                },
            },
        })
    }
}

impl SttEngine for OpenAiRealtimeEngine {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn connect_request(&self) -> (String, Vec<(&'static str, String)>) {
        (
            REALTIME_URL.to_string(),
            vec![
                ("authorization", format!("Bearer {}", self.api_key)),
                ("openai-beta", "realtime=v1".to_string()),
            ],
        )
    }

    fn init_message(&self) -> Option<Message> {
        Some(Message::Text(self.session_update().to_string().into()))
    }

    fn audio_message(&self, mulaw: &[u8]) -> Message {
        let envelope = serde_json::json!({
            "type": "input_audio_buffer.append",
            "audio": BASE64.encode(mulaw),
        });
        Message::Text(envelope.to_string().into())
    }

    fn keepalive_message(&self) -> Option<Message> {
        Some(Message::Ping(Vec::new().into()))
    }

    fn parse_event(&self, text: &str) -> Vec<SttEvent> {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
            return vec![];
        };

        match value["type"].as_str() {
            Some("conversation.item.input_audio_transcription.delta") => {
                match value["delta"].as_str() {
                    Some(delta) if !delta.is_empty() => vec![SttEvent::Interim(delta.to_string())],
                    _ => vec![],
                }
            }
            Some("conversation.item.input_audio_transcription.completed") => {
                vec![SttEvent::Final {
                    text: value["transcript"].as_str().unwrap_or("").to_string(),
                    speech_final: true,
                }]
            }
            Some("error") => vec![SttEvent::Error(
                value["error"]["message"]
                    .as_str()
                    .unwrap_or("unknown")
                    .to_string(),
            )],
            _ => vec![],
        }
    }
}
