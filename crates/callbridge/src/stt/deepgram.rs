//! Deepgram live-transcription dialect.
//!
//! Configuration rides the query string; audio goes up as raw binary
//! frames; results come down as `Results`/`UtteranceEnd` JSON messages.

use tokio_tungstenite::tungstenite::protocol::Message;

use super::{SttEngine, SttEvent};
use crate::config::SttConfig;

const LISTEN_URL: &str = "wss://api.deepgram.com/v1/listen";
const DEFAULT_MODEL: &str = "nova-2";

pub struct DeepgramEngine {
    api_key: String,
    model: String,
    silence_duration_ms: u64,
}

impl DeepgramEngine {
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
}

impl SttEngine for DeepgramEngine {
    fn name(&self) -> &'static str {
        "deepgram"
    }

    fn connect_request(&self) -> (String, Vec<(&'static str, String)>) {
        // Deepgram requires utterance_end_ms >= 1000.
        let utterance_end_ms = self.silence_duration_ms.max(1000);
        let url = format!(
            "{LISTEN_URL}?model={}&encoding=mulaw&sample_rate=8000&channels=1\
             &interim_results=true&smart_format=true&endpointing={}&utterance_end_ms={}",
            self.model, self.silence_duration_ms, utterance_end_ms
        );
        let headers = vec![("authorization", format!("Token {}", self.api_key))];
        (url, headers)
    }

    fn audio_message(&self, mulaw: &[u8]) -> Message {
        Message::Binary(mulaw.to_vec().into())
    }

    fn keepalive_message(&self) -> Option<Message> {
        Some(Message::Text(r#"{"type":"KeepAlive"}"#.into()))
    }

    fn close_message(&self) -> Option<Message> {
        Some(Message::Text(r#"{"type":"CloseStream"}"#.into()))
    }

    fn parse_event(&self, text: &str) -> Vec<SttEvent> {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
            return vec![];
        };

        match value["type"].as_str() {
            Some("Results") => {
                let transcript = value["channel"]["alternatives"][0]["transcript"]
                    .as_str()
                    .unwrap_or("")
                    .to_string();
                let is_final = value["is_final"].as_bool().unwrap_or(false);
                let speech_final = value["speech_final"].as_bool().unwrap_or(false);

                if is_final {
                    vec![SttEvent::Final {
                        text: transcript,
                        speech_final,
                    }]
                } else if transcript.is_empty() {
                    vec![]
                } else {
                    vec![SttEvent::Interim(transcript)]
                }
            }
            Some("UtteranceEnd") => vec![SttEvent::UtteranceEnd],
            Some("Error") => vec![SttEvent::Error(
                value["description"]
                    .as_str()
                    .or_else(|| value["message"].as_str())
                    .unwrap_or("unknown")
                    .to_string(),
            )],
            _ => vec![],
        }
    }
}
