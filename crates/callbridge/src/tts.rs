//! Text-to-speech synthesis against OpenAI-compatible speech endpoints.
//!
//! One provider covers the family: the official OpenAI API and the
//! compatible clones that differ only in base URL and response format.
//! Hosts containing "lemonfox" answer with WAV (whose header then overrides
//! the configured sample rate); everything else is asked for raw PCM.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::TtsConfig;
use crate::wav::{parse_wav, WavError};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Synthesis errors. Non-fatal to the call: the session retries the turn
/// once and then surfaces the failure to the agent.
#[derive(Debug, Error)]
pub enum TtsError {
    #[error("TTS request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TTS provider returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("TTS provider returned an empty audio body")]
    EmptyAudio,

    #[error("unusable TTS audio: {0}")]
    BadAudio(#[from] WavError),
}

/// One-shot synthesis result: s16le mono PCM and its actual rate.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
}

/// Lazily produced synthesis: PCM byte chunks at a fixed rate.
pub struct TtsStream {
    pub sample_rate: u32,
    pub chunks: mpsc::Receiver<Result<Bytes, TtsError>>,
}

/// Text-to-speech capability.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    fn name(&self) -> &str;

    fn voice(&self) -> &str;

    /// The PCM rate the provider produces (streaming path; the one-shot
    /// path may override it from a WAV header).
    fn sample_rate(&self) -> u32;

    /// Synthesizes the full utterance in one request.
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio, TtsError>;

    /// Synthesizes lazily: PCM byte chunks arrive as the provider produces
    /// them. Restartable per call, not per chunk.
    async fn synthesize_stream(&self, text: &str) -> Result<TtsStream, TtsError>;
}

/// How the upstream encodes its audio response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseFlavor {
    /// Raw s16le PCM at the advertised rate.
    Pcm,
    /// RIFF/WAVE; the header is authoritative for the rate.
    Wav,
}

/// OpenAI-compatible `/audio/speech` client.
pub struct OpenAiTts {
    client: reqwest::Client,
    config: TtsConfig,
    flavor: ResponseFlavor,
}

impl OpenAiTts {
    pub fn new(config: TtsConfig) -> Self {
        let flavor = match &config.base_url {
            Some(url) if url.contains("lemonfox") => ResponseFlavor::Wav,
            _ => ResponseFlavor::Pcm,
        };
        Self {
            client: reqwest::Client::new(),
            config,
            flavor,
        }
    }

    fn endpoint(&self) -> String {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or(OPENAI_BASE_URL)
            .trim_end_matches('/');
        format!("{base}/audio/speech")
    }

    fn payload(&self, text: &str) -> serde_json::Value {
        serde_json::json!({
            "model": self.config.model,
            "input": text,
            "voice": self.config.voice,
            "response_format": match self.flavor {
                ResponseFlavor::Pcm => "pcm",
                ResponseFlavor::Wav => "wav",
            },
        })
    }

    async fn request(&self, text: &str) -> Result<reqwest::Response, TtsError> {
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&self.payload(text))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "TTS request rejected");
            return Err(TtsError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    fn decode(&self, body: Bytes) -> Result<SynthesizedAudio, TtsError> {
        if body.is_empty() {
            return Err(TtsError::EmptyAudio);
        }
        match self.flavor {
            ResponseFlavor::Pcm => Ok(SynthesizedAudio {
                pcm: body.to_vec(),
                sample_rate: self.config.sample_rate,
            }),
            ResponseFlavor::Wav => {
                let wav = parse_wav(&body)?;
                Ok(SynthesizedAudio {
                    pcm: crate::audio::pcm16_to_le_bytes(&wav.samples),
                    sample_rate: wav.sample_rate,
                })
            }
        }
    }
}

#[async_trait]
impl TextToSpeech for OpenAiTts {
    fn name(&self) -> &str {
        match self.flavor {
            ResponseFlavor::Wav => "lemonfox",
            ResponseFlavor::Pcm => "openai",
        }
    }

    fn voice(&self) -> &str {
        &self.config.voice
    }

    fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio, TtsError> {
        let response = self.request(text).await?;
        let body = response.bytes().await?;
        debug!(bytes = body.len(), "TTS synthesis complete");
        self.decode(body)
    }

    async fn synthesize_stream(&self, text: &str) -> Result<TtsStream, TtsError> {
        let (tx, rx) = mpsc::channel(8);

        let sample_rate = match self.flavor {
            // WAV cannot be interpreted until the header arrives, so the
            // stream degenerates to a single decoded chunk at the header's
            // rate.
            ResponseFlavor::Wav => {
                let audio = self.synthesize(text).await?;
                let rate = audio.sample_rate;
                let _ = tx.send(Ok(Bytes::from(audio.pcm))).await;
                rate
            }
            ResponseFlavor::Pcm => {
                let response = self.request(text).await?;
                let mut stream = response.bytes_stream();

                // Peek the first audio bytes before handing the stream
                // over: a 200 with an empty body fails the request itself,
                // so the caller's retry applies, matching the WAV flavor.
                let mut first = None;
                while let Some(chunk) = stream.next().await {
                    let bytes = chunk?;
                    if !bytes.is_empty() {
                        first = Some(bytes);
                        break;
                    }
                }
                let first = first.ok_or(TtsError::EmptyAudio)?;

                tokio::spawn(async move {
                    if tx.send(Ok(first)).await.is_err() {
                        return;
                    }
                    while let Some(chunk) = stream.next().await {
                        let item = chunk.map_err(TtsError::from);
                        if tx.send(item).await.is_err() {
                            break;
                        }
                    }
                });
                self.config.sample_rate
            }
        };

        Ok(TtsStream {
            sample_rate,
            chunks: rx,
        })
    }
}
