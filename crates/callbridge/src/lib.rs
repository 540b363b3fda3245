//! # callbridge — agent-driven voice calls
//!
//! A bridge that lets an agent hold live telephone conversations: it places
//! an outbound call through a carrier (Telnyx or Twilio), streams the
//! call's 8 kHz µ-law audio over the carrier's media WebSocket, synthesizes
//! agent speech through an OpenAI-compatible TTS endpoint, and transcribes
//! the user through a streaming STT recognizer with endpointing.
//!
//! The agent surface is four operations on [`CallManager`]: initiate a
//! call (speak and return the first reply), continue it (another
//! speak-then-listen turn), speak without listening, and end it. Each live
//! call is a [`call::session::CallSession`] state machine multiplexing the
//! three real-time streams with per-call serialization.

pub mod audio;
pub mod call;
pub mod config;
pub mod media;
pub mod stt;
pub mod telephony;
pub mod tts;
pub mod wav;

pub use call::manager::{CallManager, InitiateOutcome};
pub use call::{CallError, CallInfo, CallState};
pub use config::{BridgeConfig, ConfigError};
pub use media::{MediaFrame, MediaSession};
pub use stt::{SpeechToText, SttClient, SttSession};
pub use telephony::Telephony;
pub use tts::{OpenAiTts, TextToSpeech};
