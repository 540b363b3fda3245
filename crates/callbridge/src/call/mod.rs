//! Call orchestration: the per-call state machine and the process-wide
//! registry the agent surface talks to.

pub mod manager;
pub mod session;

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::media::MediaError;
use crate::stt::SttError;
use crate::telephony::TelephonyError;
use crate::tts::TtsError;

/// Lifecycle of one call. Transitions only ever follow
/// `Initiating → Ringing → Answered → Ready → Speaking ⇄ Listening →
/// Ending → Ended`, with any state able to jump to `Ending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Initiating,
    Ringing,
    Answered,
    /// Media bound and STT connected; idle between turns.
    Ready,
    Speaking,
    Listening,
    Ending,
    Ended,
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CallState::Initiating => "initiating",
            CallState::Ringing => "ringing",
            CallState::Answered => "answered",
            CallState::Ready => "ready",
            CallState::Speaking => "speaking",
            CallState::Listening => "listening",
            CallState::Ending => "ending",
            CallState::Ended => "ended",
        };
        f.write_str(name)
    }
}

impl CallState {
    /// Whether the call can accept a new agent turn.
    pub fn accepts_turns(self) -> bool {
        self == CallState::Ready
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Ending | CallState::Ended)
    }
}

/// Errors surfaced to the agent.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("another operation is already running on this call")]
    Busy,

    #[error("call not found: {0}")]
    NotFound(String),

    #[error("call has ended")]
    Ended,

    #[error("call is not ready for a turn (state: {0})")]
    NotReady(CallState),

    #[error("speech synthesis failed: {0}")]
    TtsFailed(#[from] TtsError),

    #[error("speech recognition is unavailable")]
    SttUnavailable,

    #[error("no reply arrived within the transcript timeout")]
    TranscriptTimeout,

    #[error("operation cancelled: the call is ending")]
    Cancelled,

    #[error(transparent)]
    Carrier(#[from] TelephonyError),

    #[error("media stream error: {0}")]
    Media(#[from] MediaError),
}

impl From<SttError> for CallError {
    fn from(error: SttError) -> Self {
        match error {
            SttError::TranscriptTimeout => CallError::TranscriptTimeout,
            SttError::Closed => CallError::Cancelled,
            SttError::WaiterBusy => CallError::Busy,
            SttError::Unavailable | SttError::Connect(_) | SttError::ConnectTimeout => {
                CallError::SttUnavailable
            }
        }
    }
}

/// Per-call configuration snapshot, frozen at initiation.
#[derive(Debug, Clone)]
pub struct CallConfig {
    pub voice: String,
    /// Endpointing threshold the recognizer was configured with.
    pub silence_duration_ms: u64,
    /// How long a listening turn waits for an utterance.
    pub transcript_timeout: Duration,
    /// Hard ceiling on call duration, measured from `place_call`.
    pub max_call_duration: Duration,
}

impl CallConfig {
    /// Six minutes, per the product's ceiling on agent-driven calls.
    pub const DEFAULT_MAX_CALL_DURATION: Duration = Duration::from_secs(360);
}

/// A snapshot of one call's externally visible state.
#[derive(Debug, Clone)]
pub struct CallInfo {
    pub call_id: String,
    pub carrier_call_ref: Option<String>,
    pub state: CallState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_response: Option<String>,
}
