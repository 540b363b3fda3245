//! Telephony carrier abstraction.
//!
//! Two carriers are supported (Telnyx, Twilio). They differ in credential
//! naming and webhook signature algorithm but share the contract: place an
//! outbound call, serve an instruction document that opens a media
//! WebSocket, report status transitions to a callback URL, hang up on
//! demand.

pub mod telnyx;
pub mod twiml;
pub mod twilio;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{PhoneConfig, PhoneProvider, ServerConfig};

/// Carrier-side errors.
#[derive(Debug, Error)]
pub enum TelephonyError {
    #[error("carrier rejected the call: {0}")]
    CarrierRejected(String),

    #[error("carrier request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("carrier response missing call reference")]
    MissingCallRef,
}

/// Parameters for an outbound call.
#[derive(Debug, Clone)]
pub struct PlaceCall {
    pub from: String,
    pub to: String,
    /// Where the carrier fetches the instruction document on pickup.
    pub instruction_url: String,
    pub status_callback_url: String,
}

/// Normalized carrier status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEventKind {
    Ringing,
    Answered,
    Hangup,
}

/// A status webhook resolved to a call and a transition.
#[derive(Debug, Clone)]
pub struct StatusEvent {
    /// Carrier call reference the event belongs to.
    pub call_ref: String,
    pub kind: CallEventKind,
}

/// Carrier capability set.
#[async_trait]
pub trait Telephony: Send + Sync {
    fn name(&self) -> &'static str;

    /// Places an outbound call; returns the carrier's call reference.
    async fn place_call(&self, request: &PlaceCall) -> Result<String, TelephonyError>;

    async fn hangup(&self, call_ref: &str) -> Result<(), TelephonyError>;

    /// Verifies a webhook signature over the raw body. Requests failing
    /// verification must be dropped by the router.
    fn verify_webhook(&self, headers: &HashMap<String, String>, raw_body: &[u8]) -> bool;

    /// Parses a status callback into a normalized event, or `None` for
    /// transitions the bridge does not track.
    fn parse_status_event(&self, raw_body: &[u8]) -> Option<StatusEvent>;

    /// The instruction document the carrier fetches on pickup:
    /// `(content_type, body)`.
    fn render_call_instruction(&self, media_ws_url: &str) -> (&'static str, String);
}

/// Builds the configured carrier variant.
pub fn from_config(phone: &PhoneConfig, server: &ServerConfig) -> Arc<dyn Telephony> {
    match phone.provider {
        PhoneProvider::Twilio => Arc::new(twilio::TwilioProvider::new(
            phone.clone(),
            server.status_callback_url(),
        )),
        PhoneProvider::Telnyx => Arc::new(telnyx::TelnyxProvider::new(phone.clone())),
    }
}

/// Maps a Twilio-dialect `CallStatus` string to a tracked transition.
/// Shared by both variants: Telnyx TeXML callbacks use the same vocabulary.
pub(crate) fn status_from_str(status: &str) -> Option<CallEventKind> {
    match status {
        "ringing" => Some(CallEventKind::Ringing),
        "initiated" | "queued" => None,
        "in-progress" | "answered" => Some(CallEventKind::Answered),
        "completed" | "busy" | "failed" | "no-answer" | "canceled" => Some(CallEventKind::Hangup),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_vocabulary_maps_to_tracked_transitions() {
        assert_eq!(status_from_str("ringing"), Some(CallEventKind::Ringing));
        assert_eq!(status_from_str("in-progress"), Some(CallEventKind::Answered));
        assert_eq!(status_from_str("completed"), Some(CallEventKind::Hangup));
        assert_eq!(status_from_str("no-answer"), Some(CallEventKind::Hangup));
        assert_eq!(status_from_str("queued"), None);
        assert_eq!(status_from_str("transcribing"), None);
    }
}
