//! Process-wide call registry and the agent-facing operations.
//!
//! The manager owns every live [`CallSession`], routes carrier webhooks and
//! media streams to the right one, and enforces the one-operation-per-call
//! rule. It is handed to both the RPC surface and the HTTP router as a
//! plain value; there is no global.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use super::session::CallSession;
use super::{CallConfig, CallError, CallInfo};
use crate::config::BridgeConfig;
use crate::media::MediaSession;
use crate::stt::SpeechToText;
use crate::telephony::{PlaceCall, StatusEvent, Telephony};
use crate::tts::TextToSpeech;

/// Result of `initiate`: the new call and the user's first reply.
#[derive(Debug, Clone)]
pub struct InitiateOutcome {
    pub call_id: String,
    pub response: String,
}

pub struct CallManager {
    config: BridgeConfig,
    tts: Arc<dyn TextToSpeech>,
    stt: Arc<dyn SpeechToText>,
    telephony: Arc<dyn Telephony>,
    calls: Mutex<HashMap<String, Arc<CallSession>>>,
}

impl CallManager {
    pub fn new(
        config: BridgeConfig,
        tts: Arc<dyn TextToSpeech>,
        stt: Arc<dyn SpeechToText>,
        telephony: Arc<dyn Telephony>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            tts,
            stt,
            telephony,
            calls: Mutex::new(HashMap::new()),
        })
    }

    fn call_config(&self) -> CallConfig {
        CallConfig {
            voice: self.config.tts.voice.clone(),
            silence_duration_ms: self.config.stt.silence_duration_ms,
            transcript_timeout: Duration::from_millis(self.config.transcript_timeout_ms),
            max_call_duration: CallConfig::DEFAULT_MAX_CALL_DURATION,
        }
    }

    fn get(&self, call_id: &str) -> Result<Arc<CallSession>, CallError> {
        self.calls
            .lock()
            .unwrap()
            .get(call_id)
            .cloned()
            .ok_or_else(|| CallError::NotFound(call_id.to_string()))
    }

    fn find_by_carrier_ref(&self, call_ref: &str) -> Option<Arc<CallSession>> {
        self.calls
            .lock()
            .unwrap()
            .values()
            .find(|session| session.carrier_call_ref().as_deref() == Some(call_ref))
            .cloned()
    }

    /// Registers a session and schedules its removal once it ends.
    fn register(self: &Arc<Self>, session: Arc<CallSession>) {
        self.calls
            .lock()
            .unwrap()
            .insert(session.call_id().to_string(), session.clone());

        let manager = self.clone();
        tokio::spawn(async move {
            session.wait_until_ended().await;
            manager.calls.lock().unwrap().remove(session.call_id());
            info!(call_id = %session.call_id(), "call left the registry");
        });
    }

    /// Places the outbound call, waits for it to come up, speaks the
    /// opening message, and returns the user's first reply. The first
    /// response is inseparable from initiation: if the opening turn fails,
    /// the call is torn down rather than left dangling.
    pub async fn initiate(self: &Arc<Self>, message: &str) -> Result<InitiateOutcome, CallError> {
        let call_id = Uuid::new_v4().to_string();
        let session = CallSession::new(
            call_id.clone(),
            self.call_config(),
            self.tts.clone(),
            self.stt.clone(),
            self.telephony.clone(),
        );
        let _op = session.try_begin_op()?;
        self.register(session.clone());

        info!(%call_id, to = %self.config.phone.user_phone_number, "initiating call");
        let request = PlaceCall {
            from: self.config.phone.phone_number.clone(),
            to: self.config.phone.user_phone_number.clone(),
            instruction_url: self.config.server.call_instruction_url(),
            status_callback_url: self.config.server.status_callback_url(),
        };

        if let Err(error) = session.place(request).await {
            session.begin_ending("place failed");
            return Err(error);
        }

        session.wait_until_ready().await?;

        match session.speak(message, true).await {
            Ok(Some(response)) => Ok(InitiateOutcome { call_id, response }),
            Ok(None) => unreachable!("initiate always listens for a reply"),
            Err(error) => {
                warn!(%call_id, %error, "opening turn failed; ending call");
                session.begin_ending("opening turn failed");
                Err(error)
            }
        }
    }

    /// Speaks and waits for the user's reply.
    pub async fn continue_call(&self, call_id: &str, message: &str) -> Result<String, CallError> {
        let session = self.get(call_id)?;
        let _op = session.try_begin_op()?;
        match session.speak(message, true).await? {
            Some(response) => Ok(response),
            None => unreachable!("a listening turn always returns a reply"),
        }
    }

    /// Speaks without listening; returns once the carrier has played the
    /// audio (mark echo or its timeout).
    pub async fn speak_only(&self, call_id: &str, message: &str) -> Result<(), CallError> {
        let session = self.get(call_id)?;
        let _op = session.try_begin_op()?;
        session.speak(message, false).await?;
        Ok(())
    }

    /// Ends the call with an optional goodbye; resolves with the call's
    /// duration once every resource is released.
    pub async fn end(&self, call_id: &str, message: Option<&str>) -> Result<i64, CallError> {
        let session = self.get(call_id)?;
        let _op = session.try_begin_op()?;
        session.end(message).await
    }

    /// Applies a carrier status webhook, routed by carrier call reference.
    pub fn handle_status_event(&self, event: &StatusEvent) {
        match self.find_by_carrier_ref(&event.call_ref) {
            Some(session) => session.handle_carrier_event(event.kind),
            None => warn!(call_ref = %event.call_ref, "status event for unknown call"),
        }
    }

    /// Joins a media stream to the call its `start` frame named.
    pub async fn attach_media(
        &self,
        call_ref: &str,
        media: Arc<MediaSession>,
    ) -> Result<Arc<CallSession>, CallError> {
        let session = self
            .find_by_carrier_ref(call_ref)
            .ok_or_else(|| CallError::NotFound(call_ref.to_string()))?;
        session.attach_media(media).await?;
        Ok(session)
    }

    /// Snapshot of every live call.
    pub fn active_calls(&self) -> Vec<CallInfo> {
        self.calls
            .lock()
            .unwrap()
            .values()
            .map(|session| session.info())
            .collect()
    }
}
