//! Per-call state machine.
//!
//! One `CallSession` task-set owns everything a live call touches: the
//! carrier call reference, the media stream, the STT session, and the turn
//! protocol. State lives behind a `watch` channel so transitions are
//! observable edges rather than polled flags; a second `watch` broadcasts
//! shutdown so in-flight turns cancel promptly.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex as AsyncMutex, MutexGuard};
use tracing::{debug, info, warn};

use super::{CallConfig, CallError, CallInfo, CallState};
use crate::media::{MediaError, MediaSession};
use crate::stt::{SpeechToText, SttError, SttSession};
use crate::telephony::{CallEventKind, PlaceCall, Telephony};
use crate::tts::TextToSpeech;

/// How long after `answered` the carrier gets to open the media stream.
const MEDIA_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct CallSession {
    call_id: String,
    config: CallConfig,
    tts: Arc<dyn TextToSpeech>,
    stt_factory: Arc<dyn SpeechToText>,
    telephony: Arc<dyn Telephony>,

    state_tx: watch::Sender<CallState>,
    shutdown_tx: watch::Sender<bool>,
    /// One agent operation at a time; `try_lock` failure surfaces as `Busy`.
    op_lock: AsyncMutex<()>,
    /// Serializes turns: no two speaks overlap even across internal callers.
    turn_lock: AsyncMutex<()>,

    carrier_call_ref: Mutex<Option<String>>,
    media: Mutex<Option<Arc<MediaSession>>>,
    stt: Mutex<Option<Arc<dyn SttSession>>>,

    started_at: DateTime<Utc>,
    ended_at: Mutex<Option<DateTime<Utc>>>,
    last_response: Mutex<Option<String>>,
}

impl CallSession {
    pub fn new(
        call_id: String,
        config: CallConfig,
        tts: Arc<dyn TextToSpeech>,
        stt_factory: Arc<dyn SpeechToText>,
        telephony: Arc<dyn Telephony>,
    ) -> Arc<Self> {
        Arc::new(Self {
            call_id,
            config,
            tts,
            stt_factory,
            telephony,
            state_tx: watch::Sender::new(CallState::Initiating),
            shutdown_tx: watch::Sender::new(false),
            op_lock: AsyncMutex::new(()),
            turn_lock: AsyncMutex::new(()),
            carrier_call_ref: Mutex::new(None),
            media: Mutex::new(None),
            stt: Mutex::new(None),
            started_at: Utc::now(),
            ended_at: Mutex::new(None),
            last_response: Mutex::new(None),
        })
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn state(&self) -> CallState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.state_tx.subscribe()
    }

    pub fn carrier_call_ref(&self) -> Option<String> {
        self.carrier_call_ref.lock().unwrap().clone()
    }

    pub fn info(&self) -> CallInfo {
        CallInfo {
            call_id: self.call_id.clone(),
            carrier_call_ref: self.carrier_call_ref(),
            state: self.state(),
            started_at: self.started_at,
            ended_at: *self.ended_at.lock().unwrap(),
            last_response: self.last_response.lock().unwrap().clone(),
        }
    }

    pub fn duration_seconds(&self) -> i64 {
        let end = self.ended_at.lock().unwrap().unwrap_or_else(Utc::now);
        (end - self.started_at).num_seconds()
    }

    /// Claims the per-call agent-operation slot, or fails with `Busy`.
    pub fn try_begin_op(&self) -> Result<MutexGuard<'_, ()>, CallError> {
        self.op_lock.try_lock().map_err(|_| CallError::Busy)
    }

    /// Moves the state machine along one of its legal edges. Returns
    /// whether the transition happened; a stale `from` set never moves.
    fn advance(&self, from: &[CallState], to: CallState) -> bool {
        let mut moved = false;
        self.state_tx.send_if_modified(|state| {
            if from.contains(state) {
                debug!(call_id = %self.call_id, from = %state, to = %to, "call state");
                *state = to;
                moved = true;
                true
            } else {
                false
            }
        });
        moved
    }

    /// Places the outbound call and starts the per-call watchdog.
    pub async fn place(self: &Arc<Self>, request: PlaceCall) -> Result<(), CallError> {
        let call_ref = self.telephony.place_call(&request).await?;
        *self.carrier_call_ref.lock().unwrap() = Some(call_ref);
        self.spawn_watchdog();
        Ok(())
    }

    fn spawn_watchdog(self: &Arc<Self>) {
        let session = self.clone();
        tokio::spawn(async move {
            let mut shutdown = session.shutdown_tx.subscribe();
            tokio::select! {
                _ = tokio::time::sleep(session.config.max_call_duration) => {
                    warn!(call_id = %session.call_id, "call hit the duration ceiling");
                    session.begin_ending("duration ceiling");
                }
                _ = shutdown.wait_for(|&s| s) => {}
            }
        });
    }

    /// Applies a carrier status transition.
    pub fn handle_carrier_event(self: &Arc<Self>, kind: CallEventKind) {
        match kind {
            CallEventKind::Ringing => {
                self.advance(&[CallState::Initiating], CallState::Ringing);
            }
            CallEventKind::Answered => {
                // The ringing webhook can be lost; answering implies it.
                if self.advance(&[CallState::Initiating, CallState::Ringing], CallState::Answered)
                {
                    self.spawn_media_watchdog();
                }
            }
            CallEventKind::Hangup => {
                info!(call_id = %self.call_id, "carrier reported hangup");
                self.begin_ending("carrier hangup");
            }
        }
    }

    fn spawn_media_watchdog(self: &Arc<Self>) {
        let session = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(MEDIA_CONNECT_TIMEOUT).await;
            if session.state() == CallState::Answered {
                warn!(call_id = %session.call_id, "media stream never connected");
                session.begin_ending("media timeout");
            }
        });
    }

    /// Binds the carrier media stream: connects a fresh STT session, wires
    /// inbound audio into it, and brings the call to `Ready`.
    pub async fn attach_media(self: &Arc<Self>, media: Arc<MediaSession>) -> Result<(), CallError> {
        let stt = self.stt_factory.create_session();
        if let Err(error) = stt.connect().await {
            warn!(call_id = %self.call_id, %error, "STT connect failed; ending call");
            self.begin_ending("stt connect failed");
            return Err(error.into());
        }

        media.bind_stt(stt.clone());
        *self.stt.lock().unwrap() = Some(stt);
        *self.media.lock().unwrap() = Some(media.clone());

        // An unexpected media close takes the whole call down.
        let session = self.clone();
        let mut closed = media.closed();
        tokio::spawn(async move {
            if closed.wait_for(|&c| c).await.is_ok() && !session.state().is_terminal() {
                info!(call_id = %session.call_id, "media stream closed");
                session.begin_ending("media closed");
            }
        });

        // Media can beat the answered webhook; both orders reach Ready.
        self.advance(
            &[CallState::Initiating, CallState::Ringing, CallState::Answered],
            CallState::Ready,
        );
        Ok(())
    }

    /// Suspends until the call is ready for its first turn, or fails if it
    /// dies first. The per-call watchdog bounds the wait.
    pub async fn wait_until_ready(&self) -> Result<(), CallError> {
        let mut rx = self.state_tx.subscribe();
        let state = *rx
            .wait_for(|s| s.accepts_turns() || s.is_terminal())
            .await
            .map_err(|_| CallError::Ended)?;
        if state.is_terminal() {
            return Err(CallError::Ended);
        }
        Ok(())
    }

    /// One turn: synthesize and play `text`; when `expect_reply`, listen
    /// for the next endpointed utterance and return it.
    ///
    /// While audio plays, inbound media still reaches the recognizer, but
    /// no waiter is armed until playback finishes, so anything transcribed
    /// during `Speaking` (acoustic bleed of our own voice included) is
    /// discarded rather than mistaken for the reply.
    pub async fn speak(
        self: &Arc<Self>,
        text: &str,
        expect_reply: bool,
    ) -> Result<Option<String>, CallError> {
        let _turn = self.turn_lock.lock().await;

        let current = self.state();
        if current.is_terminal() {
            return Err(CallError::Ended);
        }
        if !current.accepts_turns() {
            return Err(CallError::NotReady(current));
        }

        let media = self
            .media
            .lock()
            .unwrap()
            .clone()
            .ok_or(CallError::Media(MediaError::NotStarted))?;
        let stt = self
            .stt
            .lock()
            .unwrap()
            .clone()
            .ok_or(CallError::SttUnavailable)?;

        self.advance(&[CallState::Ready], CallState::Speaking);
        info!(call_id = %self.call_id, chars = text.len(), expect_reply, "speaking");

        if let Err(error) = self.stream_to_media(&media, text).await {
            let cancelled = *self.shutdown_tx.borrow();
            self.advance(&[CallState::Speaking], CallState::Ready);
            return Err(if cancelled { CallError::Cancelled } else { error });
        }

        if !expect_reply {
            self.advance(&[CallState::Speaking], CallState::Ready);
            return Ok(None);
        }

        self.advance(&[CallState::Speaking], CallState::Listening);
        let mut shutdown = self.shutdown_tx.subscribe();
        let reply = tokio::select! {
            result = stt.wait_for_transcript(self.config.transcript_timeout) => result,
            _ = shutdown.wait_for(|&s| s) => return Err(CallError::Cancelled),
        };
        self.advance(&[CallState::Listening], CallState::Ready);

        match reply {
            Ok(utterance) => {
                info!(call_id = %self.call_id, reply = %utterance, "turn complete");
                *self.last_response.lock().unwrap() = Some(utterance.clone());
                Ok(Some(utterance))
            }
            Err(SttError::Unavailable) => {
                self.begin_ending("stt unavailable");
                Err(CallError::SttUnavailable)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// TTS → resample → µ-law → paced media frames, ending with the mark
    /// round-trip. The synthesis request is retried once before the turn
    /// fails.
    async fn stream_to_media(&self, media: &Arc<MediaSession>, text: &str) -> Result<(), CallError> {
        let mut stream = match self.tts.synthesize_stream(text).await {
            Ok(stream) => stream,
            Err(error) => {
                warn!(call_id = %self.call_id, %error, "TTS failed; retrying turn once");
                self.tts.synthesize_stream(text).await?
            }
        };

        let mut playback = media.begin_playback(stream.sample_rate);
        while let Some(item) = stream.chunks.recv().await {
            let bytes = item?;
            playback.push_pcm(&bytes).await?;
        }
        playback.finish().await?;
        Ok(())
    }

    /// Ends the call: best-effort goodbye, then teardown. Returns the call
    /// duration in seconds once everything is released.
    pub async fn end(self: &Arc<Self>, final_message: Option<&str>) -> Result<i64, CallError> {
        if let Some(message) = final_message {
            // Best-effort: if the user already hung up or media is gone,
            // the goodbye is skipped rather than blocking teardown.
            if self.state().accepts_turns() {
                if let Err(error) = self.speak(message, false).await {
                    warn!(call_id = %self.call_id, %error, "goodbye message skipped");
                }
            }
        }
        self.begin_ending("agent end_call");
        self.wait_until_ended().await;
        Ok(self.duration_seconds())
    }

    pub async fn wait_until_ended(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|s| *s == CallState::Ended).await;
    }

    /// Drives the call to `Ending` and releases the STT session, the media
    /// stream, and the carrier call. Idempotent; every path to `Ended`
    /// funnels through here.
    pub fn begin_ending(self: &Arc<Self>, reason: &str) {
        let mut proceed = false;
        self.state_tx.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = CallState::Ending;
                proceed = true;
                true
            }
        });
        if !proceed {
            return;
        }

        info!(call_id = %self.call_id, reason, "call ending");
        let _ = self.shutdown_tx.send(true);

        let session = self.clone();
        tokio::spawn(async move {
            let stt = session.stt.lock().unwrap().take();
            if let Some(stt) = stt {
                stt.close().await;
            }

            let media = session.media.lock().unwrap().take();
            if let Some(media) = media {
                media.close();
            }

            let call_ref = session.carrier_call_ref.lock().unwrap().clone();
            if let Some(call_ref) = call_ref {
                if let Err(error) = session.telephony.hangup(&call_ref).await {
                    warn!(call_id = %session.call_id, %error, "carrier hangup failed");
                }
            }

            *session.ended_at.lock().unwrap() = Some(Utc::now());
            session.state_tx.send_modify(|state| *state = CallState::Ended);
            info!(
                call_id = %session.call_id,
                duration_s = session.duration_seconds(),
                "call ended"
            );
        });
    }
}
