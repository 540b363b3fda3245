//! Carrier media-stream session.
//!
//! The carrier speaks line-delimited JSON frames over a WebSocket:
//! `start` names the stream (and the call it belongs to), `media` carries
//! base64 µ-law both ways, `mark` is a loopback tag that echoes once the
//! carrier has played the audio queued before it, `stop` ends the stream.
//!
//! [`MediaSession`] is socket-agnostic: inbound frames are pushed through
//! [`MediaSession::handle_frame`] and outbound frames drain from a channel,
//! so the axum WebSocket glue and the tests drive it identically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::{mulaw_encode, resample_linear, PcmAssembler};
use crate::stt::SttSession;

/// Telephone-network sample rate.
pub const TELEPHONY_RATE: u32 = 8000;
/// Outbound chunk size: 500 ms of 8 kHz µ-law. Small chunks get choppy
/// under jitter; anything much larger hurts responsiveness.
pub const CHUNK_BYTES: usize = 4000;
/// Wall-clock duration of one full chunk.
pub const CHUNK_MS: u64 = 500;
/// How far ahead of real time the pacing loop runs, keeping a shallow
/// jitter buffer without starving the carrier.
const PACING_LEAD_MS: u64 = 50;
/// Grace period past the nominal playout time before giving up on a mark
/// echo (not every carrier echoes marks).
const MARK_GRACE: Duration = Duration::from_secs(2);

/// One frame on the media WebSocket, either direction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum MediaFrame {
    /// Carrier banner sent before `start`; carries nothing we need.
    Connected,
    Start {
        #[serde(rename = "streamSid", alias = "stream_sid", default)]
        stream_sid: Option<String>,
        start: StartInfo,
    },
    Media {
        #[serde(rename = "streamSid", alias = "stream_sid", default)]
        stream_sid: Option<String>,
        media: MediaPayload,
    },
    Mark {
        #[serde(rename = "streamSid", alias = "stream_sid", default)]
        stream_sid: Option<String>,
        mark: MarkInfo,
    },
    Stop {
        #[serde(rename = "streamSid", alias = "stream_sid", default)]
        stream_sid: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StartInfo {
    #[serde(rename = "streamSid", alias = "stream_sid")]
    pub stream_sid: String,
    /// Carrier call reference this stream belongs to. Required: a stream
    /// that cannot name its call is closed rather than matched to "the
    /// most recent" one.
    #[serde(rename = "callSid", alias = "call_sid", default)]
    pub call_sid: Option<String>,
    #[serde(rename = "customParameters", default)]
    pub custom_parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaPayload {
    /// Base64 µ-law bytes.
    pub payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarkInfo {
    pub name: String,
}

/// What the socket glue should do after handing a frame to the session.
#[derive(Debug, PartialEq)]
pub enum FrameOutcome {
    /// `start` arrived: join the session to this carrier call.
    Started { call_sid: String },
    /// `stop` arrived: the stream is over.
    Stopped,
    /// Frame consumed; keep reading.
    Continue,
    /// Protocol violation; close the socket.
    Rejected(&'static str),
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media stream has not started")]
    NotStarted,

    #[error("media stream is closed")]
    Closed,
}

#[derive(Default)]
struct SessionState {
    stream_sid: Option<String>,
    started: bool,
    stopped: bool,
    stt: Option<Arc<dyn SttSession>>,
    mark_waiter: Option<(String, oneshot::Sender<()>)>,
}

/// One carrier media stream, bound to a call after its `start` frame.
pub struct MediaSession {
    outbound: mpsc::UnboundedSender<MediaFrame>,
    state: Mutex<SessionState>,
    closed_tx: watch::Sender<bool>,
}

impl MediaSession {
    /// Creates a session whose outbound frames drain from the returned
    /// receiver (the socket writer in production, the test harness in
    /// tests).
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MediaFrame>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            outbound,
            state: Mutex::new(SessionState::default()),
            closed_tx: watch::Sender::new(false),
        });
        (session, outbound_rx)
    }

    /// Binds the recognizer inbound audio is forwarded to.
    pub fn bind_stt(&self, stt: Arc<dyn SttSession>) {
        self.state.lock().unwrap().stt = Some(stt);
    }

    /// Observer that flips to `true` once the stream stops or closes.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Marks the session closed; no outbound frame is emitted afterwards
    /// and any in-flight playback aborts.
    pub fn close(&self) {
        self.state.lock().unwrap().stopped = true;
        let _ = self.closed_tx.send(true);
    }

    /// Feeds one inbound frame through the session.
    pub fn handle_frame(&self, frame: MediaFrame) -> FrameOutcome {
        match frame {
            MediaFrame::Connected => FrameOutcome::Continue,
            MediaFrame::Start { start, .. } => {
                let Some(call_sid) = start.call_sid.clone().filter(|s| !s.is_empty()) else {
                    warn!("media stream started without a call reference; rejecting");
                    return FrameOutcome::Rejected("start frame carried no call reference");
                };
                let mut state = self.state.lock().unwrap();
                state.stream_sid = Some(start.stream_sid.clone());
                state.started = true;
                info!(stream_sid = %start.stream_sid, %call_sid, "media stream started");
                FrameOutcome::Started { call_sid }
            }
            MediaFrame::Media { media, .. } => {
                let stt = {
                    let state = self.state.lock().unwrap();
                    if !state.started || state.stopped {
                        debug!("dropping media frame outside start/stop window");
                        return FrameOutcome::Continue;
                    }
                    state.stt.clone()
                };
                match BASE64.decode(media.payload.as_bytes()) {
                    Ok(mulaw) => {
                        if let Some(stt) = stt {
                            stt.send_audio(&mulaw);
                        }
                    }
                    Err(_) => debug!("dropping media frame with invalid base64"),
                }
                FrameOutcome::Continue
            }
            MediaFrame::Mark { mark, .. } => {
                let mut state = self.state.lock().unwrap();
                match state.mark_waiter.take() {
                    Some((expected, tx)) if expected == mark.name => {
                        let _ = tx.send(());
                    }
                    Some(other) => {
                        debug!(name = %mark.name, "unexpected mark echo");
                        state.mark_waiter = Some(other);
                    }
                    None => debug!(name = %mark.name, "mark echo with no waiter"),
                }
                FrameOutcome::Continue
            }
            MediaFrame::Stop { .. } => {
                info!("media stream stopped");
                self.close();
                FrameOutcome::Stopped
            }
        }
    }

    /// Begins an outbound playback; PCM is pushed in as synthesis
    /// produces it and [`Playback::finish`] settles the mark round-trip.
    pub fn begin_playback(self: &Arc<Self>, src_rate: u32) -> Playback {
        Playback {
            session: self.clone(),
            src_rate,
            assembler: PcmAssembler::new(),
            pending: Vec::new(),
            chunks_sent: 0,
        }
    }

    /// Plays one complete PCM buffer and waits for the carrier to finish.
    pub async fn play_buffer(
        self: &Arc<Self>,
        pcm: &[u8],
        src_rate: u32,
    ) -> Result<(), MediaError> {
        let mut playback = self.begin_playback(src_rate);
        playback.push_pcm(pcm).await?;
        playback.finish().await
    }

    fn send_frame(&self, build: impl FnOnce(String) -> MediaFrame) -> Result<(), MediaError> {
        let state = self.state.lock().unwrap();
        if state.stopped {
            return Err(MediaError::Closed);
        }
        let stream_sid = state.stream_sid.clone().ok_or(MediaError::NotStarted)?;
        self.outbound
            .send(build(stream_sid))
            .map_err(|_| MediaError::Closed)
    }
}

/// An in-progress outbound playback: buffers µ-law bytes, emits paced
/// 500 ms chunks, and closes with a mark round-trip.
pub struct Playback {
    session: Arc<MediaSession>,
    src_rate: u32,
    assembler: PcmAssembler,
    pending: Vec<u8>,
    chunks_sent: usize,
}

impl Playback {
    /// Accepts s16le PCM bytes (arbitrary chunk boundaries), emitting any
    /// full 500 ms chunks they complete. Suspends for pacing between
    /// chunks; aborts early if the stream closes.
    pub async fn push_pcm(&mut self, pcm: &[u8]) -> Result<(), MediaError> {
        let samples = self.assembler.extend(pcm);
        if !samples.is_empty() {
            let telephone = resample_linear(&samples, self.src_rate, TELEPHONY_RATE);
            self.pending.extend(mulaw_encode(&telephone));
        }

        while self.pending.len() >= CHUNK_BYTES {
            let chunk: Vec<u8> = self.pending.drain(..CHUNK_BYTES).collect();
            self.emit_chunk(&chunk).await?;
        }
        Ok(())
    }

    /// Flushes the partial tail chunk, emits the trailing mark, and waits
    /// for its echo (bounded by nominal playout time plus a grace period).
    pub async fn finish(mut self) -> Result<(), MediaError> {
        if !self.pending.is_empty() {
            let chunk = std::mem::take(&mut self.pending);
            self.emit_chunk(&chunk).await?;
        }

        let name = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.session.state.lock().unwrap().mark_waiter = Some((name.clone(), tx));

        self.session.send_frame(|stream_sid| MediaFrame::Mark {
            stream_sid: Some(stream_sid),
            mark: MarkInfo { name: name.clone() },
        })?;

        let deadline = Duration::from_millis(self.chunks_sent as u64 * CHUNK_MS) + MARK_GRACE;
        let mut closed = self.session.closed_tx.subscribe();
        tokio::select! {
            result = tokio::time::timeout(deadline, rx) => match result {
                Ok(Ok(())) => Ok(()),
                // Echo never came; assume playout finished on schedule.
                _ => {
                    self.session.state.lock().unwrap().mark_waiter = None;
                    Ok(())
                }
            },
            _ = closed.wait_for(|&c| c) => Err(MediaError::Closed),
        }
    }

    async fn emit_chunk(&mut self, mulaw: &[u8]) -> Result<(), MediaError> {
        // Pace: queue the next chunk slightly before the previous one
        // finishes playing.
        if self.chunks_sent > 0 {
            let mut closed = self.session.closed_tx.subscribe();
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(CHUNK_MS - PACING_LEAD_MS)) => {}
                _ = closed.wait_for(|&c| c) => return Err(MediaError::Closed),
            }
        }

        let payload = BASE64.encode(mulaw);
        self.session.send_frame(|stream_sid| MediaFrame::Media {
            stream_sid: Some(stream_sid),
            media: MediaPayload { payload },
        })?;
        self.chunks_sent += 1;
        Ok(())
    }
}
