//! Streaming speech-to-text.
//!
//! The wire dialects differ per backend (Deepgram speaks query-string
//! configuration and binary audio frames, OpenAI realtime speaks JSON
//! envelopes), but the session machinery is the same: dial a WebSocket,
//! pump µ-law audio up, parse transcript events down, accumulate finals
//! into an utterance until the endpoint fires, and hand the utterance to
//! whoever is waiting. [`StreamingSession`] owns that machinery; an
//! [`SttEngine`] supplies the dialect.

pub mod deepgram;
pub mod openai;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::{SttBackend, SttConfig};

/// Upstream session confirmation deadline.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Keepalive cadence to defeat idle timeouts.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
/// First reconnect backoff; doubles per attempt.
const RECONNECT_BASE: Duration = Duration::from_secs(1);
/// Reconnect attempts before the session gives up.
const MAX_RECONNECT_ATTEMPTS: u32 = 5;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Recognizer-side errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SttError {
    #[error("STT connect failed: {0}")]
    Connect(String),

    #[error("STT session did not confirm within {}s", CONNECT_TIMEOUT.as_secs())]
    ConnectTimeout,

    #[error("no utterance arrived within the transcript timeout")]
    TranscriptTimeout,

    #[error("STT reconnect attempts exhausted")]
    Unavailable,

    #[error("a transcript waiter is already armed on this session")]
    WaiterBusy,

    #[error("STT session is closed")]
    Closed,
}

/// A transcript-bearing event parsed from one upstream message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SttEvent {
    /// Interim text; superseded by later events.
    Interim(String),
    /// A finalized segment. `speech_final` marks the recognizer's own
    /// endpoint decision and flushes the utterance.
    Final { text: String, speech_final: bool },
    /// Endpoint fired after silence; flushes whatever finals accumulated.
    UtteranceEnd,
    /// Upstream-reported error; logged, not fatal.
    Error(String),
}

/// Wire dialect of one STT backend.
pub trait SttEngine: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// WebSocket URL and headers for the streaming endpoint.
    fn connect_request(&self) -> (String, Vec<(&'static str, String)>);

    /// Message sent immediately after the socket opens, if the dialect
    /// configures the session in-band.
    fn init_message(&self) -> Option<Message> {
        None
    }

    /// Wraps 8 kHz µ-law bytes for the upstream.
    fn audio_message(&self, mulaw: &[u8]) -> Message;

    fn keepalive_message(&self) -> Option<Message>;

    fn close_message(&self) -> Option<Message> {
        None
    }

    /// Parses one text frame into transcript events.
    fn parse_event(&self, text: &str) -> Vec<SttEvent>;
}

/// One live recognizer session bound to a call.
#[async_trait]
pub trait SttSession: Send + Sync {
    /// Opens the streaming channel; resolves once the upstream confirms,
    /// or fails after 10 s. Fatal to the call on failure.
    async fn connect(&self) -> Result<(), SttError>;

    /// Enqueues 8 kHz µ-law audio. Never blocks; silently dropped while
    /// the upstream is disconnected.
    fn send_audio(&self, mulaw: &[u8]);

    /// Resolves with the next endpointed utterance. At most one waiter at
    /// a time; arming clears any partially accumulated utterance so stale
    /// speech from before the listen cannot leak into the answer.
    async fn wait_for_transcript(&self, timeout: Duration) -> Result<String, SttError>;

    /// Observer for interim transcripts.
    fn partials(&self) -> watch::Receiver<String>;

    /// Graceful shutdown; prevents reconnection.
    async fn close(&self);

    fn is_connected(&self) -> bool;
}

/// Factory handed to the call manager; one session per call.
pub trait SpeechToText: Send + Sync {
    fn name(&self) -> &'static str;

    fn create_session(&self) -> Arc<dyn SttSession>;
}

/// Accumulates finals into an utterance and delivers it to the armed
/// waiter. Shared between the socket driver and the session surface; every
/// method is non-blocking.
struct UtteranceTracker {
    parts: Mutex<Vec<String>>,
    waiter: Mutex<Option<oneshot::Sender<Result<String, SttError>>>>,
    partial_tx: watch::Sender<String>,
}

impl UtteranceTracker {
    fn new() -> Self {
        Self {
            parts: Mutex::new(Vec::new()),
            waiter: Mutex::new(None),
            partial_tx: watch::Sender::new(String::new()),
        }
    }

    fn on_event(&self, event: SttEvent) {
        match event {
            SttEvent::Interim(text) => {
                if !text.is_empty() {
                    let _ = self.partial_tx.send(text);
                }
            }
            SttEvent::Final { text, speech_final } => {
                if !text.trim().is_empty() {
                    self.parts.lock().unwrap().push(text.trim().to_string());
                }
                if speech_final {
                    self.flush();
                }
            }
            SttEvent::UtteranceEnd => self.flush(),
            SttEvent::Error(message) => warn!(%message, "STT upstream error"),
        }
    }

    /// Delivers the accumulated utterance, or discards it when nobody is
    /// listening (e.g. recognizer output produced while the bridge itself
    /// was speaking).
    fn flush(&self) {
        let utterance = {
            let mut parts = self.parts.lock().unwrap();
            if parts.is_empty() {
                return;
            }
            parts.drain(..).collect::<Vec<_>>().join(" ")
        };

        match self.waiter.lock().unwrap().take() {
            Some(tx) => {
                let _ = tx.send(Ok(utterance));
            }
            None => debug!(%utterance, "discarding utterance with no waiter"),
        }
    }

    fn arm(&self) -> Result<oneshot::Receiver<Result<String, SttError>>, SttError> {
        let mut waiter = self.waiter.lock().unwrap();
        if waiter.is_some() {
            return Err(SttError::WaiterBusy);
        }
        self.parts.lock().unwrap().clear();
        let (tx, rx) = oneshot::channel();
        *waiter = Some(tx);
        Ok(rx)
    }

    fn disarm(&self) {
        self.waiter.lock().unwrap().take();
    }

    fn fail_waiter(&self, error: SttError) {
        if let Some(tx) = self.waiter.lock().unwrap().take() {
            let _ = tx.send(Err(error));
        }
    }
}

/// Engine-agnostic streaming session: owns the upstream socket on a driver
/// task, reconnects with exponential backoff, keeps the connection alive,
/// and feeds parsed events to the [`UtteranceTracker`].
pub struct StreamingSession {
    engine: Arc<dyn SttEngine>,
    audio_tx: mpsc::UnboundedSender<Vec<u8>>,
    audio_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    connected: Arc<AtomicBool>,
    /// Flips to `true` exactly once; the driver watches the edge.
    closed_tx: watch::Sender<bool>,
    tracker: Arc<UtteranceTracker>,
}

impl StreamingSession {
    pub fn new(engine: Arc<dyn SttEngine>) -> Self {
        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        Self {
            engine,
            audio_tx,
            audio_rx: Mutex::new(Some(audio_rx)),
            connected: Arc::new(AtomicBool::new(false)),
            closed_tx: watch::Sender::new(false),
            tracker: Arc::new(UtteranceTracker::new()),
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }
}

async fn dial(engine: &dyn SttEngine) -> Result<WsStream, SttError> {
    let (url, headers) = engine.connect_request();
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| SttError::Connect(e.to_string()))?;
    for (name, value) in headers {
        let name =
            HeaderName::from_static(name);
        let value = HeaderValue::from_str(&value)
            .map_err(|e| SttError::Connect(e.to_string()))?;
        request.headers_mut().insert(name, value);
    }

    let (mut ws, _) = connect_async(request)
        .await
        .map_err(|e| SttError::Connect(e.to_string()))?;

    if let Some(init) = engine.init_message() {
        ws.send(init)
            .await
            .map_err(|e| SttError::Connect(e.to_string()))?;
    }
    Ok(ws)
}

#[async_trait]
impl SttSession for StreamingSession {
    async fn connect(&self) -> Result<(), SttError> {
        if self.is_closed() {
            return Err(SttError::Closed);
        }
        let audio_rx = self
            .audio_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(SttError::Connect("session already connected".into()))?;

        let ws = tokio::time::timeout(CONNECT_TIMEOUT, dial(self.engine.as_ref()))
            .await
            .map_err(|_| SttError::ConnectTimeout)??;

        self.connected.store(true, Ordering::SeqCst);
        info!(engine = self.engine.name(), "STT session connected");

        tokio::spawn(run_driver(
            ws,
            audio_rx,
            self.engine.clone(),
            self.connected.clone(),
            self.closed_tx.subscribe(),
            self.tracker.clone(),
        ));
        Ok(())
    }

    fn send_audio(&self, mulaw: &[u8]) {
        // Dropped rather than queued while disconnected; the reconnect gap
        // loses audio by design.
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.audio_tx.send(mulaw.to_vec());
    }

    async fn wait_for_transcript(&self, timeout: Duration) -> Result<String, SttError> {
        if self.is_closed() {
            return Err(SttError::Closed);
        }
        let rx = self.tracker.arm()?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // Driver dropped the sender without resolving: session died.
            Ok(Err(_)) => Err(SttError::Unavailable),
            Err(_) => {
                self.tracker.disarm();
                Err(SttError::TranscriptTimeout)
            }
        }
    }

    fn partials(&self) -> watch::Receiver<String> {
        self.tracker.partial_tx.subscribe()
    }

    async fn close(&self) {
        let _ = self.closed_tx.send(true);
        self.connected.store(false, Ordering::SeqCst);
        self.tracker.fail_waiter(SttError::Closed);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Socket driver: one loop per connection, an outer loop across reconnects.
async fn run_driver(
    mut ws: WsStream,
    mut audio_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    engine: Arc<dyn SttEngine>,
    connected: Arc<AtomicBool>,
    mut closed_rx: watch::Receiver<bool>,
    tracker: Arc<UtteranceTracker>,
) {
    'session: loop {
        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.tick().await; // the first tick fires immediately

        loop {
            let mut should_close = false;
            tokio::select! {
                _ = closed_rx.changed() => {
                    should_close = true;
                }
                chunk = audio_rx.recv() => match chunk {
                    Some(bytes) => {
                        if ws.send(engine.audio_message(&bytes)).await.is_err() {
                            break;
                        }
                    }
                    // Session handle dropped; nothing left to stream.
                    None => break 'session,
                },
                _ = keepalive.tick() => {
                    if let Some(msg) = engine.keepalive_message() {
                        if ws.send(msg).await.is_err() {
                            break;
                        }
                    }
                }
                frame = ws.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        for event in engine.parse_event(text.as_str()) {
                            tracker.on_event(event);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        warn!(%error, "STT socket error");
                        break;
                    }
                },
            }

            if should_close {
                if let Some(msg) = engine.close_message() {
                    let _ = ws.send(msg).await;
                }
                let _ = ws.close(None).await;
                break 'session;
            }
        }

        connected.store(false, Ordering::SeqCst);
        if *closed_rx.borrow() {
            break;
        }

        // Unintentional disconnect: back off and redial. Outstanding
        // waiters keep waiting until their own deadlines.
        let mut reconnected = false;
        for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            let backoff = RECONNECT_BASE * 2u32.pow(attempt - 1);
            info!(attempt, backoff_ms = backoff.as_millis() as u64, "STT reconnecting");

            tokio::select! {
                _ = closed_rx.changed() => break 'session,
                _ = tokio::time::sleep(backoff) => {}
            }

            match dial(engine.as_ref()).await {
                Ok(new_ws) => {
                    ws = new_ws;
                    connected.store(true, Ordering::SeqCst);
                    info!(attempt, "STT reconnected");
                    reconnected = true;
                    break;
                }
                Err(error) => warn!(attempt, %error, "STT reconnect attempt failed"),
            }
        }

        if !reconnected {
            warn!("STT reconnect attempts exhausted");
            tracker.fail_waiter(SttError::Unavailable);
            break;
        }
    }

    connected.store(false, Ordering::SeqCst);
    debug!("STT driver exited");
}

/// Config-selected STT backend; builds one engine-driven session per call.
pub struct SttClient {
    config: SttConfig,
}

impl SttClient {
    pub fn new(config: SttConfig) -> Self {
        Self { config }
    }

    fn engine(&self) -> Arc<dyn SttEngine> {
        match self.config.backend {
            SttBackend::Deepgram => Arc::new(deepgram::DeepgramEngine::new(&self.config)),
            SttBackend::OpenAi => Arc::new(openai::OpenAiRealtimeEngine::new(&self.config)),
        }
    }
}

impl SpeechToText for SttClient {
    fn name(&self) -> &'static str {
        match self.config.backend {
            SttBackend::Deepgram => "deepgram",
            SttBackend::OpenAi => "openai",
        }
    }

    fn create_session(&self) -> Arc<dyn SttSession> {
        Arc::new(StreamingSession::new(self.engine()))
    }
}
