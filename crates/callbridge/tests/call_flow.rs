//! End-to-end call scenarios over mock providers.
//!
//! The carrier is simulated by driving a [`MediaSession`] directly: status
//! webhooks go through the manager, media frames drain from the session's
//! outbound channel, and marks are echoed the way a well-behaved carrier
//! would echo them.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use callbridge::audio::{mulaw_encode, pcm16_to_le_bytes};
use callbridge::call::CallError;
use callbridge::config::{
    BridgeConfig, PhoneConfig, PhoneProvider, ServerConfig, SttBackend, SttConfig, TtsConfig,
};
use callbridge::media::{FrameOutcome, MediaFrame, MediaSession, StartInfo};
use callbridge::stt::{SpeechToText, SttError, SttSession};
use callbridge::telephony::{
    CallEventKind, PlaceCall, StatusEvent, Telephony, TelephonyError,
};
use callbridge::tts::{SynthesizedAudio, TextToSpeech, TtsError, TtsStream};
use callbridge::CallManager;
use tokio::sync::{mpsc, watch};

// ---------------------------------------------------------------------------
// Mock providers
// ---------------------------------------------------------------------------

struct MockTts {
    sample_rate: u32,
    pcm: Vec<u8>,
    chunk_bytes: usize,
    fail_next: AtomicUsize,
}

impl MockTts {
    fn new(sample_rate: u32, pcm: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            sample_rate,
            pcm,
            chunk_bytes: 6000,
            fail_next: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TextToSpeech for MockTts {
    fn name(&self) -> &str {
        "mock-tts"
    }
    fn voice(&self) -> &str {
        "test"
    }
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn synthesize(&self, _text: &str) -> Result<SynthesizedAudio, TtsError> {
        Ok(SynthesizedAudio {
            pcm: self.pcm.clone(),
            sample_rate: self.sample_rate,
        })
    }

    async fn synthesize_stream(&self, _text: &str) -> Result<TtsStream, TtsError> {
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TtsError::EmptyAudio);
        }

        let (tx, rx) = mpsc::channel(8);
        let pcm = self.pcm.clone();
        let chunk_bytes = self.chunk_bytes;
        tokio::spawn(async move {
            for chunk in pcm.chunks(chunk_bytes) {
                if tx.send(Ok(Bytes::copy_from_slice(chunk))).await.is_err() {
                    break;
                }
            }
        });
        Ok(TtsStream {
            sample_rate: self.sample_rate,
            chunks: rx,
        })
    }
}

struct MockSttSession {
    replies: Mutex<VecDeque<String>>,
    reply_delay: Duration,
    connected: AtomicBool,
    audio_bytes: AtomicUsize,
}

impl MockSttSession {
    fn new(replies: &[&str], reply_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|s| s.to_string()).collect()),
            reply_delay,
            connected: AtomicBool::new(false),
            audio_bytes: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl SttSession for MockSttSession {
    async fn connect(&self) -> Result<(), SttError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn send_audio(&self, mulaw: &[u8]) {
        self.audio_bytes.fetch_add(mulaw.len(), Ordering::SeqCst);
    }

    async fn wait_for_transcript(&self, timeout: Duration) -> Result<String, SttError> {
        let waited = tokio::time::timeout(timeout, async {
            tokio::time::sleep(self.reply_delay).await;
            loop {
                if let Some(reply) = self.replies.lock().unwrap().pop_front() {
                    return reply;
                }
                tokio::time::sleep(Duration::from_millis(3_600_000)).await;
            }
        })
        .await;
        waited.map_err(|_| SttError::TranscriptTimeout)
    }

    fn partials(&self) -> watch::Receiver<String> {
        watch::Sender::new(String::new()).subscribe()
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

struct MockStt {
    session: Arc<MockSttSession>,
}

impl SpeechToText for MockStt {
    fn name(&self) -> &'static str {
        "mock-stt"
    }
    fn create_session(&self) -> Arc<dyn SttSession> {
        self.session.clone()
    }
}

struct MockTelephony {
    placed: Mutex<Vec<PlaceCall>>,
    hangups: Mutex<Vec<String>>,
}

impl MockTelephony {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            placed: Mutex::new(Vec::new()),
            hangups: Mutex::new(Vec::new()),
        })
    }

    async fn wait_for_place(&self) {
        while self.placed.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Telephony for MockTelephony {
    fn name(&self) -> &'static str {
        "mock-carrier"
    }

    async fn place_call(&self, request: &PlaceCall) -> Result<String, TelephonyError> {
        self.placed.lock().unwrap().push(request.clone());
        Ok("CA-test-1".to_string())
    }

    async fn hangup(&self, call_ref: &str) -> Result<(), TelephonyError> {
        self.hangups.lock().unwrap().push(call_ref.to_string());
        Ok(())
    }

    fn verify_webhook(&self, _headers: &HashMap<String, String>, _raw_body: &[u8]) -> bool {
        true
    }

    fn parse_status_event(&self, _raw_body: &[u8]) -> Option<StatusEvent> {
        None
    }

    fn render_call_instruction(&self, media_ws_url: &str) -> (&'static str, String) {
        ("application/xml", media_ws_url.to_string())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn bridge_config(transcript_timeout_ms: u64) -> BridgeConfig {
    BridgeConfig {
        phone: PhoneConfig {
            provider: PhoneProvider::Twilio,
            account_sid: "AC-test".into(),
            auth_token: "token".into(),
            phone_number: "+15550100".into(),
            user_phone_number: "+15550199".into(),
            telnyx_public_key: None,
        },
        tts: TtsConfig {
            api_key: "key".into(),
            base_url: None,
            voice: "test".into(),
            model: "tts-1".into(),
            sample_rate: 24_000,
        },
        stt: SttConfig {
            backend: SttBackend::Deepgram,
            api_key: "key".into(),
            model: None,
            silence_duration_ms: 800,
        },
        server: ServerConfig {
            port: 3333,
            public_url: "https://bridge.test".into(),
        },
        transcript_timeout_ms,
    }
}

struct Harness {
    manager: Arc<CallManager>,
    telephony: Arc<MockTelephony>,
    stt_session: Arc<MockSttSession>,
}

fn build(tts: Arc<MockTts>, stt_session: Arc<MockSttSession>, transcript_timeout_ms: u64) -> Harness {
    let telephony = MockTelephony::new();
    let manager = CallManager::new(
        bridge_config(transcript_timeout_ms),
        tts,
        Arc::new(MockStt {
            session: stt_session.clone(),
        }),
        telephony.clone(),
    );
    Harness {
        manager,
        telephony,
        stt_session,
    }
}

/// A simulated carrier media leg: records every outbound frame and echoes
/// marks back, like a carrier that plays audio instantly.
struct Carrier {
    frames: Arc<Mutex<Vec<MediaFrame>>>,
}

impl Carrier {
    async fn connect(manager: &Arc<CallManager>, call_ref: &str, echo_marks: bool) -> Self {
        let (session, mut rx) = MediaSession::new();
        let outcome = session.handle_frame(MediaFrame::Start {
            stream_sid: Some("S1".into()),
            start: StartInfo {
                stream_sid: "S1".into(),
                call_sid: Some(call_ref.into()),
                custom_parameters: HashMap::new(),
            },
        });
        assert!(matches!(outcome, FrameOutcome::Started { .. }));
        manager
            .attach_media(call_ref, session.clone())
            .await
            .expect("media stream should attach");

        let frames = Arc::new(Mutex::new(Vec::new()));
        let recorded = frames.clone();
        let echo_session = session.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                recorded.lock().unwrap().push(frame.clone());
                if echo_marks {
                    if let MediaFrame::Mark { mark, stream_sid } = frame {
                        echo_session.handle_frame(MediaFrame::Mark { stream_sid, mark });
                    }
                }
            }
        });

        Self { frames }
    }

    fn media_payload(&self) -> Vec<u8> {
        use base64::Engine;
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter_map(|frame| match frame {
                MediaFrame::Media { media, .. } => Some(
                    base64::engine::general_purpose::STANDARD
                        .decode(&media.payload)
                        .unwrap(),
                ),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn media_chunk_sizes(&self) -> Vec<usize> {
        use base64::Engine;
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter_map(|frame| match frame {
                MediaFrame::Media { media, .. } => Some(
                    base64::engine::general_purpose::STANDARD
                        .decode(&media.payload)
                        .unwrap()
                        .len(),
                ),
                _ => None,
            })
            .collect()
    }

    fn mark_names(&self) -> Vec<String> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter_map(|frame| match frame {
                MediaFrame::Mark { mark, .. } => Some(mark.name.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Runs the carrier side of call setup: ringing, answered, media connect.
async fn answer_call(harness: &Harness, echo_marks: bool) -> Carrier {
    harness.telephony.wait_for_place().await;
    let call_ref = "CA-test-1";
    harness.manager.handle_status_event(&StatusEvent {
        call_ref: call_ref.into(),
        kind: CallEventKind::Ringing,
    });
    harness.manager.handle_status_event(&StatusEvent {
        call_ref: call_ref.into(),
        kind: CallEventKind::Answered,
    });
    Carrier::connect(&harness.manager, call_ref, echo_marks).await
}

fn sine_pcm(sample_rate: u32, seconds: f64) -> Vec<u8> {
    let n = (sample_rate as f64 * seconds) as usize;
    let samples: Vec<i16> = (0..n)
        .map(|i| {
            let t = i as f64 / sample_rate as f64;
            ((t * 440.0 * std::f64::consts::TAU).sin() * 8000.0) as i16
        })
        .collect();
    pcm16_to_le_bytes(&samples)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn happy_path_initiate_returns_first_reply() {
    // 1.5 s of 24 kHz sine resamples to 12000 mu-law bytes: 3 full chunks.
    let harness = build(
        MockTts::new(24_000, sine_pcm(24_000, 1.5)),
        MockSttSession::new(&["okay"], Duration::from_millis(200)),
        180_000,
    );

    let manager = harness.manager.clone();
    let initiate = tokio::spawn(async move { manager.initiate("Ready?").await });

    let carrier = answer_call(&harness, true).await;

    let outcome = initiate.await.unwrap().expect("initiate should succeed");
    assert_eq!(outcome.response, "okay");
    assert!(!outcome.call_id.is_empty());

    let chunks = carrier.media_chunk_sizes();
    assert_eq!(chunks, vec![4000, 4000, 4000]);
    assert_eq!(carrier.mark_names().len(), 1);
    assert!(harness.stt_session.audio_bytes.load(Ordering::SeqCst) == 0);
}

#[tokio::test(start_paused = true)]
async fn multi_turn_conversation_reuses_the_call() {
    let harness = build(
        MockTts::new(24_000, sine_pcm(24_000, 0.4)),
        MockSttSession::new(&["okay", "that is all"], Duration::from_millis(100)),
        180_000,
    );

    let manager = harness.manager.clone();
    let initiate = tokio::spawn(async move { manager.initiate("Ready?").await });
    let _carrier = answer_call(&harness, true).await;
    let outcome = initiate.await.unwrap().unwrap();

    let response = harness
        .manager
        .continue_call(&outcome.call_id, "Anything else?")
        .await
        .unwrap();
    assert_eq!(response, "that is all");
}

#[tokio::test(start_paused = true)]
async fn speak_only_settles_on_mark_echo_then_listen_succeeds() {
    // 8 kHz source: outbound bytes must equal the mu-law encoding of the
    // synthesized PCM, split into <= 4000-byte chunks, in order.
    let samples: Vec<i16> = (0..6000).map(|i| ((i % 97) * 300 - 14000) as i16).collect();
    let harness = build(
        MockTts::new(8_000, pcm16_to_le_bytes(&samples)),
        MockSttSession::new(&["ready now"], Duration::from_millis(100)),
        180_000,
    );

    let manager = harness.manager.clone();
    let initiate = tokio::spawn(async move { manager.initiate("Hold on").await });
    let carrier = answer_call(&harness, true).await;
    let outcome = initiate.await.unwrap().unwrap();
    assert_eq!(outcome.response, "ready now");

    let before_marks = carrier.mark_names().len();
    harness
        .manager
        .speak_only(&outcome.call_id, "One moment")
        .await
        .unwrap();
    assert_eq!(carrier.mark_names().len(), before_marks + 1);

    // Every outbound byte is accounted for, in synthesis order.
    let expected: Vec<u8> = mulaw_encode(&samples)
        .into_iter()
        .chain(mulaw_encode(&samples))
        .collect();
    assert_eq!(carrier.media_payload(), expected);
    let sizes = carrier.media_chunk_sizes();
    assert!(sizes.iter().all(|&s| s <= 4000));

    // The call is back in READY and can listen again.
    harness
        .stt_session
        .replies
        .lock()
        .unwrap()
        .push_back("yes".into());
    let reply = harness
        .manager
        .continue_call(&outcome.call_id, "Ready now?")
        .await
        .unwrap();
    assert_eq!(reply, "yes");
}

#[tokio::test(start_paused = true)]
async fn silent_user_resolves_with_transcript_timeout() {
    let harness = build(
        MockTts::new(24_000, sine_pcm(24_000, 0.2)),
        MockSttSession::new(&["first"], Duration::from_millis(50)),
        500,
    );

    let manager = harness.manager.clone();
    let initiate = tokio::spawn(async move { manager.initiate("Hello?").await });
    let _carrier = answer_call(&harness, true).await;
    let outcome = initiate.await.unwrap().unwrap();

    let started = tokio::time::Instant::now();
    let result = harness
        .manager
        .continue_call(&outcome.call_id, "Still there?")
        .await;
    assert!(matches!(result, Err(CallError::TranscriptTimeout)));
    // Bounded by the 500 ms listen window plus playback, not the default
    // three minutes.
    assert!(started.elapsed() < Duration::from_secs(5));

    // Recoverable: the call survives a silent turn.
    harness
        .stt_session
        .replies
        .lock()
        .unwrap()
        .push_back("sorry, yes".into());
    let reply = harness
        .manager
        .continue_call(&outcome.call_id, "Take your time.")
        .await
        .unwrap();
    assert_eq!(reply, "sorry, yes");
}

#[tokio::test(start_paused = true)]
async fn hangup_during_playback_cancels_and_releases_everything() {
    // 2.5 s of 8 kHz audio: five chunks, so the hangup lands mid-playout.
    let harness = build(
        MockTts::new(8_000, pcm16_to_le_bytes(&vec![4000i16; 20_000])),
        MockSttSession::new(&["unused"], Duration::from_millis(100)),
        180_000,
    );

    let manager = harness.manager.clone();
    let initiate = tokio::spawn(async move { manager.initiate("Long speech").await });
    let carrier = answer_call(&harness, false).await;

    // Let two chunks out, then the user hangs up.
    while carrier.media_chunk_sizes().len() < 2 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    harness.manager.handle_status_event(&StatusEvent {
        call_ref: "CA-test-1".into(),
        kind: CallEventKind::Hangup,
    });

    let result = initiate.await.unwrap();
    assert!(matches!(result, Err(CallError::Cancelled)));

    // The registry drains within the two-second bound.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !harness.manager.active_calls().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "call never ended");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Everything released: STT closed, carrier hangup issued, and no
    // further frames after the close.
    assert!(!harness.stt_session.is_connected());
    assert_eq!(harness.telephony.hangups.lock().unwrap().as_slice(), ["CA-test-1"]);
    let frames_at_close = carrier.frames.lock().unwrap().len();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(carrier.frames.lock().unwrap().len(), frames_at_close);
}

#[tokio::test(start_paused = true)]
async fn empty_synthesis_still_completes_the_turn_with_a_mark() {
    let harness = build(
        MockTts::new(24_000, Vec::new()),
        MockSttSession::new(&["fine"], Duration::from_millis(50)),
        180_000,
    );

    let manager = harness.manager.clone();
    let initiate = tokio::spawn(async move { manager.initiate("(silence)").await });
    let carrier = answer_call(&harness, true).await;
    let outcome = initiate.await.unwrap().unwrap();

    assert_eq!(outcome.response, "fine");
    assert!(carrier.media_chunk_sizes().is_empty());
    assert_eq!(carrier.mark_names().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn tts_failure_is_retried_once_before_surfacing() {
    let tts = MockTts::new(24_000, sine_pcm(24_000, 0.2));
    tts.fail_next.store(1, Ordering::SeqCst);
    let harness = build(
        tts,
        MockSttSession::new(&["okay"], Duration::from_millis(50)),
        180_000,
    );

    let manager = harness.manager.clone();
    let initiate = tokio::spawn(async move { manager.initiate("Ready?").await });
    let _carrier = answer_call(&harness, true).await;

    // One failure is absorbed by the retry.
    let outcome = initiate.await.unwrap().unwrap();
    assert_eq!(outcome.response, "okay");
}

#[tokio::test(start_paused = true)]
async fn second_operation_while_listening_is_busy() {
    let harness = build(
        MockTts::new(24_000, sine_pcm(24_000, 0.2)),
        MockSttSession::new(&["okay", "later"], Duration::from_millis(100)),
        180_000,
    );

    let manager = harness.manager.clone();
    let initiate = tokio::spawn(async move { manager.initiate("Ready?").await });
    let _carrier = answer_call(&harness, true).await;
    let outcome = initiate.await.unwrap().unwrap();

    // Park a turn in its listening phase, then try a second operation.
    let call_id = outcome.call_id.clone();
    let manager = harness.manager.clone();
    let slow_turn = tokio::spawn(async move { manager.continue_call(&call_id, "hold").await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let busy = harness
        .manager
        .speak_only(&outcome.call_id, "interrupting")
        .await;
    assert!(matches!(busy, Err(CallError::Busy)));

    assert_eq!(slow_turn.await.unwrap().unwrap(), "later");
}

#[tokio::test]
async fn unknown_call_ids_are_not_found() {
    let harness = build(
        MockTts::new(24_000, Vec::new()),
        MockSttSession::new(&[], Duration::from_millis(50)),
        180_000,
    );
    let result = harness.manager.continue_call("no-such-call", "hello").await;
    assert!(matches!(result, Err(CallError::NotFound(_))));
}
