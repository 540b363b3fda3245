//! HTTP and WebSocket surface for the voice-call bridge.
//!
//! Three routes face the carrier — the call-instruction document fetched on
//! pickup, the status-callback endpoint, and the media-stream WebSocket —
//! plus a health check. Everything the handlers need rides in [`AppState`];
//! there are no globals.

pub mod routes;

use std::sync::Arc;

use axum::{
    routing::{any, get, post},
    Router,
};
use callbridge::{CallManager, Telephony};

/// State shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<CallManager>,
    pub telephony: Arc<dyn Telephony>,
    /// WebSocket URL the instruction document points the carrier at.
    pub media_ws_url: String,
    pub tts_name: String,
    pub stt_name: &'static str,
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        // Carriers disagree on the verb they fetch instruction documents
        // with, so accept any.
        .route("/call-instruction", any(routes::call_instruction_handler))
        .route("/status", post(routes::status_handler))
        .route("/media-stream", get(routes::media_stream_handler))
        .route("/health", get(routes::health_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use callbridge::config::{
        BridgeConfig, PhoneConfig, PhoneProvider, ServerConfig, SttBackend, SttConfig, TtsConfig,
    };
    use callbridge::stt::SttClient;
    use callbridge::tts::OpenAiTts;
    use callbridge::{SpeechToText, TextToSpeech};
    use serde_json::Value;
    use tower::ServiceExt;

    fn test_config(provider: PhoneProvider) -> BridgeConfig {
        BridgeConfig {
            phone: PhoneConfig {
                provider,
                account_sid: "AC123".into(),
                auth_token: "token".into(),
                phone_number: "+15550100".into(),
                user_phone_number: "+15550199".into(),
                telnyx_public_key: None,
            },
            tts: TtsConfig {
                api_key: "tts-key".into(),
                base_url: None,
                voice: "alloy".into(),
                model: "tts-1".into(),
                sample_rate: 24_000,
            },
            stt: SttConfig {
                backend: SttBackend::Deepgram,
                api_key: "dg-key".into(),
                model: None,
                silence_duration_ms: 800,
            },
            server: ServerConfig {
                port: 3333,
                public_url: "https://bridge.example.com".into(),
            },
            transcript_timeout_ms: 180_000,
        }
    }

    fn test_state(provider: PhoneProvider) -> AppState {
        let config = test_config(provider);
        let tts = Arc::new(OpenAiTts::new(config.tts.clone()));
        let stt = Arc::new(SttClient::new(config.stt.clone()));
        let telephony = callbridge::telephony::from_config(&config.phone, &config.server);
        let media_ws_url = config.server.media_ws_url();
        let tts_name = tts.name().to_string();
        let stt_name = stt.name();
        let manager = CallManager::new(config, tts, stt, telephony.clone());
        AppState {
            manager,
            telephony,
            media_ws_url,
            tts_name,
            stt_name,
        }
    }

    #[tokio::test]
    async fn health_reports_provider_names() {
        let app = app(test_state(PhoneProvider::Telnyx));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["providers"]["phone"], "telnyx");
        assert_eq!(json["providers"]["tts"], "openai");
        assert_eq!(json["providers"]["stt"], "deepgram");
        assert_eq!(json["activeCalls"], 0);
    }

    #[tokio::test]
    async fn call_instruction_serves_the_stream_document() {
        let app = app(test_state(PhoneProvider::Telnyx));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/call-instruction")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/xml"
        );

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let xml = String::from_utf8(body.to_vec()).unwrap();
        assert!(xml.contains("<Stream url=\"wss://bridge.example.com/media-stream\"/>"));
    }

    #[tokio::test]
    async fn unsigned_twilio_status_webhooks_are_rejected() {
        let app = app(test_state(PhoneProvider::Twilio));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/status")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(Body::from("CallSid=CA1&CallStatus=ringing"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn status_webhooks_for_unknown_calls_are_acknowledged() {
        // Telnyx with no public key configured skips verification.
        let app = app(test_state(PhoneProvider::Telnyx));
        let body = r#"{"data":{"event_type":"call.hangup","payload":{"call_control_id":"cc-1"}}}"#;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/status")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
