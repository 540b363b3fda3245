//! Voice-call bridge server binary.
//!
//! Reads configuration from the environment (and `.env` in development),
//! builds the provider set and the call manager, and serves the carrier
//! webhook surface with graceful shutdown on SIGTERM/SIGINT.

use std::net::SocketAddr;
use std::sync::Arc;

use callbridge::stt::{SpeechToText, SttClient};
use callbridge::tts::{OpenAiTts, TextToSpeech};
use callbridge::{BridgeConfig, CallManager};
use server::{app, AppState};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,server=info,callbridge=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = BridgeConfig::from_env()
        .expect("invalid configuration — the bridge cannot start without its provider settings");

    let tts = Arc::new(OpenAiTts::new(config.tts.clone()));
    let stt = Arc::new(SttClient::new(config.stt.clone()));
    let telephony = callbridge::telephony::from_config(&config.phone, &config.server);

    tracing::info!(
        phone = telephony.name(),
        tts = tts.name(),
        stt = stt.name(),
        public_url = %config.server.public_url,
        "providers configured"
    );

    let media_ws_url = config.server.media_ws_url();
    let tts_name = tts.name().to_string();
    let stt_name = stt.name();
    let port = config.server.port;
    let manager = CallManager::new(config, tts, stt, telephony.clone());

    let state = AppState {
        manager,
        telephony,
        media_ws_url,
        tts_name,
        stt_name,
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "starting voice-call bridge");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind — is another process using this port?");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    tracing::info!("voice-call bridge shut down");
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, shutting down"); }
        () = terminate => { tracing::info!("received SIGTERM, shutting down"); }
    }
}
