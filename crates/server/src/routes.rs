//! Carrier-facing route handlers.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use callbridge::media::{FrameOutcome, MediaFrame, MediaSession};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::AppState;

/// `GET|POST /call-instruction` — the document the carrier fetches when the
/// call is picked up; it directs the carrier to open the media WebSocket.
pub async fn call_instruction_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (content_type, body) = state.telephony.render_call_instruction(&state.media_ws_url);
    (StatusCode::OK, [("Content-Type", content_type)], body)
}

/// `POST /status` — carrier call-status callbacks, signature-verified and
/// routed to the call they reference.
pub async fn status_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let headers: HashMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();

    if !state.telephony.verify_webhook(&headers, &body) {
        warn!("rejecting status webhook with bad signature");
        return StatusCode::FORBIDDEN;
    }

    if let Some(event) = state.telephony.parse_status_event(&body) {
        state.manager.handle_status_event(&event);
    } else {
        debug!("ignoring untracked status callback");
    }
    StatusCode::OK
}

/// `GET /media-stream` — upgraded into a carrier media session.
pub async fn media_stream_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_media_socket(socket, state))
}

/// Pumps the carrier socket through a [`MediaSession`]: outbound frames
/// drain to the socket from a writer task, inbound frames feed the session
/// until the stream stops or the call rejects it.
async fn handle_media_socket(socket: WebSocket, state: AppState) {
    info!("media WebSocket connected");
    let (mut sender, mut receiver) = socket.split();
    let (session, mut outbound_rx) = MediaSession::new();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if sender.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        match message {
            WsMessage::Text(text) => {
                let frame: MediaFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(_) => {
                        debug!("unparseable media frame");
                        continue;
                    }
                };
                match session.handle_frame(frame) {
                    FrameOutcome::Started { call_sid } => {
                        if let Err(error) = state.manager.attach_media(&call_sid, session.clone()).await
                        {
                            warn!(%call_sid, %error, "media stream refused");
                            break;
                        }
                    }
                    FrameOutcome::Stopped => break,
                    FrameOutcome::Rejected(reason) => {
                        warn!(reason, "closing media stream");
                        break;
                    }
                    FrameOutcome::Continue => {}
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    session.close();
    send_task.abort();
    info!("media WebSocket disconnected");
}

/// `GET /health` — liveness plus the configured provider names.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "providers": {
            "phone": state.telephony.name(),
            "tts": state.tts_name,
            "stt": state.stt_name,
        },
        "activeCalls": state.manager.active_calls().len(),
    }))
}
