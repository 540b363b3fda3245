//! Telnyx carrier variant.
//!
//! Calls are created through the TeXML API (Twilio-compatible instruction
//! documents and callback vocabulary, bearer-token auth). Webhooks are
//! authenticated with the account's Ed25519 public key over
//! `timestamp|raw_body`; when no key is configured, verification is
//! skipped.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use tracing::{info, warn};

use super::{
    status_from_str, twiml::InstructionBuilder, PlaceCall, StatusEvent, Telephony, TelephonyError,
};
use crate::config::PhoneConfig;

const API_BASE: &str = "https://api.telnyx.com/v2/texml";

pub struct TelnyxProvider {
    client: reqwest::Client,
    config: PhoneConfig,
    verifying_key: Option<VerifyingKey>,
}

impl TelnyxProvider {
    pub fn new(config: PhoneConfig) -> Self {
        let verifying_key = config.telnyx_public_key.as_deref().and_then(decode_key);
        if config.telnyx_public_key.is_some() && verifying_key.is_none() {
            warn!("TELNYX_PUBLIC_KEY is not a valid Ed25519 key; webhook verification disabled");
        }
        Self {
            client: reqwest::Client::new(),
            config,
            verifying_key,
        }
    }

    fn calls_url(&self) -> String {
        format!("{API_BASE}/Accounts/{}/Calls", self.config.account_sid)
    }

    fn call_url(&self, call_ref: &str) -> String {
        format!(
            "{API_BASE}/Accounts/{}/Calls/{call_ref}",
            self.config.account_sid
        )
    }
}

fn decode_key(base64_key: &str) -> Option<VerifyingKey> {
    let bytes = BASE64.decode(base64_key.as_bytes()).ok()?;
    let bytes: [u8; 32] = bytes.try_into().ok()?;
    VerifyingKey::from_bytes(&bytes).ok()
}

#[async_trait]
impl Telephony for TelnyxProvider {
    fn name(&self) -> &'static str {
        "telnyx"
    }

    async fn place_call(&self, request: &PlaceCall) -> Result<String, TelephonyError> {
        let payload = serde_json::json!({
            "To": request.to,
            "From": request.from,
            "Url": request.instruction_url,
            "Method": "POST",
            "StatusCallback": request.status_callback_url,
            "StatusCallbackMethod": "POST",
        });

        let response = self
            .client
            .post(self.calls_url())
            .bearer_auth(&self.config.auth_token)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        if !status.is_success() {
            warn!(status = status.as_u16(), "Telnyx call creation rejected");
            return Err(TelephonyError::CarrierRejected(body.to_string()));
        }

        // TeXML mirrors the Twilio response shape; some deployments nest it
        // under `data`.
        let call_ref = body["sid"]
            .as_str()
            .or_else(|| body["data"]["sid"].as_str())
            .ok_or(TelephonyError::MissingCallRef)?
            .to_string();
        info!(%call_ref, to = %request.to, "outbound call created");
        Ok(call_ref)
    }

    async fn hangup(&self, call_ref: &str) -> Result<(), TelephonyError> {
        let response = self
            .client
            .post(self.call_url(call_ref))
            .bearer_auth(&self.config.auth_token)
            .json(&serde_json::json!({ "Status": "completed" }))
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TelephonyError::CarrierRejected(body));
        }
        Ok(())
    }

    fn verify_webhook(&self, headers: &HashMap<String, String>, raw_body: &[u8]) -> bool {
        let Some(key) = &self.verifying_key else {
            // No key configured: accept, per deployment choice.
            return true;
        };

        let (Some(signature), Some(timestamp)) = (
            headers.get("telnyx-signature-ed25519"),
            headers.get("telnyx-timestamp"),
        ) else {
            return false;
        };
        let Ok(signature_bytes) = BASE64.decode(signature.as_bytes()) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&signature_bytes) else {
            return false;
        };

        let mut message = Vec::with_capacity(timestamp.len() + 1 + raw_body.len());
        message.extend_from_slice(timestamp.as_bytes());
        message.push(b'|');
        message.extend_from_slice(raw_body);

        key.verify(&message, &signature).is_ok()
    }

    fn parse_status_event(&self, raw_body: &[u8]) -> Option<StatusEvent> {
        // Call Control-style JSON envelope first, TeXML form fallback.
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(raw_body) {
            let data = &value["data"];
            let call_ref = data["payload"]["call_control_id"].as_str()?.to_string();
            let kind = match data["event_type"].as_str()? {
                "call.initiated" | "call.ringing" => super::CallEventKind::Ringing,
                "call.answered" => super::CallEventKind::Answered,
                "call.hangup" => super::CallEventKind::Hangup,
                _ => return None,
            };
            return Some(StatusEvent { call_ref, kind });
        }

        let mut call_ref = None;
        let mut status = None;
        for (name, value) in url::form_urlencoded::parse(raw_body) {
            match name.as_ref() {
                "CallSid" => call_ref = Some(value.into_owned()),
                "CallStatus" => status = Some(value.into_owned()),
                _ => {}
            }
        }
        Some(StatusEvent {
            call_ref: call_ref?,
            kind: status_from_str(&status?)?,
        })
    }

    fn render_call_instruction(&self, media_ws_url: &str) -> (&'static str, String) {
        (
            "application/xml",
            InstructionBuilder::media_stream(media_ws_url),
        )
    }
}
