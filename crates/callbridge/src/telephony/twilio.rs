//! Twilio carrier variant.
//!
//! Outbound calls go through the 2010-04-01 REST API with basic auth;
//! status callbacks arrive form-encoded and are authenticated with the
//! account's auth token: HMAC-SHA1 over the callback URL concatenated with
//! the alphabetically sorted parameters.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ring::hmac;
use tracing::{info, warn};

use super::{
    status_from_str, twiml::InstructionBuilder, PlaceCall, StatusEvent, Telephony, TelephonyError,
};
use crate::config::PhoneConfig;

const API_BASE: &str = "https://api.twilio.com/2010-04-01";

pub struct TwilioProvider {
    client: reqwest::Client,
    config: PhoneConfig,
    /// Exact URL the carrier signs status callbacks against.
    status_callback_url: String,
}

impl TwilioProvider {
    pub fn new(config: PhoneConfig, status_callback_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            status_callback_url,
        }
    }

    fn calls_url(&self) -> String {
        format!("{API_BASE}/Accounts/{}/Calls.json", self.config.account_sid)
    }

    fn call_url(&self, call_ref: &str) -> String {
        format!(
            "{API_BASE}/Accounts/{}/Calls/{call_ref}.json",
            self.config.account_sid
        )
    }

    /// Builds the string Twilio signs: the callback URL followed by every
    /// POST parameter, sorted by name, concatenated as `name` + `value`.
    fn validation_string(&self, raw_body: &[u8]) -> String {
        let mut params: Vec<(String, String)> = url::form_urlencoded::parse(raw_body)
            .into_owned()
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = self.status_callback_url.clone();
        for (name, value) in params {
            out.push_str(&name);
            out.push_str(&value);
        }
        out
    }
}

#[async_trait]
impl Telephony for TwilioProvider {
    fn name(&self) -> &'static str {
        "twilio"
    }

    async fn place_call(&self, request: &PlaceCall) -> Result<String, TelephonyError> {
        let form = [
            ("To", request.to.as_str()),
            ("From", request.from.as_str()),
            ("Url", request.instruction_url.as_str()),
            ("Method", "POST"),
            ("StatusCallback", request.status_callback_url.as_str()),
            ("StatusCallbackEvent", "ringing"),
            ("StatusCallbackEvent", "answered"),
            ("StatusCallbackEvent", "completed"),
        ];

        let response = self
            .client
            .post(self.calls_url())
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        if !status.is_success() {
            warn!(status = status.as_u16(), "Twilio call creation rejected");
            return Err(TelephonyError::CarrierRejected(body.to_string()));
        }

        let call_sid = body["sid"]
            .as_str()
            .ok_or(TelephonyError::MissingCallRef)?
            .to_string();
        info!(%call_sid, to = %request.to, "outbound call created");
        Ok(call_sid)
    }

    async fn hangup(&self, call_ref: &str) -> Result<(), TelephonyError> {
        let response = self
            .client
            .post(self.call_url(call_ref))
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&[("Status", "completed")])
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TelephonyError::CarrierRejected(body));
        }
        Ok(())
    }

    fn verify_webhook(&self, headers: &HashMap<String, String>, raw_body: &[u8]) -> bool {
        let Some(signature) = headers.get("x-twilio-signature") else {
            return false;
        };
        let Ok(provided) = BASE64.decode(signature.as_bytes()) else {
            return false;
        };

        let key = hmac::Key::new(
            hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
            self.config.auth_token.as_bytes(),
        );
        // ring's verify is constant-time.
        hmac::verify(&key, self.validation_string(raw_body).as_bytes(), &provided).is_ok()
    }

    fn parse_status_event(&self, raw_body: &[u8]) -> Option<StatusEvent> {
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
