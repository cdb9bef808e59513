use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;

use super::AlertGateway;

const API_BASE: &str = "https://api.twilio.com/2010-04-01";
const TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
}

impl TwilioConfig {
    /// `None` unless all three credentials are present and non-empty.
    pub fn from_parts(
        account_sid: Option<String>,
        auth_token: Option<String>,
        from_number: Option<String>,
    ) -> Option<Self> {
        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        Some(Self {
            account_sid: non_empty(account_sid)?,
            auth_token: non_empty(auth_token)?,
            from_number: non_empty(from_number)?,
        })
    }
}

/// SMS delivery through the Twilio Messages REST endpoint.
pub struct TwilioGateway {
    config: TwilioConfig,
    agent: ureq::Agent,
}

#[derive(Deserialize)]
struct MessageResponse {
    sid: String,
    #[serde(default)]
    status: Option<String>,
}

impl TwilioGateway {
    pub fn new(config: TwilioConfig) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(TIMEOUT).build();
        Self { config, agent }
    }

    fn endpoint(&self) -> String {
        format!("{}/Accounts/{}/Messages.json", API_BASE, self.config.account_sid)
    }

    fn authorization(&self) -> String {
        let raw = format!("{}:{}", self.config.account_sid, self.config.auth_token);
        format!("Basic {}", STANDARD.encode(raw))
    }
}

impl AlertGateway for TwilioGateway {
    fn name(&self) -> &'static str {
        "twilio"
    }

    fn send(&self, destination: &str, body: &str) -> Result<String> {
        let response = self
            .agent
            .post(&self.endpoint())
            .set("Authorization", &self.authorization())
            .send_form(&[
                ("To", destination),
                ("From", self.config.from_number.as_str()),
                ("Body", body),
            ]);
        let response = match response {
            Ok(response) => response,
            Err(ureq::Error::Status(code, response)) => {
                let detail = response.into_string().unwrap_or_default();
                return Err(anyhow!("twilio returned {}: {}", code, detail.trim()));
            }
            Err(err) => return Err(err).context("twilio request failed"),
        };
        let parsed: MessageResponse = response
            .into_json()
            .context("decode twilio response")?;
        log::debug!(
            "twilio message {} status {}",
            parsed.sid,
            parsed.status.as_deref().unwrap_or("unknown")
        );
        Ok(parsed.sid)
    }
}
