//! Alert cooldown and dispatch.
//!
//! `AlertThrottle` is per-session state; `AlertDispatcher` is shared and
//! formats the message before handing it to an `AlertGateway`.

mod twilio;

use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local};

use crate::detect::FrameAssessment;
use crate::error::VigilError;

pub use twilio::{TwilioConfig, TwilioGateway};

/// Default seconds between two alerts of one session.
pub const DEFAULT_ALERT_COOLDOWN_SECS: f64 = 60.0;

// ----------------------------------------------------------------------------
// Throttle
// ----------------------------------------------------------------------------

/// Cooldown gate turning a continuous danger condition into one alert.
#[derive(Clone, Debug)]
pub struct AlertThrottle {
    cooldown: f64,
    last_alert_time: Option<f64>,
}

impl AlertThrottle {
    pub fn new(cooldown_secs: f64) -> Self {
        Self {
            cooldown: cooldown_secs,
            last_alert_time: None,
        }
    }

    /// True iff dangerous and the cooldown since the last alert has elapsed.
    /// Records `now` whenever it returns true, whether or not the send succeeds.
    pub fn should_alert(&mut self, is_dangerous: bool, now: f64) -> bool {
        if !is_dangerous {
            return false;
        }
        let due = match self.last_alert_time {
            None => true,
            Some(last) => now - last > self.cooldown,
        };
        if due {
            self.last_alert_time = Some(now);
        }
        due
    }

    pub fn last_alert_time(&self) -> Option<f64> {
        self.last_alert_time
    }

    pub fn cooldown(&self) -> f64 {
        self.cooldown
    }
}

impl Default for AlertThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_ALERT_COOLDOWN_SECS)
    }
}

// ----------------------------------------------------------------------------
// Alert
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreatKind {
    Violence,
    Weapon,
}

impl fmt::Display for ThreatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreatKind::Violence => f.write_str("VIOLENCE"),
            ThreatKind::Weapon => f.write_str("WEAPON"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Alert {
    pub kind: ThreatKind,
    pub confidence: f32,
    pub raised_at: DateTime<Local>,
    pub file: Option<String>,
}

impl Alert {
    pub fn new(kind: ThreatKind, confidence: f32) -> Self {
        Self {
            kind,
            confidence,
            raised_at: Local::now(),
            file: None,
        }
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    /// Violence outranks weapons. `None` for a quiet frame.
    pub fn from_assessment(assessment: &FrameAssessment) -> Option<Self> {
        if assessment.violence_detected() {
            Some(Self::new(ThreatKind::Violence, assessment.violence.confidence))
        } else if assessment.weapons_detected() {
            Some(Self::new(ThreatKind::Weapon, assessment.weapon_confidence()))
        } else {
            None
        }
    }

    pub fn message(&self) -> String {
        let mut body = format!(
            "SECURITY ALERT\nType: {}\nTime: {}",
            self.kind,
            self.raised_at.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(file) = &self.file {
            body.push_str("\nFile: ");
            body.push_str(file);
        }
        body
    }
}

// ----------------------------------------------------------------------------
// Gateways
// ----------------------------------------------------------------------------

/// Outbound text-message channel. Calls block; async callers should use
/// `spawn_blocking`.
pub trait AlertGateway: Send + Sync {
    fn name(&self) -> &'static str;

    /// Deliver `body` to `destination`, returning a gateway receipt.
    fn send(&self, destination: &str, body: &str) -> Result<String>;
}

/// Gateway used when no SMS provider is configured: logs and succeeds.
pub struct LogGateway;

impl AlertGateway for LogGateway {
    fn name(&self) -> &'static str {
        "log"
    }

    fn send(&self, destination: &str, body: &str) -> Result<String> {
        log::warn!("alert for {} (log gateway): {}", destination, body.replace('\n', " | "));
        Ok("logged".to_string())
    }
}

/// Keeps every message in memory. Useful for tests and dry runs.
#[derive(Default)]
pub struct RecordingGateway {
    sent: Mutex<Vec<(String, String)>>,
    fail: bool,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// A gateway whose every send fails after recording the attempt.
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl AlertGateway for RecordingGateway {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn send(&self, destination: &str, body: &str) -> Result<String> {
        let mut sent = self
            .sent
            .lock()
            .map_err(|_| anyhow!("recording gateway lock poisoned"))?;
        sent.push((destination.to_string(), body.to_string()));
        if self.fail {
            return Err(anyhow!("gateway rejected message"));
        }
        Ok(format!("rec-{}", sent.len()))
    }
}

// ----------------------------------------------------------------------------
// Dispatcher
// ----------------------------------------------------------------------------

/// Delivery result of one dispatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    Sent { receipt: String },
    NoDestination,
}

#[derive(Clone)]
pub struct AlertDispatcher {
    gateway: Arc<dyn AlertGateway>,
    default_destination: Option<String>,
}

impl AlertDispatcher {
    pub fn new(gateway: Arc<dyn AlertGateway>, default_destination: Option<String>) -> Self {
        Self {
            gateway,
            default_destination,
        }
    }

    pub fn gateway_name(&self) -> &'static str {
        self.gateway.name()
    }

    /// Send `alert` to `destination`, or to the default number when `None`.
    pub fn dispatch(&self, alert: &Alert, destination: Option<&str>) -> Result<Delivery, VigilError> {
        let destination = destination
            .filter(|d| !d.trim().is_empty())
            .or(self.default_destination.as_deref());
        let Some(destination) = destination else {
            log::warn!("no destination for {} alert; not sent", alert.kind);
            return Ok(Delivery::NoDestination);
        };
        log::info!(
            "sending {} alert ({:.1}%) via {}",
            alert.kind,
            alert.confidence * 100.0,
            self.gateway.name()
        );
        match self.gateway.send(destination, &alert.message()) {
            Ok(receipt) => {
                log::info!("alert delivered: {}", receipt);
                Ok(Delivery::Sent { receipt })
            }
            Err(err) => {
                let err = VigilError::transport(self.gateway.name(), err);
                log::error!("{}", err);
                Err(err)
            }
        }
    }
}
