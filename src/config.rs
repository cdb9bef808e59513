use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::alert::{TwilioConfig, DEFAULT_ALERT_COOLDOWN_SECS};
use crate::detect::{FusionSettings, ModelSettings};
use crate::ingest::CameraConfig;
use crate::pipeline::LiveSettings;
use crate::transcode::DEFAULT_TRANSCODE_TIMEOUT;

const DEFAULT_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_UPLOAD_DIR: &str = "uploads";
const DEFAULT_PROCESSED_DIR: &str = "processed";
const DEFAULT_FFMPEG: &str = "ffmpeg";

#[derive(Debug, Deserialize, Default)]
struct VigilConfigFile {
    addr: Option<String>,
    public_url: Option<String>,
    upload_dir: Option<PathBuf>,
    processed_dir: Option<PathBuf>,
    models: Option<ModelsConfigFile>,
    thresholds: Option<ThresholdsConfigFile>,
    live: Option<LiveConfigFile>,
    camera: Option<CameraConfigFile>,
    alerts: Option<AlertsConfigFile>,
    font_path: Option<PathBuf>,
    ffmpeg: Option<PathBuf>,
    transcode_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelsConfigFile {
    violence: Option<String>,
    weapons: Option<String>,
    sequence_len: Option<usize>,
    classifier_edge: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ThresholdsConfigFile {
    violence: Option<f32>,
    fight_class: Option<usize>,
    weapon: Option<f32>,
    weapon_class: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct LiveConfigFile {
    tick_ms: Option<u64>,
    read_attempts: Option<u32>,
    retry_backoff_ms: Option<u64>,
    read_timeout_ms: Option<u64>,
    min_brightness: Option<f64>,
    alert_cooldown_secs: Option<f64>,
    annotate_frames: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    warmup_frames: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertsConfigFile {
    default_phone: Option<String>,
}

/// Server and scanner configuration.
///
/// Layered as: built-in defaults, then the JSON file named by
/// `VIGIL_CONFIG`, then environment variables. Twilio credentials are read
/// from the environment only.
#[derive(Debug, Clone)]
pub struct VigilConfig {
    pub addr: String,
    /// Base URL used in `video_url`; the request host when unset.
    pub public_url: Option<String>,
    pub upload_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub models: ModelSettings,
    pub fusion: FusionSettings,
    pub live: LiveSettings,
    pub camera: CameraConfig,
    pub default_alert_phone: Option<String>,
    pub twilio: Option<TwilioConfig>,
    pub font_path: Option<PathBuf>,
    pub ffmpeg: PathBuf,
    pub transcode_timeout: Duration,
}

impl VigilConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("VIGIL_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: VigilConfigFile) -> Self {
        let model_defaults = ModelSettings::default();
        let models = file.models.unwrap_or_default();
        let fusion_defaults = FusionSettings::default();
        let thresholds = file.thresholds.unwrap_or_default();
        let live_defaults = LiveSettings::default();
        let live = file.live.unwrap_or_default();
        let camera_defaults = CameraConfig::default();
        let camera = file.camera.unwrap_or_default();

        Self {
            addr: file.addr.unwrap_or_else(|| DEFAULT_ADDR.to_string()),
            public_url: file.public_url,
            upload_dir: file
                .upload_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR)),
            processed_dir: file
                .processed_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PROCESSED_DIR)),
            models: ModelSettings {
                violence_model: models.violence,
                weapon_model: models.weapons,
                sequence_len: models.sequence_len.unwrap_or(model_defaults.sequence_len),
                classifier_edge: models
                    .classifier_edge
                    .unwrap_or(model_defaults.classifier_edge),
            },
            fusion: FusionSettings {
                violence_threshold: thresholds
                    .violence
                    .unwrap_or(fusion_defaults.violence_threshold),
                fight_class: thresholds.fight_class.unwrap_or(fusion_defaults.fight_class),
                weapon_threshold: thresholds.weapon.unwrap_or(fusion_defaults.weapon_threshold),
                weapon_class: thresholds.weapon_class.unwrap_or(fusion_defaults.weapon_class),
            },
            live: LiveSettings {
                tick: live
                    .tick_ms
                    .map(Duration::from_millis)
                    .unwrap_or(live_defaults.tick),
                read_attempts: live.read_attempts.unwrap_or(live_defaults.read_attempts),
                retry_backoff: live
                    .retry_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(live_defaults.retry_backoff),
                read_timeout: live
                    .read_timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(live_defaults.read_timeout),
                min_brightness: live.min_brightness.unwrap_or(live_defaults.min_brightness),
                alert_cooldown_secs: live
                    .alert_cooldown_secs
                    .unwrap_or(DEFAULT_ALERT_COOLDOWN_SECS),
                annotate_frames: live.annotate_frames.unwrap_or(live_defaults.annotate_frames),
            },
            camera: CameraConfig {
                device: camera.device.unwrap_or(camera_defaults.device),
                width: camera.width.unwrap_or(camera_defaults.width),
                height: camera.height.unwrap_or(camera_defaults.height),
                fps: camera.fps.unwrap_or(camera_defaults.fps),
                warmup_frames: camera.warmup_frames.unwrap_or(camera_defaults.warmup_frames),
            },
            default_alert_phone: file.alerts.and_then(|alerts| alerts.default_phone),
            twilio: None,
            font_path: file.font_path,
            ffmpeg: file.ffmpeg.unwrap_or_else(|| PathBuf::from(DEFAULT_FFMPEG)),
            transcode_timeout: file
                .transcode_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_TRANSCODE_TIMEOUT),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = env_non_empty("VIGIL_ADDR") {
            self.addr = addr;
        }
        if let Some(url) = env_non_empty("VIGIL_PUBLIC_URL") {
            self.public_url = Some(url);
        }
        if let Some(dir) = env_non_empty("VIGIL_UPLOAD_DIR") {
            self.upload_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env_non_empty("VIGIL_PROCESSED_DIR") {
            self.processed_dir = PathBuf::from(dir);
        }
        if let Some(path) = env_non_empty("VIGIL_VIOLENCE_MODEL") {
            self.models.violence_model = Some(path);
        }
        if let Some(path) = env_non_empty("VIGIL_WEAPON_MODEL") {
            self.models.weapon_model = Some(path);
        }
        if let Some(device) = env_non_empty("VIGIL_CAMERA_DEVICE") {
            self.camera.device = device;
        }
        if let Some(cooldown) = env_non_empty("VIGIL_ALERT_COOLDOWN_SECS") {
            self.live.alert_cooldown_secs = cooldown
                .parse()
                .map_err(|_| anyhow!("VIGIL_ALERT_COOLDOWN_SECS must be a number of seconds"))?;
        }
        if let Some(path) = env_non_empty("VIGIL_FONT_PATH") {
            self.font_path = Some(PathBuf::from(path));
        }
        if let Some(path) = env_non_empty("VIGIL_FFMPEG") {
            self.ffmpeg = PathBuf::from(path);
        }
        if let Some(phone) = env_non_empty("DEFAULT_ALERT_PHONE") {
            self.default_alert_phone = Some(phone);
        }
        self.twilio = TwilioConfig::from_parts(
            env_non_empty("TWILIO_ACCOUNT_SID"),
            env_non_empty("TWILIO_AUTH_TOKEN"),
            env_non_empty("TWILIO_PHONE_NUMBER"),
        );
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.addr
            .parse::<SocketAddr>()
            .map_err(|_| anyhow!("invalid listen address '{}'", self.addr))?;
        if let Some(url) = &self.public_url {
            url::Url::parse(url).map_err(|e| anyhow!("invalid public url '{}': {}", url, e))?;
            self.public_url = Some(url.trim_end_matches('/').to_string());
        }
        check_unit("violence threshold", self.fusion.violence_threshold)?;
        check_unit("weapon threshold", self.fusion.weapon_threshold)?;
        if self.fusion.fight_class > 1 {
            return Err(anyhow!("fight class must index a two-class output"));
        }
        if self.models.sequence_len == 0 {
            return Err(anyhow!("sequence length must be greater than zero"));
        }
        if self.models.classifier_edge == 0 {
            return Err(anyhow!("classifier edge must be greater than zero"));
        }
        if !(self.live.alert_cooldown_secs.is_finite() && self.live.alert_cooldown_secs > 0.0) {
            return Err(anyhow!("alert cooldown must be greater than zero"));
        }
        if self.live.tick.is_zero() {
            return Err(anyhow!("live tick must be greater than zero"));
        }
        if self.live.read_attempts == 0 {
            return Err(anyhow!("read attempts must be greater than zero"));
        }
        if self.live.read_timeout.is_zero() {
            return Err(anyhow!("read timeout must be greater than zero"));
        }
        if self.camera.width == 0 || self.camera.height == 0 || self.camera.fps == 0 {
            return Err(anyhow!("camera geometry and fps must be greater than zero"));
        }
        if self.transcode_timeout.is_zero() {
            return Err(anyhow!("transcode timeout must be greater than zero"));
        }
        if self.twilio.is_none() {
            log::debug!("twilio credentials not configured; alerts will only be logged");
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<VigilConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn check_unit(name: &str, value: f32) -> Result<()> {
    if value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(anyhow!("{} must be between 0 and 1 (exclusive), got {}", name, value))
    }
}
