use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use vigilant_eye::config::VigilConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "VIGIL_CONFIG",
        "VIGIL_ADDR",
        "VIGIL_PUBLIC_URL",
        "VIGIL_UPLOAD_DIR",
        "VIGIL_PROCESSED_DIR",
        "VIGIL_VIOLENCE_MODEL",
        "VIGIL_WEAPON_MODEL",
        "VIGIL_CAMERA_DEVICE",
        "VIGIL_ALERT_COOLDOWN_SECS",
        "VIGIL_FONT_PATH",
        "VIGIL_FFMPEG",
        "TWILIO_ACCOUNT_SID",
        "TWILIO_AUTH_TOKEN",
        "TWILIO_PHONE_NUMBER",
        "DEFAULT_ALERT_PHONE",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = VigilConfig::load().expect("load config");

    assert_eq!(cfg.addr, "0.0.0.0:5000");
    assert_eq!(cfg.upload_dir.to_str(), Some("uploads"));
    assert_eq!(cfg.processed_dir.to_str(), Some("processed"));
    assert_eq!(cfg.fusion.violence_threshold, 0.70);
    assert_eq!(cfg.fusion.weapon_threshold, 0.50);
    assert_eq!(cfg.models.sequence_len, 10);
    assert_eq!(cfg.models.classifier_edge, 224);
    assert_eq!(cfg.live.tick, Duration::from_millis(33));
    assert_eq!(cfg.live.read_attempts, 3);
    assert_eq!(cfg.live.read_timeout, Duration::from_secs(1));
    assert_eq!(cfg.live.alert_cooldown_secs, 60.0);
    assert_eq!(cfg.camera.width, 640);
    assert_eq!(cfg.camera.warmup_frames, 5);
    assert!(cfg.twilio.is_none());
    assert!(cfg.models.violence_model.is_none());
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "addr": "127.0.0.1:8080",
            "public_url": "https://vigil.example.org/",
            "upload_dir": "/var/lib/vigil/in",
            "models": {
                "violence": "models/violence.onnx",
                "weapons": "models/weapons.onnx",
                "sequence_len": 16
            },
            "thresholds": { "violence": 0.8, "weapon": 0.6 },
            "live": { "tick_ms": 50, "read_attempts": 5, "read_timeout_ms": 250 },
            "camera": { "device": "/dev/video2", "fps": 15 },
            "alerts": { "default_phone": "+15550001111" },
            "transcode_timeout_secs": 120
        }"#,
    );

    std::env::set_var("VIGIL_CONFIG", file.path());
    std::env::set_var("VIGIL_WEAPON_MODEL", "stub://weapons?boxes=1,1,5,5,0.9,1");
    std::env::set_var("VIGIL_ALERT_COOLDOWN_SECS", "30");
    std::env::set_var("DEFAULT_ALERT_PHONE", "+15552223333");
    std::env::set_var("TWILIO_ACCOUNT_SID", "AC123");
    std::env::set_var("TWILIO_AUTH_TOKEN", "secret");
    std::env::set_var("TWILIO_PHONE_NUMBER", "+15559998888");

    let cfg = VigilConfig::load().expect("load config");

    assert_eq!(cfg.addr, "127.0.0.1:8080");
    assert_eq!(cfg.public_url.as_deref(), Some("https://vigil.example.org"));
    assert_eq!(cfg.upload_dir.to_str(), Some("/var/lib/vigil/in"));
    assert_eq!(cfg.processed_dir.to_str(), Some("processed"));
    assert_eq!(cfg.models.violence_model.as_deref(), Some("models/violence.onnx"));
    assert_eq!(
        cfg.models.weapon_model.as_deref(),
        Some("stub://weapons?boxes=1,1,5,5,0.9,1")
    );
    assert_eq!(cfg.models.sequence_len, 16);
    assert_eq!(cfg.fusion.violence_threshold, 0.8);
    assert_eq!(cfg.fusion.weapon_threshold, 0.6);
    assert_eq!(cfg.live.tick, Duration::from_millis(50));
    assert_eq!(cfg.live.read_attempts, 5);
    assert_eq!(cfg.live.read_timeout, Duration::from_millis(250));
    assert_eq!(cfg.live.alert_cooldown_secs, 30.0);
    assert_eq!(cfg.camera.device, "/dev/video2");
    assert_eq!(cfg.camera.fps, 15);
    assert_eq!(cfg.camera.height, 480);
    assert_eq!(cfg.default_alert_phone.as_deref(), Some("+15552223333"));
    assert_eq!(cfg.transcode_timeout, Duration::from_secs(120));
    let twilio = cfg.twilio.expect("twilio configured");
    assert_eq!(twilio.account_sid, "AC123");
    assert_eq!(twilio.from_number, "+15559998888");

    clear_env();
}

#[test]
fn partial_twilio_credentials_are_ignored() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("TWILIO_ACCOUNT_SID", "AC123");
    std::env::set_var("TWILIO_AUTH_TOKEN", "");

    let cfg = VigilConfig::load().expect("load config");
    assert!(cfg.twilio.is_none());

    clear_env();
}

#[test]
fn rejects_out_of_range_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(r#"{ "thresholds": { "violence": 1.5 } }"#);
    std::env::set_var("VIGIL_CONFIG", file.path());
    assert!(VigilConfig::load().is_err());

    let file = write_config(r#"{ "live": { "read_attempts": 0 } }"#);
    std::env::set_var("VIGIL_CONFIG", file.path());
    assert!(VigilConfig::load().is_err());

    let file = write_config(r#"{ "live": { "read_timeout_ms": 0 } }"#);
    std::env::set_var("VIGIL_CONFIG", file.path());
    assert!(VigilConfig::load().is_err());

    std::env::remove_var("VIGIL_CONFIG");
    std::env::set_var("VIGIL_ADDR", "not-an-address");
    assert!(VigilConfig::load().is_err());
    std::env::remove_var("VIGIL_ADDR");

    std::env::set_var("VIGIL_ALERT_COOLDOWN_SECS", "soon");
    assert!(VigilConfig::load().is_err());

    clear_env();
}

#[test]
fn malformed_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config("{ not json");
    std::env::set_var("VIGIL_CONFIG", file.path());
    let err = VigilConfig::load().unwrap_err();
    assert!(err.to_string().contains("invalid config file"));

    clear_env();
}
