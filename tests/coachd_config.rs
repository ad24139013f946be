use std::io::Write;
use std::sync::Mutex;

use tempfile::{Builder, NamedTempFile};

use rehab_coach::config::CoachdConfig;
use rehab_coach::{HandSide, TargetMode};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "COACH_CONFIG",
        "COACH_DB_PATH",
        "COACH_SESSION_ID",
        "COACH_API_ADDR",
        "COACH_CAMERA_URL",
        "COACH_TARGET_HZ",
        "COACH_STICKY_FRAMES",
        "COACH_DOMINANT",
        "COACH_TARGET_MODE",
        "COACH_MODEL_PATH",
        "DEX_DOMINANT",
        "DEX_TARGET_MODE",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_json_config_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "db_path": "clinic.db",
        "session_id": "patient-12",
        "api": { "addr": "127.0.0.1:9100" },
        "camera": { "url": "stub://bench", "width": 640, "height": 480, "mirror": false },
        "loop": { "target_hz": 15, "sticky_frames": 10 },
        "session": { "dominant": "left", "target_mode": "head" },
        "detector": { "target_class": 41, "confidence": 0.35 }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("COACH_CONFIG", file.path());
    std::env::set_var("COACH_TARGET_HZ", "25");
    std::env::set_var("COACH_MODEL_PATH", "/models/cup.onnx");

    let cfg = CoachdConfig::load().expect("load config");

    assert_eq!(cfg.db_path, "clinic.db");
    assert_eq!(cfg.session_id, "patient-12");
    assert_eq!(cfg.api_addr, "127.0.0.1:9100");
    assert_eq!(cfg.camera.url, "stub://bench");
    assert_eq!((cfg.camera.width, cfg.camera.height), (640, 480));
    assert!(!cfg.mirror);
    assert_eq!(cfg.target_hz, 25);
    assert_eq!(cfg.sticky_frames, 10);
    assert_eq!(cfg.session.dominant_hand, HandSide::Left);
    assert_eq!(cfg.session.target_mode, TargetMode::Head);
    assert_eq!(cfg.detector.target_class, 41);
    assert_eq!(
        cfg.detector.model_path.as_deref(),
        Some(std::path::Path::new("/models/cup.onnx"))
    );

    clear_env();
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new().suffix(".toml").tempfile().expect("temp config");
    let toml = r#"
db_path = "toml.db"

[camera]
url = "stub://toml"

[loop]
sticky_frames = 3
"#;
    file.write_all(toml.as_bytes()).expect("write config");

    let cfg = CoachdConfig::load_from(Some(file.path())).expect("load config");
    assert_eq!(cfg.db_path, "toml.db");
    assert_eq!(cfg.camera.url, "stub://toml");
    assert_eq!(cfg.sticky_frames, 3);
    assert_eq!(cfg.target_hz, 20);

    clear_env();
}

#[test]
fn legacy_env_names_apply_but_new_names_win() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("DEX_DOMINANT", "l");
    std::env::set_var("DEX_TARGET_MODE", "head");
    let cfg = CoachdConfig::load().expect("load config");
    assert_eq!(cfg.session.dominant_hand, HandSide::Left);
    assert_eq!(cfg.session.target_mode, TargetMode::Head);

    std::env::set_var("COACH_DOMINANT", "right");
    let cfg = CoachdConfig::load().expect("load config");
    assert_eq!(cfg.session.dominant_hand, HandSide::Right);

    clear_env();
}

#[test]
fn invalid_env_values_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("COACH_TARGET_HZ", "fast");
    assert!(CoachdConfig::load().is_err());
    clear_env();

    std::env::set_var("COACH_STICKY_FRAMES", "1000");
    assert!(CoachdConfig::load().is_err());
    clear_env();

    std::env::set_var("COACH_SESSION_ID", "bad/id");
    assert!(CoachdConfig::load().is_err());
    clear_env();

    std::env::set_var("COACH_TARGET_MODE", "sideways");
    assert!(CoachdConfig::load().is_err());
    clear_env();
}

#[test]
fn missing_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    std::env::set_var("COACH_CONFIG", "/nonexistent/coach.json");
    let err = CoachdConfig::load().unwrap_err();
    assert!(err.to_string().contains("failed to read config file"));
    clear_env();
}
