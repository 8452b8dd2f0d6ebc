//! Configuration loading tests

use ballbot_eye::config::{BotConfig, Side};
use ballbot_eye::error::BotError;
use std::io::Write;

fn write_config(text: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

#[test]
fn test_defaults_are_valid() {
    let config = BotConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.fusion.heavy_ttl_frames(), 12);
    assert_eq!(config.calibration.window, 150);
    assert_eq!(config.calibration.target_consistent, 100);
    assert_eq!(config.dispatch.min_interval_ms, 100);
    assert_eq!(config.dispatch.same_command_interval_ms, 200);
}

#[test]
fn test_partial_file_keeps_defaults() {
    let file = write_config(
        r#"
[stream]
url = "http://10.0.0.5:81/stream"

[control]
approach_speed = 140
default_search_side = "left"
invert_turns = false
dribble_speed = 90

[color]
lower_hsv = [20, 80, 80]
"#,
    );

    let config = BotConfig::from_file(file.path()).unwrap();
    assert_eq!(config.stream.url, "http://10.0.0.5:81/stream");
    assert_eq!(config.control.approach_speed, 140);
    assert_eq!(config.control.default_search_side, Side::Left);
    assert!(!config.control.invert_turns);
    assert_eq!(config.control.dribble_speed, 90);
    assert_eq!(config.color.lower_hsv, [20, 80, 80]);
    // Untouched sections and keys
    assert_eq!(config.color.upper_hsv, [49, 255, 255]);
    assert_eq!(config.fusion.detection_interval, 6);
    assert!(config.validate().is_ok());
}

#[test]
fn test_malformed_toml_is_a_parse_error() {
    let file = write_config("[stream\nurl = ");
    match BotConfig::from_file(file.path()) {
        Err(BotError::ConfigParse(_)) => {}
        other => panic!("expected parse error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = BotConfig::from_file(dir.path().join("absent.toml"));
    assert!(matches!(result, Err(BotError::Io(_))));
}

#[test]
fn test_validation_rejects_inconsistent_values() {
    let mut config = BotConfig::default();
    config.fusion.detection_interval = 0;
    assert!(config.validate().is_err());

    let mut config = BotConfig::default();
    config.calibration.target_consistent = config.calibration.window + 1;
    assert!(config.validate().is_err());

    let mut config = BotConfig::default();
    config.color.upper_hsv[0] = 200;
    assert!(config.validate().is_err());
}

#[test]
fn test_empty_target_classes_still_validate() {
    // The heavy detector degrades to color-only tracking instead
    let mut config = BotConfig::default();
    config.detector.target_classes.clear();
    assert!(config.validate().is_ok());
}
