//! Tests for ConfigError display and conversions

use samguard_config::ConfigError;
use std::error::Error;
use std::path::PathBuf;

/// Test Io error display formatting
#[test]
fn test_io_error_display() {
    let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
    let err = ConfigError::Io(io_err);
    let msg = err.to_string();
    assert!(msg.starts_with("DATA LINK ERROR:"));
    assert!(msg.contains("access denied"));
}

/// Test Json error display formatting
#[test]
fn test_json_error_display() {
    let json_err = serde_json::from_str::<serde_json::Value>("{bad").unwrap_err();
    let err = ConfigError::Json(json_err);
    assert!(err.to_string().starts_with("DECRYPTION FAILED:"));
}

/// Test NotFound error display formatting
#[test]
fn test_not_found_display() {
    let err = ConfigError::NotFound(PathBuf::from("/vault/config.json"));
    assert_eq!(err.to_string(), "INTEL NOT FOUND: /vault/config.json");
}

/// Test From<std::io::Error> conversion
#[test]
fn test_from_io_error() {
    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
    let err: ConfigError = io_err.into();
    assert!(matches!(err, ConfigError::Io(_)));
}

/// Test From<serde_json::Error> conversion
#[test]
fn test_from_json_error() {
    let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
    let err: ConfigError = json_err.into();
    assert!(matches!(err, ConfigError::Json(_)));
}

/// Test errors expose a source where one exists
#[test]
fn test_error_source() {
    let io_err = std::io::Error::new(std::io::ErrorKind::Other, "disk failure");
    let err = ConfigError::Io(io_err);
    assert!(err.source().is_some());

    let err = ConfigError::NotFound(PathBuf::from("anything"));
    assert!(err.source().is_none());
}

/// Test the question-mark operator works through conversions
#[test]
fn test_question_mark_conversion() {
    fn parse(input: &str) -> Result<serde_json::Value, ConfigError> {
        let value = serde_json::from_str(input)?;
        Ok(value)
    }

    assert!(parse("{}").is_ok());
    assert!(matches!(parse("{broken"), Err(ConfigError::Json(_))));
}
