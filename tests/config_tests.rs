// SPDX-License-Identifier: MPL-2.0

//! Integration tests for configuration module

mod common;

use std::time::Duration;
use stillcap::Config;
use stillcap::backends::camera::IoMethod;
use stillcap::config::FormatSettings;
use stillcap::constants::{CAPTURE_TIMEOUT, DEFAULT_JPEG_QUALITY, INPUT_HEADER_MARGIN};
use v4l::FourCC;

#[test]
fn test_config_default() {
    let config = Config::default();

    assert_eq!(config.io_method, IoMethod::Mmap, "mmap should be the default i/o");
    assert!(config.format.is_none());
    assert_eq!(config.jpeg_quality, DEFAULT_JPEG_QUALITY);

    let capture = config.capture_options();
    assert_eq!(capture.timeout, CAPTURE_TIMEOUT);
    let pipeline = config.pipeline_options();
    assert_eq!(pipeline.input_header_margin, INPUT_HEADER_MARGIN);
}

#[test]
fn test_partial_file_keeps_other_defaults() {
    let dir = common::scratch_dir();
    let path = dir.join("config.json");
    std::fs::write(
        &path,
        r#"{ "io_method": "userptr", "capture_timeout_ms": 500 }"#,
    )
    .unwrap();

    let config = Config::load_from(&path).unwrap();
    assert_eq!(config.io_method, IoMethod::UserPtr);
    assert_eq!(
        config.capture_options().timeout,
        Duration::from_millis(500)
    );
    assert_eq!(config.max_frame_retries, Config::default().max_frame_retries);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_malformed_file_is_an_error() {
    let dir = common::scratch_dir();
    let path = dir.join("config.json");
    std::fs::write(&path, "{ not json").unwrap();

    assert!(matches!(
        Config::load_from(&path),
        Err(stillcap::AppError::Config(_))
    ));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_io_method_names() {
    for (name, method) in [
        ("\"read\"", IoMethod::Read),
        ("\"mmap\"", IoMethod::Mmap),
        ("\"userptr\"", IoMethod::UserPtr),
    ] {
        let parsed: IoMethod = serde_json::from_str(name).unwrap();
        assert_eq!(parsed, method);
    }
}

#[test]
fn test_format_settings_to_request() {
    let settings = FormatSettings {
        width: 1280,
        height: 720,
        pixel_format: "UYVY".into(),
    };
    let request = settings.to_request().unwrap();
    assert_eq!(request.fourcc, FourCC::new(b"UYVY"));
    assert_eq!((request.width, request.height), (1280, 720));

    let invalid = FormatSettings {
        pixel_format: "YUV420".into(),
        ..settings
    };
    assert!(invalid.to_request().is_none());
}

#[test]
fn test_invalid_pixel_format_is_ignored_for_capture() {
    let config = Config {
        format: Some(FormatSettings {
            width: 640,
            height: 480,
            pixel_format: "bad".into(),
        }),
        ..Config::default()
    };
    assert!(config.capture_options().format.is_none());
}
