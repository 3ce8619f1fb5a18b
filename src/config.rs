// SPDX-License-Identifier: GPL-3.0-only

//! Persistent settings
//!
//! Read from `config.json` under the user config directory. Every field has
//! a default so partial files are fine.

use crate::backends::camera::{CaptureOptions, FormatRequest, IoMethod};
use crate::constants::{
    CAPTURE_TIMEOUT, CONFIG_DIR_NAME, DEFAULT_JPEG_QUALITY, ENCODE_WAIT_TIMEOUT,
    INPUT_HEADER_MARGIN, MAX_FRAME_RETRIES, OUTPUT_FALLBACK_BUFFERS, RENEGOTIATE_CHUNK_LIMIT,
};
use crate::errors::{AppError, AppResult};
use crate::pipelines::photo::PipelineOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use v4l::FourCC;

/// Capture format to request from the device
#[derive(Debug, Clone, Eq, PartialEq, Default, Serialize, Deserialize)]
pub struct FormatSettings {
    /// Resolution width
    pub width: u32,
    /// Resolution height
    pub height: u32,
    /// Pixel format (e.g., "YUYV", "UYVY", "GREY")
    pub pixel_format: String,
}

impl FormatSettings {
    /// Convert to a driver request; `None` if the pixel format is not a FourCC
    pub fn to_request(&self) -> Option<FormatRequest> {
        let bytes: [u8; 4] = self.pixel_format.as_bytes().try_into().ok()?;
        Some(FormatRequest {
            fourcc: FourCC::new(&bytes),
            width: self.width,
            height: self.height,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Buffer strategy used against the device
    pub io_method: IoMethod,
    /// Format requested at open; the device's current format when absent
    pub format: Option<FormatSettings>,
    /// Readiness wait for one frame
    pub capture_timeout_ms: u64,
    /// Single wait on encoder completions
    pub encode_wait_timeout_ms: u64,
    /// JPEG quality (1-100)
    pub jpeg_quality: u8,
    /// Empty frames tolerated before giving up
    pub max_frame_retries: u32,
    /// Output buffers after a format change
    pub output_fallback_buffers: u32,
    /// Unused bytes per encoder input buffer
    pub input_header_margin: usize,
    /// Output buffers a frame may span before the software encoder asks for
    /// larger ones
    pub renegotiate_chunk_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            io_method: IoMethod::default(),
            format: None,
            capture_timeout_ms: CAPTURE_TIMEOUT.as_millis() as u64,
            encode_wait_timeout_ms: ENCODE_WAIT_TIMEOUT.as_millis() as u64,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            max_frame_retries: MAX_FRAME_RETRIES,
            output_fallback_buffers: OUTPUT_FALLBACK_BUFFERS,
            input_header_margin: INPUT_HEADER_MARGIN,
            renegotiate_chunk_limit: RENEGOTIATE_CHUNK_LIMIT,
        }
    }
}

impl Config {
    /// `~/.config/stillcap/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join("config.json"))
    }

    /// Load from an explicit file; any read or parse failure is an error
    pub fn load_from(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Load from the default location, falling back to defaults
    pub fn load() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }

        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable configuration");
                Self::default()
            }
        }
    }

    pub fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            io_method: self.io_method,
            format: self.format.as_ref().and_then(|f| {
                let request = f.to_request();
                if request.is_none() {
                    warn!(pixel_format = %f.pixel_format, "Ignoring invalid pixel format");
                }
                request
            }),
            timeout: Duration::from_millis(self.capture_timeout_ms),
        }
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            wait_timeout: Duration::from_millis(self.encode_wait_timeout_ms),
            input_header_margin: self.input_header_margin,
            output_fallback_buffers: self.output_fallback_buffers,
        }
    }
}
