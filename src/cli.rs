// SPDX-License-Identifier: GPL-3.0-only

//! Still capture command

use chrono::Local;
use std::path::{Path, PathBuf};
use stillcap::backends::camera::CaptureDevice;
use stillcap::backends::codec::{ImageCodec, SoftwareRuntime};
use stillcap::errors::{AppResult, CodecError};
use stillcap::pipelines::photo::{CodecPipeline, capture_still, encoder_input_format};
use stillcap::{Config, storage};
use tracing::{info, warn};

/// Capture one frame from `device` and write it to `output`
pub fn capture_to_file(device: &str, output: Option<&Path>, config: &Config) -> AppResult<PathBuf> {
    let path = storage::resolve_output_path(output, &Local::now());
    let codec = ImageCodec::from_path(&path)?;
    info!(path = %path.display(), codec = %codec, "Output selected");

    let mut capture = CaptureDevice::open(device, config.capture_options())?;

    let runtime = SoftwareRuntime::new(config.jpeg_quality, config.renegotiate_chunk_limit);
    let mut pipeline = CodecPipeline::open(
        &runtime,
        encoder_input_format(capture.format()),
        codec,
        config.pipeline_options(),
    )?;

    let encoded = capture_still(&mut capture, &mut pipeline, config.max_frame_retries)?;
    pipeline.close()?;
    capture.close()?;

    if let Some(status) = encoded.error {
        if encoded.data.is_empty() {
            return Err(CodecError::Status(status).into());
        }
        warn!(%status, bytes = encoded.data.len(), "Writing partial image after encoder error");
    }

    storage::write_output(&path, &encoded.data)?;
    info!(path = %path.display(), bytes = encoded.data.len(), "Image saved");
    Ok(path)
}
