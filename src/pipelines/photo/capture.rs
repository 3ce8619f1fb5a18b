// SPDX-License-Identifier: MPL-2.0

//! Still capture: one frame from the device through the encoder

use super::encoding::{CodecPipeline, EncodedOutput};
use crate::backends::camera::{CaptureDevice, CaptureFormat};
use crate::backends::codec::types::PortFormat;
use crate::errors::{AppResult, CaptureError};
use tracing::{debug, info, warn};

/// Encoder input format matching a capture format
pub fn encoder_input_format(format: &CaptureFormat) -> PortFormat {
    PortFormat::new(format.fourcc, format.width, format.height).with_stride(format.bytes_per_line)
}

/// Capture one frame and encode it
///
/// Streaming is started and stopped here unless the device is already
/// streaming. Empty frames ("try again" from the driver) are retried up to
/// `max_retries` times. The frame buffer goes back to the driver as soon as
/// the encoder has consumed it.
pub fn capture_still(
    device: &mut CaptureDevice,
    pipeline: &mut CodecPipeline,
    max_retries: u32,
) -> AppResult<EncodedOutput> {
    let started_here = !device.is_streaming();
    if started_here {
        device.start_streaming()?;
    }

    let result = grab_and_encode(device, pipeline, max_retries);

    if started_here {
        let stopped = device.stop_streaming();
        if let (Err(e), true) = (&stopped, result.is_err()) {
            warn!(error = %e, "Stopping the stream failed after an earlier error");
        } else {
            stopped?;
        }
    }

    result
}

fn grab_and_encode(
    device: &mut CaptureDevice,
    pipeline: &mut CodecPipeline,
    max_retries: u32,
) -> AppResult<EncodedOutput> {
    for attempt in 0..=max_retries {
        let lease = device.acquire_frame()?;
        if lease.is_empty() {
            debug!(attempt, "Empty frame, retrying");
            lease.finish()?;
            continue;
        }

        info!(
            bytes = lease.len(),
            index = ?lease.index().map(|i| i.get()),
            sequence = ?lease.sequence(),
            "Captured frame"
        );

        let encoded = pipeline.encode(lease.data());
        lease.finish()?;
        return Ok(encoded?);
    }

    Err(CaptureError::NoFrame(max_retries + 1).into())
}
