// SPDX-License-Identifier: GPL-3.0-only

//! Single-frame V4L2 capture
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │    CaptureDevice    │  ← Opened / Streaming state, readiness wait
//! └──────────┬──────────┘
//!            │ acquire_frame()
//!            ▼
//! ┌─────────────────────┐
//! │     FrameLease      │  ← borrowed view, one release on drop
//! └──────────┬──────────┘
//!            │
//!            ▼
//! ┌─────────────────────┐
//! │  BufferPool trait   │  ← heap / mmap / userptr ownership cycling
//! └──────────┬──────────┘
//!            │
//!            ▼
//! ┌─────────────────────┐
//! │ CaptureDriver trait │  ← V4L2 requests (real driver or test stub)
//! └─────────────────────┘
//! ```

pub mod buffer_pool;
pub mod driver;
pub mod frame_lease;
pub mod v4l2;

pub use buffer_pool::{Acquired, BufferIndex, BufferOwner, BufferPool, IoMethod};
pub use driver::{CaptureDriver, CaptureFormat, DeviceCapabilities, FormatRequest};
pub use frame_lease::FrameLease;

use crate::constants::{
    CAPTURE_TIMEOUT, MIN_BYTES_PER_PIXEL, READ_BUFFER_COUNT, STREAMING_BUFFER_COUNT,
};
use crate::errors::{CaptureError, CaptureResult};
use std::os::unix::fs::FileTypeExt;
use std::time::Duration;
use tracing::{debug, info, warn};
use self::v4l2::V4l2Driver;

/// How a capture device is opened
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub io_method: IoMethod,
    /// Format to request; the device's current format is used when absent
    pub format: Option<FormatRequest>,
    /// Readiness wait used by [`CaptureDevice::acquire_frame`]
    pub timeout: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            io_method: IoMethod::default(),
            format: None,
            timeout: CAPTURE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceState {
    Opened,
    Streaming,
}

/// An opened capture device with its buffer pool
///
/// Lifecycle: `open` → `start_streaming` → `acquire_frame`… →
/// `stop_streaming` → `close`. Dropping the device runs the same teardown
/// as `close` and logs instead of returning errors.
pub struct CaptureDevice {
    path: String,
    // Declared before `pool`: the handle closes before user-pointer memory
    // registered with it is freed
    driver: Box<dyn CaptureDriver>,
    pool: Box<dyn BufferPool>,
    capabilities: DeviceCapabilities,
    format: CaptureFormat,
    timeout: Duration,
    state: DeviceState,
    closed: bool,
}

impl CaptureDevice {
    /// Open a V4L2 device node
    pub fn open(path: &str, options: CaptureOptions) -> CaptureResult<Self> {
        check_char_device(path)?;
        let driver = V4l2Driver::open(path).map_err(|e| CaptureError::NotFound {
            path: path.to_string(),
            message: e.to_string(),
        })?;
        Self::with_driver(path, Box::new(driver), options)
    }

    /// Open a device through an arbitrary driver implementation
    pub fn with_driver(
        path: &str,
        mut driver: Box<dyn CaptureDriver>,
        options: CaptureOptions,
    ) -> CaptureResult<Self> {
        let capabilities = driver.capabilities().map_err(|e| {
            if e.raw_os_error() == Some(libc::EINVAL) {
                CaptureError::NotV4l2Device(path.to_string())
            } else {
                CaptureError::io("VIDIOC_QUERYCAP", e)
            }
        })?;

        if !capabilities.video_capture {
            return Err(CaptureError::NotCaptureDevice(path.to_string()));
        }
        let io_method = options.io_method;
        if io_method.is_streaming() {
            if !capabilities.streaming {
                return Err(CaptureError::StreamingNotSupported(path.to_string()));
            }
        } else if !capabilities.read_write {
            return Err(CaptureError::ReadNotSupported(path.to_string()));
        }

        if let Some(request) = options.format {
            let chosen = driver
                .set_format(&request)
                .map_err(|e| CaptureError::io("VIDIOC_S_FMT", e))?;
            if chosen.fourcc != request.fourcc {
                warn!(
                    requested = %request.fourcc,
                    chosen = %chosen.fourcc,
                    "Driver substituted the requested pixel format"
                );
            }
        }

        let reported = driver
            .format()
            .map_err(|e| CaptureError::io("VIDIOC_G_FMT", e))?;
        let format = reported.sanitized(MIN_BYTES_PER_PIXEL);
        if format != reported {
            debug!(reported = %reported, corrected = %format, "Corrected driver format");
        }

        info!(
            device = path,
            driver = %capabilities.driver,
            card = %capabilities.card,
            format = %format,
            io_method = %io_method,
            "Opened capture device"
        );

        let count = if io_method.is_streaming() {
            STREAMING_BUFFER_COUNT
        } else {
            READ_BUFFER_COUNT
        };
        let pool = buffer_pool::allocate_pool(
            driver.as_mut(),
            path,
            io_method,
            count,
            format.size_image as usize,
        )?;

        Ok(Self {
            path: path.to_string(),
            pool,
            driver,
            capabilities,
            format,
            timeout: options.timeout,
            state: DeviceState::Opened,
            closed: false,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn format(&self) -> &CaptureFormat {
        &self.format
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    pub fn io_method(&self) -> IoMethod {
        self.pool.strategy()
    }

    pub fn is_streaming(&self) -> bool {
        self.state == DeviceState::Streaming
    }

    /// Number of pool buffers
    pub fn buffer_count(&self) -> usize {
        self.pool.len()
    }

    /// Number of pool buffers currently owned by the driver
    pub fn device_owned_buffers(&self) -> usize {
        self.pool.device_owned()
    }

    /// Submit every buffer to the driver and start the stream
    pub fn start_streaming(&mut self) -> CaptureResult<()> {
        if self.closed {
            return Err(CaptureError::InvalidState("device is closed"));
        }
        if self.state == DeviceState::Streaming {
            return Err(CaptureError::InvalidState("already streaming"));
        }

        self.pool.submit_all(self.driver.as_mut())?;
        if self.pool.strategy().is_streaming() {
            self.driver
                .stream_on()
                .map_err(|e| CaptureError::io("VIDIOC_STREAMON", e))?;
        }

        self.state = DeviceState::Streaming;
        info!(device = %self.path, "Stream on");
        Ok(())
    }

    /// Stop the stream; buffers return to the application. No-op when idle.
    pub fn stop_streaming(&mut self) -> CaptureResult<()> {
        if self.state != DeviceState::Streaming {
            return Ok(());
        }

        if self.pool.strategy().is_streaming() {
            self.driver
                .stream_off()
                .map_err(|e| CaptureError::io("VIDIOC_STREAMOFF", e))?;
        }
        self.pool.reclaim_all();

        self.state = DeviceState::Opened;
        info!(device = %self.path, "Stream off");
        Ok(())
    }

    /// Wait for the next frame using the configured timeout
    pub fn acquire_frame(&mut self) -> CaptureResult<FrameLease<'_>> {
        self.acquire_frame_timeout(self.timeout)
    }

    /// Wait up to `timeout` for the next frame
    ///
    /// Timing out is an error. A driver "try again" yields an empty lease
    /// and the caller should acquire again.
    pub fn acquire_frame_timeout(&mut self, timeout: Duration) -> CaptureResult<FrameLease<'_>> {
        if self.state != DeviceState::Streaming {
            return Err(CaptureError::InvalidState("capture is not streaming"));
        }

        let ready = self
            .driver
            .wait_readable(timeout)
            .map_err(|e| CaptureError::io("poll", e))?;
        if !ready {
            return Err(CaptureError::Timeout(timeout));
        }

        match self.pool.acquire_one(self.driver.as_mut())? {
            Acquired::Retry => {
                debug!(device = %self.path, "Driver asked to try again");
                Ok(FrameLease::new(self, None, 0, None))
            }
            Acquired::Frame {
                index,
                bytes_used,
                sequence,
            } => {
                debug!(
                    device = %self.path,
                    index = ?index.map(BufferIndex::get),
                    bytes_used,
                    ?sequence,
                    "Acquired frame"
                );
                Ok(FrameLease::new(self, index, bytes_used, sequence))
            }
        }
    }

    /// Hand a leased buffer back to the driver
    pub(crate) fn release_frame(&mut self, index: Option<BufferIndex>) -> CaptureResult<()> {
        match index {
            Some(index) => self.pool.release_one(self.driver.as_mut(), index),
            None => Ok(()),
        }
    }

    pub(crate) fn frame_data(&self, index: Option<BufferIndex>) -> &[u8] {
        self.pool.frame(index)
    }

    /// Stop streaming if needed, free the pool and close the device
    pub fn close(mut self) -> CaptureResult<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> CaptureResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.stop_streaming()?;
        self.pool.release(self.driver.as_mut())?;
        info!(device = %self.path, "Closed capture device");
        Ok(())
    }
}

impl Drop for CaptureDevice {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(device = %self.path, error = %e, "Capture device teardown failed");
        }
    }
}

/// Reject paths that are missing or not character devices
fn check_char_device(path: &str) -> CaptureResult<()> {
    let metadata = std::fs::metadata(path).map_err(|e| CaptureError::NotFound {
        path: path.to_string(),
        message: e.to_string(),
    })?;
    if !metadata.file_type().is_char_device() {
        return Err(CaptureError::NotCharDevice(path.to_string()));
    }
    Ok(())
}
