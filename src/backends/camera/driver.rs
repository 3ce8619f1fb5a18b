// SPDX-License-Identifier: GPL-3.0-only

//! Capture driver abstraction
//!
//! [`CaptureDriver`] is the narrow set of V4L2 requests the capture device
//! needs. The real implementation lives in [`super::v4l2`]; tests provide
//! their own. Methods return `std::io::Result` so that errno semantics carry
//! through unchanged: `WouldBlock` is the driver's "try again", `EINVAL` from
//! a buffer request means the memory type is unsupported.

use std::fmt;
use std::io;
use std::time::Duration;
use v4l::FourCC;

/// Capability bits the capture device cares about
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name (V4L2 driver)
    pub driver: String,
    /// Name of the device (V4L2 card)
    pub card: String,
    /// Single-planar video capture
    pub video_capture: bool,
    /// read()/write() i/o
    pub read_write: bool,
    /// Streaming i/o (mmap / userptr)
    pub streaming: bool,
}

/// Negotiated capture format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub fourcc: FourCC,
    pub width: u32,
    pub height: u32,
    /// Bytes per line as reported (or corrected) for the driver
    pub bytes_per_line: u32,
    /// Bytes needed for one full frame
    pub size_image: u32,
}

impl CaptureFormat {
    /// Clamp stride and image size upward when a driver reports
    /// implausibly small values
    pub fn sanitized(mut self, min_bytes_per_pixel: u32) -> Self {
        let min_stride = self.width.saturating_mul(min_bytes_per_pixel);
        if self.bytes_per_line < min_stride {
            self.bytes_per_line = min_stride;
        }
        let min_size = self.bytes_per_line.saturating_mul(self.height);
        if self.size_image < min_size {
            self.size_image = min_size;
        }
        self
    }
}

impl fmt::Display for CaptureFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}x{} (stride {}, {} bytes)",
            self.fourcc, self.width, self.height, self.bytes_per_line, self.size_image
        )
    }
}

/// Format the caller would like the device to switch to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatRequest {
    pub fourcc: FourCC,
    pub width: u32,
    pub height: u32,
}

/// Buffer memory type for streaming i/o
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    /// Driver-allocated, mapped into the application
    Mmap,
    /// Application-allocated, registered with the driver
    UserPtr,
}

/// Buffer handed to the driver with `queue_buffer`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueRequest {
    pub index: u32,
    pub memory: MemoryType,
    /// Address and length of application memory (user pointer only)
    pub user_ptr: Option<(usize, usize)>,
}

/// Buffer returned by the driver from `dequeue_buffer`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    /// Bytes of valid data, may be less than the buffer length
    pub bytes_used: u32,
    /// Buffer length as seen by the driver
    pub length: u32,
    /// Address the driver wrote to (user pointer only)
    pub user_ptr: Option<usize>,
    /// Frame counter maintained by the driver
    pub sequence: u32,
}

/// Device-owned memory mapped into the application
///
/// Dropping the value unmaps it.
pub trait MappedMemory: Send {
    fn as_slice(&self) -> &[u8];

    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// V4L2-style capture driver
pub trait CaptureDriver: Send {
    /// Query device capabilities (VIDIOC_QUERYCAP)
    fn capabilities(&self) -> io::Result<DeviceCapabilities>;

    /// Current capture format (VIDIOC_G_FMT)
    fn format(&self) -> io::Result<CaptureFormat>;

    /// Request a new capture format (VIDIOC_S_FMT), returns what the driver chose
    fn set_format(&mut self, request: &FormatRequest) -> io::Result<CaptureFormat>;

    /// Request `count` buffers of the given memory type (VIDIOC_REQBUFS)
    ///
    /// Returns the number the driver granted. A count of zero frees the
    /// driver side of a previous request.
    fn request_buffers(&mut self, memory: MemoryType, count: u32) -> io::Result<u32>;

    /// Query and map a driver-allocated buffer (VIDIOC_QUERYBUF + mmap)
    fn map_buffer(&mut self, index: u32) -> io::Result<Box<dyn MappedMemory>>;

    /// Hand a buffer to the driver (VIDIOC_QBUF)
    fn queue_buffer(&mut self, request: QueueRequest) -> io::Result<()>;

    /// Take a filled buffer back from the driver (VIDIOC_DQBUF)
    fn dequeue_buffer(&mut self, memory: MemoryType) -> io::Result<DequeuedBuffer>;

    /// VIDIOC_STREAMON
    fn stream_on(&mut self) -> io::Result<()>;

    /// VIDIOC_STREAMOFF
    fn stream_off(&mut self) -> io::Result<()>;

    /// Blocking-read a frame into `buf`, returns bytes read
    fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Wait until the device is readable, returns false on timeout
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool>;
}
