// SPDX-License-Identifier: MPL-2.0

//! Error types for capture and encoding
//!
//! Every variant here is fatal for a single run. The only recoverable
//! conditions ("try again" from the driver, a spurious completion-wait
//! timeout) are absorbed where they happen and never reach these types.

use crate::backends::codec::types::{CodecStatus, PortDirection};
use std::fmt;
use std::time::Duration;

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for capture-side operations
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Result type alias for codec-side operations
pub type CodecResult<T> = Result<T, CodecError>;

/// Main application error type
#[derive(Debug, Clone)]
pub enum AppError {
    /// Capture device errors
    Capture(CaptureError),
    /// Encoder errors
    Codec(CodecError),
    /// Output path cannot be mapped to an encoder
    InvalidOutput(String),
    /// Configuration errors
    Config(String),
    /// Storage/filesystem errors
    Storage(String),
    /// Generic error with message
    Other(String),
}

/// Capture-specific errors
#[derive(Debug, Clone)]
pub enum CaptureError {
    /// Device path does not exist or cannot be inspected
    NotFound { path: String, message: String },
    /// Path exists but is not a character device
    NotCharDevice(String),
    /// Device did not answer the capability query
    NotV4l2Device(String),
    /// Device cannot capture video
    NotCaptureDevice(String),
    /// Device lacks read()/write() i/o
    ReadNotSupported(String),
    /// Device lacks streaming i/o
    StreamingNotSupported(String),
    /// Driver refused the requested buffer memory type
    StrategyNotSupported { path: String, strategy: &'static str },
    /// Driver granted fewer buffers than streaming needs
    InsufficientBuffers { path: String, granted: u32 },
    /// Buffer memory could not be allocated
    OutOfMemory(usize),
    /// No frame became ready within the timeout
    Timeout(Duration),
    /// Every attempt produced an empty frame
    NoFrame(u32),
    /// A system call or ioctl failed
    Io { op: &'static str, message: String },
    /// Driver handed back a buffer the pool does not know
    UnknownBuffer { index: u32 },
    /// Operation is not valid in the current device state
    InvalidState(&'static str),
    /// Buffer was returned to the device while already device-owned
    DoubleRelease(u32),
    /// Pool released while a buffer is still owned by the device
    BufferInFlight(u32),
}

/// Encoder-specific errors
#[derive(Debug, Clone)]
pub enum CodecError {
    /// Encoder component could not be created
    ComponentCreate(String),
    /// Port format not supported by the component
    FormatNotSupported(String),
    /// Port rejected a configuration or enable/disable request
    PortRejected { direction: PortDirection, status: CodecStatus },
    /// Hardware rejected a buffer submission
    SubmitRejected { direction: PortDirection, status: CodecStatus },
    /// Output format renegotiation could not complete
    Renegotiation(String),
    /// In-flight buffers did not come back in time
    DrainTimeout { direction: PortDirection, outstanding: usize },
    /// Unrecoverable status reported by the component
    Status(CodecStatus),
    /// Component execution context has gone away
    Disconnected(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Capture(e) => write!(f, "Capture error: {}", e),
            AppError::Codec(e) => write!(f, "Encoder error: {}", e),
            AppError::InvalidOutput(msg) => write!(f, "Invalid output: {}", msg),
            AppError::Config(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Storage(msg) => write!(f, "Storage error: {}", msg),
            AppError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::NotFound { path, message } => {
                write!(f, "Cannot identify '{}': {}", path, message)
            }
            CaptureError::NotCharDevice(path) => write!(f, "{} is no device", path),
            CaptureError::NotV4l2Device(path) => write!(f, "{} is no V4L2 device", path),
            CaptureError::NotCaptureDevice(path) => {
                write!(f, "{} is no video capture device", path)
            }
            CaptureError::ReadNotSupported(path) => write!(f, "{} does not support read i/o", path),
            CaptureError::StreamingNotSupported(path) => {
                write!(f, "{} does not support streaming i/o", path)
            }
            CaptureError::StrategyNotSupported { path, strategy } => {
                write!(f, "{} does not support {}", path, strategy)
            }
            CaptureError::InsufficientBuffers { path, granted } => {
                write!(f, "Insufficient buffer memory on {} ({} granted)", path, granted)
            }
            CaptureError::OutOfMemory(size) => write!(f, "Out of memory allocating {} bytes", size),
            CaptureError::Timeout(timeout) => {
                write!(f, "No frame ready after {} ms", timeout.as_millis())
            }
            CaptureError::NoFrame(attempts) => {
                write!(f, "No frame captured after {} attempts", attempts)
            }
            CaptureError::Io { op, message } => write!(f, "{} failed: {}", op, message),
            CaptureError::UnknownBuffer { index } => {
                write!(f, "Driver returned unknown buffer (index {})", index)
            }
            CaptureError::InvalidState(msg) => write!(f, "Invalid device state: {}", msg),
            CaptureError::DoubleRelease(index) => {
                write!(f, "Buffer {} is already owned by the device", index)
            }
            CaptureError::BufferInFlight(index) => {
                write!(f, "Buffer {} is still owned by the device", index)
            }
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::ComponentCreate(msg) => write!(f, "Failed to create component: {}", msg),
            CodecError::FormatNotSupported(msg) => write!(f, "Format not supported: {}", msg),
            CodecError::PortRejected { direction, status } => {
                write!(f, "{} port rejected request: {}", direction, status)
            }
            CodecError::SubmitRejected { direction, status } => {
                write!(f, "{} port rejected buffer: {}", direction, status)
            }
            CodecError::Renegotiation(msg) => write!(f, "Format renegotiation failed: {}", msg),
            CodecError::DrainTimeout {
                direction,
                outstanding,
            } => write!(
                f,
                "{} port still holds {} buffers after drain timeout",
                direction, outstanding
            ),
            CodecError::Status(status) => write!(f, "Component error: {}", status),
            CodecError::Disconnected(msg) => write!(f, "Component disconnected: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}
impl std::error::Error for CaptureError {}
impl std::error::Error for CodecError {}

impl CaptureError {
    /// Wrap an OS error from the named operation
    pub fn io(op: &'static str, err: std::io::Error) -> Self {
        CaptureError::Io {
            op,
            message: err.to_string(),
        }
    }
}

// Conversions from sub-errors to AppError
impl From<CaptureError> for AppError {
    fn from(err: CaptureError) -> Self {
        AppError::Capture(err)
    }
}

impl From<CodecError> for AppError {
    fn from(err: CodecError) -> Self {
        AppError::Codec(err)
    }
}

impl From<String> for AppError {
    fn from(msg: String) -> Self {
        AppError::Other(msg)
    }
}

impl From<&str> for AppError {
    fn from(msg: &str) -> Self {
        AppError::Other(msg.to_string())
    }
}

// Conversions for I/O errors
impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Storage(err.to_string())
    }
}
