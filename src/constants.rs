// SPDX-License-Identifier: GPL-3.0-only

//! Application-wide constants

use std::time::Duration;

/// How long a capture waits for the device to become readable
pub const CAPTURE_TIMEOUT: Duration = Duration::from_secs(2);

/// Buffers requested from the driver for streaming strategies
pub const STREAMING_BUFFER_COUNT: u32 = 4;

/// Fewest buffers a streaming strategy can cycle with
pub const MIN_STREAMING_BUFFERS: u32 = 2;

/// The blocking-read strategy uses a single heap buffer
pub const READ_BUFFER_COUNT: u32 = 1;

/// Bytes per pixel assumed by the minimum stride check (packed 4:2:2)
pub const MIN_BYTES_PER_PIXEL: u32 = 2;

/// Timeout for a single wait on the codec completion semaphore
pub const ENCODE_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Bytes of every input buffer left unused when feeding the encoder
pub const INPUT_HEADER_MARGIN: usize = 128;

/// Output buffer count used after a format change, instead of the
/// component's recommendation
pub const OUTPUT_FALLBACK_BUFFERS: u32 = 2;

/// Default JPEG quality for the software encoder (0-100)
pub const DEFAULT_JPEG_QUALITY: u8 = 92;

/// Consecutive empty frames tolerated before capture gives up
pub const MAX_FRAME_RETRIES: u32 = 64;

/// Output buffers a payload may span before the software encoder asks
/// for larger ones
pub const RENEGOTIATE_CHUNK_LIMIT: usize = 16;

/// Software encoder buffer sizing
pub mod software {
    /// Input buffers recommended to the pipeline
    pub const INPUT_BUFFER_NUM: u32 = 3;
    /// Smallest input buffer the encoder accepts
    pub const INPUT_BUFFER_SIZE_MIN: usize = 4096;
    /// Input buffer size recommended to the pipeline
    pub const INPUT_BUFFER_SIZE: usize = 256 * 1024;
    /// Output buffers recommended to the pipeline
    pub const OUTPUT_BUFFER_NUM: u32 = 3;
    /// Smallest output buffer the encoder accepts
    pub const OUTPUT_BUFFER_SIZE_MIN: usize = 4096;
    /// Output buffer size recommended to the pipeline
    pub const OUTPUT_BUFFER_SIZE: usize = 64 * 1024;
    /// Largest output buffer size a format change will recommend
    pub const OUTPUT_BUFFER_SIZE_MAX: usize = 8 * 1024 * 1024;
}

/// Filename pattern for generated output names (chrono format string)
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Extension of generated output names
pub const DEFAULT_EXTENSION: &str = "jpg";

/// Directory under the user config dir holding `config.json`
pub const CONFIG_DIR_NAME: &str = "stillcap";
