// SPDX-License-Identifier: MPL-2.0

//! stillcap - grab one frame from a V4L2 device and encode it to an image
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`backends`]: V4L2 capture device, buffer pools and encoder ports
//! - [`pipelines`]: The encode loop and the still-capture flow
//! - [`config`]: User configuration handling
//! - [`storage`]: Output file naming and writing
//!
//! # Example
//!
//! ```ignore
//! use stillcap::backends::camera::{CaptureDevice, CaptureOptions};
//! use stillcap::backends::codec::{ImageCodec, SoftwareRuntime};
//! use stillcap::pipelines::photo::{CodecPipeline, PipelineOptions, capture_still, encoder_input_format};
//!
//! let mut device = CaptureDevice::open("/dev/video0", CaptureOptions::default())?;
//! let mut pipeline = CodecPipeline::open(
//!     &SoftwareRuntime::default(),
//!     encoder_input_format(device.format()),
//!     ImageCodec::Png,
//!     PipelineOptions::default(),
//! )?;
//! let encoded = capture_still(&mut device, &mut pipeline, 64)?;
//! std::fs::write("frame.png", &encoded.data)?;
//! ```

pub mod backends;
pub mod config;
pub mod constants;
pub mod errors;
pub mod pipelines;
pub mod storage;

// Re-export commonly used types
pub use config::Config;
pub use errors::{AppError, AppResult};
