// SPDX-License-Identifier: MPL-2.0

//! Still photo pipeline
//!
//! ```text
//! CaptureDevice → FrameLease → CodecPipeline::encode → EncodedOutput
//! ```

pub mod capture;
pub mod encoding;

pub use capture::{capture_still, encoder_input_format};
pub use encoding::{CodecPipeline, EncodedOutput, PipelineOptions};
