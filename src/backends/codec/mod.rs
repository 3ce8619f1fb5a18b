// SPDX-License-Identifier: GPL-3.0-only

//! Queue-driven image encoder
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────┐
//! │       CodecPipeline        │  ← feed / drain loop (pipelines::photo)
//! └──────┬──────────────┬──────┘
//!        │              │
//!        ▼              ▼
//! ┌────────────┐  ┌────────────┐
//! │ input port │  │ output port│  ← pool + completion queue each
//! └──────┬─────┘  └─────┬──────┘
//!        │  send_buffer │  ▲ on_buffer_returned
//!        ▼              ▼  │
//! ┌────────────────────────────┐
//! │   CodecComponent trait     │  ← accelerator or software encoder
//! └────────────────────────────┘
//! ```
//!
//! Both ports signal one shared [`port::Semaphore`] for every returned
//! buffer, so the pipeline sleeps on a single primitive.

pub mod format_converters;
pub mod port;
pub mod runtime;
pub mod software;
pub mod types;

pub use port::{CodecPort, PoolStats, Semaphore};
pub use runtime::{
    CodecComponent, CompletionSink, ControlSink, HardwareRuntime, Rejected, ensure_initialized,
    is_initialized,
};
pub use software::SoftwareRuntime;
pub use types::{
    BufferFlags, CodecBuffer, CodecStatus, ControlEvent, FormatChange, ImageCodec, PortDirection,
    PortEvent, PortFormat, PortRequirements, encodings,
};
