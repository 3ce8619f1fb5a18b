// SPDX-License-Identifier: MPL-2.0

//! Processing pipelines
//!
//! ```text
//! ┌──────────────┐     ┌───────────────────┐     ┌──────────────┐
//! │ V4L2 Frame   │ ──▶ │  Codec Pipeline   │ ──▶ │  Image File  │
//! │ (FrameLease) │     │  - input port     │     │ jpg/png/gif/ │
//! │              │     │  - output port    │     │ tga/bmp      │
//! └──────────────┘     └───────────────────┘     └──────────────┘
//! ```
//!
//! - [`photo`]: Single-frame capture and encoding

pub mod photo;
