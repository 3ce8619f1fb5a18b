// SPDX-License-Identifier: MPL-2.0

//! Hardware backends
//!
//! - [`camera`]: V4L2 capture device, buffer pools and frame leases
//! - [`codec`]: encoder ports, the hardware runtime seam and the software
//!   accelerator

pub mod camera;
pub mod codec;
