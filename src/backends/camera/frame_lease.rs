// SPDX-License-Identifier: GPL-3.0-only

//! Scope-bound view over one captured buffer

use super::CaptureDevice;
use super::buffer_pool::BufferIndex;
use crate::errors::CaptureResult;
use tracing::error;

/// A filled capture buffer on loan from a [`CaptureDevice`]
///
/// The lease mutably borrows the device, so at most one lease exists at a
/// time and the device cannot stop streaming while it is alive. Dropping a
/// lease that carries an index hands the buffer back to the driver exactly
/// once. An empty lease (no index, zero length) means "nothing this time"
/// and releases nothing.
pub struct FrameLease<'a> {
    device: &'a mut CaptureDevice,
    index: Option<BufferIndex>,
    len: usize,
    sequence: Option<u32>,
    released: bool,
}

impl<'a> FrameLease<'a> {
    pub(super) fn new(
        device: &'a mut CaptureDevice,
        index: Option<BufferIndex>,
        len: usize,
        sequence: Option<u32>,
    ) -> Self {
        Self {
            device,
            index,
            len,
            sequence,
            released: false,
        }
    }

    /// Captured bytes
    pub fn data(&self) -> &[u8] {
        let frame = self.device.frame_data(self.index);
        &frame[..self.len.min(frame.len())]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pool index of the buffer, absent for the read strategy and empty leases
    pub fn index(&self) -> Option<BufferIndex> {
        self.index
    }

    /// Driver frame counter, absent for the read strategy and empty leases
    ///
    /// Gaps between consecutive leases mean the driver dropped frames.
    pub fn sequence(&self) -> Option<u32> {
        self.sequence
    }

    /// Return the buffer now and report a failure instead of logging it
    pub fn finish(mut self) -> CaptureResult<()> {
        self.released = true;
        self.device.release_frame(self.index)
    }
}

impl Drop for FrameLease<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Err(e) = self.device.release_frame(self.index) {
            error!(
                error = %e,
                index = ?self.index.map(BufferIndex::get),
                "Failed to return capture buffer"
            );
        }
    }
}
