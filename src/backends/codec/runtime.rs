// SPDX-License-Identifier: GPL-3.0-only

//! Hardware runtime seam
//!
//! A [`CodecComponent`] is an encoder that runs in its own execution
//! context. Buffers handed to it with `send_buffer` come back later through
//! the [`CompletionSink`] registered on the port, and asynchronous status
//! arrives through the [`ControlSink`]. Sink callbacks run on the
//! component's context and must only enqueue and signal.

use super::types::{
    CodecBuffer, CodecStatus, ControlEvent, PortDirection, PortFormat, PortRequirements,
};
use crate::errors::CodecResult;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// Receives buffers a component has finished with
pub trait CompletionSink: Send + Sync {
    fn on_buffer_returned(&self, buffer: CodecBuffer);
}

/// Receives control-channel events (errors, end of stream)
pub trait ControlSink: Send + Sync {
    fn on_control_event(&self, event: ControlEvent);
}

/// A buffer submission the component refused
#[derive(Debug)]
pub struct Rejected {
    pub status: CodecStatus,
    /// The refused buffer, when the component could hand it back
    pub buffer: Option<CodecBuffer>,
}

/// An encoder component with one input and one output port
pub trait CodecComponent: Send {
    fn name(&self) -> &str;

    /// Register the control-channel sink
    fn enable_control(&mut self, sink: Arc<dyn ControlSink>) -> CodecResult<()>;

    /// Apply a port format, returns the buffer requirements that follow from it
    fn commit_format(
        &mut self,
        direction: PortDirection,
        format: &PortFormat,
    ) -> CodecResult<PortRequirements>;

    /// Allocate `count` port buffers of `size` bytes
    fn create_pool(
        &mut self,
        direction: PortDirection,
        count: u32,
        size: usize,
    ) -> CodecResult<Vec<CodecBuffer>>;

    /// Free a port pool created by `create_pool`
    fn release_pool(&mut self, direction: PortDirection, buffers: Vec<CodecBuffer>);

    /// Enable a port; returned buffers go to `sink`
    fn enable_port(
        &mut self,
        direction: PortDirection,
        sink: Arc<dyn CompletionSink>,
    ) -> CodecResult<()>;

    /// Disable a port; every buffer it holds is returned through its sink
    fn disable_port(&mut self, direction: PortDirection) -> CodecResult<()>;

    /// Hand one buffer to the component
    fn send_buffer(&mut self, direction: PortDirection, buffer: CodecBuffer)
    -> Result<(), Rejected>;

    /// Start processing
    fn enable(&mut self) -> CodecResult<()>;

    /// Stop processing
    fn disable(&mut self) -> CodecResult<()>;
}

/// Process-wide entry point of an accelerator
pub trait HardwareRuntime: Send + Sync {
    fn name(&self) -> &str;

    /// One-time setup of the accelerator
    fn initialize(&self) -> CodecResult<()>;

    fn create_image_encoder(&self) -> CodecResult<Box<dyn CodecComponent>>;
}

static RUNTIME_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize the accelerator once per process
///
/// Concurrent first calls may both run `initialize`; runtimes must tolerate
/// that. A failed initialization leaves the flag unset so a later call retries.
pub fn ensure_initialized(runtime: &dyn HardwareRuntime) -> CodecResult<()> {
    if is_initialized() {
        return Ok(());
    }

    runtime.initialize()?;
    RUNTIME_INITIALIZED.store(true, Ordering::Release);
    info!(runtime = runtime.name(), "Codec runtime initialized");
    Ok(())
}

/// Whether a runtime finished initializing in this process
pub fn is_initialized() -> bool {
    RUNTIME_INITIALIZED.load(Ordering::Acquire)
}
