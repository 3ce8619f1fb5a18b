// SPDX-License-Identifier: GPL-3.0-only

//! Queue-driven encode pipeline
//!
//! A [`CodecPipeline`] owns one encoder component with an input and an
//! output [`CodecPort`]. `encode` runs the feed/drain loop:
//!
//! 1. wait on the completion semaphore (a timeout is logged and retried)
//! 2. stop with partial output if the control channel latched an error
//! 3. refill returned input buffers from the remaining bytes, then send one
//!    end-of-stream buffer
//! 4. pop output buffers in arrival order, appending payload or handling
//!    format-changed events
//! 5. hand every empty output buffer back to the component
//!
//! until an output buffer carries end-of-stream.

use crate::backends::codec::port::{CodecPort, PoolStats, Semaphore};
use crate::backends::codec::runtime::{
    CodecComponent, ControlSink, HardwareRuntime, ensure_initialized,
};
use crate::backends::codec::types::{
    CodecStatus, ControlEvent, ImageCodec, PortDirection, PortEvent, PortFormat,
};
use crate::constants::{ENCODE_WAIT_TIMEOUT, INPUT_HEADER_MARGIN, OUTPUT_FALLBACK_BUFFERS};
use crate::errors::{CodecError, CodecResult};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Tuning of the encode loop
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Single wait on the completion semaphore, also bounds buffer drains
    pub wait_timeout: Duration,
    /// Bytes of each input buffer left unused
    pub input_header_margin: usize,
    /// Output buffer count after a format change
    pub output_fallback_buffers: u32,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            wait_timeout: ENCODE_WAIT_TIMEOUT,
            input_header_margin: INPUT_HEADER_MARGIN,
            output_fallback_buffers: OUTPUT_FALLBACK_BUFFERS,
        }
    }
}

/// Result of one `encode` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedOutput {
    /// Output payload in the order the component returned it
    pub data: Vec<u8>,
    /// Output end-of-stream was observed
    pub end_of_stream: bool,
    /// Latched control-channel error, if the encode stopped early
    pub error: Option<CodecStatus>,
}

impl EncodedOutput {
    pub fn is_complete(&self) -> bool {
        self.end_of_stream && self.error.is_none()
    }
}

/// Control sink that keeps the first reported error
struct StatusLatch {
    status: Mutex<Option<CodecStatus>>,
    semaphore: Arc<Semaphore>,
}

impl StatusLatch {
    fn new(semaphore: Arc<Semaphore>) -> Self {
        Self {
            status: Mutex::new(None),
            semaphore,
        }
    }

    fn status(&self) -> Option<CodecStatus> {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ControlSink for StatusLatch {
    fn on_control_event(&self, event: ControlEvent) {
        match event {
            ControlEvent::Error(status) => {
                {
                    let mut latched = self.status.lock().unwrap_or_else(PoisonError::into_inner);
                    if latched.is_none() {
                        *latched = Some(status);
                    }
                }
                self.semaphore.post();
            }
            ControlEvent::Eos => debug!("Control channel end of stream"),
        }
    }
}

/// Encoder component with its two ports
pub struct CodecPipeline {
    input: CodecPort,
    output: CodecPort,
    component: Box<dyn CodecComponent>,
    semaphore: Arc<Semaphore>,
    latch: Arc<StatusLatch>,
    codec: ImageCodec,
    options: PipelineOptions,
    renegotiations: u32,
    closed: bool,
}

impl CodecPipeline {
    /// Create an image encoder on `runtime` for `input_format` frames
    pub fn open(
        runtime: &dyn HardwareRuntime,
        input_format: PortFormat,
        codec: ImageCodec,
        options: PipelineOptions,
    ) -> CodecResult<Self> {
        ensure_initialized(runtime)?;
        let component = runtime.create_image_encoder()?;
        Self::with_component(component, input_format, codec, options)
    }

    /// Build the pipeline around an existing component
    pub fn with_component(
        mut component: Box<dyn CodecComponent>,
        input_format: PortFormat,
        codec: ImageCodec,
        options: PipelineOptions,
    ) -> CodecResult<Self> {
        let semaphore = Arc::new(Semaphore::new(1));
        let latch = Arc::new(StatusLatch::new(semaphore.clone()));
        let control: Arc<dyn ControlSink> = latch.clone();
        component.enable_control(control)?;

        let input = CodecPort::open(
            component.as_mut(),
            PortDirection::Input,
            input_format,
            None,
            None,
            semaphore.clone(),
        )?;
        if input.buffer_size() <= options.input_header_margin {
            return Err(CodecError::FormatNotSupported(format!(
                "input buffers of {} bytes leave no room after a {} byte margin",
                input.buffer_size(),
                options.input_header_margin
            )));
        }

        let output_format = PortFormat::new(codec.encoding(), input_format.width, input_format.height);
        let output = CodecPort::open(
            component.as_mut(),
            PortDirection::Output,
            output_format,
            None,
            None,
            semaphore.clone(),
        )?;

        component.enable()?;

        let mut pipeline = Self {
            input,
            output,
            component,
            semaphore,
            latch,
            codec,
            options,
            renegotiations: 0,
            closed: false,
        };

        // Give the component somewhere to write straight away
        let prefed = pipeline
            .output
            .submit_all_free(pipeline.component.as_mut())?;

        info!(
            component = pipeline.component.name(),
            codec = %codec,
            input = %input_format,
            output_buffers = prefed,
            "Encoder pipeline ready"
        );
        Ok(pipeline)
    }

    pub fn codec(&self) -> ImageCodec {
        self.codec
    }

    /// Number of output pool rebuilds so far
    pub fn renegotiations(&self) -> u32 {
        self.renegotiations
    }

    pub fn input_stats(&self) -> PoolStats {
        self.input.stats()
    }

    pub fn output_stats(&self) -> PoolStats {
        self.output.stats()
    }

    pub fn latched_error(&self) -> Option<CodecStatus> {
        self.latch.status()
    }

    /// Encode one frame
    ///
    /// Returns once output end-of-stream is seen or an error is latched. With
    /// a latched error, the output collected so far is returned together with
    /// the status.
    pub fn encode(&mut self, input: &[u8]) -> CodecResult<EncodedOutput> {
        if self.closed {
            return Err(CodecError::Disconnected("pipeline is closed".into()));
        }
        if let Some(status) = self.latch.status() {
            return Ok(EncodedOutput {
                data: Vec::new(),
                end_of_stream: false,
                error: Some(status),
            });
        }

        let chunk_size = self.input.buffer_size() - self.options.input_header_margin;
        let mut remaining = input;
        let mut in_eos = false;
        let mut out_eos = false;
        let mut data = Vec::new();
        debug!(bytes = input.len(), chunk_size, "Encoding frame");

        while !out_eos {
            if !self.semaphore.wait_timeout(self.options.wait_timeout) {
                warn!(
                    timeout_ms = self.options.wait_timeout.as_millis() as u64,
                    "Timed out waiting for encoder"
                );
            }

            if let Some(status) = self.latch.status() {
                warn!(%status, bytes = data.len(), "Encoder error latched, stopping");
                return Ok(EncodedOutput {
                    data,
                    end_of_stream: false,
                    error: Some(status),
                });
            }

            for buffer in self.input.drain_ready() {
                self.input.recycle(buffer);
            }
            while !in_eos {
                let Some(mut buffer) = self.input.take_free() else {
                    break;
                };
                if remaining.is_empty() {
                    buffer.set_eos();
                    in_eos = true;
                    debug!("Sending input end of stream");
                } else {
                    let take = remaining.len().min(chunk_size);
                    let copied = buffer.fill(&remaining[..take]);
                    remaining = &remaining[copied..];
                }
                self.input.submit(self.component.as_mut(), buffer)?;
            }

            while let Some(mut buffer) = self.output.pop_ready() {
                match buffer.take_event() {
                    Some(PortEvent::FormatChanged(change)) => {
                        self.output.recycle(buffer);
                        self.output.renegotiate(
                            self.component.as_mut(),
                            &change,
                            self.options.output_fallback_buffers,
                            self.options.wait_timeout,
                        )?;
                        self.renegotiations += 1;
                    }
                    Some(PortEvent::Other(code)) => {
                        debug!(event = %code, "Ignoring output port event");
                        self.output.recycle(buffer);
                    }
                    None => {
                        data.extend_from_slice(buffer.payload());
                        out_eos = buffer.is_eos();
                        self.output.recycle(buffer);
                        if out_eos {
                            break;
                        }
                    }
                }
            }

            self.output.submit_all_free(self.component.as_mut())?;
        }

        info!(
            raw = input.len(),
            encoded = data.len(),
            renegotiations = self.renegotiations,
            "Encoded frame"
        );
        Ok(EncodedOutput {
            data,
            end_of_stream: true,
            error: None,
        })
    }

    /// Disable both ports and the component
    pub fn close(mut self) -> CodecResult<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> CodecResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let timeout = self.options.wait_timeout;
        let input = self.input.release(self.component.as_mut(), timeout);
        let output = self.output.release(self.component.as_mut(), timeout);
        let component = self.component.disable();

        input.and(output).and(component)?;
        debug!(component = self.component.name(), "Encoder pipeline closed");
        Ok(())
    }
}

impl Drop for CodecPipeline {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!(error = %e, "Encoder pipeline teardown failed");
        }
    }
}
