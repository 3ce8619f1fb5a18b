// SPDX-License-Identifier: GPL-3.0-only

//! Software image encoder
//!
//! A [`CodecComponent`] whose execution context is a dedicated worker
//! thread. Buffers and port changes travel to the worker over a channel;
//! finished buffers come back through the registered completion sinks, so
//! the pipeline sees the same asynchronous behaviour as with an
//! accelerator.
//!
//! Input bytes accumulate until an end-of-stream buffer arrives, then the
//! whole frame is converted to RGB and encoded with the `image` crate. The
//! encoded stream is split over output buffers in submission order and the
//! last one carries end-of-stream. If the stream would span more than
//! `chunk_limit` output buffers, the worker first returns a format-changed
//! event asking for larger ones.

use super::format_converters;
use super::runtime::{CodecComponent, CompletionSink, ControlSink, HardwareRuntime, Rejected};
use super::types::{
    BufferFlags, CodecBuffer, CodecStatus, ControlEvent, FormatChange, ImageCodec, PortDirection,
    PortEvent, PortFormat, PortRequirements,
};
use crate::constants::{DEFAULT_JPEG_QUALITY, RENEGOTIATE_CHUNK_LIMIT, software};
use crate::errors::{CodecError, CodecResult};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageError, RgbImage};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Output buffer sizes are rounded up to this
const OUTPUT_SIZE_ALIGN: usize = 4096;

/// Runtime producing [`SoftwareImageEncoder`] components
#[derive(Debug, Clone)]
pub struct SoftwareRuntime {
    jpeg_quality: u8,
    chunk_limit: usize,
}

impl SoftwareRuntime {
    pub fn new(jpeg_quality: u8, chunk_limit: usize) -> Self {
        Self {
            jpeg_quality: jpeg_quality.clamp(1, 100),
            chunk_limit,
        }
    }
}

impl Default for SoftwareRuntime {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY, RENEGOTIATE_CHUNK_LIMIT)
    }
}

impl HardwareRuntime for SoftwareRuntime {
    fn name(&self) -> &str {
        "software"
    }

    fn initialize(&self) -> CodecResult<()> {
        debug!(
            jpeg_quality = self.jpeg_quality,
            chunk_limit = self.chunk_limit,
            "Software codec runtime ready"
        );
        Ok(())
    }

    fn create_image_encoder(&self) -> CodecResult<Box<dyn CodecComponent>> {
        Ok(Box::new(SoftwareImageEncoder::new(
            self.jpeg_quality,
            self.chunk_limit,
        )))
    }
}

enum Command {
    Configure {
        input: Option<PortFormat>,
        codec: Option<ImageCodec>,
    },
    Connect(PortDirection, Arc<dyn CompletionSink>),
    Disconnect(PortDirection, Sender<()>),
    Buffer(PortDirection, CodecBuffer),
    Shutdown,
}

impl Command {
    fn into_buffer(self) -> Option<CodecBuffer> {
        match self {
            Command::Buffer(_, buffer) => Some(buffer),
            _ => None,
        }
    }
}

struct Worker {
    commands: Sender<Command>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct PortSlot {
    sink: Option<Arc<dyn CompletionSink>>,
    enabled: bool,
}

/// Image encoder running on its own thread
pub struct SoftwareImageEncoder {
    jpeg_quality: u8,
    chunk_limit: usize,
    input_format: Option<PortFormat>,
    codec: Option<ImageCodec>,
    control: Option<Arc<dyn ControlSink>>,
    input: PortSlot,
    output: PortSlot,
    worker: Option<Worker>,
}

impl SoftwareImageEncoder {
    pub fn new(jpeg_quality: u8, chunk_limit: usize) -> Self {
        Self {
            jpeg_quality,
            chunk_limit,
            input_format: None,
            codec: None,
            control: None,
            input: PortSlot::default(),
            output: PortSlot::default(),
            worker: None,
        }
    }

    fn slot_mut(&mut self, direction: PortDirection) -> &mut PortSlot {
        match direction {
            PortDirection::Input => &mut self.input,
            PortDirection::Output => &mut self.output,
        }
    }

    fn send(&self, command: Command) -> Result<(), Command> {
        match &self.worker {
            Some(worker) => worker
                .commands
                .send(command)
                .map_err(|mpsc::SendError(command)| command),
            None => Err(command),
        }
    }

    fn input_requirements() -> PortRequirements {
        PortRequirements {
            buffer_num_min: 1,
            buffer_num_recommended: software::INPUT_BUFFER_NUM,
            buffer_size_min: software::INPUT_BUFFER_SIZE_MIN,
            buffer_size_recommended: software::INPUT_BUFFER_SIZE,
        }
    }

    fn output_requirements() -> PortRequirements {
        PortRequirements {
            buffer_num_min: 1,
            buffer_num_recommended: software::OUTPUT_BUFFER_NUM,
            buffer_size_min: software::OUTPUT_BUFFER_SIZE_MIN,
            buffer_size_recommended: software::OUTPUT_BUFFER_SIZE,
        }
    }
}

impl CodecComponent for SoftwareImageEncoder {
    fn name(&self) -> &str {
        "software.image_encoder"
    }

    fn enable_control(&mut self, sink: Arc<dyn ControlSink>) -> CodecResult<()> {
        self.control = Some(sink);
        Ok(())
    }

    fn commit_format(
        &mut self,
        direction: PortDirection,
        format: &PortFormat,
    ) -> CodecResult<PortRequirements> {
        let requirements = match direction {
            PortDirection::Input => {
                if format_converters::bytes_per_pixel(format.encoding).is_none() {
                    return Err(CodecError::FormatNotSupported(format!(
                        "input encoding {}",
                        format.encoding
                    )));
                }
                if format.width == 0 || format.height == 0 {
                    return Err(CodecError::FormatNotSupported(format!(
                        "input size {}x{}",
                        format.width, format.height
                    )));
                }
                self.input_format = Some(*format);
                Self::input_requirements()
            }
            PortDirection::Output => {
                let codec = ImageCodec::from_encoding(format.encoding).ok_or_else(|| {
                    CodecError::FormatNotSupported(format!("output encoding {}", format.encoding))
                })?;
                self.codec = Some(codec);
                Self::output_requirements()
            }
        };

        // A running worker picks up the change for the next frame
        let _ = self.send(Command::Configure {
            input: self.input_format,
            codec: self.codec,
        });

        Ok(requirements)
    }

    fn create_pool(
        &mut self,
        direction: PortDirection,
        count: u32,
        size: usize,
    ) -> CodecResult<Vec<CodecBuffer>> {
        if count == 0 || size == 0 {
            return Err(CodecError::PortRejected {
                direction,
                status: CodecStatus::InvalidArgument,
            });
        }
        debug!(%direction, count, size, "Allocating encoder buffers");
        Ok((0..count).map(|index| CodecBuffer::new(index, size)).collect())
    }

    fn release_pool(&mut self, direction: PortDirection, buffers: Vec<CodecBuffer>) {
        debug!(%direction, count = buffers.len(), "Releasing encoder buffers");
    }

    fn enable_port(
        &mut self,
        direction: PortDirection,
        sink: Arc<dyn CompletionSink>,
    ) -> CodecResult<()> {
        let slot = self.slot_mut(direction);
        slot.sink = Some(sink.clone());
        slot.enabled = true;
        let _ = self.send(Command::Connect(direction, sink));
        Ok(())
    }

    fn disable_port(&mut self, direction: PortDirection) -> CodecResult<()> {
        let slot = self.slot_mut(direction);
        if !slot.enabled {
            return Ok(());
        }
        slot.enabled = false;
        slot.sink = None;

        if self.worker.is_none() {
            return Ok(());
        }

        let (ack, acked) = mpsc::channel();
        if self.send(Command::Disconnect(direction, ack)).is_err() {
            return Err(CodecError::Disconnected(format!(
                "cannot disable {} port, worker is gone",
                direction
            )));
        }
        // The worker returns held buffers before acknowledging
        acked.recv().map_err(|_| {
            CodecError::Disconnected(format!("worker exited while disabling {} port", direction))
        })
    }

    fn send_buffer(
        &mut self,
        direction: PortDirection,
        buffer: CodecBuffer,
    ) -> Result<(), Rejected> {
        let enabled = match direction {
            PortDirection::Input => self.input.enabled,
            PortDirection::Output => self.output.enabled,
        };
        if !enabled || self.worker.is_none() {
            return Err(Rejected {
                status: CodecStatus::NotReady,
                buffer: Some(buffer),
            });
        }

        self.send(Command::Buffer(direction, buffer))
            .map_err(|command| Rejected {
                status: CodecStatus::NotConnected,
                buffer: command.into_buffer(),
            })
    }

    fn enable(&mut self) -> CodecResult<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        let (commands, receiver) = mpsc::channel();
        let state = EncoderWorker {
            jpeg_quality: self.jpeg_quality,
            chunk_limit: self.chunk_limit,
            input_format: self.input_format,
            codec: self.codec,
            control: self.control.clone(),
            input_sink: self.input.sink.clone().filter(|_| self.input.enabled),
            output_sink: self.output.sink.clone().filter(|_| self.output.enabled),
            frame: Vec::new(),
            outputs: VecDeque::new(),
            pending: None,
            awaiting_reconfigure: false,
            format_change_sent: false,
        };

        let handle = std::thread::Builder::new()
            .name("stillcap-encoder".into())
            .spawn(move || state.run(receiver))
            .map_err(|e| CodecError::ComponentCreate(format!("encoder thread: {}", e)))?;

        self.worker = Some(Worker { commands, handle });
        info!(component = self.name(), "Component enabled");
        Ok(())
    }

    fn disable(&mut self) -> CodecResult<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        let _ = worker.commands.send(Command::Shutdown);
        worker
            .handle
            .join()
            .map_err(|_| CodecError::Disconnected("encoder worker panicked".into()))?;
        debug!(component = "software.image_encoder", "Component disabled");
        Ok(())
    }
}

impl Drop for SoftwareImageEncoder {
    fn drop(&mut self) {
        if let Err(e) = self.disable() {
            warn!(error = %e, "Software encoder shutdown failed");
        }
    }
}

struct PendingOutput {
    data: Vec<u8>,
    offset: usize,
}

/// State owned by the worker thread
struct EncoderWorker {
    jpeg_quality: u8,
    chunk_limit: usize,
    input_format: Option<PortFormat>,
    codec: Option<ImageCodec>,
    control: Option<Arc<dyn ControlSink>>,
    input_sink: Option<Arc<dyn CompletionSink>>,
    output_sink: Option<Arc<dyn CompletionSink>>,
    /// Input bytes of the current frame
    frame: Vec<u8>,
    /// Empty output buffers, in submission order
    outputs: VecDeque<CodecBuffer>,
    pending: Option<PendingOutput>,
    awaiting_reconfigure: bool,
    format_change_sent: bool,
}

impl EncoderWorker {
    fn run(mut self, commands: Receiver<Command>) {
        while let Ok(command) = commands.recv() {
            match command {
                Command::Configure { input, codec } => {
                    self.input_format = input;
                    self.codec = codec;
                }
                Command::Connect(direction, sink) => match direction {
                    PortDirection::Input => self.input_sink = Some(sink),
                    PortDirection::Output => {
                        self.output_sink = Some(sink);
                        self.awaiting_reconfigure = false;
                        self.emit();
                    }
                },
                Command::Disconnect(direction, ack) => {
                    match direction {
                        PortDirection::Input => self.input_sink = None,
                        PortDirection::Output => {
                            self.return_outputs();
                            self.output_sink = None;
                        }
                    }
                    let _ = ack.send(());
                }
                Command::Buffer(PortDirection::Input, buffer) => self.consume_input(buffer),
                Command::Buffer(PortDirection::Output, buffer) => {
                    self.outputs.push_back(buffer);
                    self.emit();
                }
                Command::Shutdown => break,
            }
        }

        self.return_outputs();
    }

    fn report(&self, status: CodecStatus) {
        error!(%status, "Software encoder error");
        if let Some(control) = &self.control {
            control.on_control_event(ControlEvent::Error(status));
        }
    }

    fn consume_input(&mut self, mut buffer: CodecBuffer) {
        self.frame.extend_from_slice(buffer.payload());
        let eos = buffer.is_eos();

        buffer.reset();
        match &self.input_sink {
            Some(sink) => sink.on_buffer_returned(buffer),
            None => warn!(index = buffer.index(), "Input buffer returned while port disabled"),
        }

        if eos {
            self.finish_frame();
        }
    }

    fn finish_frame(&mut self) {
        let raw = std::mem::take(&mut self.frame);
        let (Some(format), Some(codec)) = (self.input_format, self.codec) else {
            self.report(CodecStatus::NotReady);
            return;
        };

        let data = if raw.is_empty() {
            debug!("End of stream without input");
            Vec::new()
        } else {
            match encode_frame(&raw, &format, codec, self.jpeg_quality) {
                Ok(encoded) => {
                    info!(
                        codec = %codec,
                        raw = raw.len(),
                        encoded = encoded.len(),
                        "Encoded frame"
                    );
                    encoded
                }
                Err(status) => {
                    self.report(status);
                    return;
                }
            }
        };

        self.pending = Some(PendingOutput { data, offset: 0 });
        self.emit();
    }

    /// Write pending encoded bytes into available output buffers
    fn emit(&mut self) {
        if self.awaiting_reconfigure {
            return;
        }
        let Some(sink) = self.output_sink.clone() else {
            return;
        };

        loop {
            let Some(remaining) = self.pending.as_ref().map(|p| p.data.len() - p.offset) else {
                return;
            };
            let Some(mut buffer) = self.outputs.pop_front() else {
                return;
            };

            if !self.format_change_sent
                && self.chunk_limit > 0
                && remaining > buffer.capacity().saturating_mul(self.chunk_limit)
            {
                let size = renegotiated_size(remaining, self.chunk_limit);
                info!(
                    remaining,
                    current = buffer.capacity(),
                    requested = size,
                    "Requesting larger output buffers"
                );

                buffer.reset();
                buffer.set_event(PortEvent::FormatChanged(self.format_change(size)));
                self.format_change_sent = true;
                self.awaiting_reconfigure = true;
                sink.on_buffer_returned(buffer);
                return;
            }

            let Some(pending) = self.pending.as_mut() else {
                return;
            };
            let copied = buffer.fill(&pending.data[pending.offset..]);
            pending.offset += copied;
            let done = pending.offset == pending.data.len();

            let mut flags = BufferFlags::empty();
            if done {
                flags.insert(BufferFlags::FRAME_END);
                flags.insert(BufferFlags::EOS);
            }
            buffer.set_flags(flags);
            sink.on_buffer_returned(buffer);

            if done {
                self.pending = None;
                self.format_change_sent = false;
            }
        }
    }

    fn format_change(&self, buffer_size: usize) -> FormatChange {
        let (width, height) = self
            .input_format
            .map(|f| (f.width, f.height))
            .unwrap_or_default();
        let encoding = self
            .codec
            .map(|c| c.encoding())
            .unwrap_or(super::types::encodings::JPEG);

        FormatChange {
            format: PortFormat::new(encoding, width, height),
            requirements: PortRequirements {
                buffer_num_min: 1,
                buffer_num_recommended: software::OUTPUT_BUFFER_NUM,
                buffer_size_min: software::OUTPUT_BUFFER_SIZE_MIN,
                buffer_size_recommended: buffer_size,
            },
        }
    }

    fn return_outputs(&mut self) {
        let Some(sink) = self.output_sink.clone() else {
            return;
        };
        for mut buffer in self.outputs.drain(..) {
            buffer.reset();
            sink.on_buffer_returned(buffer);
        }
    }
}

/// Output buffer size for `remaining` bytes to fit in `chunk_limit` buffers
fn renegotiated_size(remaining: usize, chunk_limit: usize) -> usize {
    remaining
        .div_ceil(chunk_limit.max(1))
        .div_ceil(OUTPUT_SIZE_ALIGN)
        .saturating_mul(OUTPUT_SIZE_ALIGN)
        .clamp(software::OUTPUT_BUFFER_SIZE_MIN, software::OUTPUT_BUFFER_SIZE_MAX)
}

fn image_status(err: ImageError) -> CodecStatus {
    warn!(error = %err, "Image encoding failed");
    match err {
        ImageError::Limits(_) => CodecStatus::NoMemory,
        ImageError::Unsupported(_) => CodecStatus::NotImplemented,
        ImageError::IoError(_) => CodecStatus::Io,
        _ => CodecStatus::InvalidArgument,
    }
}

/// Convert a raw frame and encode it as `codec`
pub fn encode_frame(
    raw: &[u8],
    format: &PortFormat,
    codec: ImageCodec,
    jpeg_quality: u8,
) -> Result<Vec<u8>, CodecStatus> {
    let rgb = format_converters::to_rgb(
        format.encoding,
        raw,
        format.width,
        format.height,
        format.bytes_per_line,
    )
    .ok_or(CodecStatus::NotImplemented)?;

    let mut encoded = Vec::new();
    match codec {
        ImageCodec::Jpeg => {
            let mut encoder = JpegEncoder::new_with_quality(&mut encoded, jpeg_quality);
            encoder
                .encode(&rgb, format.width, format.height, ExtendedColorType::Rgb8)
                .map_err(image_status)?;
        }
        _ => {
            let image = RgbImage::from_raw(format.width, format.height, rgb)
                .ok_or(CodecStatus::InvalidArgument)?;
            image
                .write_to(&mut std::io::Cursor::new(&mut encoded), codec.image_format())
                .map_err(image_status)?;
        }
    }

    Ok(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::codec::types::encodings;

    fn grey_format() -> PortFormat {
        PortFormat::new(encodings::GREY, 8, 8)
    }

    #[test]
    fn test_encode_png_signature() {
        let encoded = encode_frame(&[0x80; 64], &grey_format(), ImageCodec::Png, 90).unwrap();
        assert_eq!(&encoded[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn test_encode_jpeg_markers() {
        let encoded = encode_frame(&[0x40; 64], &grey_format(), ImageCodec::Jpeg, 90).unwrap();
        assert_eq!(&encoded[..2], &[0xFF, 0xD8]);
        assert_eq!(&encoded[encoded.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn test_encode_bmp_header() {
        let encoded = encode_frame(&[0; 64], &grey_format(), ImageCodec::Bmp, 90).unwrap();
        assert_eq!(&encoded[..2], b"BM");
    }

    #[test]
    fn test_encode_uses_format_stride() {
        // Trailing padding past the last line must not shift rows
        let format = PortFormat::new(encodings::GREY, 4, 2).with_stride(4);
        let raw = [1, 1, 1, 1, 2, 2, 2, 2, 0, 0, 0, 0];
        let encoded = encode_frame(&raw, &format, ImageCodec::Png, 90).unwrap();

        let image = image::load_from_memory(&encoded).unwrap().to_rgb8();
        let second_row: Vec<u8> = (0..4).map(|x| image.get_pixel(x, 1).0[0]).collect();
        assert_eq!(second_row, vec![2, 2, 2, 2]);
    }

    #[test]
    fn test_unsupported_input_encoding() {
        let format = PortFormat::new(encodings::I420, 8, 8);
        assert_eq!(
            encode_frame(&[0; 96], &format, ImageCodec::Png, 90),
            Err(CodecStatus::NotImplemented)
        );
    }

    #[test]
    fn test_renegotiated_size_aligned_and_clamped() {
        assert_eq!(renegotiated_size(1, 1), software::OUTPUT_BUFFER_SIZE_MIN);
        assert_eq!(renegotiated_size(4 * 5000, 4), 8192);
        assert_eq!(renegotiated_size(usize::MAX / 2, 16), software::OUTPUT_BUFFER_SIZE_MAX);
    }

    #[test]
    fn test_commit_rejects_unknown_output() {
        let mut encoder = SoftwareImageEncoder::new(90, 16);
        let format = PortFormat::new(encodings::YUYV, 8, 8);
        assert!(matches!(
            encoder.commit_format(PortDirection::Output, &format),
            Err(CodecError::FormatNotSupported(_))
        ));
        assert!(encoder.commit_format(PortDirection::Input, &format).is_ok());
    }
}
