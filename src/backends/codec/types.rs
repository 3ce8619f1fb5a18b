// SPDX-License-Identifier: GPL-3.0-only

//! Codec port, buffer and event types

use crate::errors::{AppError, AppResult};
use image::ImageFormat;
use std::fmt;
use std::path::Path;
use v4l::FourCC;

/// Encodings understood by the encoder ports
pub mod encodings {
    use v4l::FourCC;

    pub const I420: FourCC = FourCC { repr: *b"I420" };
    pub const YUYV: FourCC = FourCC { repr: *b"YUYV" };
    pub const UYVY: FourCC = FourCC { repr: *b"UYVY" };
    pub const RGB24: FourCC = FourCC { repr: *b"RGB3" };
    pub const BGR24: FourCC = FourCC { repr: *b"BGR3" };
    pub const GREY: FourCC = FourCC { repr: *b"GREY" };

    pub const JPEG: FourCC = FourCC { repr: *b"JPEG" };
    pub const GIF: FourCC = FourCC { repr: *b"GIF " };
    pub const PNG: FourCC = FourCC { repr: *b"PNG " };
    pub const TGA: FourCC = FourCC { repr: *b"TGA " };
    pub const BMP: FourCC = FourCC { repr: *b"BMP " };
}

/// Output image codec, selected by file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageCodec {
    Jpeg,
    Gif,
    Png,
    Tga,
    Bmp,
}

impl ImageCodec {
    pub const ALL: [ImageCodec; 5] = [
        ImageCodec::Jpeg,
        ImageCodec::Gif,
        ImageCodec::Png,
        ImageCodec::Tga,
        ImageCodec::Bmp,
    ];

    /// Map an extension (without the dot, any case)
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(ImageCodec::Jpeg),
            "gif" => Some(ImageCodec::Gif),
            "png" => Some(ImageCodec::Png),
            "tga" => Some(ImageCodec::Tga),
            "bmp" => Some(ImageCodec::Bmp),
            _ => None,
        }
    }

    /// Codec for an output file; a missing or unknown extension is an error
    pub fn from_path(path: &Path) -> AppResult<Self> {
        let extension = path.extension().and_then(|e| e.to_str()).ok_or_else(|| {
            AppError::InvalidOutput(format!("{} has no file extension", path.display()))
        })?;

        Self::from_extension(extension).ok_or_else(|| {
            AppError::InvalidOutput(format!(
                "Unsupported output extension '.{}' (expected jpg, jpeg, gif, png, tga or bmp)",
                extension
            ))
        })
    }

    pub fn from_encoding(encoding: FourCC) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.encoding() == encoding)
    }

    /// Output port encoding for this codec
    pub fn encoding(&self) -> FourCC {
        match self {
            ImageCodec::Jpeg => encodings::JPEG,
            ImageCodec::Gif => encodings::GIF,
            ImageCodec::Png => encodings::PNG,
            ImageCodec::Tga => encodings::TGA,
            ImageCodec::Bmp => encodings::BMP,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ImageCodec::Jpeg => "jpg",
            ImageCodec::Gif => "gif",
            ImageCodec::Png => "png",
            ImageCodec::Tga => "tga",
            ImageCodec::Bmp => "bmp",
        }
    }

    /// Convert to image crate's ImageFormat
    pub fn image_format(&self) -> ImageFormat {
        match self {
            ImageCodec::Jpeg => ImageFormat::Jpeg,
            ImageCodec::Gif => ImageFormat::Gif,
            ImageCodec::Png => ImageFormat::Png,
            ImageCodec::Tga => ImageFormat::Tga,
            ImageCodec::Bmp => ImageFormat::Bmp,
        }
    }
}

impl fmt::Display for ImageCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageCodec::Jpeg => write!(f, "jpeg"),
            ImageCodec::Gif => write!(f, "gif"),
            ImageCodec::Png => write!(f, "png"),
            ImageCodec::Tga => write!(f, "tga"),
            ImageCodec::Bmp => write!(f, "bmp"),
        }
    }
}

/// Direction of a codec port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortDirection {
    Input,
    Output,
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortDirection::Input => write!(f, "input"),
            PortDirection::Output => write!(f, "output"),
        }
    }
}

/// Elementary stream format of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortFormat {
    pub encoding: FourCC,
    pub width: u32,
    pub height: u32,
    /// Raw line stride in bytes, zero when unknown
    pub bytes_per_line: u32,
    /// Byte-rate hint, zero when unknown
    pub bitrate: u32,
}

impl PortFormat {
    pub fn new(encoding: FourCC, width: u32, height: u32) -> Self {
        Self {
            encoding,
            width,
            height,
            bytes_per_line: 0,
            bitrate: 0,
        }
    }

    /// Same format with an explicit line stride
    pub fn with_stride(mut self, bytes_per_line: u32) -> Self {
        self.bytes_per_line = bytes_per_line;
        self
    }
}

impl fmt::Display for PortFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}x{}", self.encoding, self.width, self.height)?;
        if self.bitrate > 0 {
            write!(f, " @ {} bps", self.bitrate)?;
        }
        Ok(())
    }
}

/// Buffer counts and sizes a port asks for after a format commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortRequirements {
    pub buffer_num_min: u32,
    pub buffer_num_recommended: u32,
    pub buffer_size_min: usize,
    pub buffer_size_recommended: usize,
}

impl PortRequirements {
    pub fn buffer_num(&self) -> u32 {
        self.buffer_num_recommended.max(self.buffer_num_min).max(1)
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size_recommended.max(self.buffer_size_min)
    }
}

/// New output format announced mid-stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatChange {
    pub format: PortFormat,
    pub requirements: PortRequirements,
}

/// Event carried by a returned buffer instead of payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortEvent {
    FormatChanged(FormatChange),
    /// Any other event, identified by its code
    Other(FourCC),
}

/// Per-buffer flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const EOS: BufferFlags = BufferFlags(1 << 0);
    pub const FRAME_END: BufferFlags = BufferFlags(1 << 2);

    pub fn empty() -> Self {
        BufferFlags(0)
    }

    pub fn contains(&self, other: BufferFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: BufferFlags) {
        self.0 |= other.0;
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

/// A codec port buffer
///
/// Memory is allocated by the component when a port pool is created and
/// keeps its size until the pool is released. The `generation` stamp ties a
/// buffer to the pool it came from.
pub struct CodecBuffer {
    pub(crate) generation: u64,
    index: u32,
    data: Box<[u8]>,
    offset: usize,
    length: usize,
    flags: BufferFlags,
    event: Option<PortEvent>,
}

impl CodecBuffer {
    pub fn new(index: u32, capacity: usize) -> Self {
        Self {
            generation: 0,
            index,
            data: vec![0; capacity].into_boxed_slice(),
            offset: 0,
            length: 0,
            flags: BufferFlags::empty(),
            event: None,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Valid payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.length]
    }

    /// Copy as much of `bytes` as fits, returns the number copied
    pub fn fill(&mut self, bytes: &[u8]) -> usize {
        let count = bytes.len().min(self.data.len());
        self.data[..count].copy_from_slice(&bytes[..count]);
        self.offset = 0;
        self.length = count;
        count
    }

    /// Whole buffer memory, for components writing in place
    pub fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Set the payload window after writing through `memory_mut`
    pub fn set_payload(&mut self, offset: usize, length: usize) {
        let offset = offset.min(self.data.len());
        self.offset = offset;
        self.length = length.min(self.data.len() - offset);
    }

    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: BufferFlags) {
        self.flags = flags;
    }

    pub fn is_eos(&self) -> bool {
        self.flags.contains(BufferFlags::EOS)
    }

    pub fn set_eos(&mut self) {
        self.flags.insert(BufferFlags::EOS);
    }

    pub fn event(&self) -> Option<&PortEvent> {
        self.event.as_ref()
    }

    pub fn set_event(&mut self, event: PortEvent) {
        self.event = Some(event);
    }

    pub fn take_event(&mut self) -> Option<PortEvent> {
        self.event.take()
    }

    /// Clear payload, flags and event before reuse
    pub fn reset(&mut self) {
        self.offset = 0;
        self.length = 0;
        self.flags = BufferFlags::empty();
        self.event = None;
    }
}

impl fmt::Debug for CodecBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecBuffer")
            .field("generation", &self.generation)
            .field("index", &self.index)
            .field("capacity", &self.capacity())
            .field("length", &self.length)
            .field("flags", &self.flags)
            .field("event", &self.event)
            .finish()
    }
}

/// Status codes reported by a codec component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecStatus {
    Success,
    NoMemory,
    NoSpace,
    InvalidArgument,
    NotImplemented,
    NotFound,
    Io,
    Timeout,
    Corrupt,
    NotReady,
    NotConnected,
    Other(u32),
}

impl fmt::Display for CodecStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecStatus::Success => write!(f, "success"),
            CodecStatus::NoMemory => write!(f, "out of memory"),
            CodecStatus::NoSpace => write!(f, "out of resources"),
            CodecStatus::InvalidArgument => write!(f, "invalid argument"),
            CodecStatus::NotImplemented => write!(f, "not implemented"),
            CodecStatus::NotFound => write!(f, "not found"),
            CodecStatus::Io => write!(f, "i/o error"),
            CodecStatus::Timeout => write!(f, "timed out"),
            CodecStatus::Corrupt => write!(f, "data is corrupt"),
            CodecStatus::NotReady => write!(f, "component not ready"),
            CodecStatus::NotConnected => write!(f, "component not connected"),
            CodecStatus::Other(code) => write!(f, "status {}", code),
        }
    }
}

/// Asynchronous message on the component's control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    Error(CodecStatus),
    Eos,
}

/// Multi-line description of a port format and its buffer requirements
pub fn describe_format(
    direction: PortDirection,
    format: &PortFormat,
    requirements: &PortRequirements,
) -> String {
    format!(
        "{} port: {} ({}x{}), bitrate {}, buffers num {} (opt {}, min {}), size {} (opt {}, min {})",
        direction,
        format.encoding,
        format.width,
        format.height,
        format.bitrate,
        requirements.buffer_num(),
        requirements.buffer_num_recommended,
        requirements.buffer_num_min,
        requirements.buffer_size(),
        requirements.buffer_size_recommended,
        requirements.buffer_size_min,
    )
}
