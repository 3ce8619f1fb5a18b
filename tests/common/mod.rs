// SPDX-License-Identifier: GPL-3.0-only

//! Shared fakes for integration tests
//!
//! - [`StubDriver`]: a V4L2 driver that records every request
//! - [`ScriptedEncoder`]: a codec component that plays back scripted output

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use stillcap::backends::camera::driver::{
    CaptureDriver, CaptureFormat, DequeuedBuffer, DeviceCapabilities, FormatRequest,
    MappedMemory, MemoryType, QueueRequest,
};
use stillcap::backends::codec::{
    CodecBuffer, CodecComponent, CodecStatus, CompletionSink, ControlEvent, ControlSink,
    FormatChange, PortDirection, PortEvent, PortFormat, PortRequirements, Rejected,
};
use stillcap::errors::{CodecError, CodecResult};
use v4l::FourCC;

/// Fresh scratch directory under the system temp dir
pub fn scratch_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("stillcap-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn yuyv_format(width: u32, height: u32) -> CaptureFormat {
    CaptureFormat {
        fourcc: FourCC::new(b"YUYV"),
        width,
        height,
        bytes_per_line: width * 2,
        size_image: width * height * 2,
    }
}

/// Horizontal luma ramp with neutral chroma
pub fn yuyv_frame(width: u32, height: u32) -> Vec<u8> {
    let mut frame = Vec::with_capacity((width * height * 2) as usize);
    for _ in 0..height {
        for x in 0..width {
            frame.push((x * 255 / width.max(1)) as u8);
            frame.push(128);
        }
    }
    frame
}

// ===== Capture driver =====

/// Everything the stub driver was asked to do
#[derive(Debug, Default, Clone)]
pub struct DriverLog {
    pub requests: Vec<(MemoryType, u32)>,
    pub queued: Vec<u32>,
    pub dequeued: Vec<u32>,
    pub stream_on: u32,
    pub stream_off: u32,
    pub reads: u32,
    /// User pointers queued, by buffer index
    pub user_ptrs: Vec<(u32, usize)>,
    /// Set once the driver handle is gone
    pub closed: bool,
}

pub struct StubState {
    pub capabilities: DeviceCapabilities,
    pub format: CaptureFormat,
    /// Buffers granted for any non-zero request
    pub granted: u32,
    /// errno returned by the next non-zero buffer request
    pub request_error: Option<i32>,
    /// Number of "try again" answers before data flows
    pub try_again: u32,
    /// Whether the device reports readiness
    pub ready: bool,
    /// Bytes produced for every frame
    pub frame: Vec<u8>,
    /// Index reported by the next dequeue instead of the real one
    pub dequeue_index: Option<u32>,
    /// User pointer reported by the next dequeue instead of the real one
    pub dequeue_user_ptr: Option<usize>,
    /// errno returned by the next STREAMOFF
    pub stream_off_error: Option<i32>,
    pub log: DriverLog,
    driver_queue: VecDeque<QueueRequest>,
}

/// Shared view on the stub's state
#[derive(Clone)]
pub struct StubHandle(Arc<Mutex<StubState>>);

impl StubHandle {
    pub fn state(&self) -> MutexGuard<'_, StubState> {
        self.0.lock().unwrap()
    }

    pub fn log(&self) -> DriverLog {
        self.state().log.clone()
    }
}

pub struct StubDriver {
    state: Arc<Mutex<StubState>>,
}

impl StubDriver {
    /// A streaming- and read-capable YUYV device
    pub fn new(format: CaptureFormat, frame: Vec<u8>) -> (Self, StubHandle) {
        let state = Arc::new(Mutex::new(StubState {
            capabilities: DeviceCapabilities {
                driver: "stub".into(),
                card: "Stub Camera".into(),
                video_capture: true,
                read_write: true,
                streaming: true,
            },
            format,
            granted: 4,
            request_error: None,
            try_again: 0,
            ready: true,
            frame,
            dequeue_index: None,
            dequeue_user_ptr: None,
            stream_off_error: None,
            log: DriverLog::default(),
            driver_queue: VecDeque::new(),
        }));
        (
            Self {
                state: state.clone(),
            },
            StubHandle(state),
        )
    }

    fn state(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap()
    }
}

impl StubState {
    /// Write the frame into the memory a request registered, returning the
    /// bytes written (the whole frame for mapped buffers)
    fn fill_user_memory(&self, request: &QueueRequest) -> usize {
        let Some((address, length)) = request.user_ptr else {
            return self.frame.len();
        };
        let count = self.frame.len().min(length);
        // SAFETY: the pool registered this memory and keeps it alive while
        // the buffer is queued with the driver
        unsafe {
            std::ptr::copy_nonoverlapping(self.frame.as_ptr(), address as *mut u8, count);
        }
        count
    }
}

/// Closing the handle completes transfers still queued, as a driver does
/// until its file descriptor is released
impl Drop for StubDriver {
    fn drop(&mut self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        while let Some(request) = state.driver_queue.pop_front() {
            state.fill_user_memory(&request);
        }
        state.log.closed = true;
    }
}

struct StubMemory(Vec<u8>);

impl MappedMemory for StubMemory {
    fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

fn try_again() -> io::Error {
    io::Error::from(io::ErrorKind::WouldBlock)
}

impl CaptureDriver for StubDriver {
    fn capabilities(&self) -> io::Result<DeviceCapabilities> {
        Ok(self.state().capabilities.clone())
    }

    fn format(&self) -> io::Result<CaptureFormat> {
        Ok(self.state().format)
    }

    fn set_format(&mut self, request: &FormatRequest) -> io::Result<CaptureFormat> {
        let mut state = self.state();
        state.format.fourcc = request.fourcc;
        state.format.width = request.width;
        state.format.height = request.height;
        Ok(state.format)
    }

    fn request_buffers(&mut self, memory: MemoryType, count: u32) -> io::Result<u32> {
        let mut state = self.state();
        state.log.requests.push((memory, count));
        if count == 0 {
            state.driver_queue.clear();
            return Ok(0);
        }
        if let Some(errno) = state.request_error.take() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        Ok(state.granted.min(count))
    }

    fn map_buffer(&mut self, _index: u32) -> io::Result<Box<dyn MappedMemory>> {
        let state = self.state();
        let mut memory = state.frame.clone();
        memory.resize((state.format.size_image as usize).max(memory.len()), 0);
        Ok(Box::new(StubMemory(memory)))
    }

    fn queue_buffer(&mut self, request: QueueRequest) -> io::Result<()> {
        let mut state = self.state();
        state.log.queued.push(request.index);
        if let Some((address, _)) = request.user_ptr {
            state.log.user_ptrs.push((request.index, address));
        }
        state.driver_queue.push_back(request);
        Ok(())
    }

    fn dequeue_buffer(&mut self, _memory: MemoryType) -> io::Result<DequeuedBuffer> {
        let mut state = self.state();
        if state.try_again > 0 {
            state.try_again -= 1;
            return Err(try_again());
        }
        let request = state.driver_queue.pop_front().ok_or_else(try_again)?;
        state.log.dequeued.push(request.index);

        let bytes_used = state.fill_user_memory(&request);
        let index = state.dequeue_index.take().unwrap_or(request.index);
        let user_ptr = match state.dequeue_user_ptr.take() {
            Some(address) => Some(address),
            None => request.user_ptr.map(|(address, _)| address),
        };

        Ok(DequeuedBuffer {
            index,
            bytes_used: bytes_used as u32,
            length: request
                .user_ptr
                .map(|(_, length)| length as u32)
                .unwrap_or(state.format.size_image),
            user_ptr,
            sequence: state.log.dequeued.len() as u32,
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        self.state().log.stream_on += 1;
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        let mut state = self.state();
        state.log.stream_off += 1;
        if let Some(errno) = state.stream_off_error.take() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        state.driver_queue.clear();
        Ok(())
    }

    fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state();
        state.log.reads += 1;
        if state.try_again > 0 {
            state.try_again -= 1;
            return Err(try_again());
        }
        let count = state.frame.len().min(buf.len());
        buf[..count].copy_from_slice(&state.frame[..count]);
        Ok(count)
    }

    fn wait_readable(&mut self, _timeout: Duration) -> io::Result<bool> {
        Ok(self.state().ready)
    }
}

// ===== Codec component =====

/// What the scripted encoder should do
#[derive(Debug, Clone)]
pub struct Script {
    /// Output payloads emitted after input end-of-stream, in order
    pub chunks: Vec<Vec<u8>>,
    /// Return a format-changed event before emitting this chunk
    pub format_change_before: Option<usize>,
    /// Report this error instead of emitting this chunk
    pub fail_before: Option<(usize, CodecStatus)>,
    pub refuse: Option<Refusal>,
    pub input: PortRequirements,
    pub output: PortRequirements,
    /// Output requirements announced by the format-changed event
    pub changed_output: PortRequirements,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            chunks: Vec::new(),
            format_change_before: None,
            fail_before: None,
            refuse: None,
            input: PortRequirements {
                buffer_num_min: 1,
                buffer_num_recommended: 2,
                buffer_size_min: 256,
                buffer_size_recommended: 1024,
            },
            output: PortRequirements {
                buffer_num_min: 1,
                buffer_num_recommended: 4,
                buffer_size_min: 16,
                buffer_size_recommended: 64,
            },
            changed_output: PortRequirements {
                buffer_num_min: 1,
                buffer_num_recommended: 6,
                buffer_size_min: 16,
                buffer_size_recommended: 128,
            },
        }
    }
}

/// Refuse one submission on a port
#[derive(Debug, Clone, Copy)]
pub struct Refusal {
    pub direction: PortDirection,
    /// Zero-based count of submissions on that port
    pub nth: usize,
    pub status: CodecStatus,
    /// Hold on to the refused buffer instead of handing it back
    pub keep: bool,
}

/// Everything the scripted encoder saw
#[derive(Debug, Default, Clone)]
pub struct EncoderLog {
    pub input: Vec<u8>,
    pub input_eos: u32,
    pub pools_created: Vec<(PortDirection, u32, usize)>,
    pub pools_released: Vec<(PortDirection, usize)>,
    pub port_disables: Vec<PortDirection>,
    pub committed: Vec<(PortDirection, PortFormat)>,
    /// Output buffer indices in the order they were returned with payload
    pub emitted_indices: Vec<u32>,
    pub refused: Vec<(PortDirection, u32)>,
    pub enabled: bool,
    pub disabled: bool,
}

#[derive(Default)]
struct Port {
    sink: Option<Arc<dyn CompletionSink>>,
    enabled: bool,
    submitted: usize,
}

/// Synchronous codec component driven by a [`Script`]
///
/// Input buffers come back immediately. Output buffers are held and filled
/// in submission order, which after the pre-feed is reverse index order.
pub struct ScriptedEncoder {
    script: Script,
    log: Arc<Mutex<EncoderLog>>,
    control: Option<Arc<dyn ControlSink>>,
    input: Port,
    output: Port,
    held: Vec<CodecBuffer>,
    kept: Vec<CodecBuffer>,
    eos_seen: bool,
    next_chunk: usize,
    eos_emitted: bool,
    awaiting_reconfigure: bool,
    format_changed: bool,
    stopped: bool,
}

impl ScriptedEncoder {
    pub fn new(script: Script) -> (Box<dyn CodecComponent>, Arc<Mutex<EncoderLog>>) {
        let log = Arc::new(Mutex::new(EncoderLog::default()));
        let encoder = Self {
            script,
            log: log.clone(),
            control: None,
            input: Port::default(),
            output: Port::default(),
            held: Vec::new(),
            kept: Vec::new(),
            eos_seen: false,
            next_chunk: 0,
            eos_emitted: false,
            awaiting_reconfigure: false,
            format_changed: false,
            stopped: false,
        };
        (Box::new(encoder), log)
    }

    fn return_output(&self, buffer: CodecBuffer) {
        if let Some(sink) = &self.output.sink {
            sink.on_buffer_returned(buffer);
        }
    }

    fn take_held(&mut self) -> Option<CodecBuffer> {
        (!self.held.is_empty()).then(|| self.held.remove(0))
    }

    fn return_held(&mut self) {
        while let Some(mut buffer) = self.take_held() {
            buffer.reset();
            self.return_output(buffer);
        }
    }

    fn pump(&mut self) {
        if !self.eos_seen || self.awaiting_reconfigure || self.stopped || self.eos_emitted {
            return;
        }

        loop {
            let chunk = self.next_chunk;

            if self.script.format_change_before == Some(chunk) && !self.format_changed {
                let Some(mut buffer) = self.take_held() else {
                    return;
                };
                self.format_changed = true;
                self.awaiting_reconfigure = true;
                buffer.reset();
                buffer.set_event(PortEvent::FormatChanged(FormatChange {
                    format: self
                        .log
                        .lock()
                        .unwrap()
                        .committed
                        .iter()
                        .rev()
                        .find(|(d, _)| *d == PortDirection::Output)
                        .map(|(_, f)| *f)
                        .unwrap_or(PortFormat::new(FourCC::new(b"PNG "), 0, 0)),
                    requirements: self.script.changed_output,
                }));
                self.return_output(buffer);
                return;
            }

            if let Some((at, status)) = self.script.fail_before {
                if at == chunk {
                    self.stopped = true;
                    if let Some(control) = &self.control {
                        control.on_control_event(ControlEvent::Error(status));
                    }
                    return;
                }
            }

            let last = chunk + 1 >= self.script.chunks.len();
            let Some(mut buffer) = self.take_held() else {
                return;
            };
            if let Some(payload) = self.script.chunks.get(chunk) {
                buffer.fill(payload);
            }
            if last {
                buffer.set_eos();
                self.eos_emitted = true;
            }
            self.next_chunk += 1;
            self.log.lock().unwrap().emitted_indices.push(buffer.index());
            self.return_output(buffer);

            if last {
                return;
            }
        }
    }

    fn slot(&mut self, direction: PortDirection) -> &mut Port {
        match direction {
            PortDirection::Input => &mut self.input,
            PortDirection::Output => &mut self.output,
        }
    }
}

impl CodecComponent for ScriptedEncoder {
    fn name(&self) -> &str {
        "scripted"
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
        self.log.lock().unwrap().committed.push((direction, *format));
        Ok(match direction {
            PortDirection::Input => self.script.input,
            PortDirection::Output if self.format_changed => self.script.changed_output,
            PortDirection::Output => self.script.output,
        })
    }

    fn create_pool(
        &mut self,
        direction: PortDirection,
        count: u32,
        size: usize,
    ) -> CodecResult<Vec<CodecBuffer>> {
        if count == 0 {
            return Err(CodecError::PortRejected {
                direction,
                status: CodecStatus::InvalidArgument,
            });
        }
        self.log
            .lock()
            .unwrap()
            .pools_created
            .push((direction, count, size));
        Ok((0..count).map(|i| CodecBuffer::new(i, size)).collect())
    }

    fn release_pool(&mut self, direction: PortDirection, buffers: Vec<CodecBuffer>) {
        self.log
            .lock()
            .unwrap()
            .pools_released
            .push((direction, buffers.len()));
    }

    fn enable_port(
        &mut self,
        direction: PortDirection,
        sink: Arc<dyn CompletionSink>,
    ) -> CodecResult<()> {
        let port = self.slot(direction);
        port.sink = Some(sink);
        port.enabled = true;
        if direction == PortDirection::Output {
            self.awaiting_reconfigure = false;
        }
        Ok(())
    }

    fn disable_port(&mut self, direction: PortDirection) -> CodecResult<()> {
        self.log.lock().unwrap().port_disables.push(direction);
        if direction == PortDirection::Output {
            self.return_held();
        }
        let port = self.slot(direction);
        port.enabled = false;
        port.sink = None;
        Ok(())
    }

    fn send_buffer(
        &mut self,
        direction: PortDirection,
        mut buffer: CodecBuffer,
    ) -> Result<(), Rejected> {
        let enabled = match direction {
            PortDirection::Input => self.input.enabled,
            PortDirection::Output => self.output.enabled,
        };
        if !enabled {
            return Err(Rejected {
                status: CodecStatus::NotReady,
                buffer: Some(buffer),
            });
        }

        let port = self.slot(direction);
        let nth = port.submitted;
        port.submitted += 1;
        let refusal = self
            .script
            .refuse
            .filter(|r| r.direction == direction && r.nth == nth);
        if let Some(refusal) = refusal {
            self.log
                .lock()
                .unwrap()
                .refused
                .push((direction, buffer.index()));
            if refusal.keep {
                self.kept.push(buffer);
                return Err(Rejected {
                    status: refusal.status,
                    buffer: None,
                });
            }
            return Err(Rejected {
                status: refusal.status,
                buffer: Some(buffer),
            });
        }

        match direction {
            PortDirection::Input => {
                let eos = buffer.is_eos();
                {
                    let mut log = self.log.lock().unwrap();
                    log.input.extend_from_slice(buffer.payload());
                    if eos {
                        log.input_eos += 1;
                    }
                }
                buffer.reset();
                if let Some(sink) = &self.input.sink {
                    sink.on_buffer_returned(buffer);
                }
                if eos {
                    self.eos_seen = true;
                }
            }
            PortDirection::Output => self.held.push(buffer),
        }

        self.pump();
        Ok(())
    }

    fn enable(&mut self) -> CodecResult<()> {
        self.log.lock().unwrap().enabled = true;
        Ok(())
    }

    fn disable(&mut self) -> CodecResult<()> {
        self.return_held();
        self.log.lock().unwrap().disabled = true;
        Ok(())
    }
}
