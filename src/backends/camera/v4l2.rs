// SPDX-License-Identifier: GPL-3.0-only

//! V4L2 capture driver
//!
//! Device open, capability and format negotiation go through the `v4l`
//! crate. The streaming requests (REQBUFS, QUERYBUF, QBUF, DQBUF,
//! STREAMON/OFF) are issued directly with libc so that the buffer pools keep
//! full control over buffer ownership and user-pointer memory.
//!
//! `v4l::Device::with_path` opens the node non-blocking, so an empty driver
//! queue surfaces as `WouldBlock` from read and dequeue.

use super::driver::{
    CaptureDriver, CaptureFormat, DeviceCapabilities, DequeuedBuffer, FormatRequest,
    MappedMemory, MemoryType, QueueRequest,
};
use std::io;
use std::os::raw::{c_int, c_ulong, c_void};
use std::os::unix::io::RawFd;
use std::time::Duration;
use tracing::{debug, warn};
use v4l::capability::Flags;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::Format;

const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
const V4L2_MEMORY_MMAP: u32 = 1;
const V4L2_MEMORY_USERPTR: u32 = 2;

/// struct v4l2_requestbuffers
#[repr(C)]
struct V4l2RequestBuffers {
    count: u32,
    type_: u32,
    memory: u32,
    capabilities: u32,
    flags: u8,
    reserved: [u8; 3],
}

/// struct v4l2_timecode
#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2Timecode {
    type_: u32,
    flags: u32,
    frames: u8,
    seconds: u8,
    minutes: u8,
    hours: u8,
    userbits: [u8; 4],
}

/// The `m` union of struct v4l2_buffer
#[repr(C)]
#[derive(Clone, Copy)]
union V4l2BufferM {
    offset: u32,
    userptr: c_ulong,
    planes: *mut c_void,
    fd: i32,
}

/// struct v4l2_buffer
#[repr(C)]
struct V4l2Buffer {
    index: u32,
    type_: u32,
    bytesused: u32,
    flags: u32,
    field: u32,
    timestamp: libc::timeval,
    timecode: V4l2Timecode,
    sequence: u32,
    memory: u32,
    m: V4l2BufferM,
    length: u32,
    reserved2: u32,
    request_fd: i32,
}

impl V4l2Buffer {
    fn new(memory: u32) -> Self {
        // SAFETY: all-zero is a valid v4l2_buffer
        let mut buf: Self = unsafe { std::mem::zeroed() };
        buf.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        buf.memory = memory;
        buf
    }
}

// _IOC encoding: dir(2) | size(14) | type(8) | nr(8)
const IOC_WRITE: c_ulong = 1;
const IOC_READ: c_ulong = 2;

const fn ioc(dir: c_ulong, nr: c_ulong, size: usize) -> c_ulong {
    (dir << 30) | ((size as c_ulong) << 16) | ((b'V' as c_ulong) << 8) | nr
}

const VIDIOC_REQBUFS: c_ulong = ioc(
    IOC_READ | IOC_WRITE,
    8,
    std::mem::size_of::<V4l2RequestBuffers>(),
);
const VIDIOC_QUERYBUF: c_ulong = ioc(IOC_READ | IOC_WRITE, 9, std::mem::size_of::<V4l2Buffer>());
const VIDIOC_QBUF: c_ulong = ioc(IOC_READ | IOC_WRITE, 15, std::mem::size_of::<V4l2Buffer>());
const VIDIOC_DQBUF: c_ulong = ioc(IOC_READ | IOC_WRITE, 17, std::mem::size_of::<V4l2Buffer>());
const VIDIOC_STREAMON: c_ulong = ioc(IOC_WRITE, 18, std::mem::size_of::<c_int>());
const VIDIOC_STREAMOFF: c_ulong = ioc(IOC_WRITE, 19, std::mem::size_of::<c_int>());

/// ioctl that retries on EINTR
fn xioctl<T>(fd: RawFd, request: c_ulong, arg: &mut T) -> io::Result<()> {
    loop {
        let result = unsafe { libc::ioctl(fd, request as _, arg as *mut T) };
        if result != -1 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn memory_code(memory: MemoryType) -> u32 {
    match memory {
        MemoryType::Mmap => V4L2_MEMORY_MMAP,
        MemoryType::UserPtr => V4L2_MEMORY_USERPTR,
    }
}

/// Driver buffer mapped read/write, unmapped on drop
struct MmapRegion {
    ptr: *mut c_void,
    len: usize,
}

// SAFETY: the mapping is plain shared memory; access is serialized by the
// pool's ownership protocol
unsafe impl Send for MmapRegion {}

impl MappedMemory for MmapRegion {
    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe a live mapping owned by self
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap
        if unsafe { libc::munmap(self.ptr, self.len) } == -1 {
            warn!(
                error = %io::Error::last_os_error(),
                len = self.len,
                "munmap failed"
            );
        }
    }
}

/// Capture driver backed by a V4L2 device node
pub struct V4l2Driver {
    device: Device,
    fd: RawFd,
}

impl V4l2Driver {
    pub fn open(path: &str) -> io::Result<Self> {
        let device = Device::with_path(path)?;
        let fd = device.handle().fd();
        debug!(path, fd, "Opened V4L2 device");
        Ok(Self { device, fd })
    }
}

fn capture_format(format: &Format) -> CaptureFormat {
    CaptureFormat {
        fourcc: format.fourcc,
        width: format.width,
        height: format.height,
        bytes_per_line: format.stride,
        size_image: format.size,
    }
}

impl CaptureDriver for V4l2Driver {
    fn capabilities(&self) -> io::Result<DeviceCapabilities> {
        let caps = self.device.query_caps()?;
        Ok(DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            video_capture: caps.capabilities.contains(Flags::VIDEO_CAPTURE),
            read_write: caps.capabilities.contains(Flags::READ_WRITE),
            streaming: caps.capabilities.contains(Flags::STREAMING),
        })
    }

    fn format(&self) -> io::Result<CaptureFormat> {
        self.device.format().map(|f| capture_format(&f))
    }

    fn set_format(&mut self, request: &FormatRequest) -> io::Result<CaptureFormat> {
        let format = Format::new(request.width, request.height, request.fourcc);
        self.device.set_format(&format).map(|f| capture_format(&f))
    }

    fn request_buffers(&mut self, memory: MemoryType, count: u32) -> io::Result<u32> {
        let mut req = V4l2RequestBuffers {
            count,
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            memory: memory_code(memory),
            capabilities: 0,
            flags: 0,
            reserved: [0; 3],
        };
        xioctl(self.fd, VIDIOC_REQBUFS, &mut req)?;
        Ok(req.count)
    }

    fn map_buffer(&mut self, index: u32) -> io::Result<Box<dyn MappedMemory>> {
        let mut buf = V4l2Buffer::new(V4L2_MEMORY_MMAP);
        buf.index = index;
        xioctl(self.fd, VIDIOC_QUERYBUF, &mut buf)?;

        let len = buf.length as usize;
        // SAFETY: offset is valid for the mmap memory type after QUERYBUF
        let offset = unsafe { buf.m.offset } as libc::off_t;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd,
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Box::new(MmapRegion { ptr, len }))
    }

    fn queue_buffer(&mut self, request: QueueRequest) -> io::Result<()> {
        let mut buf = V4l2Buffer::new(memory_code(request.memory));
        buf.index = request.index;
        if let Some((address, length)) = request.user_ptr {
            buf.m = V4l2BufferM {
                userptr: address as c_ulong,
            };
            buf.length = length as u32;
        }
        xioctl(self.fd, VIDIOC_QBUF, &mut buf)
    }

    fn dequeue_buffer(&mut self, memory: MemoryType) -> io::Result<DequeuedBuffer> {
        let mut buf = V4l2Buffer::new(memory_code(memory));
        xioctl(self.fd, VIDIOC_DQBUF, &mut buf)?;

        let user_ptr = match memory {
            // SAFETY: userptr is the active member for this memory type
            MemoryType::UserPtr => Some(unsafe { buf.m.userptr } as usize),
            MemoryType::Mmap => None,
        };

        Ok(DequeuedBuffer {
            index: buf.index,
            bytes_used: buf.bytesused,
            length: buf.length,
            user_ptr,
            sequence: buf.sequence,
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        let mut buf_type = V4L2_BUF_TYPE_VIDEO_CAPTURE as c_int;
        xioctl(self.fd, VIDIOC_STREAMON, &mut buf_type)
    }

    fn stream_off(&mut self) -> io::Result<()> {
        let mut buf_type = V4L2_BUF_TYPE_VIDEO_CAPTURE as c_int;
        xioctl(self.fd, VIDIOC_STREAMOFF, &mut buf_type)
    }

    fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let read = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
            if read >= 0 {
                return Ok(read as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(c_int::MAX as u128) as c_int;

        loop {
            let ready = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if ready >= 0 {
                return Ok(ready > 0);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}
