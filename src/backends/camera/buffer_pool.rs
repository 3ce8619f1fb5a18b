// SPDX-License-Identifier: GPL-3.0-only

//! Capture buffer pools
//!
//! A pool is a fixed arena of buffers addressed by [`BufferIndex`]. Each
//! buffer is owned by exactly one side at a time, tracked per index in
//! [`BufferOwner`]. Handing a buffer to the driver (queue) and taking it
//! back (dequeue) are the only transitions; the side that does not own a
//! buffer never touches its memory.
//!
//! Three strategies implement [`BufferPool`]:
//!
//! - [`HeapPool`]: one application buffer filled by blocking `read()`
//! - [`MmapPool`]: driver buffers mapped into the process
//! - [`UserPtrPool`]: application buffers registered with the driver

use super::driver::{CaptureDriver, MappedMemory, MemoryType, QueueRequest};
use crate::constants::MIN_STREAMING_BUFFERS;
use crate::errors::{CaptureError, CaptureResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use tracing::{debug, info, warn};

/// Buffer allocation strategy (V4L2 i/o method)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum IoMethod {
    /// Blocking read() into a heap buffer
    Read,
    /// Memory-mapped driver buffers
    #[default]
    Mmap,
    /// Application buffers registered by pointer
    #[serde(rename = "userptr")]
    #[value(name = "userptr")]
    UserPtr,
}

impl IoMethod {
    /// Whether buffers cycle between application and driver
    pub fn is_streaming(&self) -> bool {
        !matches!(self, IoMethod::Read)
    }

    fn memory_type(&self) -> Option<MemoryType> {
        match self {
            IoMethod::Read => None,
            IoMethod::Mmap => Some(MemoryType::Mmap),
            IoMethod::UserPtr => Some(MemoryType::UserPtr),
        }
    }
}

impl fmt::Display for IoMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoMethod::Read => write!(f, "read"),
            IoMethod::Mmap => write!(f, "mmap"),
            IoMethod::UserPtr => write!(f, "userptr"),
        }
    }
}

/// Stable handle of a buffer within its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferIndex(u32);

impl BufferIndex {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    fn slot(self) -> usize {
        self.0 as usize
    }
}

/// Which side may currently read or write a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOwner {
    Application,
    Device,
}

enum BufferMemory {
    Heap(Box<[u8]>),
    Mapped(Box<dyn MappedMemory>),
}

/// One capture buffer
pub struct Buffer {
    memory: BufferMemory,
    bytes_used: usize,
    owner: BufferOwner,
}

impl Buffer {
    fn heap(size: usize) -> CaptureResult<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| CaptureError::OutOfMemory(size))?;
        data.resize(size, 0);

        Ok(Self {
            memory: BufferMemory::Heap(data.into_boxed_slice()),
            bytes_used: 0,
            owner: BufferOwner::Application,
        })
    }

    fn mapped(memory: Box<dyn MappedMemory>) -> Self {
        Self {
            memory: BufferMemory::Mapped(memory),
            bytes_used: 0,
            owner: BufferOwner::Application,
        }
    }

    /// Total size of the buffer memory
    pub fn capacity(&self) -> usize {
        self.as_slice().len()
    }

    /// Bytes of valid data from the last fill
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub fn owner(&self) -> BufferOwner {
        self.owner
    }

    /// Valid bytes of the last fill
    pub fn data(&self) -> &[u8] {
        &self.as_slice()[..self.bytes_used]
    }

    fn as_slice(&self) -> &[u8] {
        match &self.memory {
            BufferMemory::Heap(data) => data,
            BufferMemory::Mapped(region) => region.as_slice(),
        }
    }

    fn heap_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.memory {
            BufferMemory::Heap(data) => Some(data),
            BufferMemory::Mapped(_) => None,
        }
    }

    /// Start address of heap memory, as registered with the driver
    fn address(&self) -> usize {
        self.as_slice().as_ptr() as usize
    }

    fn fill(&mut self, bytes_used: usize) {
        self.bytes_used = bytes_used.min(self.capacity());
        self.owner = BufferOwner::Application;
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.memory {
            BufferMemory::Heap(_) => "heap",
            BufferMemory::Mapped(_) => "mapped",
        };
        f.debug_struct("Buffer")
            .field("memory", &kind)
            .field("capacity", &self.capacity())
            .field("bytes_used", &self.bytes_used)
            .field("owner", &self.owner)
            .finish()
    }
}

/// Outcome of one dequeue attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// Driver said "try again"; nothing was dequeued
    Retry,
    /// A filled buffer is now owned by the application
    Frame {
        /// Absent for the non-indexed read strategy
        index: Option<BufferIndex>,
        bytes_used: usize,
        /// Driver frame counter, absent for the read strategy
        sequence: Option<u32>,
    },
}

/// Strategy-specific buffer cycling
pub trait BufferPool: Send {
    fn strategy(&self) -> IoMethod;

    /// Number of buffers, fixed for the pool's life
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn buffer(&self, index: BufferIndex) -> Option<&Buffer>;

    /// Valid bytes of a frame returned by [`BufferPool::acquire_one`]
    fn frame(&self, index: Option<BufferIndex>) -> &[u8] {
        index
            .and_then(|index| self.buffer(index))
            .map(Buffer::data)
            .unwrap_or(&[])
    }

    /// Buffers currently owned by the device
    fn device_owned(&self) -> usize;

    /// Hand every buffer to the driver before streaming starts
    fn submit_all(&mut self, driver: &mut dyn CaptureDriver) -> CaptureResult<()>;

    /// Take one filled buffer from the driver
    fn acquire_one(&mut self, driver: &mut dyn CaptureDriver) -> CaptureResult<Acquired>;

    /// Give an application-owned buffer back to the driver for refilling
    fn release_one(
        &mut self,
        driver: &mut dyn CaptureDriver,
        index: BufferIndex,
    ) -> CaptureResult<()>;

    /// Mark every buffer application-owned after the driver stopped streaming
    fn reclaim_all(&mut self);

    /// Free all buffer memory; a no-op once the pool is empty
    fn release(&mut self, driver: &mut dyn CaptureDriver) -> CaptureResult<()>;
}

/// Allocate a pool of `count` buffers of `size` bytes using `strategy`
///
/// The read strategy always uses a single buffer. Memory-mapped buffers are
/// sized by the driver, `size` only applies to heap memory.
pub fn allocate_pool(
    driver: &mut dyn CaptureDriver,
    device: &str,
    strategy: IoMethod,
    count: u32,
    size: usize,
) -> CaptureResult<Box<dyn BufferPool>> {
    let pool: Box<dyn BufferPool> = match strategy {
        IoMethod::Read => Box::new(HeapPool::allocate(size)?),
        IoMethod::Mmap => Box::new(MmapPool::allocate(driver, device, count)?),
        IoMethod::UserPtr => Box::new(UserPtrPool::allocate(driver, device, count, size)?),
    };

    info!(
        device,
        strategy = %strategy,
        count = pool.len(),
        "Allocated capture buffers"
    );
    Ok(pool)
}

/// Ask the driver for streaming buffers and enforce the minimum count
fn request_streaming_buffers(
    driver: &mut dyn CaptureDriver,
    device: &str,
    strategy: IoMethod,
    count: u32,
) -> CaptureResult<u32> {
    let memory = strategy
        .memory_type()
        .ok_or(CaptureError::InvalidState("read i/o has no driver buffers"))?;

    let granted = driver.request_buffers(memory, count).map_err(|e| {
        if e.raw_os_error() == Some(libc::EINVAL) {
            CaptureError::StrategyNotSupported {
                path: device.to_string(),
                strategy: match memory {
                    MemoryType::Mmap => "memory mapping",
                    MemoryType::UserPtr => "user pointer i/o",
                },
            }
        } else {
            CaptureError::io("VIDIOC_REQBUFS", e)
        }
    })?;

    debug!(device, requested = count, granted, "Driver buffer request");

    if granted < MIN_STREAMING_BUFFERS {
        // Give back whatever the driver did reserve
        if granted > 0 {
            free_driver_buffers(driver, memory);
        }
        return Err(CaptureError::InsufficientBuffers {
            path: device.to_string(),
            granted,
        });
    }

    Ok(granted)
}

fn free_driver_buffers(driver: &mut dyn CaptureDriver, memory: MemoryType) {
    if let Err(e) = driver.request_buffers(memory, 0) {
        warn!(error = %e, ?memory, "Failed to free driver buffers");
    }
}

fn is_try_again(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

fn ensure_released(buffers: &[Buffer]) -> CaptureResult<()> {
    match buffers
        .iter()
        .position(|b| b.owner == BufferOwner::Device)
    {
        Some(slot) => Err(CaptureError::BufferInFlight(slot as u32)),
        None => Ok(()),
    }
}

fn count_device_owned(buffers: &[Buffer]) -> usize {
    buffers
        .iter()
        .filter(|b| b.owner == BufferOwner::Device)
        .count()
}

fn reclaim(buffers: &mut [Buffer]) {
    for buffer in buffers {
        buffer.owner = BufferOwner::Application;
        buffer.bytes_used = 0;
    }
}

/// Single heap buffer for blocking-read capture
pub struct HeapPool {
    buffers: Vec<Buffer>,
}

impl HeapPool {
    pub fn allocate(size: usize) -> CaptureResult<Self> {
        Ok(Self {
            buffers: vec![Buffer::heap(size)?],
        })
    }
}

impl BufferPool for HeapPool {
    fn strategy(&self) -> IoMethod {
        IoMethod::Read
    }

    fn len(&self) -> usize {
        self.buffers.len()
    }

    fn buffer(&self, index: BufferIndex) -> Option<&Buffer> {
        self.buffers.get(index.slot())
    }

    fn frame(&self, _index: Option<BufferIndex>) -> &[u8] {
        self.buffers.first().map(Buffer::data).unwrap_or(&[])
    }

    fn device_owned(&self) -> usize {
        0
    }

    fn submit_all(&mut self, _driver: &mut dyn CaptureDriver) -> CaptureResult<()> {
        Ok(())
    }

    fn acquire_one(&mut self, driver: &mut dyn CaptureDriver) -> CaptureResult<Acquired> {
        let buffer = self
            .buffers
            .first_mut()
            .ok_or(CaptureError::InvalidState("buffer pool already released"))?;
        let memory = buffer
            .heap_mut()
            .ok_or(CaptureError::InvalidState("read buffer is not heap memory"))?;

        match driver.read_frame(memory) {
            Ok(read) => {
                buffer.fill(read);
                Ok(Acquired::Frame {
                    index: None,
                    bytes_used: buffer.bytes_used,
                    sequence: None,
                })
            }
            Err(e) if is_try_again(&e) => Ok(Acquired::Retry),
            Err(e) => Err(CaptureError::io("read", e)),
        }
    }

    fn release_one(
        &mut self,
        _driver: &mut dyn CaptureDriver,
        _index: BufferIndex,
    ) -> CaptureResult<()> {
        Ok(())
    }

    fn reclaim_all(&mut self) {}

    fn release(&mut self, _driver: &mut dyn CaptureDriver) -> CaptureResult<()> {
        self.buffers.clear();
        Ok(())
    }
}

/// Driver-allocated buffers mapped read/write into the process
pub struct MmapPool {
    buffers: Vec<Buffer>,
}

impl MmapPool {
    pub fn allocate(
        driver: &mut dyn CaptureDriver,
        device: &str,
        count: u32,
    ) -> CaptureResult<Self> {
        let granted = request_streaming_buffers(driver, device, IoMethod::Mmap, count)?;

        let mut buffers = Vec::with_capacity(granted as usize);
        for index in 0..granted {
            match driver.map_buffer(index) {
                Ok(region) => {
                    debug!(index, length = region.len(), "Mapped capture buffer");
                    buffers.push(Buffer::mapped(region));
                }
                Err(e) => {
                    // Unmap what we have before the driver side goes away
                    drop(buffers);
                    free_driver_buffers(driver, MemoryType::Mmap);
                    return Err(CaptureError::io("mmap", e));
                }
            }
        }

        Ok(Self { buffers })
    }
}

impl BufferPool for MmapPool {
    fn strategy(&self) -> IoMethod {
        IoMethod::Mmap
    }

    fn len(&self) -> usize {
        self.buffers.len()
    }

    fn buffer(&self, index: BufferIndex) -> Option<&Buffer> {
        self.buffers.get(index.slot())
    }

    fn device_owned(&self) -> usize {
        count_device_owned(&self.buffers)
    }

    fn submit_all(&mut self, driver: &mut dyn CaptureDriver) -> CaptureResult<()> {
        for slot in 0..self.buffers.len() {
            self.release_one(driver, BufferIndex(slot as u32))?;
        }
        Ok(())
    }

    fn acquire_one(&mut self, driver: &mut dyn CaptureDriver) -> CaptureResult<Acquired> {
        let dequeued = match driver.dequeue_buffer(MemoryType::Mmap) {
            Ok(dequeued) => dequeued,
            Err(e) if is_try_again(&e) => return Ok(Acquired::Retry),
            Err(e) => return Err(CaptureError::io("VIDIOC_DQBUF", e)),
        };

        let index = BufferIndex(dequeued.index);
        let buffer = self
            .buffers
            .get_mut(index.slot())
            .filter(|b| b.owner == BufferOwner::Device)
            .ok_or(CaptureError::UnknownBuffer {
                index: dequeued.index,
            })?;
        buffer.fill(dequeued.bytes_used as usize);

        Ok(Acquired::Frame {
            index: Some(index),
            bytes_used: buffer.bytes_used,
            sequence: Some(dequeued.sequence),
        })
    }

    fn release_one(
        &mut self,
        driver: &mut dyn CaptureDriver,
        index: BufferIndex,
    ) -> CaptureResult<()> {
        let buffer = self
            .buffers
            .get_mut(index.slot())
            .ok_or(CaptureError::UnknownBuffer { index: index.get() })?;
        if buffer.owner == BufferOwner::Device {
            return Err(CaptureError::DoubleRelease(index.get()));
        }

        driver
            .queue_buffer(QueueRequest {
                index: index.get(),
                memory: MemoryType::Mmap,
                user_ptr: None,
            })
            .map_err(|e| CaptureError::io("VIDIOC_QBUF", e))?;

        buffer.bytes_used = 0;
        buffer.owner = BufferOwner::Device;
        Ok(())
    }

    fn reclaim_all(&mut self) {
        reclaim(&mut self.buffers);
    }

    fn release(&mut self, driver: &mut dyn CaptureDriver) -> CaptureResult<()> {
        if self.buffers.is_empty() {
            return Ok(());
        }
        ensure_released(&self.buffers)?;

        // Unmapping happens when the regions drop
        self.buffers.clear();
        free_driver_buffers(driver, MemoryType::Mmap);
        Ok(())
    }
}

/// Application heap buffers the driver writes into directly
///
/// The memory must not move while registered, which `Box<[u8]>` guarantees
/// for the pool's life.
pub struct UserPtrPool {
    buffers: Vec<Buffer>,
}

impl UserPtrPool {
    pub fn allocate(
        driver: &mut dyn CaptureDriver,
        device: &str,
        count: u32,
        size: usize,
    ) -> CaptureResult<Self> {
        let granted = request_streaming_buffers(driver, device, IoMethod::UserPtr, count)?;

        let buffers = (0..granted)
            .map(|_| Buffer::heap(size))
            .collect::<CaptureResult<Vec<_>>>();

        match buffers {
            Ok(buffers) => Ok(Self { buffers }),
            Err(e) => {
                free_driver_buffers(driver, MemoryType::UserPtr);
                Err(e)
            }
        }
    }

    /// Find the buffer the driver wrote to by its registered address and length
    fn resolve(&self, address: usize, length: usize) -> Option<BufferIndex> {
        self.buffers
            .iter()
            .position(|b| b.address() == address && b.capacity() == length)
            .map(|slot| BufferIndex(slot as u32))
    }
}

impl BufferPool for UserPtrPool {
    fn strategy(&self) -> IoMethod {
        IoMethod::UserPtr
    }

    fn len(&self) -> usize {
        self.buffers.len()
    }

    fn buffer(&self, index: BufferIndex) -> Option<&Buffer> {
        self.buffers.get(index.slot())
    }

    fn device_owned(&self) -> usize {
        count_device_owned(&self.buffers)
    }

    fn submit_all(&mut self, driver: &mut dyn CaptureDriver) -> CaptureResult<()> {
        for slot in 0..self.buffers.len() {
            self.release_one(driver, BufferIndex(slot as u32))?;
        }
        Ok(())
    }

    fn acquire_one(&mut self, driver: &mut dyn CaptureDriver) -> CaptureResult<Acquired> {
        let dequeued = match driver.dequeue_buffer(MemoryType::UserPtr) {
            Ok(dequeued) => dequeued,
            Err(e) if is_try_again(&e) => return Ok(Acquired::Retry),
            Err(e) => return Err(CaptureError::io("VIDIOC_DQBUF", e)),
        };

        let index = dequeued
            .user_ptr
            .and_then(|address| self.resolve(address, dequeued.length as usize))
            .ok_or(CaptureError::UnknownBuffer {
                index: dequeued.index,
            })?;
        if index.get() != dequeued.index {
            warn!(
                reported = dequeued.index,
                resolved = index.get(),
                "Driver index disagrees with user pointer, using the pointer"
            );
        }

        let buffer = &mut self.buffers[index.slot()];
        if buffer.owner != BufferOwner::Device {
            return Err(CaptureError::UnknownBuffer { index: index.get() });
        }
        buffer.fill(dequeued.bytes_used as usize);

        Ok(Acquired::Frame {
            index: Some(index),
            bytes_used: buffer.bytes_used,
            sequence: Some(dequeued.sequence),
        })
    }

    fn release_one(
        &mut self,
        driver: &mut dyn CaptureDriver,
        index: BufferIndex,
    ) -> CaptureResult<()> {
        let buffer = self
            .buffers
            .get_mut(index.slot())
            .ok_or(CaptureError::UnknownBuffer { index: index.get() })?;
        if buffer.owner == BufferOwner::Device {
            return Err(CaptureError::DoubleRelease(index.get()));
        }

        let address = buffer
            .heap_mut()
            .map(|memory| memory.as_mut_ptr() as usize)
            .ok_or(CaptureError::InvalidState("user pointer buffer is not heap memory"))?;

        driver
            .queue_buffer(QueueRequest {
                index: index.get(),
                memory: MemoryType::UserPtr,
                user_ptr: Some((address, buffer.capacity())),
            })
            .map_err(|e| CaptureError::io("VIDIOC_QBUF", e))?;

        buffer.bytes_used = 0;
        buffer.owner = BufferOwner::Device;
        Ok(())
    }

    fn reclaim_all(&mut self) {
        reclaim(&mut self.buffers);
    }

    fn release(&mut self, driver: &mut dyn CaptureDriver) -> CaptureResult<()> {
        if self.buffers.is_empty() {
            return Ok(());
        }
        ensure_released(&self.buffers)?;

        // Unregister before the memory goes away
        free_driver_buffers(driver, MemoryType::UserPtr);
        self.buffers.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_method_streaming() {
        assert!(!IoMethod::Read.is_streaming());
        assert!(IoMethod::Mmap.is_streaming());
        assert!(IoMethod::UserPtr.is_streaming());
    }

    #[test]
    fn test_io_method_serde_names() {
        let json = serde_json::to_string(&IoMethod::UserPtr).unwrap();
        assert_eq!(json, "\"userptr\"");
        let parsed: IoMethod = serde_json::from_str("\"read\"").unwrap();
        assert_eq!(parsed, IoMethod::Read);
    }

    #[test]
    fn test_heap_buffer_starts_application_owned() {
        let pool = HeapPool::allocate(1024).unwrap();
        let buffer = pool.buffer(BufferIndex::new(0)).unwrap();
        assert_eq!(buffer.capacity(), 1024);
        assert_eq!(buffer.bytes_used(), 0);
        assert_eq!(buffer.owner(), BufferOwner::Application);
        assert!(pool.frame(None).is_empty());
    }
}
