// SPDX-License-Identifier: GPL-3.0-only

//! Codec ports and their completion queues
//!
//! Every port buffer is in exactly one of three places:
//!
//! - the port's free list (application-owned, empty)
//! - the component (submitted, counted in `in_flight`)
//! - the completion queue (returned but not yet popped, also in `in_flight`)
//!
//! so `free + in_flight == total` holds whenever the port is not between
//! pools.

use super::runtime::{CodecComponent, CompletionSink, Rejected};
use super::types::{
    CodecBuffer, FormatChange, PortDirection, PortFormat, PortRequirements, describe_format,
};
use crate::errors::{CodecError, CodecResult};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counting semaphore shared by both ports of a pipeline
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<usize>,
    signal: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            signal: Condvar::new(),
        }
    }

    pub fn post(&self) {
        *lock(&self.count) += 1;
        self.signal.notify_one();
    }

    /// Take one count, waiting up to `timeout`; false on timeout
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = lock(&self.count);
        let (mut count, _) = self
            .signal
            .wait_timeout_while(guard, timeout, |count| *count == 0)
            .unwrap_or_else(PoisonError::into_inner);

        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    pub fn available(&self) -> usize {
        *lock(&self.count)
    }
}

/// Buffers returned by the component, in return order
pub struct CompletionQueue {
    direction: PortDirection,
    queue: Mutex<VecDeque<CodecBuffer>>,
    arrived: Condvar,
    semaphore: Arc<Semaphore>,
}

impl CompletionQueue {
    fn new(direction: PortDirection, semaphore: Arc<Semaphore>) -> Self {
        Self {
            direction,
            queue: Mutex::new(VecDeque::new()),
            arrived: Condvar::new(),
            semaphore,
        }
    }

    fn pop(&self) -> Option<CodecBuffer> {
        lock(&self.queue).pop_front()
    }

    /// Pop a buffer without touching the shared semaphore
    fn pop_timeout(&self, timeout: Duration) -> Option<CodecBuffer> {
        let guard = lock(&self.queue);
        let (mut queue, _) = self
            .arrived
            .wait_timeout_while(guard, timeout, |queue| queue.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        queue.pop_front()
    }

    fn len(&self) -> usize {
        lock(&self.queue).len()
    }
}

impl CompletionSink for CompletionQueue {
    fn on_buffer_returned(&self, buffer: CodecBuffer) {
        lock(&self.queue).push_back(buffer);
        self.arrived.notify_all();
        self.semaphore.post();
    }
}

impl std::fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("direction", &self.direction)
            .field("pending", &self.len())
            .finish()
    }
}

/// Buffer accounting snapshot of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Incremented on every pool rebuild
    pub generation: u64,
    pub total: usize,
    pub free: usize,
    /// Submitted and not yet popped back, including `pending`
    pub in_flight: usize,
    /// Returned and waiting in the completion queue
    pub pending: usize,
}

impl PoolStats {
    /// Every buffer of the current pool is accounted for
    pub fn is_balanced(&self) -> bool {
        self.free + self.in_flight == self.total
    }
}

/// One directional port with its buffer pool
pub struct CodecPort {
    direction: PortDirection,
    format: PortFormat,
    requirements: PortRequirements,
    buffer_num: usize,
    buffer_size: usize,
    generation: u64,
    free: Vec<CodecBuffer>,
    in_flight: usize,
    completions: Arc<CompletionQueue>,
    enabled: bool,
}

impl CodecPort {
    /// Commit `format`, create the pool and enable the port
    ///
    /// The pool uses the component's recommended count and size (never below
    /// its minimums) unless `buffer_count` / `buffer_size` override them.
    pub fn open(
        component: &mut dyn CodecComponent,
        direction: PortDirection,
        format: PortFormat,
        buffer_count: Option<u32>,
        buffer_size: Option<usize>,
        semaphore: Arc<Semaphore>,
    ) -> CodecResult<Self> {
        let requirements = component.commit_format(direction, &format)?;
        info!("{}", describe_format(direction, &format, &requirements));

        let count = buffer_count
            .unwrap_or(requirements.buffer_num())
            .max(requirements.buffer_num_min)
            .max(1);
        let size = buffer_size
            .unwrap_or(requirements.buffer_size())
            .max(requirements.buffer_size_min);

        let free = Self::create_pool(component, direction, count, size, 0)?;
        let completions = Arc::new(CompletionQueue::new(direction, semaphore));
        let sink: Arc<dyn CompletionSink> = completions.clone();
        if let Err(e) = component.enable_port(direction, sink) {
            component.release_pool(direction, free);
            return Err(e);
        }

        debug!(%direction, count, size, "Codec port enabled");

        Ok(Self {
            direction,
            format,
            requirements,
            buffer_num: count as usize,
            buffer_size: size,
            generation: 0,
            free,
            in_flight: 0,
            completions,
            enabled: true,
        })
    }

    fn create_pool(
        component: &mut dyn CodecComponent,
        direction: PortDirection,
        count: u32,
        size: usize,
        generation: u64,
    ) -> CodecResult<Vec<CodecBuffer>> {
        let mut buffers = component.create_pool(direction, count, size)?;
        if buffers.len() != count as usize {
            let created = buffers.len();
            component.release_pool(direction, buffers);
            return Err(CodecError::ComponentCreate(format!(
                "{} pool has {} buffers, {} requested",
                direction, created, count
            )));
        }
        for buffer in &mut buffers {
            buffer.generation = generation;
        }
        Ok(buffers)
    }

    pub fn direction(&self) -> PortDirection {
        self.direction
    }

    pub fn format(&self) -> &PortFormat {
        &self.format
    }

    pub fn requirements(&self) -> &PortRequirements {
        &self.requirements
    }

    /// Capacity of each pool buffer
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn buffer_count(&self) -> usize {
        self.buffer_num
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            generation: self.generation,
            total: self.buffer_num,
            free: self.free.len(),
            in_flight: self.in_flight,
            pending: self.completions.len(),
        }
    }

    /// Take an empty buffer from the free list
    pub fn take_free(&mut self) -> Option<CodecBuffer> {
        self.free.pop()
    }

    /// Put a popped buffer back on the free list
    pub fn recycle(&mut self, mut buffer: CodecBuffer) {
        if buffer.generation != self.generation {
            warn!(
                direction = %self.direction,
                index = buffer.index(),
                generation = buffer.generation,
                current = self.generation,
                "Dropping buffer from a previous pool"
            );
            return;
        }
        buffer.reset();
        self.free.push(buffer);
    }

    /// Hand one buffer to the component
    pub fn submit(
        &mut self,
        component: &mut dyn CodecComponent,
        buffer: CodecBuffer,
    ) -> CodecResult<()> {
        self.in_flight += 1;
        match component.send_buffer(self.direction, buffer) {
            Ok(()) => Ok(()),
            Err(Rejected { status, buffer }) => {
                self.in_flight -= 1;
                match buffer {
                    Some(buffer) => self.recycle(buffer),
                    None => {
                        warn!(direction = %self.direction, "Component kept a rejected buffer");
                        self.buffer_num = self.buffer_num.saturating_sub(1);
                    }
                }
                Err(CodecError::SubmitRejected {
                    direction: self.direction,
                    status,
                })
            }
        }
    }

    /// Submit every free buffer, returns how many were submitted
    pub fn submit_all_free(&mut self, component: &mut dyn CodecComponent) -> CodecResult<usize> {
        let mut submitted = 0;
        while let Some(buffer) = self.take_free() {
            self.submit(component, buffer)?;
            submitted += 1;
        }
        Ok(submitted)
    }

    /// Pop one returned buffer without blocking
    pub fn pop_ready(&mut self) -> Option<CodecBuffer> {
        let buffer = self.completions.pop()?;
        self.in_flight = self.in_flight.saturating_sub(1);
        Some(buffer)
    }

    /// Pop every returned buffer available now
    pub fn drain_ready(&mut self) -> Vec<CodecBuffer> {
        std::iter::from_fn(|| self.pop_ready()).collect()
    }

    /// Wait until every submitted buffer is back on the free list
    fn reclaim_in_flight(&mut self, timeout: Duration) -> CodecResult<usize> {
        let deadline = Instant::now() + timeout;
        let mut retrieved = 0;

        while self.in_flight > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CodecError::DrainTimeout {
                    direction: self.direction,
                    outstanding: self.in_flight,
                });
            }
            if let Some(buffer) = self.completions.pop_timeout(remaining) {
                self.in_flight = self.in_flight.saturating_sub(1);
                self.recycle(buffer);
                retrieved += 1;
            }
        }

        Ok(retrieved)
    }

    /// Rebuild the pool for a format announced by the component
    ///
    /// The port is disabled, every buffer is reclaimed and freed, the new
    /// format is committed, a pool of `fallback_count` buffers (never below
    /// the component minimum) is created, and every new buffer is submitted.
    pub fn renegotiate(
        &mut self,
        component: &mut dyn CodecComponent,
        change: &FormatChange,
        fallback_count: u32,
        timeout: Duration,
    ) -> CodecResult<()> {
        info!(
            "Format changed from {}",
            describe_format(self.direction, &self.format, &self.requirements)
        );
        info!(
            "Format changed to {}",
            describe_format(self.direction, &change.format, &change.requirements)
        );

        self.disable(component)?;
        let retrieved = self.reclaim_in_flight(timeout)?;
        debug!(direction = %self.direction, retrieved, "Retrieved buffers from disabled port");

        if self.free.len() != self.buffer_num {
            return Err(CodecError::Renegotiation(format!(
                "{} of {} {} buffers accounted for",
                self.free.len(),
                self.buffer_num,
                self.direction
            )));
        }
        component.release_pool(self.direction, std::mem::take(&mut self.free));

        let requirements = component.commit_format(self.direction, &change.format)?;
        let count = fallback_count
            .max(change.requirements.buffer_num_min)
            .max(requirements.buffer_num_min)
            .max(1);
        let size = change
            .requirements
            .buffer_size()
            .max(requirements.buffer_size_min);

        let generation = self.generation + 1;
        self.free = Self::create_pool(component, self.direction, count, size, generation)?;
        self.generation = generation;
        self.format = change.format;
        self.requirements = requirements;
        self.buffer_num = count as usize;
        self.buffer_size = size;

        let sink: Arc<dyn CompletionSink> = self.completions.clone();
        component.enable_port(self.direction, sink)?;
        self.enabled = true;

        let submitted = self.submit_all_free(component)?;
        info!(
            direction = %self.direction,
            generation,
            count,
            size,
            submitted,
            "Rebuilt port pool"
        );
        Ok(())
    }

    /// Disable the port; the component returns what it was holding
    pub fn disable(&mut self, component: &mut dyn CodecComponent) -> CodecResult<()> {
        if !self.enabled {
            return Ok(());
        }
        self.enabled = false;
        component.disable_port(self.direction)
    }

    /// Disable, reclaim and free the pool
    pub fn release(
        &mut self,
        component: &mut dyn CodecComponent,
        timeout: Duration,
    ) -> CodecResult<()> {
        self.disable(component)?;
        let reclaimed = self.reclaim_in_flight(timeout);
        component.release_pool(self.direction, std::mem::take(&mut self.free));
        self.buffer_num = 0;
        reclaimed.map(|_| ())
    }
}

impl std::fmt::Debug for CodecPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecPort")
            .field("direction", &self.direction)
            .field("format", &self.format)
            .field("stats", &self.stats())
            .field("enabled", &self.enabled)
            .finish()
    }
}
