//! Fanning a received payload out across several GPU buffers.

use std::ops::Range;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::accel::{AccelError, Accelerator, AllocSpec};
use crate::gpu::{DeviceId, EventId, EventStatus, GpuError, GpuRuntime, StreamId};
use crate::mem::{Buffer, MemKind, OutOfBounds};
use crate::poll::SpinWait;

/// Striping policy: fixed-size chunks dealt round-robin over `width` targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Striping {
    chunk_size: usize,
    width: usize,
}

/// One chunk of a striped payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Chunk number within the payload.
    pub index: usize,
    /// Byte range within the payload. Only the last chunk may be short.
    pub src: Range<usize>,
    /// Destination buffer.
    pub target: usize,
    /// Byte offset within the destination buffer.
    pub dst_offset: usize,
}

impl Chunk {
    #[inline]
    pub fn len(&self) -> usize {
        self.src.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.src.is_empty()
    }
}

impl Striping {
    /// Chunk size of the scatter designs.
    pub const DEFAULT_CHUNK_SIZE: usize = 4096;

    /// # Panics
    ///
    /// Panic if `chunk_size` or `width` is zero.
    pub fn new(chunk_size: usize, width: usize) -> Self {
        assert!(chunk_size > 0, "chunk size must be positive");
        assert!(width > 0, "striping needs at least one target");
        Self { chunk_size, width }
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of chunks a payload of `len` bytes splits into.
    #[inline]
    pub fn chunk_count(&self, len: usize) -> usize {
        len.div_ceil(self.chunk_size)
    }

    /// Destination of chunk `index`.
    #[inline]
    pub fn target_of(&self, index: usize) -> usize {
        index % self.width
    }

    /// Bytes each destination must hold for a payload of `len` bytes.
    pub fn capacity_for(&self, len: usize) -> usize {
        self.chunk_count(len).div_ceil(self.width) * self.chunk_size
    }

    /// The chunks of a payload of `len` bytes, in order.
    ///
    /// Chunk `i` goes to target `i % width` at offset `(i / width) * chunk_size`,
    /// so chunks never overlap within a target and fill it without gaps.
    pub fn chunks(&self, len: usize) -> impl Iterator<Item = Chunk> {
        let Striping { chunk_size, width } = *self;
        (0..self.chunk_count(len)).map(move |index| {
            let start = index * chunk_size;
            Chunk {
                index,
                src: start..(start + chunk_size).min(len),
                target: index % width,
                dst_offset: (index / width) * chunk_size,
            }
        })
    }
}

impl Default for Striping {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHUNK_SIZE, 4)
    }
}

/// How the copy stage waits for its copies.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum CopyMode {
    /// Synchronize every destination device after issuing all copies.
    #[default]
    Blocking,
    /// Record one event per destination and poll them without blocking.
    EventPoll,
}

/// Where destination buffers are allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// All buffers on one device.
    SingleDevice(DeviceId),
    /// Buffer `k` on device `k`.
    PerDevice,
}

/// The destination buffers of a scatter, owned for the whole benchmark.
#[derive(Debug)]
pub struct DestinationSet {
    buffers: Vec<Buffer>,
}

impl DestinationSet {
    /// Allocate `width` GPU buffers of `size` bytes each.
    pub fn allocate<A: Accelerator + ?Sized>(
        accel: &A,
        width: usize,
        size: usize,
        placement: Placement,
    ) -> Result<Self, AccelError> {
        let buffers = (0..width)
            .map(|k| {
                let dev = match placement {
                    Placement::SingleDevice(dev) => dev,
                    Placement::PerDevice => k as DeviceId,
                };
                accel.get_mem(AllocSpec::gpu(size, dev))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { buffers })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    #[inline]
    pub fn get(&self, k: usize) -> Option<&Buffer> {
        self.buffers.get(k)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Buffer> {
        self.buffers.iter()
    }

    /// Virtual addresses of the buffers, in order.
    pub fn addrs(&self) -> Vec<u64> {
        self.buffers.iter().map(Buffer::vaddr).collect()
    }

    /// Device holding buffer `k`.
    fn device_of(&self, k: usize) -> DeviceId {
        match self.buffers[k].kind() {
            MemKind::Gpu(dev) => dev,
            MemKind::Host => 0,
        }
    }

    /// Return the buffers to the accelerator.
    pub fn release<A: Accelerator + ?Sized>(self, accel: &A) -> Result<(), AccelError> {
        for buf in &self.buffers {
            accel.free_mem(buf)?;
        }
        Ok(())
    }
}

/// Scatter stage error type.
#[derive(Debug, Error)]
pub enum ScatterError {
    #[error("GPU runtime: {0}")]
    Gpu(#[from] GpuError),

    #[error("source buffer: {0}")]
    Source(#[from] OutOfBounds),

    /// Copies to some destinations did not complete in time.
    #[error("{pending} destination copies still pending after {waited:?}")]
    TimedOut { pending: usize, waited: Duration },

    /// A destination does not hold what the striping put there.
    #[error("chunk {chunk} in destination {target} differs at byte {offset}")]
    Mismatch {
        chunk: usize,
        target: usize,
        offset: usize,
    },

    /// The plan's striping does not match its destinations.
    #[error("striping over {width} targets but {buffers} destination buffers")]
    WidthMismatch { width: usize, buffers: usize },
}

/// Per-destination streams and events of one benchmark call.
#[derive(Debug)]
pub struct StageHandles {
    streams: Vec<StreamId>,
    events: Vec<EventId>,
}

/// A host-to-GPU copy stage between "payload received" and "payload sent back".
pub struct ScatterPlan<'a> {
    gpu: &'a mut dyn GpuRuntime,
    dests: &'a DestinationSet,
    striping: Striping,
    mode: CopyMode,
}

impl<'a> ScatterPlan<'a> {
    pub fn new(
        gpu: &'a mut dyn GpuRuntime,
        dests: &'a DestinationSet,
        striping: Striping,
        mode: CopyMode,
    ) -> Result<Self, ScatterError> {
        if striping.width() != dests.len() {
            return Err(ScatterError::WidthMismatch {
                width: striping.width(),
                buffers: dests.len(),
            });
        }
        Ok(Self {
            gpu,
            dests,
            striping,
            mode,
        })
    }

    #[inline]
    pub fn striping(&self) -> Striping {
        self.striping
    }

    #[inline]
    pub fn mode(&self) -> CopyMode {
        self.mode
    }

    #[inline]
    pub fn destinations(&self) -> &DestinationSet {
        self.dests
    }

    /// Create one stream and one event per destination, on its device.
    pub fn open(&mut self) -> Result<StageHandles, ScatterError> {
        let mut handles = StageHandles {
            streams: Vec::with_capacity(self.dests.len()),
            events: Vec::with_capacity(self.dests.len()),
        };
        for k in 0..self.dests.len() {
            let dev = self.dests.device_of(k);
            self.gpu.set_device(dev)?;
            handles.streams.push(self.gpu.stream_create()?);
            handles.events.push(self.gpu.event_create()?);
            log::debug!("scatterbench: created stream and event for GPU {}", dev);
        }
        Ok(handles)
    }

    /// Destroy the streams and events created by [`ScatterPlan::open`].
    pub fn close(&mut self, handles: StageHandles) -> Result<(), ScatterError> {
        for (k, (stream, event)) in handles.streams.into_iter().zip(handles.events).enumerate() {
            let dev = self.dests.device_of(k);
            self.gpu.set_device(dev)?;
            self.gpu.stream_destroy(stream)?;
            self.gpu.event_destroy(event)?;
            log::debug!("scatterbench: destroyed stream and event for GPU {}", dev);
        }
        Ok(())
    }

    /// Copy the first `len` bytes of `src` to the destinations and wait until
    /// every copy has landed.
    pub fn scatter(
        &mut self,
        handles: &StageHandles,
        src: &Buffer,
        len: usize,
        timeout: Option<Duration>,
    ) -> Result<(), ScatterError> {
        let striping = self.striping;
        let dests = self.dests;
        let gpu = &mut *self.gpu;

        src.read(0..len, |payload| -> Result<(), ScatterError> {
            for chunk in striping.chunks(len) {
                let k = chunk.target;
                log::trace!(
                    "scatterbench: copying chunk {}/{} to GPU {}",
                    chunk.index + 1,
                    striping.chunk_count(len),
                    dests.device_of(k)
                );
                gpu.set_device(dests.device_of(k))?;
                gpu.memcpy_htod_async(
                    &dests.buffers[k],
                    chunk.dst_offset,
                    &payload[chunk.src.clone()],
                    Some(handles.streams[k]),
                )?;
            }
            Ok(())
        })??;

        match self.mode {
            CopyMode::Blocking => {
                for k in 0..dests.len() {
                    self.gpu.set_device(dests.device_of(k))?;
                    self.gpu.device_synchronize()?;
                }
                Ok(())
            }
            CopyMode::EventPoll => self.poll_events(handles, timeout),
        }
    }

    fn poll_events(
        &mut self,
        handles: &StageHandles,
        timeout: Option<Duration>,
    ) -> Result<(), ScatterError> {
        let width = self.dests.len();
        for k in 0..width {
            self.gpu.set_device(self.dests.device_of(k))?;
            self.gpu.event_record(handles.events[k], handles.streams[k])?;
        }

        let mut done = vec![false; width];
        let mut spin = SpinWait::new(timeout);
        loop {
            let mut pending = 0;
            for k in 0..width {
                if done[k] {
                    continue;
                }
                self.gpu.set_device(self.dests.device_of(k))?;
                match self.gpu.event_query(handles.events[k])? {
                    EventStatus::Ready => done[k] = true,
                    EventStatus::NotReady => pending += 1,
                }
            }
            if pending == 0 {
                return Ok(());
            }
            spin.tick()
                .map_err(|waited| ScatterError::TimedOut { pending, waited })?;
        }
    }
}

/// Check that each destination holds its chunks of `src[..len]`.
pub fn verify_scatter(
    src: &Buffer,
    dests: &DestinationSet,
    striping: Striping,
    len: usize,
) -> Result<(), ScatterError> {
    for chunk in striping.chunks(len) {
        let expected = src.to_vec(chunk.src.start, chunk.len())?;
        let found = dests.buffers[chunk.target].to_vec(chunk.dst_offset, chunk.len())?;
        if let Some(offset) = expected.iter().zip(&found).position(|(a, b)| a != b) {
            return Err(ScatterError::Mismatch {
                chunk: chunk.index,
                target: chunk.target,
                offset: chunk.dst_offset + offset,
            });
        }
    }
    Ok(())
}
