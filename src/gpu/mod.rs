//! GPU runtime collaborator.
//!
//! Only the handful of runtime calls the scatter stage makes are modelled:
//! device selection, stream and event lifetime, host-to-device asynchronous
//! copies, event queries, and device-wide synchronization. Like the runtime it
//! stands in for, [`GpuRuntime`] keeps a *current device*, and stream, event
//! and copy calls implicitly refer to it.

mod host;

use std::fmt;

use thiserror::Error;

pub use self::host::*;
use crate::mem::{Buffer, MemKind, OutOfBounds};

/// Device ordinal.
pub type DeviceId = u32;

/// Handle of a stream created by a [`GpuRuntime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub(crate) u32);

/// Handle of an event created by a [`GpuRuntime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub(crate) u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event#{}", self.0)
    }
}

/// Result of a non-blocking event query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    /// All work captured by the event has completed.
    Ready,
    /// Some captured work is still in flight.
    NotReady,
}

/// GPU runtime error type.
#[derive(Debug, Error)]
pub enum GpuError {
    /// No device with this ordinal.
    #[error("invalid device {0}")]
    InvalidDevice(DeviceId),

    /// The stream does not exist or was destroyed.
    #[error("invalid {0}")]
    InvalidStream(StreamId),

    /// The event does not exist or was destroyed.
    #[error("invalid {0}")]
    InvalidEvent(EventId),

    /// The stream or event belongs to another device than the current one.
    #[error("{what} belongs to device {owner}, current device is {current}")]
    WrongDevice {
        what: String,
        owner: DeviceId,
        current: DeviceId,
    },

    /// Copy destination is not memory of the current device.
    #[error("copy destination is {dst} memory, current device is {current}")]
    NotDeviceMemory { dst: MemKind, current: DeviceId },

    /// Copy range does not fit the destination.
    #[error("copy out of bounds: {0}")]
    OutOfBounds(#[from] OutOfBounds),
}

/// The GPU runtime.
pub trait GpuRuntime {
    /// Number of visible devices.
    fn device_count(&self) -> u32;

    /// Select the current device.
    fn set_device(&mut self, dev: DeviceId) -> Result<(), GpuError>;

    /// The current device.
    fn current_device(&self) -> DeviceId;

    /// Create a stream on the current device.
    fn stream_create(&mut self) -> Result<StreamId, GpuError>;

    /// Destroy a stream. Work already queued on it still completes.
    fn stream_destroy(&mut self, stream: StreamId) -> Result<(), GpuError>;

    /// Create an event on the current device.
    fn event_create(&mut self) -> Result<EventId, GpuError>;

    fn event_destroy(&mut self, event: EventId) -> Result<(), GpuError>;

    /// Queue a host-to-device copy of `src` to `dst[dst_offset..]`.
    ///
    /// `dst` must be memory of the current device; `stream` must belong to
    /// the current device. `None` selects the device's default stream.
    fn memcpy_htod_async(
        &mut self,
        dst: &Buffer,
        dst_offset: usize,
        src: &[u8],
        stream: Option<StreamId>,
    ) -> Result<(), GpuError>;

    /// Capture the work currently queued on `stream` in `event`.
    fn event_record(&mut self, event: EventId, stream: StreamId) -> Result<(), GpuError>;

    /// Non-blockingly check whether the work captured by `event` has finished.
    fn event_query(&mut self, event: EventId) -> Result<EventStatus, GpuError>;

    /// Block until all work on the current device has finished.
    fn device_synchronize(&mut self) -> Result<(), GpuError>;
}
