use std::collections::{HashMap, VecDeque};

use super::*;

/// A queued host-to-device copy.
struct PendingCopy {
    dst: Buffer,
    offset: usize,
    data: Vec<u8>,
}

/// In-order work queue of one stream.
#[derive(Default)]
struct Queue {
    pending: VecDeque<PendingCopy>,
    submitted: u64,
    completed: u64,
}

impl Queue {
    fn push(&mut self, copy: PendingCopy) {
        self.pending.push_back(copy);
        self.submitted += 1;
    }

    /// Complete up to `n` queued copies in order.
    fn advance(&mut self, n: usize) -> Result<(), GpuError> {
        for _ in 0..n {
            let Some(copy) = self.pending.pop_front() else {
                break;
            };
            copy.dst.write_at(copy.offset, &copy.data)?;
            self.completed += 1;
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<(), GpuError> {
        self.advance(self.pending.len())
    }
}

struct Stream {
    device: DeviceId,
    queue: Queue,
}

struct Event {
    device: DeviceId,
    /// Stream and submission count captured by the last record.
    recorded: Option<(StreamId, u64)>,
}

/// A GPU runtime backed by host memory.
///
/// Device memory is ordinary [`Buffer`]s tagged with [`MemKind::Gpu`].
/// Copies are queued per stream and only land when the stream makes
/// progress: every [`GpuRuntime::event_query`] advances the recorded stream by
/// [`HostGpu::with_progress`] copies, and [`GpuRuntime::device_synchronize`] drains
/// every stream of the current device. This keeps the asynchronous ordering
/// observable without real hardware.
pub struct HostGpu {
    /// Default stream of every device.
    defaults: Vec<Queue>,
    streams: HashMap<StreamId, Stream>,
    events: HashMap<EventId, Event>,
    current: DeviceId,
    next_id: u32,
    progress: usize,
}

impl HostGpu {
    /// Create a runtime with `devices` devices; device 0 is current.
    pub fn new(devices: u32) -> Self {
        Self {
            defaults: (0..devices).map(|_| Queue::default()).collect(),
            streams: HashMap::new(),
            events: HashMap::new(),
            current: 0,
            next_id: 1,
            progress: 1,
        }
    }

    /// Set how many queued copies each event query completes.
    pub fn with_progress(mut self, copies_per_query: usize) -> Self {
        self.progress = copies_per_query.max(1);
        self
    }

    /// Number of copies queued but not yet completed, over all devices.
    pub fn in_flight(&self) -> usize {
        self.defaults.iter().map(|q| q.pending.len()).sum::<usize>()
            + self.streams.values().map(|s| s.queue.pending.len()).sum::<usize>()
    }

    /// Number of live streams and events.
    pub fn live_handles(&self) -> (usize, usize) {
        (self.streams.len(), self.events.len())
    }

    fn fresh_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check_device(&self, owner: DeviceId, what: impl fmt::Display) -> Result<(), GpuError> {
        if owner == self.current {
            Ok(())
        } else {
            Err(GpuError::WrongDevice {
                what: what.to_string(),
                owner,
                current: self.current,
            })
        }
    }
}

impl GpuRuntime for HostGpu {
    fn device_count(&self) -> u32 {
        self.defaults.len() as u32
    }

    fn set_device(&mut self, dev: DeviceId) -> Result<(), GpuError> {
        if dev >= self.device_count() {
            return Err(GpuError::InvalidDevice(dev));
        }
        self.current = dev;
        Ok(())
    }

    fn current_device(&self) -> DeviceId {
        self.current
    }

    fn stream_create(&mut self) -> Result<StreamId, GpuError> {
        let id = StreamId(self.fresh_id());
        self.streams.insert(
            id,
            Stream {
                device: self.current,
                queue: Queue::default(),
            },
        );
        Ok(id)
    }

    fn stream_destroy(&mut self, stream: StreamId) -> Result<(), GpuError> {
        let mut s = self
            .streams
            .remove(&stream)
            .ok_or(GpuError::InvalidStream(stream))?;
        s.queue.drain()
    }

    fn event_create(&mut self) -> Result<EventId, GpuError> {
        let id = EventId(self.fresh_id());
        self.events.insert(
            id,
            Event {
                device: self.current,
                recorded: None,
            },
        );
        Ok(id)
    }

    fn event_destroy(&mut self, event: EventId) -> Result<(), GpuError> {
        self.events
            .remove(&event)
            .map(|_| ())
            .ok_or(GpuError::InvalidEvent(event))
    }

    fn memcpy_htod_async(
        &mut self,
        dst: &Buffer,
        dst_offset: usize,
        src: &[u8],
        stream: Option<StreamId>,
    ) -> Result<(), GpuError> {
        if dst.kind() != MemKind::Gpu(self.current) {
            return Err(GpuError::NotDeviceMemory {
                dst: dst.kind(),
                current: self.current,
            });
        }
        let len = dst.len();
        if dst_offset + src.len() > len {
            return Err(OutOfBounds {
                start: dst_offset,
                end: dst_offset + src.len(),
                len,
            }
            .into());
        }

        let copy = PendingCopy {
            dst: dst.clone(),
            offset: dst_offset,
            data: src.to_vec(),
        };
        match stream {
            Some(id) => {
                let current = self.current;
                let s = self
                    .streams
                    .get_mut(&id)
                    .ok_or(GpuError::InvalidStream(id))?;
                if s.device != current {
                    return Err(GpuError::WrongDevice {
                        what: id.to_string(),
                        owner: s.device,
                        current,
                    });
                }
                s.queue.push(copy);
            }
            None => self
                .defaults
                .get_mut(self.current as usize)
                .ok_or(GpuError::InvalidDevice(self.current))?
                .push(copy),
        }
        Ok(())
    }

    fn event_record(&mut self, event: EventId, stream: StreamId) -> Result<(), GpuError> {
        let (s_dev, submitted) = self
            .streams
            .get(&stream)
            .map(|s| (s.device, s.queue.submitted))
            .ok_or(GpuError::InvalidStream(stream))?;
        self.check_device(s_dev, stream)?;

        let e = self
            .events
            .get_mut(&event)
            .ok_or(GpuError::InvalidEvent(event))?;
        if e.device != s_dev {
            return Err(GpuError::WrongDevice {
                what: event.to_string(),
                owner: e.device,
                current: s_dev,
            });
        }
        e.recorded = Some((stream, submitted));
        Ok(())
    }

    fn event_query(&mut self, event: EventId) -> Result<EventStatus, GpuError> {
        let e = self
            .events
            .get(&event)
            .ok_or(GpuError::InvalidEvent(event))?;
        let Some((stream, seq)) = e.recorded else {
            return Ok(EventStatus::Ready);
        };

        // A destroyed stream has already drained.
        let Some(s) = self.streams.get_mut(&stream) else {
            return Ok(EventStatus::Ready);
        };
        if s.queue.completed < seq {
            s.queue.advance(self.progress)?;
        }
        Ok(if s.queue.completed >= seq {
            EventStatus::Ready
        } else {
            EventStatus::NotReady
        })
    }

    fn device_synchronize(&mut self) -> Result<(), GpuError> {
        let current = self.current;
        self.defaults
            .get_mut(current as usize)
            .ok_or(GpuError::InvalidDevice(current))?
            .drain()?;
        for s in self.streams.values_mut().filter(|s| s.device == current) {
            s.queue.drain()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu_buf(dev: u32, len: usize) -> Buffer {
        Buffer::new(0x1000 * (dev as u64 + 1), MemKind::Gpu(dev), len)
    }

    #[test]
    fn test_set_device() {
        let mut gpu = HostGpu::new(4);
        assert!(gpu.set_device(3).is_ok());
        assert_eq!(gpu.current_device(), 3);
        assert!(matches!(gpu.set_device(4), Err(GpuError::InvalidDevice(4))));
        assert_eq!(gpu.current_device(), 3);
    }

    #[test]
    fn test_copy_lands_on_sync() {
        let mut gpu = HostGpu::new(2);
        let dst = gpu_buf(1, 16);
        gpu.set_device(1).unwrap();
        let s = gpu.stream_create().unwrap();

        gpu.memcpy_htod_async(&dst, 4, &[9; 4], Some(s)).unwrap();
        gpu.memcpy_htod_async(&dst, 8, &[8; 4], None).unwrap();
        assert_eq!(gpu.in_flight(), 2);
        assert_eq!(dst.to_vec(4, 8).unwrap(), vec![0; 8]);

        gpu.device_synchronize().unwrap();
        assert_eq!(gpu.in_flight(), 0);
        assert_eq!(dst.to_vec(4, 8).unwrap(), [[9; 4], [8; 4]].concat());
    }

    #[test]
    fn test_event_query_progresses() {
        let mut gpu = HostGpu::new(1);
        let dst = gpu_buf(0, 64);
        let s = gpu.stream_create().unwrap();
        let e = gpu.event_create().unwrap();

        assert_eq!(gpu.event_query(e).unwrap(), EventStatus::Ready);
        for i in 0..3 {
            gpu.memcpy_htod_async(&dst, i * 4, &[1; 4], Some(s)).unwrap();
        }
        gpu.event_record(e, s).unwrap();

        assert_eq!(gpu.event_query(e).unwrap(), EventStatus::NotReady);
        assert_eq!(gpu.event_query(e).unwrap(), EventStatus::NotReady);
        assert_eq!(gpu.event_query(e).unwrap(), EventStatus::Ready);
        assert_eq!(dst.to_vec(0, 12).unwrap(), vec![1; 12]);
    }

    #[test]
    fn test_wrong_device() {
        let mut gpu = HostGpu::new(2);
        let dst = gpu_buf(1, 16);
        let s0 = gpu.stream_create().unwrap();
        assert!(matches!(
            gpu.memcpy_htod_async(&dst, 0, &[0; 4], None),
            Err(GpuError::NotDeviceMemory { .. })
        ));

        gpu.set_device(1).unwrap();
        assert!(matches!(
            gpu.memcpy_htod_async(&dst, 0, &[0; 4], Some(s0)),
            Err(GpuError::WrongDevice { owner: 0, current: 1, .. })
        ));
        assert!(matches!(
            gpu.memcpy_htod_async(&dst, 14, &[0; 4], None),
            Err(GpuError::OutOfBounds(_))
        ));
    }

    #[test]
    fn test_destroyed_handles() {
        let mut gpu = HostGpu::new(1);
        let dst = gpu_buf(0, 8);
        let s = gpu.stream_create().unwrap();
        let e = gpu.event_create().unwrap();
        gpu.memcpy_htod_async(&dst, 0, &[5; 8], Some(s)).unwrap();

        gpu.stream_destroy(s).unwrap();
        assert_eq!(dst.to_vec(0, 8).unwrap(), vec![5; 8]);
        assert!(matches!(
            gpu.stream_destroy(s),
            Err(GpuError::InvalidStream(_))
        ));
        assert!(matches!(
            gpu.event_record(e, s),
            Err(GpuError::InvalidStream(_))
        ));

        gpu.event_destroy(e).unwrap();
        assert!(matches!(gpu.event_query(e), Err(GpuError::InvalidEvent(_))));
        assert_eq!(gpu.live_handles(), (0, 0));
    }
}
