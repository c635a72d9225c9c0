//! In-memory capture driver for tests
//!
//! Behaves like a strict V4L2 mmap device: buffers must be granted before
//! they are mapped or queued, a queued buffer cannot be queued again, and
//! dequeue only works while streaming. The format cannot change while
//! buffers are granted. Filled buffers come back in queue order.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use v4l::FourCC;

use super::driver::{CaptureDriver, DequeuedBuffer, DeviceCapabilities, FormatDesc, MappedRegion};
use super::format::Resolution;

const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// Driver calls recorded by [`MockDriver`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockEvent {
    Queued(u32),
    Dequeued(u32),
    StreamOn,
    StreamOff,
}

struct MockState {
    capture_capable: bool,
    formats: Vec<(FormatDesc, Vec<Resolution>)>,
    custom_formats: bool,
    current: (FourCC, Resolution),
    rewrite: Option<(FourCC, Resolution)>,
    granted: u32,
    fail_map_at: Option<u32>,
    fail_next_queue: bool,
    stream_on_failures: u32,
    stream_on_calls: u32,
    enum_format_calls: u32,
    streaming: bool,
    queued: VecDeque<u32>,
    frames_remaining: Option<usize>,
    sequence: u32,
    events: Vec<MockEvent>,
}

pub struct MockDriver {
    state: Mutex<MockState>,
    ready: Condvar,
    live_regions: Arc<AtomicUsize>,
}

impl MockDriver {
    /// A capture device advertising YUYV at 640x480 and 1280x720
    pub fn new() -> Self {
        let yuyv = FourCC::new(b"YUYV");
        Self {
            state: Mutex::new(MockState {
                capture_capable: true,
                formats: vec![(
                    FormatDesc {
                        fourcc: yuyv,
                        description: "YUYV 4:2:2".to_string(),
                    },
                    vec![Resolution::VGA, Resolution::HD720],
                )],
                custom_formats: false,
                current: (yuyv, Resolution::VGA),
                rewrite: None,
                granted: 0,
                fail_map_at: None,
                fail_next_queue: false,
                stream_on_failures: 0,
                stream_on_calls: 0,
                enum_format_calls: 0,
                streaming: false,
                queued: VecDeque::new(),
                frames_remaining: None,
                sequence: 0,
                events: Vec::new(),
            }),
            ready: Condvar::new(),
            live_regions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Advertise a pixel format. The first call replaces the default list.
    pub fn with_format(self, fourcc: &[u8; 4], description: &str, sizes: &[(u32, u32)]) -> Self {
        {
            let mut state = self.state.lock();
            if !state.custom_formats {
                state.formats.clear();
                state.custom_formats = true;
            }
            state.formats.push((
                FormatDesc {
                    fourcc: FourCC::new(fourcc),
                    description: description.to_string(),
                },
                sizes.iter().map(|&s| Resolution::from(s)).collect(),
            ));
        }
        self
    }

    /// Preconfigure the current format size (buffer length is w*h*2)
    pub fn with_resolution(self, resolution: Resolution) -> Self {
        self.state.lock().current.1 = resolution;
        self
    }

    pub fn without_capture(self) -> Self {
        self.state.lock().capture_capable = false;
        self
    }

    /// Silently configure this format whatever is requested
    pub fn rewrite_format(self, fourcc: FourCC, resolution: Resolution) -> Self {
        self.state.lock().rewrite = Some((fourcc, resolution));
        self
    }

    pub fn fail_map_at(self, index: u32) -> Self {
        self.state.lock().fail_map_at = Some(index);
        self
    }

    /// Fail the next `count` stream-on calls
    pub fn fail_stream_on(self, count: u32) -> Self {
        self.state.lock().stream_on_failures = count;
        self
    }

    /// Deliver `count` frames, then fail every dequeue
    pub fn with_frames(self, count: usize) -> Self {
        self.state.lock().frames_remaining = Some(count);
        self
    }

    pub fn fail_next_queue(&self) {
        self.state.lock().fail_next_queue = true;
    }

    /// Indices currently queued with the driver, in queue order
    pub fn queued(&self) -> Vec<u32> {
        self.state.lock().queued.iter().copied().collect()
    }

    pub fn mapped_regions(&self) -> usize {
        self.live_regions.load(Ordering::SeqCst)
    }

    pub fn granted_buffers(&self) -> u32 {
        self.state.lock().granted
    }

    pub fn stream_on_calls(&self) -> u32 {
        self.state.lock().stream_on_calls
    }

    pub fn enum_format_calls(&self) -> u32 {
        self.state.lock().enum_format_calls
    }

    pub fn events(&self) -> Vec<MockEvent> {
        self.state.lock().events.clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.state.lock().streaming
    }

    /// Byte at `offset` of buffer `index`
    pub fn pattern_byte(&self, index: u32, offset: usize) -> u8 {
        pattern(index, offset)
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn pattern(index: u32, offset: usize) -> u8 {
    ((index as usize * 31 + offset * 7) % 251) as u8
}

fn einval(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("mock: {}", msg))
}

pub struct MockRegion {
    data: Vec<u8>,
    live: Arc<AtomicUsize>,
}

impl MappedRegion for MockRegion {
    fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for MockRegion {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl CaptureDriver for MockDriver {
    type Region = MockRegion;

    fn query_capabilities(&self) -> io::Result<DeviceCapabilities> {
        let state = self.state.lock();
        Ok(DeviceCapabilities {
            driver: "mock".to_string(),
            card: "Mock Camera".to_string(),
            video_capture: state.capture_capable,
            streaming: true,
        })
    }

    fn enum_format(&self, index: u32) -> io::Result<Option<FormatDesc>> {
        let mut state = self.state.lock();
        state.enum_format_calls += 1;
        Ok(state.formats.get(index as usize).map(|(d, _)| d.clone()))
    }

    fn enum_frame_sizes(&self, fourcc: FourCC) -> io::Result<Vec<Resolution>> {
        let state = self.state.lock();
        state
            .formats
            .iter()
            .find(|(d, _)| d.fourcc == fourcc)
            .map(|(_, sizes)| sizes.clone())
            .ok_or_else(|| einval("unknown pixel format"))
    }

    fn set_format(
        &self,
        fourcc: FourCC,
        resolution: Resolution,
    ) -> io::Result<(FourCC, Resolution)> {
        let mut state = self.state.lock();
        if state.streaming || state.granted > 0 {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        state.current = state.rewrite.unwrap_or((fourcc, resolution));
        Ok(state.current)
    }

    fn request_buffers(&self, count: u32) -> io::Result<u32> {
        let mut state = self.state.lock();
        if state.streaming {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        state.queued.clear();
        state.granted = count;
        Ok(count)
    }

    fn map_buffer(&self, index: u32) -> io::Result<MockRegion> {
        let state = self.state.lock();
        if index >= state.granted {
            return Err(einval("buffer not granted"));
        }
        if state.fail_map_at == Some(index) {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "mock: mmap failed"));
        }
        let len = state.current.1.pixels() as usize * 2;
        self.live_regions.fetch_add(1, Ordering::SeqCst);
        Ok(MockRegion {
            data: (0..len).map(|offset| pattern(index, offset)).collect(),
            live: self.live_regions.clone(),
        })
    }

    fn queue_buffer(&self, index: u32) -> io::Result<()> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_queue) {
            return Err(io::Error::new(io::ErrorKind::Other, "mock: queue failed"));
        }
        if index >= state.granted {
            return Err(einval("buffer not granted"));
        }
        if state.queued.contains(&index) {
            return Err(einval("buffer already queued"));
        }
        state.queued.push_back(index);
        state.events.push(MockEvent::Queued(index));
        self.ready.notify_all();
        Ok(())
    }

    fn dequeue_buffer(&self) -> io::Result<DequeuedBuffer> {
        let mut state = self.state.lock();
        if state.frames_remaining == Some(0) {
            return Err(io::Error::new(io::ErrorKind::Other, "mock: no more frames"));
        }
        loop {
            if !state.streaming {
                return Err(einval("not streaming"));
            }
            if let Some(index) = state.queued.pop_front() {
                if let Some(remaining) = state.frames_remaining.as_mut() {
                    *remaining -= 1;
                }
                let sequence = state.sequence;
                state.sequence += 1;
                state.events.push(MockEvent::Dequeued(index));
                return Ok(DequeuedBuffer {
                    index,
                    bytes_used: state.current.1.pixels() as usize * 2,
                    sequence,
                });
            }
            if self.ready.wait_for(&mut state, DEQUEUE_TIMEOUT).timed_out() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "mock: no buffer queued"));
            }
        }
    }

    fn stream_on(&self) -> io::Result<()> {
        let mut state = self.state.lock();
        state.stream_on_calls += 1;
        if state.stream_on_failures > 0 {
            state.stream_on_failures -= 1;
            return Err(io::Error::new(io::ErrorKind::Other, "mock: device busy"));
        }
        state.streaming = true;
        state.events.push(MockEvent::StreamOn);
        Ok(())
    }

    fn stream_off(&self) -> io::Result<()> {
        let mut state = self.state.lock();
        state.streaming = false;
        state.queued.clear();
        state.events.push(MockEvent::StreamOff);
        self.ready.notify_all();
        Ok(())
    }
}
