//! Blocking capture loop
//!
//! Dequeues filled buffers and hands each one to a [`FrameHandler`] on the
//! calling thread. The loop never dequeues the next buffer before the handler
//! returns, and checks the looping flag only between frames.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, error, info};

use super::buffer::CaptureBuffer;
use super::device::{CaptureDevice, StartRetry};
use super::driver::CaptureDriver;
use crate::error::Result;

/// Capture loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Not running
    Idle,
    /// Starting kernel streaming
    Starting,
    /// Dequeuing frames
    Running,
    /// Stopping kernel streaming
    Stopping,
}

/// Receiver of captured frames.
///
/// `on_frame` runs synchronously on the capture thread while the buffer is
/// user-owned. `frame_done` follows once `data` is no longer borrowed; a
/// handler that does not keep the buffer returns it to the device there.
pub trait FrameHandler {
    fn on_frame(&mut self, buffer: &CaptureBuffer, data: &[u8]);

    fn frame_done(&mut self, _buffer: &CaptureBuffer) {}
}

/// Capture statistics
#[derive(Debug, Clone, Default)]
pub struct LoopStats {
    /// Frames dequeued and handed to the handler
    pub frames_captured: u64,
    /// Bytes handed to the handler
    pub bytes_captured: u64,
    /// Frame rate over the last completed one-second window
    pub current_fps: f32,
}

pub struct CaptureLoop<D: CaptureDriver> {
    device: Arc<CaptureDevice<D>>,
    retry: StartRetry,
    state: Arc<RwLock<LoopState>>,
    stats: LoopStats,
}

impl<D: CaptureDriver> CaptureLoop<D> {
    pub fn new(device: Arc<CaptureDevice<D>>, retry: StartRetry) -> Self {
        Self {
            device,
            retry,
            state: Arc::new(RwLock::new(LoopState::Idle)),
            stats: LoopStats::default(),
        }
    }

    pub fn state(&self) -> LoopState {
        *self.state.read()
    }

    /// Shared view of the loop state for other threads
    pub fn state_handle(&self) -> Arc<RwLock<LoopState>> {
        self.state.clone()
    }

    /// Statistics of the last (or current) run
    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    fn set_state(&self, state: LoopState) {
        *self.state.write() = state;
    }

    /// Run until the looping flag is cleared or a dequeue fails.
    ///
    /// A dequeue failure is fatal: streaming is stopped and the error is
    /// returned. Stats of the failed run stay available through [`stats`].
    ///
    /// [`stats`]: CaptureLoop::stats
    pub fn run<H: FrameHandler>(&mut self, handler: &mut H) -> Result<LoopStats> {
        self.stats = LoopStats::default();
        let state = self.device.state().clone();

        if !self.device.is_started() {
            self.set_state(LoopState::Starting);
            if let Err(e) = self.device.start_streaming_with_retry(&self.retry) {
                state.end_loop();
                self.set_state(LoopState::Idle);
                return Err(e);
            }
        }

        // A stop requested while streaming was starting wins over looping
        if state.begin_loop() {
            self.set_state(LoopState::Running);
            info!("Capture started");
        } else {
            info!("Stop requested before capture started");
        }

        let mut fps_frame_count = 0u64;
        let mut fps_window_start = Instant::now();
        let fps_window = Duration::from_secs(1);

        let mut outcome = Ok(());
        while state.is_looping() {
            let buffer = match self.device.dequeue_filled() {
                Ok(buffer) => buffer,
                Err(e) => {
                    error!("Capture error: {}", e);
                    outcome = Err(e);
                    break;
                }
            };

            let read = self.device.read_buffer(&buffer, |data| {
                handler.on_frame(&buffer, data);
                data.len()
            });
            handler.frame_done(&buffer);
            match read {
                Ok(len) => {
                    self.stats.frames_captured += 1;
                    self.stats.bytes_captured += len as u64;
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }

            fps_frame_count += 1;
            let elapsed = fps_window_start.elapsed();
            if elapsed >= fps_window {
                self.stats.current_fps = fps_frame_count as f32 / elapsed.as_secs_f32();
                fps_frame_count = 0;
                fps_window_start = Instant::now();
            }
        }

        debug!("Capture loop leaving after {} frames", self.stats.frames_captured);
        self.set_state(LoopState::Stopping);
        // Best-effort; stop failures are already logged by the device
        let _ = self.device.stop_streaming();
        state.end_loop();
        self.set_state(LoopState::Idle);
        info!("Capture stopped");

        outcome.map(|()| self.stats.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::state::PipelineState;
    use crate::video::format::{CaptureFormat, PixelFormat, Resolution};
    use crate::video::testing::{MockDriver, MockEvent};

    fn device(driver: MockDriver) -> Arc<CaptureDevice<MockDriver>> {
        let dev = CaptureDevice::with_driver(driver, "mock", 3, PipelineState::new()).unwrap();
        dev.negotiate(&CaptureFormat::request(PixelFormat::Yuyv, Resolution::new(4, 2)))
            .unwrap();
        Arc::new(dev)
    }

    fn no_delay() -> StartRetry {
        StartRetry {
            attempts: 5,
            delay: Duration::ZERO,
        }
    }

    /// Returns every buffer right away and records what it saw
    struct Recycler {
        device: Arc<CaptureDevice<MockDriver>>,
        seen: Vec<(u32, u8)>,
        stop_after: Option<usize>,
        loop_state: Option<Arc<RwLock<LoopState>>>,
    }

    impl Recycler {
        fn new(device: Arc<CaptureDevice<MockDriver>>) -> Self {
            Self {
                device,
                seen: Vec::new(),
                stop_after: None,
                loop_state: None,
            }
        }
    }

    impl FrameHandler for Recycler {
        fn on_frame(&mut self, buffer: &CaptureBuffer, data: &[u8]) {
            if let Some(state) = &self.loop_state {
                assert_eq!(*state.read(), LoopState::Running);
            }
            self.seen.push((buffer.index, data[0]));
            if self.stop_after == Some(self.seen.len()) {
                self.device.state().request_stop();
                // The loop must not move on while the handler is still running
                assert!(self.device.is_started());
            }
        }

        fn frame_done(&mut self, buffer: &CaptureBuffer) {
            self.device.enqueue_empty(buffer.index).unwrap();
        }
    }

    #[test]
    fn test_buffers_cycle_in_ring_order() {
        let dev = device(MockDriver::new().with_frames(10));
        let mut capture = CaptureLoop::new(dev.clone(), no_delay());
        let mut handler = Recycler::new(dev.clone());

        let err = capture.run(&mut handler).unwrap_err();
        assert!(matches!(err, PipelineError::Dequeue(_)));
        assert_eq!(capture.stats().frames_captured, 10);
        assert_eq!(capture.state(), LoopState::Idle);
        assert!(!dev.is_started());

        let indices: Vec<u32> = handler.seen.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![0, 1, 2, 0, 1, 2, 0, 1, 2, 0]);
        for (index, first) in &handler.seen {
            assert_eq!(*first, dev.driver().pattern_byte(*index, 0));
        }

        // Every re-dequeue of a slot is preceded by its enqueue
        let events = dev.driver().events();
        let mut queued = [false; 3];
        for event in events {
            match event {
                MockEvent::Queued(i) => {
                    assert!(!queued[i as usize]);
                    queued[i as usize] = true;
                }
                MockEvent::Dequeued(i) => {
                    assert!(queued[i as usize], "slot {} reused before release", i);
                    queued[i as usize] = false;
                }
                // Stream-off empties the driver queue
                MockEvent::StreamOff => queued = [false; 3],
                _ => {}
            }
        }
    }

    #[test]
    fn test_stop_request_ends_loop_after_handler() {
        let dev = device(MockDriver::new());
        let mut capture = CaptureLoop::new(dev.clone(), no_delay());
        let mut handler = Recycler::new(dev.clone());
        handler.stop_after = Some(1);
        handler.loop_state = Some(capture.state_handle());

        let stats = capture.run(&mut handler).unwrap();
        assert_eq!(stats.frames_captured, 1);
        assert_eq!(stats.bytes_captured, 4 * 2 * 2);
        assert_eq!(handler.seen.len(), 1);
        assert!(!dev.is_started());
        assert!(!dev.state().is_looping());
        // Stream-off, then the whole ring is queued again for the next start
        let events = dev.driver().events();
        assert_eq!(
            &events[events.len() - 4..],
            &[
                MockEvent::StreamOff,
                MockEvent::Queued(0),
                MockEvent::Queued(1),
                MockEvent::Queued(2),
            ]
        );
    }

    #[test]
    fn test_loop_runs_again_after_stop() {
        let dev = device(MockDriver::new());
        let mut capture = CaptureLoop::new(dev.clone(), no_delay());
        let mut handler = Recycler::new(dev.clone());
        handler.stop_after = Some(1);

        assert_eq!(capture.run(&mut handler).unwrap().frames_captured, 1);
        assert_eq!(capture.state(), LoopState::Idle);
        assert_eq!(dev.driver().queued(), vec![0, 1, 2]);

        handler.stop_after = Some(3);
        let stats = capture.run(&mut handler).unwrap();
        assert_eq!(stats.frames_captured, 2);
        let indices: Vec<u32> = handler.seen.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![0, 0, 1]);
        assert_eq!(dev.driver().stream_on_calls(), 2);
        assert_eq!(dev.user_owned_count(), 0);
    }

    #[test]
    fn test_stop_before_start_captures_nothing() {
        let dev = device(MockDriver::new());
        let mut capture = CaptureLoop::new(dev.clone(), no_delay());
        let mut handler = Recycler::new(dev.clone());

        dev.state().request_stop();
        let stats = capture.run(&mut handler).unwrap();
        assert_eq!(stats.frames_captured, 0);
        assert!(handler.seen.is_empty());
        assert!(!dev.is_started());
        assert!(!dev.state().is_stop_requested());
        assert_eq!(capture.state(), LoopState::Idle);
    }

    #[test]
    fn test_start_failure_leaves_loop_idle() {
        let dev = device(MockDriver::new().fail_stream_on(5));
        let mut capture = CaptureLoop::new(dev.clone(), no_delay());
        let mut handler = Recycler::new(dev.clone());

        let err = capture.run(&mut handler).unwrap_err();
        assert!(matches!(err, PipelineError::StreamOn { attempts: 5, .. }));
        assert_eq!(capture.state(), LoopState::Idle);
        assert!(handler.seen.is_empty());
        assert!(!dev.state().is_looping());
    }

    #[test]
    fn test_transient_start_failures_are_retried() {
        let dev = device(MockDriver::new().fail_stream_on(2));
        let mut capture = CaptureLoop::new(dev.clone(), no_delay());
        let mut handler = Recycler::new(dev.clone());
        handler.stop_after = Some(3);

        let stats = capture.run(&mut handler).unwrap();
        assert_eq!(stats.frames_captured, 3);
        assert_eq!(dev.driver().stream_on_calls(), 3);
    }
}
