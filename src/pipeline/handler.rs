//! Capture-thread side of the pipeline: convert and hand off

use std::sync::Arc;

use tracing::{debug, warn};

use super::queue::HandoffQueue;
use super::HandoffFrame;
use crate::encoder::InputBufferPool;
use crate::utils::LogThrottler;
use crate::video::{CaptureBuffer, CaptureDevice, CaptureDriver, FrameHandler, PixelConverter};

/// Converts every captured frame into an encoder input buffer and queues it
/// for the encode thread.
///
/// On success the capture buffer stays user-owned until the worker has
/// consumed the frame. Frames that cannot be handed off (no free input
/// buffer, short frame, queue closed) give their capture buffer back as soon
/// as the loop is done with it.
pub struct EncodeFrameHandler<D: CaptureDriver> {
    device: Arc<CaptureDevice<D>>,
    converter: PixelConverter,
    inputs: Arc<InputBufferPool>,
    queue: Arc<HandoffQueue>,
    release_now: bool,
    frames_dropped: u64,
    throttler: LogThrottler,
}

impl<D: CaptureDriver> EncodeFrameHandler<D> {
    pub fn new(
        device: Arc<CaptureDevice<D>>,
        converter: PixelConverter,
        inputs: Arc<InputBufferPool>,
        queue: Arc<HandoffQueue>,
    ) -> Self {
        Self {
            device,
            converter,
            inputs,
            queue,
            release_now: false,
            frames_dropped: 0,
            throttler: LogThrottler::default(),
        }
    }

    /// Frames dropped on the capture side
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    fn drop_frame(&mut self) {
        self.frames_dropped += 1;
        self.release_now = true;
    }
}

impl<D: CaptureDriver> FrameHandler for EncodeFrameHandler<D> {
    fn on_frame(&mut self, buffer: &CaptureBuffer, data: &[u8]) {
        let expected = crate::video::convert::yuyv_buffer_size(self.converter.resolution());
        if data.len() < expected {
            crate::warn_throttled!(
                self.throttler,
                "short_frame",
                "Dropping short frame: {} < {} bytes (buffer {})",
                data.len(),
                expected,
                buffer.index
            );
            self.drop_frame();
            return;
        }

        let Some(mut input) = self.inputs.acquire() else {
            crate::warn_throttled!(
                self.throttler,
                "no_input_buffer",
                "No free encoder input buffer, dropping frame {}",
                buffer.sequence
            );
            self.drop_frame();
            return;
        };

        let (y, c) = input.planes_mut();
        self.converter.convert(data, y, c);

        let frame = HandoffFrame {
            capture_index: buffer.index,
            sequence: buffer.sequence,
            input,
        };
        if let Err(frame) = self.queue.push(frame) {
            debug!("Handoff queue closed, stopping capture");
            self.inputs.release(frame.input);
            self.drop_frame();
            self.device.state().request_stop();
        }
    }

    fn frame_done(&mut self, buffer: &CaptureBuffer) {
        if !std::mem::take(&mut self.release_now) {
            return;
        }
        if let Err(e) = self.device.enqueue_empty(buffer.index) {
            warn!("Failed to return dropped buffer {}: {}", buffer.index, e);
        }
    }
}
