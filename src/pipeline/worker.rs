//! Encode thread: drains the handoff queue through the encoder into the sink

use std::io::Write;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::queue::HandoffQueue;
use super::HandoffFrame;
use crate::encoder::{InputBufferPool, VideoEncoder};
use crate::sink::FrameSink;
use crate::utils::LogThrottler;
use crate::video::{CaptureDevice, CaptureDriver};

/// Encode thread statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Frames the encoder accepted
    pub frames_encoded: u64,
    /// Frames lost to encode or write failures
    pub frames_dropped: u64,
    /// Output units written to the sink
    pub units_written: u64,
    /// Bytes written to the sink, header included
    pub bytes_written: u64,
}

pub struct EncodeWorker<D: CaptureDriver, W: Write> {
    device: Arc<CaptureDevice<D>>,
    encoder: Box<dyn VideoEncoder>,
    inputs: Arc<InputBufferPool>,
    queue: Arc<HandoffQueue>,
    sink: FrameSink<W>,
    stats: WorkerStats,
    throttler: LogThrottler,
}

impl<D: CaptureDriver, W: Write> EncodeWorker<D, W> {
    pub fn new(
        device: Arc<CaptureDevice<D>>,
        encoder: Box<dyn VideoEncoder>,
        queue: Arc<HandoffQueue>,
        sink: FrameSink<W>,
    ) -> Self {
        Self {
            device,
            inputs: encoder.input_pool(),
            encoder,
            queue,
            sink,
            stats: WorkerStats::default(),
            throttler: LogThrottler::default(),
        }
    }

    /// Process frames until the queue is closed and drained.
    ///
    /// Returns the stats and the sink so the caller can flush or inspect it.
    pub fn run(mut self) -> (WorkerStats, FrameSink<W>) {
        info!("Encode worker started ({})", self.encoder.name());

        let header = self.encoder.header();
        match self.sink.write_header(&header) {
            Ok(n) => self.stats.bytes_written += n as u64,
            Err(e) => error!("Failed to write stream header: {}", e),
        }

        while let Some(frame) = self.queue.pop() {
            self.process(frame);
        }

        if let Err(e) = self.sink.flush() {
            warn!("Failed to flush output: {}", e);
        }
        // Nothing else will be consumed; unblock a producer that is still pushing
        self.queue.close();

        info!(
            "Encode worker stopped: {} encoded, {} dropped, {} bytes written",
            self.stats.frames_encoded, self.stats.frames_dropped, self.stats.bytes_written
        );
        (self.stats, self.sink)
    }

    fn process(&mut self, frame: HandoffFrame) {
        let HandoffFrame {
            capture_index,
            sequence,
            input,
        } = frame;

        let encoded = self.encoder.encode_one_frame(&input);
        self.inputs.release(input);

        // The capture buffer goes back to the driver whatever the encode outcome
        if let Err(e) = self.device.enqueue_empty(capture_index) {
            crate::error_throttled!(
                self.throttler,
                "enqueue",
                "Failed to return capture buffer {}: {}",
                capture_index,
                e
            );
        }

        if let Err(e) = encoded {
            crate::warn_throttled!(self.throttler, "encode", "Encode failed for frame {}: {}", sequence, e);
            self.stats.frames_dropped += 1;
            return;
        }
        self.stats.frames_encoded += 1;

        let output = match self.encoder.acquire_output_buffer() {
            Ok(Some(output)) => output,
            Ok(None) => {
                debug!("No output for frame {}", sequence);
                return;
            }
            Err(e) => {
                crate::warn_throttled!(
                    self.throttler,
                    "output",
                    "Failed to get encoder output for frame {}: {}",
                    sequence,
                    e
                );
                return;
            }
        };

        match self.sink.write_unit(&output) {
            Ok(n) => {
                self.stats.units_written += 1;
                self.stats.bytes_written += n as u64;
                self.throttler.clear("write");
            }
            Err(e) => {
                crate::error_throttled!(self.throttler, "write", "Failed to write frame {}: {}", sequence, e);
                self.stats.frames_dropped += 1;
            }
        }
        self.encoder.release_output_buffer(output);
    }
}
