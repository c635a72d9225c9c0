//! Capture-to-encoder pipeline
//!
//! The capture loop runs on the calling thread and converts each frame into
//! an encoder input buffer. Converted frames cross a bounded queue to the
//! encode thread, which drives the encoder, writes the output and hands the
//! capture buffer back to the driver.

pub mod handler;
pub mod queue;
pub mod worker;

use std::io::Write;
use std::sync::Arc;
use std::thread;

use tracing::{error, info};

pub use handler::EncodeFrameHandler;
pub use queue::{HandoffQueue, DEFAULT_QUEUE_CAPACITY};
pub use worker::{EncodeWorker, WorkerStats};

use crate::encoder::{InputBuffer, VideoEncoder};
use crate::error::{PipelineError, Result};
use crate::sink::FrameSink;
use crate::state::PipelineState;
use crate::video::{
    CaptureDevice, CaptureDriver, CaptureLoop, LoopStats, PixelConverter, StartRetry,
};

/// A converted frame on its way to the encoder
#[derive(Debug)]
pub struct HandoffFrame {
    /// Capture buffer still held for this frame
    pub capture_index: u32,
    /// Driver sequence number of the capture
    pub sequence: u32,
    /// Populated encoder input buffer
    pub input: InputBuffer,
}

/// Outcome of one pipeline run
#[derive(Debug)]
pub struct PipelineReport {
    pub capture: LoopStats,
    /// Frames dropped before reaching the queue
    pub capture_dropped: u64,
    pub worker: WorkerStats,
    /// Error that ended the capture loop, if it did not stop on request
    pub error: Option<PipelineError>,
}

/// Shared context of one capture-to-encoder run
pub struct Pipeline<D: CaptureDriver + 'static> {
    device: Arc<CaptureDevice<D>>,
    encoder: Box<dyn VideoEncoder>,
    queue: Arc<HandoffQueue>,
    converter: PixelConverter,
    retry: StartRetry,
}

impl<D: CaptureDriver + 'static> Pipeline<D> {
    /// Bind a negotiated device to an encoder
    pub fn new(
        device: Arc<CaptureDevice<D>>,
        encoder: Box<dyn VideoEncoder>,
        queue_capacity: usize,
        retry: StartRetry,
    ) -> Result<Self> {
        let format = device.format().ok_or(PipelineError::NotNegotiated)?;
        let pixel_format = format.pixel_format().ok_or_else(|| {
            PipelineError::UnsupportedFormat(format!("Unknown pixel format {}", format.fourcc))
        })?;
        let converter = PixelConverter::for_format(pixel_format, format.resolution())?;

        let input = encoder.config().input;
        if input != format.resolution() {
            return Err(PipelineError::Encoder(format!(
                "Encoder input {} does not match capture {}",
                input,
                format.resolution()
            )));
        }

        Ok(Self {
            device,
            encoder,
            queue: Arc::new(HandoffQueue::new(queue_capacity)),
            converter,
            retry,
        })
    }

    pub fn device(&self) -> &Arc<CaptureDevice<D>> {
        &self.device
    }

    pub fn state(&self) -> &Arc<PipelineState> {
        self.device.state()
    }

    /// Run capture on this thread and encoding on a worker thread until the
    /// looping flag is cleared or capture fails.
    pub fn run<W>(self, sink: FrameSink<W>) -> Result<(PipelineReport, FrameSink<W>)>
    where
        W: Write + Send + 'static,
    {
        let Pipeline {
            device,
            encoder,
            queue,
            converter,
            retry,
        } = self;

        let inputs = encoder.input_pool();
        let worker = EncodeWorker::new(device.clone(), encoder, queue.clone(), sink);
        let encode_thread = thread::Builder::new()
            .name("encode".to_string())
            .spawn(move || worker.run())?;

        let mut handler = EncodeFrameHandler::new(device.clone(), converter, inputs, queue.clone());
        let mut capture = CaptureLoop::new(device.clone(), retry);
        let result = capture.run(&mut handler);

        // Terminal drain: the worker finishes what is queued, then exits
        queue.close();
        let (worker_stats, sink) = encode_thread
            .join()
            .map_err(|_| PipelineError::Encoder("encode thread panicked".to_string()))?;

        let error = match result {
            Ok(_) => None,
            Err(e) => {
                error!("Capture ended with error: {}", e);
                Some(e)
            }
        };
        info!(
            "Pipeline finished: {} captured, {} encoded",
            capture.stats().frames_captured,
            worker_stats.frames_encoded
        );

        Ok((
            PipelineReport {
                capture: capture.stats().clone(),
                capture_dropped: handler.frames_dropped(),
                worker: worker_stats,
                error,
            },
            sink,
        ))
    }
}
