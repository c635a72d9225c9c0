//! Uncompressed YUV4MPEG2 encoder
//!
//! Produces a stream any player or ffmpeg can read, with the same
//! header-then-segments shape as a hardware H.264 encoder: the stream header
//! once, then a `FRAME` marker segment and a payload segment per frame.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, info};

use super::traits::{EncoderConfig, InputBuffer, InputBufferPool, OutputUnit, VideoEncoder};
use crate::error::{PipelineError, Result};
use crate::video::format::PixelFormat;

const FRAME_MARKER: &[u8] = b"FRAME\n";

pub struct Y4mEncoder {
    config: EncoderConfig,
    pool: Arc<InputBufferPool>,
    pending: Option<OutputUnit>,
    frames: u64,
}

impl Y4mEncoder {
    pub fn new(config: EncoderConfig) -> Result<Self> {
        if config.input_format != PixelFormat::Yuv420 {
            return Err(PipelineError::Encoder(format!(
                "Y4M encoder needs YUV420 input, got {}",
                config.input_format
            )));
        }
        if config.output != config.input {
            return Err(PipelineError::Encoder(format!(
                "Y4M encoder cannot scale {} to {}",
                config.input, config.output
            )));
        }
        if config.input_stride != config.input.width {
            return Err(PipelineError::Encoder(format!(
                "Unsupported input stride {}",
                config.input_stride
            )));
        }
        config.params.validate()?;

        let pool = InputBufferPool::new(config.params.input_buffers, config.input);
        info!(
            "Y4M encoder ready: {}@{}fps, {} input buffers",
            config.output, config.params.framerate, config.params.input_buffers
        );
        Ok(Self {
            config,
            pool,
            pending: None,
            frames: 0,
        })
    }

    /// Frames encoded so far
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl VideoEncoder for Y4mEncoder {
    fn name(&self) -> &str {
        "y4m"
    }

    fn config(&self) -> &EncoderConfig {
        &self.config
    }

    fn header(&self) -> Bytes {
        Bytes::from(format!(
            "YUV4MPEG2 W{} H{} F{}:1 Ip A1:1 C420jpeg\n",
            self.config.output.width, self.config.output.height, self.config.params.framerate
        ))
    }

    fn input_pool(&self) -> Arc<InputBufferPool> {
        self.pool.clone()
    }

    fn encode_one_frame(&mut self, input: &InputBuffer) -> Result<()> {
        let luma = self.config.input.pixels() as usize;
        if input.y.len() != luma || input.c.len() != luma / 2 {
            return Err(PipelineError::Encoder(format!(
                "Input buffer {} has wrong plane sizes {}+{}",
                input.id(),
                input.y.len(),
                input.c.len()
            )));
        }
        if self.pending.is_some() {
            return Err(PipelineError::Encoder(
                "Previous output was not retrieved".to_string(),
            ));
        }

        let mut payload = BytesMut::with_capacity(input.y.len() + input.c.len());
        payload.extend_from_slice(&input.y);
        payload.extend_from_slice(&input.c);
        self.pending = Some(OutputUnit {
            segments: vec![Bytes::from_static(FRAME_MARKER), payload.freeze()],
        });
        self.frames += 1;
        Ok(())
    }

    fn acquire_output_buffer(&mut self) -> Result<Option<OutputUnit>> {
        Ok(self.pending.take())
    }

    fn release_output_buffer(&mut self, output: OutputUnit) {
        debug!("Released output unit of {} bytes", output.len());
    }
}
