use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::encoder::{CodecParams, EncoderKind};
use crate::error::{PipelineError, Result};
use crate::pipeline::DEFAULT_QUEUE_CAPACITY;
use crate::video::{PixelFormat, Resolution, StartRetry, DEFAULT_BUFFER_COUNT, DEFAULT_START_ATTEMPTS};

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Video capture settings
    pub capture: CaptureConfig,
    /// Encoder settings
    pub encoder: CodecParams,
    /// Queue and output settings
    pub pipeline: OutputConfig,
}

/// Video capture configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Video device path (e.g., /dev/video0)
    pub device: PathBuf,
    /// Capture pixel format (YUYV or YVYU)
    pub pixel_format: PixelFormat,
    /// Resolution width, 0 to take the first size the device advertises
    pub width: u32,
    /// Resolution height, 0 to take the first size the device advertises
    pub height: u32,
    /// Number of mmap capture buffers
    pub buffer_count: u32,
    /// Stream-on attempts before giving up
    pub start_attempts: u32,
    /// Delay between stream-on attempts
    pub start_retry_delay_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/video0"),
            pixel_format: PixelFormat::Yuyv,
            width: 640,
            height: 480,
            buffer_count: DEFAULT_BUFFER_COUNT,
            start_attempts: DEFAULT_START_ATTEMPTS,
            start_retry_delay_ms: 200,
        }
    }
}

impl CaptureConfig {
    /// Requested size, `None` when the first advertised size should be used
    pub fn resolution(&self) -> Option<Resolution> {
        if self.width == 0 && self.height == 0 {
            None
        } else {
            Some(Resolution::new(self.width, self.height))
        }
    }

    pub fn start_retry(&self) -> StartRetry {
        StartRetry {
            attempts: self.start_attempts,
            delay: Duration::from_millis(self.start_retry_delay_ms),
        }
    }
}

/// Queue and output configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Capacity of the capture-to-encoder queue
    pub queue_capacity: usize,
    /// Output encoder (h264 or y4m)
    pub encoder: EncoderKind,
    /// Output file path
    pub output: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            encoder: EncoderKind::H264,
            output: PathBuf::from("capture.h264"),
        }
    }
}

impl PipelineConfig {
    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let capture = &self.capture;
        if capture.buffer_count == 0 {
            return Err(PipelineError::Config("buffer_count must be non-zero".to_string()));
        }
        if capture.start_attempts == 0 {
            return Err(PipelineError::Config("start_attempts must be non-zero".to_string()));
        }
        if (capture.width == 0) != (capture.height == 0) {
            return Err(PipelineError::Config(
                "width and height must both be set or both be 0".to_string(),
            ));
        }
        if let Some(resolution) = capture.resolution() {
            if !resolution.is_even() {
                return Err(PipelineError::OddDimensions {
                    width: resolution.width,
                    height: resolution.height,
                });
            }
        }
        if !capture.pixel_format.is_convertible() {
            return Err(PipelineError::Config(format!(
                "pixel format {} cannot be converted to YUV420",
                capture.pixel_format
            )));
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(PipelineError::Config("queue_capacity must be non-zero".to_string()));
        }
        self.encoder.validate()
    }
}
