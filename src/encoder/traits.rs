//! Encoder traits and common types

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::video::convert::yuv420p_buffer_size;
use crate::video::format::{PixelFormat, Resolution};

/// Default number of encoder input buffers
pub const DEFAULT_INPUT_BUFFERS: usize = 4;

/// H.264 profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum H264Profile {
    Baseline,
    #[default]
    Main,
    High,
}

impl fmt::Display for H264Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            H264Profile::Baseline => write!(f, "baseline"),
            H264Profile::Main => write!(f, "main"),
            H264Profile::High => write!(f, "high"),
        }
    }
}

/// Fixed quantizer for I and P frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedQp {
    pub i: u8,
    pub p: u8,
}

/// Codec parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecParams {
    /// Target bitrate in bits per second
    pub bitrate: u32,
    /// Frames per second
    pub framerate: u32,
    /// Maximum distance between key frames
    pub max_key_interval: u32,
    pub profile: H264Profile,
    /// Level times ten (31 = 3.1)
    pub level: u8,
    pub qp_min: u8,
    pub qp_max: u8,
    pub fixed_qp: Option<FixedQp>,
    pub cabac: bool,
    /// Number of encoder input buffers
    pub input_buffers: usize,
}

impl Default for CodecParams {
    fn default() -> Self {
        Self {
            bitrate: 4_000_000,
            framerate: 30,
            max_key_interval: 30,
            profile: H264Profile::Main,
            level: 31,
            qp_min: 10,
            qp_max: 40,
            fixed_qp: Some(FixedQp { i: 20, p: 30 }),
            cabac: true,
            input_buffers: DEFAULT_INPUT_BUFFERS,
        }
    }
}

impl CodecParams {
    /// Check ranges that an encoder would reject at initialization
    pub fn validate(&self) -> Result<()> {
        if self.framerate == 0 {
            return Err(PipelineError::Config("framerate must be non-zero".to_string()));
        }
        if self.input_buffers == 0 {
            return Err(PipelineError::Config(
                "encoder input_buffers must be non-zero".to_string(),
            ));
        }
        if self.qp_min > self.qp_max || self.qp_max > 51 {
            return Err(PipelineError::Config(format!(
                "invalid QP range {}..{}",
                self.qp_min, self.qp_max
            )));
        }
        if let Some(qp) = self.fixed_qp {
            if qp.i > 51 || qp.p > 51 {
                return Err(PipelineError::Config(format!(
                    "invalid fixed QP I={} P={}",
                    qp.i, qp.p
                )));
            }
        }
        Ok(())
    }
}

/// Encoder configuration
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderConfig {
    /// Input frame size
    pub input: Resolution,
    /// Luma stride of the input planes in bytes
    pub input_stride: u32,
    /// Input pixel format
    pub input_format: PixelFormat,
    /// Output frame size
    pub output: Resolution,
    pub params: CodecParams,
}

impl EncoderConfig {
    /// Planar YUV420 input at the capture size, no scaling
    pub fn for_capture(resolution: Resolution, params: CodecParams) -> Self {
        Self {
            input: resolution,
            input_stride: resolution.width,
            input_format: PixelFormat::Yuv420,
            output: resolution,
            params,
        }
    }
}

/// One planar input frame owned by the encoder's pool
#[derive(Debug)]
pub struct InputBuffer {
    id: usize,
    /// Luma plane
    pub y: Vec<u8>,
    /// Chroma planes, U followed by V
    pub c: Vec<u8>,
}

impl InputBuffer {
    pub fn new(id: usize, resolution: Resolution) -> Self {
        let luma = resolution.pixels() as usize;
        Self {
            id,
            y: vec![0u8; luma],
            c: vec![0u8; yuv420p_buffer_size(resolution) - luma],
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn u_plane(&self) -> &[u8] {
        &self.c[..self.c.len() / 2]
    }

    pub fn v_plane(&self) -> &[u8] {
        &self.c[self.c.len() / 2..]
    }

    /// Luma and chroma planes for a converter to fill
    pub fn planes_mut(&mut self) -> (&mut [u8], &mut [u8]) {
        (&mut self.y, &mut self.c)
    }
}

/// Free list of encoder input buffers.
///
/// Shared between the capture thread (acquire) and the encode thread
/// (release). A buffer is owned by exactly one side at a time.
#[derive(Debug)]
pub struct InputBufferPool {
    free: Mutex<Vec<InputBuffer>>,
    capacity: usize,
}

impl InputBufferPool {
    pub fn new(count: usize, resolution: Resolution) -> Arc<Self> {
        // Reversed so buffer 0 is handed out first
        let free = (0..count).rev().map(|id| InputBuffer::new(id, resolution)).collect();
        Arc::new(Self {
            free: Mutex::new(free),
            capacity: count,
        })
    }

    /// Take a free buffer, `None` if all are in flight
    pub fn acquire(&self) -> Option<InputBuffer> {
        self.free.lock().pop()
    }

    pub fn release(&self, buffer: InputBuffer) {
        let mut free = self.free.lock();
        debug_assert!(free.len() < self.capacity);
        free.push(buffer);
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Encoded output of one frame: one or two byte segments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputUnit {
    pub segments: Vec<Bytes>,
}

impl OutputUnit {
    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Frame encoder driven by the encode thread.
///
/// Per frame the caller takes an input buffer from [`input_pool`], submits it
/// with `encode_one_frame`, then collects zero or one output unit with
/// `acquire_output_buffer` and hands it back with `release_output_buffer`
/// once written.
///
/// [`input_pool`]: VideoEncoder::input_pool
pub trait VideoEncoder: Send {
    /// Get encoder name
    fn name(&self) -> &str;

    /// Get current configuration
    fn config(&self) -> &EncoderConfig;

    /// Stream header written once before the first frame
    fn header(&self) -> Bytes;

    /// The encoder's input buffers.
    ///
    /// The encoder itself lives on the encode thread, so the capture side
    /// acquires through this handle and the encode side releases through it.
    fn input_pool(&self) -> Arc<InputBufferPool>;

    /// Encode one populated input buffer
    fn encode_one_frame(&mut self, input: &InputBuffer) -> Result<()>;

    /// Output of the last encode, if the encoder produced one
    fn acquire_output_buffer(&mut self) -> Result<Option<OutputUnit>>;

    fn release_output_buffer(&mut self, output: OutputUnit);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params() {
        let params = CodecParams::default();
        assert_eq!(params.bitrate, 4_000_000);
        assert_eq!(params.profile, H264Profile::Main);
        assert_eq!(params.level, 31);
        assert_eq!(params.fixed_qp, Some(FixedQp { i: 20, p: 30 }));
        assert_eq!(params.input_buffers, 4);
        params.validate().unwrap();
    }

    #[test]
    fn test_validate_qp_range() {
        let params = CodecParams {
            qp_min: 41,
            qp_max: 40,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_input_pool_exhaustion() {
        let pool = InputBufferPool::new(2, Resolution::new(4, 2));
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!((a.id(), b.id()), (0, 1));
        assert!(pool.acquire().is_none());
        pool.release(a);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.acquire().unwrap().id(), 0);
    }

    #[test]
    fn test_input_buffer_planes() {
        let buffer = InputBuffer::new(0, Resolution::VGA);
        assert_eq!(buffer.y.len(), 640 * 480);
        assert_eq!(buffer.u_plane().len(), 640 * 480 / 4);
        assert_eq!(buffer.v_plane().len(), 640 * 480 / 4);
    }
}
