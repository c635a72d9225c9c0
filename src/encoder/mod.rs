//! Encoder boundary
//!
//! The pipeline drives encoders through [`VideoEncoder`]. [`H264Encoder`]
//! produces an H.264 elementary stream with OpenH264; [`Y4mEncoder`] writes
//! uncompressed YUV4MPEG2.

pub mod h264;
pub mod traits;
pub mod y4m;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use h264::H264Encoder;
pub use traits::{
    CodecParams, EncoderConfig, FixedQp, H264Profile, InputBuffer, InputBufferPool, OutputUnit,
    VideoEncoder, DEFAULT_INPUT_BUFFERS,
};
pub use y4m::Y4mEncoder;

use crate::error::Result;

/// Output encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    /// H.264 elementary stream
    #[default]
    H264,
    /// Uncompressed YUV4MPEG2
    Y4m,
}

impl EncoderKind {
    pub fn create(self, config: EncoderConfig) -> Result<Box<dyn VideoEncoder>> {
        Ok(match self {
            EncoderKind::H264 => Box::new(H264Encoder::new(config)?),
            EncoderKind::Y4m => Box::new(Y4mEncoder::new(config)?),
        })
    }
}

impl fmt::Display for EncoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncoderKind::H264 => write!(f, "h264"),
            EncoderKind::Y4m => write!(f, "y4m"),
        }
    }
}

impl FromStr for EncoderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "h264" | "avc" => Ok(EncoderKind::H264),
            "y4m" | "yuv4mpeg" => Ok(EncoderKind::Y4m),
            _ => Err(format!("Unknown encoder: {}", s)),
        }
    }
}
