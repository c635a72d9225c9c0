//! Pixel format and capture format definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use v4l::FourCC;

/// Pixel formats known to the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// MJPEG compressed format
    Mjpeg,
    /// YUYV 4:2:2 packed format (Y0 U0 Y1 V0)
    Yuyv,
    /// YVYU 4:2:2 packed format (Y0 V0 Y1 U0)
    Yvyu,
    /// UYVY 4:2:2 packed format
    Uyvy,
    /// NV12 semi-planar format (Y plane + interleaved UV)
    Nv12,
    /// YUV420 planar format
    Yuv420,
}

impl PixelFormat {
    /// Convert to V4L2 FourCC
    pub fn to_fourcc(&self) -> FourCC {
        match self {
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
            PixelFormat::Yuyv => FourCC::new(b"YUYV"),
            PixelFormat::Yvyu => FourCC::new(b"YVYU"),
            PixelFormat::Uyvy => FourCC::new(b"UYVY"),
            PixelFormat::Nv12 => FourCC::new(b"NV12"),
            PixelFormat::Yuv420 => FourCC::new(b"YU12"),
        }
    }

    /// Try to convert from V4L2 FourCC
    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"MJPG" => Some(PixelFormat::Mjpeg),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"YVYU" => Some(PixelFormat::Yvyu),
            b"UYVY" => Some(PixelFormat::Uyvy),
            b"NV12" => Some(PixelFormat::Nv12),
            b"YU12" | b"I420" => Some(PixelFormat::Yuv420),
            _ => None,
        }
    }

    /// Whether frames in this format can be converted to planar YUV420
    pub fn is_convertible(&self) -> bool {
        matches!(self, PixelFormat::Yuyv | PixelFormat::Yvyu)
    }

    /// Calculate expected frame size for a given resolution
    /// Returns None for compressed formats (variable size)
    pub fn frame_size(&self, resolution: Resolution) -> Option<usize> {
        let pixels = resolution.pixels() as usize;
        match self {
            PixelFormat::Mjpeg => None,
            PixelFormat::Yuyv | PixelFormat::Yvyu | PixelFormat::Uyvy => Some(pixels * 2),
            PixelFormat::Nv12 | PixelFormat::Yuv420 => Some(pixels * 3 / 2),
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Mjpeg => "MJPEG",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Yvyu => "YVYU",
            PixelFormat::Uyvy => "UYVY",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Yuv420 => "YUV420",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "MJPEG" | "MJPG" => Ok(PixelFormat::Mjpeg),
            "YUYV" | "YUY2" => Ok(PixelFormat::Yuyv),
            "YVYU" => Ok(PixelFormat::Yvyu),
            "UYVY" => Ok(PixelFormat::Uyvy),
            "NV12" => Ok(PixelFormat::Nv12),
            "YUV420" | "I420" | "YU12" => Ok(PixelFormat::Yuv420),
            _ => Err(format!("Unknown pixel format: {}", s)),
        }
    }
}

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Both dimensions are even (required by 4:2:0 chroma subsampling)
    pub fn is_even(&self) -> bool {
        self.width % 2 == 0 && self.height % 2 == 0
    }

    /// Get total pixels
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub const VGA: Resolution = Resolution {
        width: 640,
        height: 480,
    };
    pub const HD720: Resolution = Resolution {
        width: 1280,
        height: 720,
    };
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

/// One advertised (pixel format, frame size) tuple of a capture device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFormat {
    /// Description from driver
    pub description: String,
    /// Raw pixel format identifier
    pub fourcc: FourCC,
    pub width: u32,
    pub height: u32,
}

impl CaptureFormat {
    pub fn new(description: impl Into<String>, fourcc: FourCC, width: u32, height: u32) -> Self {
        Self {
            description: description.into(),
            fourcc,
            width,
            height,
        }
    }

    /// Build a request for a known pixel format (description left empty)
    pub fn request(format: PixelFormat, resolution: Resolution) -> Self {
        Self::new(
            String::new(),
            format.to_fourcc(),
            resolution.width,
            resolution.height,
        )
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    pub fn pixel_format(&self) -> Option<PixelFormat> {
        PixelFormat::from_fourcc(self.fourcc)
    }
}

impl fmt::Display for CaptureFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}x{}", self.fourcc, self.width, self.height)?;
        if !self.description.is_empty() {
            write!(f, " ({})", self.description)?;
        }
        Ok(())
    }
}
