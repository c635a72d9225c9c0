//! Pixel format conversion utilities
//!
//! Packed 4:2:2 capture formats (YUYV, YVYU) to planar YUV420P for encoding.
//! Chroma is decimated vertically by keeping the even rows.

use crate::error::{PipelineError, Result};
use crate::video::format::{PixelFormat, Resolution};

/// Packed 4:2:2 → planar 4:2:0 converter for one negotiated stream
#[derive(Debug, Clone, Copy)]
pub struct PixelConverter {
    /// Source format
    src_format: PixelFormat,
    /// Frame resolution
    resolution: Resolution,
}

impl PixelConverter {
    /// Create a new converter for YUYV → YUV420P
    pub fn yuyv_to_yuv420p(resolution: Resolution) -> Self {
        Self {
            src_format: PixelFormat::Yuyv,
            resolution,
        }
    }

    /// Create a new converter for YVYU → YUV420P
    pub fn yvyu_to_yuv420p(resolution: Resolution) -> Self {
        Self {
            src_format: PixelFormat::Yvyu,
            resolution,
        }
    }

    /// Converter for a negotiated capture format
    pub fn for_format(format: PixelFormat, resolution: Resolution) -> Result<Self> {
        if !resolution.is_even() {
            return Err(PipelineError::OddDimensions {
                width: resolution.width,
                height: resolution.height,
            });
        }
        match format {
            PixelFormat::Yuyv => Ok(Self::yuyv_to_yuv420p(resolution)),
            PixelFormat::Yvyu => Ok(Self::yvyu_to_yuv420p(resolution)),
            other => Err(PipelineError::UnsupportedFormat(format!(
                "Unsupported conversion: {} → YUV420",
                other
            ))),
        }
    }

    pub fn src_format(&self) -> PixelFormat {
        self.src_format
    }

    /// Get resolution
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Convert one frame into a luma plane and a chroma plane holding U then V.
    ///
    /// # Panics
    /// If `input` is shorter than a full frame or a destination is undersized.
    pub fn convert(&self, input: &[u8], y_plane: &mut [u8], c_plane: &mut [u8]) {
        let width = self.resolution.width as usize;
        let height = self.resolution.height as usize;
        let (first, second) = c_plane.split_at_mut(width * height / 4);
        match self.src_format {
            PixelFormat::Yvyu => yuyv_to_yuv420p(input, y_plane, second, first, width, height),
            _ => yuyv_to_yuv420p(input, y_plane, first, second, width, height),
        }
    }
}

/// Convert packed YUYV to planar Y, U, V.
///
/// Luma is every even byte. Chroma comes from even rows only: the odd bytes
/// of such a row alternate between the U and V planes.
pub fn yuyv_to_yuv420p(
    yuyv: &[u8],
    y_plane: &mut [u8],
    u_plane: &mut [u8],
    v_plane: &mut [u8],
    width: usize,
    height: usize,
) {
    debug_assert!(width % 2 == 0 && height % 2 == 0);
    let pixels = width * height;
    let half_width = width / 2;
    assert!(yuyv.len() >= pixels * 2, "YUYV source too small");

    for (dst, pair) in y_plane[..pixels].iter_mut().zip(yuyv.chunks_exact(2)) {
        *dst = pair[0];
    }

    for row in (0..height).step_by(2) {
        let src = &yuyv[row * width * 2..(row + 1) * width * 2];
        let dst = (row / 2) * half_width;
        let u_row = &mut u_plane[dst..dst + half_width];
        let v_row = &mut v_plane[dst..dst + half_width];
        for ((quad, u), v) in src.chunks_exact(4).zip(u_row).zip(v_row) {
            *u = quad[1];
            *v = quad[3];
        }
    }
}

/// Calculate YUV420P buffer size for a given resolution
pub fn yuv420p_buffer_size(resolution: Resolution) -> usize {
    let pixels = resolution.pixels() as usize;
    pixels + pixels / 2
}

/// Calculate YUYV buffer size for a given resolution
pub fn yuyv_buffer_size(resolution: Resolution) -> usize {
    resolution.pixels() as usize * 2
}
