//! Video capture module
//!
//! V4L2 device access, the mmap buffer ring, the blocking capture loop and
//! pixel format conversion.

pub mod buffer;
pub mod capture;
pub mod convert;
pub mod device;
pub mod driver;
pub mod format;

#[cfg(test)]
pub(crate) mod testing;

pub use buffer::{BufferPool, CaptureBuffer, Ownership, DEFAULT_BUFFER_COUNT};
pub use capture::{CaptureLoop, FrameHandler, LoopState, LoopStats};
pub use convert::PixelConverter;
pub use device::{CaptureDevice, StartRetry, SupportedFormats, DEFAULT_START_ATTEMPTS};
pub use driver::{CaptureDriver, DeviceCapabilities, FormatDesc, MappedRegion, V4l2Driver};
pub use format::{CaptureFormat, PixelFormat, Resolution};
