//! camenc - V4L2 capture-to-encoder pipeline
//!
//! Captures frames from a memory-mapped V4L2 device, converts them from packed
//! YUYV to planar YUV420 and hands them to an encoder running on its own
//! thread.

pub mod config;
pub mod encoder;
pub mod error;
pub mod pipeline;
pub mod sink;
pub mod state;
pub mod utils;
pub mod video;

pub use error::{PipelineError, Result};
