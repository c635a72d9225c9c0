use std::io;

use thiserror::Error;

use crate::video::buffer::Ownership;

/// Pipeline-wide error type
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Failed to open device {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("{path} is not a video capture device")]
    NotAVideoDevice { path: String },

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Driver rejected format: requested {requested}, got {actual}")]
    FormatRejected { requested: String, actual: String },

    #[error("Invalid dimensions {width}x{height}: width and height must be even")]
    OddDimensions { width: u32, height: u32 },

    #[error("Format negotiation failed: {0}")]
    Negotiation(String),

    #[error("Device has not negotiated a format")]
    NotNegotiated,

    #[error("Failed to map capture buffer {index}: {source}")]
    Map {
        index: u32,
        #[source]
        source: io::Error,
    },

    #[error("Failed to start streaming after {attempts} attempts: {source}")]
    StreamOn {
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("Failed to stop streaming: {0}")]
    StreamOff(#[source] io::Error),

    #[error("Failed to dequeue capture buffer: {0}")]
    Dequeue(#[source] io::Error),

    #[error("Failed to enqueue capture buffer {index}: {source}")]
    Enqueue {
        index: u32,
        #[source]
        source: io::Error,
    },

    #[error("Capture buffer {index} is {actual}, expected {expected}")]
    SlotState {
        index: u32,
        expected: Ownership,
        actual: Ownership,
    },

    #[error("Invalid capture buffer index {0}")]
    InvalidSlot(u32),

    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl PipelineError {
    /// Slot index the error refers to, if any
    pub fn slot(&self) -> Option<u32> {
        match self {
            PipelineError::Map { index, .. }
            | PipelineError::Enqueue { index, .. }
            | PipelineError::SlotState { index, .. }
            | PipelineError::InvalidSlot(index) => Some(*index),
            _ => None,
        }
    }
}

/// Result type alias for the pipeline
pub type Result<T> = std::result::Result<T, PipelineError>;
