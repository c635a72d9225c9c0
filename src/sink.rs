//! Encoded stream output

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use tracing::{debug, info};

use crate::encoder::OutputUnit;
use crate::error::{PipelineError, Result};

/// Byte-stream destination for encoder output.
///
/// Receives the stream header once, then every output unit's segments in
/// arrival order.
pub struct FrameSink<W: Write> {
    writer: W,
    header_written: bool,
}

impl FrameSink<BufWriter<File>> {
    /// Create (or truncate) an output file
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|source| PipelineError::Open {
            path: path.display().to_string(),
            source,
        })?;
        info!("Writing output to {}", path.display());
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> FrameSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            header_written: false,
        }
    }

    /// Write the stream header. Only the first call writes anything.
    pub fn write_header(&mut self, header: &[u8]) -> io::Result<usize> {
        if self.header_written {
            debug!("Stream header already written");
            return Ok(0);
        }
        self.writer.write_all(header)?;
        self.header_written = true;
        Ok(header.len())
    }

    /// Write all segments of one output unit, returning the byte count
    pub fn write_unit(&mut self, unit: &OutputUnit) -> io::Result<usize> {
        let mut written = 0;
        for segment in &unit.segments {
            self.writer.write_all(segment)?;
            written += segment.len();
        }
        Ok(written)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    pub fn header_written(&self) -> bool {
        self.header_written
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
