//! V4L2 capture device: format negotiation and the kernel buffer queue

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, error, info, trace, warn};

use super::buffer::{BufferPool, CaptureBuffer};
use super::driver::{CaptureDriver, FormatDesc, V4l2Driver};
use super::format::{CaptureFormat, PixelFormat, Resolution};
use crate::error::{PipelineError, Result};
use crate::state::PipelineState;

/// Default attempts for starting the stream
pub const DEFAULT_START_ATTEMPTS: u32 = 5;
/// Default delay between start attempts
const DEFAULT_START_RETRY_DELAY_MS: u64 = 200;

/// Bounded retry policy for stream-on.
///
/// Some drivers fail the first STREAMON after a format change, so starting
/// is the only operation retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for StartRetry {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_START_ATTEMPTS,
            delay: Duration::from_millis(DEFAULT_START_RETRY_DELAY_MS),
        }
    }
}

/// A capture device with its negotiated format and buffer pool
pub struct CaptureDevice<D: CaptureDriver> {
    // Declared before `driver`: the pool must unmap before the fd closes.
    pool: RwLock<Option<BufferPool<D::Region>>>,
    format: RwLock<Option<CaptureFormat>>,
    driver: D,
    name: String,
    buffer_count: u32,
    state: Arc<PipelineState>,
}

impl CaptureDevice<V4l2Driver> {
    /// Open a V4L2 device node
    pub fn open(
        path: impl AsRef<Path>,
        buffer_count: u32,
        state: Arc<PipelineState>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let driver = V4l2Driver::open(path).map_err(|source| PipelineError::Open {
            path: path.display().to_string(),
            source,
        })?;
        Self::with_driver(driver, path.display().to_string(), buffer_count, state)
    }
}

impl<D: CaptureDriver> CaptureDevice<D> {
    /// Wrap an opened driver, checking that it can capture video
    pub fn with_driver(
        driver: D,
        name: impl Into<String>,
        buffer_count: u32,
        state: Arc<PipelineState>,
    ) -> Result<Self> {
        let name = name.into();
        let caps = driver.query_capabilities().map_err(|source| PipelineError::Open {
            path: name.clone(),
            source,
        })?;

        if !caps.video_capture {
            return Err(PipelineError::NotAVideoDevice { path: name });
        }
        if !caps.streaming {
            warn!("{} does not advertise streaming I/O", name);
        }
        info!("Opened capture device {}: {} ({})", name, caps.card, caps.driver);

        Ok(Self {
            pool: RwLock::new(None),
            format: RwLock::new(None),
            driver,
            name,
            buffer_count,
            state,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn state(&self) -> &Arc<PipelineState> {
        &self.state
    }

    pub fn is_started(&self) -> bool {
        self.state.is_started()
    }

    /// Negotiated format, if any
    pub fn format(&self) -> Option<CaptureFormat> {
        self.format.read().clone()
    }

    /// Number of mapped capture buffers (0 before negotiation)
    pub fn buffer_count(&self) -> usize {
        self.pool.read().as_ref().map(|p| p.len()).unwrap_or(0)
    }

    /// Number of capture buffers currently held by user code
    pub fn user_owned_count(&self) -> usize {
        self.pool
            .read()
            .as_ref()
            .map(|p| p.user_owned_count())
            .unwrap_or(0)
    }

    /// Enumerate advertised (pixel format, frame size) tuples.
    ///
    /// The sequence queries the driver as it is consumed; calling this again
    /// starts a fresh enumeration.
    pub fn list_supported_formats(&self) -> SupportedFormats<'_, D> {
        SupportedFormats {
            driver: &self.driver,
            format_index: 0,
            current: None,
            sizes: Vec::new().into_iter(),
            done: false,
        }
    }

    /// Pick the first advertised tuple matching the given preferences
    pub fn select_format(
        &self,
        format: Option<PixelFormat>,
        resolution: Option<Resolution>,
    ) -> Result<CaptureFormat> {
        self.list_supported_formats()
            .find(|f| {
                format.map_or(true, |p| f.fourcc == p.to_fourcc())
                    && resolution.map_or(true, |r| f.resolution() == r)
            })
            .ok_or_else(|| {
                let wanted = match (format, resolution) {
                    (Some(p), Some(r)) => format!("{} {}", p, r),
                    (Some(p), None) => p.to_string(),
                    (None, Some(r)) => r.to_string(),
                    (None, None) => "any format".to_string(),
                };
                PipelineError::UnsupportedFormat(format!("{} not advertised by {}", wanted, self.name))
            })
    }

    /// Configure the driver for `requested` and map the capture buffers.
    ///
    /// The driver's answer to the format request is compared with the
    /// request; a silently changed pixel format or size is rejected.
    pub fn negotiate(&self, requested: &CaptureFormat) -> Result<CaptureFormat> {
        if self.is_started() {
            return Err(PipelineError::Negotiation(
                "cannot change format while streaming".to_string(),
            ));
        }

        let desc = self.find_pixel_format(requested)?;

        let resolution = requested.resolution();
        if !resolution.is_even() {
            return Err(PipelineError::OddDimensions {
                width: requested.width,
                height: requested.height,
            });
        }

        // Drivers refuse S_FMT while buffers are allocated: unmap and free the
        // previous pool first
        if let Some(old) = self.pool.write().take() {
            drop(old);
            *self.format.write() = None;
            self.driver.request_buffers(0).map_err(|e| {
                PipelineError::Negotiation(format!("Failed to release capture buffers: {}", e))
            })?;
            debug!("Released previous capture buffers on {}", self.name);
        }

        let (fourcc, actual) = self
            .driver
            .set_format(requested.fourcc, resolution)
            .map_err(|e| PipelineError::Negotiation(format!("Failed to set format: {}", e)))?;
        if fourcc != requested.fourcc || actual != resolution {
            return Err(PipelineError::FormatRejected {
                requested: format!("{} {}", requested.fourcc, resolution),
                actual: format!("{} {}", fourcc, actual),
            });
        }

        let granted = self
            .driver
            .request_buffers(self.buffer_count)
            .map_err(|e| PipelineError::Negotiation(format!("Failed to request buffers: {}", e)))?;
        if granted == 0 {
            return Err(PipelineError::Negotiation(
                "Driver returned zero capture buffers".to_string(),
            ));
        }
        if granted != self.buffer_count {
            warn!(
                "Requested {} capture buffers, driver granted {}",
                self.buffer_count, granted
            );
        }

        let pool = BufferPool::allocate(&self.driver, granted)?;
        *self.pool.write() = Some(pool);

        let negotiated = CaptureFormat::new(desc.description, fourcc, actual.width, actual.height);
        info!(
            "Negotiated {} on {} with {} buffers",
            negotiated, self.name, granted
        );
        *self.format.write() = Some(negotiated.clone());
        Ok(negotiated)
    }

    fn find_pixel_format(&self, requested: &CaptureFormat) -> Result<FormatDesc> {
        for index in 0.. {
            match self.driver.enum_format(index) {
                Ok(Some(desc)) if desc.fourcc == requested.fourcc => return Ok(desc),
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(e) => {
                    debug!("Format enumeration stopped at {}: {}", index, e);
                    break;
                }
            }
        }
        Err(PipelineError::UnsupportedFormat(format!(
            "{} does not support {}",
            self.name, requested.fourcc
        )))
    }

    /// Turn kernel streaming on (single attempt; no-op if already started)
    pub fn start_streaming(&self) -> Result<()> {
        self.try_start().map_err(|source| PipelineError::StreamOn {
            attempts: 1,
            source,
        })
    }

    /// Turn kernel streaming on, retrying transient failures
    pub fn start_streaming_with_retry(&self, retry: &StartRetry) -> Result<()> {
        let attempts = retry.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_start() {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    warn!(
                        "Start streaming failed on attempt {}/{}: {}",
                        attempt, attempts, e
                    );
                    if !retry.delay.is_zero() {
                        std::thread::sleep(retry.delay);
                    }
                }
                Err(source) => {
                    error!("Can't start streaming on {} after {} attempts", self.name, attempts);
                    return Err(PipelineError::StreamOn { attempts, source });
                }
            }
        }
    }

    fn try_start(&self) -> std::io::Result<()> {
        if self.is_started() {
            return Ok(());
        }
        if self.pool.read().is_none() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                PipelineError::NotNegotiated.to_string(),
            ));
        }
        self.driver.stream_on()?;
        self.state.set_started(true);
        info!("Streaming started on {}", self.name);
        Ok(())
    }

    /// Turn kernel streaming off. Also clears the looping flag.
    ///
    /// Stream-off takes every queued buffer away from the driver, so the
    /// driver-owned slots are queued again right away and a later start finds
    /// a full ring. The pool is locked for writing across both steps so a
    /// concurrent release cannot queue the same slot twice.
    pub fn stop_streaming(&self) -> Result<()> {
        self.stop(true)
    }

    fn stop(&self, requeue: bool) -> Result<()> {
        self.state.set_looping(false);
        let pool = self.pool.write();
        if let Err(e) = self.driver.stream_off() {
            error!("Failed to stop streaming on {}: {}", self.name, e);
            return Err(PipelineError::StreamOff(e));
        }
        self.state.set_started(false);
        if requeue {
            if let Some(pool) = pool.as_ref() {
                let queued = pool.requeue_driver_owned(&self.driver);
                debug!("Requeued {} capture buffers after stream-off", queued);
            }
        }
        info!("Streaming stopped on {}", self.name);
        Ok(())
    }

    /// Block until the driver hands back a filled buffer
    pub fn dequeue_filled(&self) -> Result<CaptureBuffer> {
        let dequeued = self.driver.dequeue_buffer().map_err(PipelineError::Dequeue)?;
        let pool = self.pool.read();
        let pool = pool.as_ref().ok_or(PipelineError::NotNegotiated)?;
        pool.mark_filled(dequeued.index)?;
        trace!(
            "Dequeued buffer {} ({} bytes, seq {})",
            dequeued.index,
            dequeued.bytes_used,
            dequeued.sequence
        );
        Ok(CaptureBuffer {
            index: dequeued.index,
            bytes_used: dequeued.bytes_used,
            sequence: dequeued.sequence,
        })
    }

    /// Return a consumed buffer to the driver for refilling
    pub fn enqueue_empty(&self, index: u32) -> Result<()> {
        let pool = self.pool.read();
        let pool = pool.as_ref().ok_or(PipelineError::NotNegotiated)?;
        pool.release(&self.driver, index)?;
        trace!("Enqueued buffer {}", index);
        Ok(())
    }

    /// Read the bytes of a dequeued buffer
    pub fn read_buffer<T>(&self, buffer: &CaptureBuffer, f: impl FnOnce(&[u8]) -> T) -> Result<T> {
        let pool = self.pool.read();
        let pool = pool.as_ref().ok_or(PipelineError::NotNegotiated)?;
        pool.read(buffer, f)
    }
}

impl<D: CaptureDriver> Drop for CaptureDevice<D> {
    fn drop(&mut self) {
        if self.is_started() {
            let _ = self.stop(false);
        }
    }
}

/// Lazy enumeration of advertised capture formats
pub struct SupportedFormats<'a, D: CaptureDriver> {
    driver: &'a D,
    format_index: u32,
    current: Option<FormatDesc>,
    sizes: std::vec::IntoIter<Resolution>,
    done: bool,
}

impl<D: CaptureDriver> Iterator for SupportedFormats<'_, D> {
    type Item = CaptureFormat;

    fn next(&mut self) -> Option<CaptureFormat> {
        loop {
            if let (Some(desc), Some(size)) = (self.current.as_ref(), self.sizes.next()) {
                return Some(CaptureFormat::new(
                    desc.description.clone(),
                    desc.fourcc,
                    size.width,
                    size.height,
                ));
            }
            if self.done {
                return None;
            }

            match self.driver.enum_format(self.format_index) {
                Ok(Some(desc)) => {
                    self.format_index += 1;
                    self.sizes = match self.driver.enum_frame_sizes(desc.fourcc) {
                        Ok(sizes) => sizes.into_iter(),
                        Err(e) => {
                            debug!("Failed to enumerate frame sizes for {}: {}", desc.fourcc, e);
                            Vec::new().into_iter()
                        }
                    };
                    self.current = Some(desc);
                }
                Ok(None) => self.done = true,
                Err(e) => {
                    debug!("Failed to enumerate formats: {}", e);
                    self.done = true;
                }
            }
        }
    }
}
