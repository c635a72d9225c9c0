//! Fixed arena of memory-mapped capture buffers
//!
//! Every slot carries an ownership tag. A slot is either queued with the
//! driver for filling ([`Ownership::DriverOwned`]) or handed to user code for
//! reading ([`Ownership::UserOwned`]). Reads of driver-owned slots are refused,
//! and flipping a slot into the state it already has is an error, so a frame
//! can neither be read while the kernel writes it nor be returned twice.

use std::fmt;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::driver::{CaptureDriver, MappedRegion};
use crate::error::{PipelineError, Result};

/// Default number of capture buffers
pub const DEFAULT_BUFFER_COUNT: u32 = 3;

/// Who may touch a slot's memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Queued with the driver, being (or about to be) filled
    DriverOwned,
    /// Filled and dequeued, readable by user code
    UserOwned,
}

impl fmt::Display for Ownership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ownership::DriverOwned => write!(f, "driver-owned"),
            Ownership::UserOwned => write!(f, "user-owned"),
        }
    }
}

/// Handle to a dequeued capture buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureBuffer {
    /// Driver-assigned slot index
    pub index: u32,
    /// Bytes the driver wrote into the slot
    pub bytes_used: usize,
    /// Driver frame sequence number
    pub sequence: u32,
}

struct Slot<R> {
    region: R,
    owner: Mutex<Ownership>,
}

/// The set of mapped capture buffers of one negotiated stream
pub struct BufferPool<R: MappedRegion> {
    slots: Vec<Slot<R>>,
}

impl<R: MappedRegion> BufferPool<R> {
    /// Map `count` kernel buffers and queue all of them with the driver.
    ///
    /// The driver must already have granted `count` buffers. No partial pool
    /// survives a failure: mapped regions are dropped (unmapped) and the
    /// kernel buffers are released before the error is returned.
    pub fn allocate<D>(driver: &D, count: u32) -> Result<Self>
    where
        D: CaptureDriver<Region = R>,
    {
        let mut slots = Vec::with_capacity(count as usize);
        for index in 0..count {
            match driver.map_buffer(index) {
                Ok(region) => {
                    debug!("Mapped capture buffer {} ({} bytes)", index, region.len());
                    slots.push(Slot {
                        region,
                        owner: Mutex::new(Ownership::DriverOwned),
                    });
                }
                Err(source) => {
                    drop(slots);
                    release_kernel_buffers(driver);
                    return Err(PipelineError::Map { index, source });
                }
            }
        }

        for index in 0..count {
            if let Err(source) = driver.queue_buffer(index) {
                drop(slots);
                release_kernel_buffers(driver);
                return Err(PipelineError::Enqueue { index, source });
            }
        }

        Ok(Self { slots })
    }

    /// Number of slots in the pool
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Current ownership of a slot
    pub fn ownership(&self, index: u32) -> Result<Ownership> {
        Ok(*self.slot(index)?.owner.lock())
    }

    /// Number of slots currently handed to user code
    pub fn user_owned_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| *s.owner.lock() == Ownership::UserOwned)
            .count()
    }

    /// Flip a slot to user-owned after the driver returned it
    pub fn mark_filled(&self, index: u32) -> Result<()> {
        self.flip(index, Ownership::DriverOwned, Ownership::UserOwned)
    }

    /// Read a user-owned slot's bytes.
    ///
    /// The slot's lock is held for the duration of `f`, so the slot cannot be
    /// released back to the driver while it is being read.
    pub fn read<T>(&self, buffer: &CaptureBuffer, f: impl FnOnce(&[u8]) -> T) -> Result<T> {
        let slot = self.slot(buffer.index)?;
        let owner = slot.owner.lock();
        if *owner != Ownership::UserOwned {
            return Err(PipelineError::SlotState {
                index: buffer.index,
                expected: Ownership::UserOwned,
                actual: *owner,
            });
        }
        let data = slot.region.as_slice();
        let used = buffer.bytes_used.min(data.len());
        Ok(f(&data[..used]))
    }

    /// Hand a user-owned slot back to the driver.
    ///
    /// The tag is flipped before the buffer is queued so a fast refill can
    /// never find the slot still marked user-owned. If queueing fails the tag
    /// is restored and the slot stays out of the ring.
    pub fn release<D>(&self, driver: &D, index: u32) -> Result<()>
    where
        D: CaptureDriver<Region = R>,
    {
        self.flip(index, Ownership::UserOwned, Ownership::DriverOwned)?;
        if let Err(source) = driver.queue_buffer(index) {
            *self.slot(index)?.owner.lock() = Ownership::UserOwned;
            return Err(PipelineError::Enqueue { index, source });
        }
        Ok(())
    }

    /// Queue every driver-owned slot with the driver again.
    ///
    /// Needed after stream-off, which empties the driver's queue while the
    /// tags still say driver-owned. A slot that fails to queue is tagged
    /// user-owned so it stays out of the ring. Returns the number queued.
    pub fn requeue_driver_owned<D>(&self, driver: &D) -> usize
    where
        D: CaptureDriver<Region = R>,
    {
        let mut queued = 0;
        for (index, slot) in self.slots.iter().enumerate() {
            let mut owner = slot.owner.lock();
            if *owner != Ownership::DriverOwned {
                continue;
            }
            match driver.queue_buffer(index as u32) {
                Ok(()) => queued += 1,
                Err(e) => {
                    warn!("Failed to requeue capture buffer {}: {}", index, e);
                    *owner = Ownership::UserOwned;
                }
            }
        }
        queued
    }

    fn flip(&self, index: u32, from: Ownership, to: Ownership) -> Result<()> {
        let slot = self.slot(index)?;
        let mut owner = slot.owner.lock();
        if *owner != from {
            return Err(PipelineError::SlotState {
                index,
                expected: from,
                actual: *owner,
            });
        }
        *owner = to;
        Ok(())
    }

    fn slot(&self, index: u32) -> Result<&Slot<R>> {
        self.slots
            .get(index as usize)
            .ok_or(PipelineError::InvalidSlot(index))
    }
}

impl<R: MappedRegion> Drop for BufferPool<R> {
    fn drop(&mut self) {
        let held: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| *s.owner.lock() == Ownership::UserOwned)
            .map(|(i, _)| i)
            .collect();
        if !held.is_empty() {
            warn!("Tearing down buffer pool with user-owned slots {:?}", held);
        }
        debug!("Unmapping {} capture buffers", self.slots.len());
    }
}

fn release_kernel_buffers<D: CaptureDriver>(driver: &D) {
    if let Err(e) = driver.request_buffers(0) {
        warn!("Failed to release kernel capture buffers: {}", e);
    }
}
