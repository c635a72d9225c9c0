//! Capture driver seam and the V4L2 implementation behind it
//!
//! The driver exposes the raw buffer-queue verbs (request, query/map, queue,
//! dequeue, stream on/off). Ownership bookkeeping lives in
//! [`BufferPool`](super::buffer::BufferPool) and the state machine in
//! [`CaptureDevice`](super::device::CaptureDevice); the driver only talks to
//! the kernel.

use std::io;
use std::mem;
use std::os::fd::BorrowedFd;
use std::os::raw::{c_int, c_void};
use std::path::{Path, PathBuf};
use std::ptr;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, error, trace};
use v4l::buffer::Type as BufferType;
use v4l::capability::Flags;
use v4l::framesize::FrameSizeEnum;
use v4l::memory::Memory;
use v4l::prelude::*;
use v4l::v4l2;
use v4l::v4l_sys::{v4l2_buffer, v4l2_fmtdesc, v4l2_requestbuffers};
use v4l::video::Capture;
use v4l::{Format, FourCC};

use super::format::Resolution;

/// Capabilities reported by the driver
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    pub driver: String,
    pub card: String,
    pub video_capture: bool,
    pub streaming: bool,
}

/// One entry of the driver's pixel format list
#[derive(Debug, Clone)]
pub struct FormatDesc {
    pub fourcc: FourCC,
    pub description: String,
}

/// A buffer handed back by the driver after it finished filling it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub bytes_used: usize,
    pub sequence: u32,
}

/// Kernel memory mapped into the process for one capture slot.
///
/// Dropping the region unmaps it.
pub trait MappedRegion: Send + Sync {
    /// View of the mapped bytes. Only sound to read while the driver is not
    /// filling the buffer, which [`BufferPool`](super::buffer::BufferPool)
    /// guarantees by refusing access to driver-owned slots.
    fn as_slice(&self) -> &[u8];

    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Buffer-queue verbs of a streaming capture device.
///
/// All methods take `&self`: the capture thread dequeues while the encode
/// thread enqueues, and the kernel serializes ioctls on the same fd.
pub trait CaptureDriver: Send + Sync {
    type Region: MappedRegion;

    fn query_capabilities(&self) -> io::Result<DeviceCapabilities>;

    /// Pixel format at `index`, `None` past the end of the list
    fn enum_format(&self, index: u32) -> io::Result<Option<FormatDesc>>;

    /// Discrete frame sizes advertised for `fourcc`, in driver order
    fn enum_frame_sizes(&self, fourcc: FourCC) -> io::Result<Vec<Resolution>>;

    /// Request a format; returns what the driver actually configured
    fn set_format(&self, fourcc: FourCC, resolution: Resolution)
        -> io::Result<(FourCC, Resolution)>;

    /// Ask for `count` mmap buffers; returns how many the driver granted
    fn request_buffers(&self, count: u32) -> io::Result<u32>;

    fn map_buffer(&self, index: u32) -> io::Result<Self::Region>;

    fn queue_buffer(&self, index: u32) -> io::Result<()>;

    /// Block until a filled buffer is available
    fn dequeue_buffer(&self) -> io::Result<DequeuedBuffer>;

    fn stream_on(&self) -> io::Result<()>;

    fn stream_off(&self) -> io::Result<()>;
}

/// V4L2 single-planar capture device
pub struct V4l2Driver {
    path: PathBuf,
    device: Device,
}

impl V4l2Driver {
    /// Open a video device node
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        debug!("Opening video device: {:?}", path);
        let device = Device::with_path(&path)?;
        Ok(Self { path, device })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn fd(&self) -> c_int {
        self.device.handle().fd()
    }

    fn buffer_desc(&self, index: u32) -> v4l2_buffer {
        v4l2_buffer {
            index,
            type_: BufferType::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            ..unsafe { mem::zeroed() }
        }
    }

    /// Wait until the fd is readable. The device is opened non-blocking, so
    /// this is where the capture thread actually sleeps.
    fn wait_readable(&self) -> io::Result<()> {
        let fd = unsafe { BorrowedFd::borrow_raw(self.fd()) };
        loop {
            let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => {
                    trace!("poll interrupted, waiting again");
                    continue;
                }
                Err(e) => return Err(io::Error::from(e)),
            }
        }
    }

    fn stream_ioctl(&self, request: v4l2::vidioc::_IOC_TYPE) -> io::Result<()> {
        let mut typ = BufferType::VideoCapture as c_int;
        unsafe { v4l2::ioctl(self.fd(), request, &mut typ as *mut _ as *mut c_void) }
    }
}

impl CaptureDriver for V4l2Driver {
    type Region = MmapRegion;

    fn query_capabilities(&self) -> io::Result<DeviceCapabilities> {
        let caps = self.device.query_caps()?;
        Ok(DeviceCapabilities {
            driver: caps.driver.clone(),
            card: caps.card.clone(),
            video_capture: caps.capabilities.contains(Flags::VIDEO_CAPTURE),
            streaming: caps.capabilities.contains(Flags::STREAMING),
        })
    }

    fn enum_format(&self, index: u32) -> io::Result<Option<FormatDesc>> {
        let mut desc = v4l2_fmtdesc {
            index,
            type_: BufferType::VideoCapture as u32,
            ..unsafe { mem::zeroed() }
        };
        let res = unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_ENUM_FMT,
                &mut desc as *mut _ as *mut c_void,
            )
        };
        match res {
            Ok(()) => {
                let end = desc
                    .description
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(desc.description.len());
                let description = String::from_utf8_lossy(&desc.description[..end]).into_owned();
                Ok(Some(FormatDesc {
                    fourcc: FourCC::from(desc.pixelformat),
                    description,
                }))
            }
            // EINVAL marks the end of the list
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn enum_frame_sizes(&self, fourcc: FourCC) -> io::Result<Vec<Resolution>> {
        let mut sizes = Vec::new();
        for size in self.device.enum_framesizes(fourcc)? {
            match size.size {
                FrameSizeEnum::Discrete(d) => sizes.push(Resolution::new(d.width, d.height)),
                FrameSizeEnum::Stepwise(s) => {
                    debug!(
                        "Skipping stepwise frame sizes for {}: {}x{}..{}x{}",
                        fourcc, s.min_width, s.min_height, s.max_width, s.max_height
                    );
                }
            }
        }
        Ok(sizes)
    }

    fn set_format(
        &self,
        fourcc: FourCC,
        resolution: Resolution,
    ) -> io::Result<(FourCC, Resolution)> {
        let fmt = Format::new(resolution.width, resolution.height, fourcc);
        let actual = self.device.set_format(&fmt)?;
        Ok((actual.fourcc, Resolution::new(actual.width, actual.height)))
    }

    fn request_buffers(&self, count: u32) -> io::Result<u32> {
        let mut req = v4l2_requestbuffers {
            count,
            type_: BufferType::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            ..unsafe { mem::zeroed() }
        };
        unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_REQBUFS,
                &mut req as *mut _ as *mut c_void,
            )?;
        }
        Ok(req.count)
    }

    fn map_buffer(&self, index: u32) -> io::Result<MmapRegion> {
        let mut buf = self.buffer_desc(index);
        unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_QUERYBUF,
                &mut buf as *mut _ as *mut c_void,
            )?;

            let ptr = v4l2::mmap(
                ptr::null_mut(),
                buf.length as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd(),
                buf.m.offset as libc::off_t,
            )?;

            Ok(MmapRegion {
                ptr: ptr as *mut u8,
                len: buf.length as usize,
                index,
            })
        }
    }

    fn queue_buffer(&self, index: u32) -> io::Result<()> {
        let mut buf = self.buffer_desc(index);
        unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_QBUF,
                &mut buf as *mut _ as *mut c_void,
            )
        }
    }

    fn dequeue_buffer(&self) -> io::Result<DequeuedBuffer> {
        loop {
            self.wait_readable()?;

            let mut buf = self.buffer_desc(0);
            let res = unsafe {
                v4l2::ioctl(
                    self.fd(),
                    v4l2::vidioc::VIDIOC_DQBUF,
                    &mut buf as *mut _ as *mut c_void,
                )
            };
            match res {
                Ok(()) => {
                    return Ok(DequeuedBuffer {
                        index: buf.index,
                        bytes_used: buf.bytesused as usize,
                        sequence: buf.sequence,
                    })
                }
                // Spurious wakeup on a non-blocking fd
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn stream_on(&self) -> io::Result<()> {
        self.stream_ioctl(v4l2::vidioc::VIDIOC_STREAMON)
    }

    fn stream_off(&self) -> io::Result<()> {
        self.stream_ioctl(v4l2::vidioc::VIDIOC_STREAMOFF)
    }
}

/// One mmap'ed V4L2 buffer
pub struct MmapRegion {
    ptr: *mut u8,
    len: usize,
    index: u32,
}

// The mapping is plain shared memory; access discipline is enforced by the pool.
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

impl MappedRegion for MmapRegion {
    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        if let Err(e) = unsafe { v4l2::munmap(self.ptr as *mut c_void, self.len) } {
            error!("Failed to unmap capture buffer {}: {}", self.index, e);
        }
    }
}
