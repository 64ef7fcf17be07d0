//! # V4L2 Driver Module
//!
//! Implements [`VideoDriver`] for a real device node on top of the `v4l` crate. Capabilities and
//! format negotiation go through [`v4l::Device`]. Buffers are requested, mapped and exchanged
//! through the `v4l::v4l2` ioctl wrappers by index, so the [`crate::pool::FrameBufferPool`] sees
//! every handoff between the application and the kernel.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::io;
use std::mem;
use std::os::raw::c_void;
use std::path::Path;
use std::ptr;
use std::slice;

use log::trace;
use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::memory::Memory;
use v4l::v4l2;
use v4l::v4l2::vidioc;
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::{Capabilities, Dequeued, Format, VideoDriver};
use crate::pool::MappedRegion;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// An open V4L2 device node.
pub struct V4l2Driver {
    device: Device,
}

/// A capture buffer mmap'd from the device.
pub struct MmapRegion {
    ptr: *mut c_void,
    len: usize,
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl V4l2Driver {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            device: Device::with_path(path)?,
        })
    }

    fn ioctl<T>(&self, request: vidioc::_IOC_TYPE, arg: &mut T) -> io::Result<()> {
        // Every request below is issued with the argument type the kernel defines for it
        unsafe {
            v4l2::ioctl(
                self.device.handle().fd(),
                request,
                arg as *mut T as *mut c_void,
            )
        }
    }

    fn buffer(index: u32) -> v4l2_buffer {
        v4l2_buffer {
            index,
            type_: Type::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            ..unsafe { mem::zeroed() }
        }
    }

    fn stream_ioctl(&self, request: vidioc::_IOC_TYPE) -> io::Result<()> {
        let mut buf_type = Type::VideoCapture as u32;
        self.ioctl(request, &mut buf_type)
    }
}

impl VideoDriver for V4l2Driver {
    type Region = MmapRegion;

    fn capabilities(&mut self) -> io::Result<Capabilities> {
        Ok(self.device.query_caps()?.into())
    }

    fn set_format(&mut self, width: u32, height: u32, fourcc: [u8; 4]) -> io::Result<Format> {
        let requested = v4l::Format::new(width, height, FourCC::new(&fourcc));
        let actual = self.device.set_format(&requested)?;

        trace!("Device selected {}", actual);

        Ok(actual.into())
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        let mut req = v4l2_requestbuffers {
            count,
            type_: Type::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            ..unsafe { mem::zeroed() }
        };
        self.ioctl(vidioc::VIDIOC_REQBUFS, &mut req)?;

        Ok(req.count)
    }

    fn map_buffer(&mut self, index: u32) -> io::Result<MmapRegion> {
        let mut buf = Self::buffer(index);
        self.ioctl(vidioc::VIDIOC_QUERYBUF, &mut buf)?;

        let len = buf.length as usize;
        let ptr = unsafe {
            v4l2::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.device.handle().fd(),
                buf.m.offset as libc::off_t,
            )?
        };

        trace!("Mapped buffer {} ({} bytes)", index, len);

        Ok(MmapRegion { ptr, len })
    }

    fn queue(&mut self, index: u32) -> io::Result<()> {
        let mut buf = Self::buffer(index);
        self.ioctl(vidioc::VIDIOC_QBUF, &mut buf)
    }

    fn dequeue(&mut self) -> io::Result<Dequeued> {
        let mut buf = Self::buffer(0);
        self.ioctl(vidioc::VIDIOC_DQBUF, &mut buf)?;

        Ok(Dequeued {
            index: buf.index,
            bytes_used: buf.bytesused as usize,
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        self.stream_ioctl(vidioc::VIDIOC_STREAMON)
    }

    fn stream_off(&mut self) -> io::Result<()> {
        self.stream_ioctl(vidioc::VIDIOC_STREAMOFF)
    }
}

impl MappedRegion for MmapRegion {
    fn as_slice(&self) -> &[u8] {
        if self.ptr.is_null() {
            &[]
        } else {
            // The mapping stays valid for `len` bytes until `unmap`
            unsafe { slice::from_raw_parts(self.ptr as *const u8, self.len) }
        }
    }

    fn unmap(&mut self) -> io::Result<()> {
        if self.ptr.is_null() {
            return Ok(());
        }

        let ptr = mem::replace(&mut self.ptr, ptr::null_mut());
        unsafe { v4l2::munmap(ptr, self.len) }
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        let _ = self.unmap();
    }
}

impl From<v4l::Capabilities> for Capabilities {
    fn from(caps: v4l::Capabilities) -> Self {
        Self {
            capture: caps.capabilities.contains(Flags::VIDEO_CAPTURE),
            streaming: caps.capabilities.contains(Flags::STREAMING),
            driver: caps.driver,
            card: caps.card,
        }
    }
}

impl From<v4l::Format> for Format {
    fn from(fmt: v4l::Format) -> Self {
        Self {
            width: fmt.width,
            height: fmt.height,
            fourcc: fmt.fourcc.repr,
            bytes_per_line: fmt.stride,
            size_image: fmt.size,
        }
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------
