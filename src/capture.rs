//! # Capture Device Module
//!
//! [`CaptureDevice`] drives the kernel streaming state machine on top of a [`VideoDriver`]. It
//! negotiates the capture format, owns the [`FrameBufferPool`] for its whole lifetime and moves
//! buffers between the application and the kernel.
//!
//! The usual sequence is
//!
//! ```rust,ignore
//! let mut device = CaptureDevice::open("/dev/video0")?;
//! device.negotiate_format(1280, 720)?;
//! device.request_buffers(4)?;
//! device.queue_all()?;
//! device.stream_on()?;
//!
//! let buffer = device.dequeue()?;
//! let bytes = device.frame(&buffer)?;
//! // ... consume bytes ...
//! device.requeue(buffer)?;
//! ```

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::pool::{FrameBufferPool, MappedRegion, StateCounts};
use crate::v4l2::V4l2Driver;

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// The only pixel format the pipeline captures in, packed YUV 4:2:2.
pub const FOURCC_YUYV: [u8; 4] = *b"YUYV";

// -----------------------------------------------------------------------------------------------
// TRAITS
// -----------------------------------------------------------------------------------------------

/// Kernel-facing operations of a capture device.
///
/// Indices passed to the driver always refer to buffers obtained through
/// [`VideoDriver::request_buffers`].
pub trait VideoDriver {
    /// Memory region handed out for each buffer.
    type Region: MappedRegion;

    fn capabilities(&mut self) -> io::Result<Capabilities>;

    /// Request a format, returning what the device actually selected.
    fn set_format(&mut self, width: u32, height: u32, fourcc: [u8; 4]) -> io::Result<Format>;

    /// Request `count` buffers, returning how many were granted.
    fn request_buffers(&mut self, count: u32) -> io::Result<u32>;

    fn map_buffer(&mut self, index: u32) -> io::Result<Self::Region>;

    fn queue(&mut self, index: u32) -> io::Result<()>;

    /// Block until a queued buffer has been filled.
    fn dequeue(&mut self) -> io::Result<Dequeued>;

    fn stream_on(&mut self) -> io::Result<()>;

    fn stream_off(&mut self) -> io::Result<()>;
}

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// What a device reports it can do.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub driver: String,
    pub card: String,
    pub capture: bool,
    pub streaming: bool,
}

/// A negotiated capture format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    pub width: u32,
    pub height: u32,
    pub fourcc: [u8; 4],
    pub bytes_per_line: u32,
    pub size_image: u32,
}

/// Result of a successful kernel dequeue.
#[derive(Debug, Clone, Copy)]
pub struct Dequeued {
    pub index: u32,
    pub bytes_used: usize,
}

/// A filled buffer on loan to the application.
///
/// Not clonable, the only way to give it back is [`CaptureDevice::requeue`], which consumes it.
#[derive(Debug)]
pub struct FrameBuffer {
    index: usize,
    bytes_used: usize,
}

pub struct CaptureDevice<D: VideoDriver> {
    path: PathBuf,
    driver: D,
    capabilities: Capabilities,
    format: Option<Format>,
    pool: Option<FrameBufferPool<D::Region>>,
    state: StreamState,
    closed: bool,
}

// -----------------------------------------------------------------------------------------------
// ENUMERATIONS
// -----------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Stopped,
    Streaming,
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl Format {
    /// Bytes in one packed YUYV frame of this size.
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 2
    }
}

impl FrameBuffer {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }
}

impl CaptureDevice<V4l2Driver> {
    /// Open a V4L2 device node, such as `/dev/video0`.
    ///
    /// Fails if the path does not exist, cannot be opened read/write, or the device does not
    /// support streaming capture.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(Error::FileNotFound(path.to_path_buf()));
        }

        let driver = V4l2Driver::open(path).map_err(|e| Error::DeviceOpenError {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::with_driver(path, driver)
    }
}

impl<D: VideoDriver> CaptureDevice<D> {
    /// Wrap an already opened driver, checking it can stream video capture.
    pub fn with_driver<P: AsRef<Path>>(path: P, mut driver: D) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let capabilities = driver.capabilities().map_err(|e| Error::DeviceOpenError {
            path: path.clone(),
            source: e,
        })?;

        if !capabilities.capture || !capabilities.streaming {
            return Err(Error::NotCaptureDevice(path));
        }

        info!(
            "Opened {:?} ({}, driver {})",
            path, capabilities.card, capabilities.driver
        );

        Ok(Self {
            path,
            driver,
            capabilities,
            format: None,
            pool: None,
            state: StreamState::Stopped,
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn format(&self) -> Option<Format> {
        self.format
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn pool(&self) -> Option<&FrameBufferPool<D::Region>> {
        self.pool.as_ref()
    }

    /// Buffer ownership counts, all zero before buffers are requested.
    pub fn counts(&self) -> StateCounts {
        self.pool.as_ref().map(|p| p.counts()).unwrap_or_default()
    }

    /// Negotiate packed YUYV at exactly `width` x `height`.
    pub fn negotiate_format(&mut self, width: u32, height: u32) -> Result<Format> {
        let format_err = |reason: String| Error::FormatError {
            width,
            height,
            reason,
        };

        let format = self
            .driver
            .set_format(width, height, FOURCC_YUYV)
            .map_err(|e| format_err(format!("{}", e)))?;

        if format.fourcc != FOURCC_YUYV || format.width != width || format.height != height {
            return Err(format_err(format!(
                "device offered {}x{} {}",
                format.width,
                format.height,
                String::from_utf8_lossy(&format.fourcc)
            )));
        }

        // Frames are read as tightly packed rows
        let packed = width * 2;
        if format.bytes_per_line != packed {
            return Err(format_err(format!(
                "device pads rows to {} bytes, {} expected",
                format.bytes_per_line, packed
            )));
        }

        debug!("Negotiated {:?}", format);
        self.format = Some(format);

        Ok(format)
    }

    /// Ask the kernel for `count` buffers and map them all.
    ///
    /// The buffers start out [`crate::pool::BufferState::FreeInApp`], see
    /// [`CaptureDevice::queue_all`].
    pub fn request_buffers(&mut self, count: u32) -> Result<&FrameBufferPool<D::Region>> {
        if self.format.is_none() {
            return Err(Error::AllocationError(String::from(
                "format must be negotiated before requesting buffers",
            )));
        }
        if let Some(mut old) = self.pool.take() {
            old.release();
        }

        let granted = self
            .driver
            .request_buffers(count)
            .map_err(|e| Error::AllocationError(format!("{}", e)))?;

        if granted != count {
            warn!("Requested {} buffers, device granted {}", count, granted);
        }

        let driver = &mut self.driver;
        let pool = FrameBufferPool::allocate(granted as usize, |i| driver.map_buffer(i as u32))?;

        Ok(self.pool.get_or_insert(pool))
    }

    /// Hand every application-owned buffer to the kernel.
    pub fn queue_all(&mut self) -> Result<()> {
        let pool = self.pool.as_mut().ok_or(Error::NoBuffersQueued)?;

        for index in pool.free_indices() {
            self.driver
                .queue(index as u32)
                .map_err(|e| Error::RequeueError { index, source: e })?;
            pool.mark_queued(index)?;
        }

        Ok(())
    }

    /// Start streaming, at least one buffer must be queued.
    pub fn stream_on(&mut self) -> Result<()> {
        if self.state == StreamState::Streaming {
            return Ok(());
        }
        if self.counts().queued == 0 {
            return Err(Error::NoBuffersQueued);
        }

        self.driver.stream_on().map_err(Error::StreamError)?;
        self.state = StreamState::Streaming;
        info!("Streaming from {:?}", self.path);

        Ok(())
    }

    /// Stop streaming, returning all buffers to the application. Safe to call repeatedly.
    pub fn stream_off(&mut self) -> Result<()> {
        if self.state == StreamState::Stopped {
            return Ok(());
        }

        let result = self.driver.stream_off().map_err(Error::StreamError);

        // The kernel drops its claim on every buffer once the stream is off, even on error
        self.state = StreamState::Stopped;
        if let Some(pool) = self.pool.as_mut() {
            pool.reclaim_all();
        }
        info!("Stopped streaming from {:?}", self.path);

        result
    }

    /// Wait for the next filled buffer.
    pub fn dequeue(&mut self) -> Result<FrameBuffer> {
        if self.state != StreamState::Streaming {
            return Err(Error::DequeueError(io::Error::new(
                io::ErrorKind::NotConnected,
                "device is not streaming",
            )));
        }
        let pool = self.pool.as_mut().ok_or(Error::NoBuffersQueued)?;

        let d = self.driver.dequeue().map_err(Error::DequeueError)?;
        let index = d.index as usize;
        pool.mark_filled(index)?;

        Ok(FrameBuffer {
            index,
            bytes_used: d.bytes_used,
        })
    }

    /// Contents of a dequeued buffer.
    pub fn frame(&self, buffer: &FrameBuffer) -> Result<&[u8]> {
        let pool = self.pool.as_ref().ok_or(Error::NoBuffersQueued)?;
        let data = pool.data(buffer.index)?;

        if buffer.bytes_used > 0 && buffer.bytes_used <= data.len() {
            Ok(&data[..buffer.bytes_used])
        } else {
            Ok(data)
        }
    }

    /// Give a consumed buffer back to the kernel.
    pub fn requeue(&mut self, buffer: FrameBuffer) -> Result<()> {
        let index = buffer.index;
        let pool = self.pool.as_mut().ok_or(Error::NoBuffersQueued)?;

        pool.mark_consumed(index)?;
        self.driver
            .queue(index as u32)
            .map_err(|e| Error::RequeueError { index, source: e })?;
        pool.mark_queued(index)
    }

    /// Stop streaming and unmap all buffers. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }

        if let Err(e) = self.stream_off() {
            warn!("Error stopping stream on close: {}", e);
        }
        if let Some(pool) = self.pool.as_mut() {
            pool.release();
        }
        self.closed = true;

        debug!("Closed {:?}", self.path);
    }
}

impl<D: VideoDriver> Drop for CaptureDevice<D> {
    fn drop(&mut self) {
        self.close();
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {

    use super::*;
    use crate::pattern::{Pattern, PatternDriver};
    use image::Rgb;

    fn device() -> CaptureDevice<PatternDriver> {
        let driver = PatternDriver::new(64, 48, Pattern::Solid(Rgb([0, 0, 0])));
        CaptureDevice::with_driver("pattern", driver).unwrap()
    }

    #[test]
    fn test_open_missing_path() {
        assert!(matches!(
            CaptureDevice::open("/dev/does-not-exist-camrot"),
            Err(Error::FileNotFound(_))
        ));
    }

    #[test]
    fn test_not_capture_device() {
        let driver = PatternDriver::new(64, 48, Pattern::Solid(Rgb([0, 0, 0]))).without_capture();

        assert!(matches!(
            CaptureDevice::with_driver("pattern", driver),
            Err(Error::NotCaptureDevice(_))
        ));
    }

    #[test]
    fn test_format_rejected() {
        let mut dev = device();

        assert!(matches!(
            dev.negotiate_format(1920, 1080),
            Err(Error::FormatError { .. })
        ));
        assert!(dev.request_buffers(4).is_err());
    }

    #[test]
    fn test_padded_stride_rejected() {
        let driver = PatternDriver::new(64, 48, Pattern::Bars).with_stride(192);
        let mut dev = CaptureDevice::with_driver("pattern", driver).unwrap();

        match dev.negotiate_format(64, 48) {
            Err(Error::FormatError { width, height, reason }) => {
                assert_eq!((width, height), (64, 48));
                assert!(reason.contains("192"));
            }
            other => panic!("expected a format error, got {:?}", other),
        }
        assert!(dev.format().is_none());
    }

    #[test]
    fn test_frame_honours_bytes_used() {
        let len = 64 * 48 * 2;
        let cases = [(0, 100), (1, 0), (2, len + 8)];

        for (nth, bytes_used) in cases {
            let driver =
                PatternDriver::new(64, 48, Pattern::Bars).with_short_frame(nth, bytes_used);
            let mut dev = CaptureDevice::with_driver("pattern", driver).unwrap();
            dev.negotiate_format(64, 48).unwrap();
            dev.request_buffers(4).unwrap();
            dev.queue_all().unwrap();
            dev.stream_on().unwrap();

            for i in 0..3 {
                let buffer = dev.dequeue().unwrap();
                let expected = if i == nth && bytes_used == 100 { 100 } else { len };

                // Zero or oversized counts fall back to the whole buffer
                assert_eq!(dev.frame(&buffer).unwrap().len(), expected);
                dev.requeue(buffer).unwrap();
            }
        }
    }

    #[test]
    fn test_stream_on_requires_queued() {
        let mut dev = device();
        dev.negotiate_format(64, 48).unwrap();
        dev.request_buffers(4).unwrap();

        assert!(matches!(dev.stream_on(), Err(Error::NoBuffersQueued)));

        dev.queue_all().unwrap();
        dev.stream_on().unwrap();
        assert_eq!(dev.state(), StreamState::Streaming);
    }

    #[test]
    fn test_frame_cycle_returns_buffers() {
        let mut dev = device();
        let format = dev.negotiate_format(64, 48).unwrap();
        let n = dev.request_buffers(4).unwrap().len();
        assert_eq!(dev.counts().free, n);

        dev.queue_all().unwrap();
        dev.stream_on().unwrap();

        for _ in 0..10 {
            let buffer = dev.dequeue().unwrap();
            assert_eq!(dev.counts().filled, 1);
            assert_eq!(dev.counts().total(), n);
            assert_eq!(dev.frame(&buffer).unwrap().len(), format.frame_len());

            dev.requeue(buffer).unwrap();
            assert_eq!(dev.counts().queued, n);
        }

        dev.stream_off().unwrap();
        dev.stream_off().unwrap();
        assert_eq!(dev.counts().free, n);
    }

    #[test]
    fn test_dequeue_requires_streaming() {
        let mut dev = device();
        dev.negotiate_format(64, 48).unwrap();
        dev.request_buffers(2).unwrap();
        dev.queue_all().unwrap();

        assert!(matches!(dev.dequeue(), Err(Error::DequeueError(_))));
    }

    #[test]
    fn test_close_idempotent() {
        let mut dev = device();
        dev.negotiate_format(64, 48).unwrap();
        dev.request_buffers(2).unwrap();
        dev.queue_all().unwrap();
        dev.stream_on().unwrap();

        dev.close();
        dev.close();
        assert_eq!(dev.state(), StreamState::Stopped);
        assert!(dev.pool().unwrap().is_released());
    }
}
