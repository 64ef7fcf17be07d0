//! # `CaptureBuilder` implementation
//!
//! This module implements the builder for capture devices, which takes a device from closed to
//! ready to stream: opened, format negotiated, buffers mapped and queued to the kernel.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::path::{Path, PathBuf};

use log::debug;

use crate::capture::{CaptureDevice, VideoDriver};
use crate::error::{Error, Result};
use crate::v4l2::V4l2Driver;

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// Number of capture buffers requested unless told otherwise.
pub const DEFAULT_NUM_BUFFERS: u32 = 4;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

pub struct CaptureBuilder {
    path: Option<PathBuf>,

    resolution: (u32, u32),

    num_buffers: u32,
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl CaptureBuilder {
    pub fn new() -> Self {
        Self {
            path: None,
            resolution: (640, 480),
            num_buffers: DEFAULT_NUM_BUFFERS,
        }
    }

    /// Specify the path of the camera, i.e. the device path, such as `/dev/video1`
    ///
    /// # Returns
    /// - `self` if the path exists, `Err` otherwise
    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        if path.as_ref().exists() {
            self.path = Some(path.as_ref().to_path_buf());

            Ok(self)
        } else {
            Err(Error::FileNotFound(path.as_ref().to_path_buf()))
        }
    }

    /// Set the resolution of the camera.
    ///
    /// Default value is `(640, 480)`.
    pub fn resolution(mut self, resolution: (u32, u32)) -> Self {
        self.resolution = resolution;

        self
    }

    /// Set the number of buffers in the kernel queue.
    ///
    /// Default value is 4, at least 2 are needed.
    pub fn num_buffers(mut self, num_buffers: u32) -> Self {
        self.num_buffers = num_buffers;

        self
    }

    /// Open the V4L2 device and prepare it for streaming.
    ///
    /// The device is taken from closed to ready in one go:
    /// - the node is opened and checked for streaming capture,
    /// - packed YUYV is negotiated at exactly the requested resolution, with unpadded rows,
    /// - the buffers are requested and mapped, all or nothing,
    /// - every buffer is queued to the kernel.
    ///
    /// Streaming itself is left off, see [`CaptureDevice::stream_on`].
    ///
    /// # Returns
    /// - The ready device
    /// - `Err(BuildError)` if no path was given, or the error of whichever step failed
    ///
    /// # Example
    /// ```rust,no_run
    /// use camrot::CaptureBuilder;
    ///
    /// let device = CaptureBuilder::new()
    ///     .path("/dev/video0")?
    ///     .resolution((1280, 720))
    ///     .build()?;
    /// # Ok::<(), camrot::Error>(())
    /// ```
    pub fn build(self) -> Result<CaptureDevice<V4l2Driver>> {
        let path = match &self.path {
            Some(p) => p.clone(),
            None => return Err(Error::BuildError(String::from("Missing device path"))),
        };

        let device = CaptureDevice::open(path)?;

        self.prepare(device)
    }

    /// Prepare a device backed by `driver` for streaming.
    ///
    /// The path is optional here, it is only used to name the device.
    pub fn build_with<D: VideoDriver>(self, driver: D) -> Result<CaptureDevice<D>> {
        let path = self
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from("pattern"));

        let device = CaptureDevice::with_driver(path, driver)?;

        self.prepare(device)
    }

    fn prepare<D: VideoDriver>(&self, mut device: CaptureDevice<D>) -> Result<CaptureDevice<D>> {
        let (width, height) = self.resolution;

        device.negotiate_format(width, height)?;
        device.request_buffers(self.num_buffers)?;
        device.queue_all()?;

        debug!(
            "{:?} ready with {} buffers queued",
            device.path(),
            device.counts().queued
        );

        Ok(device)
    }
}

impl Default for CaptureBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {

    use super::*;
    use crate::capture::StreamState;
    use crate::pattern::{Pattern, PatternDriver};

    #[test]
    fn test_missing_path() {
        assert!(matches!(
            CaptureBuilder::new().path("/dev/not-a-camera-camrot"),
            Err(Error::FileNotFound(_))
        ));
        assert!(matches!(
            CaptureBuilder::new().build(),
            Err(Error::BuildError(_))
        ));
    }

    #[test]
    fn test_build_with_pattern() {
        let device = CaptureBuilder::new()
            .resolution((32, 16))
            .num_buffers(3)
            .build_with(PatternDriver::new(32, 16, Pattern::Bars))
            .expect("Cannot build pattern device");

        assert_eq!(device.state(), StreamState::Stopped);
        assert_eq!(device.counts().queued, 3);
        assert_eq!(device.format().map(|f| f.frame_len()), Some(32 * 16 * 2));
    }

    #[test]
    fn test_too_few_buffers() {
        let result = CaptureBuilder::new()
            .resolution((32, 16))
            .num_buffers(1)
            .build_with(PatternDriver::new(32, 16, Pattern::Bars));

        assert!(matches!(result, Err(Error::AllocationError(_))));
    }
}
