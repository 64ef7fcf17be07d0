//! # `camrot` Error module
//!
//! Provides abstractions over errors which can occur during this crate's use.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::path::PathBuf;

use serde_any;
use thiserror;

use crate::pool::BufferState;

// -----------------------------------------------------------------------------------------------
// ENUMERATIONS
// -----------------------------------------------------------------------------------------------

/// Result type used by faillible functions inside the `camrot` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents errors which can occur during use of the `camrot` crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Cannot find file at {0:?}")]
    FileNotFound(PathBuf),

    #[error("Error deserialising data: {0}")]
    DeserialisationError(serde_any::Error),

    #[error("Error building capture device: {0}")]
    BuildError(String),

    #[error("Cannot open video device {path:?}: {source}")]
    DeviceOpenError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Device {0:?} does not support streaming video capture")]
    NotCaptureDevice(PathBuf),

    #[error("Device rejected the {width}x{height} YUYV format: {reason}")]
    FormatError {
        width: u32,
        height: u32,
        reason: String,
    },

    #[error("Cannot query the frame sizes of {path:?}: {reason}")]
    ResolutionQueryError { path: PathBuf, reason: String },

    #[error("Error allocating capture buffers: {0}")]
    AllocationError(String),

    #[error("Error toggling the capture stream: {0}")]
    StreamError(std::io::Error),

    #[error("Cannot start streaming, no buffers are queued to the kernel")]
    NoBuffersQueued,

    #[error("Error dequeuing a capture buffer: {0}")]
    DequeueError(std::io::Error),

    #[error("Error requeuing capture buffer {index}: {source}")]
    RequeueError {
        index: usize,
        source: std::io::Error,
    },

    #[error("Capture buffer {index} is {actual:?}, expected {expected:?}")]
    BufferStateError {
        index: usize,
        expected: BufferState,
        actual: BufferState,
    },

    #[error("Cannot open angle channel {name}: {source}")]
    ChannelOpenError {
        name: String,
        source: std::io::Error,
    },

    #[error("Error sending on the angle channel: {0}")]
    ChannelSendError(SendError),

    #[error("Error receiving on the angle channel: {0}")]
    ChannelReceiveError(String),

    #[error("Malformed angle message {0:?}")]
    MalformedMessage(String),

    #[error("Captured frame holds {actual} bytes, a {width}x{height} YUYV frame needs {expected}")]
    FrameSizeError {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("Presentation surface error: {0}")]
    PresentationError(String),

    #[error("Shader backend error: {0}")]
    ShaderError(String),

    #[error("Rotation backend {0} is not available in this build")]
    BackendUnavailable(String),

    #[error("Error occured while launching the renderer: {0}")]
    LaunchError(std::io::Error),

    #[error("Cannot install the stop signal handler: {0}")]
    SignalError(String),

    #[error("Error joining the angle receiver thread")]
    ThreadJoinError,
}

/// Reasons a message could not be placed on the angle channel.
#[derive(thiserror::Error, Debug)]
pub enum SendError {
    #[error("channel is full")]
    Full,

    #[error("message of {0} bytes exceeds the channel's message size")]
    TooLarge(usize),

    #[error("channel is closed or was never opened")]
    Disconnected,

    #[error("{0}")]
    Io(std::io::Error),
}

impl From<SendError> for Error {
    fn from(e: SendError) -> Self {
        Error::ChannelSendError(e)
    }
}
