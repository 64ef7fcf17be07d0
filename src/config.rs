//! # Configuration Module
//!
//! Settings shared by the renderer and the control front end. A [`Config`] is loaded from any
//! file type supported by [`serde_any`](https://docs.rs/serde_any/0.5.0/serde_any/), the format
//! being guessed from the extension. Missing keys take their default values.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::path::{Path, PathBuf};
use std::time::Duration;

use image::Rgba;
use serde::Deserialize;
use serde_any;

use crate::backend::{BackendKind, BackendOptions};
use crate::builder::DEFAULT_NUM_BUFFERS;
use crate::channel::{ReceivePolicy, DEFAULT_CAPACITY, DEFAULT_MESSAGE_SIZE};
use crate::error::{Error, Result};
use crate::mqueue::QueueAttributes;

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// Name of the angle queue unless configured otherwise.
pub const DEFAULT_QUEUE_NAME: &str = "/camrot-angle";

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name of the POSIX message queue carrying angles
    pub queue_name: String,

    pub queue_capacity: usize,

    /// Maximum size of one angle message in bytes
    pub message_size: usize,

    /// Permission bits of a newly created queue
    pub queue_permissions: u32,

    /// Number of capture buffers
    pub num_buffers: u32,

    pub backend: BackendKind,

    pub receive_policy: ReceivePolicy,

    /// Margin colour of the fixed step backend
    pub blit_background: [u8; 4],

    /// Corner colour of the affine backend
    pub affine_background: [u8; 4],

    /// Clear colour of the shader backend
    pub shader_clear: [u8; 4],

    pub window_title: String,

    /// Renderer executable launched by the control front end
    pub renderer: PathBuf,

    /// Frame interval of the synthetic pattern source in milliseconds
    pub pattern_interval_ms: u64,
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl Config {
    /// Load the configuration from a file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        // Check the file exists
        if !path.as_ref().exists() {
            return Err(Error::FileNotFound(path.as_ref().to_path_buf()));
        }

        serde_any::from_file(path).map_err(Error::DeserialisationError)
    }

    /// Load from `path` if one is given, otherwise use the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => Ok(Self::default()),
        }
    }

    pub fn queue_attributes(&self) -> QueueAttributes {
        QueueAttributes {
            capacity: self.queue_capacity,
            message_size: self.message_size,
            permissions: self.queue_permissions,
        }
    }

    pub fn backend_options(&self) -> BackendOptions {
        BackendOptions {
            blit_background: Rgba(self.blit_background),
            affine_background: Rgba(self.affine_background),
            shader_clear: Rgba(self.shader_clear),
        }
    }

    pub fn pattern_interval(&self) -> Duration {
        Duration::from_millis(self.pattern_interval_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        let options = BackendOptions::default();

        Self {
            queue_name: String::from(DEFAULT_QUEUE_NAME),
            queue_capacity: DEFAULT_CAPACITY,
            message_size: DEFAULT_MESSAGE_SIZE,
            queue_permissions: 0o664,
            num_buffers: DEFAULT_NUM_BUFFERS,
            backend: BackendKind::default(),
            receive_policy: ReceivePolicy::default(),
            blit_background: options.blit_background.0,
            affine_background: options.affine_background.0,
            shader_clear: options.shader_clear.0,
            window_title: String::from("camrot"),
            renderer: PathBuf::from("camrot"),
            pattern_interval_ms: 33,
        }
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------
