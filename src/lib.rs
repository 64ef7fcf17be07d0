//! # Rotating camera viewer
//!
//! This crate captures frames from a V4L2 camera, rotates each one by an angle which can be
//! changed at any time from another process, and shows the result in a Wayland window.
//! Only Linux is supported.
//!
//! ## Dependencies
//!
//! Before installing make sure that the following dependencies are installed:
//!
//! - V4L2 - video for linux 2, including the dev headers
//! - A Wayland compositor implementing `xdg_wm_base`
//!
//! ### Ubuntu
//!
//! ```shell
//! sudo apt install v4l-utils libv4l-dev libwayland-dev
//! ```
//!
//! ## Rotation backends
//!
//! - `fixed-step` snaps the angle to the nearest lower multiple of 90 degrees and blits
//! - `affine` rotates continuously about the frame centre with bilinear sampling
//! - `shader` rotates continuously on the GPU, only with the `shader` feature
//!
//! ## Usage
//!
//! ```no_run
//! use camrot::prelude::*;
//!
//! // Open the camera, negotiate 1280x720 YUYV and queue its buffers
//! let device = CaptureBuilder::new()
//!     .path("/dev/video0")
//!     .expect("Cannot find camera at specified path")
//!     .resolution((1280, 720))
//!     .build()
//!     .expect("Failed to open camera");
//!
//! let backend = create(BackendKind::Affine, &BackendOptions::default()).unwrap();
//! let surface = WaylandSurface::connect(1280, 720, "camrot").unwrap();
//!
//! let mut pipeline = PipelineDriver::new(device, backend, surface, PipelineContext::new(30));
//! let report = pipeline.run(None).expect("Pipeline failed");
//! ```
//!
//! Angles are changed by sending them to the renderer's message queue, see
//! [`channel::AngleSender`] and [`mqueue::PosixQueue`].

// -----------------------------------------------------------------------------------------------
// EXPORTS
// -----------------------------------------------------------------------------------------------

pub use crate::angle::{Angle, RotationAngle};
pub use crate::backend::{create, BackendKind, BackendOptions, RotationBackend};
pub use crate::builder::CaptureBuilder;
pub use crate::capture::{CaptureDevice, VideoDriver};
pub use crate::config::Config;
pub use crate::driver::{PipelineContext, PipelineDriver, PipelineReport, PipelineState, StopReason};
pub use crate::error::{Error, Result};
pub use crate::surface::PresentationSurface;
pub use crate::wayland::WaylandSurface;

// -----------------------------------------------------------------------------------------------
// MODULES
// -----------------------------------------------------------------------------------------------

pub mod angle;
pub mod backend;
pub mod builder;
pub mod capture;
pub mod channel;
pub mod config;
pub mod control;
pub mod convert;
pub mod devices;
pub mod driver;
pub mod error;
pub mod mqueue;
pub mod pattern;
pub mod pool;
pub mod surface;
pub mod v4l2;
pub mod wayland;

pub mod prelude {
    pub use crate::{create, BackendKind, BackendOptions, RotationBackend};
    pub use crate::{Angle, RotationAngle};
    pub use crate::{CaptureBuilder, CaptureDevice, VideoDriver};
    pub use crate::{PipelineContext, PipelineDriver, PipelineReport, PipelineState, StopReason};
    pub use crate::{PresentationSurface, WaylandSurface};
}
