//! # Rotation Backends
//!
//! A [`RotationBackend`] takes one captured YUYV frame and the current angle, and writes an
//! RGBA frame ready for presentation. Three strategies exist:
//!
//! - [`FixedStepBlit`] quantises the angle into 90 degree steps and blits through a
//!   [`Blitter`],
//! - [`ContinuousAffine`] rotates by any angle on the CPU with bilinear resampling,
//! - `ContinuousShader` (feature `shader`) rotates by any angle on the GPU.
//!
//! The backend is chosen once at startup with [`create`].

// -----------------------------------------------------------------------------------------------
// MODULES
// -----------------------------------------------------------------------------------------------

pub mod affine;
pub mod blit;
#[cfg(feature = "shader")]
pub mod shader;

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use derive_more::Display;
use image::{Rgba, RgbaImage};
use serde::Deserialize;

use crate::convert::YuyvFrame;
use crate::error::{Error, Result};

pub use affine::ContinuousAffine;
pub use blit::{Blitter, Bucket, FixedStepBlit, Rect, SoftwareBlitter};
#[cfg(feature = "shader")]
pub use shader::ContinuousShader;

// -----------------------------------------------------------------------------------------------
// TRAITS
// -----------------------------------------------------------------------------------------------

pub trait RotationBackend {
    fn name(&self) -> &'static str;

    /// Rotate `frame` by `degrees` into `out`.
    ///
    /// `out` is resized to the frame's dimensions if needed. `degrees` may be any integer,
    /// negative values rotate the other way.
    fn transform(&mut self, frame: &YuyvFrame, degrees: i32, out: &mut RgbaImage) -> Result<()>;
}

// -----------------------------------------------------------------------------------------------
// ENUMERATIONS
// -----------------------------------------------------------------------------------------------

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[display(fmt = "fixed-step")]
    FixedStep,

    #[display(fmt = "affine")]
    Affine,

    #[display(fmt = "shader")]
    Shader,
}

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Fill colours used by the backends.
#[derive(Debug, Clone, Copy)]
pub struct BackendOptions {
    /// Margins left uncovered by a 90 or 270 degree blit
    pub blit_background: Rgba<u8>,

    /// Corners exposed by the affine rotation
    pub affine_background: Rgba<u8>,

    /// Margins left uncovered by the shader's rotated quad
    pub shader_clear: Rgba<u8>,
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::FixedStep
    }
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            blit_background: Rgba([255, 255, 255, 255]),
            affine_background: Rgba([0, 0, 0, 255]),
            shader_clear: Rgba([0, 0, 0, 255]),
        }
    }
}

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

/// Create the backend of the given kind.
pub fn create(kind: BackendKind, options: &BackendOptions) -> Result<Box<dyn RotationBackend>> {
    match kind {
        BackendKind::FixedStep => Ok(Box::new(FixedStepBlit::new(
            SoftwareBlitter,
            options.blit_background,
        ))),
        BackendKind::Affine => Ok(Box::new(ContinuousAffine::new(options.affine_background))),
        #[cfg(feature = "shader")]
        BackendKind::Shader => Ok(Box::new(ContinuousShader::new(
            SoftwareBlitter,
            options.shader_clear,
        )?)),
        #[cfg(not(feature = "shader"))]
        BackendKind::Shader => Err(Error::BackendUnavailable(kind.to_string())),
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_create_software_backends() {
        let options = BackendOptions::default();

        assert_eq!(
            create(BackendKind::FixedStep, &options).unwrap().name(),
            "fixed-step"
        );
        assert_eq!(create(BackendKind::Affine, &options).unwrap().name(), "affine");
    }

    #[cfg(not(feature = "shader"))]
    #[test]
    fn test_shader_unavailable() {
        assert!(matches!(
            create(BackendKind::Shader, &BackendOptions::default()),
            Err(Error::BackendUnavailable(_))
        ));
    }

    #[test]
    fn test_kind_names() {
        use clap::ValueEnum;

        for kind in [BackendKind::FixedStep, BackendKind::Affine, BackendKind::Shader] {
            let parsed = BackendKind::from_str(&kind.to_string(), false).unwrap();
            assert_eq!(parsed, kind);
        }
    }
}
