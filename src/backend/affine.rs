//! # Continuous Affine Backend
//!
//! Rotates by any whole-degree angle about the frame centre on the CPU, resampling with
//! bilinear interpolation. The visual turn is the complement of the input angle,
//! `360 - (angle mod 360)`, so an input of 90 turns the picture a quarter turn clockwise.

use image::{Rgba, RgbaImage};
use log::trace;
use nalgebra::{Point2, Rotation2, Vector2};

use super::RotationBackend;
use crate::angle::FULL_TURN;
use crate::convert::YuyvFrame;
use crate::error::Result;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

pub struct ContinuousAffine {
    background: Rgba<u8>,
    rgba: RgbaImage,
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl ContinuousAffine {
    pub fn new(background: Rgba<u8>) -> Self {
        Self {
            background,
            rgba: RgbaImage::new(0, 0),
        }
    }
}

impl RotationBackend for ContinuousAffine {
    fn name(&self) -> &'static str {
        "affine"
    }

    fn transform(&mut self, frame: &YuyvFrame, degrees: i32, out: &mut RgbaImage) -> Result<()> {
        frame.to_rgba_into(&mut self.rgba);

        let effective = FULL_TURN - degrees.rem_euclid(FULL_TURN);
        trace!("Affine rotation of {}° (effective {}°)", degrees, effective);

        if effective % FULL_TURN == 0 {
            if out.dimensions() != self.rgba.dimensions() {
                *out = RgbaImage::new(self.rgba.width(), self.rgba.height());
            }
            out.copy_from_slice(self.rgba.as_raw());
            return Ok(());
        }

        rotate_about_centre(
            &self.rgba,
            (effective as f64).to_radians(),
            self.background,
            out,
        );

        Ok(())
    }
}

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

/// Resample `src` into `out` through the rotation `theta` (radians) about the image centre.
///
/// Each destination pixel `p` samples `src` at `R(theta) (p - c) + c`, pixels outside the
/// source blend towards `background`.
pub fn rotate_about_centre(src: &RgbaImage, theta: f64, background: Rgba<u8>, out: &mut RgbaImage) {
    let (width, height) = src.dimensions();
    if out.dimensions() != (width, height) {
        *out = RgbaImage::new(width, height);
    }

    let rotation = Rotation2::new(theta);
    let centre = Point2::new((width as f64 - 1.0) / 2.0, (height as f64 - 1.0) / 2.0);

    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let offset = Vector2::new(x as f64, y as f64) - centre.coords;
        let source = centre + rotation * offset;

        *pixel = bilinear(src, source, background);
    }
}

fn bilinear(src: &RgbaImage, at: Point2<f64>, background: Rgba<u8>) -> Rgba<u8> {
    let x0 = at.x.floor();
    let y0 = at.y.floor();
    let fx = at.x - x0;
    let fy = at.y - y0;

    let fetch = |x: f64, y: f64| -> [f64; 4] {
        let px = if x < 0.0 || y < 0.0 || x >= src.width() as f64 || y >= src.height() as f64 {
            background
        } else {
            *src.get_pixel(x as u32, y as u32)
        };
        px.0.map(|c| c as f64)
    };

    let tl = fetch(x0, y0);
    let tr = fetch(x0 + 1.0, y0);
    let bl = fetch(x0, y0 + 1.0);
    let br = fetch(x0 + 1.0, y0 + 1.0);

    let mut result = [0u8; 4];
    for c in 0..4 {
        let top = tl[c] + (tr[c] - tl[c]) * fx;
        let bottom = bl[c] + (br[c] - bl[c]) * fx;
        result[c] = (top + (bottom - top) * fy).round().clamp(0.0, 255.0) as u8;
    }

    Rgba(result)
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------
