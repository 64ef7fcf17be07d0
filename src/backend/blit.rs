//! # Fixed Step Blit Backend
//!
//! The angle is quantised into one of four 90 degree buckets and the frame is rotated by that
//! bucket in a single blit. When the frame is turned on its side the blit window is narrowed
//! and centred so that the rotated frame keeps its aspect ratio, and the uncovered margins are
//! filled with a background colour first.
//!
//! The blit itself goes through the [`Blitter`] trait, the seam where a 2D accelerator plugs
//! in. [`SoftwareBlitter`] implements it with `image`'s operations.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use log::trace;

use super::RotationBackend;
use crate::angle::FULL_TURN;
use crate::convert::YuyvFrame;
use crate::error::Result;

// -----------------------------------------------------------------------------------------------
// TRAITS
// -----------------------------------------------------------------------------------------------

/// Operations of a 2D blit engine.
pub trait Blitter {
    /// Colour convert a packed YUYV frame into RGBA.
    fn convert(&mut self, frame: &YuyvFrame, out: &mut RgbaImage) -> Result<()>;

    /// Rotate `src` by `bucket` and scale it to fill `window` inside `dst`.
    fn blit(&mut self, src: &RgbaImage, dst: &mut RgbaImage, window: Rect, bucket: Bucket)
        -> Result<()>;

    fn fill(&mut self, dst: &mut RgbaImage, colour: Rgba<u8>) -> Result<()>;
}

// -----------------------------------------------------------------------------------------------
// ENUMERATIONS
// -----------------------------------------------------------------------------------------------

/// A 90 degree aligned rotation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Destination window of a blit, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Software implementation of [`Blitter`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareBlitter;

pub struct FixedStepBlit<B: Blitter> {
    blitter: B,
    background: Rgba<u8>,
    rgba: RgbaImage,
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl Bucket {
    /// Bucket containing `degrees`. Negative angles fall in the same bucket as their positive
    /// equivalent, so -90 is treated as 270.
    pub fn from_degrees(degrees: i32) -> Self {
        match degrees.rem_euclid(FULL_TURN) / 90 {
            0 => Bucket::Deg0,
            1 => Bucket::Deg90,
            2 => Bucket::Deg180,
            _ => Bucket::Deg270,
        }
    }

    pub fn degrees(self) -> i32 {
        match self {
            Bucket::Deg0 => 0,
            Bucket::Deg90 => 90,
            Bucket::Deg180 => 180,
            Bucket::Deg270 => 270,
        }
    }

    /// Whether the bucket turns the frame on its side.
    pub fn is_orthogonal(self) -> bool {
        matches!(self, Bucket::Deg90 | Bucket::Deg270)
    }
}

impl Rect {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }
}

impl Blitter for SoftwareBlitter {
    fn convert(&mut self, frame: &YuyvFrame, out: &mut RgbaImage) -> Result<()> {
        frame.to_rgba_into(out);
        Ok(())
    }

    fn blit(
        &mut self,
        src: &RgbaImage,
        dst: &mut RgbaImage,
        window: Rect,
        bucket: Bucket,
    ) -> Result<()> {
        // Bucket 90 turns counter-clockwise, 270 clockwise
        let rotated = match bucket {
            Bucket::Deg0 => None,
            Bucket::Deg90 => Some(imageops::rotate270(src)),
            Bucket::Deg180 => Some(imageops::rotate180(src)),
            Bucket::Deg270 => Some(imageops::rotate90(src)),
        };
        let rotated = rotated.as_ref().unwrap_or(src);

        if rotated.dimensions() == (window.width, window.height) {
            imageops::replace(dst, rotated, window.x as i64, window.y as i64);
        } else {
            let scaled =
                imageops::resize(rotated, window.width, window.height, FilterType::Triangle);
            imageops::replace(dst, &scaled, window.x as i64, window.y as i64);
        }

        Ok(())
    }

    fn fill(&mut self, dst: &mut RgbaImage, colour: Rgba<u8>) -> Result<()> {
        for pixel in dst.pixels_mut() {
            *pixel = colour;
        }
        Ok(())
    }
}

impl<B: Blitter> FixedStepBlit<B> {
    pub fn new(blitter: B, background: Rgba<u8>) -> Self {
        Self {
            blitter,
            background,
            rgba: RgbaImage::new(0, 0),
        }
    }
}

impl<B: Blitter> RotationBackend for FixedStepBlit<B> {
    fn name(&self) -> &'static str {
        "fixed-step"
    }

    fn transform(&mut self, frame: &YuyvFrame, degrees: i32, out: &mut RgbaImage) -> Result<()> {
        let (width, height) = frame.dimensions();
        if out.dimensions() != (width, height) {
            *out = RgbaImage::new(width, height);
        }

        self.blitter.convert(frame, &mut self.rgba)?;

        let bucket = Bucket::from_degrees(degrees);
        let window = crop_window(width, height, bucket);
        trace!("Blitting {}° as {:?} into {:?}", degrees, bucket, window);

        if bucket.is_orthogonal() {
            self.blitter.fill(out, self.background)?;
        }

        self.blitter.blit(&self.rgba, out, window, bucket)
    }
}

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

/// Window a frame rotated by `bucket` is blitted into.
///
/// For the orthogonal buckets the window spans the full height and is `height² / width` wide,
/// centred horizontally: `adjust = height² / (2 * width)` either side of the centre.
pub fn crop_window(width: u32, height: u32, bucket: Bucket) -> Rect {
    if !bucket.is_orthogonal() || width == 0 {
        return Rect::full(width, height);
    }

    let adjust = (height as u64 * height as u64 / (2 * width as u64)) as u32;
    let centre = width / 2;
    let left = centre.saturating_sub(adjust);
    let right = centre.saturating_add(adjust).min(width);

    Rect {
        x: left,
        y: 0,
        width: right - left,
        height,
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------
