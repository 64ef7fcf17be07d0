//! # Colour Conversion Module
//!
//! Packed YUYV (YUV 4:2:2) frames as delivered by the capture device, and conversion between
//! them and RGBA. Coefficients are BT.601 limited range.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use image::{Rgb, Rgba, RgbaImage};

use crate::error::{Error, Result};

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Borrowed view of one packed YUYV frame.
///
/// Every pair of horizontally adjacent pixels shares one `U` and one `V` sample, laid out as
/// `Y0 U Y1 V`.
#[derive(Debug, Clone, Copy)]
pub struct YuyvFrame<'a> {
    width: u32,
    height: u32,
    data: &'a [u8],
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl<'a> YuyvFrame<'a> {
    /// Wrap `data`, which must hold at least `width * height * 2` bytes. Any trailing bytes are
    /// ignored.
    pub fn new(width: u32, height: u32, data: &'a [u8]) -> Result<Self> {
        let expected = width as usize * height as usize * 2;

        if data.len() < expected || width % 2 != 0 {
            return Err(Error::FrameSizeError {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }

        Ok(Self {
            width,
            height,
            data: &data[..expected],
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Convert the whole frame into `out`, reallocating it if its dimensions differ.
    pub fn to_rgba_into(&self, out: &mut RgbaImage) {
        if out.dimensions() != self.dimensions() {
            *out = RgbaImage::new(self.width, self.height);
        }

        for (quad, pixels) in self
            .data
            .chunks_exact(4)
            .zip(out.as_mut().chunks_exact_mut(8))
        {
            let [y0, u, y1, v] = [quad[0], quad[1], quad[2], quad[3]];

            pixels[..3].copy_from_slice(&yuv_to_rgb(y0, u, v));
            pixels[3] = 255;
            pixels[4..7].copy_from_slice(&yuv_to_rgb(y1, u, v));
            pixels[7] = 255;
        }
    }

    pub fn to_rgba(&self) -> RgbaImage {
        let mut out = RgbaImage::new(self.width, self.height);
        self.to_rgba_into(&mut out);
        out
    }
}

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = 1.164 * (y as f32 - 16.0);
    let d = u as f32 - 128.0;
    let e = v as f32 - 128.0;

    [
        clamp(c + 1.596 * e),
        clamp(c - 0.391 * d - 0.813 * e),
        clamp(c + 2.018 * d),
    ]
}

pub fn rgb_to_yuv(rgb: Rgb<u8>) -> [u8; 3] {
    let [r, g, b] = rgb.0.map(|c| c as f32);

    [
        clamp(16.0 + 0.257 * r + 0.504 * g + 0.098 * b),
        clamp(128.0 - 0.148 * r - 0.291 * g + 0.439 * b),
        clamp(128.0 + 0.439 * r - 0.368 * g - 0.071 * b),
    ]
}

/// Build a packed YUYV frame from a per-pixel colour function. `width` must be even.
///
/// Chroma is averaged over each horizontal pixel pair.
pub fn encode_yuyv<F>(width: u32, height: u32, colour: F) -> Vec<u8>
where
    F: Fn(u32, u32) -> Rgb<u8>,
{
    let mut data = Vec::with_capacity(width as usize * height as usize * 2);

    for y in 0..height {
        for x in (0..width).step_by(2) {
            let [y0, u0, v0] = rgb_to_yuv(colour(x, y));
            let [y1, u1, v1] = rgb_to_yuv(colour(x + 1, y));

            data.extend_from_slice(&[
                y0,
                ((u0 as u16 + u1 as u16) / 2) as u8,
                y1,
                ((v0 as u16 + v1 as u16) / 2) as u8,
            ]);
        }
    }

    data
}

/// Whether two colours agree within `tolerance` on every channel.
pub fn approx_eq(a: Rgba<u8>, b: Rgba<u8>, tolerance: u8) -> bool {
    a.0.iter()
        .zip(b.0.iter())
        .all(|(x, y)| x.abs_diff(*y) <= tolerance)
}

fn clamp(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------
