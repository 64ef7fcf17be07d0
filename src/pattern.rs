//! # Test Pattern Module
//!
//! [`PatternDriver`] is a synthetic [`VideoDriver`] which behaves like a capture device
//! producing a fixed test pattern. Buffers move through the same queue/dequeue cycle as they
//! would with the kernel, so the whole pipeline can run without a camera.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::collections::VecDeque;
use std::io;
use std::thread;
use std::time::Duration;

use image::Rgb;
use log::debug;

use crate::capture::{Capabilities, Dequeued, Format, VideoDriver, FOURCC_YUYV};
use crate::convert::encode_yuyv;
use crate::pool::HeapRegion;

// -----------------------------------------------------------------------------------------------
// ENUMERATIONS
// -----------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pattern {
    /// The whole frame is one colour
    Solid(Rgb<u8>),

    /// Left and right halves in different colours
    Split { left: Rgb<u8>, right: Rgb<u8> },

    /// Eight vertical colour bars
    Bars,
}

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

pub struct PatternDriver {
    width: u32,
    height: u32,
    frame: Vec<u8>,
    buffers: u32,
    queued: VecDeque<u32>,
    streaming: bool,
    capture: bool,
    interval: Option<Duration>,
    frame_limit: Option<u64>,
    bytes_per_line: Option<u32>,
    short_frame: Option<(u64, usize)>,
    delivered: u64,
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl Pattern {
    /// Colour of the pixel at `(x, y)` in a `width` wide frame.
    pub fn colour(&self, x: u32, _y: u32, width: u32) -> Rgb<u8> {
        match *self {
            Pattern::Solid(c) => c,
            Pattern::Split { left, right } => {
                if x < width / 2 {
                    left
                } else {
                    right
                }
            }
            Pattern::Bars => {
                const BARS: [[u8; 3]; 8] = [
                    [255, 255, 255],
                    [255, 255, 0],
                    [0, 255, 255],
                    [0, 255, 0],
                    [255, 0, 255],
                    [255, 0, 0],
                    [0, 0, 255],
                    [0, 0, 0],
                ];
                let bar = (x as usize * BARS.len()) / width.max(1) as usize;
                Rgb(BARS[bar.min(BARS.len() - 1)])
            }
        }
    }
}

impl PatternDriver {
    /// A source producing `pattern` at a fixed `width` x `height`.
    ///
    /// `width` is rounded down to an even number of pixels.
    pub fn new(width: u32, height: u32, pattern: Pattern) -> Self {
        let width = width & !1;
        let frame = encode_yuyv(width, height, |x, y| pattern.colour(x, y, width));

        Self {
            width,
            height,
            frame,
            buffers: 0,
            queued: VecDeque::new(),
            streaming: false,
            capture: true,
            interval: None,
            frame_limit: None,
            bytes_per_line: None,
            short_frame: None,
            delivered: 0,
        }
    }

    /// Sleep this long in every dequeue, pacing the source like a real camera.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Fail every dequeue after `limit` frames, like a device being unplugged.
    pub fn with_frame_limit(mut self, limit: u64) -> Self {
        self.frame_limit = Some(limit);
        self
    }

    /// Report padded rows of `bytes_per_line` when the format is set.
    pub fn with_stride(mut self, bytes_per_line: u32) -> Self {
        self.bytes_per_line = Some(bytes_per_line);
        self
    }

    /// Report only `bytes_used` bytes for the `frame`th dequeue, counting from zero.
    pub fn with_short_frame(mut self, frame: u64, bytes_used: usize) -> Self {
        self.short_frame = Some((frame, bytes_used));
        self
    }

    /// Report no capture capability.
    pub fn without_capture(mut self) -> Self {
        self.capture = false;
        self
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }
}

impl VideoDriver for PatternDriver {
    type Region = HeapRegion;

    fn capabilities(&mut self) -> io::Result<Capabilities> {
        Ok(Capabilities {
            driver: String::from("pattern"),
            card: String::from("Test Pattern"),
            capture: self.capture,
            streaming: true,
        })
    }

    fn set_format(&mut self, _width: u32, _height: u32, _fourcc: [u8; 4]) -> io::Result<Format> {
        // Like a real driver the nearest supported format is returned, here the only one
        Ok(Format {
            width: self.width,
            height: self.height,
            fourcc: FOURCC_YUYV,
            bytes_per_line: self.bytes_per_line.unwrap_or(self.width * 2),
            size_image: self.frame.len() as u32,
        })
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        self.buffers = count;
        self.queued.clear();
        Ok(count)
    }

    fn map_buffer(&mut self, index: u32) -> io::Result<HeapRegion> {
        if index >= self.buffers {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }

        Ok(HeapRegion::new(self.frame.clone()))
    }

    fn queue(&mut self, index: u32) -> io::Result<()> {
        if index >= self.buffers || self.queued.contains(&index) {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }

        self.queued.push_back(index);
        Ok(())
    }

    fn dequeue(&mut self) -> io::Result<Dequeued> {
        if !self.streaming {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "not streaming"));
        }
        if let Some(limit) = self.frame_limit {
            if self.delivered >= limit {
                debug!("Pattern source exhausted after {} frames", self.delivered);
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "pattern source exhausted",
                ));
            }
        }

        let index = self
            .queued
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::WouldBlock, "no buffers queued"))?;

        if let Some(interval) = self.interval {
            thread::sleep(interval);
        }

        let bytes_used = match self.short_frame {
            Some((frame, bytes_used)) if frame == self.delivered => bytes_used,
            _ => self.frame.len(),
        };
        self.delivered += 1;

        Ok(Dequeued { index, bytes_used })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        self.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        self.streaming = false;
        self.queued.clear();
        Ok(())
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_buffers_cycle_in_order() {
        let mut driver = PatternDriver::new(8, 2, Pattern::Bars);
        driver.request_buffers(3).unwrap();
        for i in 0..3 {
            driver.queue(i).unwrap();
        }
        assert!(driver.queue(1).is_err());

        driver.stream_on().unwrap();
        assert_eq!(driver.dequeue().unwrap().index, 0);
        assert_eq!(driver.dequeue().unwrap().index, 1);
        driver.queue(0).unwrap();
        assert_eq!(driver.dequeue().unwrap().index, 2);
        assert_eq!(driver.dequeue().unwrap().index, 0);
        assert!(driver.dequeue().is_err());
    }

    #[test]
    fn test_frame_limit() {
        let mut driver =
            PatternDriver::new(4, 2, Pattern::Solid(Rgb([0, 0, 0]))).with_frame_limit(1);
        driver.request_buffers(2).unwrap();
        driver.queue(0).unwrap();
        driver.queue(1).unwrap();
        driver.stream_on().unwrap();

        assert!(driver.dequeue().is_ok());
        assert_eq!(
            driver.dequeue().unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );
    }

    #[test]
    fn test_short_frame_reported_once() {
        let mut driver = PatternDriver::new(4, 2, Pattern::Bars).with_short_frame(1, 3);
        driver.request_buffers(2).unwrap();
        driver.queue(0).unwrap();
        driver.queue(1).unwrap();
        driver.stream_on().unwrap();

        assert_eq!(driver.dequeue().unwrap().bytes_used, 16);
        assert_eq!(driver.dequeue().unwrap().bytes_used, 3);
        driver.queue(0).unwrap();
        assert_eq!(driver.dequeue().unwrap().bytes_used, 16);
    }

    #[test]
    fn test_split_colour() {
        let p = Pattern::Split {
            left: Rgb([255, 0, 0]),
            right: Rgb([0, 0, 255]),
        };

        assert_eq!(p.colour(0, 0, 10), Rgb([255, 0, 0]));
        assert_eq!(p.colour(4, 0, 10), Rgb([255, 0, 0]));
        assert_eq!(p.colour(5, 0, 10), Rgb([0, 0, 255]));
        assert_eq!(Pattern::Bars.colour(9, 0, 10), Rgb([0, 0, 0]));
    }
}
