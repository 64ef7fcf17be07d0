//! # Rotation Angle Module
//!
//! Two views of the rotation angle live here. [`Angle`] is the control-side value which the
//! user steps around the circle, and [`RotationAngle`] is the cell shared between the angle
//! receiver thread and the pipeline loop.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::sync::atomic::{AtomicI32, Ordering};

use derive_more::Display;

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// Number of degrees in a full turn.
pub const FULL_TURN: i32 = 360;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// An angle in whole degrees, always inside `[0, 360)`.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[display(fmt = "{}°", _0)]
pub struct Angle(u16);

/// Angle shared between the receiver thread (single writer) and the pipeline (single reader).
///
/// Updates are last-write-wins, a reader may observe a value that is one frame stale.
#[derive(Debug, Default)]
pub struct RotationAngle {
    degrees: AtomicI32,
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl Angle {
    /// Create an angle, returning `None` if `degrees` is outside `0..=359`.
    pub fn new(degrees: i32) -> Option<Self> {
        if (0..FULL_TURN).contains(&degrees) {
            Some(Self(degrees as u16))
        } else {
            None
        }
    }

    /// Create an angle from any integer, wrapping it onto the circle.
    pub fn wrapping(degrees: i32) -> Self {
        Self(degrees.rem_euclid(FULL_TURN) as u16)
    }

    pub fn degrees(self) -> i32 {
        self.0 as i32
    }

    pub fn radians(self) -> f64 {
        (self.0 as f64).to_radians()
    }

    /// One degree further, 359 wraps to 0.
    pub fn increment(self) -> Self {
        if self.0 < 359 {
            Self(self.0 + 1)
        } else {
            Self(0)
        }
    }

    /// One degree back, 0 wraps to 359.
    pub fn decrement(self) -> Self {
        if self.0 >= 1 {
            Self(self.0 - 1)
        } else {
            Self(359)
        }
    }
}

impl RotationAngle {
    pub fn new(degrees: i32) -> Self {
        Self {
            degrees: AtomicI32::new(degrees),
        }
    }

    pub fn load(&self) -> i32 {
        self.degrees.load(Ordering::Relaxed)
    }

    pub fn store(&self, degrees: i32) {
        self.degrees.store(degrees, Ordering::Relaxed)
    }
}

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

/// Whether a raw angle is acceptable as rotation input.
///
/// Backends accept negative equivalents, so anything strictly inside one turn either way is
/// valid.
pub fn in_input_range(degrees: i32) -> bool {
    degrees > -FULL_TURN && degrees < FULL_TURN
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------
