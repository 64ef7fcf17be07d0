//! # Presentation Surface Module
//!
//! The display side of the pipeline. A [`PresentationSurface`] shows rotated frames, handing
//! each one to a free buffer of a double-buffered set and marking the whole area as damaged.
//!
//! Display protocol events are delivered to a [`SurfaceEvents`] handler. [`WindowState`] is the
//! handler used by every surface: it tracks configuration, close requests, the pointer and which
//! of the two presentation buffers the display side still holds.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use image::RgbaImage;
use log::{debug, trace};

use crate::error::Result;

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// Number of presentation buffers.
pub const SLOT_COUNT: usize = 2;

/// Linux input event code of the left mouse button.
pub const BTN_LEFT: u32 = 0x110;

// -----------------------------------------------------------------------------------------------
// TRAITS
// -----------------------------------------------------------------------------------------------

pub trait PresentationSurface {
    /// Process all pending display events without blocking.
    fn dispatch(&mut self) -> Result<()>;

    /// Submit a frame for display.
    ///
    /// A frame is dropped, not an error, when the surface is not configured yet or every
    /// buffer is still held by the display.
    fn present(&mut self, frame: &RgbaImage) -> Result<Presentation>;

    /// Whether the user asked for the window to close.
    fn close_requested(&self) -> bool;
}

/// Handlers for display protocol events.
pub trait SurfaceEvents {
    fn surface_configure(&mut self, serial: u32);

    /// Suggested window size, zero meaning the client decides.
    fn toplevel_configure(&mut self, width: i32, height: i32);

    fn toplevel_close(&mut self);

    fn pointer_enter(&mut self, serial: u32, x: f64, y: f64);

    fn pointer_leave(&mut self, serial: u32);

    fn pointer_motion(&mut self, x: f64, y: f64);

    /// A button changed state, optionally asking the window manager to act.
    fn pointer_button(&mut self, serial: u32, button: u32, pressed: bool)
        -> Option<WindowRequest>;

    /// The display finished with the buffer in `slot`.
    fn buffer_release(&mut self, slot: usize);
}

// -----------------------------------------------------------------------------------------------
// ENUMERATIONS
// -----------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presentation {
    /// Frame attached and committed from this slot
    Submitted(usize),

    /// Frame dropped
    Dropped,
}

/// Requests a handler makes of the window manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowRequest {
    /// Start an interactive move
    Move { serial: u32 },
}

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Which presentation buffers are held by the display side.
#[derive(Debug, Clone, Default)]
pub struct SlotSet {
    busy: [bool; SLOT_COUNT],
}

#[derive(Debug, Clone, Default)]
pub struct WindowState {
    configured: bool,
    close_requested: bool,
    suggested_size: Option<(i32, i32)>,
    pointer: Option<(f64, f64)>,
    slots: SlotSet,
}

/// Presentation surface keeping frames in memory, with no display attached.
#[derive(Debug, Clone)]
pub struct MemorySurface {
    state: WindowState,
    auto_release: bool,
    last_frame: Option<RgbaImage>,
    submitted: usize,
    dropped: usize,
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl SlotSet {
    pub fn acquire(&mut self) -> Option<usize> {
        let index = self.busy.iter().position(|b| !b)?;
        self.busy[index] = true;
        Some(index)
    }

    pub fn release(&mut self, index: usize) {
        if let Some(b) = self.busy.get_mut(index) {
            *b = false;
        }
    }

    pub fn is_busy(&self, index: usize) -> bool {
        self.busy.get(index).copied().unwrap_or(false)
    }

    pub fn busy_count(&self) -> usize {
        self.busy.iter().filter(|b| **b).count()
    }
}

impl WindowState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn close_requested(&self) -> bool {
        self.close_requested
    }

    pub fn suggested_size(&self) -> Option<(i32, i32)> {
        self.suggested_size
    }

    pub fn pointer(&self) -> Option<(f64, f64)> {
        self.pointer
    }

    pub fn slots(&self) -> &SlotSet {
        &self.slots
    }

    /// Claim a buffer for the next frame, `None` if the frame must be dropped.
    pub fn begin_frame(&mut self) -> Option<usize> {
        if !self.configured {
            trace!("Surface not configured, dropping frame");
            return None;
        }

        let slot = self.slots.acquire();
        if slot.is_none() {
            debug!("Both presentation buffers busy, dropping frame");
        }
        slot
    }
}

impl SurfaceEvents for WindowState {
    fn surface_configure(&mut self, serial: u32) {
        trace!("Surface configure {}", serial);
        self.configured = true;
    }

    fn toplevel_configure(&mut self, width: i32, height: i32) {
        if width > 0 && height > 0 {
            self.suggested_size = Some((width, height));
        }
    }

    fn toplevel_close(&mut self) {
        debug!("Window close requested");
        self.close_requested = true;
    }

    fn pointer_enter(&mut self, _serial: u32, x: f64, y: f64) {
        self.pointer = Some((x, y));
    }

    fn pointer_leave(&mut self, _serial: u32) {
        self.pointer = None;
    }

    fn pointer_motion(&mut self, x: f64, y: f64) {
        self.pointer = Some((x, y));
    }

    fn pointer_button(
        &mut self,
        serial: u32,
        button: u32,
        pressed: bool,
    ) -> Option<WindowRequest> {
        if button == BTN_LEFT && pressed {
            Some(WindowRequest::Move { serial })
        } else {
            None
        }
    }

    fn buffer_release(&mut self, slot: usize) {
        self.slots.release(slot);
    }
}

impl MemorySurface {
    /// A configured surface. With `auto_release` set, each buffer is released as soon as it
    /// is submitted, otherwise it stays busy until released through [`MemorySurface::events`].
    pub fn new(auto_release: bool) -> Self {
        let mut state = WindowState::new();
        state.surface_configure(0);

        Self {
            state,
            auto_release,
            last_frame: None,
            submitted: 0,
            dropped: 0,
        }
    }

    pub fn events(&mut self) -> &mut WindowState {
        &mut self.state
    }

    pub fn last_frame(&self) -> Option<&RgbaImage> {
        self.last_frame.as_ref()
    }

    pub fn submitted(&self) -> usize {
        self.submitted
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

impl PresentationSurface for MemorySurface {
    fn dispatch(&mut self) -> Result<()> {
        Ok(())
    }

    fn present(&mut self, frame: &RgbaImage) -> Result<Presentation> {
        let slot = match self.state.begin_frame() {
            Some(s) => s,
            None => {
                self.dropped += 1;
                return Ok(Presentation::Dropped);
            }
        };

        self.last_frame = Some(frame.clone());
        self.submitted += 1;

        if self.auto_release {
            self.state.buffer_release(slot);
        }

        Ok(Presentation::Submitted(slot))
    }

    fn close_requested(&self) -> bool {
        self.state.close_requested()
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_slot_set() {
        let mut slots = SlotSet::default();

        assert_eq!(slots.acquire(), Some(0));
        assert_eq!(slots.acquire(), Some(1));
        assert_eq!(slots.acquire(), None);
        assert_eq!(slots.busy_count(), 2);

        slots.release(1);
        assert!(!slots.is_busy(1));
        assert_eq!(slots.acquire(), Some(1));

        slots.release(7);
        assert_eq!(slots.busy_count(), 2);
    }

    #[test]
    fn test_unconfigured_drops() {
        let mut state = WindowState::new();
        assert_eq!(state.begin_frame(), None);

        state.surface_configure(12);
        assert_eq!(state.begin_frame(), Some(0));
    }

    #[test]
    fn test_busy_buffers_drop_frames() {
        let mut surface = MemorySurface::new(false);
        let frame = RgbaImage::new(4, 4);

        assert_eq!(surface.present(&frame).unwrap(), Presentation::Submitted(0));
        assert_eq!(surface.present(&frame).unwrap(), Presentation::Submitted(1));
        assert_eq!(surface.present(&frame).unwrap(), Presentation::Dropped);

        surface.events().buffer_release(0);
        assert_eq!(surface.present(&frame).unwrap(), Presentation::Submitted(0));
        assert_eq!((surface.submitted(), surface.dropped()), (3, 1));
    }

    #[test]
    fn test_pointer_and_close() {
        let mut state = WindowState::new();

        state.pointer_enter(1, 3.0, 4.0);
        assert_eq!(state.pointer(), Some((3.0, 4.0)));
        assert_eq!(
            state.pointer_button(5, BTN_LEFT, true),
            Some(WindowRequest::Move { serial: 5 })
        );
        assert_eq!(state.pointer_button(6, BTN_LEFT, false), None);
        assert_eq!(state.pointer_button(7, 0x111, true), None);
        state.pointer_leave(8);
        assert_eq!(state.pointer(), None);

        state.toplevel_configure(0, 0);
        assert_eq!(state.suggested_size(), None);
        state.toplevel_close();
        assert!(state.close_requested());
    }
}
