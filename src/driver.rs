//! # Pipeline Driver Module
//!
//! [`PipelineDriver`] runs the per-frame cycle:
//!
//! ```text
//! Idle -> Streaming -> WaitFrame -> Dequeued -> Transformed -> Presented -> Requeued -> Streaming
//! ```
//!
//! A frame shorter than the negotiated format is skipped: its buffer goes straight back to the
//! kernel and the loop carries on. Any other failure at any step moves straight to `Stopped` and tears everything down: the stream is
//! turned off, buffers are unmapped, the device is closed, the angle receiver is stopped and
//! joined and the presentation surface is released. `Stopped` is terminal.
//!
//! Everything the loop shares with other threads lives in one [`PipelineContext`].

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use image::RgbaImage;
use log::{debug, error, info, trace, warn};

use crate::angle::RotationAngle;
use crate::backend::RotationBackend;
use crate::capture::{CaptureDevice, VideoDriver};
use crate::channel::{ReceiverExit, ReceiverHandle};
use crate::convert::YuyvFrame;
use crate::error::{Error, Result};
use crate::surface::{Presentation, PresentationSurface};

// -----------------------------------------------------------------------------------------------
// ENUMERATIONS
// -----------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Streaming,
    WaitFrame,
    Dequeued,
    Transformed,
    Presented,
    Requeued,
    Stopped,
}

/// Why a pipeline ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The requested number of frames was reached
    FrameLimit,

    /// The user closed the window
    CloseRequested,

    /// A stop was requested through the context, e.g. by a signal
    StopRequested,
}

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// State shared between the pipeline loop, the angle receiver and signal handlers.
pub struct PipelineContext {
    angle: Arc<RotationAngle>,
    stop: Arc<AtomicBool>,
    receiver: Option<ReceiverHandle>,
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineReport {
    pub reason: StopReason,
    pub frames: u64,
    pub presented: u64,
    pub dropped: u64,

    /// Frames skipped because the device delivered fewer bytes than the format needs
    pub skipped: u64,

    /// How the angle receiver ended, `None` if there was none or it was detached
    pub receiver: Option<ReceiverExit>,
}

pub struct PipelineDriver<D: VideoDriver, S: PresentationSurface> {
    device: Option<CaptureDevice<D>>,
    backend: Box<dyn RotationBackend>,
    surface: Option<S>,
    context: PipelineContext,
    state: PipelineState,
    output: RgbaImage,
    frames: u64,
    presented: u64,
    dropped: u64,
    skipped: u64,
    receiver_exit: Option<ReceiverExit>,
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl PipelineContext {
    pub fn new(initial_angle: i32) -> Self {
        Self {
            angle: Arc::new(RotationAngle::new(initial_angle)),
            stop: Arc::new(AtomicBool::new(false)),
            receiver: None,
        }
    }

    /// Attach the angle receiver, owned by the context from now on.
    pub fn with_receiver(mut self, receiver: ReceiverHandle) -> Self {
        self.receiver = Some(receiver);
        self
    }

    /// The shared angle cell, hand a clone to the receiver thread.
    pub fn angle(&self) -> &Arc<RotationAngle> {
        &self.angle
    }

    /// Flag which stops the pipeline at the start of the next frame once set.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn shutdown_receiver(&mut self) -> Option<ReceiverExit> {
        let receiver = self.receiver.take()?;

        match receiver.shutdown() {
            Ok(exit) => exit,
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }
}

impl<D: VideoDriver, S: PresentationSurface> PipelineDriver<D, S> {
    /// Create a driver around a device ready to stream, see [`crate::builder::CaptureBuilder`].
    pub fn new(
        device: CaptureDevice<D>,
        backend: Box<dyn RotationBackend>,
        surface: S,
        context: PipelineContext,
    ) -> Self {
        Self {
            device: Some(device),
            backend,
            surface: Some(surface),
            context,
            state: PipelineState::Idle,
            output: RgbaImage::new(0, 0),
            frames: 0,
            presented: 0,
            dropped: 0,
            skipped: 0,
            receiver_exit: None,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn context(&self) -> &PipelineContext {
        &self.context
    }

    /// The capture device, `None` once stopped.
    pub fn device(&self) -> Option<&CaptureDevice<D>> {
        self.device.as_ref()
    }

    /// The presentation surface, `None` once stopped.
    pub fn surface(&self) -> Option<&S> {
        self.surface.as_ref()
    }

    pub fn surface_mut(&mut self) -> Option<&mut S> {
        self.surface.as_mut()
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Start streaming, Idle -> Streaming.
    pub fn start(&mut self) -> Result<()> {
        if self.state != PipelineState::Idle {
            return Err(not_streaming("pipeline has already been started"));
        }

        let result = match self.device.as_mut() {
            Some(device) => device.stream_on(),
            None => Err(not_streaming("no capture device")),
        };

        match result {
            Ok(()) => {
                info!("Pipeline streaming with the {} backend", self.backend.name());
                self.state = PipelineState::Streaming;
                Ok(())
            }
            Err(e) => self.fail(e),
        }
    }

    /// Run one frame iteration.
    ///
    /// Returns `Some` if the pipeline should stop before capturing another frame. On error the
    /// pipeline has already been torn down.
    pub fn step(&mut self) -> Result<Option<StopReason>> {
        if self.state != PipelineState::Streaming {
            return Err(not_streaming("pipeline is not streaming"));
        }

        match self.cycle() {
            Ok(reason) => Ok(reason),
            Err(e) => self.fail(e),
        }
    }

    /// Start if needed, then run until a stop condition or an error, then tear down.
    ///
    /// `max_frames` limits the number of frames captured.
    pub fn run(&mut self, max_frames: Option<u64>) -> Result<PipelineReport> {
        if self.state == PipelineState::Idle {
            self.start()?;
        }

        let reason = loop {
            if let Some(max) = max_frames {
                if self.frames >= max {
                    break StopReason::FrameLimit;
                }
            }

            if let Some(reason) = self.step()? {
                break reason;
            }
        };

        info!("Pipeline stopping: {:?} after {} frames", reason, self.frames);
        self.stop();

        Ok(PipelineReport {
            reason,
            frames: self.frames,
            presented: self.presented,
            dropped: self.dropped,
            skipped: self.skipped,
            receiver: self.receiver_exit,
        })
    }

    /// Tear the pipeline down, moving to `Stopped`. Calling this again does nothing.
    pub fn stop(&mut self) {
        if self.state == PipelineState::Stopped {
            return;
        }

        if let Some(mut device) = self.device.take() {
            if let Err(e) = device.stream_off() {
                warn!("{}", e);
            }
            device.close();
        }

        self.receiver_exit = self.context.shutdown_receiver();

        // Dropping the surface releases the display resources
        self.surface = None;
        self.state = PipelineState::Stopped;

        debug!("Pipeline torn down");
    }

    fn cycle(&mut self) -> Result<Option<StopReason>> {
        let surface = self
            .surface
            .as_mut()
            .ok_or_else(|| not_streaming("no presentation surface"))?;

        surface.dispatch()?;
        if surface.close_requested() {
            return Ok(Some(StopReason::CloseRequested));
        }
        if self.context.stop_requested() {
            return Ok(Some(StopReason::StopRequested));
        }

        let device = self
            .device
            .as_mut()
            .ok_or_else(|| not_streaming("no capture device"))?;
        let format = device
            .format()
            .ok_or_else(|| not_streaming("no format negotiated"))?;

        self.state = PipelineState::WaitFrame;
        let buffer = device.dequeue()?;
        self.state = PipelineState::Dequeued;
        self.frames += 1;

        let angle = self.context.angle.load();
        let complete = match device
            .frame(&buffer)
            .and_then(|bytes| YuyvFrame::new(format.width, format.height, bytes))
        {
            Ok(frame) => {
                self.backend.transform(&frame, angle, &mut self.output)?;
                true
            }
            Err(e @ Error::FrameSizeError { .. }) => {
                warn!("Skipping frame {}: {}", self.frames, e);
                false
            }
            Err(e) => return Err(e),
        };

        if !complete {
            self.skipped += 1;
            device.requeue(buffer)?;
            self.state = PipelineState::Streaming;
            return Ok(None);
        }
        self.state = PipelineState::Transformed;

        match surface.present(&self.output)? {
            Presentation::Submitted(slot) => {
                trace!("Frame {} at {}° presented from slot {}", self.frames, angle, slot);
                self.presented += 1;
            }
            Presentation::Dropped => self.dropped += 1,
        }
        self.state = PipelineState::Presented;

        device.requeue(buffer)?;
        self.state = PipelineState::Requeued;

        self.state = PipelineState::Streaming;
        Ok(None)
    }

    fn fail<T>(&mut self, e: Error) -> Result<T> {
        error!("Pipeline failed in {:?}: {}", self.state, e);
        self.stop();
        Err(e)
    }
}

impl<D: VideoDriver, S: PresentationSurface> Drop for PipelineDriver<D, S> {
    fn drop(&mut self) {
        self.stop();
    }
}

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

fn not_streaming(msg: &str) -> Error {
    Error::StreamError(io::Error::new(io::ErrorKind::NotConnected, msg.to_string()))
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {

    use super::*;
    use crate::backend::{create, BackendKind, BackendOptions};
    use crate::builder::CaptureBuilder;
    use crate::channel::{memory_channel, AngleSender, ReceivePolicy};
    use crate::pattern::{Pattern, PatternDriver};
    use crate::surface::MemorySurface;
    use image::Rgb;

    fn driver(limit: Option<u64>) -> PipelineDriver<PatternDriver, MemorySurface> {
        let mut source = PatternDriver::new(32, 16, Pattern::Solid(Rgb([255, 255, 255])));
        if let Some(l) = limit {
            source = source.with_frame_limit(l);
        }

        with_source(source)
    }

    fn with_source(source: PatternDriver) -> PipelineDriver<PatternDriver, MemorySurface> {
        let device = CaptureBuilder::new()
            .resolution((32, 16))
            .build_with(source)
            .unwrap();
        let backend = create(BackendKind::FixedStep, &BackendOptions::default()).unwrap();

        PipelineDriver::new(device, backend, MemorySurface::new(true), PipelineContext::new(0))
    }

    #[test]
    fn test_states() {
        let mut d = driver(None);
        assert_eq!(d.state(), PipelineState::Idle);
        assert!(d.step().is_err());

        d.start().unwrap();
        assert_eq!(d.state(), PipelineState::Streaming);
        assert_eq!(d.step().unwrap(), None);
        assert_eq!(d.state(), PipelineState::Streaming);

        d.stop();
        assert_eq!(d.state(), PipelineState::Stopped);
        assert!(d.device().is_none());
        assert!(d.surface().is_none());
    }

    #[test]
    fn test_frame_limit() {
        let mut d = driver(None);
        let report = d.run(Some(5)).unwrap();

        assert_eq!(report.reason, StopReason::FrameLimit);
        assert_eq!(report.frames, 5);
        assert_eq!(report.presented, 5);
        assert_eq!(d.state(), PipelineState::Stopped);
    }

    #[test]
    fn test_short_frame_skipped() {
        let source = PatternDriver::new(32, 16, Pattern::Bars).with_short_frame(1, 100);
        let mut d = with_source(source);
        d.start().unwrap();

        for _ in 0..3 {
            assert_eq!(d.step().unwrap(), None);
            assert_eq!(d.state(), PipelineState::Streaming);

            let pool = d.device().unwrap().pool().unwrap();
            assert_eq!(pool.counts().queued, pool.len());
        }

        let report = d.run(Some(5)).unwrap();
        assert_eq!(report.reason, StopReason::FrameLimit);
        assert_eq!(report.frames, 5);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.presented, 4);
    }

    #[test]
    fn test_dequeue_failure_stops() {
        let mut d = driver(Some(3));

        assert!(matches!(d.run(None), Err(Error::DequeueError(_))));
        assert_eq!(d.state(), PipelineState::Stopped);
        assert_eq!(d.frames(), 3);
    }

    #[test]
    fn test_close_request() {
        let mut d = driver(None);
        d.start().unwrap();
        d.step().unwrap();

        use crate::surface::SurfaceEvents;
        d.surface_mut().unwrap().events().toplevel_close();

        assert_eq!(d.step().unwrap(), Some(StopReason::CloseRequested));
    }

    #[test]
    fn test_stop_flag() {
        let mut d = driver(None);
        d.context().request_stop();

        let report = d.run(None).unwrap();
        assert_eq!(report.reason, StopReason::StopRequested);
        assert_eq!(report.frames, 0);
    }

    #[test]
    fn test_receiver_joined_on_teardown() {
        let (sink, source) = memory_channel(10, 256);
        let context = PipelineContext::new(0);
        let receiver = ReceiverHandle::spawn(
            source,
            sink.clone(),
            context.angle().clone(),
            ReceivePolicy::Terminate,
        );
        let context = context.with_receiver(receiver);

        let source = PatternDriver::new(32, 16, Pattern::Bars);
        let device = CaptureBuilder::new()
            .resolution((32, 16))
            .build_with(source)
            .unwrap();
        let backend = create(BackendKind::Affine, &BackendOptions::default()).unwrap();
        let mut d = PipelineDriver::new(device, backend, MemorySurface::new(true), context);

        AngleSender::new(sink).send(30).unwrap();
        let report = d.run(Some(2)).unwrap();

        assert_eq!(report.receiver, Some(ReceiverExit::Stopped));
    }
}
