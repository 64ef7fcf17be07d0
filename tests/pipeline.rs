//! # Pipeline Test
//!
//! Runs whole capture, rotate and present cycles against the synthetic pattern source and an
//! in-memory surface.

use camrot::channel::{memory_channel, AngleSender, ReceivePolicy, ReceiverExit, ReceiverHandle};
use camrot::convert::approx_eq;
use camrot::pattern::{Pattern, PatternDriver};
use camrot::pool::BufferState;
use camrot::prelude::*;
use camrot::surface::MemorySurface;
use camrot::Error;
use image::{Rgb, Rgba, RgbaImage};

const WIDTH: u32 = 64;
const HEIGHT: u32 = 48;

const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
const RED: Rgb<u8> = Rgb([255, 0, 0]);
const BLUE: Rgb<u8> = Rgb([0, 0, 255]);

// -----------------------------------------------------------------------------------------------
// HELPERS
// -----------------------------------------------------------------------------------------------

fn pipeline(
    pattern: Pattern,
    kind: BackendKind,
    angle: i32,
) -> PipelineDriver<PatternDriver, MemorySurface> {
    let device = CaptureBuilder::new()
        .resolution((WIDTH, HEIGHT))
        .build_with(PatternDriver::new(WIDTH, HEIGHT, pattern))
        .expect("Cannot build the pattern device");
    let backend = create(kind, &BackendOptions::default()).expect("Cannot create the backend");

    PipelineDriver::new(
        device,
        backend,
        MemorySurface::new(true),
        PipelineContext::new(angle),
    )
}

/// Run a single frame and return what was presented.
fn one_frame(pattern: Pattern, kind: BackendKind, angle: i32) -> RgbaImage {
    let mut p = pipeline(pattern, kind, angle);
    p.start().unwrap();
    assert_eq!(p.step().unwrap(), None);

    p.surface().unwrap().last_frame().unwrap().clone()
}

fn is_red(px: &Rgba<u8>) -> bool {
    px[0] > 200 && px[2] < 60
}

fn is_blue(px: &Rgba<u8>) -> bool {
    px[2] > 200 && px[0] < 60
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[test]
fn fixed_step_zero_is_unchanged() {
    let colour = Rgb([40, 160, 90]);
    let frame = one_frame(Pattern::Solid(colour), BackendKind::FixedStep, 0);
    let expected = Rgba([colour[0], colour[1], colour[2], 255]);

    assert_eq!(frame.dimensions(), (WIDTH, HEIGHT));
    assert!(frame.pixels().all(|px| approx_eq(*px, expected, 4)));
}

#[test]
fn fixed_step_quarter_turn_is_windowed() {
    let colour = Rgb([40, 160, 90]);
    let expected = Rgba([colour[0], colour[1], colour[2], 255]);

    for angle in [90, 100, 179, -90] {
        let frame = one_frame(Pattern::Solid(colour), BackendKind::FixedStep, angle);

        // 64x48 places the rotated frame in columns 14..50
        for y in [0, HEIGHT / 2, HEIGHT - 1] {
            assert_eq!(*frame.get_pixel(13, y), WHITE, "angle {}", angle);
            assert!(approx_eq(*frame.get_pixel(14, y), expected, 4), "angle {}", angle);
            assert!(approx_eq(*frame.get_pixel(49, y), expected, 4), "angle {}", angle);
            assert_eq!(*frame.get_pixel(50, y), WHITE, "angle {}", angle);
        }
        assert_eq!(*frame.get_pixel(0, 0), WHITE);
        assert_eq!(*frame.get_pixel(WIDTH - 1, HEIGHT - 1), WHITE);
    }
}

#[test]
fn fixed_step_half_turn_flips() {
    let split = Pattern::Split {
        left: RED,
        right: BLUE,
    };

    let frame = one_frame(split, BackendKind::FixedStep, 180);
    assert!(is_blue(frame.get_pixel(2, HEIGHT / 2)));
    assert!(is_red(frame.get_pixel(WIDTH - 3, HEIGHT / 2)));
}

#[test]
fn affine_quarter_turn_matches_fixed_step_direction() {
    let split = Pattern::Split {
        left: RED,
        right: BLUE,
    };

    // Both put the left half of the frame at the top
    let affine = one_frame(split, BackendKind::Affine, 90);
    assert!(is_red(affine.get_pixel(WIDTH / 2, 10)));
    assert!(is_blue(affine.get_pixel(WIDTH / 2, HEIGHT - 10)));

    let fixed = one_frame(split, BackendKind::FixedStep, 270);
    assert!(is_red(fixed.get_pixel(WIDTH / 2, 5)));
    assert!(is_blue(fixed.get_pixel(WIDTH / 2, HEIGHT - 5)));
}

#[test]
fn affine_angle_update_between_frames() {
    let split = Pattern::Split {
        left: RED,
        right: BLUE,
    };
    let mut p = pipeline(split, BackendKind::Affine, 0);
    p.start().unwrap();

    p.step().unwrap();
    let before = p.surface().unwrap().last_frame().unwrap().clone();
    assert!(is_red(before.get_pixel(5, HEIGHT / 2)));

    p.context().angle().store(180);
    p.step().unwrap();
    let after = p.surface().unwrap().last_frame().unwrap().clone();
    assert!(is_blue(after.get_pixel(5, HEIGHT / 2)));
}

#[test]
fn buffers_cycle_between_frames() {
    let mut p = pipeline(Pattern::Bars, BackendKind::FixedStep, 0);
    p.start().unwrap();

    for _ in 0..10 {
        p.step().unwrap();

        // Between frames every buffer is back with the kernel
        let device = p.device().unwrap();
        let pool = device.pool().unwrap();
        assert_eq!(pool.counts().queued, pool.len());
        assert!((0..pool.len()).all(|i| pool.state(i) == Some(BufferState::QueuedToKernel)));
    }

    p.stop();
    assert_eq!(p.state(), PipelineState::Stopped);
    assert!(p.device().is_none());
}

#[test]
fn frame_limit_stops_cleanly() {
    let mut p = pipeline(Pattern::Bars, BackendKind::Affine, 45);
    let report = p.run(Some(3)).unwrap();

    assert_eq!(report.reason, StopReason::FrameLimit);
    assert_eq!(report.frames, 3);
    assert_eq!(p.state(), PipelineState::Stopped);

    // Stopping again is harmless
    p.stop();
    assert_eq!(p.state(), PipelineState::Stopped);
}

#[test]
fn padded_rows_are_refused_at_build() {
    let source = PatternDriver::new(WIDTH, HEIGHT, Pattern::Bars).with_stride(WIDTH * 3);
    let result = CaptureBuilder::new()
        .resolution((WIDTH, HEIGHT))
        .build_with(source);

    assert!(matches!(result, Err(Error::FormatError { .. })));
}

#[test]
fn short_frame_keeps_the_pipeline_running() {
    let source = PatternDriver::new(WIDTH, HEIGHT, Pattern::Bars).with_short_frame(0, 64);
    let device = CaptureBuilder::new()
        .resolution((WIDTH, HEIGHT))
        .build_with(source)
        .expect("Cannot build the pattern device");
    let backend = create(BackendKind::FixedStep, &BackendOptions::default()).unwrap();
    let mut p = PipelineDriver::new(
        device,
        backend,
        MemorySurface::new(true),
        PipelineContext::new(0),
    );

    let report = p.run(Some(4)).unwrap();
    assert_eq!(report.reason, StopReason::FrameLimit);
    assert_eq!((report.skipped, report.presented), (1, 3));
}

#[test]
fn channel_drives_the_angle() {
    let (sink, source) = memory_channel(10, 256);
    let angle = std::sync::Arc::new(RotationAngle::new(0));
    let receiver = ReceiverHandle::spawn(source, sink.clone(), angle.clone(), ReceivePolicy::Skip);

    let sender = AngleSender::new(sink);
    sender.send(500).unwrap();
    sender.send(42).unwrap();

    // Messages apply in order, the out of range angle is dropped
    for _ in 0..200 {
        if angle.load() == 42 {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    assert_eq!(angle.load(), 42);

    sender.stop().unwrap();
    assert_eq!(receiver.shutdown().unwrap(), Some(ReceiverExit::Stopped));
}

// -----------------------------------------------------------------------------------------------
// HARDWARE
// -----------------------------------------------------------------------------------------------

#[test]
#[ignore]
fn live_camera() -> Result<(), Box<dyn std::error::Error>> {
    let device = CaptureBuilder::new()
        .path("/dev/video0")?
        .resolution((640, 480))
        .build()?;
    let backend = create(BackendKind::Affine, &BackendOptions::default())?;
    let surface = WaylandSurface::connect(640, 480, "camrot live test")?;

    let mut pipeline = PipelineDriver::new(device, backend, surface, PipelineContext::new(30));
    let report = pipeline.run(Some(120))?;

    assert_eq!(report.frames, 120);

    Ok(())
}
