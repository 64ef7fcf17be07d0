//! # `camrot` renderer
//!
//! Captures from a camera, rotates each frame and presents it in a Wayland window. The angle
//! is read from the angle message queue while running.
//!
//! ```shell
//! camrot /dev/video0 1280 720 30 --backend affine
//! ```

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::path::PathBuf;
use std::process;
use std::sync::atomic::Ordering;

use clap::Parser;
use log::{error, info, warn};

use camrot::angle::in_input_range;
use camrot::channel::{ReceivePolicy, ReceiverHandle};
use camrot::mqueue::{PosixQueue, QueueAccess};
use camrot::pattern::{Pattern, PatternDriver};
use camrot::prelude::*;
use camrot::{Config, Error, Result};

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Rotate a live camera feed by an angle changeable at runtime.
#[derive(Parser, Debug)]
#[command(name = "camrot", version)]
struct Args {
    /// Capture device path, or `pattern` for a synthetic test source
    device: String,

    /// Capture width in pixels
    width: u32,

    /// Capture height in pixels
    height: u32,

    /// Initial rotation angle in degrees
    #[arg(allow_negative_numbers = true)]
    angle: i32,

    /// Rotation backend, overrides the config file
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,

    /// Configuration file, any format supported by serde_any
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stop after this many frames
    #[arg(long)]
    frames: Option<u64>,

    /// What to do with malformed angle messages, overrides the config file
    #[arg(long, value_enum)]
    policy: Option<ReceivePolicy>,
}

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    match run(args) {
        Ok(report) => info!(
            "Stopped ({:?}): {} frames, {} presented, {} dropped, {} skipped",
            report.reason, report.frames, report.presented, report.dropped, report.skipped
        ),
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    }
}

fn run(args: Args) -> Result<PipelineReport> {
    let config = Config::load(args.config.as_deref())?;

    let builder = CaptureBuilder::new()
        .resolution((args.width, args.height))
        .num_buffers(config.num_buffers);

    if args.device == "pattern" {
        let driver = PatternDriver::new(args.width, args.height, Pattern::Bars)
            .with_interval(config.pattern_interval());
        let device = builder.build_with(driver)?;

        render(device, &args, &config)
    } else {
        let device = builder.path(&args.device)?.build()?;

        render(device, &args, &config)
    }
}

fn render<D: VideoDriver>(
    device: CaptureDevice<D>,
    args: &Args,
    config: &Config,
) -> Result<PipelineReport> {
    let kind = args.backend.unwrap_or(config.backend);
    let backend = create(kind, &config.backend_options())?;

    let surface = WaylandSurface::connect(args.width, args.height, &config.window_title)?;

    let angle = if in_input_range(args.angle) {
        args.angle
    } else {
        warn!("Launch angle {} out of range, starting at 0", args.angle);
        0
    };
    let context = PipelineContext::new(angle);

    // The renderer keeps its own writer to post the stop sentinel at teardown
    let attrs = config.queue_attributes();
    let reader = PosixQueue::open(&config.queue_name, QueueAccess::Read, &attrs)?;
    let writer = PosixQueue::open(&config.queue_name, QueueAccess::Write, &attrs)?;
    let policy = args.policy.unwrap_or(config.receive_policy);
    let receiver = ReceiverHandle::spawn(reader, writer, context.angle().clone(), policy);
    let context = context.with_receiver(receiver);

    let stop = context.stop_flag();
    ctrlc::set_handler(move || {
        stop.store(true, Ordering::SeqCst);
    })
    .map_err(|e| Error::SignalError(e.to_string()))?;

    info!(
        "Rendering {:?} at {}x{}, {}° with the {} backend",
        device.path(),
        args.width,
        args.height,
        angle,
        kind
    );

    PipelineDriver::new(device, backend, surface, context).run(args.frames)
}
