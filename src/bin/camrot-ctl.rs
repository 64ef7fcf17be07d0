//! # `camrot-ctl` control front end
//!
//! Lists capture devices and drives a running renderer over the angle message queue.
//!
//! ```shell
//! camrot-ctl devices
//! camrot-ctl send 45
//! camrot-ctl spin --step 2 --interval-ms 20 --turns 1
//! camrot-ctl stop
//! ```

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{error, info, warn};

use camrot::angle::FULL_TURN;
use camrot::channel::AngleSender;
use camrot::control::Controller;
use camrot::devices::{DeviceCatalog, SystemCatalog};
use camrot::mqueue::{PosixQueue, QueueAccess};
use camrot::{Config, Result};

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Control a camrot renderer.
#[derive(Parser, Debug)]
#[command(name = "camrot-ctl", version)]
struct Args {
    /// Configuration file, any format supported by serde_any
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List capture devices
    Devices,

    /// List the frame sizes offered by a device
    Resolutions { path: PathBuf },

    /// Send a rotation angle to the renderer
    Send {
        #[arg(allow_negative_numbers = true)]
        angle: i32,
    },

    /// Stop the renderer's angle receiver
    Stop,

    /// Turn the renderer round in one degree increments
    Spin {
        /// Source to select, by device path
        #[arg(long, default_value = "pattern")]
        source: PathBuf,

        /// Degrees per update
        #[arg(long, default_value_t = 1)]
        step: u32,

        /// Delay between updates
        #[arg(long, default_value_t = 33)]
        interval_ms: u64,

        /// Number of full turns
        #[arg(long, default_value_t = 1)]
        turns: u32,
    },
}

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        error!("{}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = Config::load(args.config.as_deref())?;
    let catalog = SystemCatalog::new();

    match args.command {
        Command::Devices => {
            for device in catalog.devices()? {
                println!("{}\t{}", device.path.display(), device.name);
            }
        }
        Command::Resolutions { path } => {
            for (w, h) in catalog.resolutions(&path)? {
                println!("{}x{}", w, h);
            }
        }
        Command::Send { angle } => {
            AngleSender::new(open_writer(&config)?).send(angle)?;
            info!("Sent {}", angle);
        }
        Command::Stop => {
            AngleSender::new(open_writer(&config)?).stop()?;
            info!("Sent stop");
        }
        Command::Spin {
            source,
            step,
            interval_ms,
            turns,
        } => {
            let mut controller = Controller::new(catalog, open_writer(&config)?, &config.renderer);
            controller.set_source_path(source);

            let updates = (FULL_TURN as u32 * turns) / step.max(1);
            let failed = controller.spin(step, updates, Duration::from_millis(interval_ms));

            if failed > 0 {
                warn!("{} angle updates were dropped, is the renderer running?", failed);
            }
            info!("Finished at {}°", controller.angle());
        }
    }

    Ok(())
}

fn open_writer(config: &Config) -> Result<PosixQueue> {
    PosixQueue::open(
        &config.queue_name,
        QueueAccess::Write,
        &config.queue_attributes(),
    )
}
