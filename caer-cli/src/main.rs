//! Event acquisition CLI application.
//!
//! Replays an AEDAT 3.1 recording through the acquisition loop and writes
//! every decoded event kind to its own output file.

mod config;
mod sink;

use anyhow::{bail, Context, Result};
use caer_core::replay::AedatReader;
use caer_core::{
    Acquisition, DeviceDescriptor, DeviceKind, FieldOrder, FramePolicy, FrameSizing, Geometry,
    OpenRequest, ReplayOpener,
};
use clap::{Parser, ValueEnum};
use confique::Config;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, LevelFilter};
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Instant;

use crate::config::Conf;
use crate::sink::Sinks;

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FramePolicyArg {
    First,
    All,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FrameSizingArg {
    Record,
    SensorCanvas,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum DeviceArg {
    Dvs128,
    Davis,
    Dynapse,
}

impl From<DeviceArg> for DeviceKind {
    fn from(arg: DeviceArg) -> Self {
        match arg {
            DeviceArg::Dvs128 => DeviceKind::Dvs128,
            DeviceArg::Davis => DeviceKind::Davis,
            DeviceArg::Dynapse => DeviceKind::Dynapse,
        }
    }
}

/// Event acquisition for DVS, DAVIS and Dynap-se devices.
///
/// Replays an AEDAT 3.1 recording as if it were a live device, decodes each
/// container and writes polarity, special, IMU6, spike and frame output.
#[derive(Parser, Debug)]
#[command(name = "caer")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input AEDAT 3.1 recording
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Directory for the output files
    #[arg(value_name = "OUTPUT_DIR")]
    output: PathBuf,

    /// TOML configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Field order for polarity CSV output, e.g. "x,y,p,t" or "t,x,y,p"
    #[arg(short, long)]
    format: Option<String>,

    /// Write polarity events in the binary format instead of CSV
    #[arg(short, long)]
    binary: bool,

    /// Which frames of each container to decode
    #[arg(long, value_enum)]
    frame_policy: Option<FramePolicyArg>,

    /// Size decoded frames to the record or to the full sensor
    #[arg(long, value_enum)]
    frame_sizing: Option<FrameSizingArg>,

    /// Device family to open; defaults to the recording's source
    #[arg(long, value_enum)]
    device: Option<DeviceArg>,

    /// Override the sensor geometry, as WIDTHxHEIGHT
    #[arg(long, value_name = "WxH")]
    geometry: Option<String>,

    /// Stop after this many containers
    #[arg(long)]
    max_containers: Option<u64>,

    /// Stop after this many consecutive reads without data
    #[arg(long)]
    idle_ticks: Option<u64>,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    log_level: LevelFilter,

    /// Suppress progress output
    #[arg(short, long)]
    quiet: bool,
}

fn parse_geometry(s: &str) -> Result<Geometry> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .context("Geometry must look like 346x260")?;
    Ok(Geometry::new(
        w.trim().parse().context("Invalid geometry width")?,
        h.trim().parse().context("Invalid geometry height")?,
    ))
}

fn load_config(args: &Args) -> Result<Conf> {
    let mut builder = Conf::builder();
    if let Some(path) = &args.config {
        if !path.exists() {
            bail!("Config file {:?} does not exist", path);
        }
        builder = builder.file(path);
    }
    let mut conf = builder.load().context("Failed to load configuration")?;

    if let Some(format) = &args.format {
        conf.run.field_order = format.clone();
    }
    if let Some(policy) = args.frame_policy {
        conf.decoder.frame_policy = match policy {
            FramePolicyArg::First => FramePolicy::First,
            FramePolicyArg::All => FramePolicy::All,
        };
    }
    if let Some(sizing) = args.frame_sizing {
        conf.decoder.frame_sizing = match sizing {
            FrameSizingArg::Record => FrameSizing::Record,
            FrameSizingArg::SensorCanvas => FrameSizing::SensorCanvas,
        };
    }
    if let Some(n) = args.max_containers {
        conf.run.max_containers = Some(n);
    }
    if let Some(n) = args.idle_ticks {
        conf.run.idle_ticks = n;
    }
    Ok(conf)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.quiet {
        LevelFilter::Error
    } else {
        args.log_level
    };
    TermLogger::init(
        level,
        ConfigBuilder::new().build(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )
    .context("Failed to initialise logging")?;

    let conf = load_config(&args)?;
    let field_order = FieldOrder::from_str(&conf.run.field_order)
        .context("Invalid field format. Use comma-separated: x,y,p,t")?;

    // The request must name a device family; take it from the recording
    // unless given explicitly.
    let header_descriptor = AedatReader::open(&args.input)
        .with_context(|| format!("Failed to read {:?}", args.input))?
        .header()
        .descriptor();
    let kind = match (args.device, &header_descriptor) {
        (Some(device), _) => DeviceKind::from(device),
        (None, Some(descriptor)) => descriptor.kind,
        (None, None) => DeviceKind::Davis,
    };

    let mut opener = ReplayOpener::new(&args.input);
    if let Some(geometry) = &args.geometry {
        let geometry = parse_geometry(geometry)?;
        let descriptor = match kind {
            DeviceKind::Dvs128 => {
                let mut d = DeviceDescriptor::dvs128(1, "");
                d.dvs = geometry;
                d
            }
            DeviceKind::Davis => DeviceDescriptor::davis(1, "", geometry),
            DeviceKind::Dynapse => bail!("Dynap-se devices have no pixel geometry"),
        };
        opener = opener.with_descriptor(descriptor);
    }

    let request = OpenRequest::any(1, kind);
    let mut acquisition = Acquisition::open(&opener, &request, conf.acquisition())
        .context("Failed to start acquisition")?;

    let token = acquisition.stop_token();
    ctrlc::set_handler(move || token.cancel()).context("Failed to install Ctrl-C handler")?;

    let descriptor = acquisition.descriptor().clone();
    let mut sinks = Sinks::new(&args.output, field_order, args.binary, descriptor.dvs)
        .with_context(|| format!("Failed to create output directory {:?}", args.output))?;

    let progress = if args.quiet {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .context("Invalid progress template")?,
        );
        pb
    };

    let start_time = Instant::now();
    let mut idle = 0u64;
    let mut seen = 0u64;

    while let Some(batches) = acquisition.next_tick() {
        sinks.write(&batches).context("Failed to write output")?;

        if acquisition.containers_received() == seen {
            idle += 1;
            if idle >= conf.run.idle_ticks {
                info!("no data for {} read(s), stopping", idle);
                break;
            }
        } else {
            seen = acquisition.containers_received();
            idle = 0;
        }
        if conf
            .run
            .max_containers
            .is_some_and(|max| seen >= max)
        {
            info!("container limit reached, stopping");
            break;
        }

        let totals = sinks.totals();
        progress.set_message(format!(
            "{} containers, {} polarity, {} frames",
            seen, totals.polarity, totals.frames
        ));
        progress.tick();
    }

    acquisition.shutdown();
    let totals = sinks.finish().context("Failed to flush output")?;
    let duration = start_time.elapsed();

    progress.finish_with_message(format!(
        "Done! {} containers in {:.2}s ({}: {}x{})",
        seen,
        duration.as_secs_f64(),
        descriptor.device_string,
        descriptor.dvs.width,
        descriptor.dvs.height
    ));

    if !args.quiet {
        let events = totals.polarity + totals.imu6 + totals.special + totals.spikes;
        eprintln!();
        eprintln!("Summary:");
        eprintln!("  Input:        {:?}", args.input);
        eprintln!("  Output:       {:?}", args.output);
        eprintln!("  Containers:   {}", seen);
        eprintln!("  Polarity:     {}", totals.polarity);
        eprintln!("  Frames:       {}", totals.frames);
        eprintln!("  IMU6:         {}", totals.imu6);
        eprintln!("  Special:      {}", totals.special);
        eprintln!("  Spikes:       {}", totals.spikes);
        eprintln!("  Rejected:     {}", totals.rejected);
        eprintln!("  Duration:     {:.3}s", duration.as_secs_f64());
        eprintln!(
            "  Throughput:   {:.0} events/s",
            events as f64 / duration.as_secs_f64()
        );
    }

    Ok(())
}
