use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fx3_core::control::GainMode;
use fx3_core::protocol::constants::{
    MAX_ATTENUATION, MAX_VGA_GAIN, SAMPLE_RATE_MAX, SAMPLE_RATE_MIN,
};
use fx3_core::session::{Fx3Session, SessionConfig, load_image};
use fx3_core::stream::{SessionSummary, StopSignal};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Cypress FX3 firmware loader and bulk streamer", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// TOML session configuration; flags override its values
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the segments of a firmware image
    Info {
        /// Firmware image (.img)
        image: PathBuf,
    },
    /// Upload firmware into device RAM
    Upload {
        #[command(flatten)]
        device: DeviceArgs,
    },
    /// Stream from a device already running the streaming firmware
    Stream {
        #[command(flatten)]
        device: DeviceArgs,
        #[command(flatten)]
        stream: StreamArgs,
    },
    /// Upload firmware if one is configured, then stream
    Run {
        #[command(flatten)]
        device: DeviceArgs,
        #[command(flatten)]
        stream: StreamArgs,
    },
    /// Write the effective configuration as TOML
    SaveConfig {
        #[command(flatten)]
        device: DeviceArgs,
        #[command(flatten)]
        stream: StreamArgs,
        /// Output path
        output: PathBuf,
    },
}

#[derive(clap::Args, Debug, Default)]
struct DeviceArgs {
    /// Firmware image to upload
    #[arg(short, long)]
    firmware: Option<String>,

    /// Vendor ID (hex)
    #[arg(long, value_parser = parse_hex_u16)]
    vid: Option<u16>,

    /// Skip toggling the CPU reset line around the upload
    #[arg(long)]
    no_reset: bool,
}

#[derive(clap::Args, Debug, Default)]
struct StreamArgs {
    /// Transfers kept in flight
    #[arg(short, long)]
    queue_depth: Option<usize>,

    /// Request size in max-size packets
    #[arg(short, long)]
    packets: Option<usize>,

    /// ADC sample rate in Hz
    #[arg(short = 's', long, value_parser = clap::value_parser!(u32).range(i64::from(SAMPLE_RATE_MIN)..=i64::from(SAMPLE_RATE_MAX)))]
    sample_rate: Option<u32>,

    /// Attenuator setting, 0-63
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=i64::from(MAX_ATTENUATION)))]
    attenuation: Option<u8>,

    /// VGA gain, 0-127
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=i64::from(MAX_VGA_GAIN)))]
    vga_gain: Option<u8>,

    /// Use the low VGA gain range
    #[arg(long)]
    low_gain: bool,

    /// Enable ADC dither
    #[arg(long)]
    dither: bool,

    /// Enable ADC output randomization
    #[arg(long)]
    randomize: bool,

    /// Enable the HF bias tee
    #[arg(long)]
    bias_hf: bool,

    /// Enable the VHF bias tee
    #[arg(long)]
    bias_vhf: bool,

    /// Enable the PGA
    #[arg(long)]
    pga: bool,
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid hex value '{}': {}", s, e))
}

impl DeviceArgs {
    fn apply(&self, config: &mut SessionConfig) {
        if let Some(path) = &self.firmware {
            config.firmware_path = Some(path.clone());
        }
        if let Some(vid) = self.vid {
            config.vendor_id = vid;
        }
        if self.no_reset {
            config.toggle_reset = false;
        }
    }
}

impl StreamArgs {
    fn apply(&self, config: &mut SessionConfig) {
        if let Some(depth) = self.queue_depth {
            config.queue_depth = depth;
        }
        if let Some(packets) = self.packets {
            config.packets_per_request = packets;
        }
        if let Some(rate) = self.sample_rate {
            config.sample_rate = rate;
        }
        if let Some(attenuation) = self.attenuation {
            config.frontend.attenuation = attenuation;
        }
        if let Some(gain) = self.vga_gain {
            config.frontend.vga_gain = gain;
        }
        if self.low_gain {
            config.frontend.gain_mode = GainMode::Low;
        }
        config.frontend.dither |= self.dither;
        config.frontend.randomize |= self.randomize;
        config.frontend.bias_hf |= self.bias_hf;
        config.frontend.bias_vhf |= self.bias_vhf;
        config.frontend.pga |= self.pga;
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<SessionConfig> {
    match path {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(SessionConfig::default()),
    }
}

/// Raise `stop` on Ctrl-C so the session drains instead of dying mid-transfer.
fn install_stop_handler() -> Result<StopSignal> {
    let stop = StopSignal::new();
    let handler = stop.clone();
    ctrlc::set_handler(move || {
        handler.request();
    })
    .context("Failed to install Ctrl-C handler")?;
    Ok(stop)
}

fn print_summary(summary: &SessionSummary) {
    info!(
        "{} transfers ok, {} failed, {} bytes, {:.1} KBps average",
        summary.success_count,
        summary.failure_count,
        summary.total_bytes,
        summary.bytes_per_sec() / 1024.0
    );
    if summary.slots_dropped > 0 {
        warn!("{} transfer slots were dropped after failed submissions", summary.slots_dropped);
    }
}

fn show_image(path: &Path) -> Result<()> {
    let image = load_image(path)?;
    let parsed = image.parse()?;

    println!("Image:     {}", path.display());
    println!("Size:      {} bytes", image.len());
    println!("Control:   0x{:02X}", image.control_byte());
    for (i, segment) in parsed.segments.iter().enumerate() {
        if segment.is_entry_point() {
            println!("  [{:2}] entry point 0x{:08X}", i, segment.address);
        } else {
            println!(
                "  [{:2}] 0x{:08X}  {:6} bytes  {} chunks",
                i,
                segment.address,
                segment.byte_len(),
                segment.chunk_count()
            );
        }
    }
    println!("Payload:   {} bytes", parsed.payload_bytes());
    match (parsed.checksum, parsed.checksum_matches()) {
        (Some(stored), Some(matches)) => println!(
            "Checksum:  0x{:08X} ({})",
            stored,
            if matches { "matches" } else { "does not match" }
        ),
        _ => println!("Checksum:  none"),
    }
    Ok(())
}

fn run(args: Args) -> Result<()> {
    let mut config = load_config(args.config.as_ref())?;

    match args.command {
        Command::Info { image } => show_image(&image),
        Command::Upload { device } => {
            device.apply(&mut config);
            let path = config
                .firmware_path
                .clone()
                .context("No firmware image given (--firmware or firmware_path in config)")?;
            let image = load_image(&path)?;
            let report = Fx3Session::new(config).upload(&image)?;
            info!(
                "Uploaded {} segments, {} bytes in {} transfers",
                report.segments, report.bytes, report.transfers
            );
            Ok(())
        }
        Command::Stream { device, stream } => {
            device.apply(&mut config);
            stream.apply(&mut config);
            let stop = install_stop_handler()?;
            let summary = Fx3Session::new(config).stream(stop)?;
            print_summary(&summary);
            Ok(())
        }
        Command::Run { device, stream } => {
            device.apply(&mut config);
            stream.apply(&mut config);
            let stop = install_stop_handler()?;
            let summary = Fx3Session::new(config).run(stop)?;
            print_summary(&summary);
            Ok(())
        }
        Command::SaveConfig {
            device,
            stream,
            output,
        } => {
            device.apply(&mut config);
            stream.apply(&mut config);
            config.save_to_file(&output)?;
            info!(path = %output.display(), "Configuration saved");
            Ok(())
        }
    }
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
