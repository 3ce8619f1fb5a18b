// SPDX-License-Identifier: GPL-3.0-only

use clap::Parser;
use std::path::PathBuf;
use stillcap::backends::camera::IoMethod;

mod cli;

#[derive(Parser)]
#[command(name = "stillcap")]
#[command(about = "Capture a single frame from a V4L2 device and encode it")]
#[command(version = env!("GIT_VERSION"))]
struct Cli {
    /// Capture device (e.g. /dev/video0)
    device: String,

    /// Output file or directory; the extension selects the codec
    /// (jpg, jpeg, gif, png, tga, bmp). Default: "YYYY-MM-DD HH:MM:SS.jpg"
    output: Option<PathBuf>,

    /// Buffer strategy used with the device
    #[arg(long, value_enum)]
    io_method: Option<IoMethod>,

    /// JPEG quality (1-100)
    #[arg(short, long, value_parser = clap::value_parser!(u8).range(1..=100))]
    quality: Option<u8>,

    /// Configuration file (default: ~/.config/stillcap/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    // Set RUST_LOG environment variable to control log level
    // Examples: RUST_LOG=debug, RUST_LOG=stillcap=debug, RUST_LOG=warn
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => stillcap::Config::load_from(path)?,
        None => stillcap::Config::load(),
    };
    if let Some(io_method) = cli.io_method {
        config.io_method = io_method;
    }
    if let Some(quality) = cli.quality {
        config.jpeg_quality = quality;
    }

    cli::capture_to_file(&cli.device, cli.output.as_deref(), &config)?;
    Ok(())
}
