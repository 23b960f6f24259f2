use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tilewatch::config::Config;
use tilewatch::decode::GstDecoder;
use tilewatch::detector::ThresholdDetector;
use tilewatch::monitor::{DecoderOpenFn, DetectorFactory, Monitor};

/// Multi-camera tiled motion-detection pipeline.
#[derive(Parser, Debug)]
#[command(name = "tilewatch", version, about)]
struct CliArgs {
    /// Path to the run's TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Overrides `paths.stream-path` from the config file.
    #[arg(long)]
    stream_root: Option<PathBuf>,

    /// Overrides `paths.sample-path` from the config file.
    #[arg(long)]
    sample_root: Option<PathBuf>,

    /// Overrides `paths.region-path` from the config file.
    #[arg(long)]
    region_root: Option<PathBuf>,

    /// Repeat for more verbose logging (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbosity: u8) {
    let default_level = match verbosity {
        0 => "tilewatch=info",
        1 => "tilewatch=debug",
        _ => "tilewatch=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(args.verbose);

    let mut config = Config::from_file(&args.config)?;
    if let Some(root) = args.stream_root {
        config.paths.stream_path = root;
    }
    if let Some(root) = args.sample_root {
        config.paths.sample_path = root;
    }
    if let Some(root) = args.region_root {
        config.paths.region_path = root;
    }

    let decoder_open: DecoderOpenFn = Arc::new(|path| {
        let source = path.to_string_lossy().to_string();
        GstDecoder::open(&source).map(|d| Box::new(d) as Box<dyn tilewatch::decode::FrameDecoder>)
    });

    // The detection algorithm itself is an external collaborator this
    // crate does not implement; a threshold stand-in keeps the binary
    // runnable end to end until a real detector is wired in per camera.
    let detector_factory: DetectorFactory = Arc::new(|camera| {
        (0..camera.routine.count())
            .map(|_| Box::new(ThresholdDetector { threshold: 96.0 }) as Box<dyn tilewatch::detector::TileDetector>)
            .collect()
    });

    let mut monitor = Monitor::new(config, decoder_open, detector_factory);
    let cancel = monitor.cancel_token();

    monitor.clean()?;
    monitor.call()?;

    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel.cancel();
    });

    monitor.wait().await?;
    Ok(())
}
