use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use camenc::config::PipelineConfig;
use camenc::encoder::{EncoderConfig, EncoderKind};
use camenc::pipeline::Pipeline;
use camenc::sink::FrameSink;
use camenc::state::PipelineState;
use camenc::video::{CaptureDevice, CaptureFormat, PixelFormat};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// camenc command line arguments
#[derive(Parser, Debug)]
#[command(name = "camenc")]
#[command(version, about = "Capture a V4L2 camera and encode it to a file", long_about = None)]
struct CliArgs {
    /// TOML configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Video device (overrides config)
    #[arg(short = 'd', long, value_name = "DEVICE")]
    device: Option<PathBuf>,

    /// Output file (overrides config)
    #[arg(short = 'o', long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Capture width (overrides config)
    #[arg(long, value_name = "PIXELS", requires = "height")]
    width: Option<u32>,

    /// Capture height (overrides config)
    #[arg(long, value_name = "PIXELS", requires = "width")]
    height: Option<u32>,

    /// Capture pixel format: YUYV or YVYU (overrides config)
    #[arg(short = 'f', long, value_name = "FORMAT")]
    format: Option<PixelFormat>,

    /// Output encoder: h264 or y4m (overrides config)
    #[arg(short = 'e', long, value_name = "ENCODER")]
    encoder: Option<EncoderKind>,

    /// Print the formats the device advertises and exit
    #[arg(long)]
    list_formats: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting camenc v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    apply_overrides(&mut config, &args);
    config.validate().context("Invalid configuration")?;

    let state = PipelineState::new();
    let capture = &config.capture;
    let device = CaptureDevice::open(&capture.device, capture.buffer_count, state.clone())?;

    if args.list_formats {
        for format in device.list_supported_formats() {
            println!("{}", format);
        }
        return Ok(());
    }

    let requested = match capture.resolution() {
        Some(resolution) => CaptureFormat::request(capture.pixel_format, resolution),
        None => device.select_format(Some(capture.pixel_format), None)?,
    };
    let format = device
        .negotiate(&requested)
        .with_context(|| format!("Failed to negotiate {}", requested))?;
    let device = Arc::new(device);

    let encoder = config
        .pipeline
        .encoder
        .create(EncoderConfig::for_capture(
            format.resolution(),
            config.encoder.clone(),
        ))
        .with_context(|| format!("Failed to create {} encoder", config.pipeline.encoder))?;
    let sink = FrameSink::create(&config.pipeline.output)?;
    let pipeline = Pipeline::new(
        device.clone(),
        encoder,
        config.pipeline.queue_capacity,
        capture.start_retry(),
    )?;

    install_stop_handler(state)?;
    tracing::info!("Capturing {} (press Ctrl+C to stop)", format);

    let (report, _sink) = pipeline.run(sink)?;
    tracing::info!(
        "Captured {} frames, encoded {}, dropped {}, wrote {} bytes to {}",
        report.capture.frames_captured,
        report.worker.frames_encoded,
        report.capture_dropped + report.worker.frames_dropped,
        report.worker.bytes_written,
        config.pipeline.output.display()
    );

    match report.error {
        Some(e) => Err(anyhow::Error::new(e).context("Capture failed")),
        None => Ok(()),
    }
}

/// CLI flags take precedence over the config file
fn apply_overrides(config: &mut PipelineConfig, args: &CliArgs) {
    if let Some(device) = &args.device {
        config.capture.device = device.clone();
    }
    if let Some(output) = &args.output {
        config.pipeline.output = output.clone();
    }
    if let (Some(width), Some(height)) = (args.width, args.height) {
        config.capture.width = width;
        config.capture.height = height;
    }
    if let Some(format) = args.format {
        config.capture.pixel_format = format;
    }
    if let Some(encoder) = args.encoder {
        config.pipeline.encoder = encoder;
    }
}

/// First Ctrl+C asks the capture loop to stop, a second one exits at once
fn install_stop_handler(state: Arc<PipelineState>) -> anyhow::Result<()> {
    let signalled = AtomicBool::new(false);
    ctrlc::set_handler(move || {
        if signalled.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        state.request_stop();
    })
    .context("Failed to install Ctrl+C handler")
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "camenc=error",
        LogLevel::Warn => "camenc=warn",
        LogLevel::Info => "camenc=info",
        LogLevel::Verbose => "camenc=debug,v4l=info",
        LogLevel::Debug => "camenc=debug,v4l=debug",
        LogLevel::Trace => "camenc=trace,v4l=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
