//! Configuration parsing for the traffic pipeline.
//!
//! This module owns translation of CLI arguments into a `VisionConfig` struct
//! which downstream stages use without re-parsing flags.

use std::{path::PathBuf, time::Duration};

use anyhow::{Result, bail};
use clap::Args;

pub const DEFAULT_SOURCE: &str = "traffic_video.mp4";
pub const DEFAULT_ALLOWED_ORIGINS: [&str; 2] = [
    "https://ai-traffic-system.netlify.app",
    "http://localhost:5173",
];

#[derive(Clone, Debug)]
/// Canonical configuration shared by every stage in the pipeline.
pub struct VisionConfig {
    /// Video source bound at startup.
    pub source: String,
    /// HTTP listener and upload handling.
    pub server: ServerOptions,
    /// Pause between processing cycles.
    pub frame_interval: Duration,
    /// JPEG quality used for annotated frames.
    pub jpeg_quality: u8,
    /// Capacity of the loop to publisher queue.
    pub publish_queue: usize,
    pub verbose: bool,
    /// Telemetry and instrumentation options.
    pub telemetry: TelemetryOptions,
}

#[derive(Clone, Debug)]
pub struct ServerOptions {
    pub host: String,
    pub port: u16,
    /// Directory uploaded videos are written to.
    pub upload_dir: PathBuf,
    /// Origins echoed back in `Access-Control-Allow-Origin`.
    pub allowed_origins: Vec<String>,
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
}

/// CLI arguments accepted by the `serve` subcommand.
#[derive(Debug, Args)]
pub struct VisionCliArgs {
    /// Video file, device index, or recorded clip to start with.
    #[arg(long = "source", value_name = "URI", default_value = DEFAULT_SOURCE)]
    pub source: String,
    /// Address the HTTP server binds to.
    #[arg(long = "host", default_value = "0.0.0.0")]
    pub host: String,
    #[arg(long = "port", default_value_t = 5050)]
    pub port: u16,
    /// Directory for uploaded videos.
    #[arg(long = "upload-dir", value_name = "DIR", default_value = "uploads")]
    pub upload_dir: PathBuf,
    /// Allowed CORS origin (repeatable). Replaces the default list.
    #[arg(long = "allow-origin", value_name = "ORIGIN")]
    pub allow_origin: Vec<String>,
    /// Pause between processing cycles in milliseconds.
    #[arg(long = "frame-interval-ms", value_name = "MS", default_value_t = 20)]
    pub frame_interval_ms: u64,
    /// JPEG quality used by the encoder (1-100).
    #[arg(long = "jpeg-quality", value_name = "QUALITY", default_value_t = 80)]
    pub jpeg_quality: u8,
    /// Frames buffered between the processing loop and the publisher.
    #[arg(long = "queue-depth", value_name = "N", default_value_t = 4)]
    pub queue_depth: usize,
    /// Enable debug logging.
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

impl TryFrom<VisionCliArgs> for VisionConfig {
    type Error = anyhow::Error;

    fn try_from(args: VisionCliArgs) -> Result<Self> {
        let source = args.source.trim().to_string();
        if source.is_empty() {
            bail!("--source must not be empty");
        }
        if args.frame_interval_ms == 0 {
            bail!("--frame-interval-ms must be at least 1");
        }
        if !(1..=100).contains(&args.jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }
        if args.queue_depth == 0 {
            bail!("--queue-depth must be at least 1");
        }

        let allowed_origins = if args.allow_origin.is_empty() {
            DEFAULT_ALLOWED_ORIGINS.iter().map(|o| o.to_string()).collect()
        } else {
            args.allow_origin
        };

        Ok(Self {
            source,
            server: ServerOptions {
                host: args.host,
                port: args.port,
                upload_dir: args.upload_dir,
                allowed_origins,
            },
            frame_interval: Duration::from_millis(args.frame_interval_ms),
            jpeg_quality: args.jpeg_quality,
            publish_queue: args.queue_depth,
            verbose: args.verbose,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
            },
        })
    }
}
