use std::ffi::OsString;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use vision::pipeline::{self, VisionCliArgs, VisionConfig};

/// Line-crossing traffic counter.
#[derive(Debug, Parser)]
#[command(name = "traffic-density", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Count traffic on a video source and serve results over HTTP.
    Serve(VisionCliArgs),
    /// Run the counter over a recorded clip and print the final report as JSON.
    Replay {
        /// Recorded clip (`.jsonl`).
        clip: String,
        /// Process exactly this many frames, looping over the clip.
        #[arg(long, value_name = "N")]
        frames: Option<u64>,
    },
}

pub fn handle_commands<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    match Cli::parse_from(args).command {
        // The service installs its own subscriber.
        Command::Serve(args) => pipeline::run(VisionConfig::try_from(args)?),
        Command::Replay { clip, frames } => {
            init_stderr_logging();
            let report = pipeline::run_headless(&clip, frames)?;
            let json = serde_json::to_string_pretty(&report)
                .context("Failed to serialize final report")?;
            println!("{json}");
            Ok(())
        }
    }
}

/// Logs go to stderr so the JSON report owns stdout.
fn init_stderr_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}
