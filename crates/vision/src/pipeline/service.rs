//! Service supervisor tying together the processing loop, the publisher, the
//! watchdog, and the HTTP server.
//!
//! Unlike a capture pipeline that can simply be restarted, the counting loop is
//! started exactly once: a halted loop is reported and left halted.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, Once,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use ml_core::{ReplayTracker, Tracker};
use tracing::{debug, info, warn};
use video_ingest::{DefaultOpener, SourceOpener};

use crate::pipeline::{
    config::VisionConfig,
    coordinator::ResetCoordinator,
    data::{FRAME_HISTORY_CAPACITY, FrameHistory, FrameReport, SharedFrame},
    encoding::{EncodeJob, spawn_encode_worker},
    processing::{ProcessingLoop, StepOutcome, WorkerGate, spawn_processing_worker},
    server::{ServerState, spawn_preview_server},
    telemetry,
    watchdog::{PipelineHealth, WatchdogState, spawn_watchdog},
};

const SUPERVISOR_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Run the service until Ctrl+C.
///
/// Failing to open the initial source is fatal. Later failures (a bad switch,
/// a halted loop) are reported through logs, metrics, and `/status` while the
/// server keeps answering.
pub fn run(config: VisionConfig) -> Result<()> {
    static CTRL_HANDLER: Once = Once::new();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });

    let _telemetry_guard = telemetry::enter_runtime(&config.telemetry, config.verbose);
    let prometheus = telemetry::init_metrics_recorder().clone();
    let pipeline_span = tracing::info_span!(
        "traffic.pipeline",
        source = %config.source,
        host = %config.server.host,
        port = config.server.port,
        frame_interval_ms = config.frame_interval.as_millis() as u64,
        queue = config.publish_queue
    );
    let _pipeline_span_guard = pipeline_span.enter();

    let opener: Arc<dyn SourceOpener> = Arc::new(DefaultOpener);
    let source = opener
        .open(&config.source)
        .with_context(|| format!("Failed to open initial source {}", config.source))?;
    let mut tracker = ReplayTracker::new();
    tracker
        .rebind(&config.source)
        .with_context(|| format!("Tracker could not bind to {}", config.source))?;
    let coordinator = ResetCoordinator::new(source.uri(), source.frame_height());
    debug!(
        "Bound {} (line at y={})",
        config.source,
        coordinator.snapshot().line_y
    );

    let shared: SharedFrame = Arc::new(Mutex::new(None));
    let history: FrameHistory =
        Arc::new(Mutex::new(VecDeque::with_capacity(FRAME_HISTORY_CAPACITY)));
    let health = Arc::new(PipelineHealth::new());
    let watchdog_state = Arc::new(WatchdogState::new());
    let (encode_tx, encode_rx) = crossbeam_channel::bounded::<EncodeJob>(config.publish_queue);

    let encode_handle = spawn_encode_worker(
        shared.clone(),
        history.clone(),
        encode_rx,
        health.clone(),
        config.jpeg_quality,
    )
    .context("Failed to spawn publisher")?;

    let processing = ProcessingLoop::new(coordinator.clone(), opener, source, tracker)
        .with_frame_interval(config.frame_interval)
        .with_publisher(encode_tx, health.clone());
    let gate = WorkerGate::new();
    let processing_handle =
        spawn_processing_worker(&gate, processing, shutdown.clone(), health.clone())?;

    let watchdog_handle = spawn_watchdog(health.clone(), shutdown.clone(), watchdog_state.clone())
        .context("Failed to spawn watchdog")?;

    let server = spawn_preview_server(
        ServerState {
            coordinator,
            latest: shared,
            history,
            health,
            watchdog: watchdog_state,
            upload_dir: config.server.upload_dir.clone(),
            allowed_origins: config.server.allowed_origins.clone(),
            metrics: prometheus,
        },
        &config.server.host,
        config.server.port,
    );
    let server = match server {
        Ok(server) => server,
        Err(err) => {
            shutdown.store(true, Ordering::SeqCst);
            join_workers(processing_handle, encode_handle, watchdog_handle);
            return Err(err.context("Failed to start HTTP server"));
        }
    };

    info!("Counting traffic on {}. Press Ctrl+C to stop", config.source);
    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(SUPERVISOR_POLL_INTERVAL);
    }

    info!("Stopping traffic pipeline");
    server.stop();
    join_workers(processing_handle, encode_handle, watchdog_handle);
    Ok(())
}

fn join_workers(
    processing: Option<thread::JoinHandle<()>>,
    encoding: thread::JoinHandle<()>,
    watchdog: thread::JoinHandle<()>,
) {
    // The processing loop owns the publisher's sender, so the publisher exits
    // once the loop has.
    if let Some(handle) = processing {
        let _ = handle.join();
    }
    let _ = encoding.join();
    let _ = watchdog.join();
}

/// Run the counting engine over a recorded clip without the server and return
/// the last result record.
///
/// With `frames` unset the clip is played once; otherwise exactly `frames`
/// frames are processed, looping over the clip as the service would.
pub fn run_headless(clip: &str, frames: Option<u64>) -> Result<FrameReport> {
    let opener: Arc<dyn SourceOpener> = Arc::new(DefaultOpener);
    let source = opener
        .open(clip)
        .with_context(|| format!("Failed to open clip {clip}"))?;
    let tracker = ReplayTracker::from_clip(clip)
        .with_context(|| format!("Failed to load detections from {clip}"))?;
    let coordinator = ResetCoordinator::new(source.uri(), source.frame_height());
    let mut processing = ProcessingLoop::new(coordinator, opener, source, tracker);

    let mut last = None;
    while frames.is_none_or(|limit| processing.frames_processed() < limit) {
        match processing.step()? {
            StepOutcome::Frame(report) => last = Some(report),
            StepOutcome::Rewound if frames.is_none() || last.is_none() => break,
            StepOutcome::Rewound => {}
        }
    }
    last.ok_or_else(|| anyhow!("{clip} contains no frames"))
}
