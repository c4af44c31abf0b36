//! The single processing loop: apply pending source switches, read a frame,
//! track it, fold it into the counting epoch, and hand the result to the
//! publisher.
//!
//! Exactly one loop runs per service. Frames are tracked strictly in
//! acquisition order, and a pending switch is consumed before the next frame is
//! read so no detection from the old source lands in the new epoch.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use crossbeam_channel::{Sender, TrySendError};
use ml_core::Tracker;
use tracing::{debug, error, info, warn};
use video_ingest::{FrameSource, SourceOpener};

use crate::pipeline::{
    annotation::Overlay,
    coordinator::ResetCoordinator,
    data::FrameReport,
    encoding::EncodeJob,
    telemetry,
    watchdog::{HealthComponent, PipelineHealth},
};

/// What one call to [`ProcessingLoop::step`] did.
#[derive(Debug)]
pub enum StepOutcome {
    /// A frame was tracked and counted.
    Frame(FrameReport),
    /// The source hit end of stream and was rewound to its first frame.
    Rewound,
}

pub struct ProcessingLoop<T: Tracker> {
    coordinator: ResetCoordinator,
    opener: Arc<dyn SourceOpener>,
    tracker: T,
    source: Box<dyn FrameSource>,
    frame_interval: Duration,
    publish_tx: Option<Sender<EncodeJob>>,
    health: Arc<PipelineHealth>,
    frames: u64,
}

impl<T: Tracker> ProcessingLoop<T> {
    /// `source` must be the source `coordinator` was created for, and
    /// `tracker` must already be bound to it.
    pub fn new(
        coordinator: ResetCoordinator,
        opener: Arc<dyn SourceOpener>,
        source: Box<dyn FrameSource>,
        tracker: T,
    ) -> Self {
        Self {
            coordinator,
            opener,
            tracker,
            source,
            frame_interval: Duration::ZERO,
            publish_tx: None,
            health: Arc::new(PipelineHealth::new()),
            frames: 0,
        }
    }

    /// Pause between cycles in [`run`](Self::run).
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    pub(crate) fn with_publisher(
        mut self,
        publish_tx: Sender<EncodeJob>,
        health: Arc<PipelineHealth>,
    ) -> Self {
        self.publish_tx = Some(publish_tx);
        self.health = health;
        self
    }

    pub fn source_uri(&self) -> &str {
        self.source.uri()
    }

    /// Frames tracked since the loop was created.
    pub fn frames_processed(&self) -> u64 {
        self.frames
    }

    /// Run one cycle. Errors are fatal to the loop.
    pub fn step(&mut self) -> Result<StepOutcome> {
        self.apply_pending_switch();

        let frame = match self.source.read_next() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("end of stream on {}, rewinding", self.source.uri());
                self.rewind()?;
                return Ok(StepOutcome::Rewound);
            }
            Err(err) => {
                warn!("read failed on {} ({err}), rewinding", self.source.uri());
                self.rewind()?;
                return Ok(StepOutcome::Rewound);
            }
        };

        self.frames += 1;
        let frame_span = tracing::info_span!(
            "frame",
            frame = self.frames,
            index = frame.index,
            width = frame.width,
            height = frame.height
        );
        let _frame_guard = frame_span.enter();

        let tracking_start = Instant::now();
        let detections = self
            .tracker
            .track(&frame)
            .with_context(|| format!("tracker failed on frame #{}", self.frames))?;
        metrics::histogram!("traffic_stage_latency_seconds", "stage" => "tracking")
            .record(tracking_start.elapsed().as_secs_f64());

        let counting_start = Instant::now();
        let tally = self.coordinator.process_frame(&detections);
        metrics::histogram!("traffic_stage_latency_seconds", "stage" => "counting")
            .record(counting_start.elapsed().as_secs_f64());

        metrics::counter!("traffic_frames_processed_total").increment(1);
        metrics::gauge!("traffic_density").set(tally.status.density as f64);
        metrics::gauge!("traffic_active_tracks").set(tally.boxes.len() as f64);
        if tally.reaped > 0 {
            metrics::counter!("traffic_tracks_reaped_total").increment(tally.reaped as u64);
        }
        for (track_id, class) in &tally.crossings {
            debug!(track_id, class = %class, "line crossing counted");
            metrics::counter!("traffic_crossings_total", "class" => class.label()).increment(1);
        }
        self.health.beat(HealthComponent::Processor);

        let report = FrameReport::from_tally(self.frames, frame.timestamp_ms, &tally);

        if let Some(tx) = &self.publish_tx {
            let job = EncodeJob {
                overlay: Overlay::from_tally(&tally),
                report: report.clone(),
                frame,
                span: frame_span.clone(),
            };
            match tx.try_send(job) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    metrics::counter!("traffic_publish_dropped_total").increment(1);
                    debug!("publisher behind, dropped frame #{}", self.frames);
                }
                Err(TrySendError::Disconnected(_)) => {
                    anyhow::bail!("publisher channel closed");
                }
            }
        }

        Ok(StepOutcome::Frame(report))
    }

    /// Step until `shutdown` is raised or a cycle fails.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        while !shutdown.load(Ordering::Relaxed) {
            if !self.frame_interval.is_zero() {
                thread::sleep(self.frame_interval);
            }
            self.step()?;
        }
        info!("processing loop stopped after {} frame(s)", self.frames);
        Ok(())
    }

    /// Bind the pending source, if any. The new source is opened and the
    /// tracker prepared for it before anything is committed, so a source that
    /// fails either step leaves the loop on the old one.
    fn apply_pending_switch(&mut self) {
        let switched = self.coordinator.consume_reset_with(|uri| {
            let source = self.opener.open(uri)?;
            let binding = self.tracker.prepare(uri)?;
            Ok((source, binding))
        });
        match switched {
            Ok(None) => {}
            Ok(Some(applied)) => {
                self.source = applied.source;
                self.tracker.bind(applied.binding);
                metrics::counter!("traffic_source_switches_total", "outcome" => "applied")
                    .increment(1);
                info!(
                    generation = applied.generation,
                    epoch = applied.epoch,
                    line_y = applied.line_y,
                    "switched source to {}",
                    applied.uri
                );
            }
            Err(err) => {
                metrics::counter!("traffic_source_switches_total", "outcome" => "failed")
                    .increment(1);
                warn!("Source switch failed: {:#}", anyhow::Error::from(err));
            }
        }
    }

    fn rewind(&mut self) -> Result<()> {
        self.source
            .seek_to_start()
            .with_context(|| format!("failed to rewind {}", self.source.uri()))
    }
}

/// One-time start latch for the processing worker.
#[derive(Debug, Default)]
pub struct WorkerGate {
    started: AtomicBool,
}

impl WorkerGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` for the first caller only.
    pub fn try_start(&self) -> bool {
        self.started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

/// Spawn the processing worker thread, unless the gate was already opened.
///
/// A fatal loop error is logged and recorded as the pipeline halt reason; the
/// loop is not restarted.
pub(crate) fn spawn_processing_worker<T: Tracker + 'static>(
    gate: &WorkerGate,
    mut processing: ProcessingLoop<T>,
    shutdown: Arc<AtomicBool>,
    health: Arc<PipelineHealth>,
) -> Result<Option<thread::JoinHandle<()>>> {
    if !gate.try_start() {
        warn!("processing worker already started; ignoring second start");
        return Ok(None);
    }

    let handle = telemetry::spawn_thread("traffic-processing", move || {
        let worker_span = tracing::info_span!("processing.worker", source = %processing.source_uri());
        let _worker_guard = worker_span.enter();
        if let Err(err) = processing.run(&shutdown) {
            error!("Processing loop halted: {err:?}");
            metrics::gauge!("traffic_pipeline_halted").set(1.0);
            health.halt(format!("{err:#}"));
        }
    })
    .context("Failed to spawn processing worker")?;
    Ok(Some(handle))
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::bounded;
    use ml_core::TrafficClass;

    use super::*;
    use crate::pipeline::test_support::{STUB_HEIGHT, ScriptedTracker, StubOpener, StubSource, det};

    const LINE_Y: i32 = STUB_HEIGHT * 2 / 3;

    fn processing(
        opener: StubOpener,
        frames: u64,
        tracker: ScriptedTracker,
    ) -> ProcessingLoop<ScriptedTracker> {
        ProcessingLoop::new(
            ResetCoordinator::new("a.mp4", STUB_HEIGHT),
            Arc::new(opener),
            Box::new(StubSource::new("a.mp4", STUB_HEIGHT, frames)),
            tracker,
        )
    }

    fn frame_report(outcome: StepOutcome) -> FrameReport {
        match outcome {
            StepOutcome::Frame(report) => report,
            StepOutcome::Rewound => panic!("expected a frame"),
        }
    }

    fn crossing_script() -> Vec<Vec<ml_core::Detection>> {
        let line = LINE_Y as f32;
        vec![
            vec![det(7, 2, 50.0, line - 5.0)],
            vec![det(7, 2, 50.0, line + 5.0)],
            vec![det(7, 2, 50.0, line + 10.0)],
        ]
    }

    #[test]
    fn counts_a_car_crossing_once() {
        let tracker = ScriptedTracker::new("a.mp4").script("a.mp4", crossing_script());
        let mut processing = processing(StubOpener::new(), 3, tracker);

        let first = frame_report(processing.step().unwrap());
        assert_eq!(first.counts[&TrafficClass::Car], 0);
        let second = frame_report(processing.step().unwrap());
        assert_eq!(second.counts[&TrafficClass::Car], 1);
        let third = frame_report(processing.step().unwrap());
        assert_eq!(third.counts[&TrafficClass::Car], 1);
        assert_eq!(third.status.density, 1);
        assert_eq!(third.frame_number, 3);
    }

    #[test]
    fn end_of_stream_rewinds_to_first_frame() {
        let tracker = ScriptedTracker::new("a.mp4");
        let calls = tracker.calls.clone();
        let mut processing = processing(StubOpener::new(), 2, tracker);

        frame_report(processing.step().unwrap());
        frame_report(processing.step().unwrap());
        assert!(matches!(processing.step().unwrap(), StepOutcome::Rewound));
        frame_report(processing.step().unwrap());

        let indices: Vec<u64> = calls.lock().unwrap().iter().map(|(_, idx)| *idx).collect();
        assert_eq!(indices, vec![0, 1, 0]);
    }

    #[test]
    fn switch_applies_before_next_frame() {
        let tracker = ScriptedTracker::new("a.mp4")
            .script("a.mp4", crossing_script())
            .script("b.mp4", vec![vec![det(9, 7, 10.0, 10.0)]]);
        let calls = tracker.calls.clone();
        let mut processing = processing(StubOpener::new().with_height("b.mp4", 600), 3, tracker);
        let coordinator = processing.coordinator.clone();

        frame_report(processing.step().unwrap());
        let counted = frame_report(processing.step().unwrap());
        assert_eq!(counted.status.density, 1);

        coordinator.request_switch("b.mp4");
        let after = frame_report(processing.step().unwrap());
        assert_eq!(after.epoch, 1);
        assert_eq!(after.status.density, 0);
        assert_eq!(processing.source_uri(), "b.mp4");
        assert_eq!(coordinator.snapshot().line_y, 400);
        assert_eq!(calls.lock().unwrap().last().unwrap(), &("b.mp4".to_string(), 0));
    }

    #[test]
    fn failed_switch_keeps_reading_old_source() {
        let tracker = ScriptedTracker::new("a.mp4").script("a.mp4", crossing_script());
        let mut processing = processing(StubOpener::new().failing("missing.mp4"), 3, tracker);
        let coordinator = processing.coordinator.clone();

        frame_report(processing.step().unwrap());
        coordinator.request_switch("missing.mp4");
        let report = frame_report(processing.step().unwrap());

        assert_eq!(processing.source_uri(), "a.mp4");
        assert_eq!(report.epoch, 0);
        assert_eq!(report.counts[&TrafficClass::Car], 1);
        let snapshot = coordinator.snapshot();
        assert!(!snapshot.reset_pending);
        assert_eq!(snapshot.last_failure.unwrap().uri, "missing.mp4");
    }

    #[test]
    fn switch_that_tracker_cannot_follow_keeps_old_source() {
        let tracker = ScriptedTracker::new("a.mp4")
            .script("a.mp4", crossing_script())
            .refusing("bad.jsonl");
        let calls = tracker.calls.clone();
        let mut processing = processing(StubOpener::new().with_height("bad.jsonl", 900), 3, tracker);
        let coordinator = processing.coordinator.clone();

        frame_report(processing.step().unwrap());
        frame_report(processing.step().unwrap());
        let ticket = coordinator.request_switch("bad.jsonl");
        let report = frame_report(processing.step().unwrap());

        assert_eq!(processing.source_uri(), "a.mp4");
        assert_eq!(report.epoch, 0);
        assert_eq!(report.counts[&TrafficClass::Car], 1);
        assert_eq!(calls.lock().unwrap().last().unwrap(), &("a.mp4".to_string(), 2));
        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.bound_source, "a.mp4");
        assert_eq!(snapshot.line_y, LINE_Y);
        assert!(!snapshot.reset_pending);
        let failure = snapshot.last_failure.unwrap();
        assert_eq!(failure.generation, ticket.generation);
        assert!(failure.reason.contains("bad.jsonl"));
    }

    #[test]
    fn request_during_open_is_applied_in_same_step() {
        let tracker = ScriptedTracker::new("a.mp4")
            .script("a.mp4", crossing_script())
            .script("c.mp4", vec![vec![det(4, 5, 10.0, 10.0)]]);
        let calls = tracker.calls.clone();
        let coordinator = ResetCoordinator::new("a.mp4", STUB_HEIGHT);
        let racer = coordinator.clone();
        let raced = std::sync::Mutex::new(false);
        let opener = StubOpener::new().on_open(move |uri| {
            let mut raced = raced.lock().unwrap();
            if uri == "b.mp4" && !*raced {
                *raced = true;
                racer.request_switch("c.mp4");
            }
        });
        let mut processing = ProcessingLoop::new(
            coordinator.clone(),
            Arc::new(opener),
            Box::new(StubSource::new("a.mp4", STUB_HEIGHT, 3)),
            tracker,
        );

        frame_report(processing.step().unwrap());
        frame_report(processing.step().unwrap());
        coordinator.request_switch("b.mp4");
        let report = frame_report(processing.step().unwrap());

        assert_eq!(report.epoch, 1);
        assert_eq!(report.counts[&TrafficClass::Car], 0);
        assert_eq!(processing.source_uri(), "c.mp4");
        assert_eq!(calls.lock().unwrap().last().unwrap(), &("c.mp4".to_string(), 0));
        assert!(!coordinator.is_reset_pending());
    }

    #[test]
    fn tracker_failure_is_fatal() {
        let mut tracker = ScriptedTracker::new("a.mp4");
        tracker.fail_after = Some(1);
        let mut processing = processing(StubOpener::new(), 10, tracker);

        frame_report(processing.step().unwrap());
        let err = processing.step().unwrap_err();
        assert!(format!("{err:#}").contains("model crashed"));
    }

    #[test]
    fn full_publisher_queue_drops_without_blocking() {
        let (tx, rx) = bounded(1);
        let tracker = ScriptedTracker::new("a.mp4");
        let health = Arc::new(PipelineHealth::new());
        let mut processing = processing(StubOpener::new(), 10, tracker).with_publisher(tx, health);

        frame_report(processing.step().unwrap());
        frame_report(processing.step().unwrap());
        assert_eq!(rx.len(), 1);

        drop(rx);
        assert!(processing.step().is_err());
    }

    #[test]
    fn worker_gate_refuses_second_start() {
        let gate = WorkerGate::new();
        let shutdown = Arc::new(AtomicBool::new(true));
        let health = Arc::new(PipelineHealth::new());

        let first = spawn_processing_worker(
            &gate,
            processing(StubOpener::new(), 1, ScriptedTracker::new("a.mp4")),
            shutdown.clone(),
            health.clone(),
        )
        .unwrap();
        let second = spawn_processing_worker(
            &gate,
            processing(StubOpener::new(), 1, ScriptedTracker::new("a.mp4")),
            shutdown,
            health.clone(),
        )
        .unwrap();

        assert!(gate.is_started());
        assert!(second.is_none());
        first.unwrap().join().unwrap();
        assert!(health.halted().is_none());
    }
}
