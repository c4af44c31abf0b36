//! Publisher stage: draws the overlay, encodes the JPEG, and keeps the latest
//! packet and the short history ring in sync for the HTTP server.
//!
//! Runs on its own thread so that a slow encode never holds up tracking; the
//! processing loop drops jobs when this stage falls behind.

use std::{
    io,
    sync::{Arc, PoisonError},
    thread,
    time::Instant,
};

use crossbeam_channel::Receiver;
use tracing::{Span, warn};
use video_ingest::Frame;

use crate::pipeline::{
    annotation::{Overlay, annotate_frame},
    data::{FRAME_HISTORY_CAPACITY, FrameHistory, FramePacket, FrameReport, SharedFrame},
    telemetry,
    watchdog::{HealthComponent, PipelineHealth},
};

/// Frame handed from the processing loop to the publisher.
pub(crate) struct EncodeJob {
    pub(crate) frame: Frame,
    pub(crate) report: FrameReport,
    pub(crate) overlay: Overlay,
    pub(crate) span: Span,
}

/// Spawn the publisher thread. It exits once every sender is dropped.
pub(crate) fn spawn_encode_worker(
    shared: SharedFrame,
    history: FrameHistory,
    encode_rx: Receiver<EncodeJob>,
    health: Arc<PipelineHealth>,
    jpeg_quality: u8,
) -> io::Result<thread::JoinHandle<()>> {
    telemetry::spawn_thread("traffic-publishing", move || {
        let worker_span = tracing::info_span!("encoding.worker", codec = "jpeg");
        let _worker_guard = worker_span.enter();
        for job in encode_rx {
            let encode_start = Instant::now();
            let EncodeJob {
                frame,
                report,
                overlay,
                span,
            } = job;
            let _frame_guard = span.enter();

            let jpeg = match annotate_frame(&frame, &overlay, jpeg_quality) {
                Ok(jpeg) => jpeg,
                Err(err) => {
                    warn!("Failed to encode frame #{}: {err}", report.frame_number);
                    metrics::counter!("traffic_encoding_errors_total").increment(1);
                    None
                }
            };
            publish(&shared, &history, FramePacket { report, jpeg });
            health.beat(HealthComponent::Publisher);

            metrics::histogram!("traffic_stage_latency_seconds", "stage" => "publishing")
                .record(encode_start.elapsed().as_secs_f64());
        }
    })
}

/// Store `packet` as the latest frame and append it to the history ring.
pub(crate) fn publish(shared: &SharedFrame, history: &FrameHistory, packet: FramePacket) {
    {
        let mut ring = history.lock().unwrap_or_else(PoisonError::into_inner);
        ring.push_back(packet.clone());
        while ring.len() > FRAME_HISTORY_CAPACITY {
            ring.pop_front();
        }
    }
    *shared.lock().unwrap_or_else(PoisonError::into_inner) = Some(packet);
}
