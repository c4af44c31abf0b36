//! Counting engine: track history, crossing test, cumulative counters, stale
//! track reaping, and traffic classification.
//!
//! [`CountingState`] bundles everything that belongs to one counting epoch and
//! exposes each multi-field mutation as a single method, so callers holding
//! the bundle behind one lock can never observe it half-updated.

use std::collections::{BTreeMap, HashSet};

use ml_core::{Detection, TrafficClass};
use tracing::trace;

pub mod counters;
pub mod crossing;
pub mod history;
pub mod reaper;
pub mod traffic;

pub use counters::CumulativeCounters;
pub use crossing::line_y_for_height;
pub use history::{HISTORY_WINDOW, Point, TrackHistory};
pub use traffic::{TrafficLevel, TrafficStatus, classify};

/// Track drawn on the overlay for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackBox {
    pub track_id: i64,
    pub class: TrafficClass,
    /// `[left, top, right, bottom]` in frame pixels.
    pub bbox: [f32; 4],
    pub counted: bool,
}

/// Outcome of folding one frame of detections into the epoch.
#[derive(Debug, Clone)]
pub struct FrameTally {
    pub epoch: u64,
    pub line_y: i32,
    pub counts: BTreeMap<TrafficClass, u64>,
    pub status: TrafficStatus,
    pub crossings: Vec<(i64, TrafficClass)>,
    pub boxes: Vec<TrackBox>,
    pub reaped: usize,
}

/// Counting state of one epoch.
#[derive(Debug)]
pub struct CountingState {
    epoch: u64,
    line_y: i32,
    history: TrackHistory,
    counters: CumulativeCounters,
}

impl CountingState {
    pub fn new(line_y: i32) -> Self {
        Self {
            epoch: 0,
            line_y,
            history: TrackHistory::new(),
            counters: CumulativeCounters::new(),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn line_y(&self) -> i32 {
        self.line_y
    }

    pub fn history(&self) -> &TrackHistory {
        &self.history
    }

    pub fn counters(&self) -> &CumulativeCounters {
        &self.counters
    }

    /// Record a centroid, test for a crossing, and count it. Returns whether
    /// this observation produced a new count.
    pub fn observe(&mut self, track_id: i64, class: TrafficClass, position: Point) -> bool {
        let window = self.history.update(track_id, position);
        crossing::evaluate(window, self.line_y) && self.counters.register_crossing(track_id, class)
    }

    /// Fold a whole frame: observe every recognized detection, prune tracks
    /// missing from the frame, and classify the new totals.
    pub fn process_frame(&mut self, detections: &[Detection]) -> FrameTally {
        let mut active_ids = HashSet::with_capacity(detections.len());
        let mut crossings = Vec::new();
        let mut boxes = Vec::with_capacity(detections.len());

        for det in detections {
            let Some(class) = det.traffic_class() else {
                continue;
            };
            active_ids.insert(det.track_id);
            if self.observe(det.track_id, class, det.centroid()) {
                crossings.push((det.track_id, class));
            }
            boxes.push(TrackBox {
                track_id: det.track_id,
                class,
                bbox: det.bbox_ltrb(),
                counted: self.counters.is_counted(det.track_id),
            });
        }

        let reaped = reaper::prune(&mut self.history, &active_ids);
        if reaped > 0 {
            trace!(reaped, remaining = self.history.len(), "pruned stale tracks");
        }

        FrameTally {
            epoch: self.epoch,
            line_y: self.line_y,
            counts: self.counters.snapshot(),
            status: self.status(),
            crossings,
            boxes,
            reaped,
        }
    }

    pub fn density(&self) -> u64 {
        self.counters.total_for(&TrafficClass::DENSITY)
    }

    pub fn status(&self) -> TrafficStatus {
        classify(self.density())
    }

    /// Start a new epoch with a fresh line position.
    pub fn begin_epoch(&mut self, line_y: i32) {
        self.history.clear();
        self.counters.reset();
        self.line_y = line_y;
        self.epoch += 1;
    }
}
