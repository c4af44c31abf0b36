use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex},
};

use ml_core::TrafficClass;
use serde::Serialize;

use crate::counting::{FrameTally, TrafficStatus};

pub(crate) const FRAME_HISTORY_CAPACITY: usize = 64;

/// Per-frame result record pushed to clients.
#[derive(Debug, Clone, Serialize)]
pub struct FrameReport {
    pub frame_number: u64,
    pub timestamp_ms: i64,
    pub epoch: u64,
    pub counts: BTreeMap<TrafficClass, u64>,
    pub status: TrafficStatus,
}

impl FrameReport {
    pub(crate) fn from_tally(frame_number: u64, timestamp_ms: i64, tally: &FrameTally) -> Self {
        Self {
            frame_number,
            timestamp_ms,
            epoch: tally.epoch,
            counts: tally.counts.clone(),
            status: tally.status.clone(),
        }
    }
}

/// Published frame: the report plus the annotated JPEG when the frame had pixels.
#[derive(Clone)]
pub(crate) struct FramePacket {
    pub(crate) report: FrameReport,
    pub(crate) jpeg: Option<Vec<u8>>,
}

pub(crate) type SharedFrame = Arc<Mutex<Option<FramePacket>>>;
pub(crate) type FrameHistory = Arc<Mutex<VecDeque<FramePacket>>>;
