//! Tracker that replays the detections stored in a recorded clip.

use std::{
    fs::File,
    io::{BufRead, BufReader},
};

use serde::Deserialize;
use tracing::{debug, warn};
use video_ingest::{Frame, is_clip};

use crate::{
    detection::Detection,
    tracker::{Tracker, TrackerError},
};

#[derive(Deserialize)]
struct ClipFrame {
    #[serde(default)]
    detections: Vec<Detection>,
}

/// Detections of one clip, loaded ahead of a switch.
pub struct ClipDetections {
    uri: String,
    frames: Vec<Vec<Detection>>,
}

impl ClipDetections {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

/// Returns, for each frame, the detections recorded at the same index of the
/// clip the source is bound to.
#[derive(Default)]
pub struct ReplayTracker {
    uri: Option<String>,
    frames: Vec<Vec<Detection>>,
}

impl ReplayTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_clip(uri: &str) -> Result<Self, TrackerError> {
        let mut tracker = Self::new();
        tracker.rebind(uri)?;
        Ok(tracker)
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn load(uri: &str) -> Result<Vec<Vec<Detection>>, TrackerError> {
        let load_err = |line: usize, reason: String| TrackerError::Load {
            uri: uri.to_string(),
            reason: format!("line {line}: {reason}"),
        };
        let file = File::open(uri).map_err(|err| load_err(0, err.to_string()))?;

        let mut frames = Vec::new();
        // Line 1 is the geometry header consumed by the frame source.
        for (idx, line) in BufReader::new(file).lines().enumerate().skip(1) {
            let line = line.map_err(|err| load_err(idx + 1, err.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let frame: ClipFrame =
                serde_json::from_str(&line).map_err(|err| load_err(idx + 1, err.to_string()))?;
            frames.push(frame.detections);
        }
        Ok(frames)
    }
}

impl Tracker for ReplayTracker {
    type Binding = ClipDetections;

    fn track(&mut self, frame: &Frame) -> Result<Vec<Detection>, TrackerError> {
        if self.uri.is_none() {
            return Err(TrackerError::Unavailable(
                "replay tracker is not bound to a clip".into(),
            ));
        }
        Ok(self
            .frames
            .get(frame.index as usize)
            .cloned()
            .unwrap_or_default())
    }

    fn prepare(&self, uri: &str) -> Result<ClipDetections, TrackerError> {
        let frames = if is_clip(uri) {
            Self::load(uri)?
        } else {
            warn!("no recorded detections for {uri}; frames will carry no detections");
            Vec::new()
        };
        Ok(ClipDetections {
            uri: uri.to_string(),
            frames,
        })
    }

    fn bind(&mut self, binding: ClipDetections) {
        debug!(
            "replay tracker bound to {} ({} frame(s))",
            binding.uri,
            binding.frames.len()
        );
        self.frames = binding.frames;
        self.uri = Some(binding.uri);
    }
}
