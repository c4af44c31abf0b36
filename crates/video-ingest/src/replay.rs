//! Recorded clips: pre-tracked detection logs replayed as a video source.
//!
//! A clip is a JSON-lines file. The first line is a header carrying the frame
//! geometry, every following non-blank line describes one frame:
//!
//! ```text
//! {"width":1280,"height":720}
//! {"detections":[{"track_id":7,"class_id":2,"bbox":[640.0,300.0,80.0,60.0]}]}
//! {"detections":[]}
//! ```
//!
//! The source only needs the header and the frame count; the detections are
//! read by the replay tracker in `ml-core`. Opening still checks that every
//! frame line is an object whose `detections`, when present, is a list, so a
//! clip that is obviously broken fails at open time.

use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use chrono::Utc;
use serde::{Deserialize, de::IgnoredAny};
use tracing::debug;

use crate::types::{CaptureError, Frame, FrameFormat, FrameSource};

/// File extension identifying recorded clips.
pub const CLIP_EXTENSION: &str = "jsonl";

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct ClipHeader {
    pub width: i32,
    pub height: i32,
}

#[derive(Deserialize)]
struct FrameLine {
    #[serde(default, rename = "detections")]
    _detections: Vec<IgnoredAny>,
}

/// Whether `uri` names a recorded clip rather than a real video.
pub fn is_clip(uri: &str) -> bool {
    Path::new(uri)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(CLIP_EXTENSION))
}

/// Parse the header line of a clip, check the shape of its frame lines, and
/// count them.
pub fn scan_clip(uri: &str) -> Result<(ClipHeader, u64), CaptureError> {
    let file = File::open(uri).map_err(|err| CaptureError::Open {
        uri: uri.to_string(),
        reason: err.to_string(),
    })?;
    let mut lines = BufReader::new(file).lines();

    let header_line = lines.next().transpose()?.ok_or_else(|| CaptureError::Malformed {
        uri: uri.to_string(),
        line: 1,
        reason: "missing header".into(),
    })?;
    let header: ClipHeader =
        serde_json::from_str(&header_line).map_err(|err| CaptureError::Malformed {
            uri: uri.to_string(),
            line: 1,
            reason: err.to_string(),
        })?;
    if header.width <= 0 || header.height <= 0 {
        return Err(CaptureError::Malformed {
            uri: uri.to_string(),
            line: 1,
            reason: format!("invalid geometry {}x{}", header.width, header.height),
        });
    }

    let mut frames = 0u64;
    for (idx, line) in lines.enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        serde_json::from_str::<FrameLine>(&line).map_err(|err| CaptureError::Malformed {
            uri: uri.to_string(),
            line: idx + 2,
            reason: err.to_string(),
        })?;
        frames += 1;
    }
    Ok((header, frames))
}

/// Replays the frames of a recorded clip as geometry-only frames.
pub struct ReplaySource {
    uri: String,
    header: ClipHeader,
    frame_count: u64,
    next_index: u64,
}

impl ReplaySource {
    pub fn open(uri: &str) -> Result<Self, CaptureError> {
        let (header, frame_count) = scan_clip(uri)?;
        debug!(
            "replay source {uri}: {}x{}, {frame_count} frame(s)",
            header.width, header.height
        );
        Ok(Self {
            uri: uri.to_string(),
            header,
            frame_count,
            next_index: 0,
        })
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}

impl FrameSource for ReplaySource {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn read_next(&mut self) -> Result<Option<Frame>, CaptureError> {
        if self.next_index >= self.frame_count {
            return Ok(None);
        }
        let index = self.next_index;
        self.next_index += 1;
        Ok(Some(Frame {
            data: Vec::new(),
            width: self.header.width,
            height: self.header.height,
            index,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Empty,
        }))
    }

    fn seek_to_start(&mut self) -> Result<(), CaptureError> {
        self.next_index = 0;
        Ok(())
    }

    fn frame_height(&self) -> i32 {
        self.header.height
    }
}
