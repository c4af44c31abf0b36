//! Stub sources and trackers for pipeline tests.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use ml_core::{Detection, Tracker, TrackerError};
use video_ingest::{CaptureError, Frame, FrameFormat, FrameSource, SourceOpener};

pub(crate) fn det(track_id: i64, class_id: i64, cx: f32, cy: f32) -> Detection {
    Detection {
        track_id,
        class_id,
        bbox_xywh: [cx, cy, 20.0, 10.0],
        score: 0.9,
    }
}

pub(crate) const STUB_HEIGHT: i32 = 300;

/// Geometry-only source producing `frames` frames before end of stream.
pub(crate) struct StubSource {
    pub(crate) uri: String,
    pub(crate) height: i32,
    pub(crate) frames: u64,
    pub(crate) next: u64,
}

impl StubSource {
    pub(crate) fn new(uri: &str, height: i32, frames: u64) -> Self {
        Self {
            uri: uri.to_string(),
            height,
            frames,
            next: 0,
        }
    }
}

impl FrameSource for StubSource {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn read_next(&mut self) -> Result<Option<Frame>, CaptureError> {
        if self.next >= self.frames {
            return Ok(None);
        }
        let index = self.next;
        self.next += 1;
        Ok(Some(Frame {
            data: Vec::new(),
            width: 400,
            height: self.height,
            index,
            timestamp_ms: 0,
            format: FrameFormat::Empty,
        }))
    }

    fn seek_to_start(&mut self) -> Result<(), CaptureError> {
        self.next = 0;
        Ok(())
    }

    fn frame_height(&self) -> i32 {
        self.height
    }
}

type OpenHook = Box<dyn Fn(&str) + Send + Sync>;

/// Opener that records every open and can be told to fail for given uris.
#[derive(Default)]
pub(crate) struct StubOpener {
    heights: HashMap<String, i32>,
    failing: Vec<String>,
    frames: u64,
    hook: Option<OpenHook>,
    opened: Mutex<Vec<String>>,
}

impl StubOpener {
    pub(crate) fn new() -> Self {
        Self {
            frames: 1_000,
            ..Self::default()
        }
    }

    pub(crate) fn with_height(mut self, uri: &str, height: i32) -> Self {
        self.heights.insert(uri.to_string(), height);
        self
    }

    pub(crate) fn failing(mut self, uri: &str) -> Self {
        self.failing.push(uri.to_string());
        self
    }

    pub(crate) fn on_open(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub(crate) fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }
}

impl SourceOpener for StubOpener {
    fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>, CaptureError> {
        if let Some(hook) = &self.hook {
            hook(uri);
        }
        self.opened.lock().unwrap().push(uri.to_string());
        if self.failing.iter().any(|failing| failing == uri) {
            return Err(CaptureError::Open {
                uri: uri.to_string(),
                reason: "no such file".into(),
            });
        }
        let height = self.heights.get(uri).copied().unwrap_or(STUB_HEIGHT);
        Ok(Box::new(StubSource::new(uri, height, self.frames)))
    }
}

/// Scripted tracker: detections per frame index, keyed by the bound uri.
#[derive(Clone, Default)]
pub(crate) struct ScriptedTracker {
    scripts: Arc<Mutex<HashMap<String, Vec<Vec<Detection>>>>>,
    bound: Arc<Mutex<String>>,
    pub(crate) calls: Arc<Mutex<Vec<(String, u64)>>>,
    pub(crate) fail_after: Option<usize>,
    refused: Vec<String>,
}

impl ScriptedTracker {
    pub(crate) fn new(bound: &str) -> Self {
        let tracker = Self::default();
        *tracker.bound.lock().unwrap() = bound.to_string();
        tracker
    }

    pub(crate) fn script(self, uri: &str, frames: Vec<Vec<Detection>>) -> Self {
        self.scripts.lock().unwrap().insert(uri.to_string(), frames);
        self
    }

    /// Fail to prepare for `uri`, as with a clip whose detections do not load.
    pub(crate) fn refusing(mut self, uri: &str) -> Self {
        self.refused.push(uri.to_string());
        self
    }
}

impl Tracker for ScriptedTracker {
    type Binding = String;

    fn track(&mut self, frame: &Frame) -> Result<Vec<Detection>, TrackerError> {
        let bound = self.bound.lock().unwrap().clone();
        let mut calls = self.calls.lock().unwrap();
        if self.fail_after.is_some_and(|limit| calls.len() >= limit) {
            return Err(TrackerError::Unavailable("model crashed".into()));
        }
        calls.push((bound.clone(), frame.index));
        Ok(self
            .scripts
            .lock()
            .unwrap()
            .get(&bound)
            .and_then(|frames| frames.get(frame.index as usize))
            .cloned()
            .unwrap_or_default())
    }

    fn prepare(&self, uri: &str) -> Result<String, TrackerError> {
        if self.refused.iter().any(|refused| refused == uri) {
            return Err(TrackerError::Load {
                uri: uri.to_string(),
                reason: "line 2: invalid type".into(),
            });
        }
        Ok(uri.to_string())
    }

    fn bind(&mut self, uri: String) {
        *self.bound.lock().unwrap() = uri;
    }
}
