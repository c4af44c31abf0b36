use thiserror::Error;
use video_ingest::Frame;

use crate::detection::Detection;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker unavailable: {0}")]
    Unavailable(String),
    #[error("failed to load detections from {uri:?}: {reason}")]
    Load { uri: String, reason: String },
}

/// Stateful detector + tracker.
///
/// Implementations keep track identities across calls, so frames must be
/// submitted in acquisition order, one call per frame.
///
/// Following a new source is split in two: [`prepare`](Self::prepare) does all
/// the fallible work without touching the current binding, and
/// [`bind`](Self::bind) swaps the result in. A switch can then be abandoned
/// after `prepare` with the tracker still following the old source.
pub trait Tracker: Send {
    /// Whatever the tracker loads for a source before following it.
    type Binding: Send;

    fn track(&mut self, frame: &Frame) -> Result<Vec<Detection>, TrackerError>;

    /// Load what is needed to follow `uri`. Must leave the current binding
    /// untouched.
    fn prepare(&self, uri: &str) -> Result<Self::Binding, TrackerError>;

    /// Follow the source `binding` was prepared for.
    fn bind(&mut self, binding: Self::Binding);

    fn rebind(&mut self, uri: &str) -> Result<(), TrackerError> {
        let binding = self.prepare(uri)?;
        self.bind(binding);
        Ok(())
    }
}
