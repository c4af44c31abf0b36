//! Detection types and the tracker boundary consumed by the counting engine.
//!
//! The engine never runs a model itself. It asks a [`Tracker`] for the tracked
//! detections of each frame, in frame order, and relies on the tracker keeping
//! track identifiers stable across calls.

pub mod detection;
pub mod replay;
pub mod tracker;

pub use detection::{Detection, TrafficClass};
pub use replay::{ClipDetections, ReplayTracker};
pub use tracker::{Tracker, TrackerError};
