//! Frame acquisition for the traffic counter.
//!
//! Sources are pull-based: the processing loop owns the bound [`FrameSource`]
//! and asks for one frame at a time, so frames reach the tracker strictly in
//! order. Recorded clips are always available; real video files and devices
//! need the `with-opencv` feature.

#[cfg(feature = "with-opencv")]
mod camera;
mod replay;
mod types;

#[cfg(feature = "with-opencv")]
pub use camera::VideoFileSource;
pub use replay::{CLIP_EXTENSION, ClipHeader, ReplaySource, is_clip, scan_clip};
pub use types::{CaptureError, Frame, FrameFormat, FrameSource, SourceOpener};

/// Opener used by the service: clips by extension, everything else through
/// OpenCV when it is compiled in.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultOpener;

impl SourceOpener for DefaultOpener {
    fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>, CaptureError> {
        if is_clip(uri) {
            return Ok(Box::new(ReplaySource::open(uri)?));
        }
        open_video(uri)
    }
}

#[cfg(feature = "with-opencv")]
fn open_video(uri: &str) -> Result<Box<dyn FrameSource>, CaptureError> {
    Ok(Box::new(VideoFileSource::open(uri)?))
}

#[cfg(not(feature = "with-opencv"))]
fn open_video(uri: &str) -> Result<Box<dyn FrameSource>, CaptureError> {
    Err(CaptureError::Unsupported {
        uri: uri.to_string(),
    })
}
