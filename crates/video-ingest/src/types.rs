use anyhow::Error;
use thiserror::Error;

/// Frame handed from a source to the tracker and the renderer.
///
/// `index` is the position of the frame inside its source and restarts at zero
/// whenever the source seeks back to the beginning.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub index: u64,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

impl Frame {
    /// Whether the frame carries pixel data that can be drawn on.
    pub fn has_pixels(&self) -> bool {
        match self.format {
            FrameFormat::Bgr8 => {
                self.width > 0
                    && self.height > 0
                    && self.data.len() == (self.width as usize) * (self.height as usize) * 3
            }
            FrameFormat::Empty => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
    /// Geometry only, used by recorded clips that carry detections but no pixels.
    Empty,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}: {reason}")]
    Open { uri: String, reason: String },
    #[error("no reader available for {uri:?}")]
    Unsupported { uri: String },
    #[error("malformed clip {uri:?} at line {line}: {reason}")]
    Malformed {
        uri: String,
        line: usize,
        reason: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] Error),
}

/// A bound, readable video source.
pub trait FrameSource: Send {
    /// Identifier the source was opened with.
    fn uri(&self) -> &str;

    /// Next frame, or `None` at end of stream.
    fn read_next(&mut self) -> Result<Option<Frame>, CaptureError>;

    /// Rewind to the first frame.
    fn seek_to_start(&mut self) -> Result<(), CaptureError>;

    /// Height in pixels of the frames this source produces.
    fn frame_height(&self) -> i32;
}

/// Factory turning a source identifier into a bound [`FrameSource`].
pub trait SourceOpener: Send + Sync {
    fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>, CaptureError>;
}

impl<F> SourceOpener for F
where
    F: Fn(&str) -> Result<Box<dyn FrameSource>, CaptureError> + Send + Sync,
{
    fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>, CaptureError> {
        self(uri)
    }
}
