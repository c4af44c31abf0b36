//! OpenCV-backed video file and device source.

use chrono::Utc;
use opencv::{
    core::MatTraitConstManual,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst},
};
use tracing::warn;

use crate::types::{CaptureError, Frame, FrameFormat, FrameSource};

/// Pull-based reader over an OpenCV `VideoCapture`.
///
/// Frames are delivered as BGR8 at the native resolution of the input so that
/// the counting line stays aligned with the detector's coordinates.
pub struct VideoFileSource {
    uri: String,
    cap: VideoCapture,
    frame: Mat,
    next_index: u64,
    height: i32,
}

impl VideoFileSource {
    pub fn open(uri: &str) -> Result<Self, CaptureError> {
        let cap = open_video_capture(uri)?;
        let height = cap
            .get(videoio::CAP_PROP_FRAME_HEIGHT)
            .map_err(|e| CaptureError::Other(e.into()))? as i32;
        Ok(Self {
            uri: uri.to_string(),
            cap,
            frame: Mat::default(),
            next_index: 0,
            height,
        })
    }
}

impl FrameSource for VideoFileSource {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn read_next(&mut self) -> Result<Option<Frame>, CaptureError> {
        let grabbed = self
            .cap
            .read(&mut self.frame)
            .map_err(|e| CaptureError::Other(e.into()))?;
        if !grabbed {
            return Ok(None);
        }

        let size = self.frame.size().map_err(|e| CaptureError::Other(e.into()))?;
        if size.width <= 0 || size.height <= 0 {
            return Ok(None);
        }

        let data = self
            .frame
            .data_bytes()
            .map_err(|e| CaptureError::Other(e.into()))?
            .to_vec();
        let index = self.next_index;
        self.next_index += 1;

        Ok(Some(Frame {
            data,
            width: size.width,
            height: size.height,
            index,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        }))
    }

    fn seek_to_start(&mut self) -> Result<(), CaptureError> {
        self.cap
            .set(videoio::CAP_PROP_POS_FRAMES, 0.0)
            .map_err(|e| CaptureError::Other(e.into()))?;
        self.next_index = 0;
        Ok(())
    }

    fn frame_height(&self) -> i32 {
        self.height
    }
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub(crate) fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    let stripped = uri.strip_prefix("/dev/video")?;
    if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
        return stripped.parse::<i32>().ok();
    }
    None
}

/// Open a capture either by device index or by file/stream URI.
fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    if let Some(index) = parse_device_index(uri) {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new(index, backend) {
                Ok(cap) => {
                    if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                        return Ok(cap);
                    }
                }
                Err(err) => {
                    warn!("failed to open device #{index} with backend {backend}: {err}");
                }
            }
        }
    }

    match VideoCapture::from_file(uri, videoio::CAP_ANY) {
        Ok(cap) => {
            if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                return Ok(cap);
            }
            Err(CaptureError::Open {
                uri: uri.to_string(),
                reason: "capture did not open".into(),
            })
        }
        Err(err) => Err(CaptureError::Open {
            uri: uri.to_string(),
            reason: err.to_string(),
        }),
    }
}
