//! Overlay drawing for published frames: counting line, track boxes, and a
//! status strip in the traffic level color.

use anyhow::{Result, anyhow};
use image::{DynamicImage, ImageBuffer, Rgba, codecs::jpeg::JpegEncoder};
use video_ingest::Frame;

use crate::counting::{FrameTally, TrackBox, TrafficLevel};

const LINE_IDLE: Rgba<u8> = Rgba([255, 0, 0, 255]);
const LINE_HIT: Rgba<u8> = Rgba([0, 255, 0, 255]);
const BOX_COUNTED: Rgba<u8> = Rgba([255, 255, 0, 255]);
const BOX_PENDING: Rgba<u8> = Rgba([0, 0, 255, 255]);
const STATUS_STRIP_HEIGHT: i32 = 6;

/// What to draw on a frame.
#[derive(Debug, Clone)]
pub(crate) struct Overlay {
    pub(crate) line_y: i32,
    /// A crossing was counted on this frame.
    pub(crate) line_hit: bool,
    pub(crate) boxes: Vec<TrackBox>,
    pub(crate) level: TrafficLevel,
}

impl Overlay {
    pub(crate) fn from_tally(tally: &FrameTally) -> Self {
        Self {
            line_y: tally.line_y,
            line_hit: !tally.crossings.is_empty(),
            boxes: tally.boxes.clone(),
            level: tally.status.level,
        }
    }
}

/// Draw `overlay` on `frame` and encode it as JPEG. Frames without pixel data
/// produce no image.
pub(crate) fn annotate_frame(
    frame: &Frame,
    overlay: &Overlay,
    jpeg_quality: u8,
) -> Result<Option<Vec<u8>>> {
    if !frame.has_pixels() {
        return Ok(None);
    }

    let width = frame.width as u32;
    let height = frame.height as u32;
    let mut image = ImageBuffer::<Rgba<u8>, Vec<u8>>::from_vec(width, height, bgr_to_rgba(&frame.data))
        .ok_or_else(|| anyhow!("failed to convert frame into image buffer"))?;

    let (line_color, thickness) = if overlay.line_hit {
        (LINE_HIT, 4)
    } else {
        (LINE_IDLE, 2)
    };
    fill_rect(
        &mut image,
        0,
        overlay.line_y - thickness / 2,
        width as i32 - 1,
        overlay.line_y + thickness / 2 - 1,
        line_color,
    );

    for track in &overlay.boxes {
        let color = if track.counted { BOX_COUNTED } else { BOX_PENDING };
        let [left, top, right, bottom] = track.bbox;
        draw_rectangle(
            &mut image,
            left.round() as i32,
            top.round() as i32,
            right.round() as i32,
            bottom.round() as i32,
            color,
        );
    }

    fill_rect(
        &mut image,
        0,
        0,
        width as i32 - 1,
        STATUS_STRIP_HEIGHT - 1,
        level_color(overlay.level),
    );

    let rgb = DynamicImage::ImageRgba8(image).to_rgb8();
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, jpeg_quality.clamp(1, 100))
        .encode_image(&rgb)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(Some(buffer))
}

fn level_color(level: TrafficLevel) -> Rgba<u8> {
    match level {
        TrafficLevel::Low => Rgba([0, 200, 0, 255]),
        TrafficLevel::Medium => Rgba([255, 165, 0, 255]),
        TrafficLevel::High => Rgba([220, 0, 0, 255]),
    }
}

fn bgr_to_rgba(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len() / 3 * 4);
    for chunk in input.chunks_exact(3) {
        output.extend_from_slice(&[chunk[2], chunk[1], chunk[0], 255]);
    }
    output
}

fn draw_rectangle(
    image: &mut ImageBuffer<Rgba<u8>, Vec<u8>>,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgba<u8>,
) {
    fill_rect(image, left, top, right, top + 1, color);
    fill_rect(image, left, bottom - 1, right, bottom, color);
    fill_rect(image, left, top, left + 1, bottom, color);
    fill_rect(image, right - 1, top, right, bottom, color);
}

/// Fill the inclusive rectangle, clipped to the image.
fn fill_rect(
    image: &mut ImageBuffer<Rgba<u8>, Vec<u8>>,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgba<u8>,
) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    if right < 0 || bottom < 0 || left >= width || top >= height {
        return;
    }
    let left = left.max(0);
    let top = top.max(0);
    let right = right.min(width - 1);
    let bottom = bottom.min(height - 1);

    for y in top..=bottom {
        for x in left..=right {
            *image.get_pixel_mut(x as u32, y as u32) = color;
        }
    }
}
