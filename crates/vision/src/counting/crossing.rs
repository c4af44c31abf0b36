//! Downward line-crossing test.
//!
//! A track crosses when its previous centroid is strictly above the counting
//! line and its latest centroid is on or below it. Upward motion and tracks
//! already past the line never fire, so together with the counted-id set each
//! object is counted once per transit in the monitored direction.

use std::collections::VecDeque;

use crate::counting::history::Point;

/// Counting line position for a frame of the given height (two thirds down).
pub fn line_y_for_height(frame_height: i32) -> i32 {
    (i64::from(frame_height.max(0)) * 2 / 3) as i32
}

/// Whether the last step of `history` crossed `line_y` moving down.
pub fn evaluate(history: &VecDeque<Point>, line_y: i32) -> bool {
    let len = history.len();
    if len < 2 {
        return false;
    }
    let prev_y = history[len - 2].1;
    let curr_y = history[len - 1].1;
    let line = line_y as f32;
    prev_y < line && line <= curr_y
}
