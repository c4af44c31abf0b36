use std::collections::{HashMap, VecDeque};

/// Number of centroid samples kept per track.
pub const HISTORY_WINDOW: usize = 30;

/// Centroid position in frame pixels.
pub type Point = (f32, f32);

/// Sliding window of recent centroids for every live track.
///
/// The store grows with the number of tracks; the reaper keeps it bounded to
/// the tracks visible in the current frame.
#[derive(Debug, Default)]
pub struct TrackHistory {
    tracks: HashMap<i64, VecDeque<Point>>,
}

impl TrackHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `position` to the track, evicting the oldest sample past the window.
    pub fn update(&mut self, track_id: i64, position: Point) -> &VecDeque<Point> {
        let window = self
            .tracks
            .entry(track_id)
            .or_insert_with(|| VecDeque::with_capacity(HISTORY_WINDOW + 1));
        window.push_back(position);
        if window.len() > HISTORY_WINDOW {
            window.pop_front();
        }
        window
    }

    pub fn get(&self, track_id: i64) -> Option<&VecDeque<Point>> {
        self.tracks.get(&track_id)
    }

    pub fn remove(&mut self, track_id: i64) {
        self.tracks.remove(&track_id);
    }

    pub fn contains(&self, track_id: i64) -> bool {
        self.tracks.contains_key(&track_id)
    }

    pub fn retain(&mut self, mut keep: impl FnMut(i64) -> bool) {
        self.tracks.retain(|id, _| keep(*id));
    }

    pub fn ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.tracks.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }
}
