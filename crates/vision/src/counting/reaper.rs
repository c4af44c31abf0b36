//! Per-frame removal of tracks the tracker no longer reports.
//!
//! Only the history is pruned. Counted ids stay in the counters until the next
//! epoch reset, so a track id that reappears is not counted a second time.
//! A tracker that reuses an id for a different object therefore undercounts;
//! that is inherent to id-based counting.

use std::collections::HashSet;

use crate::counting::history::TrackHistory;

/// Drop every history entry whose id is not in `active_ids`. Returns the number
/// of tracks removed.
pub fn prune(history: &mut TrackHistory, active_ids: &HashSet<i64>) -> usize {
    let before = history.len();
    history.retain(|id| active_ids.contains(&id));
    before - history.len()
}
