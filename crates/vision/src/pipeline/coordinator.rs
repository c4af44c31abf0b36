//! Owner of the state shared between the processing loop and the control
//! endpoints: the bound source, the pending source switch, and the counting
//! epoch.
//!
//! Everything sits behind one mutex. Source switches are a single-slot
//! request: callers overwrite the requested source and raise the pending flag,
//! and the processing loop consumes the request once per cycle before reading
//! the next frame. Opening the new source happens outside the lock so that
//! callers never wait on a slow open; the epoch reset is then applied in one
//! critical section, and only if no newer request arrived in the meantime.
//! Otherwise the newer request is opened before the loop reads on.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use ml_core::{Detection, TrackerError, TrafficClass};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use video_ingest::{CaptureError, FrameSource, SourceOpener};

use crate::counting::{CountingState, FrameTally, TrafficStatus, line_y_for_height};

/// Receipt for a source switch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SwitchTicket {
    pub generation: u64,
}

/// Most recent switch that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwitchFailure {
    pub generation: u64,
    pub uri: String,
    pub reason: String,
}

/// Why a requested source could not be bound.
#[derive(Debug, Error)]
pub enum BindError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

#[derive(Debug, Error)]
pub enum SwitchError {
    #[error("failed to open {uri:?}, still reading {kept:?}")]
    Open {
        uri: String,
        kept: String,
        #[source]
        cause: BindError,
    },
}

/// Switch applied by [`ResetCoordinator::consume_reset_with`]. The caller must
/// replace its frame source with `source` and adopt `binding`.
pub struct AppliedSwitch<B = ()> {
    pub source: Box<dyn FrameSource>,
    pub binding: B,
    pub uri: String,
    pub generation: u64,
    pub epoch: u64,
    pub line_y: i32,
}

#[derive(Debug)]
struct SourceState {
    requested: String,
    bound: String,
    reset_pending: bool,
    generation: u64,
    last_failure: Option<SwitchFailure>,
}

#[derive(Debug)]
struct EngineState {
    source: SourceState,
    counting: CountingState,
}

/// Point-in-time copy of the shared state.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub bound_source: String,
    pub requested_source: String,
    pub reset_pending: bool,
    pub generation: u64,
    pub epoch: u64,
    pub line_y: i32,
    pub counts: BTreeMap<TrafficClass, u64>,
    pub status: TrafficStatus,
    pub tracked: usize,
    pub counted: usize,
    pub last_failure: Option<SwitchFailure>,
}

/// Cloneable handle to the shared engine state.
#[derive(Clone)]
pub struct ResetCoordinator {
    inner: Arc<Mutex<EngineState>>,
}

impl ResetCoordinator {
    /// Create the state for a source that is already open.
    pub fn new(bound_uri: &str, frame_height: i32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EngineState {
                source: SourceState {
                    requested: bound_uri.to_string(),
                    bound: bound_uri.to_string(),
                    reset_pending: false,
                    generation: 0,
                    last_failure: None,
                },
                counting: CountingState::new(line_y_for_height(frame_height)),
            })),
        }
    }

    // Every critical section leaves the state consistent before anything that
    // can panic, so a poisoned lock still guards valid data.
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask the processing loop to switch to `uri` and start a new epoch.
    ///
    /// Returns immediately. Requests that arrive before the loop consumes the
    /// previous one replace it.
    pub fn request_switch(&self, uri: impl Into<String>) -> SwitchTicket {
        let uri = uri.into();
        let mut state = self.lock();
        state.source.generation += 1;
        state.source.requested = uri.clone();
        state.source.reset_pending = true;
        let generation = state.source.generation;
        drop(state);

        info!(generation, "source switch requested: {uri}");
        SwitchTicket { generation }
    }

    /// Apply the pending switch, if any. Called by the processing loop only,
    /// once per cycle and before reading the next frame.
    ///
    /// On success the epoch is reset (line position, history, counters) in the
    /// same critical section that marks the new source as bound. When the open
    /// fails the previous source stays bound, the request is dropped, and the
    /// failure is recorded for [`snapshot`](Self::snapshot).
    pub fn consume_reset_if_pending(
        &self,
        opener: &dyn SourceOpener,
    ) -> Result<Option<AppliedSwitch>, SwitchError> {
        self.consume_reset_with(|uri| Ok((opener.open(uri)?, ())))
    }

    /// Like [`consume_reset_if_pending`](Self::consume_reset_if_pending), with
    /// `open` doing all the fallible work of binding a source: opening it and
    /// loading whatever else the loop needs for it (the returned `binding`).
    /// Nothing is committed unless `open` succeeds.
    ///
    /// A request that arrives while `open` runs supersedes the one being
    /// opened; the newest request is then opened in turn, so this only returns
    /// `Ok(None)` once no reset is pending.
    pub fn consume_reset_with<B>(
        &self,
        mut open: impl FnMut(&str) -> Result<(Box<dyn FrameSource>, B), BindError>,
    ) -> Result<Option<AppliedSwitch<B>>, SwitchError> {
        loop {
            let (uri, generation) = {
                let state = self.lock();
                if !state.source.reset_pending {
                    return Ok(None);
                }
                (state.source.requested.clone(), state.source.generation)
            };

            let opened = open(&uri);

            let mut state = self.lock();
            if state.source.generation != generation {
                debug!(
                    superseded = generation,
                    latest = state.source.generation,
                    "source switch superseded while opening {uri}"
                );
                continue;
            }

            state.source.reset_pending = false;
            return match opened {
                Ok((source, binding)) => {
                    let line_y = line_y_for_height(source.frame_height());
                    state.counting.begin_epoch(line_y);
                    state.source.bound = uri.clone();
                    state.source.last_failure = None;
                    Ok(Some(AppliedSwitch {
                        source,
                        binding,
                        uri,
                        generation,
                        epoch: state.counting.epoch(),
                        line_y,
                    }))
                }
                Err(cause) => {
                    let kept = state.source.bound.clone();
                    state.source.requested = kept.clone();
                    state.source.last_failure = Some(SwitchFailure {
                        generation,
                        uri: uri.clone(),
                        reason: cause.to_string(),
                    });
                    Err(SwitchError::Open { uri, kept, cause })
                }
            };
        }
    }

    /// Fold one frame of detections into the current epoch.
    pub fn process_frame(&self, detections: &[Detection]) -> FrameTally {
        self.lock().counting.process_frame(detections)
    }

    pub fn is_reset_pending(&self) -> bool {
        self.lock().source.reset_pending
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let state = self.lock();
        EngineSnapshot {
            bound_source: state.source.bound.clone(),
            requested_source: state.source.requested.clone(),
            reset_pending: state.source.reset_pending,
            generation: state.source.generation,
            epoch: state.counting.epoch(),
            line_y: state.counting.line_y(),
            counts: state.counting.counters().snapshot(),
            status: state.counting.status(),
            tracked: state.counting.history().len(),
            counted: state.counting.counters().counted_len(),
            last_failure: state.source.last_failure.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, thread};

    use super::*;
    use crate::pipeline::test_support::{StubOpener, det};

    fn counted_coordinator() -> ResetCoordinator {
        let coordinator = ResetCoordinator::new("a.mp4", 150);
        coordinator.process_frame(&[det(7, 2, 50.0, 95.0)]);
        coordinator.process_frame(&[det(7, 2, 50.0, 105.0), det(8, 7, 10.0, 20.0)]);
        coordinator
    }

    #[test]
    fn no_pending_request_is_a_no_op() {
        let coordinator = counted_coordinator();
        let opener = StubOpener::new();

        assert!(coordinator.consume_reset_if_pending(&opener).unwrap().is_none());
        assert!(opener.opened().is_empty());
        assert_eq!(coordinator.snapshot().counts[&TrafficClass::Car], 1);
    }

    #[test]
    fn applied_switch_resets_whole_epoch() {
        let coordinator = counted_coordinator();
        let opener = StubOpener::new().with_height("b.jsonl", 720);

        let ticket = coordinator.request_switch("b.jsonl");
        assert!(coordinator.is_reset_pending());

        let applied = coordinator.consume_reset_if_pending(&opener).unwrap().unwrap();
        assert_eq!(applied.uri, "b.jsonl");
        assert_eq!(applied.source.uri(), "b.jsonl");
        assert_eq!(applied.generation, ticket.generation);
        assert_eq!(applied.line_y, 480);

        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.bound_source, "b.jsonl");
        assert!(!snapshot.reset_pending);
        assert_eq!(snapshot.epoch, 1);
        assert_eq!(snapshot.line_y, 480);
        assert!(snapshot.counts.values().all(|&count| count == 0));
        assert_eq!(snapshot.counted, 0);
        assert_eq!(snapshot.tracked, 0);
        assert_eq!(snapshot.status.density, 0);
    }

    #[test]
    fn back_to_back_requests_collapse_into_last() {
        let coordinator = counted_coordinator();
        let opener = StubOpener::new();

        coordinator.request_switch("a2.jsonl");
        let last = coordinator.request_switch("b2.jsonl");

        let applied = coordinator.consume_reset_if_pending(&opener).unwrap().unwrap();
        assert_eq!(applied.uri, "b2.jsonl");
        assert_eq!(applied.generation, last.generation);
        assert!(coordinator.consume_reset_if_pending(&opener).unwrap().is_none());

        assert_eq!(opener.opened(), vec!["b2.jsonl".to_string()]);
        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.bound_source, "b2.jsonl");
        assert_eq!(snapshot.epoch, 1);
    }

    #[test]
    fn failed_open_keeps_previous_source_and_counts() {
        let coordinator = counted_coordinator();
        let opener = StubOpener::new().failing("missing.mp4");

        let ticket = coordinator.request_switch("missing.mp4");
        let err = coordinator.consume_reset_if_pending(&opener).err().unwrap();
        assert!(matches!(err, SwitchError::Open { ref kept, .. } if kept == "a.mp4"));

        let snapshot = coordinator.snapshot();
        assert!(!snapshot.reset_pending);
        assert_eq!(snapshot.bound_source, "a.mp4");
        assert_eq!(snapshot.requested_source, "a.mp4");
        assert_eq!(snapshot.epoch, 0);
        assert_eq!(snapshot.counts[&TrafficClass::Car], 1);
        let failure = snapshot.last_failure.unwrap();
        assert_eq!(failure.generation, ticket.generation);
        assert_eq!(failure.uri, "missing.mp4");

        assert!(coordinator.consume_reset_if_pending(&opener).unwrap().is_none());
    }

    #[test]
    fn request_during_open_wins() {
        let coordinator = counted_coordinator();
        let racer = coordinator.clone();
        let raced = Mutex::new(false);
        let opener = StubOpener::new().on_open(move |uri| {
            let mut raced = raced.lock().unwrap();
            if uri == "slow.jsonl" && !*raced {
                *raced = true;
                racer.request_switch("fresh.jsonl");
            }
        });

        coordinator.request_switch("slow.jsonl");
        let applied = coordinator.consume_reset_if_pending(&opener).unwrap().unwrap();
        assert_eq!(applied.uri, "fresh.jsonl");
        assert_eq!(applied.generation, 2);
        assert_eq!(
            opener.opened(),
            vec!["slow.jsonl".to_string(), "fresh.jsonl".to_string()]
        );

        let snapshot = coordinator.snapshot();
        assert!(!snapshot.reset_pending);
        assert_eq!(snapshot.bound_source, "fresh.jsonl");
        assert_eq!(snapshot.epoch, 1);
        assert_eq!(snapshot.counts[&TrafficClass::Car], 0);
    }

    #[test]
    fn failed_binding_commits_nothing() {
        let coordinator = counted_coordinator();
        let opener = StubOpener::new();

        let ticket = coordinator.request_switch("bad.jsonl");
        let err = coordinator
            .consume_reset_with(|uri| {
                let source = opener.open(uri)?;
                Err::<(Box<dyn FrameSource>, ()), _>(
                    TrackerError::Load {
                        uri: source.uri().to_string(),
                        reason: "line 2: invalid type".into(),
                    }
                    .into(),
                )
            })
            .err()
            .unwrap();
        assert!(matches!(
            err,
            SwitchError::Open { cause: BindError::Tracker(_), ref kept, .. } if kept == "a.mp4"
        ));

        let snapshot = coordinator.snapshot();
        assert!(!snapshot.reset_pending);
        assert_eq!(snapshot.bound_source, "a.mp4");
        assert_eq!(snapshot.epoch, 0);
        assert_eq!(snapshot.counts[&TrafficClass::Car], 1);
        assert_eq!(snapshot.last_failure.unwrap().generation, ticket.generation);
    }

    #[test]
    fn concurrent_requests_never_block_or_tear_state() {
        let coordinator = ResetCoordinator::new("a.mp4", 300);
        let opener = StubOpener::new();

        let requesters: Vec<_> = (0..4)
            .map(|worker| {
                let coordinator = coordinator.clone();
                thread::spawn(move || {
                    for round in 0..50 {
                        coordinator.request_switch(format!("w{worker}-{round}.jsonl"));
                    }
                })
            })
            .collect();

        for round in 0..200 {
            coordinator.consume_reset_if_pending(&opener).unwrap();
            let track = round as i64;
            coordinator.process_frame(&[det(track, 2, 10.0, 150.0)]);
            let tally = coordinator.process_frame(&[det(track, 2, 10.0, 250.0)]);
            assert_eq!(tally.counts.values().sum::<u64>(), tally.status.density);
            assert!(tally.boxes.len() <= 1);
        }
        for handle in requesters {
            handle.join().unwrap();
        }

        coordinator.consume_reset_if_pending(&opener).unwrap();
        let snapshot = coordinator.snapshot();
        assert!(!snapshot.reset_pending);
        assert_eq!(snapshot.generation, 200);
        assert_eq!(snapshot.bound_source, snapshot.requested_source);
    }
}
