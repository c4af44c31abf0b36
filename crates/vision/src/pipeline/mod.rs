//! Traffic counting service: one processing loop feeding a publisher and an
//! HTTP server.
//!
//! The module is split into focused submodules:
//! - `config`: CLI configuration parsing.
//! - `coordinator`: Shared engine state and the source switch protocol.
//! - `processing`: The single processing loop and its start gate.
//! - `encoding`: Overlay drawing and JPEG hand-off to the server.
//! - `server`: Actix Web endpoints.
//! - `service`: Wires the stages together.
//! - `watchdog`: Stall and halt reporting.
//! - `data`: Records shared between stages.
//! - `annotation`: Drawing primitives for the preview frame.

pub use config::{
    DEFAULT_ALLOWED_ORIGINS, DEFAULT_SOURCE, ServerOptions, TelemetryOptions, VisionCliArgs,
    VisionConfig,
};
pub use coordinator::{
    AppliedSwitch, BindError, EngineSnapshot, ResetCoordinator, SwitchError, SwitchFailure,
    SwitchTicket,
};
pub use data::FrameReport;
pub use processing::{ProcessingLoop, StepOutcome, WorkerGate};
/// Launch the service, or replay a clip headless.
pub use service::{run, run_headless};

mod annotation;
mod config;
mod coordinator;
mod data;
mod encoding;
mod processing;
mod server;
mod service;
mod telemetry;
#[cfg(test)]
mod test_support;
mod watchdog;
