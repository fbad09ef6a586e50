//! Background position sampling and the daemon that hosts it.

pub mod control;
pub mod position;
pub mod tracking;

pub use control::{probe, send_request, ControlConfig, ControlContext, ControlError};
pub use position::{
    parse_batch, parse_track, ChannelSource, LocationRequest, PositionBatch, PositionSource,
    ReplaySource, SourceError, Subscription,
};
pub use tracking::{send_report, StopReason, Tracker, TrackerError, TrackerHandle};

/// Name of the daemon binary, as spawned by the control surface.
pub const TRACKER_BIN: &str = "stalk-tracker";
