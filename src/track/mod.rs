//! Identity tracking capability.
//!
//! One `IdentityTracker` per source. It turns per-frame detections into
//! persistent identities; the orchestrator only consumes confirmed tracks.

pub mod appearance;
mod iou_tracker;

use serde::Serialize;
use thiserror::Error;

use crate::frame::Frame;
use crate::geometry::BoundingBox;

pub use iou_tracker::IouTracker;

#[derive(Debug, Error)]
pub enum TrackError {
    #[error("tracker input rejected: {0}")]
    Input(String),
    #[error("tracker failure: {0}")]
    Internal(String),
}

/// One detection handed to a tracker.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackerInput {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub class_name: String,
}

/// A track reported for the current frame.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrackUpdate {
    pub identity: u64,
    /// Tracker-refined box.
    pub bbox: BoundingBox,
    /// Only confirmed tracks carry a usable identity.
    pub confirmed: bool,
}

pub trait IdentityTracker: Send {
    /// Feed one frame's detections and return the tracks updated by them.
    ///
    /// Identities are unique among live tracks of this instance.
    fn update(
        &mut self,
        inputs: &[TrackerInput],
        frame: &Frame,
    ) -> Result<Vec<TrackUpdate>, TrackError>;

    /// Drop all track state.
    fn reset(&mut self);
}
