//! Dual-source tracking kernel.
//!
//! This crate acquires frames from two independent visual sources, detects
//! objects in each, keeps a persistent identity per object within each source
//! and fuses both views into a coarse 3D position per object.
//!
//! # Architecture
//!
//! ```text
//! SourceRegistry ─┬─ FrameSource(source1) ─┐
//!                 └─ FrameSource(source2) ─┤ FramePair
//!                                          ▼
//!                               TrackingOrchestrator
//!                  DetectorBackend → IdentityTracker (per source)
//!                                          ▼
//!                                  PositionEstimator
//!                                          ▼
//!                                     CycleOutput
//! ```
//!
//! Sources are unreliable by assumption. Every source runs its own
//! acquisition thread, retries transient read failures, degrades from a
//! stream to snapshot polling when the stream framing breaks, and reports
//! terminal failure through `SourceInfo` instead of panicking.
//!
//! # Module Structure
//!
//! - `source`: one frame source and its connection/retry state machine
//! - `registry`: the two named source slots
//! - `orchestrator`: detection, identity assignment and fusion per cycle
//! - `position`: triangulation and monocular depth heuristics
//! - `detect` / `track`: detector and identity-tracker capabilities
//! - `ingest`: capture transports (HTTP, V4L2, synthetic)
//! - `frame`, `geometry`, `config`: shared types

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod config;
pub mod detect;
pub mod frame;
pub mod geometry;
pub mod ingest;
pub mod orchestrator;
pub mod position;
pub mod registry;
pub mod source;
pub mod track;

pub use config::{
    CaptureSettings, DetectorSettings, GeometrySettings, IdentitySettings, PipelineConfig,
    SourceConfig, SourceKind, SourcesConfig,
};
pub use detect::{Detection, DetectError, DetectorBackend};
pub use frame::{Frame, FrameSlot};
pub use geometry::{BoundingBox, Position3D};
pub use ingest::{Capture, CaptureBackend, CaptureError, ConnectStrategy, SystemBackend};
pub use orchestrator::{
    CycleOutput, FailureStage, PipelineError, SourceFailure, TrackedObject, TrackingOrchestrator,
};
pub use position::{FrameDims, PositionEstimator};
pub use registry::{FramePair, RegistryError, RegistrySummary, SourceRegistry};
pub use source::{FrameSource, SourceError, SourceInfo, SourceState};
pub use track::{IdentityTracker, IouTracker, TrackError, TrackUpdate, TrackerInput};

/// One of the two fixed source slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceId {
    Source1,
    Source2,
}

impl SourceId {
    pub const ALL: [SourceId; 2] = [SourceId::Source1, SourceId::Source2];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::Source1 => "source1",
            SourceId::Source2 => "source2",
        }
    }

    pub fn default_display_name(&self) -> &'static str {
        match self {
            SourceId::Source1 => "Camera 1",
            SourceId::Source2 => "Camera 2",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "source1" => Some(SourceId::Source1),
            "source2" => Some(SourceId::Source2),
            _ => None,
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
