//! Per-cycle detection, identity assignment and fusion.
//!
//! For each source with a frame this cycle:
//! 1. detect, then drop labels outside the allow-list and boxes outside the
//!    configured pixel-area range
//! 2. feed the survivors to that source's `IdentityTracker`
//! 3. attach each confirmed track to the detection it overlaps most
//!
//! Both lists then go through the `PositionEstimator`. A failing detector or
//! tracker only empties its own source's list and is reported in
//! `CycleOutput::failures`.

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::SystemTime;
use thiserror::Error;

use crate::config::{DetectorSettings, GeometrySettings, IdentitySettings, PipelineConfig};
use crate::detect::{self, Detection, DetectError, DetectorBackend};
use crate::frame::Frame;
use crate::geometry::{BoundingBox, Position3D};
use crate::position::{FrameDims, PositionEstimator};
use crate::track::{IdentityTracker, IouTracker, TrackerInput};
use crate::SourceId;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("detector setup failed: {0}")]
    Detector(#[from] DetectError),
}

/// One detection that a confirmed track claimed this cycle.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrackedObject {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub class_id: u32,
    pub class_name: String,
    pub source: SourceId,
    pub identity: Option<u64>,
    pub position: Option<Position3D>,
    pub created_at: SystemTime,
}

impl TrackedObject {
    pub fn new(
        bbox: BoundingBox,
        confidence: f32,
        class_id: u32,
        class_name: &str,
        source: SourceId,
    ) -> Self {
        Self {
            bbox,
            confidence,
            class_id,
            class_name: class_name.to_string(),
            source,
            identity: None,
            position: None,
            created_at: SystemTime::now(),
        }
    }

    fn from_detection(detection: Detection, source: SourceId) -> Self {
        Self {
            class_name: detection.class_name,
            ..Self::new(
                detection.bbox,
                detection.confidence,
                detection.class_id,
                "",
                source,
            )
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    Detect,
    Track,
}

/// A capability failure confined to one source for one cycle.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SourceFailure {
    pub source: SourceId,
    pub stage: FailureStage,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CycleOutput {
    pub cycle: u64,
    pub source1: Vec<TrackedObject>,
    pub source2: Vec<TrackedObject>,
    pub failures: Vec<SourceFailure>,
}

impl CycleOutput {
    pub fn objects(&self, source: SourceId) -> &[TrackedObject] {
        match source {
            SourceId::Source1 => &self.source1,
            SourceId::Source2 => &self.source2,
        }
    }
}

/// One entry of an identity's trail.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrackSample {
    pub cycle: u64,
    pub bbox: BoundingBox,
    pub position: Option<Position3D>,
    pub at: SystemTime,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TrackTrail {
    pub samples: VecDeque<TrackSample>,
    pub last_seen_cycle: u64,
}

struct SourceLane {
    id: SourceId,
    tracker: Box<dyn IdentityTracker>,
    history: BTreeMap<u64, TrackTrail>,
}

pub struct TrackingOrchestrator {
    detector: Box<dyn DetectorBackend>,
    lanes: [SourceLane; 2],
    estimator: PositionEstimator,
    detector_settings: DetectorSettings,
    identity_settings: IdentitySettings,
    cycle: u64,
}

impl TrackingOrchestrator {
    pub fn new(
        detector: Box<dyn DetectorBackend>,
        tracker1: Box<dyn IdentityTracker>,
        tracker2: Box<dyn IdentityTracker>,
        detector_settings: DetectorSettings,
        identity_settings: IdentitySettings,
        geometry_settings: GeometrySettings,
    ) -> Self {
        Self {
            detector,
            lanes: [
                SourceLane {
                    id: SourceId::Source1,
                    tracker: tracker1,
                    history: BTreeMap::new(),
                },
                SourceLane {
                    id: SourceId::Source2,
                    tracker: tracker2,
                    history: BTreeMap::new(),
                },
            ],
            estimator: PositionEstimator::new(geometry_settings),
            detector_settings,
            identity_settings,
            cycle: 0,
        }
    }

    /// Orchestrator with the configured detector and one `IouTracker` per
    /// source.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let detector = detect::backend_from_settings(&config.detector)?;
        Ok(Self::new(
            detector,
            Box::new(IouTracker::new(config.identity.clone())),
            Box::new(IouTracker::new(config.identity.clone())),
            config.detector.clone(),
            config.identity.clone(),
            config.geometry.clone(),
        ))
    }

    pub fn cycles(&self) -> u64 {
        self.cycle
    }

    /// Trail of one identity within one source.
    pub fn track_history(&self, source: SourceId, identity: u64) -> Option<&TrackTrail> {
        self.lane(source).history.get(&identity)
    }

    /// Identities with a live trail in one source.
    pub fn tracked_identities(&self, source: SourceId) -> Vec<u64> {
        self.lane(source).history.keys().copied().collect()
    }

    fn lane(&self, source: SourceId) -> &SourceLane {
        match source {
            SourceId::Source1 => &self.lanes[0],
            SourceId::Source2 => &self.lanes[1],
        }
    }

    /// Forget every track and trail of one source, e.g. after its origin was
    /// reconnected. Identities keep counting up.
    pub fn reset_source(&mut self, source: SourceId) {
        let lane = match source {
            SourceId::Source1 => &mut self.lanes[0],
            SourceId::Source2 => &mut self.lanes[1],
        };
        lane.tracker.reset();
        lane.history.clear();
        log::info!("Orchestrator[{}]: tracks reset", source);
    }

    pub fn process_cycle(&mut self, frame1: Option<&Frame>, frame2: Option<&Frame>) -> CycleOutput {
        self.cycle += 1;
        let mut output = CycleOutput {
            cycle: self.cycle,
            ..CycleOutput::default()
        };

        for (index, frame) in [frame1, frame2].into_iter().enumerate() {
            let Some(frame) = frame else {
                continue;
            };
            let objects = self.process_source(index, frame, &mut output.failures);
            match self.lanes[index].id {
                SourceId::Source1 => output.source1 = objects,
                SourceId::Source2 => output.source2 = objects,
            }
        }

        let dims = |frame: Option<&Frame>| frame.map(|f| FrameDims::new(f.width(), f.height()));
        self.estimator.estimate(
            &mut output.source1,
            dims(frame1),
            &mut output.source2,
            dims(frame2),
        );

        self.record_history(&output);
        output
    }

    fn process_source(
        &mut self,
        lane_index: usize,
        frame: &Frame,
        failures: &mut Vec<SourceFailure>,
    ) -> Vec<TrackedObject> {
        let settings = &self.detector_settings;
        let source = self.lanes[lane_index].id;

        let detections = match self.detector.detect(
            frame,
            settings.confidence_threshold,
            settings.overlap_threshold,
        ) {
            Ok(detections) => detections,
            Err(err) => {
                log::warn!("Orchestrator[{}]: detection failed: {}", source, err);
                failures.push(SourceFailure {
                    source,
                    stage: FailureStage::Detect,
                    message: err.to_string(),
                });
                return Vec::new();
            }
        };

        let candidates: Vec<TrackedObject> = detections
            .into_iter()
            .filter(|d| settings.classes.iter().any(|c| *c == d.class_name))
            .filter(|d| {
                let area = d.bbox.area();
                area >= settings.min_area && area <= settings.max_area
            })
            .map(|d| TrackedObject::from_detection(d, source))
            .collect();

        let inputs: Vec<TrackerInput> = candidates
            .iter()
            .map(|c| TrackerInput {
                bbox: c.bbox,
                confidence: c.confidence,
                class_name: c.class_name.clone(),
            })
            .collect();

        let updates = match self.lanes[lane_index].tracker.update(&inputs, frame) {
            Ok(updates) => updates,
            Err(err) => {
                log::warn!("Orchestrator[{}]: tracker update failed: {}", source, err);
                failures.push(SourceFailure {
                    source,
                    stage: FailureStage::Track,
                    message: err.to_string(),
                });
                return Vec::new();
            }
        };

        // Attach each confirmed track to its best-overlapping detection.
        // Strictly greater IoU wins, so ties keep the earlier detection.
        let mut claimed = vec![false; candidates.len()];
        let mut objects = Vec::new();
        for update in updates.iter().filter(|u| u.confirmed) {
            let mut best: Option<usize> = None;
            let mut best_iou = 0.0;
            for (index, candidate) in candidates.iter().enumerate() {
                if claimed[index] {
                    continue;
                }
                let iou = update.bbox.iou(&candidate.bbox);
                if iou > best_iou {
                    best_iou = iou;
                    best = Some(index);
                }
            }
            if let Some(index) = best {
                claimed[index] = true;
                let mut object = candidates[index].clone();
                object.identity = Some(update.identity);
                object.bbox = update.bbox;
                objects.push(object);
            }
        }
        objects
    }

    fn record_history(&mut self, output: &CycleOutput) {
        let cycle = self.cycle;
        let capacity = self.identity_settings.history_length.max(1);
        let max_age = self.identity_settings.max_age as u64;

        for lane in self.lanes.iter_mut() {
            for object in output.objects(lane.id) {
                let Some(identity) = object.identity else {
                    continue;
                };
                let trail = lane.history.entry(identity).or_default();
                trail.last_seen_cycle = cycle;
                trail.samples.push_back(TrackSample {
                    cycle,
                    bbox: object.bbox,
                    position: object.position,
                    at: object.created_at,
                });
                while trail.samples.len() > capacity {
                    trail.samples.pop_front();
                }
            }
            lane.history
                .retain(|_, trail| cycle - trail.last_seen_cycle <= max_age);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::StubBackend;
    use crate::track::{TrackError, TrackUpdate};
    use image::RgbImage;

    fn frame() -> Frame {
        Frame::new(RgbImage::new(640, 480), 1)
    }

    fn car(x: f32, y: f32, w: f32, h: f32) -> Detection {
        Detection::coco(BoundingBox::new(x, y, w, h), 0.9, "car")
    }

    /// Tracker that confirms every input immediately with fixed ids.
    struct EchoTracker {
        base: u64,
    }

    impl IdentityTracker for EchoTracker {
        fn update(
            &mut self,
            inputs: &[TrackerInput],
            _frame: &Frame,
        ) -> Result<Vec<TrackUpdate>, TrackError> {
            Ok(inputs
                .iter()
                .enumerate()
                .map(|(i, input)| TrackUpdate {
                    identity: self.base + i as u64,
                    bbox: input.bbox,
                    confirmed: true,
                })
                .collect())
        }

        fn reset(&mut self) {}
    }

    struct FailingTracker;

    impl IdentityTracker for FailingTracker {
        fn update(&mut self, _: &[TrackerInput], _: &Frame) -> Result<Vec<TrackUpdate>, TrackError> {
            Err(TrackError::Internal("state corrupted".into()))
        }

        fn reset(&mut self) {}
    }

    fn orchestrator(
        detector: StubBackend,
        tracker1: Box<dyn IdentityTracker>,
        tracker2: Box<dyn IdentityTracker>,
    ) -> TrackingOrchestrator {
        TrackingOrchestrator::new(
            Box::new(detector),
            tracker1,
            tracker2,
            DetectorSettings::default(),
            IdentitySettings::default(),
            GeometrySettings::default(),
        )
    }

    #[test]
    fn absent_frames_yield_empty_lists() {
        let mut orch = orchestrator(
            StubBackend::repeating(vec![car(10.0, 10.0, 50.0, 50.0)]),
            Box::new(EchoTracker { base: 1 }),
            Box::new(EchoTracker { base: 100 }),
        );
        let out = orch.process_cycle(None, None);
        assert!(out.source1.is_empty() && out.source2.is_empty());
        assert!(out.failures.is_empty());
    }

    #[test]
    fn filters_class_and_area() {
        let detections = vec![
            car(10.0, 10.0, 50.0, 50.0),
            Detection::coco(BoundingBox::new(100.0, 10.0, 50.0, 50.0), 0.9, "person"),
            car(200.0, 10.0, 10.0, 10.0),
            car(0.0, 0.0, 600.0, 400.0),
        ];
        let mut orch = orchestrator(
            StubBackend::repeating(detections),
            Box::new(EchoTracker { base: 1 }),
            Box::new(EchoTracker { base: 100 }),
        );
        let out = orch.process_cycle(Some(&frame()), None);
        assert_eq!(out.source1.len(), 1);
        assert_eq!(out.source1[0].bbox, BoundingBox::new(10.0, 10.0, 50.0, 50.0));
        assert_eq!(out.source1[0].identity, Some(1));
        assert!(out.source1[0].position.is_some());
    }

    #[test]
    fn unconfirmed_tracks_are_withheld() {
        let mut orch = orchestrator(
            StubBackend::repeating(vec![car(10.0, 10.0, 50.0, 50.0)]),
            Box::new(IouTracker::new(IdentitySettings::default())),
            Box::new(IouTracker::new(IdentitySettings::default())),
        );
        let f = frame();
        assert!(orch.process_cycle(Some(&f), None).source1.is_empty());
        assert!(orch.process_cycle(Some(&f), None).source1.is_empty());
        let third = orch.process_cycle(Some(&f), None);
        assert_eq!(third.source1.len(), 1);
        assert!(third.source1[0].identity.is_some());
    }

    #[test]
    fn tracker_failure_is_confined_to_its_source() {
        let mut orch = orchestrator(
            StubBackend::repeating(vec![car(10.0, 10.0, 50.0, 50.0)]),
            Box::new(FailingTracker),
            Box::new(EchoTracker { base: 100 }),
        );
        let f = frame();
        let out = orch.process_cycle(Some(&f), Some(&f));
        assert!(out.source1.is_empty());
        assert_eq!(out.source2.len(), 1);
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.failures[0].source, SourceId::Source1);
        assert_eq!(out.failures[0].stage, FailureStage::Track);
    }

    #[test]
    fn detector_failure_is_reported() {
        let detector = StubBackend::repeating(vec![car(10.0, 10.0, 50.0, 50.0)]).then_fail("oom");
        let mut orch = orchestrator(
            detector,
            Box::new(EchoTracker { base: 1 }),
            Box::new(EchoTracker { base: 100 }),
        );
        let f = frame();
        let out = orch.process_cycle(Some(&f), Some(&f));
        assert!(out.source1.is_empty());
        assert_eq!(out.source2.len(), 1);
        assert_eq!(out.failures[0].stage, FailureStage::Detect);
    }

    #[test]
    fn each_detection_is_claimed_once() {
        /// Two confirmed tracks sitting on the same detection.
        struct DoubleTracker;
        impl IdentityTracker for DoubleTracker {
            fn update(
                &mut self,
                inputs: &[TrackerInput],
                _frame: &Frame,
            ) -> Result<Vec<TrackUpdate>, TrackError> {
                let bbox = inputs[0].bbox;
                Ok(vec![
                    TrackUpdate { identity: 7, bbox, confirmed: true },
                    TrackUpdate { identity: 8, bbox, confirmed: true },
                ])
            }
            fn reset(&mut self) {}
        }

        let mut orch = orchestrator(
            StubBackend::repeating(vec![car(10.0, 10.0, 50.0, 50.0)]),
            Box::new(DoubleTracker),
            Box::new(EchoTracker { base: 100 }),
        );
        let out = orch.process_cycle(Some(&frame()), None);
        assert_eq!(out.source1.len(), 1);
        assert_eq!(out.source1[0].identity, Some(7));
    }

    #[test]
    fn reset_source_requires_fresh_confirmation() {
        let mut orch = orchestrator(
            StubBackend::repeating(vec![car(10.0, 10.0, 50.0, 50.0)]),
            Box::new(IouTracker::new(IdentitySettings::default())),
            Box::new(IouTracker::new(IdentitySettings::default())),
        );
        let f = frame();
        let mut confirmed = Vec::new();
        for _ in 0..3 {
            confirmed = orch.process_cycle(Some(&f), Some(&f)).source1;
        }
        let before = confirmed[0].identity.unwrap();
        assert!(orch.track_history(SourceId::Source1, before).is_some());

        orch.reset_source(SourceId::Source1);
        assert!(orch.tracked_identities(SourceId::Source1).is_empty());
        assert!(!orch.tracked_identities(SourceId::Source2).is_empty());

        let out = orch.process_cycle(Some(&f), Some(&f));
        assert!(out.source1.is_empty());
        assert_eq!(out.source2.len(), 1);

        orch.process_cycle(Some(&f), Some(&f));
        let after = orch.process_cycle(Some(&f), Some(&f)).source1;
        assert_ne!(after[0].identity.unwrap(), before);
    }

    #[test]
    fn history_is_bounded_and_pruned() {
        let identity = IdentitySettings {
            history_length: 3,
            max_age: 2,
            ..IdentitySettings::default()
        };
        let mut orch = TrackingOrchestrator::new(
            Box::new(
                StubBackend::new()
                    .then(vec![car(10.0, 10.0, 50.0, 50.0)])
                    .then(vec![car(10.0, 10.0, 50.0, 50.0)])
                    .then(vec![car(10.0, 10.0, 50.0, 50.0)])
                    .then(vec![car(10.0, 10.0, 50.0, 50.0)])
                    .then(vec![car(10.0, 10.0, 50.0, 50.0)]),
            ),
            Box::new(EchoTracker { base: 1 }),
            Box::new(EchoTracker { base: 100 }),
            DetectorSettings::default(),
            identity,
            GeometrySettings::default(),
        );
        let f = frame();
        for _ in 0..5 {
            orch.process_cycle(Some(&f), None);
        }
        assert_eq!(orch.track_history(SourceId::Source1, 1).unwrap().samples.len(), 3);

        for _ in 0..3 {
            orch.process_cycle(Some(&f), None);
        }
        assert!(orch.track_history(SourceId::Source1, 1).is_none());
        assert!(orch.tracked_identities(SourceId::Source1).is_empty());
    }
}
