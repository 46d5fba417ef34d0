//! Greedy IoU tracker with appearance gating.
//!
//! - Tracks start tentative and are confirmed after `min_confirmations`
//!   consecutive matches
//! - A tentative track that misses a frame is dropped
//! - A confirmed track coasts on its last velocity for up to `max_age` misses
//! - Identities come from a monotonically increasing counter and are never
//!   reused

use crate::config::IdentitySettings;
use crate::frame::Frame;
use crate::geometry::BoundingBox;
use crate::track::appearance::{blend, color_histogram, cosine_distance};
use crate::track::{IdentityTracker, TrackError, TrackUpdate, TrackerInput};

const VELOCITY_SMOOTHING: f32 = 0.5;
const APPEARANCE_WEIGHT: f32 = 0.3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TrackState {
    Tentative,
    Confirmed,
}

#[derive(Debug)]
struct Track {
    id: u64,
    bbox: BoundingBox,
    class_name: String,
    state: TrackState,
    hits: u32,
    misses: u32,
    velocity: (f32, f32),
    appearance: Option<Vec<f32>>,
}

impl Track {
    fn predicted(&self) -> BoundingBox {
        self.bbox.translated(self.velocity.0, self.velocity.1)
    }

    fn absorb(&mut self, input: &TrackerInput, appearance: Option<Vec<f32>>, min_hits: u32) {
        let (old_x, old_y) = self.bbox.center();
        let (new_x, new_y) = input.bbox.center();
        self.velocity = (
            self.velocity.0 * (1.0 - VELOCITY_SMOOTHING) + (new_x - old_x) * VELOCITY_SMOOTHING,
            self.velocity.1 * (1.0 - VELOCITY_SMOOTHING) + (new_y - old_y) * VELOCITY_SMOOTHING,
        );
        self.bbox = input.bbox;
        self.hits += 1;
        self.misses = 0;
        if let Some(current) = appearance {
            match self.appearance.as_mut() {
                Some(previous) => blend(previous, &current, APPEARANCE_WEIGHT),
                None => self.appearance = Some(current),
            }
        }
        if self.state == TrackState::Tentative && self.hits >= min_hits {
            self.state = TrackState::Confirmed;
        }
    }

    fn update(&self) -> TrackUpdate {
        TrackUpdate {
            identity: self.id,
            bbox: self.bbox,
            confirmed: self.state == TrackState::Confirmed,
        }
    }
}

/// Reference `IdentityTracker`.
#[derive(Debug)]
pub struct IouTracker {
    settings: IdentitySettings,
    tracks: Vec<Track>,
    next_id: u64,
}

impl IouTracker {
    pub fn new(settings: IdentitySettings) -> Self {
        Self {
            settings,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    /// Number of live (tentative or confirmed) tracks.
    pub fn live_tracks(&self) -> usize {
        self.tracks.len()
    }

    fn appearance_compatible(&self, track: &Track, descriptor: Option<&Vec<f32>>) -> bool {
        match (&track.appearance, descriptor) {
            (Some(known), Some(seen)) => {
                cosine_distance(known, seen) <= self.settings.max_appearance_distance
            }
            _ => true,
        }
    }
}

impl IdentityTracker for IouTracker {
    fn update(
        &mut self,
        inputs: &[TrackerInput],
        frame: &Frame,
    ) -> Result<Vec<TrackUpdate>, TrackError> {
        if let Some(bad) = inputs.iter().find(|input| {
            let b = &input.bbox;
            !(b.x.is_finite() && b.y.is_finite() && b.width.is_finite() && b.height.is_finite())
        }) {
            return Err(TrackError::Input(format!("non-finite box {:?}", bad.bbox)));
        }

        let descriptors: Vec<Option<Vec<f32>>> = inputs
            .iter()
            .map(|input| color_histogram(frame, &input.bbox))
            .collect();

        // Candidate pairs, best IoU first.
        let mut pairs: Vec<(usize, usize, f32)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            let predicted = track.predicted();
            for (di, input) in inputs.iter().enumerate() {
                if input.class_name != track.class_name {
                    continue;
                }
                let score = predicted.iou(&input.bbox).max(track.bbox.iou(&input.bbox));
                if score < self.settings.min_iou || score <= 0.0 {
                    continue;
                }
                if !self.appearance_compatible(track, descriptors[di].as_ref()) {
                    continue;
                }
                pairs.push((ti, di, score));
            }
        }
        pairs.sort_by(|a, b| b.2.total_cmp(&a.2));

        let mut track_matched = vec![false; self.tracks.len()];
        let mut input_matched = vec![false; inputs.len()];
        let min_hits = self.settings.min_confirmations;
        for (ti, di, _) in pairs {
            if track_matched[ti] || input_matched[di] {
                continue;
            }
            track_matched[ti] = true;
            input_matched[di] = true;
            self.tracks[ti].absorb(&inputs[di], descriptors[di].clone(), min_hits);
        }

        let mut updated: Vec<u64> = Vec::new();
        for (track, matched) in self.tracks.iter_mut().zip(&track_matched) {
            if *matched {
                updated.push(track.id);
            } else {
                track.misses += 1;
                track.bbox = track.predicted();
            }
        }

        let max_age = self.settings.max_age;
        self.tracks.retain(|t| match t.state {
            TrackState::Tentative => t.misses == 0,
            TrackState::Confirmed => t.misses <= max_age,
        });

        for (di, input) in inputs.iter().enumerate() {
            if input_matched[di] {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            let state = if min_hits <= 1 {
                TrackState::Confirmed
            } else {
                TrackState::Tentative
            };
            log::debug!(
                "IouTracker: new track {} ({}) at {:?}",
                id,
                input.class_name,
                input.bbox
            );
            self.tracks.push(Track {
                id,
                bbox: input.bbox,
                class_name: input.class_name.clone(),
                state,
                hits: 1,
                misses: 0,
                velocity: (0.0, 0.0),
                appearance: descriptors[di].clone(),
            });
            updated.push(id);
        }

        Ok(self
            .tracks
            .iter()
            .filter(|t| updated.contains(&t.id))
            .map(Track::update)
            .collect())
    }

    fn reset(&mut self) {
        self.tracks.clear();
    }
}
