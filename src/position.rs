//! 3D position estimation from one or two sources.
//!
//! Neither method uses calibration data. Triangulation assumes two parallel,
//! horizontally offset sources with identical optics; the monocular fallback
//! maps apparent size to depth linearly. Treat both as coarse approximations.

use crate::config::GeometrySettings;
use crate::geometry::{BoundingBox, Position3D};
use crate::orchestrator::TrackedObject;
use crate::SourceId;

/// Box area (as a fraction of the frame area) at which the monocular heuristic
/// reaches its nearest depth.
const NEAR_AREA_FRACTION: f32 = 0.1;
const MIN_SIZE_FACTOR: f32 = 0.1;
const MAX_SIZE_FACTOR: f32 = 1.0;

/// Pixel dimensions of the frame an object list was detected in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameDims {
    pub width: u32,
    pub height: u32,
}

impl FrameDims {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Map a pixel coordinate to [-1, 1] relative to the frame center.
    fn normalize(&self, x: f32, y: f32) -> (f32, f32) {
        let half_w = (self.width as f32 / 2.0).max(f32::EPSILON);
        let half_h = (self.height as f32 / 2.0).max(f32::EPSILON);
        ((x - half_w) / half_w, (y - half_h) / half_h)
    }

    fn area(&self) -> f32 {
        self.width as f32 * self.height as f32
    }
}

#[derive(Clone, Debug)]
pub struct PositionEstimator {
    settings: GeometrySettings,
}

impl PositionEstimator {
    pub fn new(settings: GeometrySettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &GeometrySettings {
        &self.settings
    }

    /// Assign positions to both object lists in place.
    ///
    /// Positions are recomputed from scratch on every call; any value present
    /// on entry is discarded.
    pub fn estimate(
        &self,
        source1: &mut [TrackedObject],
        dims1: Option<FrameDims>,
        source2: &mut [TrackedObject],
        dims2: Option<FrameDims>,
    ) {
        for object in source1.iter_mut().chain(source2.iter_mut()) {
            object.position = None;
        }

        if let (Some(d1), Some(d2)) = (dims1, dims2) {
            for object in source1.iter_mut() {
                let Some(index) = self.best_match(object, d1, source2) else {
                    continue;
                };
                let partner = &mut source2[index];
                if let Some(position) = self.triangulate(&object.bbox, d1, &partner.bbox, d2) {
                    object.position = Some(position);
                    if partner.position.is_none() {
                        partner.position = Some(position);
                    }
                }
            }
        }

        if let Some(d1) = dims1 {
            self.fill_monocular(source1, SourceId::Source1, d1);
        }
        if let Some(d2) = dims2 {
            self.fill_monocular(source2, SourceId::Source2, d2);
        }
    }

    fn fill_monocular(&self, objects: &mut [TrackedObject], source: SourceId, dims: FrameDims) {
        for object in objects.iter_mut().filter(|o| o.position.is_none()) {
            object.position = Some(self.monocular(&object.bbox, source, dims));
        }
    }

    /// Index of the same-class object in `candidates` with the closest vertical
    /// center, if its similarity clears the match threshold.
    fn best_match(
        &self,
        object: &TrackedObject,
        dims: FrameDims,
        candidates: &[TrackedObject],
    ) -> Option<usize> {
        let (_, y) = object.bbox.center();
        let mut best: Option<(usize, f32)> = None;
        for (index, candidate) in candidates.iter().enumerate() {
            if candidate.class_name != object.class_name {
                continue;
            }
            let dy = (candidate.bbox.center().1 - y).abs();
            if best.map_or(true, |(_, best_dy)| dy < best_dy) {
                best = Some((index, dy));
            }
        }
        let (index, dy) = best?;
        let similarity = 1.0 / (1.0 + dy / dims.height.max(1) as f32);
        (similarity > self.settings.match_threshold).then_some(index)
    }

    /// Depth from horizontal disparity of two box centers.
    ///
    /// Returns `None` when the normalized disparity is below `min_disparity`.
    pub fn triangulate(
        &self,
        left: &BoundingBox,
        left_dims: FrameDims,
        right: &BoundingBox,
        right_dims: FrameDims,
    ) -> Option<Position3D> {
        let (lx, ly) = left.center();
        let (rx, ry) = right.center();
        let (x1, y1) = left_dims.normalize(lx, ly);
        let (x2, y2) = right_dims.normalize(rx, ry);

        let disparity = (x1 - x2).abs();
        if disparity < self.settings.min_disparity {
            return None;
        }
        let depth = self.settings.baseline_m / disparity;
        let position = Position3D::new((x1 + x2) / 2.0 * depth, (y1 + y2) / 2.0 * depth, depth);
        position.is_finite().then_some(position)
    }

    /// Depth from apparent size: larger boxes are nearer.
    pub fn monocular(&self, bbox: &BoundingBox, source: SourceId, dims: FrameDims) -> Position3D {
        let s = &self.settings;
        let frame_area = dims.area().max(1.0);
        let factor = (bbox.area() / (NEAR_AREA_FRACTION * frame_area))
            .clamp(MIN_SIZE_FACTOR, MAX_SIZE_FACTOR);
        let depth = s.min_depth_m + (s.max_depth_m - s.min_depth_m) * (1.0 - factor);

        let (cx, cy) = bbox.center();
        let (x_norm, y_norm) = dims.normalize(cx, cy);
        let offset = match source {
            SourceId::Source1 => -s.baseline_m / 2.0,
            SourceId::Source2 => s.baseline_m / 2.0,
        };
        Position3D::new(offset + x_norm * depth, y_norm * depth, depth)
    }
}
