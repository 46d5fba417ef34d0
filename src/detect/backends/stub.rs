use std::collections::VecDeque;

use crate::detect::backend::{DetectError, DetectorBackend};
use crate::detect::result::Detection;
use crate::frame::Frame;

/// Scripted backend for tests.
///
/// Each `detect` call pops the next scripted step; once the script is empty
/// the `steady` detections are returned on every call.
#[derive(Default)]
pub struct StubBackend {
    script: VecDeque<Result<Vec<Detection>, String>>,
    steady: Vec<Detection>,
    calls: u64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend returning the same detections on every call.
    pub fn repeating(detections: Vec<Detection>) -> Self {
        Self {
            steady: detections,
            ..Self::default()
        }
    }

    /// Queue detections for the next unscripted call.
    pub fn then(mut self, detections: Vec<Detection>) -> Self {
        self.script.push_back(Ok(detections));
        self
    }

    /// Queue a failure for the next unscripted call.
    pub fn then_fail(mut self, message: &str) -> Self {
        self.script.push_back(Err(message.to_string()));
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(
        &mut self,
        _frame: &Frame,
        confidence: f32,
        overlap: f32,
    ) -> Result<Vec<Detection>, DetectError> {
        self.calls += 1;
        let mut detections = match self.script.pop_front() {
            Some(Ok(detections)) => detections,
            Some(Err(message)) => return Err(DetectError::Inference(message)),
            None => self.steady.clone(),
        };
        detections.retain(|d| d.confidence >= confidence);
        crate::detect::non_max_suppression(&mut detections, overlap);
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BoundingBox;

    fn frame() -> Frame {
        Frame::from_rgb(2, 2, vec![0; 12], 1).unwrap()
    }

    #[test]
    fn script_then_steady_state() {
        let car = Detection::coco(BoundingBox::new(0.0, 0.0, 40.0, 40.0), 0.8, "car");
        let mut backend = StubBackend::repeating(vec![car.clone()])
            .then(vec![])
            .then_fail("gpu on fire");

        assert!(backend.detect(&frame(), 0.3, 0.45).unwrap().is_empty());
        assert!(matches!(
            backend.detect(&frame(), 0.3, 0.45),
            Err(DetectError::Inference(_))
        ));
        assert_eq!(backend.detect(&frame(), 0.3, 0.45).unwrap(), vec![car]);
        assert_eq!(backend.calls(), 3);
    }

    #[test]
    fn confidence_threshold_applies() {
        let weak = Detection::coco(BoundingBox::new(0.0, 0.0, 40.0, 40.0), 0.2, "car");
        let mut backend = StubBackend::repeating(vec![weak]);
        assert!(backend.detect(&frame(), 0.3, 0.45).unwrap().is_empty());
    }
}
