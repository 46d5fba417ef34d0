//! Object detection capability.
//!
//! The orchestrator only sees `DetectorBackend`. Backends shipped here:
//! - `stub`: scripted detections (tests)
//! - `cpu`: bright-foreground blob detector, labelled with a configured class
//! - `tract`: YOLOv8-layout ONNX model (feature: backend-tract)

mod backend;
pub mod backends;
mod result;

use crate::config::DetectorSettings;

pub use backend::{DetectError, DetectorBackend};
pub use backends::{CpuBackend, StubBackend};
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use result::{coco_class_id, Detection, COCO_CLASSES};

/// Build the backend named in `settings`.
pub fn backend_from_settings(
    settings: &DetectorSettings,
) -> Result<Box<dyn DetectorBackend>, DetectError> {
    let mut backend: Box<dyn DetectorBackend> = match settings.backend.as_str() {
        "stub" => Box::new(StubBackend::new()),
        "cpu" => {
            let label = settings
                .classes
                .first()
                .map(String::as_str)
                .unwrap_or("object");
            Box::new(CpuBackend::new(label))
        }
        #[cfg(feature = "backend-tract")]
        "tract" => {
            let path = settings.model_path.as_ref().ok_or_else(|| {
                DetectError::Model("tract backend requires detector.model_path".into())
            })?;
            Box::new(TractBackend::new(path, settings.input_size)?)
        }
        #[cfg(not(feature = "backend-tract"))]
        "tract" => {
            return Err(DetectError::UnknownBackend(
                "tract (rebuild with --features backend-tract)".into(),
            ))
        }
        other => return Err(DetectError::UnknownBackend(other.to_string())),
    };
    backend.warm_up()?;
    log::info!("Detector: using {} backend", backend.name());
    Ok(backend)
}

/// Greedy non-maximum suppression, highest confidence first.
///
/// A detection is dropped when its IoU with an already kept detection of the
/// same class exceeds `overlap`.
pub fn non_max_suppression(detections: &mut Vec<Detection>, overlap: f32) {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept = 0;
    for index in 0..detections.len() {
        let suppressed = (0..kept).any(|prev| {
            detections[prev].class_id == detections[index].class_id
                && detections[prev].bbox.iou(&detections[index].bbox) > overlap
        });
        if !suppressed {
            detections.swap(kept, index);
            kept += 1;
        }
    }
    detections.truncate(kept);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BoundingBox;

    fn det(x: f32, confidence: f32, class: &str) -> Detection {
        Detection::coco(BoundingBox::new(x, 0.0, 10.0, 10.0), confidence, class)
    }

    #[test]
    fn nms_keeps_best_of_overlapping_pair() {
        let mut dets = vec![det(0.0, 0.6, "car"), det(1.0, 0.9, "car"), det(50.0, 0.5, "car")];
        non_max_suppression(&mut dets, 0.45);
        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].confidence, 0.9);
        assert_eq!(dets[1].bbox.x, 50.0);
    }

    #[test]
    fn nms_is_per_class() {
        let mut dets = vec![det(0.0, 0.9, "car"), det(0.0, 0.8, "truck")];
        non_max_suppression(&mut dets, 0.45);
        assert_eq!(dets.len(), 2);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let settings = DetectorSettings {
            backend: "magic".into(),
            ..DetectorSettings::default()
        };
        assert!(matches!(
            backend_from_settings(&settings),
            Err(DetectError::UnknownBackend(_))
        ));
    }

    #[test]
    fn cpu_backend_is_built_with_first_class() {
        let backend = backend_from_settings(&DetectorSettings::default()).unwrap();
        assert_eq!(backend.name(), "cpu");
    }
}
