use thiserror::Error;

use crate::detect::result::Detection;
use crate::frame::Frame;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("unknown detector backend '{0}'")]
    UnknownBackend(String),
    #[error("model load failed: {0}")]
    Model(String),
    #[error("frame rejected: {0}")]
    Input(String),
    #[error("inference failed: {0}")]
    Inference(String),
}

/// Detector backend trait.
///
/// One instance serves both sources; calls are sequential.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    ///
    /// Returns detections with confidence at or above `confidence`, after
    /// non-maximum suppression at IoU `overlap`. Boxes are in the frame's
    /// pixel space.
    fn detect(
        &mut self,
        frame: &Frame,
        confidence: f32,
        overlap: f32,
    ) -> Result<Vec<Detection>, DetectError>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<(), DetectError> {
        Ok(())
    }
}
