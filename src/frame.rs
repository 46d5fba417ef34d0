//! Frame ownership layer.
//!
//! - `Frame`: owned, decoded RGB image plus capture metadata.
//! - `FrameSlot`: the single "latest frame" slot shared between an acquisition
//!   thread and its readers. Only copy-in / copy-out operations are exposed, so
//!   no reader can observe a frame while it is being overwritten.
//! - `FpsMeter`: rolling frame-rate estimate for health reporting.

use image::RgbImage;
use std::sync::{Mutex, PoisonError};
use std::time::{Instant, SystemTime};

/// Number of frames per FPS measurement window.
pub const FPS_WINDOW_FRAMES: u32 = 30;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One decoded image captured from a source.
///
/// `Clone` is a deep copy of the pixel buffer.
#[derive(Clone, Debug)]
pub struct Frame {
    image: RgbImage,
    /// Per-source sequence number (1-based, monotonically increasing).
    pub sequence: u64,
    /// Wall-clock capture time.
    pub captured_at: SystemTime,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self {
            image,
            sequence,
            captured_at: SystemTime::now(),
        }
    }

    /// Build a frame from a packed RGB24 buffer.
    pub fn from_rgb(width: u32, height: u32, pixels: Vec<u8>, sequence: u64) -> Option<Self> {
        RgbImage::from_raw(width, height, pixels).map(|image| Self::new(image, sequence))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Packed RGB24 pixels, row-major.
    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }
}

// ----------------------------------------------------------------------------
// FrameSlot
// ----------------------------------------------------------------------------

/// Latest-frame slot guarded by one mutex.
///
/// Writers hold the lock only to move a finished frame in; readers only to
/// clone it out. No decoding or resizing happens under the lock.
#[derive(Debug, Default)]
pub struct FrameSlot {
    latest: Mutex<Option<Frame>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored frame.
    pub fn store(&self, frame: Frame) {
        let mut guard = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(frame);
    }

    /// Copy of the stored frame, if any.
    pub fn load(&self) -> Option<Frame> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        let mut guard = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = None;
    }

    pub fn is_empty(&self) -> bool {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

// ----------------------------------------------------------------------------
// FpsMeter
// ----------------------------------------------------------------------------

/// Frame rate over fixed windows of `FPS_WINDOW_FRAMES` frames.
#[derive(Debug)]
pub struct FpsMeter {
    window_start: Instant,
    frames_in_window: u32,
    fps: f32,
}

impl FpsMeter {
    pub fn new() -> Self {
        Self {
            window_start: Instant::now(),
            frames_in_window: 0,
            fps: 0.0,
        }
    }

    /// Record one frame. Returns the updated estimate when a window closes.
    pub fn tick(&mut self) -> Option<f32> {
        self.frames_in_window += 1;
        if self.frames_in_window < FPS_WINDOW_FRAMES {
            return None;
        }
        let elapsed = self.window_start.elapsed().as_secs_f32().max(1e-3);
        self.fps = self.frames_in_window as f32 / elapsed;
        self.frames_in_window = 0;
        self.window_start = Instant::now();
        Some(self.fps)
    }

    pub fn fps(&self) -> f32 {
        self.fps
    }
}

impl Default for FpsMeter {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(value: u8, sequence: u64) -> Frame {
        Frame::from_rgb(4, 2, vec![value; 4 * 2 * 3], sequence).unwrap()
    }

    #[test]
    fn slot_starts_empty() {
        let slot = FrameSlot::new();
        assert!(slot.load().is_none());
        assert!(slot.is_empty());
    }

    #[test]
    fn slot_returns_independent_copies() {
        let slot = FrameSlot::new();
        slot.store(solid_frame(10, 1));

        let copy = slot.load().unwrap();
        slot.store(solid_frame(20, 2));

        assert_eq!(copy.sequence, 1);
        assert!(copy.pixels().iter().all(|&p| p == 10));
        assert_eq!(slot.load().unwrap().sequence, 2);
    }

    #[test]
    fn slot_clear_drops_frame() {
        let slot = FrameSlot::new();
        slot.store(solid_frame(1, 1));
        slot.clear();
        assert!(slot.load().is_none());
    }

    #[test]
    fn from_rgb_rejects_short_buffers() {
        assert!(Frame::from_rgb(4, 4, vec![0; 10], 1).is_none());
    }

    #[test]
    fn fps_meter_reports_after_full_window() {
        let mut meter = FpsMeter::new();
        for _ in 0..FPS_WINDOW_FRAMES - 1 {
            assert!(meter.tick().is_none());
        }
        let fps = meter.tick().unwrap();
        assert!(fps > 0.0);
        assert_eq!(meter.fps(), fps);
    }
}
