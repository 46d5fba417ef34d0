//! Synthetic sources for tests and dry runs.
//!
//! A synthetic scene is a dark, slightly flickering background with one bright
//! rectangle sweeping left to right. `stub://<name>?shift=<px>` offsets the
//! rectangle horizontally so two synthetic sources see the same "object" with
//! a fixed disparity.

use image::{Rgb, RgbImage};
use rand::Rng;
use std::time::{Duration, Instant};
use url::Url;

use super::{Capture, CaptureBackend, CaptureError, ConnectStrategy};
use crate::config::CaptureSettings;

pub const SYNTHETIC_SCHEME: &str = "stub";

const BACKGROUND_LEVEL: u8 = 20;
const BACKGROUND_FLICKER: u8 = 8;
const OBJECT_LEVEL: u8 = 230;
const SWEEP_PIXELS_PER_FRAME: u32 = 4;

pub fn is_synthetic(address: &str) -> bool {
    address
        .trim()
        .to_ascii_lowercase()
        .starts_with(&format!("{}://", SYNTHETIC_SCHEME))
}

/// Backend that serves synthetic scenes for every address and device.
#[derive(Clone, Debug, Default)]
pub struct SyntheticBackend;

impl CaptureBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn open_device(
        &self,
        index: u32,
        settings: &CaptureSettings,
    ) -> Result<Box<dyn Capture>, CaptureError> {
        let shift = index as i64 * (settings.width / 16) as i64;
        log::info!("SyntheticCapture: connected to device:{} (synthetic)", index);
        Ok(Box::new(SyntheticCapture::new(settings, shift)))
    }

    fn open_url(
        &self,
        url: &str,
        strategy: ConnectStrategy,
        settings: &CaptureSettings,
    ) -> Result<Box<dyn Capture>, CaptureError> {
        let parsed = Url::parse(url.trim())
            .map_err(|e| CaptureError::Unavailable(format!("invalid url {}: {}", url, e)))?;
        let shift = parsed
            .query_pairs()
            .find(|(key, _)| key == "shift")
            .map(|(_, value)| {
                value.parse::<i64>().map_err(|_| {
                    CaptureError::Unavailable(format!("invalid shift '{}' in {}", value, url))
                })
            })
            .transpose()?
            .unwrap_or(0);
        log::info!(
            "SyntheticCapture: connected to {} ({}, synthetic)",
            url,
            strategy.label()
        );
        Ok(Box::new(SyntheticCapture::new(settings, shift)))
    }
}

/// One synthetic scene, paced at the configured frame rate.
pub struct SyntheticCapture {
    width: u32,
    height: u32,
    shift: i64,
    frame_count: u64,
    interval: Duration,
    next_due: Option<Instant>,
}

impl SyntheticCapture {
    pub fn new(settings: &CaptureSettings, shift: i64) -> Self {
        let interval = if settings.fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(1.0 / settings.fps as f64)
        };
        Self {
            width: settings.width.max(1),
            height: settings.height.max(1),
            shift,
            frame_count: 0,
            interval,
            next_due: None,
        }
    }

    /// Pixel rectangle `(x, y, w, h)` of the object in frame `frame_count`.
    pub fn object_rect(&self, frame_count: u64) -> (u32, u32, u32, u32) {
        let obj_w = (self.width / 8).max(1);
        let obj_h = (self.height / 6).max(1);
        let travel = self
            .width
            .saturating_sub(obj_w + self.shift.unsigned_abs() as u32)
            .max(1) as u64;
        let sweep = (frame_count * SWEEP_PIXELS_PER_FRAME as u64) % travel;
        let x = (sweep as i64 + self.shift.max(0)).clamp(0, (self.width - obj_w) as i64) as u32;
        let y = (self.height - obj_h) / 2;
        (x, y, obj_w, obj_h)
    }

    fn pace(&mut self) {
        if self.interval.is_zero() {
            return;
        }
        let now = Instant::now();
        if let Some(due) = self.next_due {
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        self.next_due = Some(Instant::now() + self.interval);
    }
}

impl Capture for SyntheticCapture {
    fn read(&mut self) -> Result<RgbImage, CaptureError> {
        self.pace();
        self.frame_count += 1;

        let level = BACKGROUND_LEVEL + rand::thread_rng().gen_range(0..BACKGROUND_FLICKER);
        let mut image = RgbImage::from_pixel(self.width, self.height, Rgb([level; 3]));
        let (x, y, w, h) = self.object_rect(self.frame_count);
        for py in y..(y + h).min(self.height) {
            for px in x..(x + w).min(self.width) {
                image.put_pixel(px, py, Rgb([OBJECT_LEVEL; 3]));
            }
        }
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> CaptureSettings {
        CaptureSettings {
            width: 160,
            height: 120,
            fps: 0,
            ..CaptureSettings::default()
        }
    }

    #[test]
    fn recognizes_stub_scheme() {
        assert!(is_synthetic(" stub://left"));
        assert!(!is_synthetic("http://cam/stub"));
    }

    #[test]
    fn frames_contain_bright_object() {
        let mut capture = SyntheticCapture::new(&settings(), 0);
        let image = capture.read().unwrap();
        let (x, y, w, h) = capture.object_rect(1);
        assert_eq!(image.get_pixel(x + w / 2, y + h / 2)[0], OBJECT_LEVEL);
        assert!(image.get_pixel(0, 0)[0] < BACKGROUND_LEVEL + BACKGROUND_FLICKER);
    }

    #[test]
    fn shift_query_offsets_object() {
        let mut left = SyntheticBackend
            .open_url("stub://left", ConnectStrategy::Snapshot, &settings())
            .unwrap();
        let mut right = SyntheticBackend
            .open_url("stub://right?shift=20", ConnectStrategy::Snapshot, &settings())
            .unwrap();
        let a = left.read().unwrap();
        let b = right.read().unwrap();
        let first_bright = |img: &RgbImage| {
            (0..img.width())
                .find(|&x| img.get_pixel(x, 60)[0] == OBJECT_LEVEL)
                .unwrap()
        };
        assert_eq!(first_bright(&b), first_bright(&a) + 20);
    }

    #[test]
    fn invalid_shift_is_rejected() {
        let err = SyntheticBackend
            .open_url("stub://x?shift=abc", ConnectStrategy::Snapshot, &settings())
            .err()
            .unwrap();
        assert!(matches!(err, CaptureError::Unavailable(_)));
    }
}
