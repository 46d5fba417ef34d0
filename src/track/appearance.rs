use crate::frame::Frame;
use crate::geometry::BoundingBox;

const BINS_PER_CHANNEL: usize = 8;
const MAX_SAMPLES: usize = 4096;

/// Length of an appearance descriptor.
pub const DESCRIPTOR_LEN: usize = BINS_PER_CHANNEL * 3;

/// Coarse per-channel color histogram of the pixels inside `bbox`,
/// L2-normalized.
///
/// Returns `None` when the box does not overlap the frame.
pub fn color_histogram(frame: &Frame, bbox: &BoundingBox) -> Option<Vec<f32>> {
    let (width, height) = (frame.width() as f32, frame.height() as f32);
    let x0 = bbox.x.max(0.0).floor() as u32;
    let y0 = bbox.y.max(0.0).floor() as u32;
    let x1 = bbox.right().min(width).ceil() as u32;
    let y1 = bbox.bottom().min(height).ceil() as u32;
    if x1 <= x0 || y1 <= y0 {
        return None;
    }

    let area = ((x1 - x0) * (y1 - y0)) as usize;
    let stride = ((area / MAX_SAMPLES) as f64).sqrt().ceil().max(1.0) as usize;

    let image = frame.image();
    let mut histogram = vec![0f32; DESCRIPTOR_LEN];
    for y in (y0..y1).step_by(stride) {
        for x in (x0..x1).step_by(stride) {
            let px = image.get_pixel(x, y);
            for channel in 0..3 {
                let bin = px[channel] as usize * BINS_PER_CHANNEL / 256;
                histogram[channel * BINS_PER_CHANNEL + bin] += 1.0;
            }
        }
    }
    normalize(&mut histogram);
    Some(histogram)
}

fn normalize(values: &mut [f32]) {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|v| *v /= norm);
    }
}

/// Cosine distance between two normalized descriptors, in [0, 2].
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    (1.0 - dot).max(0.0)
}

/// Exponential moving average of two descriptors, renormalized.
pub fn blend(previous: &mut [f32], current: &[f32], weight: f32) {
    for (p, c) in previous.iter_mut().zip(current) {
        *p = *p * (1.0 - weight) + c * weight;
    }
    normalize(previous);
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn two_tone_frame() -> Frame {
        let mut image = RgbImage::from_pixel(40, 20, Rgb([220, 30, 30]));
        for y in 0..20 {
            for x in 20..40 {
                image.put_pixel(x, y, Rgb([30, 30, 220]));
            }
        }
        Frame::new(image, 1)
    }

    #[test]
    fn same_region_has_zero_distance() {
        let frame = two_tone_frame();
        let a = color_histogram(&frame, &BoundingBox::new(0.0, 0.0, 10.0, 10.0)).unwrap();
        let b = color_histogram(&frame, &BoundingBox::new(5.0, 5.0, 10.0, 10.0)).unwrap();
        assert!(cosine_distance(&a, &b) < 1e-5);
    }

    #[test]
    fn different_colors_are_far_apart() {
        let frame = two_tone_frame();
        let red = color_histogram(&frame, &BoundingBox::new(0.0, 0.0, 10.0, 10.0)).unwrap();
        let blue = color_histogram(&frame, &BoundingBox::new(25.0, 0.0, 10.0, 10.0)).unwrap();
        assert!(cosine_distance(&red, &blue) > 0.2);
    }

    #[test]
    fn box_outside_frame_has_no_descriptor() {
        let frame = two_tone_frame();
        assert!(color_histogram(&frame, &BoundingBox::new(100.0, 100.0, 5.0, 5.0)).is_none());
    }
}
