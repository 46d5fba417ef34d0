use crate::detect::backend::{DetectError, DetectorBackend};
use crate::detect::result::{coco_class_id, Detection};
use crate::frame::Frame;
use crate::geometry::BoundingBox;

const DEFAULT_LUMA_THRESHOLD: u8 = 128;
const DEFAULT_MIN_PIXELS: usize = 16;

/// CPU backend: connected bright regions on a dark background.
///
/// Every blob is labelled with one configured class. Confidence is the
/// fraction of the blob's bounding box covered by foreground pixels, so solid
/// rectangles score 1.0 and thin diagonal streaks score low.
pub struct CpuBackend {
    label: String,
    class_id: u32,
    luma_threshold: u8,
    min_pixels: usize,
}

impl CpuBackend {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            class_id: coco_class_id(label).unwrap_or(0),
            luma_threshold: DEFAULT_LUMA_THRESHOLD,
            min_pixels: DEFAULT_MIN_PIXELS,
        }
    }

    pub fn with_threshold(mut self, luma: u8) -> Self {
        self.luma_threshold = luma;
        self
    }

    fn foreground_mask(&self, frame: &Frame) -> Vec<bool> {
        frame
            .pixels()
            .chunks_exact(3)
            .map(|px| luma(px[0], px[1], px[2]) > self.luma_threshold)
            .collect()
    }
}

fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((r as u32 * 299 + g as u32 * 587 + b as u32 * 114) / 1000) as u8
}

/// (min_x, min_y, max_x, max_y, pixel count) of one connected region.
type Blob = (usize, usize, usize, usize, usize);

/// 4-connected components of `mask`. Consumes the mask.
fn components(mask: &mut [bool], width: usize, height: usize) -> Vec<Blob> {
    let mut blobs = Vec::new();
    let mut stack = Vec::new();
    for start in 0..mask.len() {
        if !mask[start] {
            continue;
        }
        mask[start] = false;
        stack.push(start);
        let (mut min_x, mut min_y) = (usize::MAX, usize::MAX);
        let (mut max_x, mut max_y) = (0, 0);
        let mut count = 0;
        while let Some(index) = stack.pop() {
            let (x, y) = (index % width, index / width);
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
            count += 1;

            let mut visit = |n: usize| {
                if mask[n] {
                    mask[n] = false;
                    stack.push(n);
                }
            };
            if x > 0 {
                visit(index - 1);
            }
            if x + 1 < width {
                visit(index + 1);
            }
            if y > 0 {
                visit(index - width);
            }
            if y + 1 < height {
                visit(index + width);
            }
        }
        blobs.push((min_x, min_y, max_x, max_y, count));
    }
    blobs
}

impl DetectorBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn detect(
        &mut self,
        frame: &Frame,
        confidence: f32,
        overlap: f32,
    ) -> Result<Vec<Detection>, DetectError> {
        let (width, height) = (frame.width() as usize, frame.height() as usize);
        if width == 0 || height == 0 {
            return Err(DetectError::Input("empty frame".into()));
        }
        let mut mask = self.foreground_mask(frame);

        let mut detections: Vec<Detection> = components(&mut mask, width, height)
            .into_iter()
            .filter(|blob| blob.4 >= self.min_pixels)
            .map(|(min_x, min_y, max_x, max_y, count)| {
                let w = (max_x - min_x + 1) as f32;
                let h = (max_y - min_y + 1) as f32;
                let fill = count as f32 / (w * h);
                Detection::new(
                    BoundingBox::new(min_x as f32, min_y as f32, w, h),
                    fill.clamp(0.0, 1.0),
                    self.class_id,
                    &self.label,
                )
            })
            .filter(|d| d.confidence >= confidence)
            .collect();
        crate::detect::non_max_suppression(&mut detections, overlap);
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn frame_with_boxes(boxes: &[(u32, u32, u32, u32)]) -> Frame {
        let mut image = RgbImage::from_pixel(64, 48, Rgb([10, 10, 10]));
        for &(x, y, w, h) in boxes {
            for py in y..y + h {
                for px in x..x + w {
                    image.put_pixel(px, py, Rgb([240, 240, 240]));
                }
            }
        }
        Frame::new(image, 1)
    }

    #[test]
    fn finds_each_bright_rectangle() {
        let mut backend = CpuBackend::new("car");
        let frame = frame_with_boxes(&[(4, 4, 10, 8), (40, 20, 12, 12)]);
        let mut dets = backend.detect(&frame, 0.3, 0.45).unwrap();
        dets.sort_by(|a, b| a.bbox.x.total_cmp(&b.bbox.x));

        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].bbox, BoundingBox::new(4.0, 4.0, 10.0, 8.0));
        assert_eq!(dets[1].bbox, BoundingBox::new(40.0, 20.0, 12.0, 12.0));
        assert!(dets.iter().all(|d| d.class_name == "car" && d.class_id == 2));
        assert!(dets.iter().all(|d| (d.confidence - 1.0).abs() < 1e-6));
    }

    #[test]
    fn dark_frame_has_no_detections() {
        let mut backend = CpuBackend::new("car");
        assert!(backend
            .detect(&frame_with_boxes(&[]), 0.3, 0.45)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn specks_are_ignored() {
        let mut backend = CpuBackend::new("car");
        let frame = frame_with_boxes(&[(10, 10, 2, 2)]);
        assert!(backend.detect(&frame, 0.0, 0.45).unwrap().is_empty());
    }
}
