use serde::Serialize;

use crate::geometry::BoundingBox;

/// One detected object in pixel space.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub class_id: u32,
    pub class_name: String,
}

impl Detection {
    pub fn new(bbox: BoundingBox, confidence: f32, class_id: u32, class_name: &str) -> Self {
        Self {
            bbox,
            confidence,
            class_id,
            class_name: class_name.to_string(),
        }
    }

    /// Detection labelled with a COCO class name.
    pub fn coco(bbox: BoundingBox, confidence: f32, class_name: &str) -> Self {
        Self::new(bbox, confidence, coco_class_id(class_name).unwrap_or(0), class_name)
    }
}

/// COCO class labels in model output order.
pub const COCO_CLASSES: [&str; 80] = [
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
    "bench",
    "bird",
    "cat",
    "dog",
    "horse",
    "sheep",
    "cow",
    "elephant",
    "bear",
    "zebra",
    "giraffe",
    "backpack",
    "umbrella",
    "handbag",
    "tie",
    "suitcase",
    "frisbee",
    "skis",
    "snowboard",
    "sports ball",
    "kite",
    "baseball bat",
    "baseball glove",
    "skateboard",
    "surfboard",
    "tennis racket",
    "bottle",
    "wine glass",
    "cup",
    "fork",
    "knife",
    "spoon",
    "bowl",
    "banana",
    "apple",
    "sandwich",
    "orange",
    "broccoli",
    "carrot",
    "hot dog",
    "pizza",
    "donut",
    "cake",
    "chair",
    "couch",
    "potted plant",
    "bed",
    "dining table",
    "toilet",
    "tv",
    "laptop",
    "mouse",
    "remote",
    "keyboard",
    "cell phone",
    "microwave",
    "oven",
    "toaster",
    "sink",
    "refrigerator",
    "book",
    "clock",
    "vase",
    "scissors",
    "teddy bear",
    "hair drier",
    "toothbrush",
];

pub fn coco_class_id(name: &str) -> Option<u32> {
    COCO_CLASSES
        .iter()
        .position(|class| *class == name)
        .map(|index| index as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coco_lookup() {
        assert_eq!(coco_class_id("car"), Some(2));
        assert_eq!(coco_class_id("truck"), Some(7));
        assert_eq!(coco_class_id("spaceship"), None);
        assert_eq!(
            Detection::coco(BoundingBox::default(), 0.5, "person").class_id,
            0
        );
    }
}
