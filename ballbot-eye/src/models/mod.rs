//! Heavy object detector seam

pub mod yolo;

pub use yolo::{YoloDetector, COCO_CLASSES};

use crate::detection::BoxDetection;
use crate::error::BotError;
use crate::frame::Frame;

/// Slow, accurate detector consulted every N-th frame
#[cfg_attr(test, mockall::automock)]
pub trait HeavyDetector: Send {
    /// Every box found in `frame`, any class
    fn detect(&mut self, frame: &Frame) -> Result<Vec<BoxDetection>, BotError>;
}

/// Highest-confidence detection whose class is a target and whose confidence
/// exceeds `threshold`
pub fn select_target(
    detections: &[BoxDetection],
    target_classes: &[String],
    threshold: f32,
) -> Option<BoxDetection> {
    detections
        .iter()
        .filter(|d| d.confidence > threshold)
        .filter(|d| target_classes.iter().any(|c| c == &d.class_name))
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
        .cloned()
}
