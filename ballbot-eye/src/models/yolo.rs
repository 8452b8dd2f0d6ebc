//! YOLO object detection through the OpenCV DNN module

use crate::config::DetectorConfig;
use crate::detection::{BBox, BoxDetection};
use crate::error::BotError;
use crate::frame::Frame;
use crate::models::HeavyDetector;
use crate::utils::frame_to_mat;
use opencv::core::{self, Mat, Scalar, Size, Vector};
use opencv::dnn::{self, Net};
use opencv::prelude::*;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, info, warn};

/// COCO class names (80 classes)
pub const COCO_CLASSES: &[&str] = &[
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat",
    "dog", "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack",
    "umbrella", "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball",
    "kite", "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket",
    "bottle", "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple",
    "sandwich", "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair",
    "couch", "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse",
    "remote", "keyboard", "cell phone", "microwave", "oven", "toaster", "sink", "refrigerator",
    "book", "clock", "vase", "scissors", "teddy bear", "hair drier", "toothbrush",
];

/// How a network lays out its detection tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLayout {
    /// Darknet / YOLOv5 rows: `[cx, cy, w, h, objectness, scores...]`,
    /// coordinates normalized to the frame
    Rows { count: usize },
    /// YOLOv8+ ONNX export `[4 + classes, anchors]`, coordinates in input pixels
    Transposed { anchors: usize },
}

/// Candidate box before suppression
#[derive(Debug, Clone, PartialEq)]
pub struct RawBox {
    pub bbox: BBox,
    pub confidence: f32,
    pub class_id: usize,
}

/// Heavy detector backed by an OpenCV DNN network
pub struct YoloDetector {
    net: Net,
    classes: Vec<String>,
    /// Indices into `classes` accepted as the ball
    target_ids: Vec<usize>,
    out_names: Vector<String>,
    input_size: i32,
    confidence_threshold: f32,
    nms_threshold: f32,
}

impl YoloDetector {
    /// Load the network described by `config`
    pub fn new(config: &DetectorConfig) -> Result<Self, BotError> {
        if !config.model_path.exists() {
            return Err(BotError::Model(format!(
                "Model file not found: {:?}",
                config.model_path
            )));
        }

        let classes = match &config.classes_path {
            Some(path) => load_classes(path)?,
            None => COCO_CLASSES.iter().map(|c| c.to_string()).collect(),
        };
        let target_ids = resolve_targets(&classes, &config.target_classes);
        if target_ids.is_empty() {
            warn!("No usable target class; heavy detections will be ignored");
        }

        let model = path_str(&config.model_path)?;
        let mut net = match &config.darknet_config {
            Some(cfg) => dnn::read_net_from_darknet(path_str(cfg)?, model)?,
            None => dnn::read_net_from_onnx(model)?,
        };
        net.set_preferable_backend(dnn::DNN_BACKEND_OPENCV)?;
        net.set_preferable_target(dnn::DNN_TARGET_CPU)?;
        let out_names = net.get_unconnected_out_layers_names()?;

        let input_size = i32::try_from(config.input_size)
            .map_err(|_| BotError::Config("Detector input size exceeds i32".to_string()))?;

        info!(
            "YOLO model loaded from {:?} ({} classes, input {})",
            config.model_path,
            classes.len(),
            input_size
        );

        Ok(Self {
            net,
            classes,
            target_ids,
            out_names,
            input_size,
            confidence_threshold: config.confidence_threshold,
            nms_threshold: config.nms_threshold,
        })
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    fn layout_of(&self, output: &Mat) -> Result<OutputLayout, BotError> {
        let dims = output.mat_size().to_vec();
        layout_from_dims(&dims, self.classes.len())
    }
}

/// Pick the decode layout from an output tensor's dimensions.
///
/// A last axis of `classes + 5` is row-major with objectness; an axis of
/// `classes + 4` followed by the anchor axis is the transposed export.
pub fn layout_from_dims(dims: &[i32], classes: usize) -> Result<OutputLayout, BotError> {
    let dims: Vec<usize> = dims.iter().map(|&d| d.max(0) as usize).collect();
    let mismatch = || {
        BotError::Model(format!(
            "Output shape {:?} does not match {} classes",
            dims, classes
        ))
    };

    let (&last, rest) = dims.split_last().ok_or_else(mismatch)?;
    if last == classes + 5 {
        return Ok(OutputLayout::Rows {
            count: rest.iter().product(),
        });
    }
    match rest.last() {
        Some(&attributes) if attributes == classes + 4 => Ok(OutputLayout::Transposed { anchors: last }),
        _ => Err(mismatch()),
    }
}

/// Indices of the configured target names; unknown names are reported and skipped
fn resolve_targets(classes: &[String], targets: &[String]) -> Vec<usize> {
    targets
        .iter()
        .filter_map(|target| {
            let id = classes.iter().position(|c| c == target);
            if id.is_none() {
                warn!("Target class '{}' is not known to the model, ignoring it", target);
            }
            id
        })
        .collect()
}

/// Drop candidates that are not a target class or not above `threshold`
pub fn retain_targets(mut boxes: Vec<RawBox>, target_ids: &[usize], threshold: f32) -> Vec<RawBox> {
    boxes.retain(|b| target_ids.contains(&b.class_id) && b.confidence > threshold);
    boxes
}

impl HeavyDetector for YoloDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<BoxDetection>, BotError> {
        if self.target_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mat = frame_to_mat(frame)?;
        // Frames are already RGB, so no channel swap
        let blob = dnn::blob_from_image(
            &mat,
            1.0 / 255.0,
            Size::new(self.input_size, self.input_size),
            Scalar::default(),
            false,
            false,
            core::CV_32F,
        )?;
        self.net.set_input(&blob, "", 1.0, Scalar::default())?;

        let mut outputs = Vector::<Mat>::new();
        self.net.forward(&mut outputs, &self.out_names)?;

        let mut candidates = Vec::new();
        for output in outputs.iter() {
            let layout = self.layout_of(&output)?;
            let data = output.data_typed::<f32>()?;
            candidates.extend(decode_output(
                data,
                layout,
                self.classes.len(),
                (frame.width() as f32, frame.height() as f32),
                self.input_size as f32,
                self.confidence_threshold,
            ));
        }

        let candidates = retain_targets(candidates, &self.target_ids, self.confidence_threshold);
        let kept = non_max_suppression(candidates, self.nms_threshold);
        debug!("YOLO detected {} objects", kept.len());

        Ok(kept
            .into_iter()
            .filter_map(|raw| {
                let name = self.classes.get(raw.class_id)?;
                Some(BoxDetection::new(raw.bbox, raw.confidence, name.as_str()))
            })
            .collect())
    }
}

/// Turn a raw output tensor into frame-space candidate boxes
pub fn decode_output(
    data: &[f32],
    layout: OutputLayout,
    num_classes: usize,
    frame_size: (f32, f32),
    input_size: f32,
    threshold: f32,
) -> Vec<RawBox> {
    let (frame_w, frame_h) = frame_size;
    let mut boxes = Vec::new();
    if num_classes == 0 || frame_w <= 0.0 || frame_h <= 0.0 {
        return boxes;
    }

    match layout {
        OutputLayout::Rows { count } => {
            let stride = num_classes + 5;
            for row in data.chunks_exact(stride).take(count) {
                let objectness = row[4];
                let Some((class_id, score)) = best_class(&row[5..]) else {
                    continue;
                };
                let confidence = objectness * score;
                if !(confidence > threshold) {
                    continue;
                }
                let bbox = centered_box(row[0] * frame_w, row[1] * frame_h, row[2] * frame_w, row[3] * frame_h);
                push_clamped(&mut boxes, bbox, confidence, class_id, frame_size);
            }
        }
        OutputLayout::Transposed { anchors } => {
            if data.len() < anchors * (num_classes + 4) || input_size <= 0.0 {
                return boxes;
            }
            let sx = frame_w / input_size;
            let sy = frame_h / input_size;
            let at = |attr: usize, anchor: usize| data[attr * anchors + anchor];
            for anchor in 0..anchors {
                let scores = (0..num_classes).map(|c| at(4 + c, anchor));
                let Some((class_id, confidence)) = best_of(scores) else {
                    continue;
                };
                if !(confidence > threshold) {
                    continue;
                }
                let bbox = centered_box(
                    at(0, anchor) * sx,
                    at(1, anchor) * sy,
                    at(2, anchor) * sx,
                    at(3, anchor) * sy,
                );
                push_clamped(&mut boxes, bbox, confidence, class_id, frame_size);
            }
        }
    }

    boxes
}

fn centered_box(cx: f32, cy: f32, w: f32, h: f32) -> BBox {
    BBox::new(cx - w / 2.0, cy - h / 2.0, w, h)
}

fn push_clamped(out: &mut Vec<RawBox>, bbox: BBox, confidence: f32, class_id: usize, frame: (f32, f32)) {
    let bbox = bbox.clamp_to(frame.0, frame.1);
    if bbox.w <= 0.0 || bbox.h <= 0.0 || !confidence.is_finite() {
        return;
    }
    out.push(RawBox {
        bbox,
        confidence: confidence.clamp(0.0, 1.0),
        class_id,
    });
}

fn best_class(scores: &[f32]) -> Option<(usize, f32)> {
    best_of(scores.iter().copied())
}

fn best_of(scores: impl Iterator<Item = f32>) -> Option<(usize, f32)> {
    scores
        .enumerate()
        .filter(|(_, s)| s.is_finite())
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

/// Greedy per-class non-maximum suppression, highest confidence first
pub fn non_max_suppression(mut boxes: Vec<RawBox>, iou_threshold: f32) -> Vec<RawBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<RawBox> = Vec::new();
    for candidate in boxes {
        let suppressed = keep.iter().any(|kept| {
            kept.class_id == candidate.class_id && kept.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !suppressed {
            keep.push(candidate);
        }
    }
    keep
}

fn load_classes(path: &Path) -> Result<Vec<String>, BotError> {
    let file = File::open(path)
        .map_err(|e| BotError::Model(format!("Failed to open class list {:?}: {}", path, e)))?;
    let mut classes = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let name = line.trim();
        if !name.is_empty() {
            classes.push(name.to_string());
        }
    }
    if classes.is_empty() {
        return Err(BotError::Model(format!("Class list {:?} is empty", path)));
    }
    Ok(classes)
}

fn path_str(path: &Path) -> Result<&str, BotError> {
    path.to_str()
        .ok_or_else(|| BotError::Model(format!("Path is not valid UTF-8: {:?}", path)))
}
