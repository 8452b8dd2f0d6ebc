//! Detection results shared by the detectors, fusion and control

use serde::{Deserialize, Serialize};

/// Axis-aligned box in pixel coordinates (top-left corner, width, height)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BBox {
    /// Negative or non-finite sizes are clamped to zero
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        let finite = |v: f32| if v.is_finite() { v } else { 0.0 };
        Self {
            x: finite(x),
            y: finite(y),
            w: finite(w).max(0.0),
            h: finite(h).max(0.0),
        }
    }

    pub fn area(&self) -> f32 {
        self.w * self.h
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    pub fn diagonal(&self) -> f32 {
        (self.w * self.w + self.h * self.h).sqrt()
    }

    /// Grow by `frac` of the box size on every side
    pub fn expand(&self, frac: f32) -> Self {
        let dx = self.w * frac;
        let dy = self.h * frac;
        BBox::new(self.x - dx, self.y - dy, self.w + 2.0 * dx, self.h + 2.0 * dy)
    }

    /// Clip to `[0, width) x [0, height)`
    pub fn clamp_to(&self, width: f32, height: f32) -> Self {
        let x0 = self.x.clamp(0.0, width);
        let y0 = self.y.clamp(0.0, height);
        let x1 = (self.x + self.w).clamp(0.0, width);
        let y1 = (self.y + self.h).clamp(0.0, height);
        BBox::new(x0, y0, x1 - x0, y1 - y0)
    }

    /// Intersection over union; 0 for degenerate boxes
    pub fn iou(&self, other: &BBox) -> f32 {
        let inter_x_min = self.x.max(other.x);
        let inter_y_min = self.y.max(other.y);
        let inter_x_max = (self.x + self.w).min(other.x + other.w);
        let inter_y_max = (self.y + self.h).min(other.y + other.h);

        if inter_x_max <= inter_x_min || inter_y_max <= inter_y_min {
            return 0.0;
        }

        let inter_area = (inter_x_max - inter_x_min) * (inter_y_max - inter_y_min);
        let union_area = self.area() + other.area() - inter_area;
        if union_area <= 0.0 || !union_area.is_finite() {
            return 0.0;
        }

        let iou = inter_area / union_area;
        if iou.is_finite() {
            iou.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

/// Squared distance between two points
pub fn distance_sq(a: (f32, f32), b: (f32, f32)) -> f32 {
    let dx = a.0 - b.0;
    let dy = a.1 - b.1;
    dx * dx + dy * dy
}

/// Heavy detector output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxDetection {
    pub bbox: BBox,
    /// In (0, 1]
    pub confidence: f32,
    pub class_name: String,
}

impl BoxDetection {
    pub fn new(bbox: BBox, confidence: f32, class_name: impl Into<String>) -> Self {
        Self {
            bbox,
            confidence: if confidence.is_finite() { confidence.clamp(0.0, 1.0) } else { 0.0 },
            class_name: class_name.into(),
        }
    }

    pub fn area(&self) -> f32 {
        self.bbox.area()
    }
}

/// Color segmentation candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircleDetection {
    /// Minimal enclosing circle center
    pub center: (f32, f32),
    pub radius: f32,
    /// Contour bounding box
    pub bbox: BBox,
    /// Contour area
    pub area: f32,
    /// 4*pi*A/P^2, 1.0 for a perfect circle
    pub circularity: f32,
    /// IoU against the heavy box, when one was available
    pub iou: Option<f32>,
    pub score: f32,
    /// Passed the acceptance gates
    pub accepted: bool,
}

impl CircleDetection {
    /// Ordering pseudo-confidence; never compared with heavy confidences
    pub const PSEUDO_CONFIDENCE: f32 = 0.5;
}

/// Either detector's result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawDetection {
    Box(BoxDetection),
    Circle(CircleDetection),
}

impl RawDetection {
    pub fn center(&self) -> (f32, f32) {
        match self {
            RawDetection::Box(det) => det.bbox.center(),
            RawDetection::Circle(det) => det.center,
        }
    }

    pub fn area(&self) -> f32 {
        match self {
            RawDetection::Box(det) => det.area(),
            RawDetection::Circle(det) => det.area.max(0.0),
        }
    }

    pub fn bbox(&self) -> BBox {
        match self {
            RawDetection::Box(det) => det.bbox,
            RawDetection::Circle(det) => det.bbox,
        }
    }

    pub fn confidence(&self) -> f32 {
        match self {
            RawDetection::Box(det) => det.confidence,
            RawDetection::Circle(_) => CircleDetection::PSEUDO_CONFIDENCE,
        }
    }
}

/// Which detector supplied the fused result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionSource {
    Heavy,
    Fast,
    None,
}
