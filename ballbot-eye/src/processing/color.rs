//! Per-frame HSV color detector

use crate::config::{ColorConfig, FusionConfig};
use crate::detection::{distance_sq, BBox, CircleDetection};
use crate::error::BotError;
use crate::frame::Frame;
use crate::utils::frame_to_hsv;
use opencv::core::{self, Mat, Point, Point2f, Scalar, Size, Vector};
use opencv::imgproc;
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

/// Thresholds and gains the color detector works with.
///
/// Owned by the calibrator, read by the detector every frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorProfile {
    /// HSV lower bound (H 0..179, S/V 0..255)
    pub lower: [u8; 3],
    pub upper: [u8; 3],
    pub saturation_gain: f32,
    pub value_gain: f32,
}

impl From<&ColorConfig> for ColorProfile {
    fn from(config: &ColorConfig) -> Self {
        Self {
            lower: config.lower_hsv,
            upper: config.upper_hsv,
            saturation_gain: config.saturation_gain,
            value_gain: config.value_gain,
        }
    }
}

impl Default for ColorProfile {
    fn default() -> Self {
        Self::from(&ColorConfig::default())
    }
}

/// Shape measurements of one contour, in frame coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContourGeometry {
    pub center: (f32, f32),
    pub radius: f32,
    pub bbox: BBox,
    pub area: f32,
    pub circularity: f32,
}

impl ContourGeometry {
    /// `4*pi*A/P^2`, clamped to [0, 1]; 0 for a degenerate perimeter
    pub fn circularity_of(area: f32, perimeter: f32) -> f32 {
        if perimeter <= 0.0 || !perimeter.is_finite() || !area.is_finite() {
            return 0.0;
        }
        (4.0 * PI * area / (perimeter * perimeter)).clamp(0.0, 1.0)
    }
}

/// Best candidates of one color pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColorOutcome {
    /// Highest score among candidates that passed the gates
    pub best_accepted: Option<CircleDetection>,
    /// Highest score overall, accepted or not
    pub best_any: Option<CircleDetection>,
    /// Contours above the minimum area
    pub candidates: usize,
}

impl ColorOutcome {
    /// Accepted candidate if any, otherwise the best rejected one
    pub fn best(&self) -> Option<&CircleDetection> {
        self.best_accepted.as_ref().or(self.best_any.as_ref())
    }
}

/// Fast ball detector: HSV threshold, morphology, contour scoring
pub struct ColorDetector {
    config: FusionConfig,
}

impl ColorDetector {
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    /// Search `frame` for ball-colored blobs.
    ///
    /// With a `hint` (a valid heavy box) the search is restricted to the
    /// expanded box and candidates must agree with it geometrically.
    pub fn detect(
        &self,
        frame: &Frame,
        profile: &ColorProfile,
        hint: Option<&BBox>,
    ) -> Result<ColorOutcome, BotError> {
        if frame.is_empty() {
            return Ok(ColorOutcome::default());
        }

        let frame_w = frame.width() as f32;
        let frame_h = frame.height() as f32;
        let (region, offset) = match hint {
            Some(hbox) => {
                let roi = hbox.expand(self.config.roi_expand_frac).clamp_to(frame_w, frame_h);
                match (frame.crop(&roi), frame.clip_rect(&roi)) {
                    (Some(crop), Some((x, y, _, _))) => (crop, (x as f32, y as f32)),
                    _ => return Ok(ColorOutcome::default()),
                }
            }
            None => (frame.clone(), (0.0, 0.0)),
        };

        let mask = self.mask(&region, profile)?;
        let mut outcome = ColorOutcome::default();
        for geometry in self.contours(&mask, offset)? {
            outcome.candidates += 1;
            let candidate = evaluate_candidate(&geometry, hint, (frame_w, frame_h), &self.config);
            keep_best(&mut outcome.best_any, &candidate);
            if candidate.accepted {
                keep_best(&mut outcome.best_accepted, &candidate);
            }
        }

        Ok(outcome)
    }

    /// Binary mask of in-range pixels after blur, open and close
    fn mask(&self, region: &Frame, profile: &ColorProfile) -> Result<Mat, BotError> {
        let hsv = frame_to_hsv(region, profile.saturation_gain, profile.value_gain)?;

        let lower = Scalar::new(profile.lower[0] as f64, profile.lower[1] as f64, profile.lower[2] as f64, 0.0);
        let upper = Scalar::new(profile.upper[0] as f64, profile.upper[1] as f64, profile.upper[2] as f64, 0.0);
        let mut mask = Mat::default();
        core::in_range(&hsv, &lower, &upper, &mut mask)?;

        let mut blurred = Mat::default();
        imgproc::gaussian_blur(&mask, &mut blurred, Size::new(5, 5), 0.0, 0.0, core::BORDER_DEFAULT)?;

        let kernel = imgproc::get_structuring_element(imgproc::MORPH_ELLIPSE, Size::new(5, 5), Point::new(-1, -1))?;
        let border = imgproc::morphology_default_border_value()?;
        let mut opened = Mat::default();
        imgproc::morphology_ex(
            &blurred,
            &mut opened,
            imgproc::MORPH_OPEN,
            &kernel,
            Point::new(-1, -1),
            1,
            core::BORDER_CONSTANT,
            border,
        )?;
        let mut closed = Mat::default();
        imgproc::morphology_ex(
            &opened,
            &mut closed,
            imgproc::MORPH_CLOSE,
            &kernel,
            Point::new(-1, -1),
            1,
            core::BORDER_CONSTANT,
            border,
        )?;
        Ok(closed)
    }

    /// External contours above the minimum area, translated by `offset`
    fn contours(&self, mask: &Mat, offset: (f32, f32)) -> Result<Vec<ContourGeometry>, BotError> {
        let mut contours = Vector::<Vector<Point>>::new();
        imgproc::find_contours(
            mask,
            &mut contours,
            imgproc::RETR_EXTERNAL,
            imgproc::CHAIN_APPROX_SIMPLE,
            Point::new(0, 0),
        )?;

        let mut shapes = Vec::new();
        for contour in contours.iter() {
            let area = imgproc::contour_area(&contour, false)? as f32;
            if area < self.config.min_contour_area {
                continue;
            }
            let perimeter = imgproc::arc_length(&contour, true)? as f32;
            let rect = imgproc::bounding_rect(&contour)?;
            let mut center = Point2f::default();
            let mut radius = 0.0f32;
            imgproc::min_enclosing_circle(&contour, &mut center, &mut radius)?;

            shapes.push(ContourGeometry {
                center: (center.x + offset.0, center.y + offset.1),
                radius,
                bbox: BBox::new(
                    rect.x as f32 + offset.0,
                    rect.y as f32 + offset.1,
                    rect.width as f32,
                    rect.height as f32,
                ),
                area,
                circularity: ContourGeometry::circularity_of(area, perimeter),
            });
        }
        Ok(shapes)
    }
}

fn keep_best(slot: &mut Option<CircleDetection>, candidate: &CircleDetection) {
    let better = match slot {
        Some(current) => candidate.score > current.score,
        None => true,
    };
    if better {
        *slot = Some(candidate.clone());
    }
}

/// Score and gate one contour.
///
/// Hinted: `w_iou*IoU + w_circ*circularity - w_dist*dist/diag(heavy)`, accepted
/// only if IoU, bounding area ratio and circularity all pass. Unhinted:
/// `w_circ*circularity - w_dist*dist/diag(frame)` to the frame center, gated on
/// circularity alone.
pub fn evaluate_candidate(
    geometry: &ContourGeometry,
    hint: Option<&BBox>,
    frame_size: (f32, f32),
    config: &FusionConfig,
) -> CircleDetection {
    let circularity = if geometry.circularity.is_finite() {
        geometry.circularity
    } else {
        0.0
    };

    let (score, iou, accepted) = match hint {
        Some(hbox) => {
            let iou = geometry.bbox.iou(hbox);
            let heavy_area = hbox.area();
            let area_ratio = if heavy_area > 0.0 {
                geometry.bbox.area() / heavy_area
            } else {
                0.0
            };
            let dist = distance_sq(geometry.center, hbox.center()).sqrt() / hbox.diagonal().max(1.0);
            let score = config.hinted_iou_weight * iou + config.hinted_circularity_weight * circularity
                - config.hinted_distance_weight * dist;
            let accepted = iou >= config.iou_min
                && (config.area_min_ratio..=config.area_max_ratio).contains(&area_ratio)
                && circularity >= config.circularity_min;
            (score, Some(iou), accepted)
        }
        None => {
            let (w, h) = frame_size;
            let diagonal = (w * w + h * h).sqrt().max(1.0);
            let dist = distance_sq(geometry.center, (w / 2.0, h / 2.0)).sqrt() / diagonal;
            let score = config.unhinted_circularity_weight * circularity - config.unhinted_distance_weight * dist;
            (score, None, circularity >= config.circularity_min)
        }
    };

    CircleDetection {
        center: geometry.center,
        radius: geometry.radius.max(0.0),
        bbox: geometry.bbox,
        area: geometry.area.max(0.0),
        circularity,
        iou,
        score: if score.is_finite() { score } else { 0.0 },
        accepted,
    }
}
