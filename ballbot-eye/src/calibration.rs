//! Online color calibration against the heavy detector.
//!
//! The heavy detector acts as ground truth: every frame where it has a box,
//! the HSV statistics inside that box pull the color thresholds toward the
//! ball's actual appearance. Agreement between the two detectors is tracked
//! in a rolling window, and once agreement has been sustained long enough the
//! tuned profile is written to disk, once per run.

use crate::config::{CalibrationConfig, FusionConfig};
use crate::detection::{distance_sq, BoxDetection, CircleDetection};
use crate::error::BotError;
use crate::frame::Frame;
use crate::processing::ColorProfile;
use crate::utils::{hsv_pixels, percentile};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::path::Path;
use tracing::{debug, info, warn};

/// Snapshot of calibration progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CalibrationStatus {
    /// Agreements inside the rolling window
    pub same_place_count: usize,
    pub same_place_needed: usize,
    pub consecutive_correct: u32,
    pub correct_needed: u32,
    pub dumped: bool,
}

/// Percentile targets sampled inside a heavy box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HsvTargets {
    pub lower: [f32; 3],
    pub upper: [f32; 3],
    pub saturation_mean: f32,
    pub value_mean: f32,
}

/// Tunes the color profile while the robot runs
pub struct OnlineCalibrator {
    config: CalibrationConfig,
    gates: FusionConfig,
    profile: ColorProfile,
    window: VecDeque<bool>,
    same_place_count: usize,
    consecutive_correct: u32,
    dumped: bool,
    persistence_failed: bool,
}

impl OnlineCalibrator {
    /// `gates` only feeds the header of the persisted file
    pub fn new(config: CalibrationConfig, profile: ColorProfile, gates: FusionConfig) -> Self {
        let capacity = config.window.max(1);
        Self {
            config,
            gates,
            profile,
            window: VecDeque::with_capacity(capacity),
            same_place_count: 0,
            consecutive_correct: 0,
            dumped: false,
            persistence_failed: false,
        }
    }

    /// Profile the color detector should use for the next frame
    pub fn profile(&self) -> &ColorProfile {
        &self.profile
    }

    pub fn same_place_count(&self) -> usize {
        self.same_place_count
    }

    pub fn consecutive_correct(&self) -> u32 {
        self.consecutive_correct
    }

    pub fn is_dumped(&self) -> bool {
        self.dumped
    }

    /// Enough recent agreement between the two detectors
    pub fn is_tuned(&self) -> bool {
        self.same_place_count >= self.config.target_consistent
    }

    pub fn status(&self) -> CalibrationStatus {
        CalibrationStatus {
            same_place_count: self.same_place_count,
            same_place_needed: self.config.target_consistent,
            consecutive_correct: self.consecutive_correct,
            correct_needed: self.config.dump_consecutive,
            dumped: self.dumped,
        }
    }

    /// Feed one fused frame. Returns whether the detectors agreed.
    pub fn observe(
        &mut self,
        frame: &Frame,
        heavy: Option<&BoxDetection>,
        color: Option<&CircleDetection>,
    ) -> bool {
        let near = is_near(heavy, color, self.config.position_tolerance_px);
        self.push_sample(near);

        if self.config.enabled {
            if let Some(heavy) = heavy {
                match sample_targets(frame, heavy, &self.profile, &self.config) {
                    Ok(Some(targets)) => self.steer(&targets),
                    Ok(None) => debug!("Heavy box lies outside the frame, skipping calibration sample"),
                    Err(e) => debug!("Calibration sample failed: {}", e),
                }
            }
        }

        let correct = near && self.is_tuned();
        self.consecutive_correct = if correct {
            self.consecutive_correct.saturating_add(1)
        } else {
            0
        };

        if self.config.enabled
            && !self.dumped
            && !self.persistence_failed
            && self.consecutive_correct >= self.config.dump_consecutive
        {
            self.persist();
        }

        near
    }

    fn push_sample(&mut self, near: bool) {
        let capacity = self.config.window.max(1);
        while self.window.len() >= capacity {
            if let Some(true) = self.window.pop_front() {
                self.same_place_count -= 1;
            }
        }
        self.window.push_back(near);
        if near {
            self.same_place_count += 1;
        }
    }

    /// Soft nudge of thresholds and gains toward sampled targets
    fn steer(&mut self, targets: &HsvTargets) {
        let alpha = self.config.lerp_alpha;
        for channel in 0..3 {
            let max = if channel == 0 { 179.0 } else { 255.0 };
            self.profile.lower[channel] = lerp_u8(self.profile.lower[channel], targets.lower[channel], alpha, max);
            self.profile.upper[channel] = lerp_u8(self.profile.upper[channel], targets.upper[channel], alpha, max);
        }

        self.profile.saturation_gain = nudge_gain(
            self.profile.saturation_gain,
            targets.saturation_mean,
            self.config.saturation_band,
            self.config.saturation_step,
            self.config.saturation_bounds,
        );
        self.profile.value_gain = nudge_gain(
            self.profile.value_gain,
            targets.value_mean,
            self.config.value_band,
            self.config.value_step,
            self.config.value_bounds,
        );
    }

    fn persist(&mut self) {
        let path = self.config.dump_path.clone();
        match write_dump(&path, &self.profile, &self.gates, &self.config) {
            Ok(()) => {
                self.dumped = true;
                info!(
                    "Wrote calibrated HSV bounds to {:?}: lower {:?} upper {:?} gains S={:.2} V={:.2}",
                    path,
                    self.profile.lower,
                    self.profile.upper,
                    self.profile.saturation_gain,
                    self.profile.value_gain
                );
            }
            Err(e) => {
                self.persistence_failed = true;
                warn!(
                    "Failed to write calibration to {:?}, persistence disabled for this run: {}",
                    path, e
                );
            }
        }
    }
}

/// Both detections exist and their centers lie within `tolerance` pixels
pub fn is_near(heavy: Option<&BoxDetection>, color: Option<&CircleDetection>, tolerance: f32) -> bool {
    match (heavy, color) {
        (Some(heavy), Some(color)) => distance_sq(heavy.bbox.center(), color.center) <= tolerance * tolerance,
        _ => false,
    }
}

/// Percentile bounds (with margins) and channel means inside the heavy box
pub fn sample_targets(
    frame: &Frame,
    heavy: &BoxDetection,
    profile: &ColorProfile,
    config: &CalibrationConfig,
) -> Result<Option<HsvTargets>, BotError> {
    let Some(roi) = frame.crop(&heavy.bbox) else {
        return Ok(None);
    };
    let pixels = hsv_pixels(&roi, profile.saturation_gain, profile.value_gain)?;
    if pixels.is_empty() {
        return Ok(None);
    }

    let margins = [config.h_margin, config.s_margin, config.v_margin];
    let (p_lo, p_hi) = config.percentiles;
    let mut lower = [0.0f32; 3];
    let mut upper = [0.0f32; 3];
    let mut means = [0.0f32; 3];

    for channel in 0..3 {
        let mut values: Vec<f32> = pixels.iter().map(|px| px[channel] as f32).collect();
        means[channel] = values.iter().sum::<f32>() / values.len() as f32;
        values.sort_by(f32::total_cmp);

        let max = if channel == 0 { 179.0 } else { 255.0 };
        let lo = percentile(&values, p_lo)
            .ok_or_else(|| BotError::Calibration("Empty channel sample".to_string()))?;
        let hi = percentile(&values, p_hi)
            .ok_or_else(|| BotError::Calibration("Empty channel sample".to_string()))?;
        lower[channel] = (lo - margins[channel]).clamp(0.0, max);
        upper[channel] = (hi + margins[channel]).clamp(0.0, max);
    }

    Ok(Some(HsvTargets {
        lower,
        upper,
        saturation_mean: means[1],
        value_mean: means[2],
    }))
}

fn lerp_u8(current: u8, target: f32, alpha: f32, max: f32) -> u8 {
    let blended = current as f32 * (1.0 - alpha) + target * alpha;
    if !blended.is_finite() {
        return current;
    }
    blended.round().clamp(0.0, max) as u8
}

fn nudge_gain(gain: f32, mean: f32, band: (f32, f32), step: f32, bounds: (f32, f32)) -> f32 {
    if mean < band.0 {
        (gain + step).min(bounds.1)
    } else if mean > band.1 {
        (gain - step).max(bounds.0)
    } else {
        gain
    }
}

/// Render the persisted calibration file
pub fn render_dump(profile: &ColorProfile, gates: &FusionConfig, config: &CalibrationConfig) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Generated by ballbot online calibration");
    let _ = writeln!(out, "# Written {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S %z"));
    let _ = writeln!(out, "# --- Filter pipeline applied ---");
    let _ = writeln!(
        out,
        "# enhance: S_gain={:.2}, V_gain={:.2}",
        profile.saturation_gain, profile.value_gain
    );
    let _ = writeln!(out, "# mask: HSV -> inRange(LOWER_BALL_COLOR, UPPER_BALL_COLOR)");
    let _ = writeln!(
        out,
        "# post: GaussianBlur(5x5) -> MorphOpen(ellipse 5x5, it=1) -> MorphClose(ellipse 5x5, it=1)"
    );
    let _ = writeln!(out, "# selection gates (relative to the heavy box):");
    let _ = writeln!(
        out,
        "#   ROI_EXPAND_FRAC={}, COLOR_IOU_MIN={}, COLOR_AREA_RATIO=[{}, {}], COLOR_CIRCULARITY_MIN={}",
        gates.roi_expand_frac, gates.iou_min, gates.area_min_ratio, gates.area_max_ratio, gates.circularity_min
    );
    let _ = writeln!(out, "# HSV target margins used while tuning:");
    let _ = writeln!(
        out,
        "#   H_MARGIN={}, S_MARGIN={}, V_MARGIN={}",
        config.h_margin, config.s_margin, config.v_margin
    );
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "LOWER_BALL_COLOR = ({}, {}, {})",
        profile.lower[0], profile.lower[1], profile.lower[2]
    );
    let _ = writeln!(
        out,
        "UPPER_BALL_COLOR = ({}, {}, {})",
        profile.upper[0], profile.upper[1], profile.upper[2]
    );
    let _ = writeln!(out, "SATURATION_GAIN = {:.2}", profile.saturation_gain);
    let _ = writeln!(out, "VALUE_GAIN = {:.2}", profile.value_gain);
    out
}

fn write_dump(
    path: &Path,
    profile: &ColorProfile,
    gates: &FusionConfig,
    config: &CalibrationConfig,
) -> Result<(), BotError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, render_dump(profile, gates, config))?;
    Ok(())
}
