//! Configuration for ballbot-eye

use crate::error::BotError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Boundary token written by the ESP32 camera firmware between MJPEG parts
pub const DEFAULT_BOUNDARY: &str = "--123456789000000000000987654321";

/// Side the robot rotates toward while searching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

/// Multipart video stream settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// MJPEG stream URL
    pub url: String,
    /// Part boundary token, including the leading dashes
    pub boundary: String,
    /// Connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Largest payload accepted for one part
    pub max_frame_bytes: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: "http://192.168.1.9:81/stream".to_string(),
            boundary: DEFAULT_BOUNDARY.to_string(),
            connect_timeout_ms: 2000,
            max_frame_bytes: 5 * 1024 * 1024,
        }
    }
}

/// Heavy object detector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Path to the network weights (.onnx, or .weights with `darknet_config`)
    pub model_path: PathBuf,
    /// Darknet .cfg file, when loading darknet weights
    pub darknet_config: Option<PathBuf>,
    /// Class names file, one per line; COCO names are used when absent
    pub classes_path: Option<PathBuf>,
    /// Square network input size
    pub input_size: u32,
    /// Class labels accepted as the ball
    pub target_classes: Vec<String>,
    /// Minimum confidence for a heavy detection
    pub confidence_threshold: f32,
    /// Non-maximum suppression IoU threshold
    pub nms_threshold: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/yolo11m.onnx"),
            darknet_config: None,
            classes_path: None,
            input_size: 640,
            target_classes: vec![
                "sports ball".to_string(),
                "apple".to_string(),
                "orange".to_string(),
            ],
            confidence_threshold: 0.001,
            nms_threshold: 0.4,
        }
    }
}

/// Heavy/fast detector fusion settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Run the heavy detector every N-th frame
    pub detection_interval: u64,
    /// Heavy result stays valid for `ttl_multiple * detection_interval` frames
    pub ttl_multiple: u64,
    /// Fraction of the heavy box added on each side for the color search ROI
    pub roi_expand_frac: f32,
    /// Minimum IoU between a color candidate and the heavy box
    pub iou_min: f32,
    /// Minimum color area / heavy box area
    pub area_min_ratio: f32,
    /// Maximum color area / heavy box area
    pub area_max_ratio: f32,
    /// Minimum 4*pi*A/P^2
    pub circularity_min: f32,
    /// Contours below this area are ignored
    pub min_contour_area: f32,
    pub hinted_iou_weight: f32,
    pub hinted_circularity_weight: f32,
    pub hinted_distance_weight: f32,
    pub unhinted_circularity_weight: f32,
    pub unhinted_distance_weight: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            detection_interval: 6,
            ttl_multiple: 2,
            roi_expand_frac: 0.35,
            iou_min: 0.15,
            area_min_ratio: 0.35,
            area_max_ratio: 1.40,
            circularity_min: 0.55,
            min_contour_area: 2000.0,
            hinted_iou_weight: 0.5,
            hinted_circularity_weight: 0.3,
            hinted_distance_weight: 0.2,
            unhinted_circularity_weight: 0.7,
            unhinted_distance_weight: 0.3,
        }
    }
}

impl FusionConfig {
    /// Heavy result time-to-live, in frames
    pub fn heavy_ttl_frames(&self) -> u64 {
        self.detection_interval.max(1).saturating_mul(self.ttl_multiple)
    }
}

/// Initial color detector parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorConfig {
    /// HSV lower bound (OpenCV ranges: H 0..179, S/V 0..255)
    pub lower_hsv: [u8; 3],
    /// HSV upper bound
    pub upper_hsv: [u8; 3],
    /// Multiplicative saturation gain
    pub saturation_gain: f32,
    /// Multiplicative value gain
    pub value_gain: f32,
}

impl Default for ColorConfig {
    fn default() -> Self {
        Self {
            lower_hsv: [29, 100, 100],
            upper_hsv: [49, 255, 255],
            saturation_gain: 1.5,
            value_gain: 1.2,
        }
    }
}

/// Online color calibration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub enabled: bool,
    /// Rolling agreement window size
    pub window: usize,
    /// Agreements needed inside the window
    pub target_consistent: usize,
    /// Center distance tolerance in pixels
    pub position_tolerance_px: f32,
    /// Blend factor toward sampled thresholds
    pub lerp_alpha: f32,
    /// Low/high percentiles sampled inside the heavy box
    pub percentiles: (f32, f32),
    pub h_margin: f32,
    pub s_margin: f32,
    pub v_margin: f32,
    pub saturation_step: f32,
    pub value_step: f32,
    pub saturation_bounds: (f32, f32),
    pub value_bounds: (f32, f32),
    /// Target band for the sampled saturation mean
    pub saturation_band: (f32, f32),
    /// Target band for the sampled value mean
    pub value_band: (f32, f32),
    /// Consecutive correct frames before the profile is persisted
    pub dump_consecutive: u32,
    pub dump_path: PathBuf,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: 150,
            target_consistent: 100,
            position_tolerance_px: 20.0,
            lerp_alpha: 0.2,
            percentiles: (5.0, 95.0),
            h_margin: 5.0,
            s_margin: 20.0,
            v_margin: 20.0,
            saturation_step: 0.05,
            value_step: 0.05,
            saturation_bounds: (0.8, 3.0),
            value_bounds: (0.6, 2.0),
            saturation_band: (110.0, 170.0),
            value_band: (110.0, 210.0),
            dump_consecutive: 50,
            dump_path: PathBuf::from("calibration/calibrated_hsv.txt"),
        }
    }
}

/// Motion controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Left edge of the horizontal target zone, fraction of frame width
    pub target_zone_x_min: f32,
    /// Right edge of the horizontal target zone
    pub target_zone_x_max: f32,
    /// Half-width of the centered band around the frame middle
    pub center_band: f32,
    pub search_turn_speed: u8,
    pub approach_speed: u8,
    pub approach_turn_ratio: f32,
    /// Speed while holding a captured ball
    pub dribble_speed: u8,
    pub dribble_turn_ratio: f32,
    pub min_speed: u8,
    pub max_speed: u8,
    /// Floor for the decaying confirmation speed
    pub min_adjustment_speed: u8,
    /// Consecutive sightings before approaching
    pub confirmation_threshold: u32,
    /// Grace period for re-detection while confirming, at zero confidence
    pub max_adjustment_timeout_ms: u64,
    /// Smallest fraction of the grace period left at full confidence
    pub grace_floor_fraction: f32,
    pub ball_lost_timeout_ms: u64,
    /// Detected area that counts as captured
    pub captured_area_threshold: f32,
    /// Area fraction of the capture threshold below which capture is released
    pub capture_release_ratio: f32,
    pub default_search_side: Side,
    /// The camera image is mirrored: a ball on the left of the frame lies
    /// to the robot's right. Matches the stock ESP32 camera mounting.
    pub invert_turns: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            target_zone_x_min: 0.30,
            target_zone_x_max: 0.70,
            center_band: 0.10,
            search_turn_speed: 100,
            approach_speed: 120,
            approach_turn_ratio: 0.2,
            dribble_speed: 140,
            dribble_turn_ratio: 0.5,
            min_speed: 50,
            max_speed: 255,
            min_adjustment_speed: 50,
            confirmation_threshold: 10,
            max_adjustment_timeout_ms: 750,
            grace_floor_fraction: 0.2,
            ball_lost_timeout_ms: 1000,
            captured_area_threshold: 1_500_000.0,
            capture_release_ratio: 0.6,
            default_search_side: Side::Right,
            invert_turns: true,
        }
    }
}

/// Command dispatcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Motor controller move endpoint
    pub endpoint: String,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Hard floor between any two sends
    pub min_interval_ms: u64,
    /// Window in which an identical command is not repeated
    pub same_command_interval_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://192.168.1.9:80/move".to_string(),
            connect_timeout_ms: 2000,
            read_timeout_ms: 1000,
            min_interval_ms: 100,
            same_command_interval_ms: 200,
        }
    }
}

/// Control loop pacing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Yield after each processed frame
    pub loop_sleep_ms: u64,
    /// Sleep while no frame is available
    pub idle_sleep_ms: u64,
    /// Frames older than this are treated as no detection
    pub stale_frame_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            loop_sleep_ms: 1,
            idle_sleep_ms: 10,
            stale_frame_timeout_ms: 2000,
        }
    }
}

impl RuntimeConfig {
    pub fn loop_sleep(&self) -> Duration {
        Duration::from_millis(self.loop_sleep_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn stale_frame_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_frame_timeout_ms)
    }
}

/// Complete robot configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub stream: StreamConfig,
    pub detector: DetectorConfig,
    pub fusion: FusionConfig,
    pub color: ColorConfig,
    pub calibration: CalibrationConfig,
    pub control: ControlConfig,
    pub dispatch: DispatchConfig,
    pub runtime: RuntimeConfig,
}

impl BotConfig {
    /// Load configuration from a TOML file; missing keys keep their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, BotError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: BotConfig = toml::from_str(&text)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.stream.boundary.is_empty() {
            return Err("Stream boundary must not be empty".to_string());
        }
        if self.stream.max_frame_bytes == 0 {
            return Err("Max frame bytes must be greater than 0".to_string());
        }

        if !(0.0..=1.0).contains(&self.detector.confidence_threshold) {
            return Err("Detector confidence threshold must be within [0, 1]".to_string());
        }
        if self.detector.input_size == 0 || self.detector.input_size > 4096 {
            return Err("Detector input size must be between 1 and 4096".to_string());
        }

        let fusion = &self.fusion;
        if fusion.detection_interval == 0 {
            return Err("Detection interval must be greater than 0".to_string());
        }
        if fusion.ttl_multiple == 0 {
            return Err("TTL multiple must be greater than 0".to_string());
        }
        if !(0.0..=2.0).contains(&fusion.roi_expand_frac) {
            return Err("ROI expansion must be within [0, 2]".to_string());
        }
        if fusion.area_min_ratio < 0.0 || fusion.area_min_ratio > fusion.area_max_ratio {
            return Err("Area ratio bounds must satisfy 0 <= min <= max".to_string());
        }
        if !(0.0..=1.0).contains(&fusion.iou_min) || !(0.0..=1.0).contains(&fusion.circularity_min) {
            return Err("IoU and circularity gates must be within [0, 1]".to_string());
        }

        let color = &self.color;
        if color.lower_hsv[0] > 179 || color.upper_hsv[0] > 179 {
            return Err("Hue bounds must be within [0, 179]".to_string());
        }
        if color.saturation_gain <= 0.0 || color.value_gain <= 0.0 {
            return Err("Color gains must be positive".to_string());
        }

        let cal = &self.calibration;
        if cal.window == 0 {
            return Err("Calibration window must be greater than 0".to_string());
        }
        if cal.target_consistent > cal.window {
            return Err("Calibration agreement target cannot exceed the window size".to_string());
        }
        if !(0.0..=1.0).contains(&cal.lerp_alpha) {
            return Err("Calibration lerp alpha must be within [0, 1]".to_string());
        }
        let (p_lo, p_hi) = cal.percentiles;
        if !(0.0..=100.0).contains(&p_lo) || !(0.0..=100.0).contains(&p_hi) || p_lo > p_hi {
            return Err("Calibration percentiles must satisfy 0 <= low <= high <= 100".to_string());
        }
        if cal.saturation_bounds.0 > cal.saturation_bounds.1 || cal.value_bounds.0 > cal.value_bounds.1 {
            return Err("Gain bounds must satisfy min <= max".to_string());
        }

        let control = &self.control;
        if !(0.0..=1.0).contains(&control.target_zone_x_min)
            || !(0.0..=1.0).contains(&control.target_zone_x_max)
            || control.target_zone_x_min >= control.target_zone_x_max
        {
            return Err("Target zone must satisfy 0 <= min < max <= 1".to_string());
        }
        if control.min_speed > control.max_speed {
            return Err("Minimum speed cannot exceed maximum speed".to_string());
        }
        if control.confirmation_threshold == 0 {
            return Err("Confirmation threshold must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&control.approach_turn_ratio)
            || !(0.0..=1.0).contains(&control.dribble_turn_ratio)
        {
            return Err("Turn ratios must be within [0, 1]".to_string());
        }

        if self.dispatch.endpoint.is_empty() {
            return Err("Dispatch endpoint must not be empty".to_string());
        }
        if self.dispatch.min_interval_ms > self.dispatch.same_command_interval_ms {
            return Err("Same-command interval must be at least the minimum interval".to_string());
        }

        Ok(())
    }
}
