//! Heavy + color detector fusion

use crate::config::{DetectorConfig, FusionConfig};
use crate::detection::{BoxDetection, CircleDetection, DetectionSource, RawDetection};
use crate::frame::Frame;
use crate::models::{select_target, HeavyDetector};
use crate::processing::color::{ColorDetector, ColorProfile};
use tracing::{debug, warn};

/// Outcome of one fusion step
#[derive(Debug, Clone, PartialEq)]
pub struct FusionResult {
    /// Authoritative detection for this frame
    pub chosen: Option<RawDetection>,
    pub source: DetectionSource,
    /// Last cached heavy detection, possibly stale
    pub last_heavy: Option<BoxDetection>,
    /// Frames since `last_heavy` was produced
    pub heavy_age: Option<u64>,
    /// `last_heavy` is within its TTL
    pub heavy_valid: bool,
    /// Best color candidate of this frame, accepted or not
    pub color: Option<CircleDetection>,
    /// Zero-based index of the processed frame
    pub frame_index: u64,
}

impl FusionResult {
    /// Heavy detection when it is still trusted
    pub fn valid_heavy(&self) -> Option<&BoxDetection> {
        if self.heavy_valid {
            self.last_heavy.as_ref()
        } else {
            None
        }
    }
}

struct CachedHeavy {
    detection: BoxDetection,
    frame_index: u64,
}

/// Combines a cadenced heavy detector with the per-frame color detector
pub struct LocalizationFusion {
    heavy: Box<dyn HeavyDetector>,
    color: ColorDetector,
    config: FusionConfig,
    target_classes: Vec<String>,
    confidence_threshold: f32,
    frame_index: u64,
    last_heavy: Option<CachedHeavy>,
}

impl LocalizationFusion {
    pub fn new(heavy: Box<dyn HeavyDetector>, config: FusionConfig, detector: &DetectorConfig) -> Self {
        if detector.target_classes.is_empty() {
            warn!("No target classes configured; tracking with the color detector only");
        }
        Self {
            heavy,
            color: ColorDetector::new(config.clone()),
            config,
            target_classes: detector.target_classes.clone(),
            confidence_threshold: detector.confidence_threshold,
            frame_index: 0,
            last_heavy: None,
        }
    }

    /// Frames processed so far
    pub fn frames_processed(&self) -> u64 {
        self.frame_index
    }

    /// Fuse both detectors on `frame` using the current color `profile`
    pub fn process(&mut self, frame: &Frame, profile: &ColorProfile) -> FusionResult {
        let index = self.frame_index;
        self.frame_index += 1;

        if index % self.config.detection_interval.max(1) == 0 {
            self.run_heavy(frame, index);
        }

        let ttl = self.config.heavy_ttl_frames();
        let heavy_age = self.last_heavy.as_ref().map(|c| index - c.frame_index);
        let heavy_valid = heavy_age.map_or(false, |age| age <= ttl);
        let hint = if heavy_valid {
            self.last_heavy.as_ref().map(|c| c.detection.bbox)
        } else {
            None
        };

        let color = match self.color.detect(frame, profile, hint.as_ref()) {
            Ok(outcome) => outcome.best().cloned(),
            Err(e) => {
                warn!("Color detector failed on frame {}: {}", index, e);
                None
            }
        };

        let last_heavy = self.last_heavy.as_ref().map(|c| c.detection.clone());
        let (chosen, source) = match (&last_heavy, &color) {
            (Some(heavy), _) if heavy_valid => (Some(RawDetection::Box(heavy.clone())), DetectionSource::Heavy),
            (_, Some(circle)) if circle.accepted => (Some(RawDetection::Circle(circle.clone())), DetectionSource::Fast),
            _ => (None, DetectionSource::None),
        };

        FusionResult {
            chosen,
            source,
            last_heavy,
            heavy_age,
            heavy_valid,
            color,
            frame_index: index,
        }
    }

    fn run_heavy(&mut self, frame: &Frame, index: u64) {
        match self.heavy.detect(frame) {
            Ok(detections) => {
                match select_target(&detections, &self.target_classes, self.confidence_threshold) {
                    Some(best) => {
                        debug!(
                            "Heavy detector hit on frame {}: {} ({:.3})",
                            index, best.class_name, best.confidence
                        );
                        self.last_heavy = Some(CachedHeavy {
                            detection: best,
                            frame_index: index,
                        });
                    }
                    None => debug!("Heavy detector found no target on frame {}", index),
                }
            }
            Err(e) => warn!("Heavy detector failed on frame {}: {}", index, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BBox;
    use crate::error::BotError;
    use crate::models::MockHeavyDetector;

    fn ball(x: f32, y: f32, size: f32) -> BoxDetection {
        BoxDetection::new(BBox::new(x, y, size, size), 0.8, "sports ball")
    }

    fn fusion_with(mock: MockHeavyDetector) -> LocalizationFusion {
        LocalizationFusion::new(Box::new(mock), FusionConfig::default(), &DetectorConfig::default())
    }

    fn blank() -> Frame {
        Frame::filled(64, 48, [0, 0, 0])
    }

    #[test]
    fn test_heavy_runs_on_cadence() {
        let mut mock = MockHeavyDetector::new();
        // Frames 0, 6, 12 out of 13
        mock.expect_detect().times(3).returning(|_| Ok(vec![]));
        let mut fusion = fusion_with(mock);
        for _ in 0..13 {
            fusion.process(&blank(), &ColorProfile::default());
        }
        assert_eq!(fusion.frames_processed(), 13);
    }

    #[test]
    fn test_valid_heavy_is_returned_verbatim() {
        let mut mock = MockHeavyDetector::new();
        mock.expect_detect().returning(|_| Ok(vec![ball(10.0, 10.0, 20.0)]));
        let mut fusion = fusion_with(mock);

        let result = fusion.process(&blank(), &ColorProfile::default());
        assert_eq!(result.source, DetectionSource::Heavy);
        assert_eq!(result.chosen, Some(RawDetection::Box(ball(10.0, 10.0, 20.0))));
        assert_eq!(result.heavy_age, Some(0));
        assert!(result.valid_heavy().is_some());
    }

    #[test]
    fn test_heavy_expires_after_ttl() {
        let mut mock = MockHeavyDetector::new();
        let mut calls = 0;
        mock.expect_detect().returning(move |_| {
            calls += 1;
            if calls == 1 {
                Ok(vec![ball(10.0, 10.0, 20.0)])
            } else {
                Ok(vec![])
            }
        });
        let mut fusion = fusion_with(mock);

        // TTL is 12 frames: indices 0..=12 trust the cached box, 13 does not
        for index in 0..=12u64 {
            let result = fusion.process(&blank(), &ColorProfile::default());
            assert_eq!(result.source, DetectionSource::Heavy, "frame {}", index);
        }
        let result = fusion.process(&blank(), &ColorProfile::default());
        assert_eq!(result.heavy_age, Some(13));
        assert!(!result.heavy_valid);
        assert_eq!(result.source, DetectionSource::None);
        assert!(result.chosen.is_none());
        assert!(result.last_heavy.is_some());
    }

    #[test]
    fn test_non_target_classes_are_ignored() {
        let mut mock = MockHeavyDetector::new();
        mock.expect_detect().returning(|_| {
            Ok(vec![BoxDetection::new(BBox::new(0.0, 0.0, 10.0, 10.0), 0.99, "person")])
        });
        let mut fusion = fusion_with(mock);
        let result = fusion.process(&blank(), &ColorProfile::default());
        assert!(result.last_heavy.is_none());
        assert_eq!(result.source, DetectionSource::None);
    }

    #[test]
    fn test_heavy_failure_keeps_cache() {
        let mut mock = MockHeavyDetector::new();
        let mut calls = 0;
        mock.expect_detect().returning(move |_| {
            calls += 1;
            if calls == 1 {
                Ok(vec![ball(5.0, 5.0, 10.0)])
            } else {
                Err(BotError::Model("inference failed".to_string()))
            }
        });
        let mut fusion = fusion_with(mock);
        for _ in 0..7 {
            fusion.process(&blank(), &ColorProfile::default());
        }
        let result = fusion.process(&blank(), &ColorProfile::default());
        assert_eq!(result.heavy_age, Some(7));
        assert_eq!(result.source, DetectionSource::Heavy);
    }

    #[test]
    fn test_color_fills_gap_without_heavy() {
        let mut mock = MockHeavyDetector::new();
        mock.expect_detect().returning(|_| Ok(vec![]));
        let mut fusion = LocalizationFusion::new(
            Box::new(mock),
            FusionConfig {
                min_contour_area: 500.0,
                ..FusionConfig::default()
            },
            &DetectorConfig::default(),
        );
        let frame = Frame::filled(320, 240, [40, 40, 40]).with_disc((100.0, 100.0), 30.0, [180, 220, 40]);
        let result = fusion.process(&frame, &ColorProfile::default());
        assert_eq!(result.source, DetectionSource::Fast);
        match result.chosen {
            Some(RawDetection::Circle(circle)) => assert!(circle.accepted),
            other => panic!("expected a circle, got {:?}", other),
        }
    }
}
