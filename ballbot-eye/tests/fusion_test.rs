//! Localization fusion tests with a scripted heavy detector

use ballbot_eye::config::{DetectorConfig, FusionConfig};
use ballbot_eye::detection::{BBox, BoxDetection, DetectionSource, RawDetection};
use ballbot_eye::error::BotError;
use ballbot_eye::frame::Frame;
use ballbot_eye::models::HeavyDetector;
use ballbot_eye::processing::color::{evaluate_candidate, ContourGeometry};
use ballbot_eye::processing::{ColorProfile, LocalizationFusion};
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Answers by call number; unscripted calls find nothing
struct ScriptedDetector {
    script: HashMap<usize, Result<Vec<BoxDetection>, String>>,
    calls: Arc<AtomicUsize>,
}

impl HeavyDetector for ScriptedDetector {
    fn detect(&mut self, _frame: &Frame) -> Result<Vec<BoxDetection>, BotError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.remove(&call) {
            Some(Ok(detections)) => Ok(detections),
            Some(Err(message)) => Err(BotError::Model(message)),
            None => Ok(Vec::new()),
        }
    }
}

fn fusion(
    script: Vec<(usize, Result<Vec<BoxDetection>, String>)>,
) -> (LocalizationFusion, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let detector = ScriptedDetector {
        script: script.into_iter().collect(),
        calls: calls.clone(),
    };
    let fusion = LocalizationFusion::new(Box::new(detector), FusionConfig::default(), &DetectorConfig::default());
    (fusion, calls)
}

fn ball_box() -> BoxDetection {
    BoxDetection::new(BBox::new(120.0, 80.0, 80.0, 80.0), 0.85, "sports ball")
}

fn blank() -> Frame {
    Frame::filled(320, 240, [40, 40, 40])
}

fn with_ball() -> Frame {
    blank().with_disc((160.0, 120.0), 40.0, [180, 220, 40])
}

#[test]
fn test_heavy_is_authoritative_while_valid() {
    let (mut fusion, calls) = fusion(vec![(0, Ok(vec![ball_box()]))]);
    let profile = ColorProfile::default();

    for index in 0..=12u64 {
        let result = fusion.process(&blank(), &profile);
        assert_eq!(result.frame_index, index);
        assert_eq!(result.source, DetectionSource::Heavy);
        assert_eq!(result.chosen, Some(RawDetection::Box(ball_box())));
        assert_eq!(result.heavy_age, Some(index));
    }

    // Past the TTL of 12 frames with nothing new
    let result = fusion.process(&blank(), &profile);
    assert!(!result.heavy_valid);
    assert!(result.valid_heavy().is_none());
    assert_eq!(result.last_heavy, Some(ball_box()));
    assert_eq!(result.source, DetectionSource::None);
    assert!(result.chosen.is_none());

    // Frames 0, 6 and 12 ran the heavy detector
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(fusion.frames_processed(), 14);
}

#[test]
fn test_color_fills_in_without_heavy() {
    let (mut fusion, _) = fusion(vec![]);
    let result = fusion.process(&with_ball(), &ColorProfile::default());

    assert_eq!(result.source, DetectionSource::Fast);
    let Some(RawDetection::Circle(circle)) = result.chosen else {
        panic!("expected a color detection, got {:?}", result.chosen);
    };
    assert!(circle.accepted);
    assert!(circle.iou.is_none());
    assert!((circle.center.0 - 160.0).abs() < 3.0);
    assert!((circle.center.1 - 120.0).abs() < 3.0);
}

#[test]
fn test_heavy_hint_scores_color_candidate() {
    let (mut fusion, _) = fusion(vec![(0, Ok(vec![ball_box()]))]);
    let result = fusion.process(&with_ball(), &ColorProfile::default());

    assert_eq!(result.source, DetectionSource::Heavy);
    let color = result.color.expect("color candidate inside the heavy box");
    assert!(color.accepted);
    assert!(color.iou.unwrap() > 0.6);
}

#[test]
fn test_detector_error_keeps_previous_box() {
    let (mut fusion, _) = fusion(vec![
        (0, Ok(vec![ball_box()])),
        (1, Err("inference failed".to_string())),
    ]);
    let profile = ColorProfile::default();

    for _ in 0..7 {
        fusion.process(&blank(), &profile);
    }
    // Frame 7: cache from frame 0 survives the failed run on frame 6
    let result = fusion.process(&blank(), &profile);
    assert!(result.heavy_valid);
    assert_eq!(result.heavy_age, Some(7));
}

#[test]
fn test_non_target_classes_ignored() {
    let person = BoxDetection::new(BBox::new(0.0, 0.0, 100.0, 200.0), 0.99, "person");
    let weak_ball = BoxDetection::new(BBox::new(10.0, 10.0, 20.0, 20.0), 0.0005, "sports ball");
    let (mut fusion, _) = fusion(vec![(0, Ok(vec![person, weak_ball]))]);

    let result = fusion.process(&blank(), &ColorProfile::default());
    assert!(result.last_heavy.is_none());
    assert_eq!(result.source, DetectionSource::None);
}

#[test]
fn test_unknown_target_class_falls_back_to_color() {
    let detector = DetectorConfig {
        target_classes: vec!["basketball".to_string()],
        ..DetectorConfig::default()
    };
    let scripted = ScriptedDetector {
        script: [(0, Ok(vec![ball_box()]))].into_iter().collect(),
        calls: Arc::new(AtomicUsize::new(0)),
    };
    let mut fusion = LocalizationFusion::new(Box::new(scripted), FusionConfig::default(), &detector);
    let profile = ColorProfile::default();

    for _ in 0..3 {
        let result = fusion.process(&with_ball(), &profile);
        assert!(result.last_heavy.is_none());
        assert_eq!(result.source, DetectionSource::Fast);
        assert!(matches!(result.chosen, Some(RawDetection::Circle(_))));
    }
}

fn geometry(x: f32, y: f32, w: f32, h: f32, circularity: f32) -> ContourGeometry {
    ContourGeometry {
        center: (x + w / 2.0, y + h / 2.0),
        radius: w.max(h) / 2.0,
        bbox: BBox::new(x, y, w, h),
        area: w * h * 0.78,
        circularity,
    }
}

proptest! {
    #[test]
    fn prop_hinted_acceptance_respects_every_gate(
        x in 0.0f32..600.0,
        y in 0.0f32..440.0,
        w in 1.0f32..300.0,
        h in 1.0f32..300.0,
        circularity in 0.0f32..1.0,
    ) {
        let config = FusionConfig::default();
        let heavy = BBox::new(200.0, 150.0, 100.0, 100.0);
        let candidate = evaluate_candidate(&geometry(x, y, w, h, circularity), Some(&heavy), (640.0, 480.0), &config);

        if candidate.accepted {
            let ratio = candidate.bbox.area() / heavy.area();
            prop_assert!(candidate.iou.unwrap() >= config.iou_min);
            prop_assert!(ratio >= config.area_min_ratio && ratio <= config.area_max_ratio);
            prop_assert!(candidate.circularity >= config.circularity_min);
        }
        prop_assert!(candidate.score.is_finite());
    }
}
