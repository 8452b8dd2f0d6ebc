//! Motion controller state machine tests

use ballbot_eye::config::ControlConfig;
use ballbot_eye::controller::{Command, ControllerState, Direction, MotionController};
use ballbot_eye::detection::{BBox, BoxDetection, CircleDetection, RawDetection};
use proptest::prelude::*;
use std::time::{Duration, Instant};

const WIDTH: u32 = 640;

fn heavy_ball(cx: f32, size: f32) -> RawDetection {
    RawDetection::Box(BoxDetection::new(
        BBox::new(cx - size / 2.0, 240.0 - size / 2.0, size, size),
        0.8,
        "sports ball",
    ))
}

fn color_ball(cx: f32, radius: f32) -> RawDetection {
    let bbox = BBox::new(cx - radius, 240.0 - radius, radius * 2.0, radius * 2.0);
    RawDetection::Circle(CircleDetection {
        center: (cx, 240.0),
        radius,
        bbox,
        area: std::f32::consts::PI * radius * radius,
        circularity: 0.9,
        iou: None,
        score: 0.9,
        accepted: true,
    })
}

fn approaching(config: ControlConfig, now: Instant) -> MotionController {
    let threshold = config.confirmation_threshold;
    let mut controller = MotionController::new(config);
    for _ in 0..threshold {
        controller.decide_at(Some(&heavy_ball(320.0, 40.0)), WIDTH, now);
    }
    assert_eq!(controller.state(), ControllerState::Approaching);
    controller
}

#[test]
fn test_searching_without_detection_turns_right() {
    let config = ControlConfig::default();
    let speed = config.search_turn_speed;
    let mut controller = MotionController::new(config);
    let start = Instant::now();

    for i in 0..50 {
        let cmd = controller.decide_at(None, WIDTH, start + Duration::from_millis(i * 33));
        assert_eq!(cmd, Command::new(Direction::Right, speed, 1.0));
        assert_eq!(controller.state(), ControllerState::Searching);
    }
}

#[test]
fn test_tenth_sighting_starts_approach() {
    let config = ControlConfig {
        confirmation_threshold: 10,
        ..ControlConfig::default()
    };
    let approach_speed = config.approach_speed;
    let mut controller = MotionController::new(config);
    let now = Instant::now();

    for i in 1..10 {
        controller.decide_at(Some(&heavy_ball(320.0, 40.0)), WIDTH, now);
        assert_eq!(controller.state(), ControllerState::Confirming, "call {}", i);
    }

    let cmd = controller.decide_at(Some(&heavy_ball(320.0, 40.0)), WIDTH, now);
    assert_eq!(controller.state(), ControllerState::Approaching);
    assert_eq!(cmd, Command::new(Direction::Forward, approach_speed, 0.0));
}

#[test]
fn test_large_ball_is_captured_in_one_cycle() {
    let config = ControlConfig {
        captured_area_threshold: 40_000.0,
        ..ControlConfig::default()
    };
    let approach_speed = config.approach_speed;
    let now = Instant::now();
    let mut controller = approaching(config, now);

    let cmd = controller.decide_at(Some(&heavy_ball(320.0, 300.0)), WIDTH, now);
    assert_eq!(controller.state(), ControllerState::Captured);
    assert_eq!(cmd, Command::new(Direction::Forward, approach_speed / 2, 0.0));
}

#[test]
fn test_color_detection_drives_controller_too() {
    let now = Instant::now();
    let mut controller = approaching(ControlConfig::default(), now);

    // Default camera is mirrored: image left means turn right
    let cmd = controller.decide_at(Some(&color_ball(40.0, 12.0)), WIDTH, now);
    assert_eq!(cmd.direction, Direction::Right);
    assert_eq!(cmd.turn_ratio, 1.0);

    let cmd = controller.decide_at(Some(&color_ball(600.0, 12.0)), WIDTH, now);
    assert_eq!(cmd.direction, Direction::Left);
}

#[test]
fn test_far_left_ball_turns_right_by_default() {
    let config = ControlConfig::default();
    let speed = config.search_turn_speed;
    let now = Instant::now();
    let mut controller = approaching(config, now);

    let cmd = controller.decide_at(Some(&heavy_ball(64.0, 40.0)), WIDTH, now);
    assert_eq!(cmd, Command::new(Direction::Right, speed, 1.0));
}

#[test]
fn test_captured_ball_is_dribbled_at_dribble_speed() {
    let config = ControlConfig {
        captured_area_threshold: 40_000.0,
        dribble_speed: 150,
        ..ControlConfig::default()
    };
    let turn_ratio = config.dribble_turn_ratio;
    let now = Instant::now();
    let mut controller = approaching(config, now);

    controller.decide_at(Some(&heavy_ball(320.0, 300.0)), WIDTH, now);
    assert_eq!(controller.state(), ControllerState::Captured);

    let cmd = controller.decide_at(Some(&heavy_ball(320.0, 300.0)), WIDTH, now);
    assert_eq!(cmd, Command::new(Direction::Forward, 150, 0.0));

    let cmd = controller.decide_at(Some(&heavy_ball(500.0, 300.0)), WIDTH, now);
    assert_eq!(cmd, Command::new(Direction::Left, 150, turn_ratio));
}

#[test]
fn test_lost_ball_resumes_search_towards_last_side() {
    let config = ControlConfig::default();
    let lost_timeout = Duration::from_millis(config.ball_lost_timeout_ms);
    let start = Instant::now();
    let mut controller = approaching(config, start);

    // Ball last seen on the right of the image, which is the robot's left
    controller.decide_at(Some(&heavy_ball(540.0, 40.0)), WIDTH, start);
    controller.decide_at(None, WIDTH, start + Duration::from_millis(10));
    assert_eq!(controller.state(), ControllerState::Approaching);

    let cmd = controller.decide_at(None, WIDTH, start + Duration::from_millis(10) + lost_timeout);
    assert_eq!(controller.state(), ControllerState::Searching);
    assert_eq!(cmd.direction, Direction::Left);
    assert_eq!(cmd.turn_ratio, 1.0);
}

#[test]
fn test_confirmation_grace_expires() {
    let config = ControlConfig::default();
    let grace = Duration::from_millis(config.max_adjustment_timeout_ms);
    let start = Instant::now();
    let mut controller = MotionController::new(config);

    controller.decide_at(Some(&heavy_ball(320.0, 40.0)), WIDTH, start);
    assert_eq!(controller.state(), ControllerState::Confirming);

    let cmd = controller.decide_at(None, WIDTH, start + Duration::from_millis(1));
    assert_eq!(cmd, Command::stop());
    assert_eq!(controller.state(), ControllerState::Confirming);

    controller.decide_at(None, WIDTH, start + grace + Duration::from_millis(5));
    assert_eq!(controller.state(), ControllerState::Searching);
    assert_eq!(controller.confirmation_count(), 0);
}

#[test]
fn test_speeds_stay_within_bounds() {
    let config = ControlConfig {
        min_speed: 60,
        max_speed: 110,
        approach_speed: 200,
        ..ControlConfig::default()
    };
    let now = Instant::now();
    let mut controller = MotionController::new(config);
    for i in 0..40 {
        let x = (i * 53 % WIDTH) as f32;
        let cmd = controller.decide_at(Some(&heavy_ball(x, 40.0)), WIDTH, now);
        assert!((60..=110).contains(&cmd.speed), "speed {}", cmd.speed);
    }
}

#[derive(Debug, Clone)]
enum Input {
    Seen { x: f32, size: f32 },
    Missing,
}

fn input() -> impl Strategy<Value = (Input, u64)> {
    let event = prop_oneof![
        (0.0f32..640.0, 5.0f32..1500.0).prop_map(|(x, size)| Input::Seen { x, size }),
        Just(Input::Missing),
    ];
    (event, 0u64..400)
}

fn replay(inputs: &[(Input, u64)], start: Instant) -> Vec<(Command, ControllerState)> {
    let mut controller = MotionController::new(ControlConfig::default());
    let mut now = start;
    inputs
        .iter()
        .map(|(event, step_ms)| {
            now += Duration::from_millis(*step_ms);
            let detection = match event {
                Input::Seen { x, size } => Some(heavy_ball(*x, *size)),
                Input::Missing => None,
            };
            let cmd = controller.decide_at(detection.as_ref(), WIDTH, now);
            (cmd, controller.state())
        })
        .collect()
}

proptest! {
    #[test]
    fn prop_identical_inputs_identical_commands(inputs in prop::collection::vec(input(), 1..80)) {
        let start = Instant::now();
        let first = replay(&inputs, start);
        let second = replay(&inputs, start);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_commands_are_well_formed(inputs in prop::collection::vec(input(), 1..80)) {
        let config = ControlConfig::default();
        for (cmd, _) in replay(&inputs, Instant::now()) {
            prop_assert!((0.0..=1.0).contains(&cmd.turn_ratio));
            if cmd.direction != Direction::Stop {
                prop_assert!(cmd.speed >= config.min_speed && cmd.speed <= config.max_speed);
            }
        }
    }
}
