//! Four-state motion controller

use crate::config::{ControlConfig, Side};
use crate::detection::RawDetection;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Locomotion direction understood by the motor firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Backward,
    Left,
    Right,
    Stop,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Backward => "backward",
            Direction::Left => "left",
            Direction::Right => "right",
            Direction::Stop => "stop",
        }
    }
}

impl From<Side> for Direction {
    fn from(side: Side) -> Self {
        match side {
            Side::Left => Direction::Left,
            Side::Right => Direction::Right,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forward" => Ok(Direction::Forward),
            "backward" => Ok(Direction::Backward),
            "left" => Ok(Direction::Left),
            "right" => Ok(Direction::Right),
            "stop" => Ok(Direction::Stop),
            other => Err(format!("Unknown direction '{}'", other)),
        }
    }
}

/// One motor command; compared by value for de-duplication
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub direction: Direction,
    pub speed: u8,
    /// 0 drives straight, 1 pivots in place
    pub turn_ratio: f32,
}

impl Command {
    pub fn new(direction: Direction, speed: u8, turn_ratio: f32) -> Self {
        let turn_ratio = if turn_ratio.is_finite() {
            turn_ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            direction,
            speed,
            turn_ratio,
        }
    }

    pub fn stop() -> Self {
        Self::new(Direction::Stop, 0, 0.0)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {:.2})", self.direction, self.speed, self.turn_ratio)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControllerState {
    /// No confirmed ball; rotate toward the last known side
    Searching,
    /// Ball freshly seen; waiting for a run of sightings
    Confirming,
    /// Driving toward the ball
    Approaching,
    /// Ball held at the front
    Captured,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerState::Searching => "SEARCHING",
            ControllerState::Confirming => "CONFIRMING",
            ControllerState::Approaching => "APPROACHING",
            ControllerState::Captured => "CAPTURED",
        };
        f.write_str(name)
    }
}

/// Maps fused detections to motor commands.
///
/// Time only enters through the `now` argument of [`decide_at`](Self::decide_at),
/// so identical inputs always yield identical command sequences.
pub struct MotionController {
    config: ControlConfig,
    state: ControllerState,
    confirmation_count: u32,
    sweep_side: Side,
    grace_started: Option<Instant>,
    lost_since: Option<Instant>,
    last_known_side: Option<Side>,
    last_detection: Option<RawDetection>,
    last_command: Command,
}

impl MotionController {
    pub fn new(config: ControlConfig) -> Self {
        let sweep_side = config.default_search_side;
        Self {
            config,
            state: ControllerState::Searching,
            confirmation_count: 0,
            sweep_side,
            grace_started: None,
            lost_since: None,
            last_known_side: None,
            last_detection: None,
            last_command: Command::stop(),
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn confirmation_count(&self) -> u32 {
        self.confirmation_count
    }

    pub fn last_known_side(&self) -> Option<Side> {
        self.last_known_side
    }

    pub fn last_detection(&self) -> Option<&RawDetection> {
        self.last_detection.as_ref()
    }

    /// Forget everything and start searching again
    pub fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }

    /// Decide using the current wall clock
    pub fn decide(&mut self, detection: Option<&RawDetection>, frame_width: u32) -> Command {
        self.decide_at(detection, frame_width, Instant::now())
    }

    /// One decision cycle at time `now`
    pub fn decide_at(&mut self, detection: Option<&RawDetection>, frame_width: u32, now: Instant) -> Command {
        let command = match detection {
            Some(det) => self.on_sighting(det, frame_width),
            None => self.on_miss(now),
        };
        self.last_command = command;
        command
    }

    fn on_sighting(&mut self, det: &RawDetection, frame_width: u32) -> Command {
        self.lost_since = None;
        self.grace_started = None;

        let search_side = self.search_side();
        let x = normalized_x(det, frame_width);
        self.last_known_side = Some(self.ball_side(x));
        self.last_detection = Some(det.clone());

        match self.state {
            ControllerState::Searching => {
                self.transition(ControllerState::Confirming);
                self.confirmation_count = 0;
                // First correction sweeps back against the search rotation
                self.sweep_side = search_side;
                self.confirm(det, x)
            }
            ControllerState::Confirming => self.confirm(det, x),
            ControllerState::Approaching => self.approach(det, x),
            ControllerState::Captured => self.hold(det, x),
        }
    }

    fn on_miss(&mut self, now: Instant) -> Command {
        let lost_since = *self.lost_since.get_or_insert(now);
        let lost_for = now.saturating_duration_since(lost_since);

        if self.state != ControllerState::Searching
            && lost_for >= Duration::from_millis(self.config.ball_lost_timeout_ms)
        {
            debug!("Ball lost for {:?}", lost_for);
            self.enter_searching();
            return self.search_command();
        }

        match self.state {
            ControllerState::Searching => self.search_command(),
            ControllerState::Confirming => {
                let started = *self.grace_started.get_or_insert(now);
                if now.saturating_duration_since(started) > self.grace_period() {
                    debug!(
                        "Confirmation grace expired at {}/{}",
                        self.confirmation_count, self.config.confirmation_threshold
                    );
                    self.enter_searching();
                    self.search_command()
                } else {
                    Command::stop()
                }
            }
            // Keep the last steering while the ball is briefly out of view
            ControllerState::Approaching => self.last_command,
            ControllerState::Captured => Command::stop(),
        }
    }

    fn confirm(&mut self, det: &RawDetection, x: f32) -> Command {
        self.confirmation_count += 1;
        let threshold = self.config.confirmation_threshold.max(1);
        if self.confirmation_count >= threshold {
            self.transition(ControllerState::Approaching);
            return self.approach(det, x);
        }

        self.sweep_side = self.sweep_side.opposite();
        let progress = self.confirmation_count as f32 / threshold as f32;
        let top = self.config.search_turn_speed as f32;
        let floor = (self.config.min_adjustment_speed as f32).min(top);
        let speed = (top - (top - floor) * progress).max(floor);
        self.turn(self.sweep_side, speed, 1.0)
    }

    fn approach(&mut self, det: &RawDetection, x: f32) -> Command {
        if det.area() > self.config.captured_area_threshold {
            self.transition(ControllerState::Captured);
            return Command::new(Direction::Forward, self.speed(self.config.approach_speed as f32 * 0.5), 0.0);
        }

        let side = self.ball_side(x);
        if x < self.config.target_zone_x_min || x > self.config.target_zone_x_max {
            self.turn(side, self.config.search_turn_speed as f32, 1.0)
        } else if self.is_centered(x) {
            Command::new(Direction::Forward, self.speed(self.config.approach_speed as f32), 0.0)
        } else {
            self.turn(side, self.config.approach_speed as f32, self.config.approach_turn_ratio)
        }
    }

    fn hold(&mut self, det: &RawDetection, x: f32) -> Command {
        let release = self.config.captured_area_threshold * self.config.capture_release_ratio;
        if det.area() < release {
            self.transition(ControllerState::Approaching);
            return self.approach(det, x);
        }

        let dribble = self.config.dribble_speed as f32;
        if self.is_centered(x) {
            Command::new(Direction::Forward, self.speed(dribble), 0.0)
        } else {
            self.turn(self.ball_side(x), dribble, self.config.dribble_turn_ratio)
        }
    }

    fn search_command(&self) -> Command {
        self.turn(self.search_side(), self.config.search_turn_speed as f32, 1.0)
    }

    fn search_side(&self) -> Side {
        self.last_known_side.unwrap_or(self.config.default_search_side)
    }

    /// Grace window shrinks with confidence, never below the floor fraction
    fn grace_period(&self) -> Duration {
        let base = self.config.max_adjustment_timeout_ms as f32;
        let threshold = self.config.confirmation_threshold.max(1) as f32;
        let confidence = (self.confirmation_count as f32 / threshold).clamp(0.0, 1.0);
        let floor = base * self.config.grace_floor_fraction.clamp(0.0, 1.0);
        Duration::from_millis((base * (1.0 - confidence)).max(floor) as u64)
    }

    fn is_centered(&self, x: f32) -> bool {
        (x - 0.5).abs() <= self.config.center_band
    }

    /// Side of the robot the ball is on, given its position in the image
    fn ball_side(&self, x: f32) -> Side {
        let side = if x < 0.5 { Side::Left } else { Side::Right };
        if self.config.invert_turns {
            side.opposite()
        } else {
            side
        }
    }

    fn turn(&self, side: Side, speed: f32, turn_ratio: f32) -> Command {
        Command::new(side.into(), self.speed(speed), turn_ratio)
    }

    fn speed(&self, value: f32) -> u8 {
        let lo = self.config.min_speed as f32;
        let hi = self.config.max_speed as f32;
        if !value.is_finite() {
            return self.config.min_speed;
        }
        value.round().clamp(lo, hi) as u8
    }

    fn enter_searching(&mut self) {
        self.transition(ControllerState::Searching);
        self.confirmation_count = 0;
        self.grace_started = None;
    }

    fn transition(&mut self, next: ControllerState) {
        if self.state != next {
            info!("Controller {} -> {}", self.state, next);
            self.state = next;
        }
    }
}

/// Ball center as a fraction of the frame width
fn normalized_x(det: &RawDetection, frame_width: u32) -> f32 {
    let width = frame_width.max(1) as f32;
    let x = det.center().0 / width;
    if x.is_finite() {
        x.clamp(0.0, 1.0)
    } else {
        0.5
    }
}
