//! ballbot-eye: perception and motion control for a ball-chasing robot
//!
//! Reads the robot's MJPEG camera stream, locates the ball by fusing a
//! cadenced YOLO detector with a per-frame HSV color detector, tunes the
//! color detector online, and drives the motors over HTTP through a
//! four-state controller.

pub mod calibration;
pub mod config;
pub mod controller;
pub mod detection;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod models;
pub mod pipeline;
pub mod processing;
pub mod stream;
mod utils;

pub use calibration::{CalibrationStatus, OnlineCalibrator};
pub use config::BotConfig;
pub use controller::{Command, ControllerState, Direction, MotionController};
pub use detection::{BBox, BoxDetection, CircleDetection, DetectionSource, RawDetection};
pub use dispatch::{CommandDispatcher, DispatchPolicy, DispatchState, DropReason, SendOutcome};
pub use error::BotError;
pub use frame::Frame;
pub use models::{HeavyDetector, YoloDetector};
pub use pipeline::ChaseLoop;
pub use processing::{ColorProfile, FusionResult, LocalizationFusion};
pub use stream::StreamSource;
