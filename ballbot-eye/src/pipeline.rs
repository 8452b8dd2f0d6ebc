//! The cooperative chase loop: ingest, fuse, calibrate, decide, dispatch

use crate::calibration::{CalibrationStatus, OnlineCalibrator};
use crate::config::{BotConfig, RuntimeConfig};
use crate::controller::{Command, MotionController};
use crate::detection::{distance_sq, DetectionSource};
use crate::dispatch::{CommandDispatcher, SendOutcome};
use crate::error::BotError;
use crate::frame::Frame;
use crate::models::HeavyDetector;
use crate::processing::{ColorProfile, FusionResult, LocalizationFusion};
use crate::stream::StreamSource;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Every N-th cycle logs a heavy/color comparison line
const COMPARE_EVERY: u64 = 10;

/// What one control cycle did
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// `None` when the frame was stale and fusion was skipped
    pub fusion: Option<FusionResult>,
    pub near: bool,
    pub command: Command,
    pub outcome: SendOutcome,
}

/// Owns every component and runs them in one cooperative loop
pub struct ChaseLoop {
    runtime: RuntimeConfig,
    stream_url: String,
    position_tolerance: f32,
    source: StreamSource,
    fusion: LocalizationFusion,
    calibrator: OnlineCalibrator,
    controller: MotionController,
    dispatcher: CommandDispatcher,
    last_frame: Option<Arc<Frame>>,
    cycles: u64,
    last_status: Option<CalibrationStatus>,
}

impl ChaseLoop {
    pub fn new(config: &BotConfig, heavy: Box<dyn HeavyDetector>) -> Self {
        let profile = ColorProfile::from(&config.color);
        Self {
            runtime: config.runtime.clone(),
            stream_url: config.stream.url.clone(),
            position_tolerance: config.calibration.position_tolerance_px,
            source: StreamSource::new(config.stream.clone()),
            fusion: LocalizationFusion::new(heavy, config.fusion.clone(), &config.detector),
            calibrator: OnlineCalibrator::new(config.calibration.clone(), profile, config.fusion.clone()),
            controller: MotionController::new(config.control.clone()),
            dispatcher: CommandDispatcher::new(config.dispatch.clone()),
            last_frame: None,
            cycles: 0,
            last_status: None,
        }
    }

    pub fn controller(&self) -> &MotionController {
        &self.controller
    }

    pub fn calibrator(&self) -> &OnlineCalibrator {
        &self.calibrator
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    pub fn source(&self) -> &StreamSource {
        &self.source
    }

    /// Connect the stream and prepare the dispatcher
    pub async fn start(&mut self) -> Result<(), BotError> {
        self.dispatcher.initialize()?;
        let url = self.stream_url.clone();
        self.source.start(&url).await?;
        info!("Chase loop started");
        Ok(())
    }

    /// Run until `shutdown` resolves or the stream closes, then stop the robot
    pub async fn run<F>(&mut self, shutdown: F) -> Result<(), BotError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            if !self.source.is_opened() {
                warn!("Stream is no longer open, leaving chase loop");
                break;
            }

            let pause = self.poll_once(Instant::now());

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }

        self.shutdown().await
    }

    /// Process the newest frame if there is one; returns how long to pause
    fn poll_once(&mut self, now: Instant) -> Duration {
        let Some(frame) = self.source.frame() else {
            return self.runtime.idle_sleep();
        };

        let is_new = self
            .last_frame
            .as_ref()
            .map_or(true, |seen| !Arc::ptr_eq(seen, &frame));
        if is_new {
            self.last_frame = Some(frame.clone());
            self.step(&frame, now);
            return self.runtime.loop_sleep();
        }

        // Stream stalled: keep the controller's timers running
        if now.saturating_duration_since(frame.captured_at()) > self.runtime.stale_frame_timeout() {
            self.idle_cycle(frame.width(), now);
        }
        self.runtime.idle_sleep()
    }

    /// One full control cycle on `frame`
    pub fn step(&mut self, frame: &Frame, now: Instant) -> CycleReport {
        self.cycles += 1;

        if now.saturating_duration_since(frame.captured_at()) > self.runtime.stale_frame_timeout() {
            debug!("Frame is stale, treating as no detection");
            return self.idle_cycle(frame.width(), now);
        }

        let fusion = self.fusion.process(frame, self.calibrator.profile());
        let near = self
            .calibrator
            .observe(frame, fusion.valid_heavy(), fusion.color.as_ref());

        let command = self.controller.decide_at(fusion.chosen.as_ref(), frame.width(), now);
        let outcome = self.dispatcher.send_command(command);

        if self.cycles % COMPARE_EVERY == 0 {
            self.log_comparison(&fusion, near);
        }
        self.log_calibration_change();

        CycleReport {
            fusion: Some(fusion),
            near,
            command,
            outcome,
        }
    }

    fn idle_cycle(&mut self, frame_width: u32, now: Instant) -> CycleReport {
        let command = self.controller.decide_at(None, frame_width, now);
        let outcome = self.dispatcher.send_command(command);
        CycleReport {
            fusion: None,
            near: false,
            command,
            outcome,
        }
    }

    fn log_comparison(&self, fusion: &FusionResult, near: bool) {
        let heavy = fusion.valid_heavy().map(|h| h.bbox.center());
        let color = fusion.color.as_ref().map(|c| c.center);
        let dist = match (heavy, color) {
            (Some(h), Some(c)) => Some(distance_sq(h, c).sqrt()),
            _ => None,
        };
        let used = match fusion.source {
            DetectionSource::Heavy => "heavy",
            DetectionSource::Fast => "fast",
            DetectionSource::None => "none",
        };
        debug!(
            "compare used={} heavy={:?} color={:?} dist={:?} near={} tol={} state={}",
            used,
            heavy,
            color,
            dist.map(|d| (d * 10.0).round() / 10.0),
            near,
            self.position_tolerance,
            self.controller.state()
        );
    }

    fn log_calibration_change(&mut self) {
        let status = self.calibrator.status();
        let tuned = self.calibrator.is_tuned();
        let changed = match self.last_status {
            Some(last) => {
                last.dumped != status.dumped || (last.same_place_count >= last.same_place_needed) != tuned
            }
            None => false,
        };
        if changed {
            info!(
                "Calibration same-place {}/{} consecutive {}/{} dumped={}",
                status.same_place_count,
                status.same_place_needed,
                status.consecutive_correct,
                status.correct_needed,
                status.dumped
            );
        }
        self.last_status = Some(status);
    }

    /// Stop the robot, close the dispatcher and release the stream
    pub async fn shutdown(&mut self) -> Result<(), BotError> {
        if self.dispatcher.is_initialized() {
            if let Err(e) = self.dispatcher.send_immediate(Command::stop()).await {
                warn!("Failed to send final stop: {}", e);
            }
        }
        self.dispatcher.close();
        let result = self.source.stop().await;
        info!("Chase loop stopped after {} cycles", self.cycles);
        result
    }
}
