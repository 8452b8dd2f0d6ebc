//! Rate-limited motor command dispatch

use crate::config::DispatchConfig;
use crate::controller::{Command, Direction};
use crate::error::BotError;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Why a command was not sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    EmptyDirection,
    UnknownDirection,
    NotInitialized,
    Closed,
    /// Less than the minimum interval since the last successful send
    TooSoon,
    /// Same command sent within the same-command interval
    Duplicate,
    InFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Request launched in the background
    Dispatched,
    Dropped(DropReason),
}

/// Last successful send and the in-flight flag
#[derive(Debug, Clone, Default)]
pub struct DispatchState {
    pub last_sent: Option<(Command, Instant)>,
    pub in_flight: bool,
}

/// Admission rules, independent of any network I/O
#[derive(Debug, Clone, Copy)]
pub struct DispatchPolicy {
    pub min_interval: Duration,
    pub same_command_interval: Duration,
}

impl From<&DispatchConfig> for DispatchPolicy {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            min_interval: Duration::from_millis(config.min_interval_ms),
            same_command_interval: Duration::from_millis(config.same_command_interval_ms),
        }
    }
}

impl DispatchPolicy {
    /// Decide whether `command` may be sent at `now`
    pub fn admit(&self, state: &DispatchState, command: &Command, now: Instant) -> Result<(), DropReason> {
        if let Some((last, at)) = &state.last_sent {
            let elapsed = now.saturating_duration_since(*at);
            if elapsed < self.min_interval {
                return Err(DropReason::TooSoon);
            }
            if last == command && elapsed < self.same_command_interval {
                return Err(DropReason::Duplicate);
            }
        }
        if state.in_flight {
            return Err(DropReason::InFlight);
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct MovePayload {
    direction: &'static str,
    speed: u8,
    turn_ratio: f32,
}

impl From<&Command> for MovePayload {
    fn from(command: &Command) -> Self {
        Self {
            direction: command.direction.as_str(),
            speed: command.speed,
            turn_ratio: command.turn_ratio,
        }
    }
}

/// Dispatch counters
#[derive(Debug, Default)]
pub struct DispatchStats {
    pub sent: AtomicU64,
    pub failed: AtomicU64,
    pub dropped: AtomicU64,
}

/// Fire-and-forget command sender with at most one request in flight
pub struct CommandDispatcher {
    endpoint: String,
    config: DispatchConfig,
    policy: DispatchPolicy,
    client: Option<reqwest::Client>,
    state: Arc<Mutex<DispatchState>>,
    closed: Arc<AtomicBool>,
    /// Bumped on close; completions from an older session are discarded
    session: Arc<AtomicU64>,
    stats: Arc<DispatchStats>,
}

impl CommandDispatcher {
    /// Create an uninitialized dispatcher; sends are dropped until
    /// [`initialize`](Self::initialize) succeeds
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            policy: DispatchPolicy::from(&config),
            config,
            client: None,
            state: Arc::new(Mutex::new(DispatchState::default())),
            closed: Arc::new(AtomicBool::new(false)),
            session: Arc::new(AtomicU64::new(0)),
            stats: Arc::new(DispatchStats::default()),
        }
    }

    /// Build the HTTP client
    pub fn initialize(&mut self) -> Result<(), BotError> {
        if self.client.is_some() {
            return Ok(());
        }
        let connect = Duration::from_millis(self.config.connect_timeout_ms);
        let read = Duration::from_millis(self.config.read_timeout_ms);
        let client = reqwest::Client::builder()
            .connect_timeout(connect)
            .timeout(connect + read)
            .pool_max_idle_per_host(2)
            .build()?;
        self.client = Some(client);
        self.closed.store(false, Ordering::SeqCst);
        info!("Command dispatcher ready for {}", self.endpoint);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.client.is_some()
    }

    pub fn is_in_flight(&self) -> bool {
        self.state.lock().in_flight
    }

    /// Last successfully delivered command
    pub fn last_sent(&self) -> Option<Command> {
        self.state.lock().last_sent.map(|(command, _)| command)
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Send by direction name; empty or unknown names are dropped
    pub fn send(&self, direction: &str, speed: u8, turn_ratio: f32) -> SendOutcome {
        if direction.trim().is_empty() {
            return self.dropped(DropReason::EmptyDirection);
        }
        match direction.parse::<Direction>() {
            Ok(direction) => self.send_command(Command::new(direction, speed, turn_ratio)),
            Err(e) => {
                debug!("{}", e);
                self.dropped(DropReason::UnknownDirection)
            }
        }
    }

    /// Launch `command` in the background if the policy admits it.
    ///
    /// Must be called from within a tokio runtime. Never blocks on the network.
    pub fn send_command(&self, command: Command) -> SendOutcome {
        if self.closed.load(Ordering::SeqCst) {
            return self.dropped(DropReason::Closed);
        }
        let Some(client) = self.client.clone() else {
            return self.dropped(DropReason::NotInitialized);
        };

        let started = Instant::now();
        {
            let mut state = self.state.lock();
            if let Err(reason) = self.policy.admit(&state, &command, started) {
                drop(state);
                return self.dropped(reason);
            }
            state.in_flight = true;
        }

        let endpoint = self.endpoint.clone();
        let state = self.state.clone();
        let current = self.session.clone();
        let session = current.load(Ordering::SeqCst);
        let stats = self.stats.clone();
        tokio::spawn(async move {
            let result = post(&client, &endpoint, &command).await;
            let mut state = state.lock();
            if current.load(Ordering::SeqCst) != session {
                debug!("Ignoring completion of {} from a closed session", command);
                return;
            }
            state.in_flight = false;
            match result {
                Ok(()) => {
                    state.last_sent = Some((command, started));
                    stats.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    warn!("Failed to send {}: {}", command, e);
                }
            }
        });

        SendOutcome::Dispatched
    }

    /// Send `command` now and wait for the answer, bypassing rate limits.
    ///
    /// Used for the final stop on shutdown.
    pub async fn send_immediate(&self, command: Command) -> Result<(), BotError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| BotError::Dispatch("Dispatcher not initialized".to_string()))?;
        let started = Instant::now();
        post(client, &self.endpoint, &command).await?;
        self.state.lock().last_sent = Some((command, started));
        self.stats.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Stop accepting commands; completions of in-flight requests are ignored
    pub fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.session.fetch_add(1, Ordering::SeqCst);
        self.state.lock().in_flight = false;
        self.client = None;
        info!(
            "Command dispatcher closed (sent {}, failed {}, dropped {})",
            self.stats.sent.load(Ordering::Relaxed),
            self.stats.failed.load(Ordering::Relaxed),
            self.stats.dropped.load(Ordering::Relaxed)
        );
    }

    fn dropped(&self, reason: DropReason) -> SendOutcome {
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        if matches!(reason, DropReason::NotInitialized | DropReason::UnknownDirection) {
            debug!("Command dropped: {:?}", reason);
        }
        SendOutcome::Dropped(reason)
    }
}

async fn post(client: &reqwest::Client, endpoint: &str, command: &Command) -> Result<(), BotError> {
    let payload = MovePayload::from(command);
    debug!("Sending {}", serde_json::to_string(&payload).unwrap_or_default());
    let response = client.post(endpoint).json(&payload).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(BotError::Dispatch(format!("Endpoint answered {}", status)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> DispatchPolicy {
        DispatchPolicy::from(&DispatchConfig::default())
    }

    fn forward() -> Command {
        Command::new(Direction::Forward, 120, 0.0)
    }

    #[test]
    fn test_admit_when_nothing_sent() {
        assert!(policy().admit(&DispatchState::default(), &forward(), Instant::now()).is_ok());
    }

    #[test]
    fn test_duplicate_suppressed_within_window() {
        let t0 = Instant::now();
        let state = DispatchState {
            last_sent: Some((forward(), t0)),
            in_flight: false,
        };
        assert_eq!(
            policy().admit(&state, &forward(), t0 + Duration::from_millis(50)),
            Err(DropReason::TooSoon)
        );
        assert_eq!(
            policy().admit(&state, &forward(), t0 + Duration::from_millis(150)),
            Err(DropReason::Duplicate)
        );
        assert!(policy().admit(&state, &forward(), t0 + Duration::from_millis(250)).is_ok());
    }

    #[test]
    fn test_min_interval_applies_to_any_command() {
        let t0 = Instant::now();
        let state = DispatchState {
            last_sent: Some((forward(), t0)),
            in_flight: false,
        };
        let left = Command::new(Direction::Left, 100, 1.0);
        assert_eq!(
            policy().admit(&state, &left, t0 + Duration::from_millis(99)),
            Err(DropReason::TooSoon)
        );
        assert!(policy().admit(&state, &left, t0 + Duration::from_millis(100)).is_ok());
    }

    #[test]
    fn test_in_flight_blocks() {
        let state = DispatchState {
            last_sent: None,
            in_flight: true,
        };
        assert_eq!(
            policy().admit(&state, &forward(), Instant::now()),
            Err(DropReason::InFlight)
        );
    }

    #[test]
    fn test_payload_shape() {
        let json = serde_json::to_value(MovePayload::from(&Command::new(Direction::Left, 90, 0.5))).unwrap();
        assert_eq!(json["direction"], "left");
        assert_eq!(json["speed"], 90);
        assert_eq!(json["turn_ratio"], 0.5);
    }

    #[test]
    fn test_uninitialized_drops() {
        let dispatcher = CommandDispatcher::new(DispatchConfig::default());
        assert_eq!(
            dispatcher.send("forward", 120, 0.0),
            SendOutcome::Dropped(DropReason::NotInitialized)
        );
        assert_eq!(dispatcher.send("", 120, 0.0), SendOutcome::Dropped(DropReason::EmptyDirection));
        assert_eq!(dispatcher.stats().dropped.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_closed_drops() {
        let mut dispatcher = CommandDispatcher::new(DispatchConfig::default());
        dispatcher.initialize().unwrap();
        dispatcher.close();
        assert_eq!(dispatcher.send_command(forward()), SendOutcome::Dropped(DropReason::Closed));
    }
}
