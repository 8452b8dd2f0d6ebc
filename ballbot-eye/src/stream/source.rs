//! Background MJPEG reader with a single latest-frame slot

use crate::config::StreamConfig;
use crate::error::BotError;
use crate::frame::Frame;
use crate::stream::multipart::MultipartParser;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Ingestion counters
#[derive(Debug, Default)]
pub struct StreamStats {
    pub bytes_received: AtomicU64,
    pub frames_decoded: AtomicU64,
    pub decode_failures: AtomicU64,
    pub malformed_parts: AtomicU64,
}

/// Single-slot, latest-wins frame buffer.
///
/// Publication swaps an `Arc<Frame>`, so readers see either the previous or
/// the newest complete frame, never a partial one.
#[derive(Clone)]
pub struct FrameSlot {
    tx: Arc<watch::Sender<Option<Arc<Frame>>>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Replace the slot content
    pub fn publish(&self, frame: Frame) {
        self.tx.send_replace(Some(Arc::new(frame)));
    }

    /// Decode `payload` and publish it; the slot is untouched on failure
    pub fn publish_encoded(&self, payload: &[u8]) -> Result<(), BotError> {
        let frame = Frame::decode(payload)?;
        self.publish(frame);
        Ok(())
    }

    /// Newest frame, if any was published
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.tx.borrow().clone()
    }

    /// Receiver that is notified on every publication
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Frame>>> {
        self.tx.subscribe()
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

struct IngestHandle {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

/// Keeps the newest decoded frame of a multipart HTTP stream
pub struct StreamSource {
    config: StreamConfig,
    slot: FrameSlot,
    opened: Arc<AtomicBool>,
    stats: Arc<StreamStats>,
    task: Option<IngestHandle>,
}

impl StreamSource {
    /// Create a new stream source
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            slot: FrameSlot::new(),
            opened: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(StreamStats::default()),
            task: None,
        }
    }

    /// Connect to `url` and start the background reader.
    ///
    /// Returns once the response headers arrived; frames follow asynchronously.
    pub async fn start(&mut self, url: &str) -> Result<(), BotError> {
        if self.is_opened() {
            return Err(BotError::Stream("Stream already running".to_string()));
        }
        if let Some(stale) = self.task.take() {
            // Previous reader ended on its own; reap it before reconnecting
            let _ = stale.shutdown.send(());
            let _ = stale.join.await;
        }

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(self.config.connect_timeout_ms))
            .pool_max_idle_per_host(1)
            .build()?;

        let response = client
            .get(url)
            .header("Accept", "multipart/x-mixed-replace")
            .send()
            .await
            .map_err(|e| BotError::Stream(format!("Failed to connect to {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(BotError::Stream(format!(
                "Stream {} answered with status {}",
                url,
                response.status()
            )));
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let parser = MultipartParser::new(self.config.boundary.as_bytes(), self.config.max_frame_bytes);
        self.opened.store(true, Ordering::SeqCst);

        let join = tokio::spawn(run_reader(
            response,
            parser,
            self.slot.clone(),
            self.opened.clone(),
            self.stats.clone(),
            shutdown_rx,
        ));
        self.task = Some(IngestHandle {
            shutdown: shutdown_tx,
            join,
        });

        info!("Stream reader started for {}", url);
        Ok(())
    }

    /// Most recent fully decoded frame; never blocks
    pub fn frame(&self) -> Option<Arc<Frame>> {
        self.slot.latest()
    }

    /// Receiver notified whenever a new frame is published
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Frame>>> {
        self.slot.subscribe()
    }

    /// Size of the newest frame
    pub fn frame_dimensions(&self) -> Option<(u32, u32)> {
        self.frame().map(|f| (f.width(), f.height()))
    }

    /// False before `start`, after `stop`, and after the connection dropped
    pub fn is_opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    /// Cancel the reader and wait until the connection is released
    pub async fn stop(&mut self) -> Result<(), BotError> {
        let Some(mut handle) = self.task.take() else {
            return Ok(());
        };

        // The reader may already have exited after a connection error
        let _ = handle.shutdown.send(());
        let result = match tokio::time::timeout(Duration::from_secs(1), &mut handle.join).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BotError::Stream(format!("Stream reader failed: {}", e))),
            Err(_) => {
                handle.join.abort();
                Err(BotError::Stream("Stream reader did not stop within 1s".to_string()))
            }
        };

        self.opened.store(false, Ordering::SeqCst);
        info!("Stream reader stopped");
        result
    }
}

impl Drop for StreamSource {
    fn drop(&mut self) {
        if let Some(handle) = self.task.take() {
            let _ = handle.shutdown.send(());
            handle.join.abort();
        }
    }
}

async fn run_reader(
    mut response: reqwest::Response,
    mut parser: MultipartParser,
    slot: FrameSlot,
    opened: Arc<AtomicBool>,
    stats: Arc<StreamStats>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        let chunk = tokio::select! {
            _ = &mut shutdown => {
                debug!("Stream reader received shutdown");
                break;
            }
            chunk = response.chunk() => chunk,
        };

        match chunk {
            Ok(Some(bytes)) => {
                stats.bytes_received.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                for payload in parser.push(&bytes) {
                    match slot.publish_encoded(&payload) {
                        Ok(()) => {
                            stats.frames_decoded.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                            debug!("Dropping undecodable part ({} bytes): {}", payload.len(), e);
                        }
                    }
                }
                stats.malformed_parts.store(parser.malformed_parts(), Ordering::Relaxed);
            }
            Ok(None) => {
                warn!("Stream ended by peer");
                break;
            }
            Err(e) => {
                error!("Stream read error: {}", e);
                break;
            }
        }
    }

    drop(response);
    opened.store(false, Ordering::SeqCst);
}
