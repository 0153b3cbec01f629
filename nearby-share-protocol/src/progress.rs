//! Progress & Metrics
//!
//! Derives percentage, smoothed throughput and ETA from the byte counter
//! of the active session, and decides when a new snapshot is worth
//! publishing.
//!
//! Throughput is an exponentially smoothed average: each sample of
//! `bytes / dt` is blended in with weight `1 - e^(-dt / window)`, so the
//! displayed speed follows real changes within about one window without
//! jumping on every chunk.
//!
//! Time is passed in explicitly so the arithmetic can be tested without
//! sleeping.
//!
//! [`SessionPublisher`] is the single writer of the observable session: the
//! session task feeds it state transitions and pipeline counters, and it
//! publishes snapshots to the watch channel at the tracker's cadence.

use crate::config::ProgressConfig;
use crate::pipeline::TransferObserver;
use crate::session::{FailureKind, SessionStatus, TransferSession};
use crate::Result;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Samples shorter than this are merged into the next one
const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(50);

/// Derived metrics at one instant
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    /// Fraction in `[0, 1]`
    pub progress: f64,
    /// Smoothed bytes per second
    pub speed: f64,
    /// Absent while the speed is zero
    pub eta: Option<Duration>,
}

/// Byte counter with smoothed speed and bounded publication cadence
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    config: ProgressConfig,
    total_bytes: u64,
    bytes_transferred: u64,
    speed: f64,
    has_speed: bool,
    sample_start: Instant,
    pending_bytes: u64,
    last_emit: Option<Instant>,
    chunks_since_emit: u32,
}

impl ProgressTracker {
    pub fn new(total_bytes: u64, config: ProgressConfig, now: Instant) -> Self {
        Self {
            config,
            total_bytes,
            bytes_transferred: 0,
            speed: 0.0,
            has_speed: false,
            sample_start: now,
            pending_bytes: 0,
            last_emit: None,
            chunks_since_emit: 0,
        }
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    /// Count `bytes` more transferred at `now`
    ///
    /// The counter saturates at the total. Returns a snapshot when one is
    /// due: on the first chunk, once the emit interval has passed, after
    /// every `emit_every_chunks` chunks, and when the total is reached.
    pub fn record(&mut self, bytes: u64, now: Instant) -> Option<ProgressSnapshot> {
        let before = self.bytes_transferred;
        self.bytes_transferred = self
            .bytes_transferred
            .saturating_add(bytes)
            .min(self.total_bytes);
        self.pending_bytes += self.bytes_transferred - before;
        self.chunks_since_emit = self.chunks_since_emit.saturating_add(1);

        self.update_speed(now);

        let due = match self.last_emit {
            None => true,
            Some(last) => {
                now.saturating_duration_since(last) >= self.config.emit_interval
                    || self.chunks_since_emit >= self.config.emit_every_chunks
                    || self.bytes_transferred == self.total_bytes
            }
        };

        if due {
            self.last_emit = Some(now);
            self.chunks_since_emit = 0;
            Some(self.snapshot())
        } else {
            None
        }
    }

    fn update_speed(&mut self, now: Instant) {
        let dt = now.saturating_duration_since(self.sample_start);
        if dt < MIN_SAMPLE_INTERVAL {
            return;
        }

        let seconds = dt.as_secs_f64();
        let rate = self.pending_bytes as f64 / seconds;
        if self.has_speed {
            let tau = self.config.speed_window.as_secs_f64().max(f64::EPSILON);
            let alpha = 1.0 - (-seconds / tau).exp();
            self.speed += alpha * (rate - self.speed);
        } else {
            self.speed = rate;
            self.has_speed = true;
        }

        self.sample_start = now;
        self.pending_bytes = 0;
    }

    /// Metrics as of the last recorded chunk
    pub fn snapshot(&self) -> ProgressSnapshot {
        let progress = if self.total_bytes == 0 {
            0.0
        } else {
            self.bytes_transferred as f64 / self.total_bytes as f64
        };

        let remaining = self.total_bytes - self.bytes_transferred;
        let eta = if self.speed > 0.0 {
            Duration::try_from_secs_f64(remaining as f64 / self.speed).ok()
        } else {
            None
        };

        ProgressSnapshot {
            bytes_transferred: self.bytes_transferred,
            total_bytes: self.total_bytes,
            progress,
            speed: self.speed,
            eta,
        }
    }
}

/// Owns the active session and publishes it to observers
#[derive(Debug)]
pub struct SessionPublisher {
    session: TransferSession,
    config: ProgressConfig,
    tracker: ProgressTracker,
    state: watch::Sender<Option<TransferSession>>,
}

impl SessionPublisher {
    /// Take ownership of a session and publish it
    pub fn new(
        session: TransferSession,
        config: ProgressConfig,
        state: watch::Sender<Option<TransferSession>>,
    ) -> Self {
        let tracker = ProgressTracker::new(session.total_bytes, config.clone(), Instant::now());
        let publisher = Self {
            session,
            config,
            tracker,
            state,
        };
        publisher.publish();
        publisher
    }

    pub fn session(&self) -> &TransferSession {
        &self.session
    }

    /// Move the session forward and publish the change
    pub fn advance(&mut self, status: SessionStatus) -> Result<()> {
        self.session.advance(status)?;
        if status == SessionStatus::Transferring {
            // Measure throughput from the first chunk, not from connect
            self.tracker =
                ProgressTracker::new(self.session.total_bytes, self.config.clone(), Instant::now());
        }
        if status.is_terminal() {
            info!(
                "Session {} with {} {} ({}/{} bytes)",
                self.session.session_id,
                self.session.peer.display_name,
                status,
                self.session.bytes_transferred_total,
                self.session.total_bytes
            );
        } else {
            debug!("Session {} -> {}", self.session.session_id, status);
        }
        self.publish();
        Ok(())
    }

    /// End the session as failed and publish it
    pub fn fail(&mut self, failure: FailureKind) -> Result<()> {
        self.session.failure = Some(failure);
        if let Err(e) = self.advance(SessionStatus::Failed) {
            self.session.failure = None;
            return Err(e);
        }
        Ok(())
    }

    fn publish(&self) {
        self.state.send_replace(Some(self.session.clone()));
    }
}

impl TransferObserver for SessionPublisher {
    fn on_bytes(&mut self, bytes: u64) {
        let snapshot = self.tracker.record(bytes, Instant::now());
        if let Err(e) = self
            .session
            .set_bytes_transferred(self.tracker.bytes_transferred())
        {
            warn!("Ignoring progress update: {}", e);
        }

        if let Some(snapshot) = snapshot {
            self.session.instantaneous_speed = snapshot.speed;
            self.session.eta = snapshot.eta;
            self.publish();
        }
    }

    fn on_file_completed(&mut self, index: usize) {
        if let Err(e) = self.session.set_current_file(index + 1) {
            warn!("Ignoring file index update: {}", e);
            return;
        }
        let snapshot = self.tracker.snapshot();
        self.session.instantaneous_speed = snapshot.speed;
        self.session.eta = snapshot.eta;
        self.publish();
    }
}
