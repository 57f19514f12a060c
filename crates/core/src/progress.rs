//! Job progress events.

use crate::pipeline::JobState;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Job accepted, workspace ready
pub const PROGRESS_STARTED: u8 = 10;
/// Key and key-info written
pub const PROGRESS_KEY_READY: u8 = 30;
/// Duration probe finished (successfully or not)
pub const PROGRESS_PROBED: u8 = 40;
/// Upper bound for values reported while the transcoder runs
pub const PROGRESS_TRANSCODING_MAX: u8 = 69;
/// Transcoder exited and its output was verified
pub const PROGRESS_TRANSCODED: u8 = 70;
/// Archive written
pub const PROGRESS_DONE: u8 = 100;

/// Something a running job reports to its caller
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// Percentage complete, non-decreasing
    Progress(u8),
    /// The job moved to a new state
    State(JobState),
}

/// Sends job events, keeping progress monotonic.
///
/// Cloning shares the high-water mark. A dropped receiver is not an error;
/// events are silently discarded.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: Option<mpsc::UnboundedSender<JobEvent>>,
    high_water: Arc<AtomicU8>,
}

impl ProgressReporter {
    pub fn new(tx: mpsc::UnboundedSender<JobEvent>) -> Self {
        Self {
            tx: Some(tx),
            high_water: Arc::new(AtomicU8::new(0)),
        }
    }

    /// Reporter with a fresh channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Reporter that drops everything
    pub fn disabled() -> Self {
        Self {
            tx: None,
            high_water: Arc::new(AtomicU8::new(0)),
        }
    }

    /// Report `percent` (clamped to 100) unless it would go backwards or repeat
    pub fn progress(&self, percent: u8) {
        let percent = percent.min(PROGRESS_DONE);
        let previous = self.high_water.fetch_max(percent, Ordering::SeqCst);
        if percent > previous {
            self.send(JobEvent::Progress(percent));
        }
    }

    /// Reporter sharing this one's high-water mark but sending nothing
    pub fn detached(&self) -> Self {
        Self {
            tx: None,
            high_water: Arc::clone(&self.high_water),
        }
    }

    pub fn state(&self, state: JobState) {
        self.send(JobEvent::State(state));
    }

    /// Highest progress value reported so far
    pub fn current(&self) -> u8 {
        self.high_water.load(Ordering::SeqCst)
    }

    fn send(&self, event: JobEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

/// Map encoded seconds onto the transcode band between the probed and
/// transcoded checkpoints. Never reaches [`PROGRESS_TRANSCODED`].
pub fn transcode_progress(encoded_secs: f64, duration_secs: f64) -> u8 {
    if duration_secs.is_nan() || duration_secs <= 0.0 || !encoded_secs.is_finite() {
        return PROGRESS_PROBED;
    }
    let fraction = (encoded_secs / duration_secs).clamp(0.0, 1.0);
    let span = f64::from(PROGRESS_TRANSCODING_MAX - PROGRESS_PROBED);
    PROGRESS_PROBED + (fraction * span).floor() as u8
}
