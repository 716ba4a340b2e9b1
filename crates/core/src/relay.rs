use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::timeout;
use tracing::debug;

use crate::models::{ScanProgress, ScanStatus};

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(5);

const TOPIC_CAPACITY: usize = 256;

/// One message of a job's progress stream, as delivered to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProgressMessage {
    #[serde(rename_all = "camelCase")]
    Progress {
        stage: String,
        file: String,
        files_processed: u64,
        elapsed_seconds: f64,
    },
    Ping,
    Done {
        status: ScanStatus,
    },
}

impl From<&ScanProgress> for ProgressMessage {
    fn from(progress: &ScanProgress) -> Self {
        ProgressMessage::Progress {
            stage: progress.current_stage.clone(),
            file: progress.current_file.clone(),
            files_processed: progress.files_processed,
            elapsed_seconds: progress.elapsed_seconds,
        }
    }
}

/// Per-job broadcast topics.
#[derive(Debug)]
pub struct ProgressRelay {
    topics: Mutex<HashMap<String, broadcast::Sender<ProgressMessage>>>,
    heartbeat: Duration,
}

impl Default for ProgressRelay {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT)
    }
}

impl ProgressRelay {
    pub fn new(heartbeat: Duration) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            heartbeat,
        }
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<ProgressMessage>>> {
        self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn open(&self, scan_id: &str) {
        self.topics()
            .entry(scan_id.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0);
    }

    /// Never blocks: a lagging subscriber loses its oldest snapshots instead.
    pub fn publish(&self, scan_id: &str, progress: &ScanProgress) {
        if let Some(tx) = self.topics().get(scan_id) {
            let _ = tx.send(ProgressMessage::from(progress));
        }
    }

    /// Sends the terminal notification and closes the topic.
    pub fn finish(&self, scan_id: &str, status: ScanStatus) {
        if let Some(tx) = self.topics().remove(scan_id) {
            let delivered = tx.send(ProgressMessage::Done { status }).unwrap_or(0);
            debug!(scan_id, status = status.as_str(), delivered, "progress topic closed");
        }
    }

    pub fn subscriber_count(&self, scan_id: &str) -> usize {
        self.topics()
            .get(scan_id)
            .map(broadcast::Sender::receiver_count)
            .unwrap_or(0)
    }

    /// Subscribes to a live topic, or to an already-finished job when `terminal` is set.
    pub fn subscribe(&self, scan_id: &str, terminal: Option<ScanStatus>) -> ProgressSubscription {
        let state = match (terminal, self.topics().get(scan_id)) {
            (None, Some(tx)) => SubscriptionState::Live(tx.subscribe()),
            (Some(status), _) => SubscriptionState::Finished(Some(status)),
            (None, None) => SubscriptionState::Finished(None),
        };
        ProgressSubscription {
            scan_id: scan_id.to_string(),
            state,
            heartbeat: self.heartbeat,
        }
    }
}

#[derive(Debug)]
enum SubscriptionState {
    Live(broadcast::Receiver<ProgressMessage>),
    Finished(Option<ScanStatus>),
}

/// A subscriber's view of one job's progress stream.
///
/// Yields progress snapshots in production order, a `Ping` whenever the
/// heartbeat interval passes without one, and a single `Done` before ending.
/// Dropping it unsubscribes.
#[derive(Debug)]
pub struct ProgressSubscription {
    scan_id: String,
    state: SubscriptionState,
    heartbeat: Duration,
}

impl ProgressSubscription {
    pub fn scan_id(&self) -> &str {
        &self.scan_id
    }

    pub async fn next(&mut self) -> Option<ProgressMessage> {
        loop {
            let rx = match &mut self.state {
                SubscriptionState::Finished(status) => {
                    return status.take().map(|status| ProgressMessage::Done { status });
                }
                SubscriptionState::Live(rx) => rx,
            };
            match timeout(self.heartbeat, rx.recv()).await {
                Err(_) => return Some(ProgressMessage::Ping),
                Ok(Ok(message)) => {
                    if matches!(message, ProgressMessage::Done { .. }) {
                        self.state = SubscriptionState::Finished(None);
                    }
                    return Some(message);
                }
                Ok(Err(RecvError::Lagged(skipped))) => {
                    debug!(scan_id = %self.scan_id, skipped, "progress subscriber lagged");
                }
                Ok(Err(RecvError::Closed)) => {
                    self.state = SubscriptionState::Finished(None);
                    return None;
                }
            }
        }
    }
}
