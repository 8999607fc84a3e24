//! Server-push progress channels.
//!
//! Every job owns one [`ProgressHub`]. Subscribers receive an event per
//! status or progress change. The terminal event is the last one a
//! subscriber ever sees: the hub drops every sender right after pushing it,
//! which closes the channels exactly once. Subscribing to a finished job
//! yields only the terminal event.

use super::{JobStatus, JobStatusReport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// One observed change of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Job id.
    pub job_id: String,
    /// Status at the time of the event.
    pub status: JobStatus,
    /// Progress from 0 to 100.
    pub progress: f64,
    /// The last stage reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// Error message for failed and cancelled jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the change happened.
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    /// Returns true for the last event of a job.
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.status.is_terminal()
    }
}

impl From<&JobStatusReport> for ProgressEvent {
    fn from(report: &JobStatusReport) -> Self {
        Self {
            job_id: report.job_id.clone(),
            status: report.status,
            progress: report.progress,
            current_step: report.current_step.clone(),
            message: report.message.clone(),
            timestamp: report.updated_at,
        }
    }
}

/// Fan-out of one job's progress events.
///
/// ```rust
/// # tokio_test::block_on(async {
/// use biomapper::jobs::{JobStatus, ProgressEvent, ProgressHub};
///
/// let event = |status| ProgressEvent {
///     job_id: "job-1".to_string(),
///     status,
///     progress: 0.0,
///     current_step: None,
///     message: None,
///     timestamp: chrono::Utc::now(),
/// };
///
/// let mut hub = ProgressHub::new();
/// let mut rx = hub.subscribe();
/// hub.publish(event(JobStatus::Running));
/// hub.publish(event(JobStatus::Completed));
/// hub.publish(event(JobStatus::Failed));
///
/// assert_eq!(rx.recv().await.map(|e| e.status), Some(JobStatus::Running));
/// assert_eq!(rx.recv().await.map(|e| e.status), Some(JobStatus::Completed));
/// assert!(rx.recv().await.is_none());
/// # });
/// ```
#[derive(Debug, Default)]
pub struct ProgressHub {
    subscribers: Vec<mpsc::UnboundedSender<ProgressEvent>>,
    final_event: Option<ProgressEvent>,
}

impl ProgressHub {
    /// Creates a hub without subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber.
    ///
    /// After the terminal event, the returned channel holds that event and
    /// is already closed.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ProgressEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        match &self.final_event {
            Some(event) => {
                let _ = tx.send(event.clone());
            }
            None => self.subscribers.push(tx),
        }
        rx
    }

    /// Adds a subscriber that first receives `current`.
    ///
    /// `current` is ignored once the hub is closed.
    pub fn subscribe_from(&mut self, current: ProgressEvent) -> mpsc::UnboundedReceiver<ProgressEvent> {
        if self.final_event.is_some() {
            return self.subscribe();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(current).is_ok() {
            self.subscribers.push(tx);
        }
        rx
    }

    /// Sends an event to every live subscriber.
    ///
    /// Events published after the terminal one are dropped.
    pub fn publish(&mut self, event: ProgressEvent) {
        if self.final_event.is_some() {
            return;
        }
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        if event.is_final() {
            self.subscribers.clear();
            self.final_event = Some(event);
        }
    }

    /// Returns true once the terminal event was published.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.final_event.is_some()
    }

    /// Number of open subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
