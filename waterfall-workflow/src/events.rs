//! Workflow notifications.
//!
//! Every manager operation emits `workflow.<op>.start` followed by either
//! `workflow.<op>.end` or `workflow.<op>.error`. The in-memory
//! [`NotificationStore`] keeps the most recent ones in a ring buffer and
//! mirrors each to the log.

use std::collections::VecDeque;
use std::fmt;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::types::{Job, RequestContext};

/// Maximum number of notifications to keep in memory
const DEFAULT_CAPACITY: usize = 1000;

/// Phase of an operation a notification reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Start,
    End,
    Error,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Start => write!(f, "start"),
            Phase::End => write!(f, "end"),
            Phase::Error => write!(f, "error"),
        }
    }
}

/// A single notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Unique notification ID
    pub id: String,
    /// Emission time
    pub timestamp: DateTime<Utc>,
    /// Operation name, e.g. "create" or "reset_status"
    pub operation: String,
    /// Phase of the operation
    pub phase: Phase,
    /// Job the operation acts on
    pub job_id: String,
    /// Job status when the notification was emitted
    pub status: String,
    /// Correlation ID of the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Error text for the error phase
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Notification {
    /// Create a notification for `job`.
    pub fn new(ctx: &RequestContext, operation: &str, phase: Phase, job: &Job) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            operation: operation.to_string(),
            phase,
            job_id: job.id.clone(),
            status: job.status.to_string(),
            request_id: ctx.request_id.clone(),
            message: None,
        }
    }

    /// Attach a message, typically the error text.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Event type string, e.g. `workflow.create.start`.
    pub fn event_type(&self) -> String {
        format!("workflow.{}.{}", self.operation, self.phase)
    }
}

/// Notification sink.
pub trait Notifier: Send + Sync {
    /// Emit a notification. Must not fail the calling operation.
    fn notify(&self, notification: Notification);
}

/// Thread-safe notification store with ring buffer.
pub struct NotificationStore {
    notifications: RwLock<VecDeque<Notification>>,
    capacity: usize,
}

impl NotificationStore {
    /// Create a store with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a store with the given capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            notifications: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    /// All notifications, oldest first.
    pub fn get_all(&self) -> Vec<Notification> {
        self.notifications
            .read()
            .map(|n| n.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Event types for a job, oldest first.
    pub fn event_types_for(&self, job_id: &str) -> Vec<String> {
        self.notifications
            .read()
            .map(|n| {
                n.iter()
                    .filter(|n| n.job_id == job_id)
                    .map(Notification::event_type)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Notifications with optional filters, newest first.
    pub fn query(&self, job_id: Option<&str>, phase: Option<Phase>, limit: Option<usize>) -> Vec<Notification> {
        self.notifications
            .read()
            .map(|n| {
                let mut result: Vec<Notification> = n
                    .iter()
                    .filter(|n| {
                        job_id.map_or(true, |id| n.job_id == id) && phase.map_or(true, |p| n.phase == p)
                    })
                    .rev()
                    .cloned()
                    .collect();

                if let Some(limit) = limit {
                    result.truncate(limit);
                }

                result
            })
            .unwrap_or_default()
    }

    /// Number of stored notifications.
    pub fn len(&self) -> usize {
        self.notifications.read().map(|n| n.len()).unwrap_or(0)
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for NotificationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for NotificationStore {
    fn notify(&self, notification: Notification) {
        match notification.phase {
            Phase::Start => debug!(
                event_type = %notification.event_type(),
                job_id = %notification.job_id,
                "Notification"
            ),
            Phase::End => info!(
                event_type = %notification.event_type(),
                job_id = %notification.job_id,
                status = %notification.status,
                "Notification"
            ),
            Phase::Error => error!(
                event_type = %notification.event_type(),
                job_id = %notification.job_id,
                message = notification.message.as_deref().unwrap_or(""),
                "Notification"
            ),
        }

        if let Ok(mut notifications) = self.notifications.write() {
            if notifications.len() >= self.capacity {
                notifications.pop_front();
            }
            notifications.push_back(notification);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type() {
        let ctx = RequestContext::admin();
        let job = Job::new("vol-1");
        let n = Notification::new(&ctx, "create", Phase::Start, &job);
        assert_eq!(n.event_type(), "workflow.create.start");
        assert_eq!(n.status, "creating");
    }

    #[test]
    fn test_store_capacity() {
        let ctx = RequestContext::admin();
        let store = NotificationStore::with_capacity(2);
        let job = Job::new("vol-1");

        store.notify(Notification::new(&ctx, "create", Phase::Start, &job));
        store.notify(Notification::new(&ctx, "create", Phase::End, &job));
        store.notify(Notification::new(&ctx, "delete", Phase::Start, &job));

        assert_eq!(store.len(), 2);
        assert_eq!(
            store.event_types_for(&job.id),
            vec!["workflow.create.end", "workflow.delete.start"]
        );
    }

    #[test]
    fn test_query_filters() {
        let ctx = RequestContext::admin();
        let store = NotificationStore::new();
        let a = Job::new("vol-1");
        let b = Job::new("vol-2");

        store.notify(Notification::new(&ctx, "create", Phase::Start, &a));
        store.notify(Notification::new(&ctx, "create", Phase::Error, &a).with_message("boom"));
        store.notify(Notification::new(&ctx, "create", Phase::Start, &b));

        let errors = store.query(None, Some(Phase::Error), None);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message.as_deref(), Some("boom"));

        assert_eq!(store.query(Some(&a.id), None, Some(1)).len(), 1);
        assert_eq!(store.query(Some(&b.id), None, None).len(), 1);
    }
}
