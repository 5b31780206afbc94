//! Post-commit side effects
//!
//! Notifications are delivered best-effort by a dedicated worker coroutine
//! fed through a bounded channel. Enqueueing never blocks and never fails the
//! committed mutation that triggered it: a full queue or a dead worker is
//! logged and dropped.

use crate::executor::{MayPostgresExecutor, RowExecutor};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// A notification destined for a recipient's feed.
#[derive(Debug, Clone)]
pub struct Notification {
    pub recipient: String,
    pub event: String,
    pub payload: JsonValue,
}

/// Delivery seam for post-commit notifications. Implementations are
/// infallible from the caller's perspective; failures stay inside.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Discards everything. Useful in tests and tools.
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _notification: Notification) {}
}

/// Queue-backed notifier writing `notifications` rows from a worker coroutine.
pub struct QueueNotifier {
    tx: Sender<Notification>,
}

impl QueueNotifier {
    /// Spawn the worker and return the enqueue handle.
    ///
    /// The worker runs until every `QueueNotifier` clone is dropped.
    pub fn start(db: MayPostgresExecutor, capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        may::go!(move || run_worker_loop(&rx, &db));
        Self { tx }
    }
}

impl Notifier for QueueNotifier {
    fn notify(&self, notification: Notification) {
        match self.tx.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(n)) => {
                log::warn!("notification queue full, dropping {} for {}", n.event, n.recipient);
            }
            Err(TrySendError::Disconnected(n)) => {
                log::warn!(
                    "notification worker gone, dropping {} for {}",
                    n.event,
                    n.recipient
                );
            }
        }
    }
}

fn run_worker_loop(rx: &Receiver<Notification>, db: &MayPostgresExecutor) {
    while let Ok(notification) = rx.recv() {
        if let Err(err) = insert_notification(db, &notification) {
            log::warn!(
                "failed to persist notification {} for {}: {err}",
                notification.event,
                notification.recipient
            );
        }
    }
}

fn insert_notification(
    db: &MayPostgresExecutor,
    notification: &Notification,
) -> Result<(), crate::executor::RowError> {
    db.execute(
        "INSERT INTO notifications (id, recipient, event, payload) VALUES ($1, $2, $3, $4)",
        &[
            &Uuid::new_v4(),
            &notification.recipient,
            &notification.event,
            &notification.payload,
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Collects notifications for assertions.
    pub struct CapturingNotifier(pub Mutex<Vec<Notification>>);

    impl Notifier for CapturingNotifier {
        fn notify(&self, notification: Notification) {
            self.0.lock().unwrap().push(notification);
        }
    }

    #[test]
    fn test_null_notifier_is_a_no_op() {
        NullNotifier.notify(Notification {
            recipient: "alice".to_string(),
            event: "report.approved".to_string(),
            payload: json!({}),
        });
    }

    #[test]
    fn test_capturing_notifier_records() {
        let notifier = CapturingNotifier(Mutex::new(Vec::new()));
        notifier.notify(Notification {
            recipient: "alice".to_string(),
            event: "report.approved".to_string(),
            payload: json!({ "report_id": "r-1" }),
        });
        let seen = notifier.0.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].event, "report.approved");
    }
}
