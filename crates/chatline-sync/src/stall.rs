use crate::notify::NotificationChannel;
use chatline_core::Notification;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

pub const STALL_MESSAGE: &str = "No response within the expected time. The backend may be stalled.";

/// Single re-armable deadline over an outstanding turn. Arming and disarming
/// are synchronous; expiry is observed by the watchdog task.
#[derive(Debug, Clone)]
pub struct StallMonitor {
    timeout: Duration,
    deadline: Arc<watch::Sender<Option<Instant>>>,
}

impl StallMonitor {
    pub fn new(timeout: Duration) -> Self {
        let (deadline, _rx) = watch::channel(None);
        Self {
            timeout,
            deadline: Arc::new(deadline),
        }
    }

    pub fn arm(&self) {
        self.deadline.send_replace(Some(Instant::now() + self.timeout));
    }

    pub fn disarm(&self) {
        self.deadline.send_replace(None);
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.borrow().is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        *self.deadline.borrow()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Publishes one warning per deadline that passes without being re-armed
    /// or disarmed. The warning is advisory; nothing else changes.
    pub fn spawn_watchdog(&self, notifications: NotificationChannel) -> JoinHandle<()> {
        let deadline = self.deadline.clone();
        let rx = deadline.subscribe();
        tokio::spawn(watch_deadline(deadline, rx, notifications))
    }
}

async fn watch_deadline(
    deadline: Arc<watch::Sender<Option<Instant>>>,
    mut rx: watch::Receiver<Option<Instant>>,
    notifications: NotificationChannel,
) {
    loop {
        let armed = *rx.borrow_and_update();
        let Some(at) = armed else {
            if rx.changed().await.is_err() {
                return;
            }
            continue;
        };

        tokio::select! {
            _ = tokio::time::sleep_until(at) => {
                let expired = deadline.send_if_modified(|current| {
                    if *current == Some(at) {
                        *current = None;
                        true
                    } else {
                        false
                    }
                });
                if expired {
                    warn!("stall_detected: no completion within timeout");
                    notifications.publish(Notification::warning(STALL_MESSAGE));
                }
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
