use chatline_core::Notification;
use std::sync::Arc;
use tokio::sync::watch;

/// One-slot broadcast of the latest warning or error. Each publish overwrites
/// the previous value; receivers that need history must snapshot.
#[derive(Debug, Clone)]
pub struct NotificationChannel {
    tx: Arc<watch::Sender<Notification>>,
}

impl Default for NotificationChannel {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(Notification::none());
        Self { tx: Arc::new(tx) }
    }
}

impl NotificationChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, notification: Notification) {
        self.tx.send_replace(notification);
    }

    pub fn latest(&self) -> Notification {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Notification> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_overwrites_single_slot() {
        let channel = NotificationChannel::new();
        assert!(channel.latest().is_empty());

        let mut rx = channel.subscribe();
        channel.publish(Notification::warning("first"));
        channel.publish(Notification::error("second"));

        assert!(rx.has_changed().expect("sender alive"));
        assert_eq!(rx.borrow_and_update().message, "second");
        assert!(!rx.has_changed().expect("sender alive"));
        assert_eq!(channel.latest(), Notification::error("second"));
    }
}
