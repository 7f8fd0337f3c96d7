//! Settings snapshots with change notification.
//!
//! Snapshots travel through a `watch` channel: the publisher swaps in a new
//! `Arc<BackgroundConfig>` and every runner sees it on its next check.

use std::sync::Arc;
use tokio::sync::watch;

use crate::config::BackgroundConfig;

/// Current settings plus a subscription for hot reload.
pub trait SettingsProvider: Send + Sync {
    /// Latest snapshot.
    fn snapshot(&self) -> Arc<BackgroundConfig>;

    /// Receiver that is marked changed whenever a new snapshot is published.
    fn subscribe(&self) -> watch::Receiver<Arc<BackgroundConfig>>;
}

/// Programmatic settings source.
#[derive(Debug, Clone)]
pub struct SettingsHandle {
    tx: Arc<watch::Sender<Arc<BackgroundConfig>>>,
}

impl SettingsHandle {
    pub fn new(config: BackgroundConfig) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(config));
        Self { tx: Arc::new(tx) }
    }

    /// Publish a new snapshot. Returns false if it equals the current one.
    pub fn replace(&self, config: BackgroundConfig) -> bool {
        self.tx.send_if_modified(|current| {
            if **current == config {
                false
            } else {
                *current = Arc::new(config);
                true
            }
        })
    }
}

impl SettingsProvider for SettingsHandle {
    fn snapshot(&self) -> Arc<BackgroundConfig> {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Arc<BackgroundConfig>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskSettings;

    #[test]
    fn test_replace_notifies_subscribers() {
        let handle = SettingsHandle::new(BackgroundConfig::default());
        let mut rx = handle.subscribe();
        assert!(!rx.has_changed().unwrap());

        let mut config = BackgroundConfig::default();
        config
            .tasks
            .insert("etl".into(), TaskSettings::new(["Extract"]));
        assert!(handle.replace(config.clone()));
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().task("etl").is_some());

        // Same content is not a change
        assert!(!handle.replace(config));
        assert!(!rx.has_changed().unwrap());
        assert!(handle.snapshot().task("etl").is_some());
    }
}
