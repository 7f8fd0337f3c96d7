//! File-backed settings provider with hot reload.
//!
//! The TOML file is polled for modification-time changes; a change that
//! parses and validates is published to every runner. A broken file is
//! logged and the previous snapshot stays in effect.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use taskline_core::{BackgroundConfig, Result, SettingsHandle, SettingsProvider};

pub struct FileSettingsProvider {
    path: PathBuf,
    handle: SettingsHandle,
    modified: Mutex<Option<SystemTime>>,
}

impl FileSettingsProvider {
    /// Load the file now. Fails if the initial content is invalid.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let modified = modified_at(&path);
        let config = BackgroundConfig::load_from(&path)?;
        tracing::info!(
            "📄 Loaded {} task(s) from {}",
            config.tasks.len(),
            path.display()
        );
        Ok(Self {
            path,
            handle: SettingsHandle::new(config),
            modified: Mutex::new(modified),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file if it was modified. Returns true when a new snapshot
    /// was published.
    pub fn reload(&self) -> Result<bool> {
        let current = modified_at(&self.path);
        {
            let mut seen = self.modified.lock().unwrap_or_else(|e| e.into_inner());
            if *seen == current {
                return Ok(false);
            }
            *seen = current;
        }
        let config = BackgroundConfig::load_from(&self.path)?;
        let published = self.handle.replace(config);
        if published {
            tracing::info!("🔄 Settings reloaded from {}", self.path.display());
        }
        Ok(published)
    }

    /// Poll the file every `every` until `cancel` fires.
    pub fn watch(self: Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.reload() {
                            tracing::warn!(
                                "⚠️ Ignoring invalid settings in {}: {e}",
                                self.path.display()
                            );
                        }
                    }
                }
            }
            tracing::debug!("Settings watcher for {} stopped", self.path.display());
        })
    }
}

impl SettingsProvider for FileSettingsProvider {
    fn snapshot(&self) -> Arc<BackgroundConfig> {
        self.handle.snapshot()
    }

    fn subscribe(&self) -> watch::Receiver<Arc<BackgroundConfig>> {
        self.handle.subscribe()
    }
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ONE_TASK: &str = r#"
[tasks.etl]
steps = "Extract, Load"
"#;

    const TWO_TASKS: &str = r#"
[tasks.etl]
steps = "Extract, Load"
chunk_size = 50

[tasks.cleanup]
steps = ["Purge"]
"#;

    fn temp_file(name: &str, content: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("taskline-settings-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    /// Forces a different mtime regardless of filesystem resolution.
    fn rewrite(path: &Path, content: &str) {
        std::fs::write(path, content).unwrap();
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(60))
            .unwrap();
    }

    #[test]
    fn test_open_and_reload() {
        let path = temp_file("reload.toml", ONE_TASK);
        let provider = FileSettingsProvider::open(&path).unwrap();
        let mut rx = provider.subscribe();
        assert_eq!(provider.snapshot().tasks.len(), 1);
        assert!(!provider.reload().unwrap());

        rewrite(&path, TWO_TASKS);
        assert!(provider.reload().unwrap());
        assert!(rx.has_changed().unwrap());
        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.tasks.len(), 2);
        assert_eq!(snapshot.task("etl").unwrap().chunk_size, 50);
    }

    #[test]
    fn test_invalid_reload_keeps_previous_snapshot() {
        let path = temp_file("invalid.toml", ONE_TASK);
        let provider = FileSettingsProvider::open(&path).unwrap();

        rewrite(&path, "[tasks.etl]\nsteps = []\n");
        assert!(provider.reload().is_err());
        assert_eq!(
            provider.snapshot().task("etl").unwrap().steps,
            vec!["Extract", "Load"]
        );
    }

    #[test]
    fn test_open_missing_file_fails() {
        let path = std::env::temp_dir().join("taskline-does-not-exist.toml");
        assert!(FileSettingsProvider::open(path).is_err());
    }
}
