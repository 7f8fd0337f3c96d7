//! Task host: explicit registry of runners, one tokio task each.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use taskline_core::{Result, TasklineError};

use crate::runner::{RunnerExit, TaskRunner};

/// Owns the registered runners and their lifetimes.
pub struct TaskHost {
    runners: Vec<Arc<TaskRunner>>,
    names: HashSet<String>,
    running: JoinSet<(String, RunnerExit)>,
    cancel: CancellationToken,
}

impl TaskHost {
    pub fn new() -> Self {
        Self {
            runners: Vec::new(),
            names: HashSet::new(),
            running: JoinSet::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Register a runner. Task names must be unique.
    pub fn register(&mut self, runner: TaskRunner) -> Result<()> {
        if !self.names.insert(runner.name().to_string()) {
            return Err(TasklineError::config(format!(
                "task '{}' is already registered",
                runner.name()
            )));
        }
        tracing::info!("📅 Task registered: '{}'", runner.name());
        self.runners.push(Arc::new(runner));
        Ok(())
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.runners.iter().map(|r| r.name()).collect()
    }

    /// Spawn every registered runner. The runners stop when `parent` is
    /// cancelled or on [`TaskHost::shutdown`].
    pub fn start(&mut self, parent: &CancellationToken) {
        self.cancel = parent.child_token();
        for runner in &self.runners {
            let runner = Arc::clone(runner);
            let cancel = self.cancel.clone();
            self.running.spawn(async move {
                let exit = runner.run(cancel).await;
                (runner.name().to_string(), exit)
            });
        }
        tracing::info!("🚀 Task host started {} runner(s)", self.runners.len());
    }

    /// Wait for every running runner to return.
    pub async fn join(&mut self) -> Vec<(String, RunnerExit)> {
        let mut exits = Vec::new();
        while let Some(joined) = self.running.join_next().await {
            match joined {
                Ok(exit) => exits.push(exit),
                Err(e) => {
                    tracing::error!("💥 Runner task aborted: {e}");
                    exits.push(("<unknown>".to_string(), RunnerExit::Stopped(e.to_string())));
                }
            }
        }
        exits
    }

    /// Cancel all runners and wait for them.
    pub async fn shutdown(&mut self) -> Vec<(String, RunnerExit)> {
        tracing::info!("🛑 Task host shutting down");
        self.cancel.cancel();
        self.join().await
    }
}

impl Default for TaskHost {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use taskline_core::{
        BackgroundConfig, RunContext, RunReport, SettingsHandle, TaskPipeline, TaskSettings,
    };

    #[derive(Default)]
    struct CountingPipeline {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl TaskPipeline for CountingPipeline {
        async fn run_once(&self, ctx: &RunContext, _cancel: &CancellationToken) -> Result<RunReport> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(RunReport::new(ctx.task_name.clone(), ctx.run_counter))
        }
    }

    fn settings() -> SettingsHandle {
        let mut config = BackgroundConfig::default();
        config.tasks.insert("a".into(), TaskSettings::new(["Extract"]));
        let mut once = TaskSettings::new(["Extract"]);
        once.schedule.is_once = true;
        config.tasks.insert("b".into(), once);
        SettingsHandle::new(config)
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let handle = Arc::new(settings());
        let pipeline = Arc::new(CountingPipeline::default());
        let mut host = TaskHost::new();
        host.register(TaskRunner::new("a", handle.clone(), pipeline.clone()))
            .unwrap();
        let err = host
            .register(TaskRunner::new("a", handle, pipeline))
            .unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(host.task_names(), vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_runners() {
        let handle = Arc::new(settings());
        let pipeline = Arc::new(CountingPipeline::default());
        let mut host = TaskHost::new();
        host.register(TaskRunner::new("a", handle.clone(), pipeline.clone()))
            .unwrap();
        host.register(TaskRunner::new("b", handle, pipeline.clone()))
            .unwrap();

        let root = CancellationToken::new();
        host.start(&root);
        tokio::time::sleep(std::time::Duration::from_secs(25 * 60)).await;

        let mut exits = host.shutdown().await;
        exits.sort_by(|x, y| x.0.cmp(&y.0));
        assert_eq!(exits.len(), 2);
        assert_eq!(exits[0], ("a".to_string(), RunnerExit::Cancelled));
        assert!(matches!(exits[1].1, RunnerExit::Stopped(_)));
        // "a" ran at 0, 10 and 20 minutes; "b" once
        assert_eq!(pipeline.runs.load(Ordering::SeqCst), 4);
    }
}
