//! Task runner: the long-lived loop behind one background task.
//!
//! Each tick the runner checks the schedule, runs the pipeline once and
//! sleeps for `work_time`. A settings change restarts the loop from settings
//! resolution with a fresh run counter.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use taskline_core::{
    BackgroundConfig, Clock, MAX_CHUNK_SIZE, Result, RunContext, SettingsProvider, SystemClock,
    TaskPipeline, TaskSettings, TasklineError, panic_message,
};

use crate::schedule::{Readiness, StartDecision, StopDecision, TaskSchedule};

/// Why a runner returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerExit {
    /// The task finished or cannot run with its current settings.
    Stopped(String),
    /// The host cancelled the runner.
    Cancelled,
}

enum LoopExit {
    Restart,
    Done(RunnerExit),
}

/// Drives one named task.
pub struct TaskRunner {
    name: String,
    settings: Arc<dyn SettingsProvider>,
    pipeline: Arc<dyn TaskPipeline>,
    clock: Arc<dyn Clock>,
    max_chunk_size: usize,
    run_counter: AtomicU32,
}

impl TaskRunner {
    pub fn new(
        name: impl Into<String>,
        settings: Arc<dyn SettingsProvider>,
        pipeline: Arc<dyn TaskPipeline>,
    ) -> Self {
        Self {
            name: name.into(),
            settings,
            pipeline,
            clock: Arc::new(SystemClock),
            max_chunk_size: MAX_CHUNK_SIZE,
            run_counter: AtomicU32::new(0),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Engine-wide ceiling applied to the configured chunk size.
    pub fn with_max_chunk_size(mut self, max: usize) -> Self {
        self.max_chunk_size = max.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of the latest run since the last (re)start.
    pub fn run_counter(&self) -> u32 {
        self.run_counter.load(Ordering::Relaxed)
    }

    /// Run until the task stops or `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> RunnerExit {
        let mut updates = self.settings.subscribe();
        tracing::info!("▶️ Task '{}' started", self.name);

        loop {
            let config = updates.borrow_and_update().clone();
            self.run_counter.store(0, Ordering::Relaxed);

            let (settings, mut schedule) = match self.prepare(&config) {
                Ok(prepared) => prepared,
                Err(e) => {
                    tracing::error!("❌ Task '{}' stopped: {e}", self.name);
                    return RunnerExit::Stopped(e.to_string());
                }
            };

            if let Readiness::NotReady {
                reason,
                permanent: true,
            } = schedule.readiness(self.clock.now())
            {
                tracing::warn!("⏹️ Task '{}' will not run: {reason}", self.name);
                return RunnerExit::Stopped(reason);
            }

            match self
                .tick_loop(&settings, &mut schedule, &mut updates, &cancel)
                .await
            {
                LoopExit::Restart => {
                    tracing::warn!("🔄 Settings changed, restarting task '{}'", self.name);
                }
                LoopExit::Done(exit) => {
                    tracing::info!("⏹️ Task '{}' finished: {exit:?}", self.name);
                    return exit;
                }
            }
        }
    }

    fn prepare(&self, config: &BackgroundConfig) -> Result<(Arc<TaskSettings>, TaskSchedule)> {
        let mut settings = config
            .task(&self.name)
            .cloned()
            .ok_or_else(|| TasklineError::config(format!("no settings for task '{}'", self.name)))?;
        settings.validate()?;

        if settings.chunk_size > self.max_chunk_size {
            tracing::warn!(
                "⚠️ Task '{}': chunk_size {} exceeds the limit, using {}",
                self.name,
                settings.chunk_size,
                self.max_chunk_size
            );
            settings.chunk_size = self.max_chunk_size;
        }

        let schedule = TaskSchedule::new(&settings.schedule)?;
        Ok((Arc::new(settings), schedule))
    }

    async fn tick_loop(
        &self,
        settings: &Arc<TaskSettings>,
        schedule: &mut TaskSchedule,
        updates: &mut watch::Receiver<Arc<BackgroundConfig>>,
        cancel: &CancellationToken,
    ) -> LoopExit {
        loop {
            if cancel.is_cancelled() {
                return LoopExit::Done(RunnerExit::Cancelled);
            }
            if updates.has_changed().unwrap_or(false) {
                return LoopExit::Restart;
            }

            let now = self.clock.now();
            if let StopDecision::Stop(reason) = schedule.should_stop(now) {
                return LoopExit::Done(RunnerExit::Stopped(reason));
            }

            let wait = match schedule.can_start(now) {
                StartDecision::Wait { reason, wait } => {
                    tracing::warn!(
                        "⏸️ Task '{}' is waiting {}s: {reason}",
                        self.name,
                        wait.as_secs()
                    );
                    wait
                }
                StartDecision::Start => {
                    let counter = self.next_run_counter();
                    if let Err(e) = self.execute(settings, counter, cancel).await {
                        tracing::error!("❌ Task '{}' stopped: {e}", self.name);
                        return LoopExit::Done(RunnerExit::Stopped(e.to_string()));
                    }
                    if schedule.is_once() {
                        schedule.mark_once();
                        continue;
                    }
                    schedule.work_time()
                }
            };

            if !self.sleep(wait, cancel).await {
                return LoopExit::Done(RunnerExit::Cancelled);
            }
        }
    }

    /// One pipeline run. Only configuration errors come back; everything
    /// else is logged here and the loop goes on.
    async fn execute(
        &self,
        settings: &Arc<TaskSettings>,
        counter: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let ctx = RunContext::new(self.name.clone(), counter, Arc::clone(settings));
        tracing::debug!("🔔 Task '{}' run #{counter}", self.name);

        let outcome = AssertUnwindSafe(self.pipeline.run_once(&ctx, cancel))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(report)) => {
                tracing::info!(
                    task = %self.name,
                    run = counter,
                    processed = report.processed(),
                    failed = report.failed(),
                    "✅ Run completed"
                );
                Ok(())
            }
            Ok(Err(e)) if e.is_cancelled() => {
                tracing::debug!("Task '{}' run #{counter} cancelled", self.name);
                Ok(())
            }
            Ok(Err(e)) if e.is_configuration() => Err(e),
            Ok(Err(e)) => {
                tracing::error!(task = %self.name, run = counter, "❌ Run failed: {e}");
                Ok(())
            }
            Err(panic) => {
                tracing::error!(
                    task = %self.name,
                    run = counter,
                    "💥 Run panicked: {}",
                    panic_message(panic.as_ref())
                );
                Ok(())
            }
        }
    }

    fn next_run_counter(&self) -> u32 {
        let mut counter = self.run_counter.load(Ordering::Relaxed);
        if counter == u32::MAX {
            tracing::warn!("🔁 Task '{}': run counter wrapped", self.name);
            counter = 0;
        }
        counter += 1;
        self.run_counter.store(counter, Ordering::Relaxed);
        counter
    }

    /// Returns false if cancelled while sleeping.
    async fn sleep(&self, wait: Duration, cancel: &CancellationToken) -> bool {
        tracing::debug!("💤 Task '{}' next check in {}s", self.name, wait.as_secs());
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(wait) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{NaiveDate, TimeZone, Utc};
    use std::sync::Mutex;
    use taskline_core::{FixedClock, RunReport, SettingsHandle};

    type Behaviour = Box<dyn Fn(&RunContext, usize) -> Result<RunReport> + Send + Sync>;

    /// Records every run and stops the runner after `limit` runs.
    struct ScriptedPipeline {
        seen: Mutex<Vec<(u32, usize)>>,
        limit: usize,
        cancel: CancellationToken,
        behaviour: Behaviour,
    }

    impl ScriptedPipeline {
        fn new(limit: usize, cancel: CancellationToken, behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                limit,
                cancel,
                behaviour,
            })
        }

        fn counters(&self) -> Vec<u32> {
            self.seen.lock().unwrap().iter().map(|(c, _)| *c).collect()
        }
    }

    #[async_trait]
    impl TaskPipeline for ScriptedPipeline {
        async fn run_once(&self, ctx: &RunContext, _cancel: &CancellationToken) -> Result<RunReport> {
            let n = {
                let mut seen = self.seen.lock().unwrap();
                seen.push((ctx.run_counter, ctx.settings.chunk_size));
                seen.len()
            };
            if n >= self.limit {
                self.cancel.cancel();
            }
            (self.behaviour)(ctx, n)
        }
    }

    fn ok() -> Behaviour {
        Box::new(|ctx, _| Ok(RunReport::new(ctx.task_name.clone(), ctx.run_counter)))
    }

    fn config_with(settings: TaskSettings) -> BackgroundConfig {
        let mut config = BackgroundConfig::default();
        config.tasks.insert("etl".into(), settings);
        config
    }

    fn clock() -> Arc<FixedClock> {
        Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap(),
        ))
    }

    fn runner(handle: &SettingsHandle, pipeline: Arc<ScriptedPipeline>) -> TaskRunner {
        TaskRunner::new("etl", Arc::new(handle.clone()), pipeline).with_clock(clock())
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_every_tick_until_cancelled() {
        let cancel = CancellationToken::new();
        let handle = SettingsHandle::new(config_with(TaskSettings::new(["Extract"])));
        let pipeline = ScriptedPipeline::new(3, cancel.clone(), ok());
        let runner = runner(&handle, pipeline.clone());

        assert_eq!(runner.run(cancel).await, RunnerExit::Cancelled);
        assert_eq!(pipeline.counters(), vec![1, 2, 3]);
        assert_eq!(runner.run_counter(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_once_task_stops_after_single_run() {
        let cancel = CancellationToken::new();
        let mut settings = TaskSettings::new(["Extract"]);
        settings.schedule.is_once = true;
        let handle = SettingsHandle::new(config_with(settings));
        let pipeline = ScriptedPipeline::new(10, cancel.clone(), ok());

        let exit = runner(&handle, pipeline.clone()).run(cancel).await;
        assert!(matches!(exit, RunnerExit::Stopped(_)));
        assert_eq!(pipeline.counters(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_task_never_runs() {
        let cancel = CancellationToken::new();
        let mut settings = TaskSettings::new(["Extract"]);
        settings.schedule.is_enable = false;
        let handle = SettingsHandle::new(config_with(settings));
        let pipeline = ScriptedPipeline::new(10, cancel.clone(), ok());

        let exit = runner(&handle, pipeline.clone()).run(cancel).await;
        assert!(matches!(exit, RunnerExit::Stopped(reason) if reason.contains("is_enable")));
        assert!(pipeline.counters().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_date_in_past_never_runs() {
        let cancel = CancellationToken::new();
        let mut settings = TaskSettings::new(["Extract"]);
        settings.schedule.stop_date = NaiveDate::from_ymd_opt(2026, 1, 1);
        let handle = SettingsHandle::new(config_with(settings));
        let pipeline = ScriptedPipeline::new(10, cancel.clone(), ok());

        let exit = runner(&handle, pipeline.clone()).run(cancel).await;
        assert!(matches!(exit, RunnerExit::Stopped(_)));
        assert!(pipeline.counters().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_task_settings_stop_runner() {
        let cancel = CancellationToken::new();
        let handle = SettingsHandle::new(BackgroundConfig::default());
        let pipeline = ScriptedPipeline::new(10, cancel.clone(), ok());

        let exit = runner(&handle, pipeline).run(cancel).await;
        assert!(matches!(exit, RunnerExit::Stopped(reason) if reason.contains("etl")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipeline_failures_do_not_stop_runner() {
        let cancel = CancellationToken::new();
        let handle = SettingsHandle::new(config_with(TaskSettings::new(["Extract"])));
        let pipeline = ScriptedPipeline::new(
            3,
            cancel.clone(),
            Box::new(|_, n| {
                if n == 1 {
                    panic!("handler exploded");
                }
                Err(TasklineError::Fetch {
                    step: "Extract".into(),
                    message: "db down".into(),
                })
            }),
        );

        let exit = runner(&handle, pipeline.clone()).run(cancel).await;
        assert_eq!(exit, RunnerExit::Cancelled);
        assert_eq!(pipeline.counters(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configuration_error_stops_runner() {
        let cancel = CancellationToken::new();
        let handle = SettingsHandle::new(config_with(TaskSettings::new(["Ghost"])));
        let pipeline = ScriptedPipeline::new(
            10,
            cancel.clone(),
            Box::new(|_, _| Err(TasklineError::StepNotFound("Ghost".into()))),
        );

        let exit = runner(&handle, pipeline.clone()).run(cancel).await;
        assert!(matches!(exit, RunnerExit::Stopped(reason) if reason.contains("Ghost")));
        assert_eq!(pipeline.counters(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settings_change_restarts_counter() {
        let cancel = CancellationToken::new();
        let handle = SettingsHandle::new(config_with(TaskSettings::new(["Extract"])));
        let publisher = handle.clone();
        let pipeline = ScriptedPipeline::new(
            4,
            cancel.clone(),
            Box::new(move |ctx, n| {
                if n == 2 {
                    let mut settings = TaskSettings::new(["Extract"]);
                    settings.chunk_size = 7;
                    publisher.replace(config_with(settings));
                }
                Ok(RunReport::new(ctx.task_name.clone(), ctx.run_counter))
            }),
        );

        runner(&handle, pipeline.clone()).run(cancel).await;
        let seen = pipeline.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![(1, 100), (2, 100), (1, 7), (2, 7)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunk_size_is_clamped() {
        let cancel = CancellationToken::new();
        let mut settings = TaskSettings::new(["Extract"]);
        settings.chunk_size = 10_000;
        let handle = SettingsHandle::new(config_with(settings));
        let pipeline = ScriptedPipeline::new(1, cancel.clone(), ok());

        runner(&handle, pipeline.clone()).run(cancel).await;
        assert_eq!(pipeline.seen.lock().unwrap()[0].1, MAX_CHUNK_SIZE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_start_time() {
        let cancel = CancellationToken::new();
        let mut settings = TaskSettings::new(["Extract"]);
        // Clock is pinned at 10:00, so the window never opens
        settings.schedule.start_time = chrono::NaiveTime::from_hms_opt(11, 0, 0);
        let handle = SettingsHandle::new(config_with(settings));
        let pipeline = ScriptedPipeline::new(10, cancel.clone(), ok());
        let runner = Arc::new(runner(&handle, pipeline.clone()));

        let task = tokio::spawn({
            let runner = Arc::clone(&runner);
            let cancel = cancel.clone();
            async move { runner.run(cancel).await }
        });
        tokio::time::sleep(Duration::from_secs(30 * 60)).await;
        cancel.cancel();

        assert_eq!(task.await.unwrap(), RunnerExit::Cancelled);
        assert!(pipeline.counters().is_empty());
    }

    #[test]
    fn test_run_counter_wraps_to_one() {
        let handle = SettingsHandle::new(BackgroundConfig::default());
        let pipeline = ScriptedPipeline::new(1, CancellationToken::new(), ok());
        let runner = runner(&handle, pipeline);

        runner.run_counter.store(u32::MAX - 1, Ordering::Relaxed);
        assert_eq!(runner.next_run_counter(), u32::MAX);
        assert_eq!(runner.next_run_counter(), 1);
        assert_eq!(runner.next_run_counter(), 2);
    }
}
