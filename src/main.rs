//! # Taskline: recurring background job pipelines
//!
//! Runs every task in the settings file against a SQLite work queue until
//! Ctrl-C. Steps without business logic get a pass-through handler that
//! forwards items unchanged.
//!
//! Settings edits to existing tasks are picked up live. Steps, handlers and
//! runners are registered from the settings present at startup: a reload
//! that adds tasks or steps is logged and takes effect after a restart.
//!
//! Usage:
//!   taskline                                   # ~/.taskline/config.toml
//!   taskline --config ./tasks.toml --db ./queue.db
//!   taskline --verbose --json                  # debug logs as JSON lines

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use taskline_core::{
    BackgroundConfig, SettingsProvider, StepDescriptor, StepHandler, StepOutcome, WorkItem,
};
use taskline_pipeline::{HandlerCatalog, PipelineOrchestrator};
use taskline_scheduler::{FileSettingsProvider, RunnerExit, TaskHost, TaskRunner};
use taskline_store::SqliteWorkStore;

#[derive(Parser)]
#[command(
    name = "taskline",
    version,
    about = "⏱️ Taskline: recurring background job pipelines"
)]
struct Cli {
    /// Settings file (TOML)
    #[arg(short, long, default_value = "~/.taskline/config.toml")]
    config: String,

    /// Work-queue database path
    #[arg(long, default_value = "~/.taskline/queue.db")]
    db: String,

    /// Seconds between settings file checks
    #[arg(long, default_value = "5")]
    reload_secs: u64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,
}

/// Forwards every item unchanged.
struct PassThrough;

#[async_trait]
impl StepHandler for PassThrough {
    async fn handle(&self, task: &str, step: &StepDescriptor, items: Vec<WorkItem>) -> StepOutcome {
        tracing::debug!("Task '{task}' step '{}': passing {} item(s)", step.name, items.len());
        StepOutcome::Completed(items)
    }
}

/// Task and step names in `config` that were not registered at startup.
fn unregistered(
    config: &BackgroundConfig,
    tasks: &BTreeSet<String>,
    steps: &BTreeSet<String>,
) -> (Vec<String>, Vec<String>) {
    let new_tasks = config
        .tasks
        .keys()
        .filter(|t| !tasks.contains(*t))
        .cloned()
        .collect::<BTreeSet<_>>();
    let new_steps = config
        .tasks
        .values()
        .flat_map(|t| t.steps.iter())
        .filter(|s| !steps.contains(*s))
        .cloned()
        .collect::<BTreeSet<_>>();
    (new_tasks.into_iter().collect(), new_steps.into_iter().collect())
}

/// Warn when a reload brings tasks or steps this process cannot run.
fn warn_on_unregistered(
    settings: &FileSettingsProvider,
    tasks: BTreeSet<String>,
    steps: BTreeSet<String>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut rx = settings.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            let config = rx.borrow_and_update().clone();
            let (new_tasks, new_steps) = unregistered(&config, &tasks, &steps);
            if !new_tasks.is_empty() {
                tracing::warn!("⚠️ New task(s) {new_tasks:?} need a restart to run");
            }
            if !new_steps.is_empty() {
                tracing::warn!("⚠️ New step(s) {new_steps:?} need a restart to be registered");
            }
        }
    })
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn init_logging(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json);

    let config_path = expand_path(&cli.config);
    let settings = Arc::new(
        FileSettingsProvider::open(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?,
    );
    let snapshot = settings.snapshot();

    let db_path = expand_path(&cli.db);
    let store = Arc::new(
        SqliteWorkStore::open(&db_path)
            .with_context(|| format!("opening {}", db_path.display()))?,
    );

    // Every configured step must exist in the catalog
    let steps: BTreeSet<String> = snapshot
        .tasks
        .values()
        .flat_map(|t| t.steps.iter().cloned())
        .collect();
    for step in &steps {
        store.add_step(step).await?;
    }

    let mut handlers = HandlerCatalog::new();
    for step in &steps {
        handlers.register(step.as_str(), Arc::new(PassThrough));
    }
    tracing::info!("🧩 {} step handler(s) registered", handlers.len());

    let pipeline = Arc::new(PipelineOrchestrator::new(store.clone(), Arc::new(handlers)));

    let names: BTreeSet<String> = snapshot.tasks.keys().cloned().collect();
    let mut host = TaskHost::new();
    for name in &names {
        host.register(TaskRunner::new(
            name.clone(),
            settings.clone(),
            pipeline.clone(),
        ))?;
    }

    let root = CancellationToken::new();
    let reload_check = warn_on_unregistered(&settings, names, steps, root.clone());
    let watcher = settings
        .clone()
        .watch(Duration::from_secs(cli.reload_secs.max(1)), root.clone());

    let signal = root.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("🛑 Ctrl-C received, stopping tasks");
            signal.cancel();
        }
    });

    host.start(&root);
    let exits = host.join().await;
    root.cancel();
    watcher.await.ok();
    reload_check.await.ok();

    for (task, exit) in exits {
        match exit {
            RunnerExit::Cancelled => tracing::info!("Task '{task}' cancelled"),
            RunnerExit::Stopped(reason) => tracing::info!("Task '{task}' stopped: {reason}"),
        }
    }
    tracing::info!("👋 Taskline stopped");
    Ok(())
}
