//! `pullsync-agent`: headless task follower.
//!
//! Starts one engine against the configured job service, optionally starts
//! a job for every subject named on the command line, then logs task
//! changes until interrupted.
//!
//! ```text
//! pullsync-agent [SUBJECT ...]
//! ```
//!
//! Configuration comes from the environment (see
//! [`EngineConfig::from_env`]); a `.env` file is honoured.

use std::sync::Arc;

use pullsync_cache::{FileStore, SharedStorage};
use pullsync_core::TaskMap;
use pullsync_engine::{EngineConfig, HttpJobService, JobService, TaskEngine, TaskView};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pullsync_agent=info,pullsync_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    });

    let service = HttpJobService::new(&config.service_url).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Cannot use job service URL");
        std::process::exit(1);
    });

    tracing::info!(
        service_url = %config.service_url,
        cache_dir = %config.cache_dir.display(),
        namespace = %config.cache_namespace,
        "Starting pullsync-agent",
    );

    let storage = SharedStorage::new(Arc::new(FileStore::new(&config.cache_dir))).attach_tab();
    let engine = TaskEngine::start(&config, Arc::new(service) as Arc<dyn JobService>, storage);

    for subject in std::env::args().skip(1) {
        match engine.start_job(&subject).await {
            Ok(task_id) => tracing::info!(task_id = %task_id, subject = %subject, "Started job"),
            Err(e) => tracing::error!(subject = %subject, error = %e, "Failed to start job"),
        }
    }

    let mut views = engine.subscribe();
    let mut last = views.borrow_and_update().clone();
    log_summary(&last);

    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            _ = &mut interrupt => {
                tracing::info!("Interrupt received");
                break;
            }
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                log_changes(&last, &view);
                last = view;
            }
        }
    }

    engine.shutdown().await;
}

fn log_summary(view: &TaskView) {
    tracing::info!(
        tasks = view.tasks.len(),
        active = view.active().count(),
        dismissed = view.dismissed.len(),
        "Loaded cached tasks",
    );
}

fn log_changes(before: &TaskView, after: &TaskView) {
    if after.sync_error != before.sync_error {
        match &after.sync_error {
            Some(error) => tracing::warn!(error = %error, "Task list out of sync"),
            None => tracing::info!("Task list in sync"),
        }
    }
    log_task_changes(&before.tasks, &after.tasks);
}

fn log_task_changes(before: &TaskMap, after: &TaskMap) {
    for (id, task) in after {
        match before.get(id) {
            Some(old) if old.same_content(task) => {}
            Some(old) if old.status == task.status => {
                tracing::debug!(task_id = %id, progress = ?task.progress, "Progress");
            }
            _ => {
                tracing::info!(
                    task_id = %id,
                    subject = %task.subject_name,
                    status = %task.status,
                    error = task.error.as_deref().unwrap_or(""),
                    "Task status",
                );
            }
        }
    }
    for id in before.keys().filter(|id| !after.contains_key(*id)) {
        tracing::info!(task_id = %id, "Task removed");
    }
}
