use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use slotbook::auth::{SessionResolver, StaticSessions};
use slotbook::booking::{AppointmentBook, BookDeps};
use slotbook::clock::{Clock, SystemClock};
use slotbook::compactor::run_compactor;
use slotbook::config::Config;
use slotbook::directory::{InMemoryDirectory, UserDirectory};
use slotbook::http::{self, AppState};
use slotbook::mail::{CancellationMail, LogMailer};
use slotbook::notifications::{NotificationDispatcher, Notifier};
use slotbook::queue::{JobOutcome, JobQueue};

const COMPACT_CHECK_PERIOD: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    slotbook::observability::init(config.metrics_port);

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let directory = match &config.users_file {
        Some(path) => InMemoryDirectory::from_json_file(path)?,
        None => InMemoryDirectory::new(),
    };
    info!("user directory: {} profile(s)", directory.len());
    let directory: Arc<dyn UserDirectory> = Arc::new(directory);

    let sessions = match &config.sessions_file {
        Some(path) => StaticSessions::from_json_file(path)?,
        None => StaticSessions::new(),
    };
    if sessions.is_empty() {
        warn!("no sessions configured, every authenticated route will answer 401");
    }
    let sessions: Arc<dyn SessionResolver> = Arc::new(sessions);

    let notifications = Arc::new(NotificationDispatcher::open(
        &config.data_dir.join("notifications.wal"),
        clock.clone(),
    )?);

    let queue = JobQueue::builder(&config.data_dir, config.queue)
        .register(CancellationMail::new(Arc::new(LogMailer), config.policy.calendar))
        .build()?;

    let book = Arc::new(AppointmentBook::open(
        &config.data_dir.join("appointments.wal"),
        BookDeps {
            directory: directory.clone(),
            notifier: notifications.clone() as Arc<dyn Notifier>,
            queue: queue.clone(),
            clock: clock.clone(),
            policy: config.policy,
        },
    )?);

    // Workers report every finished job here; terminal failures are already logged by the worker.
    let mut workers = queue.process()?;
    tokio::spawn(async move {
        while let Some(outcome) = workers.outcomes.recv().await {
            match outcome {
                JobOutcome::Completed { .. } => {}
                JobOutcome::Failed { queue, job_id, attempts, error } => {
                    warn!("job {job_id} on {queue} given up after {attempts} attempt(s): {error}");
                }
            }
        }
    });

    tokio::spawn(run_compactor(book.clone(), config.compact_threshold, COMPACT_CHECK_PERIOD));
    tokio::spawn(run_compactor(notifications.clone(), config.compact_threshold, COMPACT_CHECK_PERIOD));
    tokio::spawn(run_compactor(Arc::new(queue.clone()), config.compact_threshold, COMPACT_CHECK_PERIOD));

    let app = http::router(AppState {
        book,
        notifications,
        directory,
        sessions,
        clock,
    });

    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("slotbook listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!(
        "  business hours: {:02}:00-{:02}:00",
        config.policy.hours.open_hour, config.policy.hours.close_hour
    );
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("slotbook stopped");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM; in-flight requests are drained by axum.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    info!("shutdown signal received");
}
