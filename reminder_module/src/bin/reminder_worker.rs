use std::env;
use std::sync::Arc;

use chrono::Utc;
use tokio::task;
use tracing::info;

use reminder_module::config::ReminderConfig;
use reminder_module::metrics::ReminderMetrics;
use reminder_module::thread_store::StoredMessage;
use reminder_module::worker::{build_engine, start_worker_threads};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const USAGE: &str = "usage: reminder-worker run | reminder-worker ingest <message.json>";

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt().with_target(false).init();
    dotenvy::dotenv().ok();

    let args: Vec<String> = env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("run") | None => run().await,
        Some("ingest") => {
            let path = args.get(1).ok_or(USAGE)?.clone();
            task::spawn_blocking(move || ingest(&path)).await?
        }
        Some(other) => Err(format!("unknown command '{}'; {}", other, USAGE).into()),
    }
}

async fn run() -> Result<(), BoxError> {
    let config = ReminderConfig::from_env()?;
    let metrics = Arc::new(ReminderMetrics::new());
    let (engine, triggers) = build_engine(&config, metrics.clone())?;
    info!(
        "reminder worker threads={} triggers={} group={} poll={:?}",
        config.thread_db_path.display(),
        config.trigger_db_path.display(),
        config.trigger_group,
        config.poll_interval
    );

    let mut control = start_worker_threads(engine, triggers, config.poll_interval);
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested; stopping reminder worker");
    task::spawn_blocking(move || control.stop_and_join()).await?;

    for (name, count) in metrics.snapshot() {
        info!("final metric {}={}", name, count);
    }
    Ok(())
}

fn ingest(path: &str) -> Result<(), BoxError> {
    let config = ReminderConfig::from_env()?;
    let (engine, _triggers) = build_engine(&config, Arc::new(ReminderMetrics::new()))?;
    let content = std::fs::read_to_string(path)?;
    let message: StoredMessage = serde_json::from_str(&content)?;
    for outcome in engine.ingest_message(&message, Utc::now())? {
        info!(
            "reminder {} -> {:?} at {} ({})",
            outcome.uid,
            outcome.state,
            outcome.scheduled_time.as_deref().unwrap_or("-"),
            outcome.error.as_deref().unwrap_or("ok")
        );
    }
    Ok(())
}
