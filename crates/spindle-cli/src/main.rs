use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use spindle_core::domain::{EnqueueOptions, Lane, TaskEnvelope, TaskState};
use spindle_core::observability::init_tracing;
use spindle_core::typed::{Handler, TypedTask};
use spindle_core::{AppBuilder, Config, SpindleError, Worker};

#[derive(Debug, Parser)]
#[command(name = "spindle", version, about = "Distributed task scheduling toolkit")]
struct Cli {
    /// TOML config file; `SPINDLE_*` env vars override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run an in-memory worker through a retrying task, a lock race and a cache round trip.
    Demo {
        /// How many times the send_email handler fails before succeeding.
        #[arg(long, default_value_t = 2)]
        failures: u32,
    },
    /// Print the resolved configuration as JSON.
    Config,
}

#[derive(Debug, Serialize, Deserialize)]
struct SendEmail {
    to: String,
}

impl TypedTask for SendEmail {
    const TYPE: &'static str = "send_email";
}

/// Fails `remaining_failures` times, then succeeds.
struct FlakyMailer {
    remaining_failures: AtomicU32,
}

#[async_trait]
impl Handler<SendEmail> for FlakyMailer {
    async fn handle(&self, task: SendEmail, envelope: &TaskEnvelope) -> spindle_core::Result<()> {
        let left = self.remaining_failures.load(Ordering::SeqCst);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(SpindleError::handler(format!("intentional failure (left={left})")));
        }
        info!(to = %task.to, attempt = envelope.attempt(), "email sent");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = Config::from_env(cli.config.as_deref()).context("loading configuration")?;
    match cli.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Demo { failures } => demo(config, failures).await,
    }
}

async fn demo(mut config: Config, failures: u32) -> anyhow::Result<()> {
    // keep the demo snappy
    config.queue.poll_interval_ms = 20;
    config.queue.retry_base_ms = 200;
    config.queue.retry_max_ms = 2_000;

    let worker = AppBuilder::new(config)
        .register::<SendEmail, _>(FlakyMailer {
            remaining_failures: AtomicU32::new(failures),
        })
        .expect_tasks(&[SendEmail::TYPE])
        .build()?;
    worker.run().await?;

    let result = async {
        retrying_task(&worker, failures).await?;
        lock_race(&worker).await?;
        cache_round_trip(&worker).await
    }
    .await;

    worker.shutdown().await;
    result
}

async fn retrying_task(worker: &Worker, failures: u32) -> anyhow::Result<()> {
    let info = worker
        .send_typed(
            &SendEmail {
                to: "ops@example.com".into(),
            },
            EnqueueOptions::new().lane(Lane::High).max_retry(failures),
        )
        .await?;
    info!(task_id = %info.id, lane = %info.lane, "enqueued send_email");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let current = worker.inspector().task_info(Lane::High, &info.id).await?;
        if matches!(current.state, TaskState::Completed | TaskState::Archived) {
            info!(
                state = %current.state,
                retry_count = current.retry_count,
                last_error = ?current.last_error,
                "send_email finished"
            );
            let counts = worker.inspector().lane_counts(Lane::High).await?;
            info!(?counts, "lane counts");
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("send_email did not finish in time (state={})", current.state);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn lock_race(worker: &Worker) -> anyhow::Result<()> {
    let locks = worker.locks();
    let held = locks.acquire("render_url_X", Some(Duration::from_secs(2))).await?;
    info!(key = held.key(), "first holder acquired lock");

    match locks.acquire("render_url_X", Some(Duration::from_millis(600))).await {
        Err(SpindleError::LockTimeout { elapsed, .. }) => info!(?elapsed, "second holder timed out"),
        Err(err) => return Err(err.into()),
        Ok(guard) => {
            warn!("second holder acquired a held lock");
            guard.release().await?;
        }
    }

    held.release().await?;
    let again = locks.acquire("render_url_X", Some(Duration::from_secs(2))).await?;
    info!("lock acquired again after release");
    again.release().await?;
    Ok(())
}

async fn cache_round_trip(worker: &Worker) -> anyhow::Result<()> {
    let cache = worker.cache();
    cache
        .set_json("greeting", &serde_json::json!({ "hello": "spindle" }), None)
        .await?;
    let value: serde_json::Value = cache.get_json("greeting").await?;
    info!(%value, "cache hit");

    cache.delete("greeting").await?;
    match cache.get("greeting").await {
        Err(err) if err.is_not_found() => info!("cache entry deleted from every tier"),
        Err(err) => return Err(err.into()),
        Ok(_) => bail!("cache entry survived delete"),
    }
    Ok(())
}
