//! task-graph-engine CLI: queue setup, submission, scheduler and worker loops.

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use task_graph_engine::cli::{
    AttemptArg, Cli, Command, QueueArgs, ResourceTypeArgs, RetryArgs, SchedulerArgs, StatusArgs,
    SubmitArgs, WorkerArgs,
};
use task_graph_engine::config::Config;
use task_graph_engine::db::{Database, now_ms};
use task_graph_engine::engine::{AttemptSummary, Engine};
use task_graph_engine::executor::ShellExecutor;
use task_graph_engine::logging::{self, LogTarget};
use task_graph_engine::scheduler::Scheduler;
use task_graph_engine::types::{LockMode, TaskTreeInput};
use task_graph_engine::worker::Worker;
use tokio::sync::watch;
use tracing::info;

/// Rounds `scheduler --once` sweeps before giving up on reaching idle.
const ONCE_MAX_ROUNDS: usize = 1000;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(&LogTarget::parse(&cli.log), cli.verbose)?;

    let mut config = match &cli.config {
        Some(path) => {
            let mut config = Config::load(path)
                .with_context(|| format!("loading config from {}", path.display()))?;
            config.apply_env_overrides();
            config
        }
        None => Config::load_or_default(),
    };
    if let Some(db_path) = &cli.database {
        config.store.db_path = db_path.clone();
    }
    config.ensure_db_dir()?;

    let db = Database::open(&config.store.db_path)
        .with_context(|| format!("opening {}", config.store.db_path.display()))?;
    let engine = Engine::new(db, config.engine.clone());

    match cli.command {
        Command::Queue(args) => run_queue(&engine, args)?,
        Command::ResourceType(args) => run_resource_type(&engine, args)?,
        Command::Submit(args) => run_submit(&engine, args)?,
        Command::Scheduler(args) => run_scheduler(engine, args).await?,
        Command::Worker(args) => run_worker(engine, args).await?,
        Command::Status(args) => run_status(&engine, args)?,
        Command::Cancel(AttemptArg { attempt }) => {
            if engine.cancel(attempt)? {
                println!("Cancel requested for attempt {}", attempt);
            } else {
                println!("Attempt {} already finished", attempt);
            }
        }
        Command::Retry(args) => run_retry(&engine, args)?,
        Command::Archive(AttemptArg { attempt }) => {
            let archived = engine.archive(attempt)?;
            println!("Archived {} tasks of attempt {}", archived, attempt);
        }
    }

    Ok(())
}

fn run_queue(engine: &Engine, args: QueueArgs) -> Result<()> {
    let queue = engine.define_queue(&args.name, args.max_concurrency)?;
    println!("Queue {} (id {}): max concurrency {}", queue.name, queue.id, queue.max_concurrency);
    Ok(())
}

fn run_resource_type(engine: &Engine, args: ResourceTypeArgs) -> Result<()> {
    let mode = if args.exclusive {
        LockMode::Exclusive
    } else {
        LockMode::Shared
    };
    let rt = engine.define_resource_type(&args.queue, &args.name, args.max_concurrency, mode)?;
    println!(
        "Resource type {}/{} (id {}): max concurrency {}, {}",
        args.queue,
        rt.name,
        rt.id,
        rt.effective_concurrency(),
        rt.mode.as_str()
    );
    Ok(())
}

fn load_tree(path: &Path) -> Result<TaskTreeInput> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let tree = if is_yaml {
        serde_yaml::from_str(&content)?
    } else {
        serde_json::from_str(&content)?
    };
    Ok(tree)
}

fn run_submit(engine: &Engine, args: SubmitArgs) -> Result<()> {
    let tree = load_tree(&args.file)?;
    let params: Value = match &args.params {
        Some(text) => serde_json::from_str(text).context("parsing --params")?,
        None => Value::Null,
    };
    let name = args.name.as_deref().unwrap_or(&tree.name);
    let attempt_id = engine.submit(name, &params, &tree)?;
    println!("{}", attempt_id);
    Ok(())
}

fn shutdown_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            let _ = tx.send(true);
        }
    });
    rx
}

async fn run_scheduler(engine: Engine, args: SchedulerArgs) -> Result<()> {
    if args.once {
        let report = engine.run_until_idle(now_ms(), ONCE_MAX_ROUNDS)?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    Scheduler::new(engine).run(shutdown_channel()).await
}

async fn run_worker(engine: Engine, args: WorkerArgs) -> Result<()> {
    let queue_name = args
        .queue
        .clone()
        .unwrap_or_else(|| engine.config().default_queue.clone());
    let queue = engine.ensure_queue(&queue_name)?;
    let agent_id = args
        .agent_id
        .unwrap_or_else(|| format!("worker-{}", std::process::id()));
    let worker = Worker::new(engine, agent_id, queue, Arc::new(ShellExecutor));

    if args.once {
        while worker.run_once().await? {}
        return Ok(());
    }
    worker.run(shutdown_channel()).await
}

fn run_status(engine: &Engine, args: StatusArgs) -> Result<()> {
    let summary = engine.status(args.attempt)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn print_summary(summary: &AttemptSummary) {
    println!(
        "Attempt {} ({}): {}",
        summary.attempt.id, summary.attempt.name, summary.status
    );
    println!("{:>6}  {:<14}  {:<6}  NAME", "ID", "STATE", "TYPE");
    for task in &summary.tasks {
        println!(
            "{:>6}  {:<14}  {:<6}  {}",
            task.id,
            task.state.as_str(),
            task.task_type.as_str(),
            task.name
        );
    }
    if let Some(error) = &summary.error {
        println!("Errors:");
        for entry in &error.entries {
            println!("  {} ({}): {}", entry.task_name, entry.task_id, entry.message);
        }
    }
}

fn run_retry(engine: &Engine, args: RetryArgs) -> Result<()> {
    let attempt_id = engine.retry(args.attempt, args.name.as_deref(), args.from.as_deref())?;
    println!("{}", attempt_id);
    Ok(())
}
