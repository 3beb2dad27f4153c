//! CLI command definitions for task-graph-engine.
//!
//! This module defines the CLI structure using clap's derive macros.
//! The main entry point is the `Cli` struct which contains subcommands.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Task graph engine: submit attempts, run schedulers and workers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to database file (overrides config)
    #[arg(short, long, global = true)]
    pub database: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Logging output: 0/off, 1/stdout, 2/stderr (default), or filename
    #[arg(short, long, default_value = "2", global = true)]
    pub log: String,

    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create or resize a queue
    Queue(QueueArgs),

    /// Create or resize a resource type within a queue
    ResourceType(ResourceTypeArgs),

    /// Submit a compiled task tree (JSON or YAML) as a new attempt
    Submit(SubmitArgs),

    /// Run the propagation sweep
    Scheduler(SchedulerArgs),

    /// Run a worker executing shell tasks
    Worker(WorkerArgs),

    /// Show an attempt and its tasks
    Status(StatusArgs),

    /// Request cancellation of an attempt
    Cancel(AttemptArg),

    /// Start a new attempt re-running the failed parts of a finished one,
    /// or everything from a named task on
    Retry(RetryArgs),

    /// Archive the tasks of a finished attempt
    Archive(AttemptArg),
}

#[derive(Args, Debug)]
pub struct QueueArgs {
    /// Queue name
    pub name: String,

    /// Maximum locks held at once across the queue
    #[arg(long)]
    pub max_concurrency: i32,
}

#[derive(Args, Debug)]
pub struct ResourceTypeArgs {
    /// Queue the resource type belongs to
    pub queue: String,

    /// Resource type name
    pub name: String,

    /// Maximum locks held at once for this resource type
    #[arg(long)]
    pub max_concurrency: i32,

    /// Allow a single holder regardless of max-concurrency
    #[arg(long)]
    pub exclusive: bool,
}

#[derive(Args, Debug)]
pub struct SubmitArgs {
    /// Task tree file (.json, .yaml or .yml)
    pub file: PathBuf,

    /// Attempt name (defaults to the root task name)
    #[arg(long)]
    pub name: Option<String>,

    /// Attempt params as a JSON object
    #[arg(long)]
    pub params: Option<String>,
}

#[derive(Args, Debug)]
pub struct SchedulerArgs {
    /// Sweep until idle once, then exit
    #[arg(long)]
    pub once: bool,
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Agent id recorded on acquired locks (defaults to worker-<pid>)
    #[arg(long)]
    pub agent_id: Option<String>,

    /// Queue to poll (defaults to the configured default queue)
    #[arg(long)]
    pub queue: Option<String>,

    /// Exit after the first poll that finds no work
    #[arg(long)]
    pub once: bool,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Attempt id
    pub attempt: i64,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct AttemptArg {
    /// Attempt id
    pub attempt: i64,
}

#[derive(Args, Debug)]
pub struct RetryArgs {
    /// Finished attempt to retry
    pub attempt: i64,

    /// Name of the new attempt (defaults to the previous name)
    #[arg(long)]
    pub name: Option<String>,

    /// Full task name (e.g. +root+load) to resume from; earlier succeeded
    /// tasks are kept, this task and everything after it run again
    #[arg(long)]
    pub from: Option<String>,
}
