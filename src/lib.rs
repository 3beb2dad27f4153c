//! Task Graph Engine Library
//!
//! Task state machine and leased dispatch queue for workflow attempts. Every
//! scheduler and worker process opens its own handle on one shared SQLite
//! store and coordinates only through conditional writes.

pub mod cli;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod logging;
pub mod scheduler;
pub mod types;
pub mod worker;
