//! Worker loop: claim, execute under heartbeat, report.

use crate::db::now_ms;
use crate::engine::Engine;
use crate::executor::TaskExecutor;
use crate::types::Queue;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

pub struct Worker {
    engine: Engine,
    agent_id: String,
    queue: Queue,
    executor: Arc<dyn TaskExecutor>,
}

impl Worker {
    pub fn new(engine: Engine, agent_id: impl Into<String>, queue: Queue, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            engine,
            agent_id: agent_id.into(),
            queue,
            executor,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Poll until `shutdown` flips to true. A task in flight is finished
    /// and reported before returning.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(agent_id = %self.agent_id, queue = %self.queue.name, "worker started");
        let poll_interval = self.engine.config().poll_interval();
        while !*shutdown.borrow() {
            let worked = match self.run_once().await {
                Ok(worked) => worked,
                Err(e) => {
                    warn!(agent_id = %self.agent_id, error = %e, "worker poll failed");
                    false
                }
            };
            if worked {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(agent_id = %self.agent_id, "worker stopped");
        Ok(())
    }

    /// Claim and execute at most one task. Returns false if none was claimable.
    pub async fn run_once(&self) -> Result<bool> {
        let Some(request) = self.engine.claim(&self.agent_id, self.queue.id, now_ms())? else {
            return Ok(false);
        };

        let mut heartbeat = tokio::time::interval(self.engine.config().heartbeat_interval());
        // The first tick completes immediately; the claim itself just set the lease.
        heartbeat.tick().await;

        let execution = self.executor.execute(&request);
        tokio::pin!(execution);
        let outcome = loop {
            tokio::select! {
                outcome = &mut execution => break outcome,
                _ = heartbeat.tick() => {
                    match self.engine.heartbeat(&self.agent_id, &request, now_ms()) {
                        Ok(true) => {}
                        Ok(false) => warn!(
                            agent_id = %self.agent_id,
                            task_id = request.task_id,
                            "lease lost while executing"
                        ),
                        Err(e) => warn!(agent_id = %self.agent_id, error = %e, "heartbeat failed"),
                    }
                }
            }
        };

        match outcome {
            Ok(result) => {
                self.engine.report_success(&self.agent_id, &request, &result)?;
            }
            Err(failure) => {
                self.engine
                    .report_failure(&self.agent_id, &request, &failure, now_ms())?;
            }
        }
        Ok(true)
    }
}
