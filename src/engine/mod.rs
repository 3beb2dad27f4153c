//! Engine: propagation sweep, dispatch, and the client-facing operations.
//!
//! Any number of engines may run against one store. They never talk to each
//! other; every step is a conditional write that at most one of them wins.

pub mod dispatch;
pub mod propagator;
pub mod retry;

pub use dispatch::ExecutionRequest;
pub use propagator::SweepReport;
pub use retry::{RetryDecision, RetryPolicy};

use crate::config::EngineConfig;
use crate::db::Database;
use crate::error::{EngineError, EngineResult};
use crate::types::{
    Attempt, AttemptId, AttemptStatus, ErrorReport, LockMode, Queue, ResourceType, Task,
    TaskTreeInput,
};
use serde::Serialize;
use serde_json::Value;

/// Engine handle shared by the scheduler and worker loops.
#[derive(Clone)]
pub struct Engine {
    db: Database,
    config: EngineConfig,
}

/// Attempt with its derived status and every task, for display.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptSummary {
    pub attempt: Attempt,
    pub status: AttemptStatus,
    pub tasks: Vec<Task>,
    /// Error report of the root task, if any.
    pub error: Option<ErrorReport>,
}

impl Engine {
    pub fn new(db: Database, config: EngineConfig) -> Self {
        Self { db, config }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Submit a compiled task tree as a new attempt.
    pub fn submit(&self, name: &str, params: &Value, tree: &TaskTreeInput) -> EngineResult<AttemptId> {
        if tree.name.trim().is_empty() {
            return Err(EngineError::invalid_input("Root task name is empty"));
        }
        Ok(self.db.create_attempt(name, params, tree)?)
    }

    /// Request cancellation. Returns false if the attempt already finished.
    pub fn cancel(&self, attempt_id: AttemptId) -> EngineResult<bool> {
        Ok(self.db.request_cancel(attempt_id)?)
    }

    /// Re-run the failed parts of a finished attempt, or with `from` the
    /// named task and everything created after it.
    pub fn retry(
        &self,
        attempt_id: AttemptId,
        name: Option<&str>,
        from: Option<&str>,
    ) -> EngineResult<AttemptId> {
        Ok(self.db.create_retry_attempt(attempt_id, name, from)?)
    }

    pub fn archive(&self, attempt_id: AttemptId) -> EngineResult<usize> {
        Ok(self.db.archive_attempt(attempt_id)?)
    }

    pub fn status(&self, attempt_id: AttemptId) -> EngineResult<AttemptSummary> {
        let attempt = self
            .db
            .get_attempt(attempt_id)?
            .ok_or_else(|| EngineError::attempt_not_found(attempt_id))?;
        let tasks = self.db.get_attempt_tasks(attempt_id)?;
        let error = attempt
            .root_task_id
            .and_then(|root| tasks.iter().find(|t| t.id == root))
            .and_then(|root| root.error.clone());
        Ok(AttemptSummary {
            status: attempt.status(),
            attempt,
            tasks,
            error,
        })
    }

    /// Create a queue or change its cap.
    pub fn define_queue(&self, name: &str, max_concurrency: i32) -> EngineResult<Queue> {
        if max_concurrency < 1 {
            return Err(EngineError::invalid_input("max_concurrency must be at least 1"));
        }
        Ok(self.db.upsert_queue(name, max_concurrency)?)
    }

    /// Create a resource type on an existing queue or change its cap and mode.
    pub fn define_resource_type(
        &self,
        queue_name: &str,
        name: &str,
        max_concurrency: i32,
        mode: LockMode,
    ) -> EngineResult<ResourceType> {
        if max_concurrency < 1 {
            return Err(EngineError::invalid_input("max_concurrency must be at least 1"));
        }
        let queue = self
            .db
            .get_queue_by_name(queue_name)?
            .ok_or_else(|| EngineError::queue_not_found(queue_name))?;
        Ok(self
            .db
            .upsert_resource_type(queue.id, name, max_concurrency, mode)?)
    }

    /// Look up a queue for polling, creating it with the default cap.
    pub fn ensure_queue(&self, name: &str) -> EngineResult<Queue> {
        if let Some(queue) = self.db.get_queue_by_name(name)? {
            return Ok(queue);
        }
        Ok(self
            .db
            .upsert_queue(name, self.config.default_queue_concurrency)?)
    }
}

/// Shallow-merge the keys of `overlay` into `base`. Later keys win.
pub(crate) fn merge_params(base: &mut Value, overlay: &Value) {
    let Value::Object(overlay) = overlay else {
        return;
    };
    if !base.is_object() {
        *base = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(base) = base {
        for (key, value) in overlay {
            base.insert(key.clone(), value.clone());
        }
    }
}
