//! Worker-side glue between leased locks and task states.

use super::Engine;
use super::retry::{RetryDecision, RetryPolicy};
use crate::db::attempts::add_subtasks_internal;
use crate::db::locks::{
    acquire_next_internal, delete_item_internal, get_lock_internal, is_holder_internal,
    release_internal,
};
use crate::db::now_ms;
use crate::db::tasks::{
    get_task_internal, set_planned_state_successful_internal,
    set_planned_state_with_delayed_error_internal, set_retry_waiting_state_internal,
    set_state_internal,
};
use crate::error::EngineError;
use crate::types::{
    AttemptId, ErrorReport, Lease, QueueId, ReleaseOutcome, TaskFailure, TaskId, TaskResult,
    TaskState,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Stale items skipped per claim before giving up until the next poll.
const MAX_STALE_ITEMS_PER_CLAIM: usize = 8;

/// Everything a worker needs to execute one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub lease: Lease,
    pub task_id: TaskId,
    pub attempt_id: AttemptId,
    pub task_name: String,
    pub config: Value,
    /// Attempt params merged with upstream carry params.
    pub params: Value,
    /// Operator state kept across retries.
    pub state_params: Value,
    /// Retries already spent on this task.
    pub retry_count: i32,
}

impl Engine {
    /// Acquire the next lock of a queue and move its task to RUNNING.
    ///
    /// Items whose task is no longer runnable are discarded. A task that is
    /// still RUNNING belonged to a holder whose lease expired and is taken
    /// over; each takeover spends one retry, and once the task's retry limit
    /// is exceeded it fails instead of running again.
    pub fn claim(&self, agent_id: &str, queue_id: QueueId, now: i64) -> Result<Option<ExecutionRequest>> {
        let lease_duration = self.config().lease_duration();
        let max_interval = self.config().retry_max_interval();
        for _ in 0..MAX_STALE_ITEMS_PER_CLAIM {
            let claimed = self.db().with_write_tx(|tx| {
                let Some(lease) = acquire_next_internal(tx, agent_id, queue_id, now, lease_duration)?
                else {
                    return Ok(None);
                };
                let Some(task) = get_task_internal(tx, lease.task_id)? else {
                    delete_item_internal(tx, lease.item_id)?;
                    return Ok(Some(None));
                };

                match task.state {
                    TaskState::RetryWaiting => {
                        set_state_internal(tx, task.id, TaskState::RetryWaiting, TaskState::Ready)?;
                        set_state_internal(tx, task.id, TaskState::Ready, TaskState::Running)?;
                    }
                    TaskState::Ready => {
                        set_state_internal(tx, task.id, TaskState::Ready, TaskState::Running)?;
                    }
                    TaskState::Running => {
                        // The takeover already counted as a retry on the lock.
                        let policy = RetryPolicy::new(&task.policy.retry, max_interval);
                        if lease.retry_count.max(0) as u32 > policy.limit {
                            let report = ErrorReport::single(
                                task.id,
                                &task.name,
                                format!("lease expired {} times", lease.retry_count),
                                Value::Null,
                            );
                            set_planned_state_with_delayed_error_internal(
                                tx,
                                task.id,
                                TaskState::Running,
                                TaskState::Planned,
                                &report,
                            )?;
                            release_internal(tx, agent_id, lease.item_id, ReleaseOutcome::Failure)?;
                            warn!(
                                task_id = task.id,
                                task = %task.name,
                                retry_count = lease.retry_count,
                                "lease expired too often, failing task"
                            );
                            return Ok(Some(None));
                        }
                        warn!(
                            task_id = task.id,
                            item_id = lease.item_id,
                            agent_id,
                            retry_count = lease.retry_count,
                            "taking over task after lease expiry"
                        );
                    }
                    state => {
                        debug!(task_id = task.id, item_id = lease.item_id, %state, "discarding stale item");
                        delete_item_internal(tx, lease.item_id)?;
                        return Ok(Some(None));
                    }
                }

                let params = lease.data.get("params").cloned().unwrap_or(Value::Null);
                Ok(Some(Some(ExecutionRequest {
                    task_id: task.id,
                    attempt_id: task.attempt_id,
                    task_name: task.name,
                    config: task.config,
                    params,
                    state_params: task.state_params,
                    retry_count: lease.retry_count,
                    lease,
                })))
            })?;

            match claimed {
                None => return Ok(None),
                Some(Some(request)) => {
                    info!(
                        task_id = request.task_id,
                        item_id = request.lease.item_id,
                        agent_id,
                        "task claimed"
                    );
                    return Ok(Some(request));
                }
                Some(None) => continue,
            }
        }
        Ok(None)
    }

    /// Extend the lease of a claimed task.
    pub fn heartbeat(&self, agent_id: &str, request: &ExecutionRequest, now: i64) -> Result<bool> {
        self.db()
            .heartbeat(agent_id, request.lease.item_id, now, self.config().lease_duration())
    }

    /// Record a successful execution: RUNNING -> PLANNED and drop the item.
    ///
    /// Generated subtasks are inserted under the task in the same
    /// transaction. A set of subtasks that does not form a valid tree is
    /// reported as a failure of the execution instead.
    ///
    /// Returns false if the agent no longer holds the lock.
    pub fn report_success(&self, agent_id: &str, request: &ExecutionRequest, result: &TaskResult) -> Result<bool> {
        let item_id = request.lease.item_id;
        let outcome = self.db().with_write_tx(|tx| {
            if !is_holder_internal(tx, agent_id, item_id)? {
                return Ok(false);
            }
            let moved = set_planned_state_successful_internal(
                tx,
                request.task_id,
                TaskState::Running,
                TaskState::Planned,
                result,
            )?;
            if !moved {
                debug!(task_id = request.task_id, "task left RUNNING before its report");
            } else if !result.subtasks.is_empty()
                && let Some(task) = get_task_internal(tx, request.task_id)?
            {
                add_subtasks_internal(tx, &task, &result.subtasks, now_ms())?;
            }
            release_internal(tx, agent_id, item_id, ReleaseOutcome::Success)?;
            Ok(true)
        });

        let accepted = match outcome {
            Err(err) if err.downcast_ref::<EngineError>().is_some() => {
                warn!(task_id = request.task_id, error = %err, "rejected generated subtasks");
                let failure = TaskFailure::new(format!("invalid subtasks: {}", err));
                return self.report_failure(agent_id, request, &failure, now_ms());
            }
            outcome => outcome?,
        };

        if accepted {
            info!(task_id = request.task_id, item_id, agent_id, "execution succeeded");
        } else {
            debug!(task_id = request.task_id, item_id, agent_id, "dropping report from former holder");
        }
        Ok(accepted)
    }

    /// Record a failed execution, retrying while the task's policy allows.
    ///
    /// Returns false if the agent no longer holds the lock.
    pub fn report_failure(
        &self,
        agent_id: &str,
        request: &ExecutionRequest,
        failure: &TaskFailure,
        now: i64,
    ) -> Result<bool> {
        let item_id = request.lease.item_id;
        let max_interval = self.config().retry_max_interval();
        let accepted = self.db().with_write_tx(|tx| {
            if !is_holder_internal(tx, agent_id, item_id)? {
                return Ok(false);
            }
            let Some(task) = get_task_internal(tx, request.task_id)? else {
                release_internal(tx, agent_id, item_id, ReleaseOutcome::Failure)?;
                return Ok(true);
            };
            let retry_count = get_lock_internal(tx, item_id)?
                .map(|lock| lock.retry_count)
                .unwrap_or(request.retry_count)
                .max(0) as u32;

            let report = ErrorReport::single(task.id, &task.name, failure.message.clone(), failure.details.clone());
            let policy = RetryPolicy::new(&task.policy.retry, max_interval);
            let override_interval = failure.retry_interval_secs.map(Duration::from_secs);

            match policy.decide(retry_count, override_interval) {
                RetryDecision::Retry { interval } => {
                    set_retry_waiting_state_internal(
                        tx,
                        task.id,
                        TaskState::Running,
                        TaskState::RetryWaiting,
                        now,
                        interval,
                        &task.state_params,
                        Some(&report),
                    )?;
                    let not_before = now + interval.as_millis() as i64;
                    release_internal(
                        tx,
                        agent_id,
                        item_id,
                        ReleaseOutcome::Retry {
                            not_before: Some(not_before),
                        },
                    )?;
                    info!(
                        task_id = task.id,
                        retry = retry_count + 1,
                        limit = policy.limit,
                        interval_ms = interval.as_millis() as u64,
                        "execution failed, retrying"
                    );
                }
                RetryDecision::Fail => {
                    set_planned_state_with_delayed_error_internal(
                        tx,
                        task.id,
                        TaskState::Running,
                        TaskState::Planned,
                        &report,
                    )?;
                    release_internal(tx, agent_id, item_id, ReleaseOutcome::Failure)?;
                    warn!(task_id = task.id, task = %task.name, error = %failure.message, "execution failed");
                }
            }
            Ok(true)
        })?;

        if !accepted {
            debug!(task_id = request.task_id, item_id, agent_id, "dropping report from former holder");
        }
        Ok(accepted)
    }
}
