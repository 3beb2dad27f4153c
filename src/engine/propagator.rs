//! State propagation sweep.
//!
//! Each step scans an indexed `(state, id)` range and tries one conditional
//! transition per task inside its own IMMEDIATE transaction. A transition
//! that finds the row already moved is a silent no-op, so the sweep can run
//! from any number of schedulers at once.

use super::{Engine, merge_params};
use crate::db::attempts::{get_attempt_internal, set_attempt_done_internal};
use crate::db::deps::{UpstreamState, get_upstream_states_internal};
use crate::db::locks::{delete_items_for_task_internal, enqueue_internal};
use crate::db::queues::resolve_queue_internal;
use crate::db::tasks::{
    collect_children_errors_internal, get_children_internal, get_task_internal,
    set_done_state_internal, set_state_internal,
};
use crate::types::{
    AttemptId, CancelPolicy, ErrorPolicy, ErrorReport, TASK_FLAG_CANCEL_REQUESTED,
    TASK_FLAG_DELAYED_ERROR, Task, TaskId, TaskState,
};
use anyhow::Result;
use rusqlite::{Connection, params};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info};

/// Counts of what one sweep moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Tasks short-circuited to CANCELED by a cancel request.
    pub canceled: usize,
    /// RETRY_WAITING tasks whose backoff elapsed.
    pub retries_resumed: usize,
    /// Actions moved to READY and enqueued.
    pub enqueued: usize,
    /// Groups moved to PLANNED.
    pub groups_planned: usize,
    /// BLOCKED tasks that never ran because of an upstream.
    pub short_circuited: usize,
    /// PLANNED tasks that reached a terminal state.
    pub finished: usize,
    /// Attempts marked DONE.
    pub attempts_done: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.canceled
            + self.retries_resumed
            + self.enqueued
            + self.groups_planned
            + self.short_circuited
            + self.finished
            + self.attempts_done
    }

    pub fn is_idle(&self) -> bool {
        self.total() == 0
    }
}

/// Verdict on a BLOCKED task's upstreams.
enum UpstreamVerdict {
    Waiting,
    Satisfied,
    Fail(ErrorReport),
    Cancel,
}

fn judge_upstreams(task: &Task, upstreams: &[UpstreamState]) -> UpstreamVerdict {
    if upstreams.iter().any(|up| !up.state.is_terminal()) {
        return UpstreamVerdict::Waiting;
    }

    let mut canceled = false;
    for up in upstreams {
        match up.state {
            TaskState::Error | TaskState::GroupError if up.on_error == ErrorPolicy::Fail => {
                return UpstreamVerdict::Fail(ErrorReport::single(
                    task.id,
                    &task.name,
                    format!("upstream {} ended in {}", up.upstream_name, up.state),
                    Value::Null,
                ));
            }
            TaskState::Canceled => match up.on_canceled {
                CancelPolicy::Cancel => canceled = true,
                CancelPolicy::Fail => {
                    return UpstreamVerdict::Fail(ErrorReport::single(
                        task.id,
                        &task.name,
                        format!("upstream {} was canceled", up.upstream_name),
                        Value::Null,
                    ));
                }
                CancelPolicy::Ignore => {}
            },
            _ => {}
        }
    }

    if canceled {
        UpstreamVerdict::Cancel
    } else {
        UpstreamVerdict::Satisfied
    }
}

/// Params a task starts with: the attempt's params, then the carry params of
/// every upstream of each ancestor from the root down, then its own upstreams.
pub(crate) fn collect_input_params_internal(conn: &Connection, task: &Task) -> Result<Value> {
    let mut base = get_attempt_internal(conn, task.attempt_id)?
        .map(|a| a.params)
        .unwrap_or(Value::Null);

    let mut chain = vec![task.id];
    let mut parent = task.parent_id;
    while let Some(parent_id) = parent {
        chain.push(parent_id);
        parent = get_task_internal(conn, parent_id)?.and_then(|p| p.parent_id);
    }

    let mut stmt = conn.prepare(
        "SELECT t.carry_params FROM task_dependencies d
         INNER JOIN tasks t ON d.upstream_id = t.id
         WHERE d.downstream_id = ?1 AND t.state = 'success'
         ORDER BY d.upstream_id",
    )?;
    for id in chain.into_iter().rev() {
        let carries = stmt
            .query_map(params![id], |row| row.get::<_, Option<String>>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for carry in carries.into_iter().flatten() {
            if let Ok(carry) = serde_json::from_str::<Value>(&carry) {
                merge_params(&mut base, &carry);
            }
        }
    }
    Ok(base)
}

/// Merge of the children's carry params in creation order, on top of the
/// task's own when it is an action that generated them.
fn merged_children_carry(task: &Task, children: &[Task]) -> Value {
    let mut merged = if task.is_group() {
        Value::Null
    } else {
        task.carry_params.clone()
    };
    for child in children {
        merge_params(&mut merged, &child.carry_params);
    }
    merged
}

/// Visit every row of a keyset scan, one page of `batch` rows at a time.
///
/// `fetch` receives the key of the last row visited; a short page ends the
/// walk.
fn for_each_page<T>(
    batch: usize,
    mut fetch: impl FnMut(Option<i64>) -> Result<Vec<T>>,
    key: impl Fn(&T) -> i64,
    mut visit: impl FnMut(T) -> Result<()>,
) -> Result<()> {
    let mut cursor = None;
    loop {
        let page = fetch(cursor)?;
        let full = page.len() >= batch;
        for row in page {
            cursor = Some(key(&row));
            visit(row)?;
        }
        if !full {
            return Ok(());
        }
    }
}

impl Engine {
    /// Run every sweep step once.
    ///
    /// Each step pages through its whole range `sweep_batch_size` rows at a
    /// time, so tasks that have to keep waiting never hide the rest.
    pub fn run_sweep(&self, now: i64) -> Result<SweepReport> {
        let batch = self.config().sweep_batch_size.max(1);
        let mut report = SweepReport::default();

        for_each_page(
            batch,
            |cursor| self.db().find_canceling_attempts(cursor, batch),
            |id: &AttemptId| *id,
            |attempt_id| {
                report.canceled += self.cancel_pending_tasks(attempt_id)?;
                Ok(())
            },
        )?;

        for_each_page(
            batch,
            |cursor| self.db().find_due_retry_tasks(now, cursor, batch),
            |id: &TaskId| *id,
            |task_id| {
                if self
                    .db()
                    .set_state(task_id, TaskState::RetryWaiting, TaskState::Ready)?
                {
                    debug!(task_id, "retry backoff elapsed");
                    report.retries_resumed += 1;
                }
                Ok(())
            },
        )?;

        // Top-down: parents have smaller ids than their children.
        for_each_page(
            batch,
            |cursor| self.db().find_tasks_by_state(TaskState::Blocked, true, cursor, batch),
            |task: &Task| task.id,
            |task| {
                match self.try_move_blocked_to_ready(task.id, now)? {
                    Some(TaskState::Ready) => report.enqueued += 1,
                    Some(TaskState::Planned) => report.groups_planned += 1,
                    Some(_) => report.short_circuited += 1,
                    None => {}
                }
                Ok(())
            },
        )?;

        // Bottom-up so a group sees its children finish in the same sweep.
        for_each_page(
            batch,
            |cursor| self.db().find_tasks_by_state(TaskState::Planned, false, cursor, batch),
            |task: &Task| task.id,
            |task| {
                if self.try_move_planned_to_done(task.id)?.is_some() {
                    report.finished += 1;
                }
                Ok(())
            },
        )?;

        for_each_page(
            batch,
            |cursor| self.db().find_finishable_attempts(cursor, batch),
            |(id, _): &(AttemptId, TaskState)| *id,
            |(attempt_id, root_state)| {
                let success = root_state == TaskState::Success;
                let done = self
                    .db()
                    .with_conn(|conn| set_attempt_done_internal(conn, attempt_id, success, now))?;
                if done {
                    info!(attempt_id, root_state = %root_state, "attempt done");
                    report.attempts_done += 1;
                }
                Ok(())
            },
        )?;

        if !report.is_idle() {
            debug!(?report, "sweep");
        }
        Ok(report)
    }

    /// Sweep until nothing moves or `max_rounds` is reached.
    pub fn run_until_idle(&self, now: i64, max_rounds: usize) -> Result<SweepReport> {
        let mut total = SweepReport::default();
        for _ in 0..max_rounds {
            let report = self.run_sweep(now)?;
            if report.is_idle() {
                break;
            }
            total.canceled += report.canceled;
            total.retries_resumed += report.retries_resumed;
            total.enqueued += report.enqueued;
            total.groups_planned += report.groups_planned;
            total.short_circuited += report.short_circuited;
            total.finished += report.finished;
            total.attempts_done += report.attempts_done;
        }
        Ok(total)
    }

    /// Short-circuit every not-yet-running task of a canceled attempt.
    ///
    /// RUNNING tasks only get the cancel flag; their lease runs to completion.
    fn cancel_pending_tasks(&self, attempt_id: AttemptId) -> Result<usize> {
        self.db().with_write_tx(|tx| {
            tx.execute(
                "UPDATE tasks SET state_flags = state_flags | ?1
                 WHERE attempt_id = ?2 AND state = 'running' AND state_flags & ?1 = 0",
                params![TASK_FLAG_CANCEL_REQUESTED, attempt_id],
            )?;

            let pending: Vec<(TaskId, String)> = {
                let mut stmt = tx.prepare(
                    "SELECT id, state FROM tasks
                     WHERE attempt_id = ?1 AND state IN ('blocked', 'ready', 'retry_waiting')
                     ORDER BY id",
                )?;
                stmt.query_map(params![attempt_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            };

            let mut canceled = 0;
            for (task_id, state) in pending {
                let Some(before) = TaskState::from_str(&state) else {
                    continue;
                };
                if set_state_internal(tx, task_id, before, TaskState::Canceled)? {
                    tx.execute(
                        "UPDATE tasks SET state_flags = state_flags | ?1 WHERE id = ?2",
                        params![TASK_FLAG_CANCEL_REQUESTED, task_id],
                    )?;
                    delete_items_for_task_internal(tx, task_id)?;
                    canceled += 1;
                }
            }
            if canceled > 0 {
                info!(attempt_id, canceled, "canceled pending tasks");
            }
            Ok(canceled)
        })
    }

    /// Move a BLOCKED task forward once its parent is PLANNED and every
    /// upstream is terminal.
    ///
    /// Returns the state the task was moved to, or `None` if it has to keep
    /// waiting or another process moved it first.
    pub fn try_move_blocked_to_ready(&self, task_id: TaskId, now: i64) -> Result<Option<TaskState>> {
        let default_concurrency = self.config().default_queue_concurrency;
        self.db().with_write_tx(|tx| {
            let Some(task) = get_task_internal(tx, task_id)? else {
                return Ok(None);
            };
            if task.state != TaskState::Blocked {
                return Ok(None);
            }
            if let Some(parent_id) = task.parent_id {
                let parent_planned = get_task_internal(tx, parent_id)?
                    .is_some_and(|p| p.state == TaskState::Planned);
                if !parent_planned {
                    return Ok(None);
                }
            }

            let upstreams = get_upstream_states_internal(tx, task_id)?;
            match judge_upstreams(&task, &upstreams) {
                UpstreamVerdict::Waiting => Ok(None),
                UpstreamVerdict::Fail(report) => {
                    let moved = set_done_state_internal(
                        tx,
                        task_id,
                        TaskState::Blocked,
                        TaskState::Error,
                        None,
                        Some(&report),
                    )?;
                    if moved {
                        info!(task_id, task = %task.name, "short-circuited to error by upstream");
                    }
                    Ok(moved.then_some(TaskState::Error))
                }
                UpstreamVerdict::Cancel => {
                    let moved = set_done_state_internal(
                        tx,
                        task_id,
                        TaskState::Blocked,
                        TaskState::Canceled,
                        None,
                        None,
                    )?;
                    if moved {
                        info!(task_id, task = %task.name, "canceled by upstream");
                    }
                    Ok(moved.then_some(TaskState::Canceled))
                }
                UpstreamVerdict::Satisfied if task.is_group() => {
                    let moved =
                        set_state_internal(tx, task_id, TaskState::Blocked, TaskState::Planned)?;
                    Ok(moved.then_some(TaskState::Planned))
                }
                UpstreamVerdict::Satisfied => {
                    if !set_state_internal(tx, task_id, TaskState::Blocked, TaskState::Ready)? {
                        return Ok(None);
                    }
                    let (queue, resource_type) = resolve_queue_internal(
                        tx,
                        &task.policy.queue,
                        task.policy.resource_type.as_deref(),
                        default_concurrency,
                    )?;
                    let data = json!({
                        "attempt_id": task.attempt_id,
                        "task_name": task.name,
                        "config": task.config,
                        "params": collect_input_params_internal(tx, &task)?,
                    });
                    let item_id =
                        enqueue_internal(tx, &task, &queue, resource_type.as_ref(), &data, now)?;
                    info!(task_id, item_id, task = %task.name, queue = %queue.name, "task ready");
                    Ok(Some(TaskState::Ready))
                }
            }
        })
    }

    /// Finish a PLANNED task once all its children are terminal.
    ///
    /// Groups take their state from their children: GROUP_ERROR on any
    /// unignored error, else CANCELED on any canceled child, else SUCCESS.
    pub fn try_move_planned_to_done(&self, task_id: TaskId) -> Result<Option<TaskState>> {
        self.db().with_write_tx(|tx| {
            let Some(task) = get_task_internal(tx, task_id)? else {
                return Ok(None);
            };
            if task.state != TaskState::Planned {
                return Ok(None);
            }
            let children = get_children_internal(tx, task_id)?;
            if children.iter().any(|c| !c.state.is_terminal()) {
                return Ok(None);
            }

            let errors = collect_children_errors_internal(tx, task_id)?;
            let errors = (!errors.is_empty()).then_some(errors);
            let any_error = children.iter().any(|c| c.state.is_error());
            let any_canceled = children.iter().any(|c| c.state == TaskState::Canceled);

            let (after, carry) = if task.has_flag(TASK_FLAG_DELAYED_ERROR) {
                (TaskState::Error, None)
            } else if !task.is_group() && children.is_empty() {
                (TaskState::Success, None)
            } else if any_error && !task.policy.ignore_child_errors {
                (TaskState::GroupError, None)
            } else if any_canceled {
                (TaskState::Canceled, None)
            } else {
                (TaskState::Success, Some(merged_children_carry(&task, &children)))
            };

            let moved = set_done_state_internal(
                tx,
                task_id,
                TaskState::Planned,
                after,
                carry.as_ref().filter(|c| !c.is_null()),
                errors.as_ref(),
            )?;
            if moved {
                if after == TaskState::Success {
                    debug!(task_id, task = %task.name, "task succeeded");
                } else {
                    info!(task_id, task = %task.name, state = %after, "task finished");
                }
            }
            Ok(moved.then_some(after))
        })
    }
}
