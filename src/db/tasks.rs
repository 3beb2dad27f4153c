//! Task rows and the conditional state setters.
//!
//! Every setter names the state it expects the row to be in. The UPDATE only
//! matches when the stored state still equals it, so two processes racing on
//! one task get exactly one `true` and one `false`.

use super::{Database, json_from_sql, json_to_sql, now_ms};
use crate::types::{
    ErrorReport, IntervalType, RetryConfig, TASK_FLAG_DELAYED_ERROR, Task, TaskId, TaskPolicy,
    TaskResult, TaskState, TaskType,
};
use anyhow::{Result, anyhow};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::Value;
use std::time::Duration;

const TERMINAL_STATES_SQL: &str = "('success', 'error', 'group_error', 'canceled')";

pub fn parse_task_row(row: &Row) -> rusqlite::Result<Task> {
    let task_type: String = row.get("task_type")?;
    let state: String = row.get("state")?;
    let error_json: Option<String> = row.get("error")?;
    let result_json: Option<String> = row.get("result")?;
    let interval_type: String = row.get("retry_interval_type")?;
    let retry_limit: i64 = row.get("retry_limit")?;
    let retry_interval_secs: i64 = row.get("retry_interval_secs")?;

    Ok(Task {
        id: row.get("id")?,
        attempt_id: row.get("attempt_id")?,
        parent_id: row.get("parent_id")?,
        name: row.get("name")?,
        task_type: TaskType::from_str(&task_type).unwrap_or(TaskType::Action),
        state: TaskState::from_str(&state).unwrap_or(TaskState::Blocked),
        state_flags: row.get("state_flags")?,
        config: json_from_sql(row.get("config")?),
        carry_params: json_from_sql(row.get("carry_params")?),
        state_params: json_from_sql(row.get("state_params")?),
        result: result_json.and_then(|s| serde_json::from_str(&s).ok()),
        error: error_json.and_then(|s| serde_json::from_str(&s).ok()),
        policy: TaskPolicy {
            queue: row.get("queue_name")?,
            resource_type: row.get("resource_type")?,
            priority: row.get("priority")?,
            retry: RetryConfig {
                limit: retry_limit.max(0) as u32,
                interval_secs: retry_interval_secs.max(0) as u64,
                interval_type: IntervalType::from_str(&interval_type).unwrap_or_default(),
            },
            ignore_child_errors: row.get("ignore_child_errors")?,
        },
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        retry_at: row.get("retry_at")?,
    })
}

fn check_transition(before: TaskState, after: TaskState) -> Result<()> {
    if before.can_transition_to(after) {
        Ok(())
    } else {
        Err(anyhow!("Illegal task transition {} -> {}", before, after))
    }
}

fn report_to_sql(error: Option<&ErrorReport>) -> Result<Option<String>> {
    error.map(serde_json::to_string).transpose().map_err(Into::into)
}

/// Internal helper to get a task using an existing connection (avoids deadlock).
pub(crate) fn get_task_internal(conn: &Connection, task_id: TaskId) -> Result<Option<Task>> {
    let mut stmt = conn.prepare("SELECT * FROM tasks WHERE id = ?1")?;
    Ok(stmt.query_row(params![task_id], parse_task_row).optional()?)
}

pub(crate) fn get_children_internal(conn: &Connection, parent_id: TaskId) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare("SELECT * FROM tasks WHERE parent_id = ?1 ORDER BY id")?;
    let children = stmt
        .query_map(params![parent_id], parse_task_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(children)
}

pub(crate) fn set_state_internal(
    conn: &Connection,
    task_id: TaskId,
    before: TaskState,
    after: TaskState,
) -> Result<bool> {
    check_transition(before, after)?;
    let updated = conn.execute(
        "UPDATE tasks SET state = ?1, updated_at = ?2 WHERE id = ?3 AND state = ?4",
        params![after.as_str(), now_ms(), task_id, before.as_str()],
    )?;
    Ok(updated > 0)
}

pub(crate) fn set_planned_state_successful_internal(
    conn: &Connection,
    task_id: TaskId,
    before: TaskState,
    after: TaskState,
    result: &TaskResult,
) -> Result<bool> {
    check_transition(before, after)?;
    let updated = conn.execute(
        "UPDATE tasks SET state = ?1, updated_at = ?2, result = ?3, carry_params = ?4,
         error = NULL, retry_at = NULL
         WHERE id = ?5 AND state = ?6",
        params![
            after.as_str(),
            now_ms(),
            json_to_sql(&result.output)?,
            json_to_sql(&result.carry_params)?,
            task_id,
            before.as_str(),
        ],
    )?;
    Ok(updated > 0)
}

pub(crate) fn set_planned_state_with_delayed_error_internal(
    conn: &Connection,
    task_id: TaskId,
    before: TaskState,
    after: TaskState,
    error: &ErrorReport,
) -> Result<bool> {
    check_transition(before, after)?;
    let updated = conn.execute(
        "UPDATE tasks SET state = ?1, updated_at = ?2, state_flags = state_flags | ?3,
         error = ?4, retry_at = NULL
         WHERE id = ?5 AND state = ?6",
        params![
            after.as_str(),
            now_ms(),
            TASK_FLAG_DELAYED_ERROR,
            report_to_sql(Some(error))?,
            task_id,
            before.as_str(),
        ],
    )?;
    Ok(updated > 0)
}

pub(crate) fn set_retry_waiting_state_internal(
    conn: &Connection,
    task_id: TaskId,
    before: TaskState,
    after: TaskState,
    now: i64,
    retry_interval: Duration,
    state_params: &Value,
    error: Option<&ErrorReport>,
) -> Result<bool> {
    check_transition(before, after)?;
    let retry_at = now + retry_interval.as_millis() as i64;
    // An intermediate error is kept for observability; without one the
    // previous error stays as it was.
    let updated = conn.execute(
        "UPDATE tasks SET state = ?1, updated_at = ?2, retry_at = ?3, state_params = ?4,
         error = COALESCE(?5, error)
         WHERE id = ?6 AND state = ?7",
        params![
            after.as_str(),
            now,
            retry_at,
            json_to_sql(state_params)?,
            report_to_sql(error)?,
            task_id,
            before.as_str(),
        ],
    )?;
    Ok(updated > 0)
}

pub(crate) fn set_done_state_internal(
    conn: &Connection,
    task_id: TaskId,
    before: TaskState,
    after: TaskState,
    carry_params: Option<&Value>,
    error: Option<&ErrorReport>,
) -> Result<bool> {
    check_transition(before, after)?;
    if !after.is_terminal() {
        return Err(anyhow!("{} is not a terminal state", after));
    }
    let carry = carry_params.map(json_to_sql).transpose()?.flatten();
    let updated = conn.execute(
        "UPDATE tasks SET state = ?1, updated_at = ?2,
         carry_params = COALESCE(?3, carry_params),
         error = COALESCE(?4, error), retry_at = NULL
         WHERE id = ?5 AND state = ?6",
        params![
            after.as_str(),
            now_ms(),
            carry,
            report_to_sql(error)?,
            task_id,
            before.as_str(),
        ],
    )?;
    Ok(updated > 0)
}

/// Error reports of every child, concatenated in child creation order.
pub(crate) fn collect_children_errors_internal(
    conn: &Connection,
    task_id: TaskId,
) -> Result<ErrorReport> {
    let mut stmt = conn.prepare(
        "SELECT error FROM tasks WHERE parent_id = ?1 AND error IS NOT NULL ORDER BY id",
    )?;
    let mut report = ErrorReport::default();
    let rows = stmt.query_map(params![task_id], |row| row.get::<_, String>(0))?;
    for text in rows {
        if let Ok(child) = serde_json::from_str::<ErrorReport>(&text?) {
            report.extend(child);
        }
    }
    Ok(report)
}

impl Database {
    /// Get a task by id.
    pub fn get_task(&self, task_id: TaskId) -> Result<Option<Task>> {
        self.with_conn(|conn| get_task_internal(conn, task_id))
    }

    /// Children of a task in creation order.
    pub fn get_children(&self, parent_id: TaskId) -> Result<Vec<Task>> {
        self.with_conn(|conn| get_children_internal(conn, parent_id))
    }

    /// Every task of an attempt in creation order.
    pub fn get_attempt_tasks(&self, attempt_id: i64) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM tasks WHERE attempt_id = ?1 ORDER BY id")?;
            let tasks = stmt
                .query_map(params![attempt_id], parse_task_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(tasks)
        })
    }

    pub fn task_count(&self, attempt_id: i64) -> Result<i64> {
        self.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM tasks WHERE attempt_id = ?1",
                params![attempt_id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// One page of tasks in `state`, ordered by id and starting after
    /// `cursor`. `ascending = false` walks bottom-up, so the cursor bounds
    /// the page from above.
    pub fn find_tasks_by_state(
        &self,
        state: TaskState,
        ascending: bool,
        cursor: Option<TaskId>,
        limit: usize,
    ) -> Result<Vec<Task>> {
        let (cmp, order, start) = if ascending {
            (">", "ASC", 0)
        } else {
            ("<", "DESC", i64::MAX)
        };
        let sql = format!(
            "SELECT * FROM tasks WHERE state = ?1 AND id {cmp} ?2 ORDER BY id {order} LIMIT ?3"
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let tasks = stmt
                .query_map(
                    params![state.as_str(), cursor.unwrap_or(start), limit as i64],
                    parse_task_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(tasks)
        })
    }

    /// One page of RETRY_WAITING tasks whose `retry_at` has passed, after
    /// `cursor`.
    pub fn find_due_retry_tasks(
        &self,
        now: i64,
        cursor: Option<TaskId>,
        limit: usize,
    ) -> Result<Vec<TaskId>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM tasks WHERE state = 'retry_waiting' AND retry_at <= ?1 AND id > ?2
                 ORDER BY id LIMIT ?3",
            )?;
            let ids = stmt
                .query_map(params![now, cursor.unwrap_or(0), limit as i64], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })
    }

    /// True if one or more children are not terminal yet.
    pub fn is_any_progressible_child(&self, task_id: TaskId) -> Result<bool> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT EXISTS(SELECT 1 FROM tasks WHERE parent_id = ?1 AND state NOT IN {TERMINAL_STATES_SQL})"
            );
            Ok(conn.query_row(&sql, params![task_id], |row| row.get(0))?)
        })
    }

    /// True if one or more children ended in ERROR or GROUP_ERROR.
    pub fn is_any_error_child(&self, task_id: TaskId) -> Result<bool> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM tasks WHERE parent_id = ?1 AND state IN ('error', 'group_error'))",
                params![task_id],
                |row| row.get(0),
            )?)
        })
    }

    /// Children's error reports concatenated in creation order.
    pub fn collect_children_errors(&self, task_id: TaskId) -> Result<ErrorReport> {
        self.with_conn(|conn| collect_children_errors_internal(conn, task_id))
    }

    /// Plain conditional transition without payload.
    pub fn set_state(&self, task_id: TaskId, before: TaskState, after: TaskState) -> Result<bool> {
        self.with_conn(|conn| set_state_internal(conn, task_id, before, after))
    }

    /// Terminal assignment out of PLANNED with an optional aggregated report.
    pub fn set_done_state(
        &self,
        task_id: TaskId,
        before: TaskState,
        after: TaskState,
        carry_params: Option<&Value>,
        error: Option<&ErrorReport>,
    ) -> Result<bool> {
        self.with_conn(|conn| set_done_state_internal(conn, task_id, before, after, carry_params, error))
    }

    /// Terminal assignment with an error payload, skipping execution.
    pub fn set_done_state_short_circuit(
        &self,
        task_id: TaskId,
        before: TaskState,
        after: TaskState,
        error: &ErrorReport,
    ) -> Result<bool> {
        self.with_conn(|conn| set_done_state_internal(conn, task_id, before, after, None, Some(error)))
    }

    /// Execution finished: store the result and carry params.
    pub fn set_planned_state_successful(
        &self,
        task_id: TaskId,
        before: TaskState,
        after: TaskState,
        result: &TaskResult,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            set_planned_state_successful_internal(conn, task_id, before, after, result)
        })
    }

    /// Execution failed for good: keep the error until the task leaves PLANNED.
    pub fn set_planned_state_with_delayed_error(
        &self,
        task_id: TaskId,
        before: TaskState,
        after: TaskState,
        error: &ErrorReport,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            set_planned_state_with_delayed_error_internal(conn, task_id, before, after, error)
        })
    }

    /// Schedule the task again at `now + retry_interval`.
    pub fn set_retry_waiting_state(
        &self,
        task_id: TaskId,
        before: TaskState,
        after: TaskState,
        retry_interval: Duration,
        state_params: &Value,
        error: Option<&ErrorReport>,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            set_retry_waiting_state_internal(
                conn,
                task_id,
                before,
                after,
                now_ms(),
                retry_interval,
                state_params,
                error,
            )
        })
    }
}
