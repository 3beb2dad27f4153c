//! Attempts: creation from a compiled tree, cancellation, retry and archival.

use super::deps::{add_dependency_internal, get_dependencies_of_attempt_internal};
use super::locks::delete_items_for_task_internal;
use super::tasks::parse_task_row;
use super::{Database, json_from_sql, json_to_sql, now_ms};
use crate::error::{EngineError, ErrorCode};
use crate::types::{
    ATTEMPT_FLAG_CANCEL_REQUESTED, ATTEMPT_FLAG_DONE, ATTEMPT_FLAG_SUCCESS, Attempt, AttemptId,
    Dependency, TASK_FLAG_RESUMED, Task, TaskId, TaskPolicy, TaskState, TaskTreeInput, TaskType,
};
use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

fn parse_attempt_row(row: &Row) -> rusqlite::Result<Attempt> {
    Ok(Attempt {
        id: row.get("id")?,
        name: row.get("name")?,
        state_flags: row.get("state_flags")?,
        root_task_id: row.get("root_task_id")?,
        params: json_from_sql(row.get("params")?),
        created_at: row.get("created_at")?,
        finished_at: row.get("finished_at")?,
    })
}

pub(crate) fn get_attempt_internal(conn: &Connection, attempt_id: AttemptId) -> Result<Option<Attempt>> {
    let mut stmt = conn.prepare("SELECT * FROM attempts WHERE id = ?1")?;
    Ok(stmt.query_row(params![attempt_id], parse_attempt_row).optional()?)
}

fn require_attempt(conn: &Connection, attempt_id: AttemptId) -> Result<Attempt> {
    get_attempt_internal(conn, attempt_id)?
        .ok_or_else(|| EngineError::attempt_not_found(attempt_id).into())
}

/// Columns of a task row about to be inserted.
struct NewTask<'a> {
    attempt_id: AttemptId,
    parent_id: Option<TaskId>,
    name: &'a str,
    task_type: TaskType,
    state: TaskState,
    state_flags: i64,
    config: &'a Value,
    carry_params: &'a Value,
    result: Option<&'a Value>,
    policy: &'a TaskPolicy,
}

fn insert_task_internal(conn: &Connection, task: &NewTask<'_>, now: i64) -> Result<TaskId> {
    conn.execute(
        "INSERT INTO tasks (attempt_id, parent_id, name, task_type, state, state_flags,
             config, carry_params, result, queue_name, resource_type, priority,
             retry_limit, retry_interval_secs, retry_interval_type, ignore_child_errors,
             created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?17)",
        params![
            task.attempt_id,
            task.parent_id,
            task.name,
            task.task_type.as_str(),
            task.state.as_str(),
            task.state_flags,
            json_to_sql(task.config)?,
            json_to_sql(task.carry_params)?,
            task.result.map(json_to_sql).transpose()?.flatten(),
            task.policy.queue,
            task.policy.resource_type,
            task.policy.priority,
            task.policy.retry.limit as i64,
            task.policy.retry.interval_secs as i64,
            task.policy.retry.interval_type.as_str(),
            task.policy.ignore_child_errors,
            now,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Insert `node` and its subtree, parents before children.
fn insert_tree_internal(
    conn: &Connection,
    attempt_id: AttemptId,
    parent: Option<(TaskId, &str)>,
    node: &TaskTreeInput,
    now: i64,
) -> Result<TaskId> {
    if parent.is_none() && !node.upstreams.is_empty() {
        return Err(EngineError::invalid_input("Root task cannot have upstreams").into());
    }
    let task_type = node.resolved_type();
    if task_type == TaskType::Action && !node.children.is_empty() {
        return Err(EngineError::invalid_input(format!(
            "Action task {} cannot have children",
            node.name
        ))
        .into());
    }

    let full_name = match parent {
        Some((_, parent_name)) => format!("{}+{}", parent_name, node.name),
        None => format!("+{}", node.name),
    };
    let policy = node.policy();
    let task_id = insert_task_internal(
        conn,
        &NewTask {
            attempt_id,
            parent_id: parent.map(|(id, _)| id),
            name: &full_name,
            task_type,
            state: TaskState::Blocked,
            state_flags: 0,
            config: &node.config,
            carry_params: &Value::Null,
            result: None,
            policy: &policy,
        },
        now,
    )?;

    insert_children_internal(conn, attempt_id, task_id, &full_name, &node.children, now)?;
    Ok(task_id)
}

/// Insert sibling subtrees under `parent_id` and wire their upstream edges.
///
/// Returns the ids of the direct children in input order.
fn insert_children_internal(
    conn: &Connection,
    attempt_id: AttemptId,
    parent_id: TaskId,
    parent_name: &str,
    children: &[TaskTreeInput],
    now: i64,
) -> Result<Vec<TaskId>> {
    let mut sibling_ids: HashMap<&str, TaskId> = HashMap::new();
    let mut ids = Vec::with_capacity(children.len());
    for child in children {
        let child_id = insert_tree_internal(conn, attempt_id, Some((parent_id, parent_name)), child, now)?;
        if sibling_ids.insert(child.key(), child_id).is_some() {
            return Err(EngineError::invalid_input(format!(
                "Duplicate task key {} under {}",
                child.key(),
                parent_name
            ))
            .into());
        }
        ids.push(child_id);
    }

    // Upstream keys resolve among siblings only.
    for child in children {
        let downstream_id = sibling_ids[child.key()];
        for upstream in &child.upstreams {
            let upstream_id = match sibling_ids.get(upstream.key.as_str()) {
                Some(&id) if id != downstream_id => id,
                _ => {
                    return Err(EngineError::unknown_upstream(&child.name, &upstream.key).into());
                }
            };
            add_dependency_internal(
                conn,
                &Dependency {
                    upstream_id,
                    downstream_id,
                    on_error: upstream.on_error,
                    on_canceled: upstream.on_canceled,
                },
            )?;
        }
    }

    Ok(ids)
}

/// Add tasks generated by an action's execution as its children.
///
/// The action must be PLANNED and childless; the new tasks start BLOCKED and
/// the action finishes like a group once they are all terminal.
pub(crate) fn add_subtasks_internal(
    conn: &Connection,
    parent: &Task,
    subtasks: &[TaskTreeInput],
    now: i64,
) -> Result<Vec<TaskId>> {
    if parent.task_type != TaskType::Action {
        return Err(EngineError::invalid_input(format!(
            "Subtasks can only be generated by actions, not {}",
            parent.name
        ))
        .into());
    }
    let has_children: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM tasks WHERE parent_id = ?1)",
        params![parent.id],
        |row| row.get(0),
    )?;
    if has_children {
        return Err(EngineError::invalid_state(format!(
            "Task {} already has subtasks",
            parent.name
        ))
        .into());
    }
    let ids = insert_children_internal(conn, parent.attempt_id, parent.id, &parent.name, subtasks, now)?;
    debug!(task_id = parent.id, count = ids.len(), "subtasks added");
    Ok(ids)
}

pub(crate) fn set_attempt_done_internal(
    conn: &Connection,
    attempt_id: AttemptId,
    success: bool,
    now: i64,
) -> Result<bool> {
    let flags = if success {
        ATTEMPT_FLAG_DONE | ATTEMPT_FLAG_SUCCESS
    } else {
        ATTEMPT_FLAG_DONE
    };
    let updated = conn.execute(
        "UPDATE attempts SET state_flags = state_flags | ?1, finished_at = ?2
         WHERE id = ?3 AND state_flags & ?4 = 0",
        params![flags, now, attempt_id, ATTEMPT_FLAG_DONE],
    )?;
    Ok(updated > 0)
}

/// Ids of tasks that sit before `from` in creation order and are not among
/// its ancestors.
///
/// Ids follow a depth-first walk, so this set is closed under descendants:
/// it holds whole subtrees that were created before the named task.
fn preceding(tasks: &[Task], from: &Task) -> HashSet<TaskId> {
    let parents: HashMap<TaskId, Option<TaskId>> =
        tasks.iter().map(|t| (t.id, t.parent_id)).collect();
    let mut ancestors = HashSet::new();
    let mut parent = from.parent_id;
    while let Some(id) = parent {
        ancestors.insert(id);
        parent = parents.get(&id).copied().flatten();
    }
    tasks
        .iter()
        .filter(|t| t.id < from.id && !ancestors.contains(&t.id))
        .map(|t| t.id)
        .collect()
}

/// Ids of subtrees whose every task ended in SUCCESS.
fn fully_succeeded(tasks: &[Task]) -> HashSet<TaskId> {
    let mut ok: HashSet<TaskId> = tasks
        .iter()
        .filter(|t| t.state == TaskState::Success)
        .map(|t| t.id)
        .collect();
    // Children have larger ids than their parents.
    for task in tasks.iter().rev() {
        if !ok.contains(&task.id)
            && let Some(parent_id) = task.parent_id
        {
            ok.remove(&parent_id);
        }
    }
    ok
}

impl Database {
    /// Insert a compiled task tree as a new attempt with every task BLOCKED.
    pub fn create_attempt(&self, name: &str, params: &Value, tree: &TaskTreeInput) -> Result<AttemptId> {
        let now = now_ms();
        let attempt_id = self.with_write_tx(|tx| {
            tx.execute(
                "INSERT INTO attempts (name, state_flags, params, created_at) VALUES (?1, 0, ?2, ?3)",
                params![name, json_to_sql(params)?, now],
            )?;
            let attempt_id = tx.last_insert_rowid();
            let root_id = insert_tree_internal(tx, attempt_id, None, tree, now)?;
            tx.execute(
                "UPDATE attempts SET root_task_id = ?1 WHERE id = ?2",
                params![root_id, attempt_id],
            )?;
            Ok(attempt_id)
        })?;
        info!(attempt_id, name, "attempt created");
        Ok(attempt_id)
    }

    pub fn get_attempt(&self, attempt_id: AttemptId) -> Result<Option<Attempt>> {
        self.with_conn(|conn| get_attempt_internal(conn, attempt_id))
    }

    /// Most recent attempts first.
    pub fn list_attempts(&self, limit: usize) -> Result<Vec<Attempt>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM attempts ORDER BY id DESC LIMIT ?1")?;
            let attempts = stmt
                .query_map(params![limit as i64], parse_attempt_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(attempts)
        })
    }

    /// Flag an attempt for cancellation. Returns false once it is already done.
    pub fn request_cancel(&self, attempt_id: AttemptId) -> Result<bool> {
        self.with_conn(|conn| {
            let attempt = require_attempt(conn, attempt_id)?;
            if attempt.is_done() {
                return Ok(false);
            }
            conn.execute(
                "UPDATE attempts SET state_flags = state_flags | ?1
                 WHERE id = ?2 AND state_flags & ?3 = 0",
                params![ATTEMPT_FLAG_CANCEL_REQUESTED, attempt_id, ATTEMPT_FLAG_DONE],
            )?;
            info!(attempt_id, "cancel requested");
            Ok(true)
        })
    }

    /// Mark an attempt DONE (and SUCCESS). Returns false if it already was.
    pub fn set_attempt_done(&self, attempt_id: AttemptId, success: bool) -> Result<bool> {
        self.with_conn(|conn| set_attempt_done_internal(conn, attempt_id, success, now_ms()))
    }

    /// One page of attempts with a pending cancel request, after `cursor`.
    pub fn find_canceling_attempts(
        &self,
        cursor: Option<AttemptId>,
        limit: usize,
    ) -> Result<Vec<AttemptId>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM attempts
                 WHERE state_flags & ?1 != 0 AND state_flags & ?2 = 0 AND id > ?3
                 ORDER BY id LIMIT ?4",
            )?;
            let ids = stmt
                .query_map(
                    params![
                        ATTEMPT_FLAG_CANCEL_REQUESTED,
                        ATTEMPT_FLAG_DONE,
                        cursor.unwrap_or(0),
                        limit as i64
                    ],
                    |row| row.get(0),
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })
    }

    /// One page of unfinished attempts whose root task reached a terminal
    /// state, after `cursor`.
    pub fn find_finishable_attempts(
        &self,
        cursor: Option<AttemptId>,
        limit: usize,
    ) -> Result<Vec<(AttemptId, TaskState)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT a.id, t.state FROM attempts a
                 INNER JOIN tasks t ON t.id = a.root_task_id
                 WHERE a.state_flags & ?1 = 0 AND a.id > ?2
                   AND t.state IN ('success', 'error', 'group_error', 'canceled')
                 ORDER BY a.id LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(params![ATTEMPT_FLAG_DONE, cursor.unwrap_or(0), limit as i64], |row| {
                    let state: String = row.get(1)?;
                    Ok((row.get(0)?, state))
                })?
                .collect::<rusqlite::Result<Vec<(AttemptId, String)>>>()?;
            Ok(rows
                .into_iter()
                .filter_map(|(id, state)| TaskState::from_str(&state).map(|s| (id, s)))
                .collect())
        })
    }

    /// Start a new attempt from a finished one.
    ///
    /// Subtrees that fully succeeded are copied as SUCCESS with the RESUMED
    /// flag and keep their results; every other task starts over as BLOCKED.
    /// With `from`, only succeeded subtrees created before the named task are
    /// resumed, so the named task and everything after it run again.
    ///
    /// Subtasks generated by an action that runs again are dropped; the new
    /// run generates its own.
    pub fn create_retry_attempt(
        &self,
        previous_id: AttemptId,
        name: Option<&str>,
        from: Option<&str>,
    ) -> Result<AttemptId> {
        let now = now_ms();
        let attempt_id = self.with_write_tx(|tx| {
            let previous = require_attempt(tx, previous_id)?;
            if !previous.is_done() {
                return Err(EngineError::invalid_state(format!(
                    "Attempt {} is still running",
                    previous_id
                ))
                .into());
            }

            let tasks = {
                let mut stmt = tx.prepare("SELECT * FROM tasks WHERE attempt_id = ?1 ORDER BY id")?;
                stmt.query_map(params![previous_id], parse_task_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            };
            if tasks.is_empty() {
                return Err(EngineError::invalid_state(format!(
                    "Attempt {} has been archived",
                    previous_id
                ))
                .into());
            }
            let mut resumed = fully_succeeded(&tasks);
            if let Some(from) = from {
                let from_task = tasks.iter().find(|t| t.name == from).ok_or_else(|| {
                    EngineError::new(
                        ErrorCode::TaskNotFound,
                        format!("Task {} not found in attempt {}", from, previous_id),
                    )
                })?;
                let before = preceding(&tasks, from_task);
                resumed.retain(|id| before.contains(id));
            }

            tx.execute(
                "INSERT INTO attempts (name, state_flags, params, created_at) VALUES (?1, 0, ?2, ?3)",
                params![
                    name.unwrap_or(&previous.name),
                    json_to_sql(&previous.params)?,
                    now
                ],
            )?;
            let attempt_id = tx.last_insert_rowid();

            let types: HashMap<TaskId, TaskType> =
                tasks.iter().map(|t| (t.id, t.task_type)).collect();
            let mut id_map: HashMap<TaskId, TaskId> = HashMap::new();
            let mut dropped: HashSet<TaskId> = HashSet::new();
            for task in &tasks {
                let keep = resumed.contains(&task.id);
                if let Some(parent_id) = task.parent_id
                    && (dropped.contains(&parent_id)
                        || (types.get(&parent_id) == Some(&TaskType::Action)
                            && !resumed.contains(&parent_id)))
                {
                    dropped.insert(task.id);
                    continue;
                }
                let new_id = insert_task_internal(
                    tx,
                    &NewTask {
                        attempt_id,
                        parent_id: task.parent_id.and_then(|p| id_map.get(&p).copied()),
                        name: &task.name,
                        task_type: task.task_type,
                        state: if keep { TaskState::Success } else { TaskState::Blocked },
                        state_flags: if keep { TASK_FLAG_RESUMED } else { 0 },
                        config: &task.config,
                        carry_params: if keep { &task.carry_params } else { &Value::Null },
                        result: if keep { task.result.as_ref() } else { None },
                        policy: &task.policy,
                    },
                    now,
                )?;
                id_map.insert(task.id, new_id);
            }

            for dep in get_dependencies_of_attempt_internal(tx, previous_id)? {
                if let (Some(&upstream_id), Some(&downstream_id)) =
                    (id_map.get(&dep.upstream_id), id_map.get(&dep.downstream_id))
                {
                    add_dependency_internal(
                        tx,
                        &Dependency {
                            upstream_id,
                            downstream_id,
                            ..dep
                        },
                    )?;
                }
            }

            let root_id = previous.root_task_id.and_then(|id| id_map.get(&id).copied());
            tx.execute(
                "UPDATE attempts SET root_task_id = ?1 WHERE id = ?2",
                params![root_id, attempt_id],
            )?;
            debug!(
                attempt_id,
                resumed = resumed.len(),
                dropped = dropped.len(),
                "copied tasks for retry"
            );
            Ok(attempt_id)
        })?;
        info!(attempt_id, previous_id, "retry attempt created");
        Ok(attempt_id)
    }

    /// Move a finished attempt's tasks into `task_archives`.
    ///
    /// Returns the number of archived tasks.
    pub fn archive_attempt(&self, attempt_id: AttemptId) -> Result<usize> {
        let archived = self.with_write_tx(|tx| {
            let attempt = require_attempt(tx, attempt_id)?;
            if !attempt.is_done() {
                return Err(EngineError::invalid_state(format!(
                    "Attempt {} is still running",
                    attempt_id
                ))
                .into());
            }

            let tasks = {
                let mut stmt = tx.prepare("SELECT * FROM tasks WHERE attempt_id = ?1 ORDER BY id")?;
                stmt.query_map(params![attempt_id], parse_task_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            };
            if tasks.is_empty() {
                return Ok(0);
            }

            tx.execute(
                "INSERT INTO task_archives (id, tasks, created_at) VALUES (?1, ?2, ?3)",
                params![attempt_id, serde_json::to_string(&tasks)?, now_ms()],
            )?;
            for task in &tasks {
                delete_items_for_task_internal(tx, task.id)?;
            }
            tx.execute(
                "DELETE FROM task_dependencies WHERE downstream_id IN
                     (SELECT id FROM tasks WHERE attempt_id = ?1)
                 OR upstream_id IN (SELECT id FROM tasks WHERE attempt_id = ?1)",
                params![attempt_id],
            )?;
            tx.execute("DELETE FROM tasks WHERE attempt_id = ?1", params![attempt_id])?;
            Ok(tasks.len())
        })?;
        info!(attempt_id, archived, "attempt archived");
        Ok(archived)
    }

    /// Tasks of an archived attempt.
    pub fn get_archived_tasks(&self, attempt_id: AttemptId) -> Result<Option<Vec<Task>>> {
        self.with_conn(|conn| {
            let text: Option<String> = conn
                .query_row(
                    "SELECT tasks FROM task_archives WHERE id = ?1",
                    params![attempt_id],
                    |row| row.get(0),
                )
                .optional()?;
            text.map(|t| serde_json::from_str(&t).map_err(Into::into))
                .transpose()
        })
    }
}
