//! Dependency edges between tasks of one attempt.

use super::Database;
use crate::types::{CancelPolicy, Dependency, ErrorPolicy, TaskId, TaskState};
use anyhow::Result;
use rusqlite::{Connection, params};

/// An upstream edge together with the upstream's current state.
#[derive(Debug, Clone)]
pub struct UpstreamState {
    pub upstream_id: TaskId,
    pub upstream_name: String,
    pub state: TaskState,
    pub on_error: ErrorPolicy,
    pub on_canceled: CancelPolicy,
}

pub(crate) fn add_dependency_internal(conn: &Connection, dep: &Dependency) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO task_dependencies (upstream_id, downstream_id, on_error, on_canceled)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            dep.upstream_id,
            dep.downstream_id,
            dep.on_error.as_str(),
            dep.on_canceled.as_str()
        ],
    )?;
    Ok(())
}

pub(crate) fn get_upstream_states_internal(
    conn: &Connection,
    downstream_id: TaskId,
) -> Result<Vec<UpstreamState>> {
    let mut stmt = conn.prepare(
        "SELECT d.upstream_id, t.name, t.state, d.on_error, d.on_canceled
         FROM task_dependencies d
         INNER JOIN tasks t ON d.upstream_id = t.id
         WHERE d.downstream_id = ?1
         ORDER BY d.upstream_id",
    )?;
    let upstreams = stmt
        .query_map(params![downstream_id], |row| {
            let state: String = row.get(2)?;
            let on_error: String = row.get(3)?;
            let on_canceled: String = row.get(4)?;
            Ok(UpstreamState {
                upstream_id: row.get(0)?,
                upstream_name: row.get(1)?,
                state: TaskState::from_str(&state).unwrap_or(TaskState::Blocked),
                on_error: ErrorPolicy::from_str(&on_error).unwrap_or_default(),
                on_canceled: CancelPolicy::from_str(&on_canceled).unwrap_or_default(),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(upstreams)
}

pub(crate) fn get_dependencies_of_attempt_internal(
    conn: &Connection,
    attempt_id: i64,
) -> Result<Vec<Dependency>> {
    let mut stmt = conn.prepare(
        "SELECT d.upstream_id, d.downstream_id, d.on_error, d.on_canceled
         FROM task_dependencies d
         INNER JOIN tasks t ON d.downstream_id = t.id
         WHERE t.attempt_id = ?1
         ORDER BY d.id",
    )?;
    let deps = stmt
        .query_map(params![attempt_id], |row| {
            let on_error: String = row.get(2)?;
            let on_canceled: String = row.get(3)?;
            Ok(Dependency {
                upstream_id: row.get(0)?,
                downstream_id: row.get(1)?,
                on_error: ErrorPolicy::from_str(&on_error).unwrap_or_default(),
                on_canceled: CancelPolicy::from_str(&on_canceled).unwrap_or_default(),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(deps)
}

impl Database {
    /// Make `downstream` wait for every task in `upstreams`.
    pub fn add_dependencies(
        &self,
        downstream_id: TaskId,
        upstreams: &[TaskId],
        on_error: ErrorPolicy,
        on_canceled: CancelPolicy,
    ) -> Result<()> {
        self.with_write_tx(|tx| {
            for upstream_id in upstreams {
                add_dependency_internal(
                    tx,
                    &Dependency {
                        upstream_id: *upstream_id,
                        downstream_id,
                        on_error,
                        on_canceled,
                    },
                )?;
            }
            Ok(())
        })
    }

    /// Upstream ids of a task.
    pub fn get_upstreams(&self, task_id: TaskId) -> Result<Vec<TaskId>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT upstream_id FROM task_dependencies WHERE downstream_id = ?1 ORDER BY upstream_id",
            )?;
            let ids = stmt
                .query_map(params![task_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })
    }

    /// Downstream ids of a task.
    pub fn get_downstreams(&self, task_id: TaskId) -> Result<Vec<TaskId>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT downstream_id FROM task_dependencies WHERE upstream_id = ?1 ORDER BY downstream_id",
            )?;
            let ids = stmt
                .query_map(params![task_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })
    }

    /// Upstream edges of a task with each upstream's current state.
    pub fn get_upstream_states(&self, task_id: TaskId) -> Result<Vec<UpstreamState>> {
        self.with_conn(|conn| get_upstream_states_internal(conn, task_id))
    }

    /// Every edge whose downstream belongs to the attempt.
    pub fn get_attempt_dependencies(&self, attempt_id: i64) -> Result<Vec<Dependency>> {
        self.with_conn(|conn| get_dependencies_of_attempt_internal(conn, attempt_id))
    }
}
