//! Queue and resource type definitions.

use super::Database;
use crate::types::{LockMode, Queue, QueueId, ResourceType, ResourceTypeId};
use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::info;

fn parse_queue_row(row: &Row) -> rusqlite::Result<Queue> {
    Ok(Queue {
        id: row.get("id")?,
        name: row.get("name")?,
        max_concurrency: row.get("max_concurrency")?,
    })
}

fn parse_resource_type_row(row: &Row) -> rusqlite::Result<ResourceType> {
    let mode: String = row.get("mode")?;
    Ok(ResourceType {
        id: row.get("id")?,
        queue_id: row.get("queue_id")?,
        name: row.get("name")?,
        max_concurrency: row.get("max_concurrency")?,
        mode: LockMode::from_str(&mode).unwrap_or_default(),
    })
}

pub(crate) fn get_queue_internal(conn: &Connection, queue_id: QueueId) -> Result<Option<Queue>> {
    let mut stmt = conn.prepare("SELECT * FROM queues WHERE id = ?1")?;
    Ok(stmt.query_row(params![queue_id], parse_queue_row).optional()?)
}

pub(crate) fn get_queue_by_name_internal(conn: &Connection, name: &str) -> Result<Option<Queue>> {
    let mut stmt = conn.prepare("SELECT * FROM queues WHERE name = ?1")?;
    Ok(stmt.query_row(params![name], parse_queue_row).optional()?)
}

pub(crate) fn get_resource_type_internal(
    conn: &Connection,
    resource_type_id: ResourceTypeId,
) -> Result<Option<ResourceType>> {
    let mut stmt = conn.prepare("SELECT * FROM resource_types WHERE id = ?1")?;
    Ok(stmt
        .query_row(params![resource_type_id], parse_resource_type_row)
        .optional()?)
}

pub(crate) fn get_resource_type_by_name_internal(
    conn: &Connection,
    queue_id: QueueId,
    name: &str,
) -> Result<Option<ResourceType>> {
    let mut stmt = conn.prepare("SELECT * FROM resource_types WHERE queue_id = ?1 AND name = ?2")?;
    Ok(stmt
        .query_row(params![queue_id, name], parse_resource_type_row)
        .optional()?)
}

fn upsert_queue_internal(conn: &Connection, name: &str, max_concurrency: i32) -> Result<Queue> {
    conn.execute(
        "INSERT INTO queues (name, max_concurrency) VALUES (?1, ?2)
         ON CONFLICT(name) DO UPDATE SET max_concurrency = excluded.max_concurrency",
        params![name, max_concurrency],
    )?;
    get_queue_by_name_internal(conn, name)?
        .ok_or_else(|| anyhow::anyhow!("Queue vanished after upsert: {}", name))
}

fn upsert_resource_type_internal(
    conn: &Connection,
    queue_id: QueueId,
    name: &str,
    max_concurrency: i32,
    mode: LockMode,
) -> Result<ResourceType> {
    let previous = get_resource_type_by_name_internal(conn, queue_id, name)?;
    conn.execute(
        "INSERT INTO resource_types (queue_id, name, max_concurrency, mode) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(queue_id, name) DO UPDATE SET
             max_concurrency = excluded.max_concurrency, mode = excluded.mode",
        params![queue_id, name, max_concurrency, mode.as_str()],
    )?;
    let resource_type = get_resource_type_by_name_internal(conn, queue_id, name)?
        .ok_or_else(|| anyhow::anyhow!("Resource type vanished after upsert: {}", name))?;
    if let Some(previous) = previous
        && previous.mode != mode
    {
        let moved = move_locks_internal(conn, resource_type.id, previous.mode, mode)?;
        info!(
            resource_type = name,
            from = previous.mode.as_str(),
            to = mode.as_str(),
            moved,
            "resource type mode changed"
        );
    }
    Ok(resource_type)
}

/// Move every lock row of a resource type, held or not, between the lock
/// tables. Holders keep their leases.
fn move_locks_internal(
    conn: &Connection,
    resource_type_id: ResourceTypeId,
    from: LockMode,
    to: LockMode,
) -> Result<usize> {
    let moved = conn.execute(
        &format!(
            "INSERT INTO {to} (id, queue_id, priority, resource_type_id, retry_count,
                 hold_expire_time, hold_agent_id)
             SELECT id, queue_id, priority, resource_type_id, retry_count,
                 hold_expire_time, hold_agent_id
             FROM {from} WHERE resource_type_id = ?1",
            to = to.table(),
            from = from.table()
        ),
        params![resource_type_id],
    )?;
    conn.execute(
        &format!("DELETE FROM {} WHERE resource_type_id = ?1", from.table()),
        params![resource_type_id],
    )?;
    Ok(moved)
}

/// Look up a queue (and resource type) by name, creating missing ones.
///
/// Unknown queues get `default_concurrency`; unknown resource types are
/// shared with the queue's own cap.
pub(crate) fn resolve_queue_internal(
    conn: &Connection,
    queue_name: &str,
    resource_type: Option<&str>,
    default_concurrency: i32,
) -> Result<(Queue, Option<ResourceType>)> {
    let queue = match get_queue_by_name_internal(conn, queue_name)? {
        Some(queue) => queue,
        None => {
            conn.execute(
                "INSERT OR IGNORE INTO queues (name, max_concurrency) VALUES (?1, ?2)",
                params![queue_name, default_concurrency],
            )?;
            get_queue_by_name_internal(conn, queue_name)?
                .ok_or_else(|| anyhow::anyhow!("Queue not found: {}", queue_name))?
        }
    };

    let resource = match resource_type {
        None => None,
        Some(name) => match get_resource_type_by_name_internal(conn, queue.id, name)? {
            Some(rt) => Some(rt),
            None => {
                conn.execute(
                    "INSERT OR IGNORE INTO resource_types (queue_id, name, max_concurrency, mode)
                     VALUES (?1, ?2, ?3, 'shared')",
                    params![queue.id, name, queue.max_concurrency],
                )?;
                get_resource_type_by_name_internal(conn, queue.id, name)?
            }
        },
    };

    Ok((queue, resource))
}

impl Database {
    /// Create a queue or update its concurrency cap.
    pub fn upsert_queue(&self, name: &str, max_concurrency: i32) -> Result<Queue> {
        self.with_conn(|conn| upsert_queue_internal(conn, name, max_concurrency))
    }

    /// Create a resource type or update its cap and mode.
    ///
    /// Changing the mode moves the type's queued locks to the other table in
    /// the same transaction.
    pub fn upsert_resource_type(
        &self,
        queue_id: QueueId,
        name: &str,
        max_concurrency: i32,
        mode: LockMode,
    ) -> Result<ResourceType> {
        self.with_write_tx(|tx| {
            upsert_resource_type_internal(tx, queue_id, name, max_concurrency, mode)
        })
    }

    pub fn get_queue(&self, queue_id: QueueId) -> Result<Option<Queue>> {
        self.with_conn(|conn| get_queue_internal(conn, queue_id))
    }

    pub fn get_queue_by_name(&self, name: &str) -> Result<Option<Queue>> {
        self.with_conn(|conn| get_queue_by_name_internal(conn, name))
    }

    pub fn list_queues(&self) -> Result<Vec<Queue>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM queues ORDER BY id")?;
            let queues = stmt
                .query_map([], parse_queue_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(queues)
        })
    }

    pub fn get_resource_type(&self, resource_type_id: ResourceTypeId) -> Result<Option<ResourceType>> {
        self.with_conn(|conn| get_resource_type_internal(conn, resource_type_id))
    }

    /// Resource types of a queue in id order.
    pub fn list_resource_types(&self, queue_id: QueueId) -> Result<Vec<ResourceType>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM resource_types WHERE queue_id = ?1 ORDER BY id")?;
            let types = stmt
                .query_map(params![queue_id], parse_resource_type_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(types)
        })
    }
}
