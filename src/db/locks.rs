//! Queued items and the leased locks that guard them.
//!
//! A lock row shares the id of its queued item and lives in one of two tables
//! picked by the resource type's mode. Acquisition is a single conditional
//! UPDATE whose WHERE clause re-checks availability and both concurrency caps,
//! so the store decides the winner among any number of racing workers.

use super::queues::{get_queue_internal, get_resource_type_internal};
use super::{Database, json_from_sql, json_to_sql};
use crate::types::{
    ItemId, Lease, Lock, LockMode, Queue, QueueId, QueuedItem, ReleaseOutcome, ResourceType,
    ResourceTypeId, Task, TaskId,
};
use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const LOCK_TABLES: [LockMode; 2] = [LockMode::Shared, LockMode::Exclusive];

/// Candidates fetched per acquisition round.
const ACQUIRE_SCAN_LIMIT: i64 = 16;

/// Held rows of one queue across both lock tables. `?1` = queue id, `?2` = now.
const QUEUE_HELD_SQL: &str = "(SELECT COUNT(*) FROM queued_shared_task_locks
      WHERE queue_id = ?1 AND hold_agent_id IS NOT NULL AND hold_expire_time > ?2)
   + (SELECT COUNT(*) FROM queued_task_locks
      WHERE queue_id = ?1 AND hold_agent_id IS NOT NULL AND hold_expire_time > ?2)";

/// Held rows of one resource type. `?3` = resource type id, `?2` = now.
const RESOURCE_HELD_SQL: &str = "(SELECT COUNT(*) FROM queued_shared_task_locks
      WHERE resource_type_id = ?3 AND hold_agent_id IS NOT NULL AND hold_expire_time > ?2)
   + (SELECT COUNT(*) FROM queued_task_locks
      WHERE resource_type_id = ?3 AND hold_agent_id IS NOT NULL AND hold_expire_time > ?2)";

fn lease_ms(lease: Duration) -> i64 {
    lease.as_millis().min(i64::MAX as u128) as i64
}

fn parse_item_row(row: &Row) -> rusqlite::Result<QueuedItem> {
    Ok(QueuedItem {
        id: row.get("id")?,
        queue_id: row.get("queue_id")?,
        priority: row.get("priority")?,
        resource_type_id: row.get("resource_type_id")?,
        task_id: row.get("task_id")?,
        data: json_from_sql(row.get("data")?),
        created_at: row.get("created_at")?,
    })
}

fn parse_lock_row(row: &Row, mode: LockMode) -> rusqlite::Result<Lock> {
    Ok(Lock {
        item_id: row.get("id")?,
        queue_id: row.get("queue_id")?,
        priority: row.get("priority")?,
        resource_type_id: row.get("resource_type_id")?,
        retry_count: row.get("retry_count")?,
        hold_expire_time: row.get("hold_expire_time")?,
        hold_agent_id: row.get("hold_agent_id")?,
        mode,
    })
}

pub(crate) fn get_item_internal(conn: &Connection, item_id: ItemId) -> Result<Option<QueuedItem>> {
    let mut stmt = conn.prepare("SELECT * FROM queued_items WHERE id = ?1")?;
    Ok(stmt.query_row(params![item_id], parse_item_row).optional()?)
}

pub(crate) fn get_item_for_task_internal(
    conn: &Connection,
    task_id: TaskId,
) -> Result<Option<QueuedItem>> {
    let mut stmt = conn.prepare("SELECT * FROM queued_items WHERE task_id = ?1 ORDER BY id LIMIT 1")?;
    Ok(stmt.query_row(params![task_id], parse_item_row).optional()?)
}

pub(crate) fn get_lock_internal(conn: &Connection, item_id: ItemId) -> Result<Option<Lock>> {
    for mode in LOCK_TABLES {
        let sql = format!("SELECT * FROM {} WHERE id = ?1", mode.table());
        let mut stmt = conn.prepare(&sql)?;
        if let Some(lock) = stmt
            .query_row(params![item_id], |row| parse_lock_row(row, mode))
            .optional()?
        {
            return Ok(Some(lock));
        }
    }
    Ok(None)
}

/// Insert a queued item and its unlocked lock row.
///
/// Enqueueing a task that already has an item in the queue returns the
/// existing item id.
pub(crate) fn enqueue_internal(
    conn: &Connection,
    task: &Task,
    queue: &Queue,
    resource_type: Option<&ResourceType>,
    data: &Value,
    now: i64,
) -> Result<ItemId> {
    let resource_type_id = resource_type.map(|rt| rt.id);
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO queued_items (queue_id, priority, resource_type_id, task_id, data, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            queue.id,
            task.policy.priority,
            resource_type_id,
            task.id,
            json_to_sql(data)?.unwrap_or_else(|| "null".to_string()),
            now
        ],
    )?;

    let item_id: ItemId = conn.query_row(
        "SELECT id FROM queued_items WHERE queue_id = ?1 AND task_id = ?2",
        params![queue.id, task.id],
        |row| row.get(0),
    )?;

    if inserted == 0 {
        debug!(task_id = task.id, item_id, "task already enqueued");
        return Ok(item_id);
    }

    let mode = resource_type.map(|rt| rt.mode).unwrap_or_default();
    let sql = format!(
        "INSERT INTO {} (id, queue_id, priority, resource_type_id, retry_count) VALUES (?1, ?2, ?3, ?4, 0)",
        mode.table()
    );
    conn.execute(
        &sql,
        params![item_id, queue.id, task.policy.priority, resource_type_id],
    )?;

    debug!(
        task_id = task.id,
        item_id,
        queue = %queue.name,
        mode = mode.as_str(),
        "enqueued"
    );
    Ok(item_id)
}

fn lease_from_row(
    conn: &Connection,
    item_id: ItemId,
    agent_id: &str,
    expire_time: i64,
    mode: LockMode,
) -> Result<Option<Lease>> {
    let Some(item) = get_item_internal(conn, item_id)? else {
        return Ok(None);
    };
    let retry_count: i32 = conn.query_row(
        &format!("SELECT retry_count FROM {} WHERE id = ?1", mode.table()),
        params![item_id],
        |row| row.get(0),
    )?;
    Ok(Some(Lease {
        item_id,
        task_id: item.task_id,
        queue_id: item.queue_id,
        resource_type_id: item.resource_type_id,
        agent_id: agent_id.to_string(),
        expire_time,
        retry_count,
        mode,
        data: item.data,
    }))
}

pub(crate) fn held_count_internal(
    conn: &Connection,
    queue_id: QueueId,
    resource_type_id: Option<ResourceTypeId>,
    now: i64,
) -> Result<i64> {
    let count = match resource_type_id {
        None => conn.query_row(
            &format!("SELECT {QUEUE_HELD_SQL}"),
            params![queue_id, now],
            |row| row.get(0),
        )?,
        Some(rt) => conn.query_row(
            &format!("SELECT {RESOURCE_HELD_SQL}"),
            params![queue_id, now, rt],
            |row| row.get(0),
        )?,
    };
    Ok(count)
}

/// Claim the best acquirable lock of one `(queue, resource type)` group.
pub(crate) fn acquire_internal(
    conn: &Connection,
    agent_id: &str,
    queue: &Queue,
    resource_type: Option<&ResourceType>,
    now: i64,
    lease: Duration,
) -> Result<Option<Lease>> {
    if held_count_internal(conn, queue.id, None, now)? >= queue.max_concurrency as i64 {
        return Ok(None);
    }
    if let Some(rt) = resource_type
        && held_count_internal(conn, queue.id, Some(rt.id), now)? >= rt.effective_concurrency() as i64
    {
        return Ok(None);
    }

    let mode = resource_type.map(|rt| rt.mode).unwrap_or_default();
    let resource_type_id = resource_type.map(|rt| rt.id);
    let resource_cap = resource_type.map(|rt| rt.effective_concurrency());
    let expire_time = now + lease_ms(lease);

    let candidates: Vec<ItemId> = {
        let sql = format!(
            "SELECT id FROM {} WHERE queue_id = ?1 AND resource_type_id IS ?2
               AND (hold_expire_time IS NULL OR hold_expire_time <= ?3)
             ORDER BY priority DESC, id ASC LIMIT ?4",
            mode.table()
        );
        let mut stmt = conn.prepare(&sql)?;
        stmt.query_map(
            params![queue.id, resource_type_id, now, ACQUIRE_SCAN_LIMIT],
            |row| row.get(0),
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?
    };

    // Taking over an expired holder counts as a retry.
    let claim_sql = format!(
        "UPDATE {table} SET hold_agent_id = ?4, hold_expire_time = ?5,
             retry_count = retry_count + (hold_agent_id IS NOT NULL)
         WHERE id = ?6
           AND (hold_expire_time IS NULL OR hold_expire_time <= ?2)
           AND {QUEUE_HELD_SQL} < ?7
           AND (?3 IS NULL OR {RESOURCE_HELD_SQL} < ?8)",
        table = mode.table()
    );

    for item_id in candidates {
        let updated = conn.execute(
            &claim_sql,
            params![
                queue.id,
                now,
                resource_type_id,
                agent_id,
                expire_time,
                item_id,
                queue.max_concurrency,
                resource_cap
            ],
        )?;
        if updated > 0 {
            debug!(agent_id, item_id, queue = %queue.name, "lock acquired");
            return lease_from_row(conn, item_id, agent_id, expire_time, mode);
        }
        debug!(agent_id, item_id, "lost acquisition race");
    }

    Ok(None)
}

/// Try the queue's no-resource group, then each resource type in id order.
pub(crate) fn acquire_next_internal(
    conn: &Connection,
    agent_id: &str,
    queue_id: QueueId,
    now: i64,
    lease: Duration,
) -> Result<Option<Lease>> {
    let Some(queue) = get_queue_internal(conn, queue_id)? else {
        return Ok(None);
    };
    if let Some(lease) = acquire_internal(conn, agent_id, &queue, None, now, lease)? {
        return Ok(Some(lease));
    }

    let resource_type_ids: Vec<ResourceTypeId> = {
        let mut stmt = conn.prepare("SELECT id FROM resource_types WHERE queue_id = ?1 ORDER BY id")?;
        stmt.query_map(params![queue_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?
    };
    for rt_id in resource_type_ids {
        let Some(rt) = get_resource_type_internal(conn, rt_id)? else {
            continue;
        };
        if let Some(lease) = acquire_internal(conn, agent_id, &queue, Some(&rt), now, lease)? {
            return Ok(Some(lease));
        }
    }
    Ok(None)
}

/// True while `agent_id` is recorded as the holder of the item's lock.
///
/// An expired holder still counts until another agent takes the row over;
/// its report only releases the lock, so it cannot push a group over its cap.
pub(crate) fn is_holder_internal(conn: &Connection, agent_id: &str, item_id: ItemId) -> Result<bool> {
    Ok(get_lock_internal(conn, item_id)?
        .is_some_and(|lock| lock.hold_agent_id.as_deref() == Some(agent_id)))
}

pub(crate) fn heartbeat_internal(
    conn: &Connection,
    agent_id: &str,
    item_id: ItemId,
    now: i64,
    lease: Duration,
) -> Result<bool> {
    let expire_time = now + lease_ms(lease);
    // An expired lease is never revived: its slot may already count toward
    // another holder under the caps.
    for mode in LOCK_TABLES {
        let sql = format!(
            "UPDATE {} SET hold_expire_time = ?1
             WHERE id = ?2 AND hold_agent_id = ?3 AND hold_expire_time > ?4",
            mode.table()
        );
        if conn.execute(&sql, params![expire_time, item_id, agent_id, now])? > 0 {
            return Ok(true);
        }
    }
    debug!(agent_id, item_id, "heartbeat rejected");
    Ok(false)
}

pub(crate) fn release_internal(
    conn: &Connection,
    agent_id: &str,
    item_id: ItemId,
    outcome: ReleaseOutcome,
) -> Result<bool> {
    for mode in LOCK_TABLES {
        let table = mode.table();
        let updated = match outcome {
            ReleaseOutcome::Success | ReleaseOutcome::Failure => conn.execute(
                &format!("DELETE FROM {table} WHERE id = ?1 AND hold_agent_id = ?2"),
                params![item_id, agent_id],
            )?,
            ReleaseOutcome::Retry { not_before } => conn.execute(
                &format!(
                    "UPDATE {table} SET hold_agent_id = NULL, hold_expire_time = ?1,
                     retry_count = retry_count + 1
                     WHERE id = ?2 AND hold_agent_id = ?3"
                ),
                params![not_before, item_id, agent_id],
            )?,
        };
        if updated == 0 {
            continue;
        }
        if matches!(outcome, ReleaseOutcome::Success | ReleaseOutcome::Failure) {
            conn.execute("DELETE FROM queued_items WHERE id = ?1", params![item_id])?;
        }
        debug!(agent_id, item_id, ?outcome, "lock released");
        return Ok(true);
    }
    Ok(false)
}

/// Remove every queued item and lock of a task, whoever holds them.
pub(crate) fn delete_items_for_task_internal(conn: &Connection, task_id: TaskId) -> Result<usize> {
    for mode in LOCK_TABLES {
        conn.execute(
            &format!(
                "DELETE FROM {} WHERE id IN (SELECT id FROM queued_items WHERE task_id = ?1)",
                mode.table()
            ),
            params![task_id],
        )?;
    }
    Ok(conn.execute("DELETE FROM queued_items WHERE task_id = ?1", params![task_id])?)
}

/// Remove a single queued item and its lock.
pub(crate) fn delete_item_internal(conn: &Connection, item_id: ItemId) -> Result<bool> {
    for mode in LOCK_TABLES {
        conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", mode.table()),
            params![item_id],
        )?;
    }
    Ok(conn.execute("DELETE FROM queued_items WHERE id = ?1", params![item_id])? > 0)
}

impl Database {
    /// Add a task to a queue with an unlocked lock row.
    pub fn enqueue(
        &self,
        task: &Task,
        queue: &Queue,
        resource_type: Option<&ResourceType>,
        data: &Value,
        now: i64,
    ) -> Result<ItemId> {
        self.with_write_tx(|tx| enqueue_internal(tx, task, queue, resource_type, data, now))
    }

    /// Claim the next lock of one `(queue, resource type)` group.
    ///
    /// Returns `None` when nothing is acquirable or a cap is reached.
    pub fn acquire(
        &self,
        agent_id: &str,
        queue: &Queue,
        resource_type: Option<&ResourceType>,
        now: i64,
        lease: Duration,
    ) -> Result<Option<Lease>> {
        self.with_write_tx(|tx| acquire_internal(tx, agent_id, queue, resource_type, now, lease))
    }

    /// Claim the next lock anywhere in a queue.
    pub fn acquire_next(
        &self,
        agent_id: &str,
        queue_id: QueueId,
        now: i64,
        lease: Duration,
    ) -> Result<Option<Lease>> {
        self.with_write_tx(|tx| acquire_next_internal(tx, agent_id, queue_id, now, lease))
    }

    /// Extend a lease. Fails once the lease has expired or another agent has
    /// taken the lock.
    pub fn heartbeat(&self, agent_id: &str, item_id: ItemId, now: i64, lease: Duration) -> Result<bool> {
        self.with_conn(|conn| heartbeat_internal(conn, agent_id, item_id, now, lease))
    }

    /// Give a lock back. Returns false if `agent_id` is no longer the holder.
    pub fn release(&self, agent_id: &str, item_id: ItemId, outcome: ReleaseOutcome) -> Result<bool> {
        self.with_write_tx(|tx| release_internal(tx, agent_id, item_id, outcome))
    }

    pub fn delete_items_for_task(&self, task_id: TaskId) -> Result<usize> {
        self.with_write_tx(|tx| delete_items_for_task_internal(tx, task_id))
    }

    /// Non-expired held locks of a queue, or of one resource type.
    pub fn held_count(
        &self,
        queue_id: QueueId,
        resource_type_id: Option<ResourceTypeId>,
        now: i64,
    ) -> Result<i64> {
        self.with_conn(|conn| held_count_internal(conn, queue_id, resource_type_id, now))
    }

    pub fn get_lock(&self, item_id: ItemId) -> Result<Option<Lock>> {
        self.with_conn(|conn| get_lock_internal(conn, item_id))
    }

    pub fn get_item(&self, item_id: ItemId) -> Result<Option<QueuedItem>> {
        self.with_conn(|conn| get_item_internal(conn, item_id))
    }

    /// The queued item of a task together with its lock, if any.
    pub fn get_task_lock(&self, task_id: TaskId) -> Result<Option<(QueuedItem, Lock)>> {
        self.with_conn(|conn| {
            let Some(item) = get_item_for_task_internal(conn, task_id)? else {
                return Ok(None);
            };
            Ok(get_lock_internal(conn, item.id)?.map(|lock| (item, lock)))
        })
    }

    /// Number of queued items, held or not.
    pub fn queue_depth(&self, queue_id: QueueId) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM queued_items WHERE queue_id = ?1",
                params![queue_id],
                |row| row.get(0),
            )?)
        })
    }
}
