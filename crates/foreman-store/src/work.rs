// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;
use uuid::Uuid;

use crate::db::{now_epoch, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkItem {
    pub id: String,
    pub queue: String,
    pub payload: String,
    pub status: WorkStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub owner: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub result: Option<String>,
}

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<WorkItem> {
    let status: String = row.get("status")?;
    Ok(WorkItem {
        id: row.get("id")?,
        queue: row.get("queue")?,
        payload: row.get("payload")?,
        status: WorkStatus::parse(&status).unwrap_or(WorkStatus::Failed),
        attempts: row.get("attempts")?,
        max_attempts: row.get("max_attempts")?,
        owner: row.get("owner")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        result: row.get("result")?,
    })
}

impl Store {
    /// Append a new pending item to the named queue.
    pub fn enqueue(&self, queue: &str, payload: &str, max_attempts: u32) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = now_epoch();
        self.conn.lock().unwrap().execute(
            "INSERT INTO work_items (id, queue, payload, status, attempts, max_attempts, \
             created_at, updated_at) VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5, ?5)",
            params![id, queue, payload, max_attempts, now],
        )?;
        debug!(queue, item = %id, "enqueued work item");
        Ok(id)
    }

    /// Atomically claim the oldest pending item on `queue` for `worker_id`.
    ///
    /// The claim is a single UPDATE … RETURNING so two concurrent workers
    /// can never both receive the same item: exactly one caller gets the
    /// row, the other gets `None`.
    pub fn claim(&self, queue: &str, worker_id: &str) -> Result<Option<WorkItem>> {
        let conn = self.conn.lock().unwrap();
        let item = conn
            .query_row(
                "UPDATE work_items SET status='running', owner=?1, updated_at=?2 \
                 WHERE id=(SELECT id FROM work_items WHERE queue=?3 AND status='pending' \
                           ORDER BY created_at, rowid LIMIT 1) \
                 RETURNING *",
                params![worker_id, now_epoch(), queue],
                row_to_item,
            )
            .optional()?;
        if let Some(ref it) = item {
            debug!(queue, item = %it.id, worker = worker_id, "claimed work item");
        }
        Ok(item)
    }

    /// Mark a running item completed and record its result.
    pub fn complete_work_item(&self, item_id: &str, result: &str) -> Result<()> {
        self.conn.lock().unwrap().execute(
            "UPDATE work_items SET status='completed', result=?1, updated_at=?2 WHERE id=?3",
            params![result, now_epoch(), item_id],
        )?;
        Ok(())
    }

    /// Record a failed delivery.  The item returns to pending while
    /// attempts remain, otherwise it settles as failed.
    pub fn fail_work_item(&self, item_id: &str, err: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE work_items SET attempts = attempts + 1, updated_at=?1, result=?2, \
             owner=NULL, \
             status = CASE WHEN attempts + 1 < max_attempts THEN 'pending' ELSE 'failed' END \
             WHERE id=?3",
            params![now_epoch(), err, item_id],
        )?;
        Ok(())
    }

    pub fn get_work_item(&self, item_id: &str) -> Result<Option<WorkItem>> {
        let conn = self.conn.lock().unwrap();
        let item = conn
            .query_row(
                "SELECT * FROM work_items WHERE id=?1",
                params![item_id],
                row_to_item,
            )
            .optional()?;
        Ok(item)
    }

    /// Number of pending items on a queue.
    pub fn pending_count(&self, queue: &str) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let n: u64 = conn.query_row(
            "SELECT COUNT(*) FROM work_items WHERE queue=?1 AND status='pending'",
            params![queue],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    /// Requeue running items whose claiming worker is gone.
    ///
    /// `is_owner_alive` judges the claim owner (typically by pid probe).
    /// A worker that died mid-item leaves the item in Running; this sweep
    /// — run on supervisor start — returns it to Pending without charging
    /// an attempt.  Returns the requeued item ids.
    pub fn requeue_orphaned_running(
        &self,
        is_owner_alive: impl Fn(&str) -> bool,
    ) -> Result<Vec<String>> {
        let running: Vec<(String, Option<String>)> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt =
                conn.prepare("SELECT id, owner FROM work_items WHERE status='running'")?;
            let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut requeued = Vec::new();
        for (id, owner) in running {
            let alive = owner.as_deref().map(&is_owner_alive).unwrap_or(false);
            if alive {
                continue;
            }
            self.conn.lock().unwrap().execute(
                "UPDATE work_items SET status='pending', owner=NULL, updated_at=?1 \
                 WHERE id=?2 AND status='running'",
                params![now_epoch(), id],
            )?;
            debug!(item = %id, "requeued orphaned work item");
            requeued.push(id);
        }
        Ok(requeued)
    }

    /// Items currently running under the given owner.
    pub fn running_for_owner(&self, owner: &str) -> Result<Vec<WorkItem>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM work_items WHERE owner=?1 AND status='running'")?;
        let items = stmt
            .query_map(params![owner], row_to_item)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
