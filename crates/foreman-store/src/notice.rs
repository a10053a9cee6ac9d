// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use anyhow::Result;
use rusqlite::{params, Row};

use crate::db::{now_epoch, Store};

/// A completion notification written by a worker when it finishes (or
/// fails) a work item.  The supervisor drains unconsumed notices on each
/// wake and folds them into one synthetic message per turn.
#[derive(Debug, Clone)]
pub struct CompletionNotice {
    pub id: i64,
    pub work_item_id: String,
    pub queue: String,
    /// Final work-item status at notification time ("completed" / "failed").
    pub status: String,
    pub created_at: i64,
}

fn row_to_notice(row: &Row<'_>) -> rusqlite::Result<CompletionNotice> {
    Ok(CompletionNotice {
        id: row.get("id")?,
        work_item_id: row.get("work_item_id")?,
        queue: row.get("queue")?,
        status: row.get("status")?,
        created_at: row.get("created_at")?,
    })
}

impl Store {
    /// Record a completion notice for a finished work item.
    pub fn record_notice(&self, work_item_id: &str, queue: &str, status: &str) -> Result<()> {
        self.conn.lock().unwrap().execute(
            "INSERT INTO notices (work_item_id, queue, status, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![work_item_id, queue, status, now_epoch()],
        )?;
        Ok(())
    }

    /// Read and consume all pending notices, oldest first.
    ///
    /// Consumption is part of the same transaction as the read so a notice
    /// is delivered at most once even across supervisor restarts.
    pub fn drain_notices(&self) -> Result<Vec<CompletionNotice>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let notices = {
            let mut stmt =
                tx.prepare("SELECT * FROM notices WHERE consumed=0 ORDER BY id")?;
            let rows = stmt.query_map([], row_to_notice)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        tx.execute("UPDATE notices SET consumed=1 WHERE consumed=0", [])?;
        tx.commit()?;
        Ok(notices)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_returns_unconsumed_in_order() {
        let s = Store::open_in_memory().unwrap();
        s.record_notice("w1", "q", "completed").unwrap();
        s.record_notice("w2", "q", "failed").unwrap();
        let notices = s.drain_notices().unwrap();
        assert_eq!(notices.len(), 2);
        assert_eq!(notices[0].work_item_id, "w1");
        assert_eq!(notices[1].work_item_id, "w2");
        assert_eq!(notices[1].status, "failed");
    }

    #[test]
    fn drain_consumes_notices() {
        let s = Store::open_in_memory().unwrap();
        s.record_notice("w1", "q", "completed").unwrap();
        assert_eq!(s.drain_notices().unwrap().len(), 1);
        assert!(s.drain_notices().unwrap().is_empty());
    }

    #[test]
    fn notices_recorded_after_drain_are_delivered_next_time() {
        let s = Store::open_in_memory().unwrap();
        s.record_notice("w1", "q", "completed").unwrap();
        s.drain_notices().unwrap();
        s.record_notice("w2", "q", "completed").unwrap();
        let second = s.drain_notices().unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].work_item_id, "w2");
    }
}
