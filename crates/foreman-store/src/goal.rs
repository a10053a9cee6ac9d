// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::db::{now_epoch, Store};
use crate::work::WorkStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoalStatus {
    Pending,
    Planning,
    Ready,
    Running,
    Complete,
    Failed,
}

impl GoalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "planning" => Some(Self::Planning),
            "ready" => Some(Self::Ready),
            "running" => Some(Self::Running),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ActionStatus {
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
pub struct Goal {
    pub id: String,
    pub title: String,
    pub status: GoalStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct Action {
    pub id: String,
    pub goal_id: String,
    pub seq: u32,
    pub title: String,
    pub status: ActionStatus,
    pub work_item_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

fn row_to_goal(row: &Row<'_>) -> rusqlite::Result<Goal> {
    let status: String = row.get("status")?;
    Ok(Goal {
        id: row.get("id")?,
        title: row.get("title")?,
        status: GoalStatus::parse(&status).unwrap_or(GoalStatus::Failed),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_action(row: &Row<'_>) -> rusqlite::Result<Action> {
    let status: String = row.get("status")?;
    Ok(Action {
        id: row.get("id")?,
        goal_id: row.get("goal_id")?,
        seq: row.get("seq")?,
        title: row.get("title")?,
        status: ActionStatus::parse(&status).unwrap_or(ActionStatus::Failed),
        work_item_id: row.get("work_item_id")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

impl Store {
    pub fn create_goal(&self, title: &str) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = now_epoch();
        self.conn.lock().unwrap().execute(
            "INSERT INTO goals (id, title, status, created_at, updated_at) \
             VALUES (?1, ?2, 'pending', ?3, ?3)",
            params![id, title, now],
        )?;
        Ok(id)
    }

    pub fn get_goal(&self, goal_id: &str) -> Result<Option<Goal>> {
        let conn = self.conn.lock().unwrap();
        let goal = conn
            .query_row("SELECT * FROM goals WHERE id=?1", params![goal_id], row_to_goal)
            .optional()?;
        Ok(goal)
    }

    pub fn set_goal_status(&self, goal_id: &str, status: GoalStatus) -> Result<()> {
        self.conn.lock().unwrap().execute(
            "UPDATE goals SET status=?1, updated_at=?2 WHERE id=?3",
            params![status.as_str(), now_epoch(), goal_id],
        )?;
        Ok(())
    }

    /// Append an action to the goal's ordered list; returns the action id.
    pub fn add_action(&self, goal_id: &str, title: &str) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = now_epoch();
        let conn = self.conn.lock().unwrap();
        let next_seq: u32 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM actions WHERE goal_id=?1",
            params![goal_id],
            |r| r.get(0),
        )?;
        conn.execute(
            "INSERT INTO actions (id, goal_id, seq, title, status, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?5)",
            params![id, goal_id, next_seq, title, now],
        )?;
        Ok(id)
    }

    /// Ordered list of the goal's actions.
    pub fn list_actions(&self, goal_id: &str) -> Result<Vec<Action>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM actions WHERE goal_id=?1 ORDER BY seq")?;
        let actions = stmt
            .query_map(params![goal_id], row_to_action)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(actions)
    }

    pub fn get_action(&self, action_id: &str) -> Result<Option<Action>> {
        let conn = self.conn.lock().unwrap();
        let action = conn
            .query_row(
                "SELECT * FROM actions WHERE id=?1",
                params![action_id],
                row_to_action,
            )
            .optional()?;
        Ok(action)
    }

    pub fn set_action_status(&self, action_id: &str, status: ActionStatus) -> Result<()> {
        self.conn.lock().unwrap().execute(
            "UPDATE actions SET status=?1, updated_at=?2 WHERE id=?3",
            params![status.as_str(), now_epoch(), action_id],
        )?;
        Ok(())
    }

    /// Bind an action to the work item that carries it and mark it running.
    pub fn bind_action_work_item(&self, action_id: &str, work_item_id: &str) -> Result<()> {
        self.conn.lock().unwrap().execute(
            "UPDATE actions SET work_item_id=?1, status='running', updated_at=?2 WHERE id=?3",
            params![work_item_id, now_epoch(), action_id],
        )?;
        Ok(())
    }

    /// Reconcile the goal's Running actions against their bound work items.
    ///
    /// Recovery invariant: a Running action whose work item is Completed
    /// reconciles to Completed; Failed reconciles to Failed; a missing or
    /// still-Pending work item resets the action to Pending.  Returns the
    /// ids of actions whose status changed.
    pub fn reconcile_running_actions(&self, goal_id: &str) -> Result<Vec<String>> {
        let running: Vec<Action> = self
            .list_actions(goal_id)?
            .into_iter()
            .filter(|a| a.status == ActionStatus::Running)
            .collect();

        let mut changed = Vec::new();
        for action in running {
            let new_status = match &action.work_item_id {
                Some(wid) => match self.get_work_item(wid)? {
                    Some(item) => match item.status {
                        WorkStatus::Completed => ActionStatus::Completed,
                        WorkStatus::Failed => ActionStatus::Failed,
                        WorkStatus::Pending => ActionStatus::Pending,
                        WorkStatus::Running => continue,
                    },
                    None => ActionStatus::Pending,
                },
                None => ActionStatus::Pending,
            };
            self.set_action_status(&action.id, new_status)?;
            changed.push(action.id);
        }
        Ok(changed)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_goal_starts_pending() {
        let s = Store::open_in_memory().unwrap();
        let id = s.create_goal("ship it").unwrap();
        let g = s.get_goal(&id).unwrap().unwrap();
        assert_eq!(g.title, "ship it");
        assert_eq!(g.status, GoalStatus::Pending);
    }

    #[test]
    fn goal_status_transitions_persist() {
        let s = Store::open_in_memory().unwrap();
        let id = s.create_goal("g").unwrap();
        s.set_goal_status(&id, GoalStatus::Planning).unwrap();
        assert_eq!(s.get_goal(&id).unwrap().unwrap().status, GoalStatus::Planning);
        s.set_goal_status(&id, GoalStatus::Complete).unwrap();
        assert_eq!(s.get_goal(&id).unwrap().unwrap().status, GoalStatus::Complete);
    }

    #[test]
    fn actions_keep_insertion_order() {
        let s = Store::open_in_memory().unwrap();
        let g = s.create_goal("g").unwrap();
        s.add_action(&g, "first").unwrap();
        s.add_action(&g, "second").unwrap();
        s.add_action(&g, "third").unwrap();
        let titles: Vec<String> = s
            .list_actions(&g)
            .unwrap()
            .into_iter()
            .map(|a| a.title)
            .collect();
        assert_eq!(titles, vec!["first", "second", "third"]);
    }

    #[test]
    fn bind_work_item_marks_action_running() {
        let s = Store::open_in_memory().unwrap();
        let g = s.create_goal("g").unwrap();
        let a = s.add_action(&g, "do it").unwrap();
        let w = s.enqueue("q", "do it", 3).unwrap();
        s.bind_action_work_item(&a, &w).unwrap();
        let action = s.get_action(&a).unwrap().unwrap();
        assert_eq!(action.status, ActionStatus::Running);
        assert_eq!(action.work_item_id.as_deref(), Some(w.as_str()));
    }

    // ── Orphan reconciliation ─────────────────────────────────────────────────

    #[test]
    fn running_action_with_completed_item_reconciles_to_completed() {
        let s = Store::open_in_memory().unwrap();
        let g = s.create_goal("g").unwrap();
        let a = s.add_action(&g, "x").unwrap();
        let w = s.enqueue("q", "x", 3).unwrap();
        s.bind_action_work_item(&a, &w).unwrap();
        s.claim("q", "w1").unwrap();
        s.complete_work_item(&w, "done").unwrap();

        let changed = s.reconcile_running_actions(&g).unwrap();
        assert_eq!(changed, vec![a.clone()]);
        assert_eq!(s.get_action(&a).unwrap().unwrap().status, ActionStatus::Completed);
    }

    #[test]
    fn running_action_with_failed_item_reconciles_to_failed() {
        let s = Store::open_in_memory().unwrap();
        let g = s.create_goal("g").unwrap();
        let a = s.add_action(&g, "x").unwrap();
        let w = s.enqueue("q", "x", 1).unwrap();
        s.bind_action_work_item(&a, &w).unwrap();
        s.claim("q", "w1").unwrap();
        s.fail_work_item(&w, "boom").unwrap();

        s.reconcile_running_actions(&g).unwrap();
        assert_eq!(s.get_action(&a).unwrap().unwrap().status, ActionStatus::Failed);
    }

    #[test]
    fn running_action_with_missing_item_resets_to_pending() {
        let s = Store::open_in_memory().unwrap();
        let g = s.create_goal("g").unwrap();
        let a = s.add_action(&g, "x").unwrap();
        s.bind_action_work_item(&a, "no-such-item").unwrap();

        s.reconcile_running_actions(&g).unwrap();
        assert_eq!(s.get_action(&a).unwrap().unwrap().status, ActionStatus::Pending);
    }

    #[test]
    fn running_action_with_pending_item_resets_to_pending() {
        let s = Store::open_in_memory().unwrap();
        let g = s.create_goal("g").unwrap();
        let a = s.add_action(&g, "x").unwrap();
        let w = s.enqueue("q", "x", 3).unwrap();
        s.bind_action_work_item(&a, &w).unwrap();

        s.reconcile_running_actions(&g).unwrap();
        assert_eq!(s.get_action(&a).unwrap().unwrap().status, ActionStatus::Pending);
    }

    #[test]
    fn action_with_still_running_item_is_left_alone() {
        let s = Store::open_in_memory().unwrap();
        let g = s.create_goal("g").unwrap();
        let a = s.add_action(&g, "x").unwrap();
        let w = s.enqueue("q", "x", 3).unwrap();
        s.bind_action_work_item(&a, &w).unwrap();
        s.claim("q", "w1").unwrap();

        let changed = s.reconcile_running_actions(&g).unwrap();
        assert!(changed.is_empty());
        assert_eq!(s.get_action(&a).unwrap().unwrap().status, ActionStatus::Running);
    }
}
