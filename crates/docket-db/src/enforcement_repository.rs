//! Enforcement audit repository.
//!
//! One immutable row per evaluated mutation attempt, blocked or not. The
//! repository exposes insert and list only; schema triggers reject updates
//! and deletes.

use rusqlite::{params, Connection};
use uuid::Uuid;

use docket_core::models::EnforcementKind;
use docket_core::validation::ValidationErrors;

use crate::{now_rfc3339, DbError};

/// Immutable record of one enforcement evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnforcementAction {
    pub id: String,
    pub org_id: String,
    pub case_id: String,
    pub actor_id: String,
    pub action_type: String,
    pub enforcement_kind: EnforcementKind,
    pub was_blocked: bool,
    pub reason: Option<String>,
    pub context_json: String,
    pub created_at: String,
}

pub struct EnforcementRepository<'a> {
    conn: &'a Connection,
}

impl<'a> EnforcementRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, action: &mut EnforcementAction) -> Result<(), DbError> {
        let mut errors = ValidationErrors::new();
        errors.require("org_id", &action.org_id);
        errors.require("case_id", &action.case_id);
        errors.require("actor_id", &action.actor_id);
        errors.require("action_type", &action.action_type);
        errors.into_result()?;

        if action.context_json.trim().is_empty() {
            action.context_json = "{}".to_string();
        }
        if serde_json::from_str::<serde_json::Value>(&action.context_json).is_err() {
            return Err(DbError::Validation(
                "enforcement context must be valid JSON".into(),
            ));
        }

        if action.id.trim().is_empty() {
            action.id = Uuid::new_v4().to_string();
        }
        action.created_at = now_rfc3339();

        self.conn.execute(
            "INSERT INTO enforcement_actions (
                id, org_id, case_id, actor_id, action_type, enforcement_kind,
                was_blocked, reason, context_json, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                action.id,
                action.org_id,
                action.case_id,
                action.actor_id,
                action.action_type,
                action.enforcement_kind.as_str(),
                action.was_blocked as i64,
                action.reason,
                action.context_json,
                action.created_at,
            ],
        )?;
        Ok(())
    }

    /// All enforcement records for a case, oldest first.
    pub fn list_by_case(
        &self,
        org_id: &str,
        case_id: &str,
    ) -> Result<Vec<EnforcementAction>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, org_id, case_id, actor_id, action_type, enforcement_kind,
                    was_blocked, reason, context_json, created_at
             FROM enforcement_actions
             WHERE org_id = ?1 AND case_id = ?2
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![org_id, case_id], scan_action)?;
        let mut actions = Vec::new();
        for row in rows {
            actions.push(row?);
        }
        Ok(actions)
    }
}

fn scan_action(row: &rusqlite::Row<'_>) -> rusqlite::Result<EnforcementAction> {
    let kind_str: String = row.get(5)?;
    let enforcement_kind =
        EnforcementKind::parse(&kind_str).map_err(crate::to_sql_conversion_error)?;
    Ok(EnforcementAction {
        id: row.get(0)?,
        org_id: row.get(1)?,
        case_id: row.get(2)?,
        actor_id: row.get(3)?,
        action_type: row.get(4)?,
        enforcement_kind,
        was_blocked: row.get::<_, i64>(6)? != 0,
        reason: row.get(7)?,
        context_json: row.get(8)?,
        created_at: row.get(9)?,
    })
}
