//! Case budget repository: authorization limits, the append-only adjustment
//! log, and service-level limits.
//!
//! There is no direct mutation path for limit values. Every change goes
//! through `adjust`, which appends one immutable `budget_adjustments` row and
//! re-derives the live `case_budgets` row from it. Schema triggers reject any
//! non-insert write against the adjustment log.

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use docket_core::models::BudgetKind;
use docket_core::validation::ValidationErrors;

use crate::{now_rfc3339, DbError};

/// Live authorization limits for a case. Absence of a row means the case is
/// open: no case-level enforcement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaseBudget {
    pub id: String,
    pub org_id: String,
    pub case_id: String,
    pub hours_limit_minutes: Option<i64>,
    pub amount_limit_cents: Option<i64>,
    pub hard_cap: bool,
    pub note: String,
    pub created_at: String,
    pub updated_at: String,
}

/// One immutable record in the authorization audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetAdjustment {
    pub id: String,
    pub org_id: String,
    pub case_id: String,
    pub kind: BudgetKind,
    pub previous_value: Option<i64>,
    pub new_value: i64,
    pub reason: String,
    pub actor_id: String,
    pub created_at: String,
}

/// Optional per-service-instance cap, narrower than the case-level one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceBudgetLimit {
    pub id: String,
    pub org_id: String,
    pub service_instance_id: String,
    pub max_minutes: Option<i64>,
    pub max_amount_cents: Option<i64>,
    pub warning_threshold_pct: i64,
    pub created_at: String,
    pub updated_at: String,
}

pub struct BudgetRepository<'a> {
    conn: &'a Connection,
}

impl<'a> BudgetRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Latest limits for a case, or `None` when the case has no budget.
    pub fn current_limits(
        &self,
        org_id: &str,
        case_id: &str,
    ) -> Result<Option<CaseBudget>, DbError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, org_id, case_id, hours_limit_minutes, amount_limit_cents,
                        hard_cap, note, created_at, updated_at
                 FROM case_budgets WHERE org_id = ?1 AND case_id = ?2",
                params![org_id, case_id],
                scan_case_budget,
            )
            .optional()?;
        Ok(row)
    }

    /// Append one immutable adjustment and re-derive the live budget row.
    ///
    /// Creates the budget lazily on the first adjustment for a case. Returns
    /// the adjustment id. Must run inside the caller's write transaction.
    pub fn adjust(
        &self,
        org_id: &str,
        case_id: &str,
        kind: BudgetKind,
        new_value: i64,
        reason: &str,
        actor_id: &str,
    ) -> Result<String, DbError> {
        let mut errors = ValidationErrors::new();
        errors.require("org_id", org_id);
        errors.require("case_id", case_id);
        errors.require("reason", reason);
        errors.require("actor_id", actor_id);
        errors.require_non_negative("new_value", new_value);
        errors.into_result()?;

        let existing = self.current_limits(org_id, case_id)?;
        let previous_value = match (&existing, kind) {
            (Some(budget), BudgetKind::Hours) => budget.hours_limit_minutes,
            (Some(budget), BudgetKind::Dollars) => budget.amount_limit_cents,
            (None, _) => None,
        };

        let adjustment_id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        self.conn.execute(
            "INSERT INTO budget_adjustments (
                id, org_id, case_id, kind, previous_value, new_value,
                reason, actor_id, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                adjustment_id,
                org_id,
                case_id,
                kind.as_str(),
                previous_value,
                new_value,
                reason.trim(),
                actor_id,
                now,
            ],
        )?;

        match existing {
            Some(budget) => {
                let column = match kind {
                    BudgetKind::Hours => "hours_limit_minutes",
                    BudgetKind::Dollars => "amount_limit_cents",
                };
                let sql = format!(
                    "UPDATE case_budgets SET {column} = ?1, updated_at = ?2 WHERE id = ?3"
                );
                self.conn
                    .execute(&sql, params![new_value, now, budget.id])?;
            }
            None => {
                let budget_id = Uuid::new_v4().to_string();
                let (hours, cents) = match kind {
                    BudgetKind::Hours => (Some(new_value), None),
                    BudgetKind::Dollars => (None, Some(new_value)),
                };
                self.conn.execute(
                    "INSERT INTO case_budgets (
                        id, org_id, case_id, hours_limit_minutes, amount_limit_cents,
                        hard_cap, note, created_at, updated_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, 0, '', ?6, ?6)",
                    params![budget_id, org_id, case_id, hours, cents, now],
                )?;
            }
        }

        Ok(adjustment_id)
    }

    /// Flip the hard-cap flag. Limit values themselves only move through
    /// `adjust`; the budget row is created lazily here too so a cap can be
    /// armed before the first limit exists.
    pub fn set_hard_cap(
        &self,
        org_id: &str,
        case_id: &str,
        hard_cap: bool,
        note: &str,
    ) -> Result<(), DbError> {
        let now = now_rfc3339();
        let rows = self.conn.execute(
            "UPDATE case_budgets SET hard_cap = ?1, note = ?2, updated_at = ?3
             WHERE org_id = ?4 AND case_id = ?5",
            params![hard_cap as i64, note, now, org_id, case_id],
        )?;
        if rows == 0 {
            let budget_id = Uuid::new_v4().to_string();
            self.conn.execute(
                "INSERT INTO case_budgets (
                    id, org_id, case_id, hours_limit_minutes, amount_limit_cents,
                    hard_cap, note, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, NULL, NULL, ?4, ?5, ?6, ?6)",
                params![budget_id, org_id, case_id, hard_cap as i64, note, now],
            )?;
        }
        Ok(())
    }

    /// Full adjustment history for a case, oldest first.
    pub fn list_adjustments(
        &self,
        org_id: &str,
        case_id: &str,
    ) -> Result<Vec<BudgetAdjustment>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, org_id, case_id, kind, previous_value, new_value,
                    reason, actor_id, created_at
             FROM budget_adjustments
             WHERE org_id = ?1 AND case_id = ?2
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![org_id, case_id], scan_adjustment)?;
        let mut adjustments = Vec::new();
        for row in rows {
            adjustments.push(row?);
        }
        Ok(adjustments)
    }

    /// Create or replace the per-service-instance limit. At least one of the
    /// two caps must be set.
    pub fn set_service_limit(&self, limit: &mut ServiceBudgetLimit) -> Result<(), DbError> {
        let mut errors = ValidationErrors::new();
        errors.require("org_id", &limit.org_id);
        errors.require("service_instance_id", &limit.service_instance_id);
        if limit.max_minutes.is_none() && limit.max_amount_cents.is_none() {
            errors.add("limit", "at least one of max hours or max amount is required");
        }
        if let Some(minutes) = limit.max_minutes {
            errors.require_non_negative("max_minutes", minutes);
        }
        if let Some(cents) = limit.max_amount_cents {
            errors.require_non_negative("max_amount_cents", cents);
        }
        if !(1..=100).contains(&limit.warning_threshold_pct) {
            errors.add("warning_threshold_pct", "must be between 1 and 100");
        }
        errors.into_result()?;

        let now = now_rfc3339();
        let rows = self.conn.execute(
            "UPDATE service_budget_limits
             SET max_minutes = ?1, max_amount_cents = ?2, warning_threshold_pct = ?3,
                 updated_at = ?4
             WHERE org_id = ?5 AND service_instance_id = ?6",
            params![
                limit.max_minutes,
                limit.max_amount_cents,
                limit.warning_threshold_pct,
                now,
                limit.org_id,
                limit.service_instance_id,
            ],
        )?;
        if rows > 0 {
            limit.updated_at = now;
            return Ok(());
        }

        if limit.id.is_empty() {
            limit.id = Uuid::new_v4().to_string();
        }
        limit.created_at = now.clone();
        limit.updated_at = now;
        self.conn.execute(
            "INSERT INTO service_budget_limits (
                id, org_id, service_instance_id, max_minutes, max_amount_cents,
                warning_threshold_pct, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                limit.id,
                limit.org_id,
                limit.service_instance_id,
                limit.max_minutes,
                limit.max_amount_cents,
                limit.warning_threshold_pct,
                limit.created_at,
                limit.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn service_limit(
        &self,
        org_id: &str,
        service_instance_id: &str,
    ) -> Result<Option<ServiceBudgetLimit>, DbError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, org_id, service_instance_id, max_minutes, max_amount_cents,
                        warning_threshold_pct, created_at, updated_at
                 FROM service_budget_limits
                 WHERE org_id = ?1 AND service_instance_id = ?2",
                params![org_id, service_instance_id],
                |row| {
                    Ok(ServiceBudgetLimit {
                        id: row.get(0)?,
                        org_id: row.get(1)?,
                        service_instance_id: row.get(2)?,
                        max_minutes: row.get(3)?,
                        max_amount_cents: row.get(4)?,
                        warning_threshold_pct: row.get(5)?,
                        created_at: row.get(6)?,
                        updated_at: row.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}

fn scan_adjustment(row: &rusqlite::Row<'_>) -> rusqlite::Result<BudgetAdjustment> {
    let kind_str: String = row.get(3)?;
    let kind = BudgetKind::parse(&kind_str).map_err(crate::to_sql_conversion_error)?;
    Ok(BudgetAdjustment {
        id: row.get(0)?,
        org_id: row.get(1)?,
        case_id: row.get(2)?,
        kind,
        previous_value: row.get(4)?,
        new_value: row.get(5)?,
        reason: row.get(6)?,
        actor_id: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn scan_case_budget(row: &rusqlite::Row<'_>) -> rusqlite::Result<CaseBudget> {
    Ok(CaseBudget {
        id: row.get(0)?,
        org_id: row.get(1)?,
        case_id: row.get(2)?,
        hours_limit_minutes: row.get(3)?,
        amount_limit_cents: row.get(4)?,
        hard_cap: row.get::<_, i64>(5)? != 0,
        note: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}
