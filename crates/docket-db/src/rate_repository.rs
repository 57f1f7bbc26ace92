//! Rate tables: client bill rates and investigator pay rates.
//!
//! The two tables are disjoint by construction and stay disjoint here: each
//! resolver reads exactly one table, and no shared helper takes the table
//! name as a parameter. A missing rate is `None`, never a default — callers
//! turn that into a hard error at write time.

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use docket_core::validation::ValidationErrors;

use crate::{now_rfc3339, DbError};

/// A client billing rate, keyed by (finance item, account).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BillRate {
    pub id: String,
    pub org_id: String,
    pub finance_item_id: String,
    pub account_id: String,
    pub rate_cents: i64,
    pub effective_from: String,
    pub effective_until: Option<String>,
    pub created_at: String,
}

/// An investigator pay rate, keyed by (finance item, user).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayRate {
    pub id: String,
    pub org_id: String,
    pub finance_item_id: String,
    pub user_id: String,
    pub rate_cents: i64,
    pub effective_from: String,
    pub effective_until: Option<String>,
    pub created_at: String,
}

pub struct RateRepository<'a> {
    conn: &'a Connection,
}

impl<'a> RateRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn insert_bill_rate(&self, rate: &mut BillRate) -> Result<(), DbError> {
        validate_rate_fields(
            &rate.org_id,
            &rate.finance_item_id,
            "account_id",
            &rate.account_id,
            rate.rate_cents,
            &rate.effective_from,
            rate.effective_until.as_deref(),
        )?;
        if rate.id.trim().is_empty() {
            rate.id = Uuid::new_v4().to_string();
        }
        rate.created_at = now_rfc3339();
        self.conn.execute(
            "INSERT INTO bill_rates (
                id, org_id, finance_item_id, account_id, rate_cents,
                effective_from, effective_until, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                rate.id,
                rate.org_id,
                rate.finance_item_id,
                rate.account_id,
                rate.rate_cents,
                rate.effective_from,
                rate.effective_until,
                rate.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn insert_pay_rate(&self, rate: &mut PayRate) -> Result<(), DbError> {
        validate_rate_fields(
            &rate.org_id,
            &rate.finance_item_id,
            "user_id",
            &rate.user_id,
            rate.rate_cents,
            &rate.effective_from,
            rate.effective_until.as_deref(),
        )?;
        if rate.id.trim().is_empty() {
            rate.id = Uuid::new_v4().to_string();
        }
        rate.created_at = now_rfc3339();
        self.conn.execute(
            "INSERT INTO pay_rates (
                id, org_id, finance_item_id, user_id, rate_cents,
                effective_from, effective_until, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                rate.id,
                rate.org_id,
                rate.finance_item_id,
                rate.user_id,
                rate.rate_cents,
                rate.effective_from,
                rate.effective_until,
                rate.created_at,
            ],
        )?;
        Ok(())
    }

    /// The bill rate whose effective window contains `as_of`, preferring the
    /// most recently effective match. `None` when nothing matches.
    pub fn resolve_bill_rate(
        &self,
        org_id: &str,
        finance_item_id: &str,
        account_id: &str,
        as_of: &str,
    ) -> Result<Option<BillRate>, DbError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, org_id, finance_item_id, account_id, rate_cents,
                        effective_from, effective_until, created_at
                 FROM bill_rates
                 WHERE org_id = ?1 AND finance_item_id = ?2 AND account_id = ?3
                   AND effective_from <= ?4
                   AND (effective_until IS NULL OR effective_until > ?4)
                 ORDER BY effective_from DESC
                 LIMIT 1",
                params![org_id, finance_item_id, account_id, as_of],
                |row| {
                    Ok(BillRate {
                        id: row.get(0)?,
                        org_id: row.get(1)?,
                        finance_item_id: row.get(2)?,
                        account_id: row.get(3)?,
                        rate_cents: row.get(4)?,
                        effective_from: row.get(5)?,
                        effective_until: row.get(6)?,
                        created_at: row.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// The pay rate whose effective window contains `as_of`, preferring the
    /// most recently effective match. `None` when nothing matches — a bill
    /// rate for the same finance item is never substituted.
    pub fn resolve_pay_rate(
        &self,
        org_id: &str,
        finance_item_id: &str,
        user_id: &str,
        as_of: &str,
    ) -> Result<Option<PayRate>, DbError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, org_id, finance_item_id, user_id, rate_cents,
                        effective_from, effective_until, created_at
                 FROM pay_rates
                 WHERE org_id = ?1 AND finance_item_id = ?2 AND user_id = ?3
                   AND effective_from <= ?4
                   AND (effective_until IS NULL OR effective_until > ?4)
                 ORDER BY effective_from DESC
                 LIMIT 1",
                params![org_id, finance_item_id, user_id, as_of],
                |row| {
                    Ok(PayRate {
                        id: row.get(0)?,
                        org_id: row.get(1)?,
                        finance_item_id: row.get(2)?,
                        user_id: row.get(3)?,
                        rate_cents: row.get(4)?,
                        effective_from: row.get(5)?,
                        effective_until: row.get(6)?,
                        created_at: row.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}

fn validate_rate_fields(
    org_id: &str,
    finance_item_id: &str,
    subject_field: &str,
    subject_id: &str,
    rate_cents: i64,
    effective_from: &str,
    effective_until: Option<&str>,
) -> Result<(), DbError> {
    let mut errors = ValidationErrors::new();
    errors.require("org_id", org_id);
    errors.require("finance_item_id", finance_item_id);
    errors.require(subject_field, subject_id);
    errors.require_non_negative("rate_cents", rate_cents);
    errors.require("effective_from", effective_from);
    if let Some(until) = effective_until {
        if until <= effective_from {
            errors.add("effective_until", "must be after effective_from");
        }
    }
    errors.into_result()?;
    Ok(())
}
