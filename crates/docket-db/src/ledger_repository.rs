//! Financial ledger repository.
//!
//! The `financial_entries` table is the single source of truth for
//! consumption: enforcement never reads denormalized counters, only the sums
//! computed here. Status moves are compare-and-set so two connections cannot
//! race an entry through the same transition, and the pricing snapshot is
//! write-once.

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use docket_core::models::{EntryStatus, EntryType};
use docket_core::validation::ValidationErrors;

use crate::{now_rfc3339, nullable_string, DbError};

/// Frozen pricing captured at approval time. Immune to later rate changes;
/// settlement copies these values verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricingSnapshot {
    pub rate_cents: i64,
    pub quantity: i64,
    pub amount_cents: i64,
    pub approver_id: String,
    pub approved_at: String,
}

/// One ledger line: the atomic unit of consumption.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinancialEntry {
    pub id: String,
    pub org_id: String,
    pub case_id: String,
    pub service_instance_id: Option<String>,
    pub account_id: Option<String>,
    pub finance_item_id: Option<String>,
    pub entry_type: EntryType,
    pub minutes: Option<i64>,
    pub quantity: Option<i64>,
    pub rate_cents: Option<i64>,
    pub amount_cents: i64,
    pub status: EntryStatus,
    pub snapshot: Option<PricingSnapshot>,
    pub invoice_id: Option<String>,
    pub description: String,
    pub actor_id: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Hours and dollars already consumed by a case (or service instance).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Consumption {
    pub minutes: i64,
    pub amount_cents: i64,
}

/// Outcome of the conditional invoice claim on one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This call won the claim; the entry is now invoiced.
    Claimed(Box<FinancialEntry>),
    /// The entry exists but its status is not `approved`.
    NotApproved(EntryStatus),
    /// Another settlement already owns the entry.
    AlreadyInvoiced,
}

pub struct LedgerRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LedgerRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Insert a new entry. Status is forced to `pending`; id and timestamps
    /// are stamped here.
    pub fn insert(&self, entry: &mut FinancialEntry) -> Result<(), DbError> {
        let mut errors = ValidationErrors::new();
        errors.require("org_id", &entry.org_id);
        errors.require("case_id", &entry.case_id);
        errors.require("actor_id", &entry.actor_id);
        match entry.entry_type {
            EntryType::Time => {
                if entry.minutes.unwrap_or(0) <= 0 {
                    errors.add("minutes", "time entries require minutes > 0");
                }
            }
            EntryType::Expense => {
                errors.require_non_negative("amount_cents", entry.amount_cents);
            }
            EntryType::BillingItem => {
                if entry.quantity.unwrap_or(0) <= 0 {
                    errors.add("quantity", "billing items require quantity > 0");
                }
            }
        }
        if let Some(rate) = entry.rate_cents {
            errors.require_non_negative("rate_cents", rate);
        }
        errors.into_result()?;

        if entry.id.trim().is_empty() {
            entry.id = Uuid::new_v4().to_string();
        }
        entry.status = EntryStatus::Pending;
        entry.snapshot = None;
        entry.invoice_id = None;
        let now = now_rfc3339();
        entry.created_at = now.clone();
        entry.updated_at = now;

        self.conn.execute(
            "INSERT INTO financial_entries (
                id, org_id, case_id, service_instance_id, account_id, finance_item_id,
                entry_type, minutes, quantity, rate_cents, amount_cents, status,
                description, actor_id, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                entry.id,
                entry.org_id,
                entry.case_id,
                entry.service_instance_id,
                entry.account_id,
                entry.finance_item_id,
                entry.entry_type.as_str(),
                entry.minutes,
                entry.quantity,
                entry.rate_cents,
                entry.amount_cents,
                entry.status.as_str(),
                entry.description,
                entry.actor_id,
                entry.created_at,
                entry.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, org_id: &str, id: &str) -> Result<FinancialEntry, DbError> {
        let result = self
            .conn
            .query_row(
                &format!("{SELECT_ENTRY} WHERE org_id = ?1 AND id = ?2"),
                params![org_id, id],
                scan_entry,
            )
            .optional()?;
        result.ok_or(DbError::EntryNotFound)
    }

    pub fn list_by_case(&self, org_id: &str, case_id: &str) -> Result<Vec<FinancialEntry>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "{SELECT_ENTRY} WHERE org_id = ?1 AND case_id = ?2 ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![org_id, case_id], scan_entry)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Hours and dollars consumed by a case: minutes over non-rejected time
    /// entries, cents over non-rejected time and expense entries. Computed
    /// from the ledger only.
    pub fn consumption(&self, org_id: &str, case_id: &str) -> Result<Consumption, DbError> {
        let row = self.conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN entry_type = 'time' THEN COALESCE(minutes, 0) ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN entry_type IN ('time', 'expense') THEN amount_cents ELSE 0 END), 0)
             FROM financial_entries
             WHERE org_id = ?1 AND case_id = ?2 AND status != 'rejected'",
            params![org_id, case_id],
            |row| {
                Ok(Consumption {
                    minutes: row.get(0)?,
                    amount_cents: row.get(1)?,
                })
            },
        )?;
        Ok(row)
    }

    /// Consumption scoped to one service instance, same counting rules.
    pub fn service_consumption(
        &self,
        org_id: &str,
        service_instance_id: &str,
    ) -> Result<Consumption, DbError> {
        let row = self.conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN entry_type = 'time' THEN COALESCE(minutes, 0) ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN entry_type IN ('time', 'expense') THEN amount_cents ELSE 0 END), 0)
             FROM financial_entries
             WHERE org_id = ?1 AND service_instance_id = ?2 AND status != 'rejected'",
            params![org_id, service_instance_id],
            |row| {
                Ok(Consumption {
                    minutes: row.get(0)?,
                    amount_cents: row.get(1)?,
                })
            },
        )?;
        Ok(row)
    }

    /// Freeze the pricing snapshot onto an entry and align its live
    /// rate/amount with the frozen values. Write-once: a second freeze
    /// attempt fails.
    pub fn freeze_snapshot(
        &self,
        org_id: &str,
        id: &str,
        snapshot: &PricingSnapshot,
    ) -> Result<(), DbError> {
        let now = now_rfc3339();
        let rows = self.conn.execute(
            "UPDATE financial_entries
             SET snapshot_rate_cents = ?1,
                 snapshot_quantity = ?2,
                 snapshot_amount_cents = ?3,
                 snapshot_approver_id = ?4,
                 snapshot_at = ?5,
                 rate_cents = ?1,
                 amount_cents = ?3,
                 updated_at = ?6
             WHERE org_id = ?7 AND id = ?8 AND snapshot_at IS NULL",
            params![
                snapshot.rate_cents,
                snapshot.quantity,
                snapshot.amount_cents,
                snapshot.approver_id,
                snapshot.approved_at,
                now,
                org_id,
                id,
            ],
        )?;
        if rows == 0 {
            // Distinguish a missing entry from a second freeze.
            self.get(org_id, id)?;
            return Err(DbError::Validation(
                "pricing snapshot is write-once".into(),
            ));
        }
        Ok(())
    }

    /// Compare-and-set status transition. Zero rows updated means the entry
    /// is missing or no longer in `from`.
    pub fn transition(
        &self,
        org_id: &str,
        id: &str,
        from: EntryStatus,
        to: EntryStatus,
    ) -> Result<(), DbError> {
        let now = now_rfc3339();
        let rows = self.conn.execute(
            "UPDATE financial_entries SET status = ?1, updated_at = ?2
             WHERE org_id = ?3 AND id = ?4 AND status = ?5",
            params![to.as_str(), now, org_id, id, from.as_str()],
        )?;
        if rows == 0 {
            let entry = self.get(org_id, id)?;
            return Err(DbError::Validation(format!(
                "invalid transition {} -> {} (entry is {})",
                from, to, entry.status
            )));
        }
        Ok(())
    }

    /// Append text to an entry's description (used for rejection reasons).
    pub fn append_description(&self, org_id: &str, id: &str, text: &str) -> Result<(), DbError> {
        if nullable_string(text).is_none() {
            return Ok(());
        }
        let now = now_rfc3339();
        let rows = self.conn.execute(
            "UPDATE financial_entries
             SET description = CASE WHEN description = '' THEN ?1
                                    ELSE description || '\n' || ?1 END,
                 updated_at = ?2
             WHERE org_id = ?3 AND id = ?4",
            params![text.trim(), now, org_id, id],
        )?;
        if rows == 0 {
            return Err(DbError::EntryNotFound);
        }
        Ok(())
    }

    /// Atomically claim an entry for an invoice.
    ///
    /// The conditional UPDATE only succeeds when the entry is exactly
    /// `approved` with no invoice yet; anything else is classified for the
    /// settlement summary rather than raced.
    pub fn claim_for_invoice(
        &self,
        org_id: &str,
        id: &str,
        invoice_id: &str,
    ) -> Result<ClaimOutcome, DbError> {
        let now = now_rfc3339();
        let rows = self.conn.execute(
            "UPDATE financial_entries
             SET invoice_id = ?1, status = 'invoiced', updated_at = ?2
             WHERE org_id = ?3 AND id = ?4
               AND status = 'approved' AND invoice_id IS NULL",
            params![invoice_id, now, org_id, id],
        )?;
        if rows == 1 {
            let entry = self.get(org_id, id)?;
            return Ok(ClaimOutcome::Claimed(Box::new(entry)));
        }

        let entry = self.get(org_id, id)?;
        if entry.invoice_id.is_some() {
            Ok(ClaimOutcome::AlreadyInvoiced)
        } else {
            Ok(ClaimOutcome::NotApproved(entry.status))
        }
    }
}

const SELECT_ENTRY: &str = "SELECT
    id, org_id, case_id, service_instance_id, account_id, finance_item_id,
    entry_type, minutes, quantity, rate_cents, amount_cents, status,
    snapshot_rate_cents, snapshot_quantity, snapshot_amount_cents,
    snapshot_approver_id, snapshot_at, invoice_id, description, actor_id,
    created_at, updated_at
 FROM financial_entries";

fn scan_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<FinancialEntry> {
    let entry_type_str: String = row.get(6)?;
    let entry_type = EntryType::parse(&entry_type_str).map_err(crate::to_sql_conversion_error)?;
    let status_str: String = row.get(11)?;
    let status = EntryStatus::parse(&status_str).map_err(crate::to_sql_conversion_error)?;

    let snapshot_at: Option<String> = row.get(16)?;
    let snapshot = match snapshot_at {
        Some(approved_at) => Some(PricingSnapshot {
            rate_cents: row.get::<_, Option<i64>>(12)?.unwrap_or(0),
            quantity: row.get::<_, Option<i64>>(13)?.unwrap_or(0),
            amount_cents: row.get::<_, Option<i64>>(14)?.unwrap_or(0),
            approver_id: row.get::<_, Option<String>>(15)?.unwrap_or_default(),
            approved_at,
        }),
        None => None,
    };

    Ok(FinancialEntry {
        id: row.get(0)?,
        org_id: row.get(1)?,
        case_id: row.get(2)?,
        service_instance_id: row.get(3)?,
        account_id: row.get(4)?,
        finance_item_id: row.get(5)?,
        entry_type,
        minutes: row.get(7)?,
        quantity: row.get(8)?,
        rate_cents: row.get(9)?,
        amount_cents: row.get(10)?,
        status,
        snapshot,
        invoice_id: row.get(17)?,
        description: row.get(18)?,
        actor_id: row.get(19)?,
        created_at: row.get(20)?,
        updated_at: row.get(21)?,
    })
}
