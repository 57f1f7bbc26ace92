//! Invoice repository: invoices and their settled line items.
//!
//! The running total only ever moves while the invoice is in draft, and a
//! line item's entry_id is UNIQUE — the schema-level backstop behind the
//! at-most-once settlement claim.

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use docket_core::models::InvoiceStatus;
use docket_core::validation::ValidationErrors;

use crate::{is_unique_constraint_error, now_rfc3339, DbError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invoice {
    pub id: String,
    pub org_id: String,
    pub account_id: String,
    pub status: InvoiceStatus,
    pub total_cents: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// One settled charge; values are verbatim copies of the entry's frozen
/// pricing snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvoiceLineItem {
    pub id: String,
    pub org_id: String,
    pub invoice_id: String,
    pub entry_id: String,
    pub description: String,
    pub quantity: i64,
    pub rate_cents: i64,
    pub amount_cents: i64,
    pub created_at: String,
}

pub struct InvoiceRepository<'a> {
    conn: &'a Connection,
}

impl<'a> InvoiceRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn create(&self, invoice: &mut Invoice) -> Result<(), DbError> {
        let mut errors = ValidationErrors::new();
        errors.require("org_id", &invoice.org_id);
        errors.require("account_id", &invoice.account_id);
        errors.into_result()?;

        if invoice.id.trim().is_empty() {
            invoice.id = Uuid::new_v4().to_string();
        }
        invoice.status = InvoiceStatus::Draft;
        invoice.total_cents = 0;
        let now = now_rfc3339();
        invoice.created_at = now.clone();
        invoice.updated_at = now;

        self.conn.execute(
            "INSERT INTO invoices (id, org_id, account_id, status, total_cents, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)",
            params![
                invoice.id,
                invoice.org_id,
                invoice.account_id,
                invoice.status.as_str(),
                invoice.created_at,
                invoice.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, org_id: &str, id: &str) -> Result<Invoice, DbError> {
        let result = self
            .conn
            .query_row(
                "SELECT id, org_id, account_id, status, total_cents, created_at, updated_at
                 FROM invoices WHERE org_id = ?1 AND id = ?2",
                params![org_id, id],
                scan_invoice,
            )
            .optional()?;
        result.ok_or(DbError::InvoiceNotFound)
    }

    /// Add to the running total. Guarded on draft status so a finalized or
    /// exported invoice can never move.
    pub fn add_to_total(&self, org_id: &str, id: &str, delta_cents: i64) -> Result<(), DbError> {
        let now = now_rfc3339();
        let rows = self.conn.execute(
            "UPDATE invoices SET total_cents = total_cents + ?1, updated_at = ?2
             WHERE org_id = ?3 AND id = ?4 AND status = 'draft'",
            params![delta_cents, now, org_id, id],
        )?;
        if rows == 0 {
            let invoice = self.get(org_id, id)?;
            return Err(DbError::Validation(format!(
                "invoice is {}, totals are frozen",
                invoice.status
            )));
        }
        Ok(())
    }

    /// Compare-and-set status transition.
    pub fn transition(
        &self,
        org_id: &str,
        id: &str,
        from: InvoiceStatus,
        to: InvoiceStatus,
    ) -> Result<(), DbError> {
        let now = now_rfc3339();
        let rows = self.conn.execute(
            "UPDATE invoices SET status = ?1, updated_at = ?2
             WHERE org_id = ?3 AND id = ?4 AND status = ?5",
            params![to.as_str(), now, org_id, id, from.as_str()],
        )?;
        if rows == 0 {
            let invoice = self.get(org_id, id)?;
            return Err(DbError::Validation(format!(
                "invalid transition {} -> {} (invoice is {})",
                from.as_str(),
                to.as_str(),
                invoice.status
            )));
        }
        Ok(())
    }

    pub fn insert_line_item(&self, item: &mut InvoiceLineItem) -> Result<(), DbError> {
        let mut errors = ValidationErrors::new();
        errors.require("org_id", &item.org_id);
        errors.require("invoice_id", &item.invoice_id);
        errors.require("entry_id", &item.entry_id);
        errors.require_non_negative("quantity", item.quantity);
        errors.require_non_negative("rate_cents", item.rate_cents);
        errors.require_non_negative("amount_cents", item.amount_cents);
        errors.into_result()?;

        if item.id.trim().is_empty() {
            item.id = Uuid::new_v4().to_string();
        }
        item.created_at = now_rfc3339();

        let result = self.conn.execute(
            "INSERT INTO invoice_line_items (
                id, org_id, invoice_id, entry_id, description, quantity,
                rate_cents, amount_cents, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                item.id,
                item.org_id,
                item.invoice_id,
                item.entry_id,
                item.description,
                item.quantity,
                item.rate_cents,
                item.amount_cents,
                item.created_at,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(ref err) if is_unique_constraint_error(err) => Err(DbError::Validation(format!(
                "entry {} already has an invoice line item",
                item.entry_id
            ))),
            Err(err) => Err(DbError::Open(err)),
        }
    }

    pub fn list_line_items(
        &self,
        org_id: &str,
        invoice_id: &str,
    ) -> Result<Vec<InvoiceLineItem>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, org_id, invoice_id, entry_id, description, quantity,
                    rate_cents, amount_cents, created_at
             FROM invoice_line_items
             WHERE org_id = ?1 AND invoice_id = ?2
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![org_id, invoice_id], |row| {
            Ok(InvoiceLineItem {
                id: row.get(0)?,
                org_id: row.get(1)?,
                invoice_id: row.get(2)?,
                entry_id: row.get(3)?,
                description: row.get(4)?,
                quantity: row.get(5)?,
                rate_cents: row.get(6)?,
                amount_cents: row.get(7)?,
                created_at: row.get(8)?,
            })
        })?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }
}

fn scan_invoice(row: &rusqlite::Row<'_>) -> rusqlite::Result<Invoice> {
    let status_str: String = row.get(3)?;
    let status = InvoiceStatus::parse(&status_str).map_err(crate::to_sql_conversion_error)?;
    Ok(Invoice {
        id: row.get(0)?,
        org_id: row.get(1)?,
        account_id: row.get(2)?,
        status,
        total_cents: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}
