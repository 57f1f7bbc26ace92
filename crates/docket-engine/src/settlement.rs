//! Invoice settlement: converts approved billing items into invoice line
//! items.
//!
//! Each entry is claimed with a conditional update that only succeeds while
//! it is exactly `approved` with no invoice. Line item values are copied
//! verbatim from the frozen pricing snapshot — never recomputed — and the
//! invoice total moves exactly once per batch.

use rusqlite::Connection;

use docket_core::models::{ActorContext, InvoiceStatus};
use docket_db::invoice_repository::{InvoiceLineItem, InvoiceRepository};
use docket_db::ledger_repository::{ClaimOutcome, LedgerRepository};
use docket_db::DbError;

/// Result of one settlement batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettlementSummary {
    /// Entry ids settled into line items by this call.
    pub created: Vec<String>,
    /// Entry ids skipped because their status was not exactly `approved`
    /// (includes unknown ids).
    pub skipped_not_approved: Vec<String>,
    /// Entry ids skipped because another settlement already claimed them.
    pub skipped_already_invoiced: Vec<String>,
    /// Sum of settled snapshot amounts, added to the invoice total once.
    pub total_cents: i64,
}

pub(crate) enum SettleOutcome {
    Settled(SettlementSummary),
    NotDraft,
}

pub(crate) fn settle(
    conn: &Connection,
    ctx: &ActorContext,
    invoice_id: &str,
    entry_ids: &[String],
) -> Result<SettleOutcome, DbError> {
    let invoices = InvoiceRepository::new(conn);
    let ledger = LedgerRepository::new(conn);

    let invoice = invoices.get(&ctx.org_id, invoice_id)?;
    if invoice.status != InvoiceStatus::Draft {
        return Ok(SettleOutcome::NotDraft);
    }

    let mut summary = SettlementSummary::default();
    for entry_id in entry_ids {
        match ledger.claim_for_invoice(&ctx.org_id, entry_id, invoice_id) {
            Ok(ClaimOutcome::Claimed(entry)) => {
                let snapshot = entry.snapshot.as_ref().ok_or_else(|| {
                    DbError::Validation(format!(
                        "entry {entry_id} is approved without a pricing snapshot"
                    ))
                })?;
                let mut item = InvoiceLineItem {
                    org_id: ctx.org_id.clone(),
                    invoice_id: invoice_id.to_string(),
                    entry_id: entry_id.clone(),
                    description: entry.description.clone(),
                    quantity: snapshot.quantity,
                    rate_cents: snapshot.rate_cents,
                    amount_cents: snapshot.amount_cents,
                    ..InvoiceLineItem::default()
                };
                invoices.insert_line_item(&mut item)?;
                summary.total_cents += snapshot.amount_cents;
                summary.created.push(entry_id.clone());
            }
            Ok(ClaimOutcome::NotApproved(status)) => {
                tracing::warn!(
                    entry_id = %entry_id,
                    status = %status,
                    "settlement skipped: entry is not approved"
                );
                summary.skipped_not_approved.push(entry_id.clone());
            }
            Ok(ClaimOutcome::AlreadyInvoiced) => {
                tracing::warn!(
                    entry_id = %entry_id,
                    "settlement skipped: entry already invoiced"
                );
                summary.skipped_already_invoiced.push(entry_id.clone());
            }
            Err(DbError::EntryNotFound) => {
                tracing::warn!(entry_id = %entry_id, "settlement skipped: unknown entry");
                summary.skipped_not_approved.push(entry_id.clone());
            }
            Err(err) => return Err(err),
        }
    }

    if summary.total_cents != 0 {
        invoices.add_to_total(&ctx.org_id, invoice_id, summary.total_cents)?;
    }

    tracing::debug!(
        invoice_id = %invoice_id,
        created = summary.created.len(),
        skipped_not_approved = summary.skipped_not_approved.len(),
        skipped_already_invoiced = summary.skipped_already_invoiced.len(),
        total_cents = summary.total_cents,
        "settlement batch complete"
    );
    Ok(SettleOutcome::Settled(summary))
}
