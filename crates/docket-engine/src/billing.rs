//! Billing item lifecycle: guard-first entry creation, approval with a
//! frozen pricing snapshot, and rejection.
//!
//! Approval is the last enforcement checkpoint before money is committed to
//! an invoice: it re-runs the case-level hard-cap check with the item's own
//! spend as a forward-looking delta, resolves the bill rate if the entry
//! carries none, and freezes the pricing snapshot write-once.

use rusqlite::Connection;

use docket_core::models::{ActorContext, Decision, EntryStatus, EntryType};
use docket_core::money::{quantity_charge_cents, time_charge_cents};
use docket_db::ledger_repository::{FinancialEntry, LedgerRepository, PricingSnapshot};
use docket_db::rate_repository::RateRepository;
use docket_db::{now_rfc3339, DbError};

use crate::guard::{self, ActionDelta};
use crate::ServiceDirectory;

/// Input for a new ledger entry.
#[derive(Debug, Clone, Default)]
pub struct NewEntry {
    pub case_id: String,
    pub entry_type: EntryType,
    pub minutes: Option<i64>,
    pub quantity: Option<i64>,
    pub rate_cents: Option<i64>,
    pub amount_cents: i64,
    pub service_instance_id: Option<String>,
    pub account_id: Option<String>,
    pub finance_item_id: Option<String>,
    pub description: String,
}

pub(crate) enum CreateOutcome {
    Created(Box<FinancialEntry>),
    /// The guard blocked the mutation; only the audit record was committed.
    Blocked(String),
}

pub(crate) enum ApproveOutcome {
    Approved(Box<FinancialEntry>),
    CapBlocked(String),
    RateMissing(String),
    NotPending(EntryStatus),
}

pub(crate) enum RejectOutcome {
    Rejected,
    AlreadyRejected,
    NotPending(EntryStatus),
}

/// Guard-first entry creation. The evaluation and the insert share the
/// caller's transaction; a blocked evaluation commits the audit record and
/// nothing else.
pub(crate) fn create_entry(
    conn: &Connection,
    directory: &dyn ServiceDirectory,
    ctx: &ActorContext,
    new_entry: &NewEntry,
) -> Result<CreateOutcome, DbError> {
    let estimated_cents = estimate_amount(new_entry);
    let delta = match new_entry.entry_type {
        EntryType::Time => ActionDelta::new(new_entry.minutes.unwrap_or(0), estimated_cents),
        EntryType::Expense => ActionDelta::new(0, new_entry.amount_cents),
        // Billing items never enter consumption; their spend is a pure
        // forecast here and again at approval.
        EntryType::BillingItem => ActionDelta::new(0, estimated_cents),
    };

    let action_type = match new_entry.entry_type {
        EntryType::Time => "create_time_entry",
        EntryType::Expense => "create_expense_entry",
        EntryType::BillingItem => "create_billing_item",
    };

    let decision = guard::evaluate(
        conn,
        directory,
        ctx,
        &new_entry.case_id,
        delta,
        action_type,
        new_entry.service_instance_id.as_deref(),
    )?;
    if let Decision::Blocked(reason) = decision {
        return Ok(CreateOutcome::Blocked(reason));
    }

    let mut entry = FinancialEntry {
        org_id: ctx.org_id.clone(),
        case_id: new_entry.case_id.clone(),
        service_instance_id: new_entry.service_instance_id.clone(),
        account_id: new_entry.account_id.clone(),
        finance_item_id: new_entry.finance_item_id.clone(),
        entry_type: new_entry.entry_type,
        minutes: new_entry.minutes,
        quantity: new_entry.quantity,
        rate_cents: new_entry.rate_cents,
        amount_cents: if new_entry.amount_cents > 0 {
            new_entry.amount_cents
        } else {
            estimated_cents
        },
        description: new_entry.description.clone(),
        actor_id: ctx.actor_id.clone(),
        ..FinancialEntry::default()
    };
    LedgerRepository::new(conn).insert(&mut entry)?;
    Ok(CreateOutcome::Created(Box::new(entry)))
}

/// Approve a pending item: resolve the rate, forecast the hard cap, freeze
/// the snapshot, `pending -> approved`.
pub(crate) fn approve(
    conn: &Connection,
    directory: &dyn ServiceDirectory,
    ctx: &ActorContext,
    item_id: &str,
) -> Result<ApproveOutcome, DbError> {
    let ledger = LedgerRepository::new(conn);
    let entry = ledger.get(&ctx.org_id, item_id)?;
    if entry.status != EntryStatus::Pending {
        return Ok(ApproveOutcome::NotPending(entry.status));
    }

    // Effective rate first: the forecast needs the item's resulting amount.
    let rate_cents = match effective_rate(conn, ctx, &entry)? {
        Ok(rate) => rate,
        Err(reason) => {
            guard::record_pricing_block(
                conn,
                ctx,
                &entry.case_id,
                "approve_billing_item",
                &reason,
                &entry.id,
            )?;
            return Ok(ApproveOutcome::RateMissing(reason));
        }
    };

    let (quantity, amount_cents) = match entry.entry_type {
        EntryType::Time => {
            let minutes = entry.minutes.unwrap_or(0);
            (minutes, time_charge_cents(rate_cents, minutes))
        }
        EntryType::Expense => (1, entry.amount_cents),
        EntryType::BillingItem => {
            let quantity = entry.quantity.unwrap_or(0);
            (quantity, quantity_charge_cents(rate_cents, quantity))
        }
    };

    // Time and expense entries already sit in consumption as pending rows;
    // only billing items contribute their own spend as a forecast delta.
    let delta = match entry.entry_type {
        EntryType::BillingItem => ActionDelta::new(0, amount_cents),
        _ => ActionDelta::default(),
    };

    let capped = match entry.service_instance_id.as_deref() {
        Some(sid) => directory.billable(&ctx.org_id, sid),
        None => true,
    };
    if capped {
        let decision = guard::evaluate(
            conn,
            directory,
            ctx,
            &entry.case_id,
            delta,
            "approve_billing_item",
            None,
        )?;
        if let Decision::Blocked(reason) = decision {
            return Ok(ApproveOutcome::CapBlocked(reason));
        }
    }

    let snapshot = PricingSnapshot {
        rate_cents,
        quantity,
        amount_cents,
        approver_id: ctx.actor_id.clone(),
        approved_at: now_rfc3339(),
    };
    ledger.freeze_snapshot(&ctx.org_id, &entry.id, &snapshot)?;
    ledger.transition(
        &ctx.org_id,
        &entry.id,
        EntryStatus::Pending,
        EntryStatus::Approved,
    )?;

    let approved = ledger.get(&ctx.org_id, &entry.id)?;
    tracing::debug!(
        entry_id = %approved.id,
        case_id = %approved.case_id,
        amount_cents,
        "billing item approved, pricing frozen"
    );
    Ok(ApproveOutcome::Approved(Box::new(approved)))
}

/// Reject a pending item. Rejecting twice is reported, not absorbed.
pub(crate) fn reject(
    conn: &Connection,
    ctx: &ActorContext,
    item_id: &str,
    reason: Option<&str>,
) -> Result<RejectOutcome, DbError> {
    let ledger = LedgerRepository::new(conn);
    let entry = ledger.get(&ctx.org_id, item_id)?;
    match entry.status {
        EntryStatus::Rejected => Ok(RejectOutcome::AlreadyRejected),
        EntryStatus::Pending => {
            ledger.transition(
                &ctx.org_id,
                item_id,
                EntryStatus::Pending,
                EntryStatus::Rejected,
            )?;
            if let Some(reason) = reason {
                ledger.append_description(&ctx.org_id, item_id, &format!("rejected: {reason}"))?;
            }
            tracing::debug!(entry_id = item_id, "billing item rejected");
            Ok(RejectOutcome::Rejected)
        }
        other => Ok(RejectOutcome::NotPending(other)),
    }
}

/// The rate already on the entry, or the resolved bill rate for its finance
/// item and account. Expenses carry their amount directly and never need a
/// rate. The inner `Err` is the human-readable pricing failure.
fn effective_rate(
    conn: &Connection,
    ctx: &ActorContext,
    entry: &FinancialEntry,
) -> Result<Result<i64, String>, DbError> {
    if entry.entry_type == EntryType::Expense {
        return Ok(Ok(entry.amount_cents));
    }
    if let Some(rate) = entry.rate_cents {
        return Ok(Ok(rate));
    }
    match (entry.finance_item_id.as_deref(), entry.account_id.as_deref()) {
        (Some(item), Some(account)) => {
            let as_of = now_rfc3339();
            match RateRepository::new(conn).resolve_bill_rate(&ctx.org_id, item, account, &as_of)? {
                Some(rate) => Ok(Ok(rate.rate_cents)),
                None => Ok(Err(format!(
                    "no bill rate for item {item}, account {account} as of {as_of}"
                ))),
            }
        }
        _ => Ok(Err(
            "entry carries no rate and no finance item/account to resolve one".to_string(),
        )),
    }
}

fn estimate_amount(new_entry: &NewEntry) -> i64 {
    if new_entry.amount_cents > 0 {
        return new_entry.amount_cents;
    }
    match (new_entry.entry_type, new_entry.rate_cents) {
        (EntryType::Time, Some(rate)) => time_charge_cents(rate, new_entry.minutes.unwrap_or(0)),
        (EntryType::BillingItem, Some(rate)) => {
            quantity_charge_cents(rate, new_entry.quantity.unwrap_or(0))
        }
        _ => 0,
    }
}
