//! docket-engine: the budget & billing settlement engine.
//!
//! Authorizes spend against a case, tracks consumption from the financial
//! ledger, blocks or flags activity that would breach authorized limits, and
//! converts approved charges into immutable, non-duplicated invoice line
//! items. Every mutating operation runs as one atomic write transaction:
//! the consumption read, the limit comparison, the audit write, and the
//! mutation itself are serialized against concurrent writers.

pub mod billing;
pub mod guard;
pub mod settlement;

use std::time::Duration;

use thiserror::Error;

use docket_core::models::{ActorContext, BudgetKind, Decision, EntryStatus, InvoiceStatus};
use docket_db::budget_repository::{BudgetAdjustment, BudgetRepository, CaseBudget, ServiceBudgetLimit};
use docket_db::enforcement_repository::{EnforcementAction, EnforcementRepository};
use docket_db::invoice_repository::{Invoice, InvoiceRepository};
use docket_db::ledger_repository::{Consumption, FinancialEntry, LedgerRepository};
use docket_db::rate_repository::RateRepository;
use docket_db::{Db, DbError};

pub use billing::NewEntry;
pub use guard::ActionDelta;
pub use settlement::SettlementSummary;

/// Engine-level error taxonomy.
///
/// Validation and state errors are surfaced verbatim and are not retryable;
/// policy errors carry the human-readable reason for the breached invariant;
/// `Busy` is the only variant a caller should retry.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid adjustment: {0}")]
    InvalidAdjustment(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),
    #[error("budget hard cap exceeded: {0}")]
    BudgetHardCapExceeded(String),
    #[error("rate not found: {0}")]
    RateNotFound(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("billing item is not pending (status: {0})")]
    NotPending(EntryStatus),
    #[error("billing item is already rejected")]
    AlreadyRejected,
    #[error("entry is already invoiced")]
    AlreadyInvoiced,
    #[error("invoice is not in draft state")]
    InvoiceNotDraft,
    #[error("storage is busy: {0}")]
    Busy(String),
    #[error("storage: {0}")]
    Storage(DbError),
}

impl EngineError {
    /// Whether the caller may retry the operation with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

impl From<DbError> for EngineError {
    fn from(err: DbError) -> Self {
        if err.is_busy() {
            return Self::Busy(err.to_string());
        }
        match err {
            DbError::Validation(msg) => Self::Validation(msg),
            DbError::EntryNotFound => Self::NotFound("financial entry"),
            DbError::InvoiceNotFound => Self::NotFound("invoice"),
            DbError::BudgetNotFound => Self::NotFound("case budget"),
            DbError::ServiceLimitNotFound => Self::NotFound("service budget limit"),
            DbError::RateNotFound => Self::RateNotFound("no matching rate".into()),
            other => Self::Storage(other),
        }
    }
}

/// Directory of service instances, supplied by the hosting platform.
///
/// The engine consults it for the billable flag (non-chargeable work is
/// never capped) and for display names in audit context. It is never a
/// source of rates.
pub trait ServiceDirectory {
    /// Whether the service instance represents chargeable work. Unknown
    /// instances are treated as billable.
    fn billable(&self, org_id: &str, service_instance_id: &str) -> bool;

    /// Optional display name for audit context.
    fn display_name(&self, org_id: &str, service_instance_id: &str) -> Option<String>;
}

/// Default directory: every service instance is billable.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllBillable;

impl ServiceDirectory for AllBillable {
    fn billable(&self, _org_id: &str, _service_instance_id: &str) -> bool {
        true
    }

    fn display_name(&self, _org_id: &str, _service_instance_id: &str) -> Option<String> {
        None
    }
}

/// Which rate table `resolve_rate` consults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateSubject {
    /// Client account: bill rates.
    Account(String),
    /// Investigator user: pay rates.
    User(String),
}

/// The settlement engine. One instance per connection; concurrency comes
/// from the hosting request layer opening one engine per handler.
pub struct Engine {
    db: Db,
    directory: Box<dyn ServiceDirectory + Send>,
    retry_attempts: usize,
    retry_backoff: Duration,
}

impl Engine {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            directory: Box::new(AllBillable),
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(50),
        }
    }

    pub fn with_directory(db: Db, directory: Box<dyn ServiceDirectory + Send>) -> Self {
        Self {
            db,
            directory,
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(50),
        }
    }

    /// Access to the underlying database (migrations, read-only queries).
    pub fn db_mut(&mut self) -> &mut Db {
        &mut self.db
    }

    // -----------------------------------------------------------------
    // Budget model
    // -----------------------------------------------------------------

    /// Append an immutable budget adjustment; the case budget is created
    /// lazily on the first adjustment.
    pub fn adjust_budget(
        &mut self,
        ctx: &ActorContext,
        case_id: &str,
        kind: BudgetKind,
        new_value: i64,
        reason: &str,
    ) -> Result<String, EngineError> {
        if new_value < 0 {
            return Err(EngineError::InvalidAdjustment(
                "adjustment value must be >= 0".into(),
            ));
        }
        let ctx = ctx.clone();
        let case_id = case_id.to_string();
        let reason = reason.to_string();
        let id = self
            .db
            .write_transaction_with_retry(self.retry_attempts, self.retry_backoff, |tx| {
                BudgetRepository::new(tx).adjust(
                    &ctx.org_id,
                    &case_id,
                    kind,
                    new_value,
                    &reason,
                    &ctx.actor_id,
                )
            })?;
        tracing::debug!(case_id = %case_id, kind = %kind, new_value, "budget adjusted");
        Ok(id)
    }

    /// Arm or disarm the hard cap for a case.
    pub fn set_hard_cap(
        &mut self,
        ctx: &ActorContext,
        case_id: &str,
        hard_cap: bool,
        note: &str,
    ) -> Result<(), EngineError> {
        let ctx = ctx.clone();
        let case_id = case_id.to_string();
        let note = note.to_string();
        self.db
            .write_transaction_with_retry(self.retry_attempts, self.retry_backoff, |tx| {
                BudgetRepository::new(tx).set_hard_cap(&ctx.org_id, &case_id, hard_cap, &note)
            })?;
        Ok(())
    }

    /// Latest limits for a case; `None` means the case is open.
    pub fn current_limits(
        &self,
        ctx: &ActorContext,
        case_id: &str,
    ) -> Result<Option<CaseBudget>, EngineError> {
        let budget = BudgetRepository::new(self.db.conn()).current_limits(&ctx.org_id, case_id)?;
        Ok(budget)
    }

    /// Create or replace a per-service-instance limit.
    pub fn set_service_budget_limit(
        &mut self,
        ctx: &ActorContext,
        limit: &mut ServiceBudgetLimit,
    ) -> Result<(), EngineError> {
        limit.org_id = ctx.org_id.clone();
        let mut stored = limit.clone();
        self.db
            .write_transaction_with_retry(self.retry_attempts, self.retry_backoff, |tx| {
                let mut attempt = stored.clone();
                BudgetRepository::new(tx).set_service_limit(&mut attempt)?;
                stored = attempt;
                Ok(())
            })?;
        *limit = stored;
        Ok(())
    }

    /// Full adjustment history for a case.
    pub fn list_adjustments(
        &self,
        ctx: &ActorContext,
        case_id: &str,
    ) -> Result<Vec<BudgetAdjustment>, EngineError> {
        let adjustments =
            BudgetRepository::new(self.db.conn()).list_adjustments(&ctx.org_id, case_id)?;
        Ok(adjustments)
    }

    // -----------------------------------------------------------------
    // Consumption + enforcement
    // -----------------------------------------------------------------

    /// Hours and dollars consumed by a case, computed from the ledger.
    pub fn consumption(
        &self,
        ctx: &ActorContext,
        case_id: &str,
    ) -> Result<Consumption, EngineError> {
        let consumption = LedgerRepository::new(self.db.conn()).consumption(&ctx.org_id, case_id)?;
        Ok(consumption)
    }

    /// Evaluate a proposed mutation against case-level and service-level
    /// limits. Always returns a decision and always writes exactly one
    /// enforcement audit record.
    pub fn evaluate_action(
        &mut self,
        ctx: &ActorContext,
        case_id: &str,
        delta: ActionDelta,
        action_type: &str,
        service_instance_id: Option<&str>,
    ) -> Result<Decision, EngineError> {
        let ctx = ctx.clone();
        let case_id = case_id.to_string();
        let action_type = action_type.to_string();
        let service_instance_id = service_instance_id.map(str::to_string);
        let directory = &*self.directory;
        let decision = self
            .db
            .write_transaction_with_retry(self.retry_attempts, self.retry_backoff, |tx| {
                guard::evaluate(
                    tx,
                    directory,
                    &ctx,
                    &case_id,
                    delta,
                    &action_type,
                    service_instance_id.as_deref(),
                )
            })?;
        Ok(decision)
    }

    /// Enforcement audit trail for a case.
    pub fn list_enforcement_actions(
        &self,
        ctx: &ActorContext,
        case_id: &str,
    ) -> Result<Vec<EnforcementAction>, EngineError> {
        let actions =
            EnforcementRepository::new(self.db.conn()).list_by_case(&ctx.org_id, case_id)?;
        Ok(actions)
    }

    // -----------------------------------------------------------------
    // Ledger writes
    // -----------------------------------------------------------------

    /// Create a financial entry, guard-first: the enforcement evaluation and
    /// the insert share one transaction, and a blocked evaluation commits
    /// only its audit record.
    pub fn create_financial_entry(
        &mut self,
        ctx: &ActorContext,
        new_entry: NewEntry,
    ) -> Result<FinancialEntry, EngineError> {
        let ctx = ctx.clone();
        let directory = &*self.directory;
        let outcome = self
            .db
            .write_transaction_with_retry(self.retry_attempts, self.retry_backoff, |tx| {
                billing::create_entry(tx, directory, &ctx, &new_entry)
            })?;
        match outcome {
            billing::CreateOutcome::Created(entry) => Ok(*entry),
            billing::CreateOutcome::Blocked(reason) => Err(EngineError::BudgetExceeded(reason)),
        }
    }

    /// Approve a pending billing item: forward-looking hard-cap forecast,
    /// rate resolution, write-once pricing snapshot, `pending -> approved`.
    pub fn approve_billing_item(
        &mut self,
        ctx: &ActorContext,
        item_id: &str,
    ) -> Result<FinancialEntry, EngineError> {
        let ctx = ctx.clone();
        let item_id = item_id.to_string();
        let directory = &*self.directory;
        let outcome = self
            .db
            .write_transaction_with_retry(self.retry_attempts, self.retry_backoff, |tx| {
                billing::approve(tx, directory, &ctx, &item_id)
            })?;
        match outcome {
            billing::ApproveOutcome::Approved(entry) => Ok(*entry),
            billing::ApproveOutcome::CapBlocked(reason) => {
                Err(EngineError::BudgetHardCapExceeded(reason))
            }
            billing::ApproveOutcome::RateMissing(reason) => Err(EngineError::RateNotFound(reason)),
            billing::ApproveOutcome::NotPending(status) => Err(EngineError::NotPending(status)),
        }
    }

    /// Reject a pending billing item. Rejecting twice is an error, not a
    /// silent success.
    pub fn reject_billing_item(
        &mut self,
        ctx: &ActorContext,
        item_id: &str,
        reason: Option<&str>,
    ) -> Result<(), EngineError> {
        let ctx = ctx.clone();
        let item_id = item_id.to_string();
        let reason = reason.map(str::to_string);
        let outcome = self
            .db
            .write_transaction_with_retry(self.retry_attempts, self.retry_backoff, |tx| {
                billing::reject(tx, &ctx, &item_id, reason.as_deref())
            })?;
        match outcome {
            billing::RejectOutcome::Rejected => Ok(()),
            billing::RejectOutcome::AlreadyRejected => Err(EngineError::AlreadyRejected),
            billing::RejectOutcome::NotPending(status) => Err(EngineError::NotPending(status)),
        }
    }

    // -----------------------------------------------------------------
    // Invoices + settlement
    // -----------------------------------------------------------------

    pub fn create_invoice(
        &mut self,
        ctx: &ActorContext,
        account_id: &str,
    ) -> Result<Invoice, EngineError> {
        let ctx = ctx.clone();
        let account_id = account_id.to_string();
        let invoice = self
            .db
            .write_transaction_with_retry(self.retry_attempts, self.retry_backoff, |tx| {
                let mut invoice = Invoice {
                    org_id: ctx.org_id.clone(),
                    account_id: account_id.clone(),
                    ..Invoice::default()
                };
                InvoiceRepository::new(tx).create(&mut invoice)?;
                Ok(invoice)
            })?;
        Ok(invoice)
    }

    /// `draft -> finalized`. Settlement refuses non-draft invoices.
    pub fn finalize_invoice(
        &mut self,
        ctx: &ActorContext,
        invoice_id: &str,
    ) -> Result<(), EngineError> {
        let ctx = ctx.clone();
        let invoice_id = invoice_id.to_string();
        let result = self
            .db
            .write_transaction_with_retry(self.retry_attempts, self.retry_backoff, |tx| {
                let invoices = InvoiceRepository::new(tx);
                let invoice = invoices.get(&ctx.org_id, &invoice_id)?;
                if invoice.status != InvoiceStatus::Draft {
                    return Ok(Some(invoice.status));
                }
                invoices.transition(
                    &ctx.org_id,
                    &invoice_id,
                    InvoiceStatus::Draft,
                    InvoiceStatus::Finalized,
                )?;
                Ok(None)
            })?;
        match result {
            None => Ok(()),
            Some(_) => Err(EngineError::InvoiceNotDraft),
        }
    }

    /// Convert approved, not-yet-invoiced billing items into invoice line
    /// items, claiming each at most once.
    pub fn settle_invoice(
        &mut self,
        ctx: &ActorContext,
        invoice_id: &str,
        entry_ids: &[String],
    ) -> Result<SettlementSummary, EngineError> {
        let ctx = ctx.clone();
        let invoice_id = invoice_id.to_string();
        let entry_ids = entry_ids.to_vec();
        let outcome = self
            .db
            .write_transaction_with_retry(self.retry_attempts, self.retry_backoff, |tx| {
                settlement::settle(tx, &ctx, &invoice_id, &entry_ids)
            })?;
        match outcome {
            settlement::SettleOutcome::Settled(summary) => Ok(summary),
            settlement::SettleOutcome::NotDraft => Err(EngineError::InvoiceNotDraft),
        }
    }

    pub fn invoice(&self, ctx: &ActorContext, invoice_id: &str) -> Result<Invoice, EngineError> {
        let invoice = InvoiceRepository::new(self.db.conn()).get(&ctx.org_id, invoice_id)?;
        Ok(invoice)
    }

    // -----------------------------------------------------------------
    // Rates
    // -----------------------------------------------------------------

    /// Resolve a rate from the table matching the subject. Bill rates and
    /// pay rates are disjoint; a miss is an error, never a substituted
    /// default.
    pub fn resolve_rate(
        &self,
        ctx: &ActorContext,
        finance_item_id: &str,
        subject: &RateSubject,
        as_of: &str,
    ) -> Result<i64, EngineError> {
        let rates = RateRepository::new(self.db.conn());
        match subject {
            RateSubject::Account(account_id) => {
                match rates.resolve_bill_rate(&ctx.org_id, finance_item_id, account_id, as_of)? {
                    Some(rate) => Ok(rate.rate_cents),
                    None => Err(EngineError::RateNotFound(format!(
                        "no bill rate for item {finance_item_id}, account {account_id} as of {as_of}"
                    ))),
                }
            }
            RateSubject::User(user_id) => {
                match rates.resolve_pay_rate(&ctx.org_id, finance_item_id, user_id, as_of)? {
                    Some(rate) => Ok(rate.rate_cents),
                    None => Err(EngineError::RateNotFound(format!(
                        "no pay rate for item {finance_item_id}, user {user_id} as of {as_of}"
                    ))),
                }
            }
        }
    }
}
