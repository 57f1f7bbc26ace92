//! Domain model types for the docket settlement engine.
//!
//! Entity state enums, budget/enforcement kinds, the guard decision type, and
//! the actor context every engine operation receives from the hosting layer.

use std::fmt;

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Ledger entries
// ---------------------------------------------------------------------------

/// Kind of a financial ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EntryType {
    /// Tracked investigator time, measured in minutes.
    #[default]
    Time,
    /// A pass-through expense with a fixed amount.
    Expense,
    /// A discrete chargeable item awaiting approval before invoicing.
    BillingItem,
}

impl EntryType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Time => "time",
            Self::Expense => "expense",
            Self::BillingItem => "billing_item",
        }
    }

    pub fn parse(value: &str) -> Result<Self, CoreError> {
        match value {
            "time" => Ok(Self::Time),
            "expense" => Ok(Self::Expense),
            "billing_item" => Ok(Self::BillingItem),
            other => Err(CoreError::Validation(format!(
                "invalid entry type: {other}"
            ))),
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a ledger entry.
///
/// `Pending -> Approved -> Invoiced`, or `Pending -> Rejected` (terminal).
/// No transition skips `Pending`; nothing leaves `Invoiced` or `Rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EntryStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
    Invoiced,
}

impl EntryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Invoiced => "invoiced",
        }
    }

    pub fn parse(value: &str) -> Result<Self, CoreError> {
        match value {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "invoiced" => Ok(Self::Invoiced),
            other => Err(CoreError::Validation(format!(
                "invalid entry status: {other}"
            ))),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Invoiced)
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Budgets
// ---------------------------------------------------------------------------

/// Which authorization limit a budget adjustment moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BudgetKind {
    /// Hours limit; adjustment values are minutes.
    Hours,
    /// Dollar limit; adjustment values are cents.
    Dollars,
}

impl BudgetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hours => "hours",
            Self::Dollars => "dollars",
        }
    }

    pub fn parse(value: &str) -> Result<Self, CoreError> {
        match value {
            "hours" => Ok(Self::Hours),
            "dollars" => Ok(Self::Dollars),
            other => Err(CoreError::Validation(format!(
                "invalid budget kind: {other}"
            ))),
        }
    }
}

impl fmt::Display for BudgetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Enforcement
// ---------------------------------------------------------------------------

/// Category of an enforcement audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnforcementKind {
    Budget,
    Tier,
    Pricing,
    Lock,
}

impl EnforcementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Budget => "budget",
            Self::Tier => "tier",
            Self::Pricing => "pricing",
            Self::Lock => "lock",
        }
    }

    pub fn parse(value: &str) -> Result<Self, CoreError> {
        match value {
            "budget" => Ok(Self::Budget),
            "tier" => Ok(Self::Tier),
            "pricing" => Ok(Self::Pricing),
            "lock" => Ok(Self::Lock),
            other => Err(CoreError::Validation(format!(
                "invalid enforcement kind: {other}"
            ))),
        }
    }
}

impl fmt::Display for EnforcementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an enforcement guard evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The action may proceed.
    Allowed,
    /// The action may proceed, but a soft limit or warning threshold was
    /// crossed; the reason names the limit.
    AllowedWithWarning(String),
    /// The action must not be committed; the reason names the breached limit.
    Blocked(String),
}

impl Decision {
    pub fn was_blocked(&self) -> bool {
        matches!(self, Self::Blocked(_))
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Allowed => None,
            Self::AllowedWithWarning(reason) | Self::Blocked(reason) => Some(reason),
        }
    }
}

// ---------------------------------------------------------------------------
// Invoices
// ---------------------------------------------------------------------------

/// Lifecycle status of an invoice.
///
/// Settlement only ever touches `Draft` invoices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InvoiceStatus {
    #[default]
    Draft,
    Finalized,
    Exported,
}

impl InvoiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Finalized => "finalized",
            Self::Exported => "exported",
        }
    }

    pub fn parse(value: &str) -> Result<Self, CoreError> {
        match value {
            "draft" => Ok(Self::Draft),
            "finalized" => Ok(Self::Finalized),
            "exported" => Ok(Self::Exported),
            other => Err(CoreError::Validation(format!(
                "invalid invoice status: {other}"
            ))),
        }
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Actor context
// ---------------------------------------------------------------------------

/// Authenticated caller identity, supplied by the hosting layer.
///
/// The engine trusts this context; it performs no authentication itself.
/// Every query is scoped to `org_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorContext {
    pub actor_id: String,
    pub org_id: String,
}

impl ActorContext {
    pub fn new(actor_id: impl Into<String>, org_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            org_id: org_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_status_round_trip() {
        for status in [
            EntryStatus::Pending,
            EntryStatus::Approved,
            EntryStatus::Rejected,
            EntryStatus::Invoiced,
        ] {
            let parsed = match EntryStatus::parse(status.as_str()) {
                Ok(parsed) => parsed,
                Err(err) => panic!("parse {status}: {err}"),
            };
            assert_eq!(parsed, status);
        }
        assert!(EntryStatus::parse("done").is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(EntryStatus::Rejected.is_terminal());
        assert!(EntryStatus::Invoiced.is_terminal());
        assert!(!EntryStatus::Pending.is_terminal());
        assert!(!EntryStatus::Approved.is_terminal());
    }

    #[test]
    fn decision_accessors() {
        assert!(!Decision::Allowed.was_blocked());
        assert_eq!(Decision::Allowed.reason(), None);

        let warn = Decision::AllowedWithWarning("9.5 of 10 hours used".into());
        assert!(!warn.was_blocked());
        assert_eq!(warn.reason(), Some("9.5 of 10 hours used"));

        let blocked = Decision::Blocked("amount limit reached".into());
        assert!(blocked.was_blocked());
    }

    #[test]
    fn budget_kind_parse() {
        assert_eq!(
            match BudgetKind::parse("hours") {
                Ok(kind) => kind,
                Err(err) => panic!("parse hours: {err}"),
            },
            BudgetKind::Hours
        );
        assert!(BudgetKind::parse("minutes").is_err());
    }
}
