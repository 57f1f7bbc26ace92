//! Enforcement guard: evaluates a proposed mutation against case-level and
//! service-level budget limits.
//!
//! Every evaluation writes exactly one immutable enforcement audit record,
//! blocked or not, in the same transaction as the caller's mutation. Ties
//! are breaches: consumption equal to a limit blocks.

use rusqlite::Connection;

use docket_core::models::{ActorContext, Decision, EnforcementKind};
use docket_core::money::{format_cents, format_minutes_as_hours};
use docket_db::budget_repository::{BudgetRepository, CaseBudget, ServiceBudgetLimit};
use docket_db::enforcement_repository::{EnforcementAction, EnforcementRepository};
use docket_db::ledger_repository::{Consumption, LedgerRepository};
use docket_db::DbError;

use crate::ServiceDirectory;

/// Proposed spend of the mutation being evaluated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionDelta {
    pub minutes: i64,
    pub cents: i64,
}

impl ActionDelta {
    pub fn new(minutes: i64, cents: i64) -> Self {
        Self { minutes, cents }
    }
}

/// Evaluate one proposed mutation. Runs on the caller's transaction so the
/// consumption read sees the caller's own writes and is serialized against
/// concurrent evaluations for the same case.
pub(crate) fn evaluate(
    conn: &Connection,
    directory: &dyn ServiceDirectory,
    ctx: &ActorContext,
    case_id: &str,
    delta: ActionDelta,
    action_type: &str,
    service_instance_id: Option<&str>,
) -> Result<Decision, DbError> {
    let budgets = BudgetRepository::new(conn);
    let ledger = LedgerRepository::new(conn);

    // Non-chargeable work is never capped; the attempt is still audited.
    if let Some(sid) = service_instance_id {
        if !directory.billable(&ctx.org_id, sid) {
            let decision = Decision::Allowed;
            let context = serde_json::json!({
                "action_type": action_type,
                "service_instance_id": sid,
                "skipped": "non_billable",
            });
            record(conn, ctx, case_id, action_type, &decision, &context)?;
            tracing::debug!(
                case_id,
                service_instance_id = sid,
                "enforcement skipped: non-billable service instance"
            );
            return Ok(decision);
        }
    }

    let budget = budgets.current_limits(&ctx.org_id, case_id)?;
    let mut used = Consumption::default();
    let mut decision = match &budget {
        Some(budget)
            if budget.hours_limit_minutes.is_some() || budget.amount_limit_cents.is_some() =>
        {
            used = ledger.consumption(&ctx.org_id, case_id)?;
            case_level_decision(budget, used, delta)
        }
        _ => Decision::Allowed,
    };

    // Service-level limits are an independent layer: a breach there blocks
    // even when the case itself is open or soft-capped.
    let mut service_used: Option<Consumption> = None;
    if !decision.was_blocked() {
        if let Some(sid) = service_instance_id {
            if let Some(limit) = budgets.service_limit(&ctx.org_id, sid)? {
                let consumed = ledger.service_consumption(&ctx.org_id, sid)?;
                service_used = Some(consumed);
                let label = directory
                    .display_name(&ctx.org_id, sid)
                    .unwrap_or_else(|| sid.to_string());
                let service_decision = service_level_decision(&limit, consumed, delta, &label);
                decision = combine(decision, service_decision);
            }
        }
    }

    let context = serde_json::json!({
        "action_type": action_type,
        "delta_minutes": delta.minutes,
        "delta_cents": delta.cents,
        "consumed_minutes": used.minutes,
        "consumed_cents": used.amount_cents,
        "service_instance_id": service_instance_id,
        "service_consumed_minutes": service_used.map(|c| c.minutes),
        "service_consumed_cents": service_used.map(|c| c.amount_cents),
    });
    record(conn, ctx, case_id, action_type, &decision, &context)?;

    match &decision {
        Decision::Blocked(reason) => {
            tracing::warn!(case_id, action_type, reason = %reason, "action blocked");
        }
        Decision::AllowedWithWarning(reason) => {
            tracing::debug!(case_id, action_type, reason = %reason, "action allowed with warning");
        }
        Decision::Allowed => {
            tracing::debug!(case_id, action_type, "action allowed");
        }
    }

    Ok(decision)
}

/// Write the enforcement audit row for a pricing failure (missing rate at
/// approval time).
pub(crate) fn record_pricing_block(
    conn: &Connection,
    ctx: &ActorContext,
    case_id: &str,
    action_type: &str,
    reason: &str,
    entry_id: &str,
) -> Result<(), DbError> {
    let mut action = EnforcementAction {
        id: String::new(),
        org_id: ctx.org_id.clone(),
        case_id: case_id.to_string(),
        actor_id: ctx.actor_id.clone(),
        action_type: action_type.to_string(),
        enforcement_kind: EnforcementKind::Pricing,
        was_blocked: true,
        reason: Some(reason.to_string()),
        context_json: serde_json::json!({ "entry_id": entry_id }).to_string(),
        created_at: String::new(),
    };
    EnforcementRepository::new(conn).insert(&mut action)
}

fn record(
    conn: &Connection,
    ctx: &ActorContext,
    case_id: &str,
    action_type: &str,
    decision: &Decision,
    context: &serde_json::Value,
) -> Result<(), DbError> {
    let mut action = EnforcementAction {
        id: String::new(),
        org_id: ctx.org_id.clone(),
        case_id: case_id.to_string(),
        actor_id: ctx.actor_id.clone(),
        action_type: action_type.to_string(),
        enforcement_kind: EnforcementKind::Budget,
        was_blocked: decision.was_blocked(),
        reason: decision.reason().map(str::to_string),
        context_json: context.to_string(),
        created_at: String::new(),
    };
    EnforcementRepository::new(conn).insert(&mut action)
}

fn case_level_decision(budget: &CaseBudget, used: Consumption, delta: ActionDelta) -> Decision {
    let mut breach: Option<String> = None;
    if let Some(limit) = budget.hours_limit_minutes {
        if used.minutes + delta.minutes >= limit {
            breach = Some(format!(
                "case budget: {} of {} hours used",
                format_minutes_as_hours(used.minutes),
                format_minutes_as_hours(limit)
            ));
        }
    }
    if breach.is_none() {
        if let Some(limit) = budget.amount_limit_cents {
            if used.amount_cents + delta.cents >= limit {
                breach = Some(format!(
                    "case budget: {} of {} used",
                    format_cents(used.amount_cents),
                    format_cents(limit)
                ));
            }
        }
    }
    match breach {
        Some(reason) if budget.hard_cap => Decision::Blocked(reason),
        Some(reason) => Decision::AllowedWithWarning(reason),
        None => Decision::Allowed,
    }
}

fn service_level_decision(
    limit: &ServiceBudgetLimit,
    used: Consumption,
    delta: ActionDelta,
    label: &str,
) -> Decision {
    if let Some(max) = limit.max_minutes {
        if used.minutes + delta.minutes >= max {
            return Decision::Blocked(format!(
                "service {label}: {} of {} hours used",
                format_minutes_as_hours(used.minutes),
                format_minutes_as_hours(max)
            ));
        }
    }
    if let Some(max) = limit.max_amount_cents {
        if used.amount_cents + delta.cents >= max {
            return Decision::Blocked(format!(
                "service {label}: {} of {} used",
                format_cents(used.amount_cents),
                format_cents(max)
            ));
        }
    }

    let pct = limit.warning_threshold_pct;
    if let Some(max) = limit.max_minutes {
        if (used.minutes + delta.minutes) * 100 >= max * pct {
            return Decision::AllowedWithWarning(format!(
                "service {label}: {pct}% of the hours cap reached"
            ));
        }
    }
    if let Some(max) = limit.max_amount_cents {
        if (used.amount_cents + delta.cents) * 100 >= max * pct {
            return Decision::AllowedWithWarning(format!(
                "service {label}: {pct}% of the amount cap reached"
            ));
        }
    }
    Decision::Allowed
}

/// Worst decision wins; on equal severity the first (case-level) stands.
fn combine(first: Decision, second: Decision) -> Decision {
    match (&first, &second) {
        (_, Decision::Blocked(_)) => second,
        (Decision::Allowed, Decision::AllowedWithWarning(_)) => second,
        _ => first,
    }
}
