use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use docket_core::models::{ActorContext, BudgetKind, Decision, EntryType};
use docket_db::{Config, Db};
use docket_engine::{ActionDelta, Engine, EngineError, NewEntry, ServiceDirectory};

fn temp_db_path(prefix: &str) -> PathBuf {
    static UNIQUE_SUFFIX: AtomicU64 = AtomicU64::new(0);
    let nanos = match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(value) => value.as_nanos(),
        Err(_) => 0,
    };
    let suffix = UNIQUE_SUFFIX.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "docket-engine-guard-{prefix}-{nanos}-{}-{suffix}.sqlite",
        std::process::id(),
    ))
}

fn setup_engine(prefix: &str) -> (Engine, PathBuf) {
    let path = temp_db_path(prefix);
    let mut db = match Db::open(Config::new(&path)) {
        Ok(db) => db,
        Err(err) => panic!("open db: {err}"),
    };
    if let Err(err) = db.migrate_up() {
        panic!("migrate_up: {err}");
    }
    (Engine::new(db), path)
}

fn ctx() -> ActorContext {
    ActorContext::new("user-1", "org-1")
}

fn time_entry(case_id: &str, minutes: i64) -> NewEntry {
    NewEntry {
        case_id: case_id.into(),
        entry_type: EntryType::Time,
        minutes: Some(minutes),
        rate_cents: Some(12_000),
        ..NewEntry::default()
    }
}

#[test]
fn hard_capped_case_blocks_entry_that_would_exceed_hours() {
    // Scenario: 10h hard cap, 9.5h consumed, a 1h entry arrives.
    let (mut engine, path) = setup_engine("scenario-a");
    let ctx = ctx();

    if let Err(err) = engine.adjust_budget(&ctx, "case-1", BudgetKind::Hours, 600, "authorized") {
        panic!("adjust_budget: {err}");
    }
    if let Err(err) = engine.set_hard_cap(&ctx, "case-1", true, "") {
        panic!("set_hard_cap: {err}");
    }
    if let Err(err) = engine.create_financial_entry(&ctx, time_entry("case-1", 570)) {
        panic!("first entry: {err}");
    }

    let blocked = engine.create_financial_entry(&ctx, time_entry("case-1", 60));
    match blocked {
        Err(EngineError::BudgetExceeded(reason)) => {
            assert!(reason.contains("9.5 of 10 hours used"), "reason: {reason}");
        }
        Err(err) => panic!("expected BudgetExceeded, got {err}"),
        Ok(_) => panic!("entry breaching a hard cap must be blocked"),
    }

    // The blocked entry never reached the ledger.
    let consumption = match engine.consumption(&ctx, "case-1") {
        Ok(value) => value,
        Err(err) => panic!("consumption: {err}"),
    };
    assert_eq!(consumption.minutes, 570);

    // Both evaluations were audited, with was_blocked matching.
    let actions = match engine.list_enforcement_actions(&ctx, "case-1") {
        Ok(actions) => actions,
        Err(err) => panic!("list_enforcement_actions: {err}"),
    };
    assert_eq!(actions.len(), 2);
    assert!(!actions[0].was_blocked);
    assert!(actions[1].was_blocked);
    match &actions[1].reason {
        Some(reason) => assert!(reason.contains("9.5 of 10 hours")),
        None => panic!("blocked action must carry a reason"),
    }

    let _ = std::fs::remove_file(path);
}

#[test]
fn hard_cap_blocks_stay_blocked() {
    // Once consumption reaches the limit, every non-negative delta blocks.
    let (mut engine, path) = setup_engine("monotonic");
    let ctx = ctx();

    if let Err(err) = engine.adjust_budget(&ctx, "case-1", BudgetKind::Hours, 120, "authorized") {
        panic!("adjust_budget: {err}");
    }
    // Fill the case to its limit before arming the cap, then arm it.
    if let Err(err) = engine.create_financial_entry(&ctx, time_entry("case-1", 120)) {
        panic!("filling entry: {err}");
    }
    if let Err(err) = engine.set_hard_cap(&ctx, "case-1", true, "") {
        panic!("set_hard_cap: {err}");
    }

    for delta_minutes in [0, 1, 30, 600] {
        let decision = match engine.evaluate_action(
            &ctx,
            "case-1",
            ActionDelta::new(delta_minutes, 0),
            "time_entry",
            None,
        ) {
            Ok(decision) => decision,
            Err(err) => panic!("evaluate_action({delta_minutes}): {err}"),
        };
        assert!(
            decision.was_blocked(),
            "delta {delta_minutes} must stay blocked once the cap is reached"
        );
    }

    let _ = std::fs::remove_file(path);
}

#[test]
fn amount_limit_blocks_like_hours_limit() {
    let (mut engine, path) = setup_engine("amount");
    let ctx = ctx();

    if let Err(err) = engine.adjust_budget(&ctx, "case-1", BudgetKind::Dollars, 50_000, "retainer")
    {
        panic!("adjust_budget: {err}");
    }
    if let Err(err) = engine.set_hard_cap(&ctx, "case-1", true, "") {
        panic!("set_hard_cap: {err}");
    }
    let expense = NewEntry {
        case_id: "case-1".into(),
        entry_type: EntryType::Expense,
        amount_cents: 45_000,
        ..NewEntry::default()
    };
    if let Err(err) = engine.create_financial_entry(&ctx, expense) {
        panic!("expense: {err}");
    }

    let over = NewEntry {
        case_id: "case-1".into(),
        entry_type: EntryType::Expense,
        amount_cents: 5_000,
        ..NewEntry::default()
    };
    match engine.create_financial_entry(&ctx, over) {
        Err(EngineError::BudgetExceeded(reason)) => {
            assert!(reason.contains("450.00 of 500.00"), "reason: {reason}");
        }
        Err(err) => panic!("expected BudgetExceeded, got {err}"),
        Ok(_) => panic!("expense breaching the amount cap must be blocked"),
    }

    let _ = std::fs::remove_file(path);
}

#[test]
fn soft_cap_warns_and_commits() {
    let (mut engine, path) = setup_engine("soft-cap");
    let ctx = ctx();

    if let Err(err) = engine.adjust_budget(&ctx, "case-1", BudgetKind::Hours, 600, "authorized") {
        panic!("adjust_budget: {err}");
    }
    // hard_cap stays false: the case-level layer warns instead of blocking.
    if let Err(err) = engine.create_financial_entry(&ctx, time_entry("case-1", 570)) {
        panic!("first entry: {err}");
    }

    let decision = match engine.evaluate_action(
        &ctx,
        "case-1",
        ActionDelta::new(60, 0),
        "time_entry",
        None,
    ) {
        Ok(decision) => decision,
        Err(err) => panic!("evaluate_action: {err}"),
    };
    match decision {
        Decision::AllowedWithWarning(reason) => {
            assert!(reason.contains("9.5 of 10 hours used"), "reason: {reason}");
        }
        other => panic!("expected warning, got {other:?}"),
    }

    // And the entry itself commits.
    if let Err(err) = engine.create_financial_entry(&ctx, time_entry("case-1", 60)) {
        panic!("second entry must commit under a soft cap: {err}");
    }

    let _ = std::fs::remove_file(path);
}

#[test]
fn case_without_budget_is_open() {
    let (mut engine, path) = setup_engine("open-case");
    let ctx = ctx();

    if let Err(err) = engine.create_financial_entry(&ctx, time_entry("case-9", 6_000)) {
        panic!("entry on an open case must commit: {err}");
    }
    let decision = match engine.evaluate_action(
        &ctx,
        "case-9",
        ActionDelta::new(100_000, 100_000_000),
        "time_entry",
        None,
    ) {
        Ok(decision) => decision,
        Err(err) => panic!("evaluate_action: {err}"),
    };
    assert_eq!(decision, Decision::Allowed);

    let _ = std::fs::remove_file(path);
}

#[test]
fn service_limit_blocks_independently_of_case_level() {
    let (mut engine, path) = setup_engine("service-block");
    let ctx = ctx();

    // No case budget at all; only the service instance is capped.
    let mut limit = docket_db::budget_repository::ServiceBudgetLimit {
        service_instance_id: "svc-1".into(),
        max_minutes: Some(120),
        warning_threshold_pct: 80,
        ..docket_db::budget_repository::ServiceBudgetLimit::default()
    };
    if let Err(err) = engine.set_service_budget_limit(&ctx, &mut limit) {
        panic!("set_service_budget_limit: {err}");
    }

    let mut entry = time_entry("case-1", 120);
    entry.service_instance_id = Some("svc-1".into());
    match engine.create_financial_entry(&ctx, entry) {
        Err(EngineError::BudgetExceeded(reason)) => {
            assert!(reason.contains("svc-1"), "reason: {reason}");
        }
        Err(err) => panic!("expected BudgetExceeded, got {err}"),
        Ok(_) => panic!("service-level breach must block"),
    }

    // The same spend with no service instance is unconstrained.
    if let Err(err) = engine.create_financial_entry(&ctx, time_entry("case-1", 120)) {
        panic!("entry without a service instance: {err}");
    }

    let _ = std::fs::remove_file(path);
}

#[test]
fn service_limit_warns_at_threshold() {
    let (mut engine, path) = setup_engine("service-warn");
    let ctx = ctx();

    let mut limit = docket_db::budget_repository::ServiceBudgetLimit {
        service_instance_id: "svc-1".into(),
        max_minutes: Some(600),
        warning_threshold_pct: 80,
        ..docket_db::budget_repository::ServiceBudgetLimit::default()
    };
    if let Err(err) = engine.set_service_budget_limit(&ctx, &mut limit) {
        panic!("set_service_budget_limit: {err}");
    }

    let decision = match engine.evaluate_action(
        &ctx,
        "case-1",
        ActionDelta::new(480, 0),
        "time_entry",
        Some("svc-1"),
    ) {
        Ok(decision) => decision,
        Err(err) => panic!("evaluate_action: {err}"),
    };
    match decision {
        Decision::AllowedWithWarning(reason) => {
            assert!(reason.contains("80%"), "reason: {reason}");
        }
        other => panic!("expected warning, got {other:?}"),
    }

    let _ = std::fs::remove_file(path);
}

struct MarkedNonBillable(&'static str);

impl ServiceDirectory for MarkedNonBillable {
    fn billable(&self, _org_id: &str, service_instance_id: &str) -> bool {
        service_instance_id != self.0
    }

    fn display_name(&self, _org_id: &str, _service_instance_id: &str) -> Option<String> {
        None
    }
}

#[test]
fn non_billable_service_work_is_never_capped() {
    let path = temp_db_path("non-billable");
    let mut db = match Db::open(Config::new(&path)) {
        Ok(db) => db,
        Err(err) => panic!("open db: {err}"),
    };
    if let Err(err) = db.migrate_up() {
        panic!("migrate_up: {err}");
    }
    let mut engine = Engine::with_directory(db, Box::new(MarkedNonBillable("svc-internal")));
    let ctx = ctx();

    // Exhaust the case before arming the hard cap.
    if let Err(err) = engine.adjust_budget(&ctx, "case-1", BudgetKind::Hours, 60, "authorized") {
        panic!("adjust_budget: {err}");
    }
    if let Err(err) = engine.create_financial_entry(&ctx, time_entry("case-1", 60)) {
        panic!("filling entry: {err}");
    }
    if let Err(err) = engine.set_hard_cap(&ctx, "case-1", true, "") {
        panic!("set_hard_cap: {err}");
    }

    // Internal (non-billable) work still lands, and is still audited.
    let mut internal = time_entry("case-1", 120);
    internal.service_instance_id = Some("svc-internal".into());
    if let Err(err) = engine.create_financial_entry(&ctx, internal) {
        panic!("non-billable entry must skip enforcement: {err}");
    }

    let actions = match engine.list_enforcement_actions(&ctx, "case-1") {
        Ok(actions) => actions,
        Err(err) => panic!("list_enforcement_actions: {err}"),
    };
    assert_eq!(actions.len(), 2);
    assert!(!actions[1].was_blocked);
    assert!(actions[1].context_json.contains("non_billable"));

    let _ = std::fs::remove_file(path);
}

#[test]
fn every_evaluation_writes_exactly_one_audit_record() {
    let (mut engine, path) = setup_engine("audit-completeness");
    let ctx = ctx();

    if let Err(err) = engine.adjust_budget(&ctx, "case-1", BudgetKind::Hours, 120, "authorized") {
        panic!("adjust_budget: {err}");
    }
    if let Err(err) = engine.set_hard_cap(&ctx, "case-1", true, "") {
        panic!("set_hard_cap: {err}");
    }

    let deltas = [
        ActionDelta::new(30, 0),
        ActionDelta::new(120, 0),
        ActionDelta::new(0, 0),
        ActionDelta::new(500, 0),
    ];
    let mut decisions = Vec::new();
    for delta in deltas {
        match engine.evaluate_action(&ctx, "case-1", delta, "time_entry", None) {
            Ok(decision) => decisions.push(decision),
            Err(err) => panic!("evaluate_action: {err}"),
        }
    }

    let actions = match engine.list_enforcement_actions(&ctx, "case-1") {
        Ok(actions) => actions,
        Err(err) => panic!("list_enforcement_actions: {err}"),
    };
    assert_eq!(actions.len(), decisions.len());
    for (action, decision) in actions.iter().zip(&decisions) {
        assert_eq!(action.was_blocked, decision.was_blocked());
    }

    let _ = std::fs::remove_file(path);
}
