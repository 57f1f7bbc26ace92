use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use docket_db::rate_repository::{BillRate, PayRate, RateRepository};
use docket_db::{Config, Db, DbError};

fn temp_db_path(prefix: &str) -> PathBuf {
    static UNIQUE_SUFFIX: AtomicU64 = AtomicU64::new(0);
    let nanos = match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(value) => value.as_nanos(),
        Err(_) => 0,
    };
    let suffix = UNIQUE_SUFFIX.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "docket-db-rate-{prefix}-{nanos}-{}-{suffix}.sqlite",
        std::process::id(),
    ))
}

fn setup_db(prefix: &str) -> (Db, PathBuf) {
    let path = temp_db_path(prefix);
    let mut db = match Db::open(Config::new(&path)) {
        Ok(value) => value,
        Err(err) => panic!("open db failed: {err}"),
    };
    if let Err(err) = db.migrate_up() {
        panic!("migrate_up failed: {err}");
    }
    (db, path)
}

fn bill_rate(item: &str, account: &str, cents: i64, from: &str, until: Option<&str>) -> BillRate {
    BillRate {
        org_id: "org-1".into(),
        finance_item_id: item.into(),
        account_id: account.into(),
        rate_cents: cents,
        effective_from: from.into(),
        effective_until: until.map(str::to_string),
        ..BillRate::default()
    }
}

#[test]
fn resolution_honors_effective_windows() {
    let (db, path) = setup_db("windows");
    let repo = RateRepository::new(db.conn());

    let mut old = bill_rate(
        "item-1",
        "acct-1",
        10_000,
        "2026-01-01T00:00:00Z",
        Some("2026-06-01T00:00:00Z"),
    );
    let mut current = bill_rate("item-1", "acct-1", 15_000, "2026-06-01T00:00:00Z", None);
    for rate in [&mut old, &mut current] {
        if let Err(err) = repo.insert_bill_rate(rate) {
            panic!("insert_bill_rate: {err}");
        }
    }

    let before = match repo.resolve_bill_rate("org-1", "item-1", "acct-1", "2025-12-31T00:00:00Z") {
        Ok(value) => value,
        Err(err) => panic!("resolve: {err}"),
    };
    assert!(before.is_none(), "nothing effective before the first window");

    let within = match repo.resolve_bill_rate("org-1", "item-1", "acct-1", "2026-03-01T00:00:00Z") {
        Ok(Some(rate)) => rate,
        Ok(None) => panic!("expected a rate inside the first window"),
        Err(err) => panic!("resolve: {err}"),
    };
    assert_eq!(within.rate_cents, 10_000);

    let after = match repo.resolve_bill_rate("org-1", "item-1", "acct-1", "2026-08-06T00:00:00Z") {
        Ok(Some(rate)) => rate,
        Ok(None) => panic!("expected the open-ended rate"),
        Err(err) => panic!("resolve: {err}"),
    };
    assert_eq!(after.rate_cents, 15_000);

    // The window boundary belongs to the newer rate.
    let boundary = match repo.resolve_bill_rate("org-1", "item-1", "acct-1", "2026-06-01T00:00:00Z")
    {
        Ok(Some(rate)) => rate,
        Ok(None) => panic!("expected a rate at the boundary"),
        Err(err) => panic!("resolve: {err}"),
    };
    assert_eq!(boundary.rate_cents, 15_000);

    let _ = std::fs::remove_file(path);
}

#[test]
fn most_recently_effective_match_wins() {
    let (db, path) = setup_db("overlap");
    let repo = RateRepository::new(db.conn());

    let mut base = bill_rate("item-1", "acct-1", 10_000, "2026-01-01T00:00:00Z", None);
    let mut renegotiated = bill_rate("item-1", "acct-1", 12_500, "2026-04-01T00:00:00Z", None);
    for rate in [&mut base, &mut renegotiated] {
        if let Err(err) = repo.insert_bill_rate(rate) {
            panic!("insert_bill_rate: {err}");
        }
    }

    let resolved = match repo.resolve_bill_rate("org-1", "item-1", "acct-1", "2026-08-06T00:00:00Z")
    {
        Ok(Some(rate)) => rate,
        Ok(None) => panic!("expected a rate"),
        Err(err) => panic!("resolve: {err}"),
    };
    assert_eq!(resolved.rate_cents, 12_500);

    let _ = std::fs::remove_file(path);
}

#[test]
fn pay_rates_never_fall_back_to_bill_rates() {
    let (db, path) = setup_db("no-fallback");
    let repo = RateRepository::new(db.conn());

    // A bill rate exists for the same finance item and a subject with the
    // same id string; the pay-rate lookup must still miss.
    let mut bill = bill_rate("item-1", "subject-1", 15_000, "2026-01-01T00:00:00Z", None);
    if let Err(err) = repo.insert_bill_rate(&mut bill) {
        panic!("insert_bill_rate: {err}");
    }

    let pay = match repo.resolve_pay_rate("org-1", "item-1", "subject-1", "2026-08-06T00:00:00Z") {
        Ok(value) => value,
        Err(err) => panic!("resolve_pay_rate: {err}"),
    };
    assert!(pay.is_none(), "pay rate lookup must never see bill rates");

    // And the other direction.
    let mut pay_rate = PayRate {
        org_id: "org-1".into(),
        finance_item_id: "item-2".into(),
        user_id: "subject-2".into(),
        rate_cents: 8_000,
        effective_from: "2026-01-01T00:00:00Z".into(),
        ..PayRate::default()
    };
    if let Err(err) = repo.insert_pay_rate(&mut pay_rate) {
        panic!("insert_pay_rate: {err}");
    }
    let bill = match repo.resolve_bill_rate("org-1", "item-2", "subject-2", "2026-08-06T00:00:00Z")
    {
        Ok(value) => value,
        Err(err) => panic!("resolve_bill_rate: {err}"),
    };
    assert!(bill.is_none(), "bill rate lookup must never see pay rates");

    let _ = std::fs::remove_file(path);
}

#[test]
fn rate_validation() {
    let (db, path) = setup_db("validation");
    let repo = RateRepository::new(db.conn());

    let mut negative = bill_rate("item-1", "acct-1", -1, "2026-01-01T00:00:00Z", None);
    match repo.insert_bill_rate(&mut negative) {
        Err(DbError::Validation(msg)) => assert!(msg.contains("rate_cents"), "got: {msg}"),
        Err(err) => panic!("expected validation error, got {err}"),
        Ok(()) => panic!("negative rate must be rejected"),
    }

    let mut inverted = bill_rate(
        "item-1",
        "acct-1",
        10_000,
        "2026-06-01T00:00:00Z",
        Some("2026-01-01T00:00:00Z"),
    );
    match repo.insert_bill_rate(&mut inverted) {
        Err(DbError::Validation(msg)) => assert!(msg.contains("effective_until"), "got: {msg}"),
        Err(err) => panic!("expected validation error, got {err}"),
        Ok(()) => panic!("inverted window must be rejected"),
    }

    let _ = std::fs::remove_file(path);
}
