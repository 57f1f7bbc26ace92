use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use docket_core::models::InvoiceStatus;
use docket_db::invoice_repository::{Invoice, InvoiceLineItem, InvoiceRepository};
use docket_db::{Config, Db, DbError};

fn temp_db_path(prefix: &str) -> PathBuf {
    static UNIQUE_SUFFIX: AtomicU64 = AtomicU64::new(0);
    let nanos = match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(value) => value.as_nanos(),
        Err(_) => 0,
    };
    let suffix = UNIQUE_SUFFIX.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "docket-db-invoice-{prefix}-{nanos}-{}-{suffix}.sqlite",
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

fn create_invoice(repo: &InvoiceRepository<'_>) -> Invoice {
    let mut invoice = Invoice {
        org_id: "org-1".into(),
        account_id: "acct-1".into(),
        ..Invoice::default()
    };
    if let Err(err) = repo.create(&mut invoice) {
        panic!("create invoice: {err}");
    }
    invoice
}

#[test]
fn create_and_get() {
    let (db, path) = setup_db("create");
    let repo = InvoiceRepository::new(db.conn());

    let invoice = create_invoice(&repo);
    assert_eq!(invoice.status, InvoiceStatus::Draft);
    assert_eq!(invoice.total_cents, 0);

    let stored = match repo.get("org-1", &invoice.id) {
        Ok(invoice) => invoice,
        Err(err) => panic!("get: {err}"),
    };
    assert_eq!(stored, invoice);

    match repo.get("org-2", &invoice.id) {
        Err(DbError::InvoiceNotFound) => {}
        Err(err) => panic!("expected InvoiceNotFound, got {err}"),
        Ok(_) => panic!("invoice must not leak across orgs"),
    }

    let _ = std::fs::remove_file(path);
}

#[test]
fn totals_only_move_while_draft() {
    let (db, path) = setup_db("totals");
    let repo = InvoiceRepository::new(db.conn());

    let invoice = create_invoice(&repo);
    if let Err(err) = repo.add_to_total("org-1", &invoice.id, 30_000) {
        panic!("add_to_total: {err}");
    }
    let stored = match repo.get("org-1", &invoice.id) {
        Ok(invoice) => invoice,
        Err(err) => panic!("get: {err}"),
    };
    assert_eq!(stored.total_cents, 30_000);

    if let Err(err) = repo.transition(
        "org-1",
        &invoice.id,
        InvoiceStatus::Draft,
        InvoiceStatus::Finalized,
    ) {
        panic!("finalize: {err}");
    }

    match repo.add_to_total("org-1", &invoice.id, 1) {
        Err(DbError::Validation(msg)) => assert!(msg.contains("frozen"), "got: {msg}"),
        Err(err) => panic!("expected validation error, got {err}"),
        Ok(()) => panic!("finalized invoice total must be frozen"),
    }

    // And the transition itself is compare-and-set.
    match repo.transition(
        "org-1",
        &invoice.id,
        InvoiceStatus::Draft,
        InvoiceStatus::Finalized,
    ) {
        Err(DbError::Validation(msg)) => assert!(msg.contains("invalid transition"), "got: {msg}"),
        Err(err) => panic!("expected validation error, got {err}"),
        Ok(()) => panic!("stale transition must be rejected"),
    }

    let _ = std::fs::remove_file(path);
}

#[test]
fn line_items_are_unique_per_entry() {
    let (db, path) = setup_db("line-items");
    let repo = InvoiceRepository::new(db.conn());

    let invoice = create_invoice(&repo);
    let mut item = InvoiceLineItem {
        org_id: "org-1".into(),
        invoice_id: invoice.id.clone(),
        entry_id: "entry-1".into(),
        description: "surveillance".into(),
        quantity: 2,
        rate_cents: 15_000,
        amount_cents: 30_000,
        ..InvoiceLineItem::default()
    };
    if let Err(err) = repo.insert_line_item(&mut item) {
        panic!("insert_line_item: {err}");
    }

    let mut duplicate = InvoiceLineItem {
        org_id: "org-1".into(),
        invoice_id: invoice.id.clone(),
        entry_id: "entry-1".into(),
        quantity: 2,
        rate_cents: 15_000,
        amount_cents: 30_000,
        ..InvoiceLineItem::default()
    };
    match repo.insert_line_item(&mut duplicate) {
        Err(DbError::Validation(msg)) => {
            assert!(msg.contains("already has an invoice line item"), "got: {msg}");
        }
        Err(err) => panic!("expected validation error, got {err}"),
        Ok(()) => panic!("duplicate line item must be rejected"),
    }

    let items = match repo.list_line_items("org-1", &invoice.id) {
        Ok(items) => items,
        Err(err) => panic!("list_line_items: {err}"),
    };
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].amount_cents, 30_000);

    let _ = std::fs::remove_file(path);
}
