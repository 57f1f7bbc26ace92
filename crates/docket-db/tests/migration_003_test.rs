use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use docket_db::{Config, Db};
use rusqlite::{params, Connection};

fn temp_db_path(tag: &str) -> PathBuf {
    let nanos = match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_nanos(),
        Err(_) => 0,
    };
    let mut path = std::env::temp_dir();
    path.push(format!(
        "docket-db-{tag}-{nanos}-{}.sqlite",
        std::process::id()
    ));
    path
}

#[test]
fn migration_003_up_down_creates_and_removes_invoice_schema() {
    let db_path = temp_db_path("migration-003");
    let mut db = match Db::open(Config::new(&db_path)) {
        Ok(db) => db,
        Err(err) => panic!("open db: {err}"),
    };

    if let Err(err) = db.migrate_to(3) {
        panic!("migrate_to(3): {err}");
    }
    assert_eq!(
        match db.schema_version() {
            Ok(version) => version,
            Err(err) => panic!("schema_version after up: {err}"),
        },
        3
    );

    assert!(table_exists(&db_path, "invoices"));
    assert!(table_exists(&db_path, "invoice_line_items"));
    assert!(index_exists(&db_path, "idx_invoices_account"));
    assert!(index_exists(&db_path, "idx_invoices_status"));
    assert!(index_exists(&db_path, "idx_invoice_line_items_invoice"));

    let rolled_back = match db.migrate_down(1) {
        Ok(count) => count,
        Err(err) => panic!("migrate_down(1): {err}"),
    };
    assert_eq!(rolled_back, 1);
    assert_eq!(
        match db.schema_version() {
            Ok(version) => version,
            Err(err) => panic!("schema_version after down: {err}"),
        },
        2
    );

    assert!(!table_exists(&db_path, "invoices"));
    assert!(!table_exists(&db_path, "invoice_line_items"));

    let _ = std::fs::remove_file(db_path);
}

#[test]
fn line_items_enforce_one_per_entry() {
    let db_path = temp_db_path("line-item-unique");
    let mut db = match Db::open(Config::new(&db_path)) {
        Ok(db) => db,
        Err(err) => panic!("open db: {err}"),
    };
    if let Err(err) = db.migrate_up() {
        panic!("migrate_up: {err}");
    }

    if let Err(err) = db.conn().execute(
        "INSERT INTO invoice_line_items (id, org_id, invoice_id, entry_id, quantity, rate_cents, amount_cents)
         VALUES ('li-1', 'org-1', 'inv-1', 'entry-1', 2, 15000, 30000)",
        [],
    ) {
        panic!("insert line item: {err}");
    }

    let duplicate = db.conn().execute(
        "INSERT INTO invoice_line_items (id, org_id, invoice_id, entry_id, quantity, rate_cents, amount_cents)
         VALUES ('li-2', 'org-1', 'inv-2', 'entry-1', 2, 15000, 30000)",
        [],
    );
    match duplicate {
        Err(err) => assert!(
            err.to_string().contains("UNIQUE constraint failed"),
            "got: {err}"
        ),
        Ok(_) => panic!("second line item for the same entry must be rejected"),
    }

    let _ = std::fs::remove_file(db_path);
}

fn table_exists(db_path: &Path, table: &str) -> bool {
    object_exists(db_path, "table", table)
}

fn index_exists(db_path: &Path, index: &str) -> bool {
    object_exists(db_path, "index", index)
}

fn object_exists(db_path: &Path, object_type: &str, name: &str) -> bool {
    let conn = match Connection::open(db_path) {
        Ok(conn) => conn,
        Err(err) => panic!("open sqlite connection {}: {err}", db_path.display()),
    };
    let exists: i64 = match conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = ?1 AND name = ?2)",
        params![object_type, name],
        |row| row.get(0),
    ) {
        Ok(exists) => exists,
        Err(err) => panic!("sqlite_master lookup ({object_type}/{name}): {err}"),
    };
    exists == 1
}
