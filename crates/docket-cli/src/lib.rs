//! docket-cli: operational front-end for the settlement engine.
//!
//! Opens the database from `DOCKET_DB` (or the default data dir), runs the
//! engine operations, and prints plain-text results. Actor identity comes
//! from `DOCKET_ACTOR` / `DOCKET_ORG`; a hosting API layer would supply
//! these from its session instead.

use docket_core::config::Config;
use docket_core::models::{ActorContext, BudgetKind, Decision, EntryType};
use docket_core::money::{format_cents, format_minutes_as_hours};
use docket_db::budget_repository::ServiceBudgetLimit;
use docket_db::{Config as DbConfig, Db};
use docket_engine::{ActionDelta, Engine, EngineError, NewEntry, RateSubject};

const USAGE: &str = "docket - budget & billing settlement engine

Usage:
  docket migrate [VERSION]
  docket status
  docket budget adjust CASE hours|dollars VALUE REASON
  docket budget show CASE
  docket budget hard-cap CASE on|off [NOTE]
  docket service-limit SERVICE MAX_MINUTES|- MAX_CENTS|- [WARN_PCT]
  docket entry CASE time MINUTES [RATE_CENTS]
  docket entry CASE expense AMOUNT_CENTS
  docket entry CASE billing_item QUANTITY [RATE_CENTS]
  docket evaluate CASE DELTA_MINUTES DELTA_CENTS [SERVICE]
  docket approve ENTRY
  docket reject ENTRY [REASON]
  docket invoice create ACCOUNT
  docket invoice finalize INVOICE
  docket invoice show INVOICE
  docket settle INVOICE ENTRY...
  docket rate add bill|pay ITEM SUBJECT RATE_CENTS FROM [UNTIL]
  docket rate resolve bill|pay ITEM SUBJECT AS_OF
  docket consumption CASE
  docket audit CASE

Durations are minutes, money is cents. Environment: DOCKET_DB, DOCKET_ORG,
DOCKET_ACTOR, DOCKET_LOG.";

/// Install the tracing subscriber. `DOCKET_LOG` takes priority over
/// `RUST_LOG`; default level is warn.
pub fn init_tracing() {
    let filter = std::env::var("DOCKET_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "warn".to_string());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .try_init();
}

/// Entry point for the `docket` binary: parse argv, run, return exit code.
pub fn run_from_env() -> i32 {
    let args: Vec<String> = std::env::args().skip(1).collect();
    run(&args)
}

/// Run one command. Exit codes: 0 success, 1 operation failed, 2 usage.
pub fn run(args: &[String]) -> i32 {
    let Some(command) = args.first() else {
        eprintln!("{USAGE}");
        return 2;
    };

    let result = match command.as_str() {
        "help" | "--help" | "-h" => {
            println!("{USAGE}");
            return 0;
        }
        "migrate" => cmd_migrate(&args[1..]),
        "status" => cmd_status(),
        "budget" => cmd_budget(&args[1..]),
        "service-limit" => cmd_service_limit(&args[1..]),
        "entry" => cmd_entry(&args[1..]),
        "evaluate" => cmd_evaluate(&args[1..]),
        "approve" => cmd_approve(&args[1..]),
        "reject" => cmd_reject(&args[1..]),
        "invoice" => cmd_invoice(&args[1..]),
        "settle" => cmd_settle(&args[1..]),
        "rate" => cmd_rate(&args[1..]),
        "consumption" => cmd_consumption(&args[1..]),
        "audit" => cmd_audit(&args[1..]),
        other => {
            eprintln!("unknown command: {other}\n\n{USAGE}");
            return 2;
        }
    };

    match result {
        Ok(()) => 0,
        Err(CliError::Usage(msg)) => {
            eprintln!("{msg}");
            2
        }
        Err(CliError::Failed(msg)) => {
            eprintln!("error: {msg}");
            1
        }
    }
}

enum CliError {
    Usage(String),
    Failed(String),
}

impl From<EngineError> for CliError {
    fn from(err: EngineError) -> Self {
        Self::Failed(err.to_string())
    }
}

impl From<docket_db::DbError> for CliError {
    fn from(err: docket_db::DbError) -> Self {
        Self::Failed(err.to_string())
    }
}

fn usage(msg: &str) -> CliError {
    CliError::Usage(format!("usage: docket {msg}"))
}

fn open_db() -> Result<Db, CliError> {
    let cfg = Config::from_env();
    let mut db_cfg = DbConfig::new(cfg.database.path);
    db_cfg.busy_timeout_ms = cfg.database.busy_timeout_ms;
    Ok(Db::open(db_cfg)?)
}

fn open_migrated() -> Result<Db, CliError> {
    let mut db = open_db()?;
    db.migrate_up()?;
    Ok(db)
}

fn open_engine() -> Result<Engine, CliError> {
    Ok(Engine::new(open_migrated()?))
}

fn actor() -> ActorContext {
    let actor_id = std::env::var("DOCKET_ACTOR").unwrap_or_else(|_| "cli".to_string());
    let org_id = std::env::var("DOCKET_ORG").unwrap_or_else(|_| "default".to_string());
    ActorContext::new(actor_id, org_id)
}

fn parse_i64(value: &str, what: &str) -> Result<i64, CliError> {
    value
        .parse::<i64>()
        .map_err(|_| CliError::Usage(format!("{what} must be an integer, got {value:?}")))
}

fn cmd_migrate(args: &[String]) -> Result<(), CliError> {
    let mut db = open_db()?;
    match args.first() {
        Some(version) => {
            let target = parse_i64(version, "VERSION")? as i32;
            db.migrate_to(target)?;
            println!("schema at version {}", db.schema_version()?);
        }
        None => {
            let applied = db.migrate_up()?;
            println!(
                "applied {applied} migration(s), schema at version {}",
                db.schema_version()?
            );
        }
    }
    Ok(())
}

fn cmd_status() -> Result<(), CliError> {
    let mut db = open_db()?;
    for status in db.migration_status()? {
        let mark = if status.applied { "x" } else { " " };
        println!(
            "[{mark}] {:03} {} {}",
            status.version, status.description, status.applied_at
        );
    }
    Ok(())
}

fn cmd_budget(args: &[String]) -> Result<(), CliError> {
    let ctx = actor();
    match args.first().map(String::as_str) {
        Some("adjust") => {
            let Some([case_id, kind, value, reason]) = args
                .get(1..5)
                .and_then(|s| <&[String; 4]>::try_from(s).ok())
            else {
                return Err(usage("budget adjust CASE hours|dollars VALUE REASON"));
            };
            let kind = BudgetKind::parse(kind).map_err(|e| CliError::Usage(e.to_string()))?;
            let value = parse_i64(value, "VALUE")?;
            let mut engine = open_engine()?;
            let id = engine.adjust_budget(&ctx, case_id, kind, value, reason)?;
            println!("adjustment {id}");
            Ok(())
        }
        Some("show") => {
            let case_id = args.get(1).ok_or_else(|| usage("budget show CASE"))?;
            let engine = open_engine()?;
            match engine.current_limits(&ctx, case_id)? {
                Some(budget) => {
                    let hours = budget
                        .hours_limit_minutes
                        .map(format_minutes_as_hours)
                        .unwrap_or_else(|| "-".to_string());
                    let amount = budget
                        .amount_limit_cents
                        .map(format_cents)
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "case {}: hours limit {hours}, amount limit {amount}, hard cap {}",
                        budget.case_id, budget.hard_cap
                    );
                }
                None => println!("case {case_id}: no budget (open case)"),
            }
            Ok(())
        }
        Some("hard-cap") => {
            let case_id = args
                .get(1)
                .ok_or_else(|| usage("budget hard-cap CASE on|off [NOTE]"))?;
            let flag = match args.get(2).map(String::as_str) {
                Some("on") => true,
                Some("off") => false,
                _ => return Err(usage("budget hard-cap CASE on|off [NOTE]")),
            };
            let note = args.get(3).map(String::as_str).unwrap_or("");
            let mut engine = open_engine()?;
            engine.set_hard_cap(&ctx, case_id, flag, note)?;
            println!("hard cap {}", if flag { "armed" } else { "disarmed" });
            Ok(())
        }
        _ => Err(usage("budget adjust|show|hard-cap ...")),
    }
}

fn cmd_service_limit(args: &[String]) -> Result<(), CliError> {
    let (Some(service_id), Some(max_minutes), Some(max_cents)) =
        (args.first(), args.get(1), args.get(2))
    else {
        return Err(usage("service-limit SERVICE MAX_MINUTES|- MAX_CENTS|- [WARN_PCT]"));
    };
    let ctx = actor();
    let mut limit = ServiceBudgetLimit {
        service_instance_id: service_id.clone(),
        max_minutes: parse_optional(max_minutes, "MAX_MINUTES")?,
        max_amount_cents: parse_optional(max_cents, "MAX_CENTS")?,
        warning_threshold_pct: match args.get(3) {
            Some(pct) => parse_i64(pct, "WARN_PCT")?,
            None => Config::from_env().enforcement.default_warning_threshold_pct,
        },
        ..ServiceBudgetLimit::default()
    };
    let mut engine = open_engine()?;
    engine.set_service_budget_limit(&ctx, &mut limit)?;
    println!("service limit {} set", limit.id);
    Ok(())
}

fn parse_optional(value: &str, what: &str) -> Result<Option<i64>, CliError> {
    if value == "-" {
        Ok(None)
    } else {
        Ok(Some(parse_i64(value, what)?))
    }
}

fn cmd_entry(args: &[String]) -> Result<(), CliError> {
    let (Some(case_id), Some(kind), Some(value)) = (args.first(), args.get(1), args.get(2)) else {
        return Err(usage("entry CASE time|expense|billing_item VALUE [RATE_CENTS]"));
    };
    let entry_type = EntryType::parse(kind).map_err(|e| CliError::Usage(e.to_string()))?;
    let value = parse_i64(value, "VALUE")?;
    let rate_cents = match args.get(3) {
        Some(rate) => Some(parse_i64(rate, "RATE_CENTS")?),
        None => None,
    };

    let mut new_entry = NewEntry {
        case_id: case_id.clone(),
        entry_type,
        rate_cents,
        ..NewEntry::default()
    };
    match entry_type {
        EntryType::Time => new_entry.minutes = Some(value),
        EntryType::Expense => new_entry.amount_cents = value,
        EntryType::BillingItem => new_entry.quantity = Some(value),
    }

    let ctx = actor();
    let mut engine = open_engine()?;
    let entry = engine.create_financial_entry(&ctx, new_entry)?;
    println!("entry {} ({}) pending", entry.id, entry.entry_type);
    Ok(())
}

fn cmd_evaluate(args: &[String]) -> Result<(), CliError> {
    let (Some(case_id), Some(minutes), Some(cents)) = (args.first(), args.get(1), args.get(2))
    else {
        return Err(usage("evaluate CASE DELTA_MINUTES DELTA_CENTS [SERVICE]"));
    };
    let delta = ActionDelta::new(parse_i64(minutes, "DELTA_MINUTES")?, parse_i64(cents, "DELTA_CENTS")?);
    let ctx = actor();
    let mut engine = open_engine()?;
    let decision = engine.evaluate_action(
        &ctx,
        case_id,
        delta,
        "cli_evaluate",
        args.get(3).map(String::as_str),
    )?;
    match decision {
        Decision::Allowed => println!("allowed"),
        Decision::AllowedWithWarning(reason) => println!("allowed with warning: {reason}"),
        Decision::Blocked(reason) => println!("blocked: {reason}"),
    }
    Ok(())
}

fn cmd_approve(args: &[String]) -> Result<(), CliError> {
    let entry_id = args.first().ok_or_else(|| usage("approve ENTRY"))?;
    let ctx = actor();
    let mut engine = open_engine()?;
    let entry = engine.approve_billing_item(&ctx, entry_id)?;
    let snapshot = entry.snapshot.as_ref();
    println!(
        "approved {} at {} ({} x {})",
        entry.id,
        snapshot.map(|s| format_cents(s.amount_cents)).unwrap_or_default(),
        snapshot.map(|s| s.quantity).unwrap_or_default(),
        snapshot.map(|s| format_cents(s.rate_cents)).unwrap_or_default(),
    );
    Ok(())
}

fn cmd_reject(args: &[String]) -> Result<(), CliError> {
    let entry_id = args.first().ok_or_else(|| usage("reject ENTRY [REASON]"))?;
    let ctx = actor();
    let mut engine = open_engine()?;
    engine.reject_billing_item(&ctx, entry_id, args.get(1).map(String::as_str))?;
    println!("rejected {entry_id}");
    Ok(())
}

fn cmd_invoice(args: &[String]) -> Result<(), CliError> {
    let ctx = actor();
    match args.first().map(String::as_str) {
        Some("create") => {
            let account_id = args.get(1).ok_or_else(|| usage("invoice create ACCOUNT"))?;
            let mut engine = open_engine()?;
            let invoice = engine.create_invoice(&ctx, account_id)?;
            println!("invoice {} (draft)", invoice.id);
            Ok(())
        }
        Some("finalize") => {
            let invoice_id = args.get(1).ok_or_else(|| usage("invoice finalize INVOICE"))?;
            let mut engine = open_engine()?;
            engine.finalize_invoice(&ctx, invoice_id)?;
            println!("invoice {invoice_id} finalized");
            Ok(())
        }
        Some("show") => {
            let invoice_id = args.get(1).ok_or_else(|| usage("invoice show INVOICE"))?;
            let engine = open_engine()?;
            let invoice = engine.invoice(&ctx, invoice_id)?;
            println!(
                "invoice {} ({}): total {}",
                invoice.id,
                invoice.status,
                format_cents(invoice.total_cents)
            );
            Ok(())
        }
        _ => Err(usage("invoice create|finalize|show ...")),
    }
}

fn cmd_settle(args: &[String]) -> Result<(), CliError> {
    let Some((invoice_id, entry_ids)) = args.split_first() else {
        return Err(usage("settle INVOICE ENTRY..."));
    };
    if entry_ids.is_empty() {
        return Err(usage("settle INVOICE ENTRY..."));
    }
    let ctx = actor();
    let mut engine = open_engine()?;
    let summary = engine.settle_invoice(&ctx, invoice_id, entry_ids)?;
    println!(
        "settled {} item(s), total {}",
        summary.created.len(),
        format_cents(summary.total_cents)
    );
    for id in &summary.skipped_not_approved {
        println!("skipped (not approved): {id}");
    }
    for id in &summary.skipped_already_invoiced {
        println!("skipped (already invoiced): {id}");
    }
    Ok(())
}

fn cmd_rate(args: &[String]) -> Result<(), CliError> {
    let ctx = actor();
    match args.first().map(String::as_str) {
        Some("add") => {
            let Some([table, item, subject, cents, from]) = args
                .get(1..6)
                .and_then(|s| <&[String; 5]>::try_from(s).ok())
            else {
                return Err(usage("rate add bill|pay ITEM SUBJECT RATE_CENTS FROM [UNTIL]"));
            };
            let rate_cents = parse_i64(cents, "RATE_CENTS")?;
            let until = args.get(6).cloned();
            let db = open_migrated()?;
            let rates = docket_db::rate_repository::RateRepository::new(db.conn());
            match table.as_str() {
                "bill" => {
                    let mut rate = docket_db::rate_repository::BillRate {
                        org_id: ctx.org_id.clone(),
                        finance_item_id: item.clone(),
                        account_id: subject.clone(),
                        rate_cents,
                        effective_from: from.clone(),
                        effective_until: until,
                        ..docket_db::rate_repository::BillRate::default()
                    };
                    rates.insert_bill_rate(&mut rate)?;
                    println!("bill rate {}", rate.id);
                }
                "pay" => {
                    let mut rate = docket_db::rate_repository::PayRate {
                        org_id: ctx.org_id.clone(),
                        finance_item_id: item.clone(),
                        user_id: subject.clone(),
                        rate_cents,
                        effective_from: from.clone(),
                        effective_until: until,
                        ..docket_db::rate_repository::PayRate::default()
                    };
                    rates.insert_pay_rate(&mut rate)?;
                    println!("pay rate {}", rate.id);
                }
                other => return Err(usage(&format!("rate add bill|pay ... (got {other})"))),
            }
            Ok(())
        }
        Some("resolve") => {
            let Some([table, item, subject, as_of]) = args
                .get(1..5)
                .and_then(|s| <&[String; 4]>::try_from(s).ok())
            else {
                return Err(usage("rate resolve bill|pay ITEM SUBJECT AS_OF"));
            };
            let subject = match table.as_str() {
                "bill" => RateSubject::Account(subject.clone()),
                "pay" => RateSubject::User(subject.clone()),
                other => return Err(usage(&format!("rate resolve bill|pay ... (got {other})"))),
            };
            let engine = open_engine()?;
            let rate = engine.resolve_rate(&ctx, item, &subject, as_of)?;
            println!("{}", format_cents(rate));
            Ok(())
        }
        _ => Err(usage("rate add|resolve ...")),
    }
}

fn cmd_consumption(args: &[String]) -> Result<(), CliError> {
    let case_id = args.first().ok_or_else(|| usage("consumption CASE"))?;
    let ctx = actor();
    let engine = open_engine()?;
    let consumption = engine.consumption(&ctx, case_id)?;
    println!(
        "case {case_id}: {} hours, {}",
        format_minutes_as_hours(consumption.minutes),
        format_cents(consumption.amount_cents)
    );
    Ok(())
}

fn cmd_audit(args: &[String]) -> Result<(), CliError> {
    let case_id = args.first().ok_or_else(|| usage("audit CASE"))?;
    let ctx = actor();
    let engine = open_engine()?;
    for action in engine.list_enforcement_actions(&ctx, case_id)? {
        let mark = if action.was_blocked { "BLOCKED" } else { "ok" };
        println!(
            "{} {} {} {} {}",
            action.created_at,
            action.action_type,
            action.enforcement_kind,
            mark,
            action.reason.unwrap_or_default()
        );
    }
    Ok(())
}
