//! Operator CLI for the ledger.
//!
//! Usage:
//!   republic-ledger seed
//!   republic-ledger balances
//!   republic-ledger enqueue <ASSET> <BUY|SELL> <QTY> <REASON> [NEW|PENDING]
//!   republic-ledger approve <ID>
//!   republic-ledger reject <ID> <REASON>
//!   republic-ledger process
//!   republic-ledger waterfall
//!   republic-ledger cycle
//!   republic-ledger topup <BUCKET> <DELTA> [--override]
//!   republic-ledger reset <BUCKET> <BALANCE>
//!   republic-ledger trades [STATUS]
//!
//! Every command takes the singleton lock first; if another instance holds it
//! the process exits with status 2.

use anyhow::{anyhow, bail, Context, Result};
use rust_decimal::Decimal;
use serde_json::json;

use republic_ledger::buckets::BucketRegistry;
use republic_ledger::config::LedgerConfig;
use republic_ledger::consumer::ExecutionConsumer;
use republic_ledger::logging::{log, obj, v_str, Domain, Level};
use republic_ledger::oracle::HttpPriceOracle;
use republic_ledger::queue::{Action, NewTrade, TradeQueue, TradeStatus};
use republic_ledger::reliability::guard::ProcessGuard;
use republic_ledger::storage::LedgerStore;
use republic_ledger::waterfall::Waterfall;
use republic_ledger::LedgerError;

const EXIT_LOCKED: i32 = 2;

fn arg<'a>(args: &'a [String], idx: usize, name: &str) -> Result<&'a str> {
    args.get(idx)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("missing argument <{}>", name))
}

fn balances_json(store: &LedgerStore) -> Result<serde_json::Value> {
    let buckets = BucketRegistry::new(store).list()?;
    Ok(json!(buckets
        .iter()
        .map(|b| (b.name.clone(), json!(b.balance)))
        .collect::<serde_json::Map<_, _>>()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str).unwrap_or("help");
    if cmd == "help" || cmd == "--help" {
        println!("usage: republic-ledger <seed|balances|enqueue|approve|reject|process|waterfall|cycle|topup|reset|trades>");
        return Ok(());
    }

    let cfg = LedgerConfig::from_env();
    cfg.validate()?;

    let _guard = match ProcessGuard::acquire(&cfg.lock_path) {
        Ok(g) => g,
        Err(e @ LedgerError::AlreadyLocked { .. }) => {
            eprintln!("[republic-ledger] {}", e);
            std::process::exit(EXIT_LOCKED);
        }
        Err(e) => return Err(e.into()),
    };

    let store = LedgerStore::from_config(&cfg)
        .with_context(|| format!("opening ledger at {}", cfg.ledger_path))?;
    log(
        Level::Info,
        Domain::System,
        "startup",
        obj(&[("cmd", v_str(cmd)), ("ledger", v_str(store.path()))]),
    );

    let out = match cmd {
        "seed" => {
            let inserted = BucketRegistry::new(&store).seed_defaults()?;
            json!({ "rows": inserted, "balances": balances_json(&store)? })
        }
        "balances" => balances_json(&store)?,
        "enqueue" => {
            let trade = NewTrade {
                asset: arg(&args, 1, "asset")?.to_string(),
                action: arg(&args, 2, "action")?.parse::<Action>().map_err(|e| anyhow!(e))?,
                quantity: arg(&args, 3, "qty")?.parse().context("qty")?,
                reason: arg(&args, 4, "reason")?.to_string(),
                initial_status: match args.get(5) {
                    Some(s) => s.parse::<TradeStatus>().map_err(|e| anyhow!(e))?,
                    None => TradeStatus::New,
                },
            };
            let id = TradeQueue::new(&store).enqueue(&trade)?;
            json!({ "rows": 1, "trade_id": id })
        }
        "approve" => {
            let id: i64 = arg(&args, 1, "id")?.parse().context("id")?;
            let t = TradeQueue::new(&store).approve(id)?;
            json!({ "rows": t.rows(), "transition": t })
        }
        "reject" => {
            let id: i64 = arg(&args, 1, "id")?.parse().context("id")?;
            let reason = arg(&args, 2, "reason")?;
            let t = TradeQueue::new(&store).reject(id, reason)?;
            json!({ "rows": t.rows(), "transition": t })
        }
        "process" | "waterfall" | "cycle" => {
            let mut result = serde_json::Map::new();
            if cmd != "waterfall" {
                let oracle = HttpPriceOracle::new(&cfg)?;
                let report = ExecutionConsumer::new(&store, &oracle, &cfg)
                    .process_queue()
                    .await?;
                result.insert("rows".into(), json!(report.rows_affected()));
                result.insert("process".into(), json!(report));
            }
            if cmd != "process" {
                let report = Waterfall::new(&store, &cfg).run()?;
                let rows = result.get("rows").and_then(|v| v.as_u64()).unwrap_or(0);
                result.insert("rows".into(), json!(rows + report.allocated as u64));
                result.insert("waterfall".into(), json!(report));
            }
            result.insert("balances".into(), balances_json(&store)?);
            serde_json::Value::Object(result)
        }
        "topup" => {
            let bucket = arg(&args, 1, "bucket")?;
            let delta: Decimal = arg(&args, 2, "delta")?.parse().context("delta")?;
            let override_negative = args.iter().any(|a| a == "--override");
            let balance = BucketRegistry::new(&store).admin_adjust(
                bucket,
                delta,
                override_negative,
                "cli topup",
            )?;
            json!({ "rows": 1, "bucket": bucket, "balance": balance })
        }
        "reset" => {
            let bucket = arg(&args, 1, "bucket")?;
            let balance: Decimal = arg(&args, 2, "balance")?.parse().context("balance")?;
            let balance = BucketRegistry::new(&store).admin_reset(bucket, balance, "cli reset")?;
            json!({ "rows": 1, "bucket": bucket, "balance": balance })
        }
        "trades" => {
            let q = TradeQueue::new(&store);
            let statuses = match args.get(1) {
                Some(s) => vec![s.parse::<TradeStatus>().map_err(|e| anyhow!(e))?],
                None => TradeStatus::ALL.to_vec(),
            };
            let mut trades = Vec::new();
            for st in statuses {
                trades.extend(q.list_by_status(st)?);
            }
            trades.sort_by_key(|t| t.id);
            json!(trades)
        }
        other => bail!("unknown command: {}", other),
    };

    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
