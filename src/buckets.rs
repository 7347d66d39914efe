//! Bucket Registry: the fixed catalogue of capital buckets and the only code
//! path that changes their balances.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::error::{LedgerError, LedgerResult};
use crate::logging::{log, obj, v_dec, v_num, v_str, Domain, Level};
use crate::storage::{dec_col, now_ms, LedgerStore};

pub const TAX_RESERVE: &str = "TAX_RESERVE";
pub const OPERATIONS: &str = "OPERATIONS";
pub const CAPITAL_INJECTION: &str = "CAPITAL_INJECTION";
pub const TRADING_RESERVE: &str = "TRADING_RESERVE";

#[derive(Debug, Clone, Copy)]
pub struct BucketSpec {
    pub name: &'static str,
    pub asset: &'static str,
    pub purpose: &'static str,
    pub rate: Decimal,
}

/// The canonical catalogue, in seeding order.
pub fn default_buckets() -> [BucketSpec; 4] {
    [
        BucketSpec {
            name: TAX_RESERVE,
            asset: "USDC",
            purpose: "set aside for tax on realized gains",
            rate: Decimal::ZERO,
        },
        BucketSpec {
            name: OPERATIONS,
            asset: "USDC",
            purpose: "running costs",
            rate: Decimal::ZERO,
        },
        BucketSpec {
            name: CAPITAL_INJECTION,
            asset: "USDC",
            purpose: "external capital awaiting deployment",
            rate: Decimal::ZERO,
        },
        BucketSpec {
            name: TRADING_RESERVE,
            asset: "USDC",
            purpose: "reinvested gains available to trade",
            rate: dec!(0.045),
        },
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bucket {
    pub name: String,
    pub asset: String,
    pub purpose: String,
    pub balance: Decimal,
    pub rate: Decimal,
    pub updated_at: i64,
}

impl Bucket {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            asset: row.get(1)?,
            purpose: row.get(2)?,
            balance: dec_col(row, 3)?,
            rate: dec_col(row, 4)?,
            updated_at: row.get(5)?,
        })
    }
}

/// Who asked for a balance change; journaled next to every delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceSource {
    Waterfall,
    Admin,
    Auto,
}

impl BalanceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceSource::Waterfall => "waterfall",
            BalanceSource::Admin => "admin",
            BalanceSource::Auto => "auto",
        }
    }

    fn domain(&self) -> Domain {
        match self {
            BalanceSource::Waterfall => Domain::Waterfall,
            BalanceSource::Admin => Domain::Admin,
            BalanceSource::Auto => Domain::Bucket,
        }
    }
}

fn balance_of(conn: &Connection, name: &str) -> LedgerResult<Decimal> {
    conn.query_row(
        "SELECT balance FROM buckets WHERE name = ?1",
        params![name],
        |r| dec_col(r, 0),
    )
    .optional()?
    .ok_or_else(|| LedgerError::UnknownBucket(name.to_string()))
}

/// Apply `balance += delta` on an open transaction and journal it.
///
/// Returns the new balance. Callers own the transaction, so a failure here
/// rolls back everything the caller wrote alongside it.
///
/// Only a debit can trip the overdraft check; a credit to a bucket that an
/// override left negative is always accepted.
pub(crate) fn apply_delta(
    conn: &Connection,
    name: &str,
    delta: Decimal,
    source: BalanceSource,
    reference: Option<&str>,
    allow_negative: bool,
) -> LedgerResult<Decimal> {
    let balance = balance_of(conn, name)?;
    let next = balance + delta;
    if next < Decimal::ZERO && delta < Decimal::ZERO && !allow_negative {
        return Err(LedgerError::NegativeBalance {
            bucket: name.to_string(),
            balance,
            delta,
        });
    }
    let now = now_ms();
    conn.execute(
        "UPDATE buckets SET balance = ?1, updated_at = ?2 WHERE name = ?3",
        params![next.to_string(), now, name],
    )?;
    conn.execute(
        "INSERT INTO balance_events (bucket, delta, source, ref, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![name, delta.to_string(), source.as_str(), reference, now],
    )?;
    Ok(next)
}

fn log_adjustment(
    source: BalanceSource,
    name: &str,
    delta: Decimal,
    balance: Decimal,
    note: Option<&str>,
) {
    log(
        Level::Info,
        source.domain(),
        "balance_adjusted",
        obj(&[
            ("bucket", v_str(name)),
            ("source", v_str(source.as_str())),
            ("delta", v_dec(delta)),
            ("balance", v_dec(balance)),
            ("note", note.map(v_str).unwrap_or(serde_json::Value::Null)),
        ]),
    );
}

pub struct BucketRegistry<'a> {
    store: &'a LedgerStore,
}

impl<'a> BucketRegistry<'a> {
    pub fn new(store: &'a LedgerStore) -> Self {
        Self { store }
    }

    /// Insert the canonical buckets that are missing. Existing rows, and
    /// their balances, are never touched. Returns the number inserted.
    pub fn seed_defaults(&self) -> LedgerResult<usize> {
        let inserted = self.store.with_transaction("seed_defaults", |tx| {
            let now = now_ms();
            let mut inserted = 0;
            for spec in default_buckets().iter() {
                inserted += tx.execute(
                    "INSERT OR IGNORE INTO buckets (name, asset, purpose, balance, rate, updated_at)
                     VALUES (?1, ?2, ?3, '0', ?4, ?5)",
                    params![spec.name, spec.asset, spec.purpose, spec.rate.to_string(), now],
                )?;
            }
            Ok(inserted)
        })?;
        log(
            Level::Info,
            Domain::Bucket,
            "seed_defaults",
            obj(&[
                ("inserted", v_num(inserted as f64)),
                ("catalogue", v_num(default_buckets().len() as f64)),
            ]),
        );
        Ok(inserted)
    }

    /// Automated balance change. Never allowed to overdraw.
    pub fn adjust_balance(&self, name: &str, delta: Decimal) -> LedgerResult<Decimal> {
        let balance = self.store.with_transaction("adjust_balance", |tx| {
            apply_delta(tx, name, delta, BalanceSource::Auto, None, false)
        })?;
        log_adjustment(BalanceSource::Auto, name, delta, balance, None);
        Ok(balance)
    }

    /// Operator top-up or repair. `override_negative` lets the balance go
    /// below zero; nothing automated ever sets it.
    pub fn admin_adjust(
        &self,
        name: &str,
        delta: Decimal,
        override_negative: bool,
        note: &str,
    ) -> LedgerResult<Decimal> {
        let balance = self.store.with_transaction("admin_adjust", |tx| {
            apply_delta(tx, name, delta, BalanceSource::Admin, Some(note), override_negative)
        })?;
        log_adjustment(BalanceSource::Admin, name, delta, balance, Some(note));
        Ok(balance)
    }

    /// Overwrite a balance outright. The journal records the implied delta.
    pub fn admin_reset(&self, name: &str, balance: Decimal, note: &str) -> LedgerResult<Decimal> {
        if balance < Decimal::ZERO {
            return Err(LedgerError::NegativeBalance {
                bucket: name.to_string(),
                balance: Decimal::ZERO,
                delta: balance,
            });
        }
        let delta = self.store.with_transaction("admin_reset", |tx| {
            let current = balance_of(tx, name)?;
            apply_delta(tx, name, balance - current, BalanceSource::Admin, Some(note), false)?;
            Ok(balance - current)
        })?;
        log_adjustment(BalanceSource::Admin, name, delta, balance, Some(note));
        Ok(balance)
    }

    pub fn get_balance(&self, name: &str) -> LedgerResult<Decimal> {
        self.store.read("get_balance", |c| balance_of(c, name))
    }

    pub fn get(&self, name: &str) -> LedgerResult<Bucket> {
        self.store.read("get_bucket", |c| {
            c.query_row(
                "SELECT name, asset, purpose, balance, rate, updated_at FROM buckets WHERE name = ?1",
                params![name],
                Bucket::from_row,
            )
            .optional()?
            .ok_or_else(|| LedgerError::UnknownBucket(name.to_string()))
        })
    }

    pub fn list(&self) -> LedgerResult<Vec<Bucket>> {
        self.store.read("list_buckets", |c| {
            let mut stmt = c.prepare(
                "SELECT name, asset, purpose, balance, rate, updated_at FROM buckets ORDER BY name",
            )?;
            let rows = stmt.query_map([], Bucket::from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Summed in Rust: SQLite's SUM would go through REAL.
    pub fn total_balance(&self) -> LedgerResult<Decimal> {
        self.store.read("total_balance", |c| {
            let mut stmt = c.prepare("SELECT balance FROM buckets")?;
            let rows = stmt.query_map([], |r| dec_col(r, 0))?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?.into_iter().sum::<Decimal>())
        })
    }

    /// Sum of journaled deltas, optionally restricted to one source.
    pub fn journal_sum(&self, source: Option<BalanceSource>) -> LedgerResult<Decimal> {
        self.store.read("journal_sum", |c| {
            let mut stmt = c.prepare(
                "SELECT delta FROM balance_events WHERE ?1 IS NULL OR source = ?1",
            )?;
            let rows = stmt.query_map(params![source.map(|s| s.as_str())], |r| dec_col(r, 0))?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?.into_iter().sum::<Decimal>())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_is_idempotent() {
        let store = LedgerStore::open_in_memory().unwrap();
        let reg = BucketRegistry::new(&store);

        assert_eq!(reg.seed_defaults().unwrap(), 4);
        reg.admin_adjust(TAX_RESERVE, dec!(42), false, "top-up").unwrap();
        assert_eq!(reg.seed_defaults().unwrap(), 0);

        assert_eq!(reg.get_balance(TAX_RESERVE).unwrap(), dec!(42));
        assert_eq!(reg.list().unwrap().len(), 4);
        assert_eq!(reg.get(TRADING_RESERVE).unwrap().rate, dec!(0.045));
    }

    #[test]
    fn test_adjust_unknown_bucket() {
        let store = LedgerStore::open_in_memory().unwrap();
        let reg = BucketRegistry::new(&store);
        reg.seed_defaults().unwrap();
        assert!(matches!(
            reg.adjust_balance("NOPE", Decimal::ONE),
            Err(LedgerError::UnknownBucket(name)) if name == "NOPE"
        ));
        assert!(matches!(reg.get_balance("NOPE"), Err(LedgerError::UnknownBucket(_))));
    }

    #[test]
    fn test_automated_path_never_overdraws() {
        let store = LedgerStore::open_in_memory().unwrap();
        let reg = BucketRegistry::new(&store);
        reg.seed_defaults().unwrap();
        reg.adjust_balance(OPERATIONS, dec!(10)).unwrap();

        let err = reg.adjust_balance(OPERATIONS, dec!(-10.5)).unwrap_err();
        assert!(matches!(err, LedgerError::NegativeBalance { .. }));
        assert_eq!(reg.get_balance(OPERATIONS).unwrap(), dec!(10));

        assert_eq!(reg.adjust_balance(OPERATIONS, dec!(-10)).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn test_cents_accumulate_exactly() {
        let store = LedgerStore::open_in_memory().unwrap();
        let reg = BucketRegistry::new(&store);
        reg.seed_defaults().unwrap();
        for _ in 0..10 {
            reg.adjust_balance(OPERATIONS, dec!(0.1)).unwrap();
        }
        assert_eq!(reg.get_balance(OPERATIONS).unwrap(), dec!(1));
        assert_eq!(reg.adjust_balance(OPERATIONS, dec!(-1)).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn test_admin_override_bypasses_check() {
        let store = LedgerStore::open_in_memory().unwrap();
        let reg = BucketRegistry::new(&store);
        reg.seed_defaults().unwrap();

        assert!(reg.admin_adjust(OPERATIONS, dec!(-5), false, "repair").is_err());
        assert_eq!(reg.admin_adjust(OPERATIONS, dec!(-5), true, "repair").unwrap(), dec!(-5));
        assert_eq!(reg.journal_sum(Some(BalanceSource::Admin)).unwrap(), dec!(-5));
        assert_eq!(reg.journal_sum(Some(BalanceSource::Waterfall)).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn test_credit_to_overdrawn_bucket_needs_no_override() {
        let store = LedgerStore::open_in_memory().unwrap();
        let reg = BucketRegistry::new(&store);
        reg.seed_defaults().unwrap();
        reg.admin_adjust(OPERATIONS, dec!(-5), true, "repair").unwrap();

        assert_eq!(reg.admin_adjust(OPERATIONS, dec!(2), false, "partial refill").unwrap(), dec!(-3));
        assert_eq!(reg.adjust_balance(OPERATIONS, dec!(1)).unwrap(), dec!(-2));
        // Debits stay blocked while the bucket is below zero.
        assert!(matches!(
            reg.adjust_balance(OPERATIONS, dec!(-1)),
            Err(LedgerError::NegativeBalance { .. })
        ));
        assert_eq!(reg.get_balance(OPERATIONS).unwrap(), dec!(-2));
    }

    #[test]
    fn test_reset_journals_implied_delta() {
        let store = LedgerStore::open_in_memory().unwrap();
        let reg = BucketRegistry::new(&store);
        reg.seed_defaults().unwrap();
        reg.admin_adjust(CAPITAL_INJECTION, dec!(100), false, "deposit").unwrap();

        assert_eq!(reg.admin_reset(CAPITAL_INJECTION, dec!(40), "recount").unwrap(), dec!(40));
        assert_eq!(reg.get_balance(CAPITAL_INJECTION).unwrap(), dec!(40));
        assert_eq!(reg.journal_sum(None).unwrap(), dec!(40));
        assert!(reg.admin_reset(CAPITAL_INJECTION, dec!(-1), "bad").is_err());
    }

    #[test]
    fn test_reset_repairs_overdrawn_bucket() {
        let store = LedgerStore::open_in_memory().unwrap();
        let reg = BucketRegistry::new(&store);
        reg.seed_defaults().unwrap();
        reg.admin_adjust(OPERATIONS, dec!(-8), true, "repair").unwrap();

        assert_eq!(reg.admin_reset(OPERATIONS, Decimal::ZERO, "square up").unwrap(), Decimal::ZERO);
        assert_eq!(reg.total_balance().unwrap(), Decimal::ZERO);
        assert_eq!(reg.journal_sum(None).unwrap(), Decimal::ZERO);
    }
}
