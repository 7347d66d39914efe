//! Ledger Store: the single SQLite file that owns buckets, trades and
//! allocations.
//!
//! The database runs in write-ahead-log mode so readers never block on the
//! writer and committed transactions survive a crash. Every write goes through
//! [`LedgerStore::with_transaction`], which takes the write lock up front
//! (`BEGIN IMMEDIATE`) and retries on lock contention.
//!
//! Money columns (balances, quantities, prices, gains and deltas) are TEXT
//! holding a canonical decimal, read back through [`dec_col`]. SQLite never
//! sees them as REAL, so nothing is rounded on the way in or out.

use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use rusqlite::types::Type;
use rusqlite::{Connection, Row, Transaction, TransactionBehavior};

use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::reliability::retry::{retry_busy, retry_busy_async, RetryConfig};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS buckets (
    name TEXT PRIMARY KEY,
    asset TEXT NOT NULL,
    purpose TEXT NOT NULL,
    balance TEXT NOT NULL DEFAULT '0',
    rate TEXT NOT NULL DEFAULT '0',
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    asset TEXT NOT NULL,
    action TEXT NOT NULL CHECK (action IN ('BUY', 'SELL')),
    quantity TEXT NOT NULL,
    status TEXT NOT NULL,
    reason TEXT NOT NULL,
    price TEXT,
    price_source TEXT,
    note TEXT,
    created_at INTEGER NOT NULL,
    executed_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status);
CREATE TABLE IF NOT EXISTS allocations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trade_id INTEGER NOT NULL UNIQUE REFERENCES trades(id),
    asset TEXT NOT NULL,
    gain TEXT NOT NULL,
    tax_amt TEXT NOT NULL,
    ops_amt TEXT NOT NULL,
    reinvest_amt TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS balance_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    bucket TEXT NOT NULL REFERENCES buckets(name),
    delta TEXT NOT NULL,
    source TEXT NOT NULL,
    ref TEXT,
    created_at INTEGER NOT NULL
);
";

/// Epoch milliseconds, the timestamp unit of every ledger column.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn parse_dec(idx: usize, raw: &str) -> rusqlite::Result<Decimal> {
    Decimal::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Read a money column.
pub(crate) fn dec_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    parse_dec(idx, &raw)
}

pub(crate) fn opt_dec_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| parse_dec(idx, &r)).transpose()
}

pub struct LedgerStore {
    conn: Connection,
    retry: RetryConfig,
    path: String,
}

impl LedgerStore {
    pub fn open(path: &str, retry: RetryConfig, busy_timeout: Duration) -> LedgerResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let store = Self {
            conn,
            retry,
            path: path.to_string(),
        };
        let mode = store.enable_wal()?;
        if mode != "wal" {
            return Err(LedgerError::Config(format!(
                "{} refused write-ahead logging (journal_mode={})",
                path, mode
            )));
        }
        store.init()?;
        Ok(store)
    }

    pub fn from_config(cfg: &LedgerConfig) -> LedgerResult<Self> {
        Self::open(
            &cfg.ledger_path,
            cfg.retry.clone(),
            Duration::from_millis(cfg.busy_timeout_ms),
        )
    }

    /// Private in-memory store. SQLite keeps memory databases in their own
    /// journal mode, so this is only suitable for single-connection tests.
    pub fn open_in_memory() -> LedgerResult<Self> {
        let store = Self {
            conn: Connection::open_in_memory()?,
            retry: RetryConfig::immediate(1),
            path: ":memory:".to_string(),
        };
        store.init()?;
        Ok(store)
    }

    fn enable_wal(&self) -> LedgerResult<String> {
        retry_busy(&self.retry, "enable_wal", || {
            let mode: String = self
                .conn
                .query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
            Ok(mode.to_lowercase())
        })
    }

    fn init(&self) -> LedgerResult<()> {
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        self.conn.pragma_update(None, "synchronous", "FULL")?;
        retry_busy(&self.retry, "init_schema", || {
            self.conn.execute_batch(SCHEMA)?;
            Ok(())
        })?;
        log(
            Level::Debug,
            Domain::Storage,
            "schema_ready",
            obj(&[("path", v_str(&self.path))]),
        );
        Ok(())
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn journal_mode(&self) -> LedgerResult<String> {
        let mode: String = self.conn.query_row("PRAGMA journal_mode", [], |r| r.get(0))?;
        Ok(mode.to_lowercase())
    }

    /// Run `f` inside one write transaction.
    ///
    /// All statements commit together or not at all. Any error from `f`
    /// rolls the transaction back; lock contention re-runs `f` from scratch
    /// until the retry budget is spent, then surfaces `StorageBusy`.
    pub fn with_transaction<T, F>(&self, op: &str, mut f: F) -> LedgerResult<T>
    where
        F: FnMut(&Transaction<'_>) -> LedgerResult<T>,
    {
        retry_busy(&self.retry, op, || {
            let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
    }

    /// Run a read-only query with the same contention policy as writes.
    pub fn read<T, F>(&self, op: &str, mut f: F) -> LedgerResult<T>
    where
        F: FnMut(&Connection) -> LedgerResult<T>,
    {
        retry_busy(&self.retry, op, || f(&self.conn))
    }

    /// [`with_transaction`](Self::with_transaction) for async callers. The
    /// backoff between contended attempts sleeps on the runtime instead of
    /// blocking the worker thread.
    pub async fn with_transaction_async<T, F>(&self, op: &str, mut f: F) -> LedgerResult<T>
    where
        F: FnMut(&Transaction<'_>) -> LedgerResult<T>,
    {
        retry_busy_async(&self.retry, op, || {
            let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
        .await
    }

    pub async fn read_async<T, F>(&self, op: &str, mut f: F) -> LedgerResult<T>
    where
        F: FnMut(&Connection) -> LedgerResult<T>,
    {
        retry_busy_async(&self.retry, op, || f(&self.conn)).await
    }
}
