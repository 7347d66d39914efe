//! Trade Queue: append-only trade intents and their guarded status changes.

pub mod state;

use std::str::FromStr;

use rust_decimal::Decimal;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::error::{LedgerError, LedgerResult};
use crate::logging::{log, obj, v_dec, v_int, v_num, v_str, Domain, Level};
use crate::storage::{dec_col, now_ms, opt_dec_col, LedgerStore};
use state::{next_status, Step, TradeEvent};

pub use state::{Action, TradeStatus};

/// Where an execution price came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSource {
    Oracle,
    Fallback,
}

impl PriceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceSource::Oracle => "oracle",
            PriceSource::Fallback => "fallback",
        }
    }
}

impl FromStr for PriceSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oracle" => Ok(PriceSource::Oracle),
            "fallback" => Ok(PriceSource::Fallback),
            other => Err(format!("unknown price source: {}", other)),
        }
    }
}

/// A producer's request to enqueue a trade.
#[derive(Debug, Clone)]
pub struct NewTrade {
    pub asset: String,
    pub action: Action,
    pub quantity: Decimal,
    pub reason: String,
    pub initial_status: TradeStatus,
}

impl NewTrade {
    pub fn validate(&self) -> LedgerResult<()> {
        if self.asset.trim().is_empty() {
            return Err(LedgerError::InvalidTrade("asset is empty".into()));
        }
        if self.quantity <= Decimal::ZERO {
            return Err(LedgerError::InvalidTrade(format!(
                "quantity must be positive, got {}",
                self.quantity
            )));
        }
        if !self.initial_status.is_initial() {
            return Err(LedgerError::InvalidTrade(format!(
                "trades enter the queue as NEW or PENDING, not {}",
                self.initial_status
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trade {
    pub id: i64,
    pub asset: String,
    pub action: Action,
    pub quantity: Decimal,
    pub status: TradeStatus,
    pub reason: String,
    pub price: Option<Decimal>,
    pub price_source: Option<PriceSource>,
    pub note: Option<String>,
    pub created_at: i64,
    pub executed_at: Option<i64>,
}

const TRADE_COLUMNS: &str =
    "id, asset, action, quantity, status, reason, price, price_source, note, created_at, executed_at";

fn parse_col<T: FromStr<Err = String>>(idx: usize, raw: String) -> rusqlite::Result<T> {
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            e.into(),
        )
    })
}

impl Trade {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let source: Option<String> = row.get(7)?;
        Ok(Self {
            id: row.get(0)?,
            asset: row.get(1)?,
            action: parse_col(2, row.get(2)?)?,
            quantity: dec_col(row, 3)?,
            status: parse_col(4, row.get(4)?)?,
            reason: row.get(5)?,
            price: opt_dec_col(row, 6)?,
            price_source: source.map(|s| parse_col(7, s)).transpose()?,
            note: row.get(8)?,
            created_at: row.get(9)?,
            executed_at: row.get(10)?,
        })
    }

    pub fn executed_with_fallback(&self) -> bool {
        self.price_source == Some(PriceSource::Fallback)
    }
}

/// Outcome of a status change. `rows()` is what callers report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Applied(TradeStatus),
    /// Already in the requested state.
    Unchanged,
    /// Another writer moved the trade first.
    RaceLost,
}

impl Transition {
    pub fn rows(&self) -> usize {
        match self {
            Transition::Applied(_) => 1,
            Transition::Unchanged | Transition::RaceLost => 0,
        }
    }
}

pub(crate) fn fetch_trade(conn: &Connection, id: i64) -> LedgerResult<Trade> {
    conn.query_row(
        &format!("SELECT {} FROM trades WHERE id = ?1", TRADE_COLUMNS),
        params![id],
        Trade::from_row,
    )
    .optional()?
    .ok_or(LedgerError::UnknownTrade(id))
}

pub(crate) fn list_status(conn: &Connection, status: TradeStatus) -> LedgerResult<Vec<Trade>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM trades WHERE status = ?1 ORDER BY id",
        TRADE_COLUMNS
    ))?;
    let rows = stmt.query_map(params![status.as_str()], Trade::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Validate `event` against the current status, then apply it with an
/// `UPDATE ... WHERE status = <observed>` so a concurrent writer can't be
/// overwritten.
fn guarded_update(
    conn: &Connection,
    id: i64,
    event: TradeEvent,
    note: Option<&str>,
) -> LedgerResult<Transition> {
    let trade = fetch_trade(conn, id)?;
    let to = match next_status(trade.status, event) {
        Ok(Step::Move(to)) => to,
        Ok(Step::Stay) => return Ok(Transition::Unchanged),
        Err(e) => {
            return Err(LedgerError::InvalidTransition {
                id,
                from: e.from.to_string(),
                to: e.event.target().to_string(),
            })
        }
    };
    let rows = conn.execute(
        "UPDATE trades SET status = ?1, note = COALESCE(?2, note) WHERE id = ?3 AND status = ?4",
        params![to.as_str(), note, id, trade.status.as_str()],
    )?;
    Ok(if rows == 1 {
        Transition::Applied(to)
    } else {
        Transition::RaceLost
    })
}

pub(crate) fn guarded_approve(conn: &Connection, id: i64) -> LedgerResult<Transition> {
    guarded_update(conn, id, TradeEvent::Approve, None)
}

/// Conditional `APPROVED -> DONE` with the price written in the same
/// statement. Zero rows means someone else already settled the trade.
pub(crate) fn settle_done(
    conn: &Connection,
    id: i64,
    price: Decimal,
    source: PriceSource,
) -> LedgerResult<Transition> {
    if price <= Decimal::ZERO {
        return Err(LedgerError::InvalidTrade(format!(
            "execution price must be positive, got {} for trade {}",
            price, id
        )));
    }
    let rows = conn.execute(
        "UPDATE trades SET status = 'DONE', price = ?1, price_source = ?2, executed_at = ?3
         WHERE id = ?4 AND status = 'APPROVED' AND price IS NULL",
        params![price.to_string(), source.as_str(), now_ms(), id],
    )?;
    if rows == 1 {
        return Ok(Transition::Applied(TradeStatus::Done));
    }
    fetch_trade(conn, id)?;
    Ok(Transition::RaceLost)
}

/// Conditional `APPROVED -> FAILED`, keeping the trade with a note.
pub(crate) fn settle_failed(conn: &Connection, id: i64, note: &str) -> LedgerResult<Transition> {
    let rows = conn.execute(
        "UPDATE trades SET status = 'FAILED', note = ?1, executed_at = ?2
         WHERE id = ?3 AND status = 'APPROVED'",
        params![note, now_ms(), id],
    )?;
    if rows == 1 {
        return Ok(Transition::Applied(TradeStatus::Failed));
    }
    fetch_trade(conn, id)?;
    Ok(Transition::RaceLost)
}

pub struct TradeQueue<'a> {
    store: &'a LedgerStore,
}

impl<'a> TradeQueue<'a> {
    pub fn new(store: &'a LedgerStore) -> Self {
        Self { store }
    }

    pub fn enqueue(&self, trade: &NewTrade) -> LedgerResult<i64> {
        trade.validate()?;
        let asset = trade.asset.trim().to_uppercase();
        let id = self.store.with_transaction("enqueue", |tx| {
            tx.execute(
                "INSERT INTO trades (asset, action, quantity, status, reason, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    asset,
                    trade.action.as_str(),
                    trade.quantity.to_string(),
                    trade.initial_status.as_str(),
                    trade.reason,
                    now_ms()
                ],
            )?;
            Ok(tx.last_insert_rowid())
        })?;
        log(
            Level::Info,
            Domain::Queue,
            "enqueued",
            obj(&[
                ("trade_id", v_int(id)),
                ("asset", v_str(&asset)),
                ("action", v_str(trade.action.as_str())),
                ("quantity", v_dec(trade.quantity)),
                ("status", v_str(trade.initial_status.as_str())),
                ("reason", v_str(&trade.reason)),
            ]),
        );
        Ok(id)
    }

    /// `NEW|PENDING -> APPROVED`. Approving an approved trade is a no-op.
    pub fn approve(&self, id: i64) -> LedgerResult<Transition> {
        let t = self
            .store
            .with_transaction("approve", |tx| guarded_approve(tx, id))?;
        log_transition("approve", id, t, None);
        Ok(t)
    }

    /// `NEW|PENDING -> REJECTED`, keeping `reason` on the trade.
    pub fn reject(&self, id: i64, reason: &str) -> LedgerResult<Transition> {
        let t = self.store.with_transaction("reject", |tx| {
            guarded_update(tx, id, TradeEvent::Reject, Some(reason))
        })?;
        log_transition("reject", id, t, Some(reason));
        Ok(t)
    }

    pub fn mark_done(
        &self,
        id: i64,
        price: Decimal,
        source: PriceSource,
    ) -> LedgerResult<Transition> {
        let t = self
            .store
            .with_transaction("mark_done", |tx| settle_done(tx, id, price, source))?;
        log_transition("execute", id, t, None);
        Ok(t)
    }

    pub fn mark_failed(&self, id: i64, note: &str) -> LedgerResult<Transition> {
        let t = self
            .store
            .with_transaction("mark_failed", |tx| settle_failed(tx, id, note))?;
        log_transition("fail", id, t, Some(note));
        Ok(t)
    }

    pub fn get(&self, id: i64) -> LedgerResult<Trade> {
        self.store.read("get_trade", |c| fetch_trade(c, id))
    }

    pub fn list_by_status(&self, status: TradeStatus) -> LedgerResult<Vec<Trade>> {
        self.store.read("list_trades", |c| list_status(c, status))
    }
}

pub(crate) fn log_transition(op: &str, id: i64, t: Transition, note: Option<&str>) {
    let (level, outcome) = match t {
        Transition::Applied(to) => (Level::Info, to.as_str()),
        Transition::Unchanged => (Level::Debug, "unchanged"),
        Transition::RaceLost => (Level::Info, "race_lost"),
    };
    log(
        level,
        Domain::Queue,
        "transition",
        obj(&[
            ("trade_id", v_int(id)),
            ("op", v_str(op)),
            ("outcome", v_str(outcome)),
            ("rows", v_num(t.rows() as f64)),
            ("note", note.map(v_str).unwrap_or(serde_json::Value::Null)),
        ]),
    );
}
