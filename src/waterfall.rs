//! Profit Waterfall: exactly-once split of each DONE trade's realized gain
//! across the tax, operations and trading-reserve buckets.
//!
//! The allocation row and its three balance deltas are written in one
//! transaction. The allocation row doubles as the idempotency marker: a trade
//! with a row is never considered again, so re-running after a crash or a
//! retry cannot double count.
//!
//! Amounts are exact decimals. Tax and reinvest shares are rounded to
//! [`AMOUNT_DP`] places and operations takes the remainder, so the three
//! parts of every row add back to its gain with no residue.

use std::collections::HashMap;

use rust_decimal::{Decimal, RoundingStrategy};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::buckets::{apply_delta, BalanceSource, OPERATIONS, TAX_RESERVE, TRADING_RESERVE};
use crate::config::{LedgerConfig, Split};
use crate::error::{LedgerError, LedgerResult};
use crate::logging::{log, obj, v_dec, v_int, v_num, v_str, Domain, Level};
use crate::queue::{Action, Trade, TradeStatus};
use crate::storage::{dec_col, now_ms, LedgerStore};

/// Decimal places kept on the percentage shares of a gain.
pub const AMOUNT_DP: u32 = 8;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Allocation {
    pub id: i64,
    pub trade_id: i64,
    pub asset: String,
    pub gain: Decimal,
    pub tax_amt: Decimal,
    pub ops_amt: Decimal,
    pub reinvest_amt: Decimal,
    pub created_at: i64,
}

impl Allocation {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            trade_id: row.get(1)?,
            asset: row.get(2)?,
            gain: dec_col(row, 3)?,
            tax_amt: dec_col(row, 4)?,
            ops_amt: dec_col(row, 5)?,
            reinvest_amt: dec_col(row, 6)?,
            created_at: row.get(7)?,
        })
    }

    pub fn total(&self) -> Decimal {
        self.tax_amt + self.ops_amt + self.reinvest_amt
    }
}

const ALLOCATION_COLUMNS: &str =
    "id, trade_id, asset, gain, tax_amt, ops_amt, reinvest_amt, created_at";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SplitAmounts {
    pub tax: Decimal,
    pub ops: Decimal,
    pub reinvest: Decimal,
}

/// `(price - basis) * qty * sign(action)`; a SELL above basis is a gain.
pub fn realized_gain(price: Decimal, basis: Decimal, quantity: Decimal, action: Action) -> Decimal {
    (price - basis) * quantity * action.sign()
}

fn share(gain: Decimal, pct: Decimal) -> Decimal {
    (gain * pct / Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(AMOUNT_DP, RoundingStrategy::MidpointNearestEven)
}

/// Split `gain` by percentage. Operations takes the remainder so the three
/// parts always add back up to the gain. Losses split the same way.
pub fn split_gain(gain: Decimal, split: &Split) -> SplitAmounts {
    let tax = share(gain, split.tax_pct);
    let reinvest = share(gain, split.reinvest_pct);
    SplitAmounts {
        tax,
        ops: gain - tax - reinvest,
        reinvest,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockedAllocation {
    pub trade_id: i64,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WaterfallReport {
    pub allocated: usize,
    /// DONE trades that already had an allocation row; skipped.
    pub already_allocated: usize,
    pub zero_gain: usize,
    pub missing_basis: usize,
    /// Allocations refused by a bucket policy (a loss larger than a reserve).
    pub blocked: Vec<BlockedAllocation>,
    pub total_gain: Decimal,
}

/// DONE trades with no allocation row, plus how many DONE trades had one.
fn unallocated_done(conn: &Connection) -> LedgerResult<(Vec<Trade>, usize)> {
    let done = crate::queue::list_status(conn, TradeStatus::Done)?;
    let mut stmt = conn.prepare("SELECT trade_id FROM allocations")?;
    let allocated = stmt
        .query_map([], |r| r.get::<_, i64>(0))?
        .collect::<rusqlite::Result<std::collections::HashSet<_>>>()?;
    let total = done.len();
    let pending: Vec<Trade> = done.into_iter().filter(|t| !allocated.contains(&t.id)).collect();
    let already = total - pending.len();
    Ok((pending, already))
}

fn find_allocation(conn: &Connection, trade_id: i64) -> LedgerResult<Option<Allocation>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM allocations WHERE trade_id = ?1", ALLOCATION_COLUMNS),
            params![trade_id],
            Allocation::from_row,
        )
        .optional()?)
}

pub struct Waterfall<'a> {
    store: &'a LedgerStore,
    split: Split,
    cost_basis: &'a HashMap<String, Decimal>,
}

impl<'a> Waterfall<'a> {
    pub fn new(store: &'a LedgerStore, cfg: &'a LedgerConfig) -> Self {
        Self {
            store,
            split: cfg.split,
            cost_basis: &cfg.cost_basis,
        }
    }

    /// Allocate every DONE trade that has no allocation yet.
    pub fn run(&self) -> LedgerResult<WaterfallReport> {
        self.split.validate()?;
        let mut report = WaterfallReport::default();

        let (candidates, already) = self.store.read("waterfall_candidates", unallocated_done)?;
        report.already_allocated = already;

        for trade in candidates {
            let (Some(price), Some(basis)) = (trade.price, self.cost_basis.get(&trade.asset)) else {
                report.missing_basis += 1;
                log(
                    Level::Warn,
                    Domain::Waterfall,
                    "missing_basis",
                    obj(&[("trade_id", v_int(trade.id)), ("asset", v_str(&trade.asset))]),
                );
                continue;
            };
            let gain = realized_gain(price, *basis, trade.quantity, trade.action);
            if gain.is_zero() {
                report.zero_gain += 1;
                continue;
            }

            match self.allocate(&trade, gain) {
                Ok(Some(alloc)) => {
                    report.allocated += 1;
                    report.total_gain += alloc.gain;
                }
                Ok(None) => report.already_allocated += 1,
                Err(e @ LedgerError::NegativeBalance { .. }) => {
                    log(
                        Level::Error,
                        Domain::Waterfall,
                        "allocation_blocked",
                        obj(&[
                            ("trade_id", v_int(trade.id)),
                            ("gain", v_dec(gain)),
                            ("error", v_str(&e.to_string())),
                        ]),
                    );
                    report.blocked.push(BlockedAllocation {
                        trade_id: trade.id,
                        error: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        log(
            Level::Info,
            Domain::Waterfall,
            "waterfall_run",
            obj(&[
                ("allocated", v_num(report.allocated as f64)),
                ("already_allocated", v_num(report.already_allocated as f64)),
                ("zero_gain", v_num(report.zero_gain as f64)),
                ("missing_basis", v_num(report.missing_basis as f64)),
                ("blocked", v_num(report.blocked.len() as f64)),
                ("total_gain", v_dec(report.total_gain)),
            ]),
        );
        Ok(report)
    }

    /// Write the allocation and its bucket deltas atomically. `None` means a
    /// concurrent run allocated the trade first.
    fn allocate(&self, trade: &Trade, gain: Decimal) -> LedgerResult<Option<Allocation>> {
        let parts = split_gain(gain, &self.split);
        let reference = format!("trade:{}", trade.id);
        let alloc = self.store.with_transaction("allocate", |tx| {
            if find_allocation(tx, trade.id)?.is_some() {
                return Ok(None);
            }
            tx.execute(
                "INSERT INTO allocations (trade_id, asset, gain, tax_amt, ops_amt, reinvest_amt, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    trade.id,
                    trade.asset,
                    gain.to_string(),
                    parts.tax.to_string(),
                    parts.ops.to_string(),
                    parts.reinvest.to_string(),
                    now_ms()
                ],
            )?;
            for (bucket, delta) in [
                (TAX_RESERVE, parts.tax),
                (OPERATIONS, parts.ops),
                (TRADING_RESERVE, parts.reinvest),
            ] {
                apply_delta(tx, bucket, delta, BalanceSource::Waterfall, Some(&reference), false)?;
            }
            find_allocation(tx, trade.id)
        })?;

        if let Some(a) = &alloc {
            log(
                Level::Info,
                Domain::Waterfall,
                "allocated",
                obj(&[
                    ("trade_id", v_int(a.trade_id)),
                    ("asset", v_str(&a.asset)),
                    ("gain", v_dec(a.gain)),
                    ("tax_amt", v_dec(a.tax_amt)),
                    ("ops_amt", v_dec(a.ops_amt)),
                    ("reinvest_amt", v_dec(a.reinvest_amt)),
                ]),
            );
        }
        Ok(alloc)
    }

    pub fn allocation_for(&self, trade_id: i64) -> LedgerResult<Option<Allocation>> {
        self.store
            .read("allocation_for", |c| find_allocation(c, trade_id))
    }

    pub fn list_allocations(&self) -> LedgerResult<Vec<Allocation>> {
        self.store.read("list_allocations", |c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {} FROM allocations ORDER BY id",
                ALLOCATION_COLUMNS
            ))?;
            let rows = stmt.query_map([], Allocation::from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buckets::BucketRegistry;
    use crate::queue::{NewTrade, PriceSource, TradeQueue};
    use rust_decimal_macros::dec;

    fn done_trade(
        store: &LedgerStore,
        asset: &str,
        action: Action,
        qty: Decimal,
        price: Decimal,
    ) -> i64 {
        let q = TradeQueue::new(store);
        let id = q
            .enqueue(&NewTrade {
                asset: asset.into(),
                action,
                quantity: qty,
                reason: "test".into(),
                initial_status: TradeStatus::New,
            })
            .unwrap();
        q.approve(id).unwrap();
        q.mark_done(id, price, PriceSource::Oracle).unwrap();
        id
    }

    fn cfg_with_basis(pairs: &[(&str, Decimal)]) -> LedgerConfig {
        let mut cfg = LedgerConfig::default();
        cfg.cost_basis = pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        cfg
    }

    #[test]
    fn test_realized_gain_sign() {
        assert_eq!(realized_gain(dec!(150), dec!(100), dec!(10), Action::Sell), dec!(500));
        assert_eq!(realized_gain(dec!(150), dec!(100), dec!(10), Action::Buy), dec!(-500));
    }

    #[test]
    fn test_split_parts_sum_to_gain() {
        let split = Split {
            tax_pct: dec!(33),
            ops_pct: dec!(33.5),
            reinvest_pct: dec!(33.5),
        };
        for gain in [dec!(500), dec!(-123.45), dec!(0.01), dec!(333333.333333333333)] {
            let p = split_gain(gain, &split);
            assert_eq!(p.tax + p.ops + p.reinvest, gain);
        }
        let p = split_gain(dec!(500), &Split::default());
        assert_eq!((p.tax, p.ops, p.reinvest), (dec!(150), dec!(250), dec!(100)));
    }

    #[test]
    fn test_cent_steps_conserve_exactly() {
        // Price a cent apart at a time over a 0.3 lot, default 30/50/20 split.
        let split = Split::default();
        for c in 1..2000 {
            let price = dec!(100) + Decimal::from(c) * dec!(0.01);
            let gain = realized_gain(price, dec!(100), dec!(0.3), Action::Sell);
            let p = split_gain(gain, &split);
            assert_eq!(p.tax + p.ops + p.reinvest, gain, "cent step {}", c);
        }
        let p = split_gain(dec!(0.069), &split);
        assert_eq!((p.tax, p.ops, p.reinvest), (dec!(0.0207), dec!(0.0345), dec!(0.0138)));
    }

    #[test]
    fn test_zero_gain_and_missing_basis_skipped() {
        let store = LedgerStore::open_in_memory().unwrap();
        BucketRegistry::new(&store).seed_defaults().unwrap();
        done_trade(&store, "SOL", Action::Sell, dec!(1), dec!(100.00));
        done_trade(&store, "ETH", Action::Sell, dec!(1), dec!(3000));

        let cfg = cfg_with_basis(&[("SOL", dec!(100))]);
        let report = Waterfall::new(&store, &cfg).run().unwrap();
        assert_eq!(report.allocated, 0);
        assert_eq!(report.zero_gain, 1);
        assert_eq!(report.missing_basis, 1);
    }

    #[test]
    fn test_stored_allocation_rows_conserve() {
        let store = LedgerStore::open_in_memory().unwrap();
        let buckets = BucketRegistry::new(&store);
        buckets.seed_defaults().unwrap();
        for (qty, price) in [(dec!(0.3), dec!(100.23)), (dec!(1.7), dec!(100.07)), (dec!(3), dec!(101.11))] {
            done_trade(&store, "SOL", Action::Sell, qty, price);
        }

        let cfg = cfg_with_basis(&[("SOL", dec!(100))]);
        let wf = Waterfall::new(&store, &cfg);
        let report = wf.run().unwrap();
        assert_eq!(report.allocated, 3);

        let allocations = wf.list_allocations().unwrap();
        for a in &allocations {
            assert_eq!(a.total(), a.gain);
        }
        let allocated: Decimal = allocations.iter().map(|a| a.gain).sum();
        assert_eq!(allocated, report.total_gain);
        assert_eq!(buckets.journal_sum(Some(BalanceSource::Waterfall)).unwrap(), allocated);
        assert_eq!(buckets.total_balance().unwrap(), allocated);
    }

    #[test]
    fn test_loss_beyond_reserves_is_blocked_atomically() {
        let store = LedgerStore::open_in_memory().unwrap();
        let buckets = BucketRegistry::new(&store);
        buckets.seed_defaults().unwrap();
        // Enough for the tax share of the loss but not the rest.
        buckets.admin_adjust(TAX_RESERVE, dec!(100), false, "prefund").unwrap();
        let id = done_trade(&store, "SOL", Action::Sell, dec!(10), dec!(90));

        let cfg = cfg_with_basis(&[("SOL", dec!(100))]);
        let wf = Waterfall::new(&store, &cfg);
        let report = wf.run().unwrap();
        assert_eq!(report.allocated, 0);
        assert_eq!(report.blocked.len(), 1);
        assert_eq!(report.blocked[0].trade_id, id);

        assert!(wf.allocation_for(id).unwrap().is_none());
        assert_eq!(buckets.get_balance(TAX_RESERVE).unwrap(), dec!(100));
        assert_eq!(buckets.journal_sum(Some(BalanceSource::Waterfall)).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn test_loss_reduces_reserves_symmetrically() {
        let store = LedgerStore::open_in_memory().unwrap();
        let buckets = BucketRegistry::new(&store);
        buckets.seed_defaults().unwrap();
        for name in [TAX_RESERVE, OPERATIONS, TRADING_RESERVE] {
            buckets.admin_adjust(name, dec!(1000), false, "prefund").unwrap();
        }
        done_trade(&store, "SOL", Action::Sell, dec!(10), dec!(90));

        let cfg = cfg_with_basis(&[("SOL", dec!(100))]);
        let report = Waterfall::new(&store, &cfg).run().unwrap();
        assert_eq!(report.allocated, 1);
        assert_eq!(report.total_gain, dec!(-100));
        assert_eq!(buckets.get_balance(TAX_RESERVE).unwrap(), dec!(970));
        assert_eq!(buckets.get_balance(OPERATIONS).unwrap(), dec!(950));
        assert_eq!(buckets.get_balance(TRADING_RESERVE).unwrap(), dec!(980));
    }
}
