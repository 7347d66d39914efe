//! Execution Consumer: drains approved trades into DONE or FAILED.
//!
//! Price lookups happen outside any transaction; only the final conditional
//! status write takes the ledger's write lock. A consumer that loses the race
//! for a trade sees zero rows affected and moves on. Storage calls use the
//! async store methods so lock contention backs off on the runtime.

use anyhow::anyhow;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::logging::{log, obj, v_dec, v_int, v_num, v_str, Domain, Level};
use crate::oracle::PriceOracle;
use crate::queue::{
    guarded_approve, list_status, log_transition, settle_done, settle_failed, PriceSource, Trade,
    TradeStatus, Transition,
};
use crate::reliability::retry::retry_async;
use crate::storage::LedgerStore;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum ResolvedPrice {
    Oracle(Decimal),
    Fallback(Decimal),
    Unavailable,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessReport {
    /// PENDING trades promoted through the trusted fast path.
    pub approved_fast_path: usize,
    /// PENDING trades left for manual approval.
    pub awaiting_approval: usize,
    pub done: usize,
    pub failed: usize,
    /// Subset of `done` executed at a fallback price.
    pub fallback: usize,
    pub race_lost: usize,
}

impl ProcessReport {
    pub fn rows_affected(&self) -> usize {
        self.approved_fast_path + self.done + self.failed
    }
}

pub struct ExecutionConsumer<'a> {
    store: &'a LedgerStore,
    oracle: &'a dyn PriceOracle,
    cfg: &'a LedgerConfig,
}

impl<'a> ExecutionConsumer<'a> {
    pub fn new(store: &'a LedgerStore, oracle: &'a dyn PriceOracle, cfg: &'a LedgerConfig) -> Self {
        Self { store, oracle, cfg }
    }

    /// Ask the oracle up to `oracle_attempts` times, then fall back to the
    /// configured table.
    pub async fn resolve_price(&self, asset: &str) -> ResolvedPrice {
        let looked_up = retry_async(&self.cfg.oracle_retry(), "oracle_price", || async move {
            match self.oracle.get_price(asset).await? {
                Some(p) if p > Decimal::ZERO => Ok(p),
                Some(p) => Err(anyhow!("invalid price {} for {}", p, asset)),
                None => Err(anyhow!("no price for {}", asset)),
            }
        })
        .await;

        match looked_up {
            Ok(p) => ResolvedPrice::Oracle(p),
            Err(e) => {
                let fallback = self.cfg.fallback.price_for(asset);
                log(
                    Level::Warn,
                    Domain::Exec,
                    "price_unavailable",
                    obj(&[
                        ("asset", v_str(asset)),
                        ("error", v_str(&e.to_string())),
                        ("fallback", fallback.map(v_dec).unwrap_or(serde_json::Value::Null)),
                    ]),
                );
                match fallback {
                    Some(p) => ResolvedPrice::Fallback(p),
                    None => ResolvedPrice::Unavailable,
                }
            }
        }
    }

    /// One pass over the queue. Safe to call repeatedly: terminal trades are
    /// never selected, and each trade gets at most one status write.
    pub async fn process_queue(&self) -> LedgerResult<ProcessReport> {
        let mut report = ProcessReport::default();

        let pending = self
            .store
            .read_async("list_pending", |c| list_status(c, TradeStatus::Pending))
            .await?;
        for trade in pending {
            if !self.cfg.is_trusted(&trade.reason) {
                report.awaiting_approval += 1;
                continue;
            }
            let approved = self
                .store
                .with_transaction_async("fast_path_approve", |tx| guarded_approve(tx, trade.id))
                .await;
            let t = match approved {
                Ok(t) => t,
                // Another consumer already carried it past APPROVED.
                Err(LedgerError::InvalidTransition { .. }) => Transition::RaceLost,
                Err(e) => return Err(e),
            };
            log_transition("fast_path_approve", trade.id, t, Some(&trade.reason));
            match t {
                Transition::Applied(_) => report.approved_fast_path += 1,
                Transition::RaceLost => report.race_lost += 1,
                Transition::Unchanged => {}
            }
        }

        let approved = self
            .store
            .read_async("list_approved", |c| list_status(c, TradeStatus::Approved))
            .await?;
        for trade in approved {
            self.execute(&trade, &mut report).await?;
        }

        log(
            Level::Info,
            Domain::Exec,
            "process_queue",
            obj(&[
                ("approved_fast_path", v_num(report.approved_fast_path as f64)),
                ("awaiting_approval", v_num(report.awaiting_approval as f64)),
                ("done", v_num(report.done as f64)),
                ("failed", v_num(report.failed as f64)),
                ("fallback", v_num(report.fallback as f64)),
                ("race_lost", v_num(report.race_lost as f64)),
            ]),
        );
        Ok(report)
    }

    async fn execute(&self, trade: &Trade, report: &mut ProcessReport) -> LedgerResult<()> {
        let resolved = self.resolve_price(&trade.asset).await;
        let (t, note) = match resolved {
            ResolvedPrice::Oracle(p) => (
                self.store
                    .with_transaction_async("execute", |tx| {
                        settle_done(tx, trade.id, p, PriceSource::Oracle)
                    })
                    .await?,
                None,
            ),
            ResolvedPrice::Fallback(p) => (
                self.store
                    .with_transaction_async("execute", |tx| {
                        settle_done(tx, trade.id, p, PriceSource::Fallback)
                    })
                    .await?,
                Some("executed at fallback price".to_string()),
            ),
            ResolvedPrice::Unavailable => {
                let note = format!("price unavailable for {} and no fallback", trade.asset);
                let t = self
                    .store
                    .with_transaction_async("fail", |tx| settle_failed(tx, trade.id, &note))
                    .await?;
                (t, Some(note))
            }
        };
        log_transition("execute", trade.id, t, note.as_deref());

        match t {
            Transition::Applied(TradeStatus::Done) => {
                report.done += 1;
                if let ResolvedPrice::Fallback(p) = resolved {
                    report.fallback += 1;
                    log(
                        Level::Warn,
                        Domain::Exec,
                        "fallback_executed",
                        obj(&[
                            ("trade_id", v_int(trade.id)),
                            ("asset", v_str(&trade.asset)),
                            ("price", v_dec(p)),
                        ]),
                    );
                }
            }
            Transition::Applied(_) => report.failed += 1,
            Transition::RaceLost | Transition::Unchanged => report.race_lost += 1,
        }
        Ok(())
    }
}
