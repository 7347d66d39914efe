//! End-to-end ledger scenarios against a file-backed store.

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use republic_ledger::buckets::{
    BalanceSource, BucketRegistry, CAPITAL_INJECTION, OPERATIONS, TAX_RESERVE, TRADING_RESERVE,
};
use republic_ledger::config::LedgerConfig;
use republic_ledger::consumer::ExecutionConsumer;
use republic_ledger::oracle::StaticPriceOracle;
use republic_ledger::queue::{Action, NewTrade, PriceSource, TradeQueue, TradeStatus};
use republic_ledger::reliability::retry::RetryConfig;
use republic_ledger::storage::LedgerStore;
use republic_ledger::waterfall::Waterfall;

fn open(dir: &tempfile::TempDir) -> LedgerStore {
    let path = dir.path().join("ledger.sqlite");
    LedgerStore::open(
        path.to_str().unwrap(),
        RetryConfig::immediate(3),
        Duration::from_millis(100),
    )
    .unwrap()
}

fn test_config() -> LedgerConfig {
    let mut cfg = LedgerConfig::default();
    cfg.oracle_backoff_ms = 0;
    cfg.cost_basis.insert("SOL".into(), dec!(100));
    cfg.cost_basis.insert("FET".into(), dec!(1));
    cfg
}

fn approved(store: &LedgerStore, asset: &str, action: Action, qty: Decimal) -> i64 {
    let q = TradeQueue::new(store);
    let id = q
        .enqueue(&NewTrade {
            asset: asset.into(),
            action,
            quantity: qty,
            reason: "strategist".into(),
            initial_status: TradeStatus::New,
        })
        .unwrap();
    q.approve(id).unwrap();
    id
}

#[tokio::test]
async fn sol_sell_flows_through_waterfall_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let cfg = test_config();
    let buckets = BucketRegistry::new(&store);
    buckets.seed_defaults().unwrap();
    for b in buckets.list().unwrap() {
        assert_eq!(b.balance, Decimal::ZERO);
    }

    let id = approved(&store, "SOL", Action::Sell, dec!(10));
    let oracle = StaticPriceOracle::new().with_price("SOL", Some(dec!(150)));
    let report = ExecutionConsumer::new(&store, &oracle, &cfg)
        .process_queue()
        .await
        .unwrap();
    assert_eq!(report.done, 1);
    assert_eq!(report.fallback, 0);

    let trade = TradeQueue::new(&store).get(id).unwrap();
    assert_eq!(trade.status, TradeStatus::Done);
    assert_eq!(trade.price, Some(dec!(150)));
    assert_eq!(trade.price_source, Some(PriceSource::Oracle));

    let wf = Waterfall::new(&store, &cfg);
    let first = wf.run().unwrap();
    assert_eq!(first.allocated, 1);
    assert_eq!(first.total_gain, dec!(500));

    let alloc = wf.allocation_for(id).unwrap().unwrap();
    assert_eq!(alloc.gain, dec!(500));
    assert_eq!(
        (alloc.tax_amt, alloc.ops_amt, alloc.reinvest_amt),
        (dec!(150), dec!(250), dec!(100))
    );
    assert_eq!(buckets.get_balance(TAX_RESERVE).unwrap(), dec!(150));
    assert_eq!(buckets.get_balance(OPERATIONS).unwrap(), dec!(250));
    assert_eq!(buckets.get_balance(TRADING_RESERVE).unwrap(), dec!(100));
    assert_eq!(buckets.get_balance(CAPITAL_INJECTION).unwrap(), Decimal::ZERO);

    let second = wf.run().unwrap();
    assert_eq!(second.allocated, 0);
    assert_eq!(second.already_allocated, 1);
    assert_eq!(wf.list_allocations().unwrap().len(), 1);
    assert_eq!(buckets.get_balance(TAX_RESERVE).unwrap(), dec!(150));
    assert_eq!(buckets.get_balance(OPERATIONS).unwrap(), dec!(250));
    assert_eq!(buckets.get_balance(TRADING_RESERVE).unwrap(), dec!(100));
}

#[tokio::test]
async fn missing_fet_price_uses_fallback_and_still_completes() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let cfg = test_config();
    BucketRegistry::new(&store).seed_defaults().unwrap();

    let id = approved(&store, "FET", Action::Buy, dec!(4));
    let oracle = StaticPriceOracle::new().with_price("FET", None);
    let report = ExecutionConsumer::new(&store, &oracle, &cfg)
        .process_queue()
        .await
        .unwrap();
    assert_eq!(report.done, 1);
    assert_eq!(report.fallback, 1);
    assert_eq!(oracle.calls(), cfg.oracle_attempts as u64);

    let trade = TradeQueue::new(&store).get(id).unwrap();
    assert_eq!(trade.status, TradeStatus::Done);
    assert_eq!(trade.price, Some(dec!(1.5)));
    assert!(trade.executed_with_fallback());
}

#[tokio::test]
async fn balance_deltas_match_allocations() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let cfg = test_config();
    let buckets = BucketRegistry::new(&store);
    buckets.seed_defaults().unwrap();
    for name in [TAX_RESERVE, OPERATIONS, TRADING_RESERVE] {
        buckets.admin_adjust(name, dec!(1000), false, "prefund").unwrap();
    }

    approved(&store, "SOL", Action::Sell, dec!(3));
    approved(&store, "SOL", Action::Sell, dec!(1.5));
    approved(&store, "SOL", Action::Buy, dec!(2.25));

    let oracle = StaticPriceOracle::new().with_price("SOL", Some(dec!(117.37)));
    ExecutionConsumer::new(&store, &oracle, &cfg)
        .process_queue()
        .await
        .unwrap();
    let wf = Waterfall::new(&store, &cfg);
    let report = wf.run().unwrap();
    assert_eq!(report.allocated, 3);

    let allocations = wf.list_allocations().unwrap();
    let mut allocated_total = Decimal::ZERO;
    for a in &allocations {
        assert_eq!(a.total(), a.gain);
        allocated_total += a.total();
    }
    // 17.37 * 3 + 17.37 * 1.5 - 17.37 * 2.25
    assert_eq!(allocated_total, dec!(39.0825));
    let waterfall_deltas = buckets.journal_sum(Some(BalanceSource::Waterfall)).unwrap();
    assert_eq!(waterfall_deltas, allocated_total);

    let admin_deltas = buckets.journal_sum(Some(BalanceSource::Admin)).unwrap();
    assert_eq!(buckets.total_balance().unwrap(), admin_deltas + allocated_total);
}

#[tokio::test]
async fn terminal_trades_are_left_alone() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let cfg = test_config();
    let q = TradeQueue::new(&store);

    let done = approved(&store, "SOL", Action::Sell, dec!(1));
    let rejected = q
        .enqueue(&NewTrade {
            asset: "SOL".into(),
            action: Action::Buy,
            quantity: dec!(1),
            reason: "risk_engine".into(),
            initial_status: TradeStatus::Pending,
        })
        .unwrap();
    q.reject(rejected, "exposure cap").unwrap();

    let oracle = StaticPriceOracle::new().with_price("SOL", Some(dec!(120)));
    let consumer = ExecutionConsumer::new(&store, &oracle, &cfg);
    consumer.process_queue().await.unwrap();
    consumer.process_queue().await.unwrap();

    assert_eq!(q.get(done).unwrap().status, TradeStatus::Done);
    assert_eq!(q.get(done).unwrap().price, Some(dec!(120)));
    let r = q.get(rejected).unwrap();
    assert_eq!(r.status, TradeStatus::Rejected);
    assert_eq!(r.note.as_deref(), Some("exposure cap"));
    assert!(q.approve(done).is_err());
    assert!(q.approve(rejected).is_err());
}

#[test]
fn reseeding_after_reopen_keeps_balances() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open(&dir);
        let buckets = BucketRegistry::new(&store);
        buckets.seed_defaults().unwrap();
        buckets
            .admin_adjust(CAPITAL_INJECTION, dec!(2500), false, "deposit")
            .unwrap();
    }
    let store = open(&dir);
    let buckets = BucketRegistry::new(&store);
    assert_eq!(buckets.seed_defaults().unwrap(), 0);
    assert_eq!(buckets.list().unwrap().len(), 4);
    assert_eq!(buckets.get_balance(CAPITAL_INJECTION).unwrap(), dec!(2500));
}
