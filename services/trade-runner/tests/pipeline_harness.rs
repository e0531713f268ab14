//! End-to-end pipeline harness
//!
//! Validates the full loop against a scripted source and the in-memory store:
//! backfill → analyze → score → signal → risk → open → monitor → close


use chrono::Duration;
use market_data::{InMemoryStore, PositionRecord, PositionStatus, TimeSeriesStore};
use rust_decimal::Decimal;
use mock_source::{epoch, fixed_ensemble, test_config, ScriptedSource};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use trade_runner::{Clock, ManualClock, PositionSlot, RiskDecision, RiskVeto, Runner};

const WAIT: std::time::Duration = std::time::Duration::from_secs(20);

struct Harness {
    store: Arc<InMemoryStore>,
    source: Arc<ScriptedSource>,
    clock: Arc<ManualClock>,
    runner: Arc<Runner>,
}

impl Harness {
    fn new(store: Arc<InMemoryStore>, score: f64) -> Self {
        let source = Arc::new(ScriptedSource::new());
        let clock = Arc::new(ManualClock::new(epoch() + Duration::days(3)));
        let runner = Runner::new(
            Arc::new(test_config()),
            store.clone(),
            source.clone(),
            clock.clone(),
        )
        .unwrap()
        .with_scorer(fixed_ensemble(score));
        Self {
            store,
            source,
            clock,
            runner: Arc::new(runner),
        }
    }

    fn start(&self, shutdown: &CancellationToken) -> JoinHandle<anyhow::Result<()>> {
        let runner = self.runner.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { runner.run(shutdown).await })
    }
}

/// Store an already-closed trade on another instrument, exiting `minutes` after `template`'s entry
async fn seed_closed(store: &InMemoryStore, template: &PositionRecord, pnl: i64, minutes: i64) {
    let mut position = template.clone();
    position.id = uuid::Uuid::new_v4();
    position.symbol = "ETHUSDT".to_string();
    store.insert_open_position(&position).await.unwrap();

    position.exit_price = Some(position.entry_price);
    position.exit_time = Some(position.entry_time + Duration::minutes(minutes));
    position.fees = Some(Decimal::ZERO);
    position.pnl = Some(Decimal::from(pnl));
    position.status = PositionStatus::Closed;
    store.close_position(&position).await.unwrap();
}

/// Poll `check` until it holds or the wait runs out
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_backfill_opens_on_fresh_agreement() {
    let harness = Harness::new(Arc::new(InMemoryStore::new()), 0.8);
    let shutdown = CancellationToken::new();
    let handle = harness.start(&shutdown);

    let runner = harness.runner.clone();
    assert!(
        eventually(|| {
            let runner = runner.clone();
            async move { !runner.positions().open_positions().await.is_empty() }
        })
        .await,
        "no position opened"
    );

    shutdown.cancel();
    handle.await.unwrap().unwrap();

    // 3 days of 15m and 1h bars
    assert_eq!(harness.store.bar_count().await, 288 + 72);
    let open = harness.store.open_positions().await.unwrap();
    assert_eq!(open.len(), 1);
    let position = &open[0];
    assert_eq!(position.status, PositionStatus::Open);
    assert!(position.stop_loss.unwrap() < position.entry_price);
    assert!(position.take_profit.unwrap() > position.entry_price);

    // Entry is the most recent tactical bar, analyzed and scored
    let entry_bar = harness.store.bar(position.market_data_id).await.unwrap().unwrap();
    assert!(entry_bar.usable_by_model);
    assert_eq!(position.entry_time, entry_bar.close_time);
    assert_eq!(entry_bar.open_time, epoch() + Duration::days(3) - Duration::minutes(15));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_crash_bar_stops_out_position() {
    let harness = Harness::new(Arc::new(InMemoryStore::new()), 0.8);
    let shutdown = CancellationToken::new();
    let handle = harness.start(&shutdown);

    let runner = harness.runner.clone();
    assert!(
        eventually(|| {
            let runner = runner.clone();
            async move { !runner.positions().open_positions().await.is_empty() }
        })
        .await
    );
    let opened = harness.runner.positions().open_positions().await[0].clone();

    harness.source.crash_from(harness.clock.now());
    harness.clock.advance(Duration::minutes(15));

    let store = harness.store.clone();
    let instrument = opened.instrument();
    assert!(
        eventually(|| {
            let store = store.clone();
            let instrument = instrument.clone();
            let id = opened.id;
            async move {
                store
                    .positions(&instrument)
                    .await
                    .unwrap()
                    .iter()
                    .any(|p| p.id == id && !p.is_open())
            }
        })
        .await,
        "position was not closed"
    );
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    let closed = harness
        .store
        .positions(&instrument)
        .await
        .unwrap()
        .into_iter()
        .find(|p| p.id == opened.id)
        .unwrap();
    assert_eq!(closed.status, PositionStatus::Closed);
    assert_eq!(closed.exit_price, opened.stop_loss);
    assert_eq!(
        closed.pnl.unwrap(),
        (opened.stop_loss.unwrap() - opened.entry_price) * opened.size
    );
    assert!(closed.exit_time.unwrap() > opened.entry_time);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_halt_blocks_entries() {
    let harness = Harness::new(Arc::new(InMemoryStore::new()), 0.8);
    harness.runner.risk().halt("maintenance").await;
    let shutdown = CancellationToken::new();
    let handle = harness.start(&shutdown);

    let store = harness.store.clone();
    assert!(
        eventually(|| {
            let store = store.clone();
            async move { store.prediction_count().await >= 2 && store.bar_count().await == 288 + 72 }
        })
        .await
    );
    // Let the coordinator see the last predictions
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    assert!(harness.store.open_positions().await.unwrap().is_empty());
    assert!(harness.runner.positions().open_positions().await.is_empty());

    let risk = harness.runner.risk();
    let portfolio = risk.lock_portfolio().await;
    let decision = risk
        .evaluate(
            &portfolio,
            &test_config().data.pairs[0].instrument(),
            rust_decimal::Decimal::ONE,
            rust_decimal::Decimal::ONE,
        )
        .await;
    assert!(matches!(
        decision,
        RiskDecision::Vetoed(RiskVeto::EmergencyHalt { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_neutral_scores_never_trade() {
    let harness = Harness::new(Arc::new(InMemoryStore::new()), 0.0);
    let shutdown = CancellationToken::new();
    let handle = harness.start(&shutdown);

    let store = harness.store.clone();
    assert!(
        eventually(|| {
            let store = store.clone();
            async move { store.bar_count().await == 288 + 72 && store.prediction_count().await > 0 }
        })
        .await
    );
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    assert!(harness.store.open_positions().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_restores_open_position_without_refetching() {
    let store = Arc::new(InMemoryStore::new());
    let first = Harness::new(store.clone(), 0.8);
    let shutdown = CancellationToken::new();
    let handle = first.start(&shutdown);
    let runner = first.runner.clone();
    assert!(
        eventually(|| {
            let runner = runner.clone();
            async move { !runner.positions().open_positions().await.is_empty() }
        })
        .await
    );
    shutdown.cancel();
    handle.await.unwrap().unwrap();
    let opened = store.open_positions().await.unwrap()[0].clone();
    let bars = store.bar_count().await;
    let starting_equity = first.runner.risk().portfolio().read().await.snapshot().starting_equity;

    // Earlier session: a win then a larger loss, so the equity peak sits above today's equity
    seed_closed(&store, &opened, -2000, 20).await;
    seed_closed(&store, &opened, 500, 10).await;

    let second = Harness::new(store.clone(), 0.8);
    let shutdown = CancellationToken::new();
    let handle = second.start(&shutdown);
    let runner = second.runner.clone();
    let instrument = opened.instrument();
    assert!(
        eventually(|| {
            let runner = runner.clone();
            let instrument = instrument.clone();
            async move { runner.positions().state(&instrument).await.is_open() }
        })
        .await
    );
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    let PositionSlot::Open(restored) = second.runner.positions().state(&instrument).await else {
        panic!("expected restored open slot");
    };
    assert_eq!(restored.record.id, opened.id);
    assert_eq!(store.bar_count().await, bars);
    assert_eq!(store.open_positions().await.unwrap().len(), 1);

    let snapshot = second.runner.risk().portfolio().read().await.snapshot();
    assert_eq!(snapshot.realized_pnl, Decimal::from(-1500));
    assert_eq!(snapshot.peak_equity, starting_equity + Decimal::from(500));
    assert!(snapshot.equity < starting_equity);
    assert!(snapshot.drawdown_pct > Decimal::from(15), "{:?}", snapshot);
}
