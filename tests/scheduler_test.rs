mod common;

use autostop::api::PaperGateway;
use autostop::execution::RetryPolicy;
use autostop::scheduler::{Scheduler, SchedulerConfig};
use autostop::store::PositionStore;
use autostop::{Outcome, PositionStatus, Side, StrategyParams, Timeframe};
use common::*;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

const TF: Timeframe = Timeframe::M15;

fn config(max_concurrency: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_concurrency,
        settle_delay: Duration::from_secs(10),
    }
}

fn source(symbols: &[&str], timeframe: Timeframe) -> ScriptedSource {
    symbols.iter().fold(ScriptedSource::new(), |source, symbol| {
        source.with_series(symbol, trending_candles(timeframe, 120, 100.0, 1.0))
    })
}

#[tokio::test]
async fn test_overlapping_tick_skips_in_flight_position() {
    let gateway = Arc::new(BlockingGateway::new());
    let h = harness(Arc::new(source(&["BTC/USDT:USDT"], TF)), gateway.clone());
    let scheduler = Scheduler::new(h.evaluator.clone(), config(4));
    let pos = h.create(new_position("BTC/USDT:USDT", Side::Long, TF)).await;
    let now = after_bars(TF, 60);

    let first = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run_cohort(TF, now).await })
    };
    gateway.entered.notified().await;
    assert!(scheduler.flights().is_in_flight(pos.id));

    let second = assert_ok!(scheduler.run_cohort(TF, now).await);
    assert_eq!(second.count(Outcome::SkippedOverlap), 1);
    assert_eq!(second.total(), 1);

    let manual = assert_ok!(scheduler.check_at(pos.id, now).await);
    assert_eq!(manual, Outcome::SkippedOverlap);

    gateway.release.notify_one();
    let first = assert_ok!(first.await.unwrap());
    assert_eq!(first.count(Outcome::Applied), 1);

    assert_eq!(gateway.calls(), 1);
    assert!(!scheduler.flights().is_in_flight(pos.id));

    let outcomes: Vec<Outcome> = h
        .log
        .for_position(pos.id)
        .await
        .iter()
        .map(|e| e.outcome)
        .collect();
    assert_eq!(
        outcomes,
        vec![Outcome::SkippedOverlap, Outcome::SkippedOverlap, Outcome::Applied]
    );
}

#[tokio::test]
async fn test_one_failing_position_does_not_affect_siblings() {
    let source = Arc::new(source(&["BTC/USDT:USDT", "ETH/USDT:USDT"], TF));
    source.fail_symbol("ETH/USDT:USDT");
    let h = harness(source, Arc::new(PaperGateway::permissive()));
    let scheduler = Scheduler::new(h.evaluator.clone(), config(4));
    let btc = h.create(new_position("BTC/USDT:USDT", Side::Long, TF)).await;
    let eth = h.create(new_position("ETH/USDT:USDT", Side::Long, TF)).await;

    let report = assert_ok!(scheduler.run_cohort(TF, after_bars(TF, 60)).await);
    assert_eq!(report.count(Outcome::Applied), 1);
    assert_eq!(report.count(Outcome::Failed), 1);
    assert_eq!(report.errors, 0);

    assert!(h.read(btc.id).await.current_stop.is_some());
    assert_eq!(h.read(eth.id).await.current_stop, None);
}

#[tokio::test]
async fn test_cohorts_only_evaluate_their_timeframe() {
    let source = ScriptedSource::new()
        .with_series("BTC/USDT:USDT", trending_candles(TF, 120, 100.0, 1.0))
        .with_series("SOL/USDT:USDT", trending_candles(Timeframe::H1, 120, 100.0, 1.0));
    let h = harness(Arc::new(source), Arc::new(PaperGateway::permissive()));
    let scheduler = Scheduler::new(h.evaluator.clone(), config(4));
    let fast = h.create(new_position("BTC/USDT:USDT", Side::Long, TF)).await;
    let slow = h.create(new_position("SOL/USDT:USDT", Side::Long, Timeframe::H1)).await;

    let report = assert_ok!(scheduler.run_cohort(TF, after_bars(TF, 60)).await);
    assert_eq!(report.total(), 1);
    assert_eq!(report.timeframe, TF);

    assert!(h.read(fast.id).await.last_evaluated_bar.is_some());
    assert_eq!(h.read(slow.id).await.last_evaluated_bar, None);
    assert_eq!(scheduler.registry().members(TF).await, vec![fast.id]);
    assert!(scheduler.registry().members(Timeframe::H1).await.is_empty());
}

#[tokio::test]
async fn test_paused_positions_leave_the_cohort() {
    let h = harness(
        Arc::new(source(&["BTC/USDT:USDT", "ETH/USDT:USDT"], TF)),
        Arc::new(PaperGateway::permissive()),
    );
    let scheduler = Scheduler::new(h.evaluator.clone(), config(4));
    let btc = h.create(new_position("BTC/USDT:USDT", Side::Long, TF)).await;
    let eth = h.create(new_position("ETH/USDT:USDT", Side::Long, TF)).await;

    assert_ok!(scheduler.run_cohort(TF, after_bars(TF, 60)).await);
    assert_eq!(scheduler.registry().members(TF).await.len(), 2);

    h.store.set_status(eth.id, PositionStatus::Paused).await.unwrap();
    let report = assert_ok!(scheduler.run_cohort(TF, after_bars(TF, 61)).await);
    assert_eq!(report.total(), 1);
    assert_eq!(scheduler.registry().members(TF).await, vec![btc.id]);
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let symbols = ["A/USDT:USDT", "B/USDT:USDT", "C/USDT:USDT", "D/USDT:USDT", "E/USDT:USDT"];
    let gateway = Arc::new(CountingGateway::new());
    let h = harness(Arc::new(source(&symbols, TF)), gateway.clone());
    let scheduler = Scheduler::new(h.evaluator.clone(), config(2));
    for symbol in symbols {
        h.create(new_position(symbol, Side::Long, TF)).await;
    }

    let report = assert_ok!(scheduler.run_cohort(TF, after_bars(TF, 60)).await);
    assert_eq!(report.count(Outcome::Applied), 5);
    assert!(gateway.peak() <= 2);
    assert!(gateway.peak() >= 1);
}

#[tokio::test]
async fn test_check_now_evaluates_single_position() {
    let h = harness(
        Arc::new(source(&["BTC/USDT:USDT"], TF)),
        Arc::new(PaperGateway::permissive()),
    );
    let scheduler = Scheduler::new(h.evaluator.clone(), config(4));
    let pos = h.create(new_position("BTC/USDT:USDT", Side::Long, TF)).await;

    let outcome = assert_ok!(scheduler.check_at(pos.id, after_bars(TF, 60)).await);
    assert_eq!(outcome, Outcome::Applied);

    h.store.set_status(pos.id, PositionStatus::Paused).await.unwrap();
    let outcome = assert_ok!(scheduler.check_now(pos.id).await);
    assert_eq!(outcome, Outcome::SkippedInactive);
}

#[tokio::test]
async fn test_empty_cohort_reports_nothing() {
    let h = harness(Arc::new(ScriptedSource::new()), Arc::new(PaperGateway::permissive()));
    let scheduler = Scheduler::new(h.evaluator.clone(), config(4));

    let now = after_bars(Timeframe::H4, 10);
    let report = assert_ok!(scheduler.run_cohort(Timeframe::H4, now).await);
    assert_eq!(report.total(), 0);
}

#[tokio::test]
async fn test_shutdown_stops_cohort_loops() {
    let h = harness(Arc::new(ScriptedSource::new()), Arc::new(PaperGateway::permissive()));
    let scheduler = Scheduler::new(h.evaluator.clone(), config(4));

    let handle = scheduler.start(&Timeframe::ALL);
    let stopped = tokio::time::timeout(Duration::from_secs(5), handle.shutdown()).await;
    assert_ok!(stopped);
    assert_eq!(scheduler.flights().in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_in_flight_evaluation() {
    let gateway = Arc::new(BlockingGateway::new());
    let mut h = harness(Arc::new(source(&["BTC/USDT:USDT"], TF)), gateway.clone());
    // Parked calls must not time out while the clock is paused
    h.evaluator = h.evaluator.clone().with_retry(RetryPolicy {
        timeout: Duration::from_secs(3600),
        ..fast_retry()
    });
    let scheduler = Scheduler::new(h.evaluator.clone(), config(4));
    let pos = h.create(new_position("BTC/USDT:USDT", Side::Long, TF)).await;

    let handle = scheduler.start(&[TF]);
    // Paused time auto-advances to the first boundary
    gateway.entered.notified().await;
    assert!(scheduler.flights().is_in_flight(pos.id));

    let shutdown = tokio::spawn(handle.shutdown());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!shutdown.is_finished());
    assert_eq!(h.read(pos.id).await.current_stop, None);

    gateway.release.notify_one();
    let joined = tokio::time::timeout(Duration::from_secs(5), shutdown).await;
    assert_ok!(assert_ok!(joined));

    assert_eq!(gateway.calls(), 1);
    assert_eq!(scheduler.flights().in_flight(), 0);
    assert!(h.read(pos.id).await.current_stop.is_some());
    let log = h.log.for_position(pos.id).await;
    assert_eq!(log.last().map(|e| e.outcome), Some(Outcome::Applied));
}

#[tokio::test]
async fn test_closed_positions_leave_indicator_cache() {
    let h = harness(
        Arc::new(source(&["BTC/USDT:USDT", "ETH/USDT:USDT"], TF)),
        Arc::new(PaperGateway::permissive()),
    );
    let scheduler = Scheduler::new(h.evaluator.clone(), config(4));
    let btc = h.create(new_position("BTC/USDT:USDT", Side::Long, TF)).await;
    let eth = h.create(new_position("ETH/USDT:USDT", Side::Long, TF)).await;

    assert_ok!(scheduler.run_cohort(TF, after_bars(TF, 60)).await);
    assert_eq!(h.evaluator.cache().len(), 2);

    h.store.set_status(btc.id, PositionStatus::Paused).await.unwrap();
    h.store.set_status(eth.id, PositionStatus::Closed).await.unwrap();
    let report = assert_ok!(scheduler.run_cohort(TF, after_bars(TF, 61)).await);
    assert_eq!(report.total(), 0);

    // Paused keeps its state for resumption
    let cache = h.evaluator.cache();
    assert_eq!(cache.len(), 1);
    assert!(cache.get(btc.id, &StrategyParams::default()).unwrap().is_some());
    assert!(cache.get(eth.id, &StrategyParams::default()).unwrap().is_none());
}
