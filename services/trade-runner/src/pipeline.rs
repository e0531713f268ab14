//! Per-stream pipeline tasks
//!
//! One `Ingestor` and one `StreamWorker` run for every (symbol, contract,
//! interval) stream. The ingestor pulls closed bars from the source and the
//! worker takes them through reorder, insert, analyze and score, emitting
//! events for the instrument's coordinator.

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use market_data::{
    Admission, Bar, InsertOutcome, InstrumentKey, Interval, MarketDataSource, PredictionWrite,
    ReorderBuffer, Timeframe, TimeSeriesStore,
};
use signal_engine::{AnalyzeOutcome, EnsembleScorer, IndicatorEngine};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;

/// Emitted by stream workers after a durable write
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A new bar was stored (and analyzed if history allowed)
    BarCommitted { bar: Bar },
    /// A prediction for a bar was stored and the bar marked usable by model
    PredictionCommitted {
        instrument: InstrumentKey,
        timeframe_id: Uuid,
        bar_id: Uuid,
        prediction_time: DateTime<Utc>,
    },
}

/// Ingestor to worker messages
#[derive(Debug)]
pub enum StreamMessage {
    Bars(Vec<Bar>),
    /// The source delivered everything opening before this time
    Flush(DateTime<Utc>),
}

/// What happened to one bar inside the worker
#[derive(Debug, Clone, PartialEq)]
pub enum BarOutcome {
    Rejected(String),
    Duplicate,
    /// Stored, but indicators could not be completed yet
    Pending,
    Scored(PredictionWrite),
    /// Stored and analyzed; scoring failed closed
    ScoringFailed,
}

/// Shared collaborators of all stream workers
#[derive(Clone)]
pub struct StreamContext {
    pub store: Arc<dyn TimeSeriesStore>,
    pub indicators: Arc<IndicatorEngine>,
    pub scorer: Arc<EnsembleScorer>,
    /// Bounds how many streams process a bar at the same time
    pub permits: Arc<Semaphore>,
}

pub struct StreamWorker {
    timeframe: Timeframe,
    ctx: StreamContext,
    buffer: ReorderBuffer,
    events: mpsc::Sender<PipelineEvent>,
}

impl StreamWorker {
    pub fn new(
        timeframe: Timeframe,
        ctx: StreamContext,
        reorder_capacity: usize,
        watermark: Option<DateTime<Utc>>,
        events: mpsc::Sender<PipelineEvent>,
    ) -> Self {
        let buffer = ReorderBuffer::new(timeframe.interval, reorder_capacity).resume_from(watermark);
        Self {
            timeframe,
            ctx,
            buffer,
            events,
        }
    }

    pub async fn run(
        mut self,
        mut inbox: mpsc::Receiver<StreamMessage>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        info!("Stream worker started for {}", self.timeframe.label());
        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                message = inbox.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let ready = match message {
                StreamMessage::Bars(bars) => {
                    for bar in bars {
                        if self.buffer.push(bar) == Admission::Duplicate {
                            debug!("Duplicate delivery buffered for {}", self.timeframe.label());
                        }
                    }
                    self.buffer.drain_ready()
                }
                StreamMessage::Flush(cutoff) => self.buffer.flush_through(cutoff),
            };

            for bar in ready {
                // Finish the current bar, then stop between bars
                if shutdown.is_cancelled() {
                    break;
                }
                if let Err(e) = self.process(bar).await {
                    warn!("Failed to process bar for {}: {:#}", self.timeframe.label(), e);
                }
            }
        }
        info!("Stream worker stopped for {}", self.timeframe.label());
        Ok(())
    }

    /// Take one released bar through validate, insert, analyze and score
    pub async fn process(&self, mut bar: Bar) -> anyhow::Result<BarOutcome> {
        let _permit = self
            .ctx
            .permits
            .acquire()
            .await
            .context("stream permits closed")?;
        let store = self.ctx.store.as_ref();

        if let Err(e) = bar.validate() {
            warn!("Rejected bar: {}", e);
            return Ok(BarOutcome::Rejected(e.to_string()));
        }

        if store.insert_bar(&bar).await? == InsertOutcome::Duplicate {
            debug!("Bar {} at {} already stored", bar.label(), bar.open_time);
            return Ok(BarOutcome::Duplicate);
        }

        let analyzed = match self.ctx.indicators.analyze(store, &bar).await? {
            AnalyzeOutcome::Analyzed(set) | AnalyzeOutcome::AlreadyAnalyzed(set) => {
                bar.indicators = set;
                bar.analyzed = true;
                true
            }
            AnalyzeOutcome::InsufficientHistory { .. } => false,
        };
        self.emit(PipelineEvent::BarCommitted { bar: bar.clone() }).await;
        if !analyzed {
            return Ok(BarOutcome::Pending);
        }

        let (prediction, write) = match self.ctx.scorer.commit(store, &bar).await {
            Ok(committed) => committed,
            Err(signal_engine::EnsembleError::Store(e)) => return Err(e.into()),
            Err(_) => return Ok(BarOutcome::ScoringFailed),
        };
        if write != PredictionWrite::Unchanged {
            self.emit(PipelineEvent::PredictionCommitted {
                instrument: bar.instrument(),
                timeframe_id: prediction.timeframe_id,
                bar_id: bar.id,
                prediction_time: prediction.prediction_time,
            })
            .await;
        }
        Ok(BarOutcome::Scored(write))
    }

    async fn emit(&self, event: PipelineEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Coordinator gone; dropping event for {}", self.timeframe.label());
        }
    }
}

/// Open time of the interval containing `t`
pub fn align_down(t: DateTime<Utc>, interval: Interval) -> DateTime<Utc> {
    let step = interval.duration().num_milliseconds().max(1);
    let millis = t.timestamp_millis().div_euclid(step) * step;
    DateTime::from_timestamp_millis(millis).unwrap_or(t)
}

/// Pulls closed bars for one stream: backfill first, then polling
pub struct Ingestor {
    timeframe: Timeframe,
    source: Arc<dyn MarketDataSource>,
    clock: Arc<dyn Clock>,
    poll_interval: std::time::Duration,
    cursor: DateTime<Utc>,
    outbox: mpsc::Sender<StreamMessage>,
}

impl Ingestor {
    /// Resume after the latest stored bar, or backfill `lookback` when the stream is empty
    pub fn new(
        timeframe: Timeframe,
        source: Arc<dyn MarketDataSource>,
        clock: Arc<dyn Clock>,
        latest_stored: Option<DateTime<Utc>>,
        lookback: Duration,
        poll_interval: std::time::Duration,
        outbox: mpsc::Sender<StreamMessage>,
    ) -> Self {
        let cursor = match latest_stored {
            Some(open_time) => open_time + timeframe.interval.duration(),
            None => align_down(clock.now() - lookback, timeframe.interval),
        };
        Self {
            timeframe,
            source,
            clock,
            poll_interval,
            cursor,
            outbox,
        }
    }

    /// Next open_time this ingestor will request
    pub fn cursor(&self) -> DateTime<Utc> {
        self.cursor
    }

    /// Fetch every closed bar after the cursor and hand it to the worker.
    /// Returns false once the worker is gone.
    pub async fn poll_once(&mut self) -> bool {
        // The bar containing `now` is still forming
        let end = align_down(self.clock.now(), self.timeframe.interval);
        if self.cursor >= end {
            return true;
        }

        match self.source.fetch_bars(&self.timeframe, self.cursor, end).await {
            Ok(bars) => {
                if !bars.is_empty() {
                    debug!(
                        "Fetched {} bars for {} from {}",
                        bars.len(),
                        self.timeframe.label(),
                        self.source.name()
                    );
                }
                if self.outbox.send(StreamMessage::Bars(bars)).await.is_err()
                    || self.outbox.send(StreamMessage::Flush(end)).await.is_err()
                {
                    return false;
                }
                self.cursor = end;
            }
            Err(e) => {
                warn!(
                    "Fetch failed for {} from {}: {}",
                    self.timeframe.label(),
                    self.source.name(),
                    e
                );
            }
        }
        true
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(
            "Ingesting {} from {} starting at {}",
            self.timeframe.label(),
            self.source.name(),
            self.cursor
        );
        loop {
            if !self.poll_once().await {
                break;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        info!("Ingestor stopped for {}", self.timeframe.label());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use market_data::{ContractType, InMemoryStore};
    use rust_decimal::Decimal;
    use signal_engine::EnsembleConfig;

    fn timeframe() -> Timeframe {
        Timeframe::new(
            &InstrumentKey::new("BTCUSDT", ContractType::Perpetual),
            Interval::MINUTES_15,
            0.4,
        )
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap()
    }

    fn bar(tf: &Timeframe, index: i32) -> Bar {
        let close = Decimal::from(100 + index % 7);
        Bar::new(
            tf,
            t0() + Duration::minutes(15) * index,
            close,
            close + Decimal::ONE,
            close - Decimal::ONE,
            close,
            Decimal::from(50 + index % 5),
            10,
        )
    }

    fn worker(store: Arc<InMemoryStore>, tf: &Timeframe) -> (StreamWorker, mpsc::Receiver<PipelineEvent>) {
        let ctx = StreamContext {
            store,
            indicators: Arc::new(IndicatorEngine::default()),
            scorer: Arc::new(EnsembleScorer::new(EnsembleConfig::default()).unwrap()),
            permits: Arc::new(Semaphore::new(2)),
        };
        let (tx, rx) = mpsc::channel(1024);
        (StreamWorker::new(tf.clone(), ctx, 8, None, tx), rx)
    }

    #[test]
    fn test_align_down() {
        let t = t0() + Duration::minutes(37) + Duration::seconds(12);
        assert_eq!(align_down(t, Interval::MINUTES_15), t0() + Duration::minutes(30));
        assert_eq!(align_down(t, Interval::HOUR_1), t0());
    }

    #[tokio::test]
    async fn test_invalid_bar_rejected_before_insert() {
        let store = Arc::new(InMemoryStore::new());
        let tf = timeframe();
        let (worker, _events) = worker(store.clone(), &tf);

        let mut broken = bar(&tf, 0);
        broken.high = broken.low - Decimal::ONE;
        assert!(matches!(worker.process(broken).await.unwrap(), BarOutcome::Rejected(_)));
        assert_eq!(store.bar_count().await, 0);
    }

    #[tokio::test]
    async fn test_short_history_is_stored_but_not_scored() {
        let store = Arc::new(InMemoryStore::new());
        let tf = timeframe();
        let (worker, mut events) = worker(store.clone(), &tf);

        assert_eq!(worker.process(bar(&tf, 0)).await.unwrap(), BarOutcome::Pending);
        assert_eq!(worker.process(bar(&tf, 0)).await.unwrap(), BarOutcome::Duplicate);
        assert_eq!(store.bar_count().await, 1);
        assert_eq!(store.prediction_count().await, 0);
        assert!(matches!(events.try_recv(), Ok(PipelineEvent::BarCommitted { .. })));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_history_scores_and_emits_prediction() {
        let store = Arc::new(InMemoryStore::new());
        let tf = timeframe();
        let (worker, mut events) = worker(store.clone(), &tf);

        let mut last = BarOutcome::Pending;
        for i in 0..120 {
            last = worker.process(bar(&tf, i)).await.unwrap();
        }
        assert_eq!(last, BarOutcome::Scored(PredictionWrite::Inserted));
        assert!(store.prediction_count().await > 0);

        let mut predictions = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, PipelineEvent::PredictionCommitted { .. }) {
                predictions += 1;
            }
        }
        assert_eq!(predictions, store.prediction_count().await);
    }

    #[tokio::test]
    async fn test_worker_reorders_deliveries() {
        let store = Arc::new(InMemoryStore::new());
        let tf = timeframe();
        let (worker, mut events) = worker(store.clone(), &tf);
        let (tx, rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.run(rx, shutdown.clone()));

        tx.send(StreamMessage::Bars(vec![bar(&tf, 2), bar(&tf, 0), bar(&tf, 1)]))
            .await
            .unwrap();
        tx.send(StreamMessage::Flush(t0() + Duration::hours(1))).await.unwrap();
        drop(tx);
        handle.await.unwrap().unwrap();

        let mut opens = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let PipelineEvent::BarCommitted { bar } = event {
                opens.push(bar.open_time);
            }
        }
        assert_eq!(
            opens,
            vec![t0(), t0() + Duration::minutes(15), t0() + Duration::minutes(30)]
        );
    }
}
