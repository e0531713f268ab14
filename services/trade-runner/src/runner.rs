//! Runner - wires configured streams into pipeline tasks and supervises them

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use market_data::{MarketDataSource, TimeSeriesStore, Timeframe};
use signal_engine::{EnsembleScorer, IndicatorEngine, SignalGenerator};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::ApiState;
use crate::clock::Clock;
use crate::config::{PairConfig, PipelineConfig};
use crate::coordinator::InstrumentCoordinator;
use crate::pipeline::{Ingestor, StreamContext, StreamWorker};
use crate::position::PositionManager;
use crate::risk::RiskController;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const STREAM_CHANNEL_CAPACITY: usize = 16;
const PENDING_ANALYSIS_LIMIT: usize = 10_000;

pub struct Runner {
    config: Arc<PipelineConfig>,
    store: Arc<dyn TimeSeriesStore>,
    source: Arc<dyn MarketDataSource>,
    clock: Arc<dyn Clock>,
    risk: Arc<RiskController>,
    positions: Arc<PositionManager>,
    indicators: Arc<IndicatorEngine>,
    scorer: Arc<EnsembleScorer>,
    signals: Arc<SignalGenerator>,
}

impl Runner {
    pub fn new(
        config: Arc<PipelineConfig>,
        store: Arc<dyn TimeSeriesStore>,
        source: Arc<dyn MarketDataSource>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let scorer = EnsembleScorer::new(config.ensemble.clone()).context("building ensemble scorer")?;
        let risk = Arc::new(RiskController::new(config.risk));
        let positions = Arc::new(PositionManager::new(store.clone(), risk.clone(), config.fees));

        Ok(Self {
            indicators: Arc::new(IndicatorEngine::new(config.indicators)),
            scorer: Arc::new(scorer),
            signals: Arc::new(SignalGenerator::new(config.signal)),
            config,
            store,
            source,
            clock,
            risk,
            positions,
        })
    }

    /// Replace the built-in scorers
    pub fn with_scorer(mut self, scorer: EnsembleScorer) -> Self {
        self.scorer = Arc::new(scorer);
        self
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            risk: self.risk.clone(),
            positions: self.positions.clone(),
            source: self.source.clone(),
        }
    }

    pub fn positions(&self) -> &Arc<PositionManager> {
        &self.positions
    }

    pub fn risk(&self) -> &Arc<RiskController> {
        &self.risk
    }

    /// Run every configured stream until `shutdown` fires and all tasks have drained
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.positions.restore().await?;

        let ctx = StreamContext {
            store: self.store.clone(),
            indicators: self.indicators.clone(),
            scorer: self.scorer.clone(),
            permits: Arc::new(Semaphore::new(self.config.runtime.max_concurrent_streams)),
        };
        let mut tasks = JoinSet::new();

        for pair in &self.config.data.pairs {
            self.spawn_pair(pair, &ctx, &shutdown, &mut tasks).await?;
        }
        info!(
            "Pipeline running: {} pairs, {} tasks",
            self.config.data.pairs.len(),
            tasks.len()
        );

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Pipeline task failed: {:#}", e),
                Err(e) => error!("Pipeline task panicked or was aborted: {}", e),
            }
        }
        info!("Pipeline stopped");
        Ok(())
    }

    async fn spawn_pair(
        &self,
        pair: &PairConfig,
        ctx: &StreamContext,
        shutdown: &CancellationToken,
        tasks: &mut JoinSet<anyhow::Result<()>>,
    ) -> anyhow::Result<()> {
        let instrument = pair.instrument();
        let mut timeframes: Vec<Timeframe> = Vec::new();
        for tf in pair.timeframes.iter().filter(|tf| tf.enabled) {
            let timeframe = self
                .store
                .find_or_create_timeframe(&instrument, tf.interval, tf.weight)
                .await?;
            if (timeframe.weight - tf.weight).abs() > f64::EPSILON {
                warn!(
                    "{} stored weight {} differs from configured {}; using stored",
                    timeframe.label(),
                    timeframe.weight,
                    tf.weight
                );
            }
            self.indicators
                .analyze_pending(self.store.as_ref(), timeframe.id, PENDING_ANALYSIS_LIMIT)
                .await?;
            timeframes.push(timeframe);
        }

        let roles = SignalGenerator::assign_roles(&timeframes)
            .with_context(|| format!("{} needs two enabled timeframes", instrument))?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let coordinator = InstrumentCoordinator::new(
            instrument,
            roles,
            self.store.clone(),
            self.signals.clone(),
            self.positions.clone(),
            self.clock.clone(),
        );
        tasks.spawn(coordinator.run(event_rx, shutdown.clone()));

        let lookback = Duration::days(i64::from(self.config.data.lookback_days));
        let poll_interval = std::time::Duration::from_secs(self.config.runtime.poll_interval_secs);
        for timeframe in timeframes {
            let latest: Option<DateTime<Utc>> = self
                .store
                .latest_bar(timeframe.id)
                .await?
                .map(|bar| bar.open_time);
            let (stream_tx, stream_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

            let worker = StreamWorker::new(
                timeframe.clone(),
                ctx.clone(),
                self.config.runtime.reorder_capacity,
                latest,
                event_tx.clone(),
            );
            let ingestor = Ingestor::new(
                timeframe,
                self.source.clone(),
                self.clock.clone(),
                latest,
                lookback,
                poll_interval,
                stream_tx,
            );
            tasks.spawn(worker.run(stream_rx, shutdown.clone()));
            tasks.spawn(ingestor.run(shutdown.clone()));
        }
        Ok(())
    }
}
