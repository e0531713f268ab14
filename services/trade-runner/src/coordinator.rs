//! Instrument coordinator - signal, risk and position steps for one instrument
//!
//! Consumes the pipeline events of an instrument's streams. A committed
//! prediction re-runs the cross-timeframe signal and may open a position;
//! a committed tactical bar drives stop-loss / take-profit monitoring.

use market_data::{InstrumentKey, TimeSeriesStore};
use signal_engine::{Roles, Signal, SignalGenerator, SignalReason};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::pipeline::PipelineEvent;
use crate::position::{MonitorOutcome, OpenOutcome, PositionManager};

pub struct InstrumentCoordinator {
    instrument: InstrumentKey,
    roles: Roles,
    store: Arc<dyn TimeSeriesStore>,
    signals: Arc<SignalGenerator>,
    positions: Arc<PositionManager>,
    clock: Arc<dyn Clock>,
    /// Entry bar of the last position opened, so one bar never funds two entries
    last_entry_bar: Option<Uuid>,
}

impl InstrumentCoordinator {
    pub fn new(
        instrument: InstrumentKey,
        roles: Roles,
        store: Arc<dyn TimeSeriesStore>,
        signals: Arc<SignalGenerator>,
        positions: Arc<PositionManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            instrument,
            roles,
            store,
            signals,
            positions,
            clock,
            last_entry_bar: None,
        }
    }

    pub fn roles(&self) -> &Roles {
        &self.roles
    }

    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<PipelineEvent>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        info!(
            "Coordinator for {} started (tactical {}, strategic {})",
            self.instrument, self.roles.tactical.interval, self.roles.strategic.interval
        );
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if let Err(e) = self.handle(event).await {
                error!("Coordinator for {} failed to handle event: {:#}", self.instrument, e);
            }
        }

        // No new entries once shutting down; pending bars still get their exit checks
        events.close();
        while let Some(event) = events.recv().await {
            if let PipelineEvent::BarCommitted { .. } = event {
                if let Err(e) = self.handle(event).await {
                    error!("Coordinator for {} failed during drain: {:#}", self.instrument, e);
                }
            }
        }
        info!("Coordinator for {} stopped", self.instrument);
        Ok(())
    }

    pub async fn handle(&mut self, event: PipelineEvent) -> anyhow::Result<()> {
        match event {
            PipelineEvent::BarCommitted { bar } => {
                if bar.timeframe_id != self.roles.tactical.id {
                    return Ok(());
                }
                match self.positions.monitor(&bar).await? {
                    MonitorOutcome::Closed { record, reason } => debug!(
                        "{} position {} closed on {:?}",
                        self.instrument, record.id, reason
                    ),
                    MonitorOutcome::Held { .. } | MonitorOutcome::NoPosition => {}
                }
            }
            PipelineEvent::PredictionCommitted { timeframe_id, .. } => {
                if timeframe_id != self.roles.tactical.id && timeframe_id != self.roles.strategic.id {
                    return Ok(());
                }
                let signal = self.evaluate().await?;
                self.act(&signal).await?;
            }
        }
        Ok(())
    }

    /// Fuse the latest committed predictions of both timeframes
    pub async fn evaluate(&self) -> anyhow::Result<Signal> {
        let tactical = self.store.latest_prediction(self.roles.tactical.id).await?;
        let strategic = self.store.latest_prediction(self.roles.strategic.id).await?;
        let signal = self.signals.evaluate(
            &self.instrument,
            (&self.roles.tactical, tactical.as_ref()),
            (&self.roles.strategic, strategic.as_ref()),
            self.clock.now(),
        );

        if signal.stale {
            warn!(
                "Stale predictions for {} (tactical {}, strategic {}); holding",
                self.instrument,
                prediction_age(&signal.tactical),
                prediction_age(&signal.strategic)
            );
        } else {
            debug!(
                "Signal for {}: {} ({:?}) long={:.3} short={:.3}",
                self.instrument, signal.kind, signal.reason, signal.long_score, signal.short_score
            );
        }
        Ok(signal)
    }

    /// Open a position for a trade signal. Returns `None` when nothing was attempted.
    pub async fn act(&mut self, signal: &Signal) -> anyhow::Result<Option<OpenOutcome>> {
        if !signal.kind.is_trade() || signal.reason == SignalReason::Stale {
            return Ok(None);
        }
        let Some(entry_bar_id) = signal.entry_bar_id() else {
            return Ok(None);
        };
        if self.last_entry_bar == Some(entry_bar_id) {
            return Ok(None);
        }
        let Some(entry_bar) = self.store.bar(entry_bar_id).await? else {
            warn!("Entry bar {} for {} not found", entry_bar_id, self.instrument);
            return Ok(None);
        };

        let outcome = self.positions.open(signal, &entry_bar).await?;
        if let OpenOutcome::Opened(_) = &outcome {
            self.last_entry_bar = Some(entry_bar_id);
        }
        Ok(Some(outcome))
    }
}

fn prediction_age(vote: &Option<signal_engine::TimeframeVote>) -> String {
    match vote {
        Some(v) => format!("{} @ {}", v.interval, v.prediction_time),
        None => "missing".to_string(),
    }
}
