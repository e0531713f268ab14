//! Cross-timeframe signal fusion
//!
//! Combines the latest committed prediction of a tactical and a strategic
//! timeframe into one long/short/hold decision using a weighted vote.

use chrono::{DateTime, Utc};
use market_data::{InstrumentKey, Interval, ModelPrediction, Timeframe};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Long,
    Short,
    Hold,
}

impl SignalKind {
    pub fn is_trade(&self) -> bool {
        !matches!(self, SignalKind::Hold)
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalKind::Long => "long",
            SignalKind::Short => "short",
            SignalKind::Hold => "hold",
        };
        f.write_str(s)
    }
}

/// Why the generator decided what it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalReason {
    /// Both timeframes point the same way with enough combined confidence
    Agreement,
    /// Strategic timeframe is strong enough while the tactical one is neutral
    StrategicConviction,
    Disagreement,
    /// Equal weighted long and short scores
    Tie,
    LowConfidence,
    Unconfirmed,
    /// A prediction is missing or older than the freshness bound
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Tactical,
    Strategic,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalConfig {
    /// |ensemble| at or below this is neutral
    #[serde(default = "default_neutral_band")]
    pub neutral_band: f64,
    /// Strategic confidence must exceed this to trade without a tactical direction
    #[serde(default = "default_strong_confidence_threshold")]
    pub strong_confidence_threshold: f64,
    /// Minimum weighted confidence for an agreeing vote to trade
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Prediction age limit, in intervals of its own timeframe
    #[serde(default = "default_freshness_intervals")]
    pub freshness_intervals: u32,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            neutral_band: default_neutral_band(),
            strong_confidence_threshold: default_strong_confidence_threshold(),
            min_confidence: default_min_confidence(),
            freshness_intervals: default_freshness_intervals(),
        }
    }
}

fn default_neutral_band() -> f64 {
    0.05
}

fn default_strong_confidence_threshold() -> f64 {
    0.75
}

fn default_min_confidence() -> f64 {
    0.5
}

fn default_freshness_intervals() -> u32 {
    1
}

/// One timeframe's contribution to the vote
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeframeVote {
    pub role: Role,
    pub timeframe_id: Uuid,
    pub interval: Interval,
    pub weight: f64,
    pub direction: Direction,
    pub ensemble: f64,
    pub confidence: f64,
    pub prediction_time: DateTime<Utc>,
    pub market_data_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Signal {
    pub instrument: InstrumentKey,
    pub kind: SignalKind,
    pub reason: SignalReason,
    /// Set when a prediction was missing or too old
    pub stale: bool,
    pub tactical: Option<TimeframeVote>,
    pub strategic: Option<TimeframeVote>,
    pub long_score: f64,
    pub short_score: f64,
    pub generated_at: DateTime<Utc>,
}

impl Signal {
    /// Bar the decision was made on: the tactical one, the most recent close
    pub fn entry_bar_id(&self) -> Option<Uuid> {
        self.tactical.as_ref().map(|v| v.market_data_id)
    }
}

/// The two timeframes a signal is fused from
#[derive(Debug, Clone, PartialEq)]
pub struct Roles {
    pub tactical: Timeframe,
    pub strategic: Timeframe,
}

pub struct SignalGenerator {
    config: SignalConfig,
}

impl SignalGenerator {
    pub fn new(config: SignalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    /// Rank enabled timeframes by weight, longer interval first on a tie.
    /// The top one is strategic and the runner-up tactical.
    pub fn assign_roles(timeframes: &[Timeframe]) -> Option<Roles> {
        let mut enabled: Vec<&Timeframe> = timeframes.iter().filter(|tf| tf.enabled).collect();
        enabled.sort_by(|a, b| {
            b.weight
                .total_cmp(&a.weight)
                .then_with(|| b.interval.cmp(&a.interval))
        });
        match enabled.as_slice() {
            [strategic, tactical, ..] => Some(Roles {
                tactical: (*tactical).clone(),
                strategic: (*strategic).clone(),
            }),
            _ => None,
        }
    }

    pub fn direction(&self, ensemble: f64) -> Direction {
        if ensemble > self.config.neutral_band {
            Direction::Long
        } else if ensemble < -self.config.neutral_band {
            Direction::Short
        } else {
            Direction::Neutral
        }
    }

    pub fn is_fresh(&self, timeframe: &Timeframe, prediction: &ModelPrediction, now: DateTime<Utc>) -> bool {
        let bound = timeframe.interval.duration() * self.config.freshness_intervals as i32;
        now - prediction.prediction_time <= bound
    }

    fn vote(&self, role: Role, timeframe: &Timeframe, prediction: &ModelPrediction) -> TimeframeVote {
        TimeframeVote {
            role,
            timeframe_id: timeframe.id,
            interval: timeframe.interval,
            weight: timeframe.weight,
            direction: self.direction(prediction.ensemble_pred),
            ensemble: prediction.ensemble_pred,
            confidence: prediction.confidence,
            prediction_time: prediction.prediction_time,
            market_data_id: prediction.market_data_id,
        }
    }

    /// Fuse the latest committed predictions of both timeframes
    pub fn evaluate(
        &self,
        instrument: &InstrumentKey,
        tactical: (&Timeframe, Option<&ModelPrediction>),
        strategic: (&Timeframe, Option<&ModelPrediction>),
        now: DateTime<Utc>,
    ) -> Signal {
        let fresh = |(tf, pred): (&Timeframe, Option<_>)| {
            pred.filter(|p: &&ModelPrediction| self.is_fresh(tf, p, now))
        };
        let tactical_vote = tactical.1.map(|p| self.vote(Role::Tactical, tactical.0, p));
        let strategic_vote = strategic.1.map(|p| self.vote(Role::Strategic, strategic.0, p));

        let mut signal = Signal {
            instrument: instrument.clone(),
            kind: SignalKind::Hold,
            reason: SignalReason::Stale,
            stale: true,
            tactical: tactical_vote.clone(),
            strategic: strategic_vote.clone(),
            long_score: 0.0,
            short_score: 0.0,
            generated_at: now,
        };

        let (Some(_), Some(_), Some(t), Some(s)) =
            (fresh(tactical), fresh(strategic), tactical_vote, strategic_vote)
        else {
            return signal;
        };
        signal.stale = false;

        for vote in [&t, &s] {
            let score = vote.weight * vote.confidence;
            match vote.direction {
                Direction::Long => signal.long_score += score,
                Direction::Short => signal.short_score += score,
                Direction::Neutral => {}
            }
        }

        let (kind, reason) = self.decide(&t, &s, signal.long_score, signal.short_score);
        signal.kind = kind;
        signal.reason = reason;
        signal
    }

    fn decide(
        &self,
        tactical: &TimeframeVote,
        strategic: &TimeframeVote,
        long_score: f64,
        short_score: f64,
    ) -> (SignalKind, SignalReason) {
        use Direction::*;

        if long_score > 0.0 && long_score == short_score {
            return (SignalKind::Hold, SignalReason::Tie);
        }

        match (tactical.direction, strategic.direction) {
            (Long, Short) | (Short, Long) => (SignalKind::Hold, SignalReason::Disagreement),
            (t, s) if t == s && t != Neutral => {
                let total_weight = tactical.weight + strategic.weight;
                let combined = if total_weight > 0.0 {
                    (tactical.weight * tactical.confidence + strategic.weight * strategic.confidence)
                        / total_weight
                } else {
                    0.0
                };
                if combined >= self.config.min_confidence {
                    (to_kind(s), SignalReason::Agreement)
                } else {
                    (SignalKind::Hold, SignalReason::LowConfidence)
                }
            }
            (Neutral, s)
                if s != Neutral
                    && strategic.confidence > self.config.strong_confidence_threshold =>
            {
                (to_kind(s), SignalReason::StrategicConviction)
            }
            _ => (SignalKind::Hold, SignalReason::Unconfirmed),
        }
    }
}

impl Default for SignalGenerator {
    fn default() -> Self {
        Self::new(SignalConfig::default())
    }
}

fn to_kind(direction: Direction) -> SignalKind {
    match direction {
        Direction::Long => SignalKind::Long,
        Direction::Short => SignalKind::Short,
        Direction::Neutral => SignalKind::Hold,
    }
}
