//! Trade runner library
//!
//! Configuration, risk, positions, per-stream pipeline tasks and the
//! operator API of the futures signal pipeline.

pub mod api;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod pipeline;
pub mod portfolio;
pub mod position;
pub mod risk;
pub mod runner;

pub use api::{router, ApiState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ApiConfig, ConfigError, DataConfig, ExposureBreach, FeeConfig, PairConfig, PipelineConfig,
    RiskConfig, RuntimeConfig, TimeframeConfig,
};
pub use coordinator::InstrumentCoordinator;
pub use pipeline::{BarOutcome, Ingestor, PipelineEvent, StreamContext, StreamMessage, StreamWorker};
pub use portfolio::{Portfolio, PortfolioSnapshot};
pub use position::{
    ExitReason, MonitorOutcome, OpenOutcome, OpenPosition, PositionError, PositionManager,
    PositionSlot, TradePlan,
};
pub use risk::{EmergencyHalt, RiskController, RiskDecision, RiskVeto};
pub use runner::Runner;
