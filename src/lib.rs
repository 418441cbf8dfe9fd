//! Experiment run tracking and summary analytics.
//!
//! Metrics append into SQLite as free-form keyed time series; the summary
//! engine normalizes each run's stream into per-epoch statistics, and the
//! recommendation engine ships per-run series to an external analysis
//! service and reconciles its suggestions back into the same summaries.

pub mod client;
pub mod config;
pub mod db;
pub mod metrics;
pub mod recommend;
pub mod runs;
pub mod summary;
pub mod trigger;

pub use client::{HttpRecoClient, RecoClient, RecoRequest, RecoResponse, RecoSuggestion, UpstreamError};
pub use config::{Config, ConfigError};
pub use metrics::{MetricBatchEntry, MetricError, MetricRecord};
pub use recommend::{RecommendEngine, RecommendError, RecommendationRecord};
pub use runs::{ExperimentRecord, RunRecord, RunStatus, RunStoreError};
pub use summary::{RunSummaryRecord, SummaryEngine, SummaryError};
pub use trigger::{RecomputeWorker, TriggerError};
