//! hm-analyzer: the health manager's reconciliation engine.
//!
//! Compares desired app state against reported heartbeats and queues the
//! corrective starts and stops, with a grace period for disappearances,
//! exponential backoff for crash loops and a delayed stop for duplicates.

pub mod analyzer;
pub mod app;
pub mod backoff;
pub mod error;
pub mod metrics;
pub mod plan;

pub use analyzer::{Analysis, Analyzer};
pub use app::{App, IndexState};
pub use backoff::BackoffPolicy;
pub use error::{AnalyzerError, AnalyzerResult};
pub use metrics::HealthMetrics;
pub use plan::{Plan, PlanPolicy, plan};
