pub mod aggregation;
pub mod audit;
pub mod config;
pub mod db;
pub mod directory;
pub mod errors;
pub mod kpi;
pub mod models;
pub mod policy;
pub mod service;
pub mod store;
pub mod workflow;

#[cfg(test)]
mod test_support;

pub use crate::aggregation::AggregationEngine;
pub use crate::audit::{AuditSink, JsonLinesAuditSink, TracingAuditSink};
pub use crate::config::ReferenceData;
pub use crate::db::Database;
pub use crate::directory::Directory;
pub use crate::errors::{AppError, AppResult};
pub use crate::kpi::{ExecutiveKpis, KpiSnapshot, Tier};
pub use crate::models::{
    AggregateSnapshot, AuditAction, AuditEvent, Community, CoverageSettings, NewRecordPayload, Period,
    RecordStatus, Role, RoleDashboard, Scope, ScopeKpiView, ServiceRecord, Territory, User,
};
pub use crate::policy::PolicyEngine;
pub use crate::service::CoverageService;
pub use crate::store::RecordStore;
pub use crate::workflow::RecordWorkflow;

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Installs the process-wide JSON subscriber writing to `<data_dir>/logs`.
/// Safe to call more than once; later calls leave the first subscriber in
/// place and report it as a config error.
pub fn init_tracing(data_dir: &Path) -> AppResult<()> {
    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "coverage.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Config(format!("tracing subscriber already installed: {}", error)))
}
