use std::time::Duration;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

use crate::{config::LoggingConfig, error::ErrorKind};

pub const TRANSFERS_TOTAL: &str = "simplebank_transfers_total";
pub const TRANSFER_DURATION_SECONDS: &str = "simplebank_transfer_duration_seconds";

pub fn init_logging(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    }
}

pub fn install_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

pub fn outcome_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::NotFound => "not_found",
        ErrorKind::InvalidInput => "invalid_input",
        ErrorKind::TransactionConflict => "conflict",
        ErrorKind::StorageFault => "storage_fault",
        ErrorKind::Cancelled => "cancelled",
    }
}

pub fn record_transfer(outcome: &'static str, elapsed: Duration) {
    metrics::counter!(TRANSFERS_TOTAL, 1, "outcome" => outcome);
    metrics::histogram!(TRANSFER_DURATION_SECONDS, elapsed.as_secs_f64());
}
