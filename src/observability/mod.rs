// src/observability/mod.rs
//! Tracing and metrics bootstrap
//!
//! One-time process setup: a structured tracing subscriber filtered by
//! `PARROT_LOG` (falling back to `RUST_LOG`, then `info`), and a Prometheus
//! metrics recorder. The recorder handle renders the full registry on
//! demand, which the binary logs when a run finishes.

use crate::utils::errors::{EngineError, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber
///
/// Set `PARROT_LOG_FORMAT=json` for machine-readable output.
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_env("PARROT_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let json = std::env::var("PARROT_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| {
        EngineError::ConfigError(format!("Failed to install tracing subscriber: {}", e))
    })
}

/// Install the global Prometheus metrics recorder
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new().install_recorder().map_err(|e| {
        EngineError::ConfigError(format!("Failed to install metrics recorder: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_installs_exactly_once() {
        assert!(init_tracing().is_ok());
        assert!(init_tracing().is_err());
    }

    #[test]
    fn test_metrics_recorder_renders_counters() {
        let handle = init_metrics().unwrap();
        metrics::counter!("parrot_observability_smoke_total").increment(3);
        let rendered = handle.render();
        assert!(rendered.contains("parrot_observability_smoke_total"));
    }
}
