use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Critical,
}

impl LogLevel {
    /// The `EnvFilter` directive for this level. `critical` has no tracing
    /// equivalent and maps to `error`.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

pub fn convert_level(level: &str) -> LogLevel {
    match level.to_lowercase().as_str() {
        "trace" => LogLevel::Trace,
        "debug" => LogLevel::Debug,
        "info" => LogLevel::Info,
        "warn" => LogLevel::Warn,
        "error" => LogLevel::Error,
        "critical" => LogLevel::Critical,
        _ => LogLevel::Info,
    }
}

/// Keeps the non-blocking file writers flushing; drop it only at exit.
pub struct LogGuards {
    _guards: Vec<WorkerGuard>,
}

/// Installs the global subscriber:
///
/// - stdout, filtered by `log_level` (or `RUST_LOG` when set)
/// - `<root>/<log_file>`, a daily-rolling plain-text log
/// - `<root>/<event_file>`, a daily-rolling JSON log that only receives
///   events with target `request` or `job`
pub fn init_tracing(root: PathBuf, log_file: &str, event_file: &str, log_level: LogLevel) -> Result<LogGuards> {
    let log_path = root.join(log_file);
    let event_path = root.join(event_file);

    let (txt_writer, txt_guard) = tracing_appender::non_blocking(rolling(&log_path)?);
    let (json_writer, json_guard) = tracing_appender::non_blocking(rolling(&event_path)?);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_directive()));

    let stdout_layer = fmt::layer().with_thread_names(true);

    let txt_layer = fmt::layer().with_writer(txt_writer).with_ansi(false);

    let json_layer = fmt::layer()
        .json()
        .with_writer(json_writer)
        .with_target(true)
        .with_filter(EnvFilter::new("request=info,job=info"));

    Registry::default()
        .with(env_filter)
        .with(stdout_layer)
        .with(txt_layer)
        .with(json_layer)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    Ok(LogGuards {
        _guards: vec![txt_guard, json_guard],
    })
}

fn rolling(path: &Path) -> Result<RollingFileAppender> {
    let dir = path
        .parent()
        .with_context(|| format!("log path {} has no parent directory", path.display()))?;
    let file = path
        .file_name()
        .with_context(|| format!("log path {} has no file name", path.display()))?;
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    Ok(RollingFileAppender::new(Rotation::DAILY, dir, file))
}

/// Application counters and histograms. They come from the global meter,
/// which is a no-op until a meter provider is installed.
#[derive(Clone)]
pub struct Metrics {
    pub requests_started: Counter<u64>,
    pub requests_succeeded: Counter<u64>,
    pub requests_failed: Counter<u64>,
    pub request_latency_ms: Histogram<f64>,
    pub jobs_completed: Counter<u64>,
    pub jobs_failed: Counter<u64>,
    pub job_latency_ms: Histogram<f64>,
}

impl Metrics {
    pub fn new() -> Self {
        let meter = global::meter("switchyard");

        Metrics {
            requests_started: meter
                .u64_counter("requests_started")
                .with_description("Total requests started")
                .build(),
            requests_succeeded: meter.u64_counter("requests_succeeded").build(),
            requests_failed: meter.u64_counter("requests_failed").build(),
            request_latency_ms: meter
                .f64_histogram("request_latency_ms")
                .with_description("Latency per request in ms")
                .with_unit("ms")
                .build(),
            jobs_completed: meter.u64_counter("jobs_completed").build(),
            jobs_failed: meter.u64_counter("jobs_failed").build(),
            job_latency_ms: meter
                .f64_histogram("job_latency_ms")
                .with_description("Time from pickup to terminal state")
                .with_unit("ms")
                .build(),
        }
    }

    pub fn record_job(&self, function: &str, ok: bool, elapsed_ms: f64) {
        let attrs = [KeyValue::new("function", function.to_string())];
        if ok {
            self.jobs_completed.add(1, &attrs);
        } else {
            self.jobs_failed.add(1, &attrs);
        }
        self.job_latency_ms.record(elapsed_ms, &attrs);
    }

    /// Times `handler`, updates the request metrics and writes one JSON
    /// `request` event with the outcome.
    pub async fn instrument_request<F, Fut, T, E>(&self, name: &str, handler: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.requests_started.add(1, &[]);
        let start = Instant::now();

        let result = handler().await;

        let elapsed = start.elapsed().as_secs_f64() * 1_000.0;
        self.request_latency_ms.record(elapsed, &[]);

        match &result {
            Ok(_) => {
                self.requests_succeeded.add(1, &[]);
                info!("request `{}` succeeded in {:.1} ms", name, elapsed);
            }
            Err(err) => {
                self.requests_failed.add(1, &[]);
                error!(error = %err, "request `{}` failed in {:.1} ms", name, elapsed);
            }
        }

        tracing::event!(
            target: "request",
            tracing::Level::INFO,
            request = name,
            latency_ms = elapsed,
            status = if result.is_ok() { "ok" } else { "error" },
        );

        result
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_convert_with_info_fallback() {
        assert_eq!(convert_level("DEBUG"), LogLevel::Debug);
        assert_eq!(convert_level("critical"), LogLevel::Critical);
        assert_eq!(convert_level("loud"), LogLevel::Info);
        assert_eq!(LogLevel::Critical.as_directive(), "error");
    }

    #[tokio::test]
    async fn instrument_request_passes_result_through() {
        let metrics = Metrics::new();
        let ok: Result<u32, String> = metrics.instrument_request("ok", || async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err: Result<u32, String> = metrics
            .instrument_request("err", || async { Err("boom".to_string()) })
            .await;
        assert_eq!(err.unwrap_err(), "boom");
    }
}
