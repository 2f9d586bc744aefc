//! Telemetry port and logging bootstrap.
//!
//! Telemetry is best-effort by contract: sinks never propagate failures into
//! the request path. Hosts that want persistence implement [`TelemetrySink`]
//! over their own storage.

use std::sync::OnceLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::memory::InteractionRecord;

// ─── SpanRecord ───────────────────────────────────────────────────────────────

/// A coarse timing span emitted by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanRecord {
    pub component: String,
    pub name: String,
    pub duration_ms: u64,
    pub success: bool,
}

// ─── TelemetrySink ────────────────────────────────────────────────────────────

/// Best-effort observability sink.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn record_interaction(&self, record: &InteractionRecord);
    async fn record_span(&self, span: &SpanRecord);
}

/// Discards everything.
pub struct NullTelemetry;

#[async_trait]
impl TelemetrySink for NullTelemetry {
    async fn record_interaction(&self, _record: &InteractionRecord) {}
    async fn record_span(&self, _span: &SpanRecord) {}
}

/// Writes telemetry into the log stream.
pub struct LogTelemetry;

#[async_trait]
impl TelemetrySink for LogTelemetry {
    async fn record_interaction(&self, record: &InteractionRecord) {
        log::debug!(
            "[telemetry] interaction id={} session={} success={} confidence={:.2} duration_ms={}",
            record.interaction_id,
            record.session_id,
            record.success,
            record.confidence,
            record.execution_time_ms
        );
    }

    async fn record_span(&self, span: &SpanRecord) {
        log::debug!(
            "[telemetry] span component={} name={} success={} duration_ms={}",
            span.component,
            span.name,
            span.success,
            span.duration_ms
        );
    }
}

// ─── Logging bootstrap ────────────────────────────────────────────────────────

static INIT: OnceLock<()> = OnceLock::new();

/// Install the tracing subscriber once per process.
///
/// Verbosity comes from `RUST_LOG` (default `info`). All `log::` call sites
/// across the core forward into the tracing pipeline. Safe to call more than
/// once; later calls are no-ops.
pub fn init_logging() {
    INIT.get_or_init(|| {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .ok();
        tracing_log::LogTracer::init().ok();
    });
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging();
        init_logging();
    }

    #[tokio::test]
    async fn null_sink_accepts_spans() {
        let sink = NullTelemetry;
        sink.record_span(&SpanRecord {
            component: "orchestrator".into(),
            name: "process".into(),
            duration_ms: 1,
            success: true,
        })
        .await;
    }
}
