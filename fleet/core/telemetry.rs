use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventSink, FleetEvent};
use shared_logging::{JsonLogger, LogLevel, LogRecord};

/// Builder configuring telemetry for fleet operations.
pub struct FleetTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
    event_sink: Option<Arc<dyn EventSink>>,
}

impl FleetTelemetryBuilder {
    /// Creates a new builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            min_level: LogLevel::Info,
            event_sink: None,
        }
    }

    /// Sets the JSON log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Drops JSON records below this level.
    #[must_use]
    pub const fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Sends lifecycle events to `sink`.
    #[must_use]
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// Finalizes the builder.
    pub fn build(self) -> Result<FleetTelemetry> {
        let logger = self
            .log_path
            .map(|path| JsonLogger::with_min_level(path, self.min_level))
            .transpose()?;
        Ok(FleetTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                logger,
                sink: self.event_sink,
            }),
        })
    }
}

/// Telemetry handle: JSON-lines audit log plus lifecycle events.
///
/// Every record is mirrored to `tracing` so it also shows up in the process log.
#[derive(Clone)]
pub struct FleetTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for FleetTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FleetTelemetry")
            .field("module", &self.inner.module)
            .field("logs", &self.inner.logger.is_some())
            .field("events", &self.inner.sink.is_some())
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    logger: Option<JsonLogger>,
    sink: Option<Arc<dyn EventSink>>,
}

impl FleetTelemetry {
    /// Returns a builder for this telemetry helper.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> FleetTelemetryBuilder {
        FleetTelemetryBuilder::new(module)
    }

    /// Logs a structured record.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        let module = self.inner.module.as_str();
        match level {
            LogLevel::Debug => tracing::debug!(module, %metadata, "{message}"),
            LogLevel::Info => tracing::info!(module, %metadata, "{message}"),
            LogLevel::Warn => tracing::warn!(module, %metadata, "{message}"),
            LogLevel::Error => tracing::error!(module, %metadata, "{message}"),
        }
        if let Some(logger) = &self.inner.logger {
            let record = LogRecord::new(module, level, message).with_metadata(metadata);
            logger.log(&record)?;
        }
        Ok(())
    }

    /// Publishes an event to the configured sink.
    pub async fn event(&self, kind: &str, payload: Value) -> Result<()> {
        if let Some(sink) = &self.inner.sink {
            sink.publish(FleetEvent::new(self.inner.module.clone(), kind, payload))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_event_bus::EventBacklog;
    use tempfile::tempdir;

    #[tokio::test]
    async fn telemetry_logs_and_emits() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("fleet.log");
        let backlog = Arc::new(EventBacklog::new(8));
        let telemetry = FleetTelemetry::builder("fleet")
            .log_path(&log_path)
            .event_sink(backlog.clone())
            .build()
            .unwrap();
        telemetry
            .log(LogLevel::Info, "fleet.test", json!({ "uuid": "u1" }))
            .unwrap();
        telemetry
            .log(LogLevel::Debug, "fleet.quiet", json!({}))
            .unwrap();
        telemetry
            .event("fleet.test", json!({ "instances": 1 }))
            .await
            .unwrap();
        let content = std::fs::read_to_string(log_path).unwrap();
        assert!(content.contains("fleet.test"));
        assert!(!content.contains("fleet.quiet"));
        assert_eq!(backlog.len(), 1);
    }

    #[tokio::test]
    async fn unconfigured_telemetry_is_a_no_op() {
        let telemetry = FleetTelemetry::builder("fleet").build().unwrap();
        telemetry
            .log(LogLevel::Error, "fleet.test", Value::Null)
            .unwrap();
        telemetry.event("fleet.test", Value::Null).await.unwrap();
    }
}
