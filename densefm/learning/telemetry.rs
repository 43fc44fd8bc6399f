use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::{json, Value};
use shared_event_bus::{EventPublisher, EventRecord, FileEventPublisher};
use shared_logging::{JsonLogger, LogLevel, LogRecord};

use crate::config::TelemetryConfig;

/// Builder for pipeline telemetry sinks.
pub struct PipelineTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl PipelineTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            min_level: LogLevel::Debug,
            event_publisher: None,
        }
    }

    /// Sets the log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Drops log records below `level`.
    #[must_use]
    pub fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Sets the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<PipelineTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(JsonLogger::new(path)?.with_min_level(self.min_level)),
            None => None,
        };
        Ok(PipelineTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                logger,
                publisher: self.event_publisher,
            }),
        })
    }
}

/// Telemetry handle shared across pipeline stages.
#[derive(Clone)]
pub struct PipelineTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for PipelineTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineTelemetry")
            .field("module", &self.inner.module)
            .field("log", &self.inner.logger.as_ref().map(JsonLogger::path))
            .finish_non_exhaustive()
    }
}

struct TelemetryInner {
    module: String,
    logger: Option<JsonLogger>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl PipelineTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> PipelineTelemetryBuilder {
        PipelineTelemetryBuilder::new(module)
    }

    /// Telemetry that writes nothing.
    #[must_use]
    pub fn disabled(module: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                module: module.into(),
                logger: None,
                publisher: None,
            }),
        }
    }

    /// Builds the file-backed sinks named in `config`.
    pub fn from_config(config: &TelemetryConfig) -> Result<Self> {
        let mut builder = Self::builder(&config.module)
            .log_path(&config.log_path)
            .min_level(config.min_level);
        if let Some(path) = &config.events_path {
            builder = builder.event_publisher(Arc::new(FileEventPublisher::new(path)?));
        }
        builder.build()
    }

    /// Module name stamped on records.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.inner.module
    }

    /// Logs structured metadata.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            if logger.enabled(level) {
                let record =
                    LogRecord::new(&self.inner.module, level, message).with_metadata(&metadata);
                logger.log(&record)?;
            }
        }
        Ok(())
    }

    /// Emits an event on the bus.
    pub async fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        if let Some(publisher) = &self.inner.publisher {
            publisher
                .publish(EventRecord::new(&self.inner.module, event_type, payload))
                .await?;
        }
        Ok(())
    }

    /// Logs `pipeline.<stage>.started`.
    pub fn stage_started(&self, stage: &str, metadata: Value) -> Result<()> {
        self.log(LogLevel::Info, &format!("pipeline.{stage}.started"), metadata)
    }

    /// Logs and publishes `pipeline.<stage>.completed`.
    pub async fn stage_completed(&self, stage: &str, metadata: Value) -> Result<()> {
        let name = format!("pipeline.{stage}.completed");
        self.log(LogLevel::Info, &name, metadata.clone())?;
        self.event(&name, metadata).await
    }

    /// Logs and publishes `pipeline.<stage>.failed`.
    pub async fn stage_failed(&self, stage: &str, error: &anyhow::Error) -> Result<()> {
        let name = format!("pipeline.{stage}.failed");
        let payload = json!({ "error": format!("{error:#}") });
        self.log(LogLevel::Error, &name, payload.clone())?;
        self.event(&name, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_event_bus::{EventArchive, MemoryEventBus};
    use tempfile::tempdir;

    #[tokio::test]
    async fn telemetry_writes_log_and_event() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("densefm.log");
        let bus = Arc::new(MemoryEventBus::new(16));
        let telemetry = PipelineTelemetry::builder("densefm")
            .log_path(&path)
            .min_level(LogLevel::Info)
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        telemetry
            .log(LogLevel::Debug, "dropped", json!({}))
            .unwrap();
        telemetry
            .stage_started("encode", json!({ "rows": 3 }))
            .unwrap();
        telemetry
            .stage_completed("encode", json!({ "records": 3 }))
            .await
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("pipeline.encode.started"));
        assert!(content.contains("\"records\":3"));
        assert!(!content.contains("dropped"));
        let events = bus.of_type("pipeline.encode.completed");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, "densefm");
    }

    #[tokio::test]
    async fn from_config_archives_events() {
        let tmp = tempdir().unwrap();
        let config = TelemetryConfig {
            module: "densefm".into(),
            log_path: tmp.path().join("logs/run.jsonl"),
            events_path: Some(tmp.path().join("logs/events.jsonl")),
            min_level: LogLevel::Info,
        };
        let telemetry = PipelineTelemetry::from_config(&config).unwrap();
        telemetry
            .stage_failed("deploy", &anyhow::anyhow!("no capacity"))
            .await
            .unwrap();
        let events = EventArchive::new(tmp.path().join("logs/events.jsonl"))
            .read_all()
            .unwrap();
        assert_eq!(events[0].event_type, "pipeline.deploy.failed");
        assert_eq!(events[0].payload["error"], "no capacity");
    }

    #[tokio::test]
    async fn disabled_telemetry_is_silent() {
        let telemetry = PipelineTelemetry::disabled("densefm");
        telemetry.log(LogLevel::Error, "x", json!({})).unwrap();
        telemetry.event("x", json!({})).await.unwrap();
        assert_eq!(telemetry.module(), "densefm");
    }
}
