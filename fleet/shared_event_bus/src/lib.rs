#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Fleet lifecycle events and the sinks they are published to.
//!
//! Events are append-only facts (`fleet.instance.started`, a directory
//! refresh, a console command). A sink either keeps a bounded backlog in
//! memory or appends one JSON line per event to a log that `fleet audit`
//! reads back.

use std::{
    collections::VecDeque,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{fs::OpenOptions, io::AsyncWriteExt};
use uuid::Uuid;

/// One published fact about the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetEvent {
    /// `evt-<uuid>`.
    pub id: String,
    /// Component that emitted the event.
    pub source: String,
    /// Dotted event kind, e.g. `fleet.instance.stopped`.
    pub kind: String,
    /// Instance uuid the event concerns, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    /// Emission time.
    pub at: DateTime<Utc>,
    /// Free-form details.
    #[serde(default)]
    pub payload: Value,
}

impl FleetEvent {
    /// Stamps a new event. The instance is taken from a `uuid` payload field.
    #[must_use]
    pub fn new(source: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        let instance = payload
            .get("uuid")
            .and_then(Value::as_str)
            .map(str::to_owned);
        Self {
            id: format!("evt-{}", Uuid::new_v4()),
            source: source.into(),
            kind: kind.into(),
            instance,
            at: Utc::now(),
            payload,
        }
    }

    /// Whether the event concerns the given instance uuid.
    #[must_use]
    pub fn concerns(&self, uuid: &str) -> bool {
        self.instance.as_deref() == Some(uuid)
    }
}

/// Destination for fleet events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Records one event.
    async fn publish(&self, event: FleetEvent) -> Result<()>;
}

/// Bounded in-memory history; the oldest event is evicted first.
#[derive(Debug)]
pub struct EventBacklog {
    events: Mutex<VecDeque<FleetEvent>>,
    capacity: usize,
}

impl EventBacklog {
    /// Keeps at most `capacity` events (minimum one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Retained events, oldest first.
    #[must_use]
    pub fn recent(&self) -> Vec<FleetEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Retained events of one kind.
    #[must_use]
    pub fn of_kind(&self, kind: &str) -> Vec<FleetEvent> {
        self.matching(|event| event.kind == kind)
    }

    /// Retained events about one instance.
    #[must_use]
    pub fn for_instance(&self, uuid: &str) -> Vec<FleetEvent> {
        self.matching(|event| event.concerns(uuid))
    }

    /// Number of retained events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether nothing has been retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    fn matching(&self, keep: impl Fn(&FleetEvent) -> bool) -> Vec<FleetEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| keep(event))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for EventBacklog {
    async fn publish(&self, event: FleetEvent) -> Result<()> {
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
        Ok(())
    }
}

/// JSON-lines event log on disk.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    append: tokio::sync::Mutex<()>,
}

impl EventLog {
    /// Opens a log at `path`, creating its directory.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating event log dir {}", parent.display()))?;
        }
        Ok(Self {
            path,
            append: tokio::sync::Mutex::new(()),
        })
    }

    /// Log location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last `limit` events in this log.
    pub fn tail(&self, limit: usize) -> Result<Vec<FleetEvent>> {
        tail_events(&self.path, limit)
    }
}

#[async_trait]
impl EventSink for EventLog {
    async fn publish(&self, event: FleetEvent) -> Result<()> {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        let _guard = self.append.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening event log {}", self.path.display()))?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Last `limit` events of a JSON-lines log, oldest first.
///
/// A missing file has no events. Lines that do not decode are skipped.
pub fn tail_events(path: impl AsRef<Path>, limit: usize) -> Result<Vec<FleetEvent>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading event log {}", path.display()))?;
    let mut events: Vec<FleetEvent> = raw
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect();
    let skip = events.len().saturating_sub(limit);
    Ok(events.split_off(skip))
}
