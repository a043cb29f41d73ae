use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use thiserror::Error;
use tracing::instrument;

use crate::{
    payload::{non_empty, InstancePage, RawOverview},
    remote::RemoteTransport,
    routes::{Operation, RouteTable},
    telemetry::FleetTelemetry,
};

/// Name given to instances without a nickname.
pub const UNNAMED_INSTANCE: &str = "unnamed";
/// Name given to nodes with neither remarks nor address.
pub const UNNAMED_NODE: &str = "Unnamed Node";
/// Default page size for instance listings; sized to fit a fleet in one page.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Lifecycle state reported by the remote daemon.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Missing or unrecognized status.
    #[default]
    Unknown,
    /// Not running.
    Stopped,
    /// Shutting down.
    Stopping,
    /// Booting.
    Starting,
    /// Running.
    Running,
}

impl InstanceStatus {
    /// Maps the remote numeric code.
    #[must_use]
    pub const fn from_code(code: Option<i64>) -> Self {
        match code {
            Some(0) => Self::Stopped,
            Some(1) => Self::Stopping,
            Some(2) => Self::Starting,
            Some(3) => Self::Running,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unknown => "unknown",
            Self::Stopped => "stopped",
            Self::Stopping => "stopping",
            Self::Starting => "starting",
            Self::Running => "running",
        };
        f.write_str(label)
    }
}

/// One management daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Opaque daemon id.
    pub id: String,
    /// Remarks, else address, else a placeholder.
    pub display_name: String,
}

/// One managed server process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// 1-based position in the snapshot's sort order.
    pub position: usize,
    /// Display name; not unique.
    pub name: String,
    /// Stable unique id.
    pub unique_id: String,
    /// Owning node id.
    pub node_id: String,
    /// Last observed status.
    pub status: InstanceStatus,
}

/// Instance as discovered, before sorting and numbering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredInstance {
    /// Display name.
    pub name: String,
    /// Unique id.
    pub unique_id: String,
    /// Owning node id.
    pub node_id: String,
    /// Status.
    pub status: InstanceStatus,
}

/// Why a refresh produced no snapshot.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DirectoryError {
    /// The overview listed no nodes, or could not be fetched.
    #[error("no nodes available: {0}")]
    NoNodes(String),
}

/// Why an identifier did not resolve.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// The name is shared by several instances; use a position or unique id.
    #[error("instance name '{0}' is ambiguous; use its position or unique id")]
    Ambiguous(String),
    /// Nothing matched.
    #[error("no instance matches '{0}'")]
    NotFound(String),
}

/// Immutable view of the fleet as of one refresh.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    nodes: Vec<Node>,
    instances: Vec<Instance>,
    name_index: HashMap<String, usize>,
    id_index: HashMap<String, usize>,
    ambiguous_names: BTreeSet<String>,
    skipped_nodes: Vec<String>,
    refreshed_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    /// Builds a snapshot from discovered instances, in discovery order.
    #[must_use]
    pub fn build(
        nodes: Vec<Node>,
        mut discovered: Vec<DiscoveredInstance>,
        skipped_nodes: Vec<String>,
    ) -> Self {
        // Stable: equal names keep discovery order.
        discovered.sort_by(|a, b| a.name.cmp(&b.name));

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for entry in &discovered {
            *counts.entry(entry.name.as_str()).or_default() += 1;
        }
        let ambiguous_names: BTreeSet<String> = counts
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(name, _)| name.to_string())
            .collect();

        let mut instances = Vec::with_capacity(discovered.len());
        let mut name_index = HashMap::new();
        let mut id_index = HashMap::new();
        for (idx, entry) in discovered.into_iter().enumerate() {
            if !ambiguous_names.contains(&entry.name) {
                name_index.insert(entry.name.clone(), idx);
            }
            id_index.insert(entry.unique_id.clone(), idx);
            instances.push(Instance {
                position: idx + 1,
                name: entry.name,
                unique_id: entry.unique_id,
                node_id: entry.node_id,
                status: entry.status,
            });
        }

        Self {
            nodes,
            instances,
            name_index,
            id_index,
            ambiguous_names,
            skipped_nodes,
            refreshed_at: Some(Utc::now()),
        }
    }

    /// Instances in position order.
    #[must_use]
    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    /// Nodes in overview order.
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Node by id.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id == id)
    }

    /// Names shared by two or more instances.
    #[must_use]
    pub const fn ambiguous_names(&self) -> &BTreeSet<String> {
        &self.ambiguous_names
    }

    /// True when `name` is shared by two or more instances.
    #[must_use]
    pub fn is_ambiguous(&self, name: &str) -> bool {
        self.ambiguous_names.contains(name)
    }

    /// Nodes whose instance listing failed during the refresh.
    #[must_use]
    pub fn skipped_nodes(&self) -> &[String] {
        &self.skipped_nodes
    }

    /// When the snapshot was built; `None` for the startup snapshot.
    #[must_use]
    pub const fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.refreshed_at
    }

    /// Number of instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// True when there are no instances.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Instance with a unique name.
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<&Instance> {
        self.name_index.get(name).map(|idx| &self.instances[*idx])
    }

    /// Instance by unique id.
    #[must_use]
    pub fn by_id(&self, unique_id: &str) -> Option<&Instance> {
        self.id_index.get(unique_id).map(|idx| &self.instances[*idx])
    }

    /// Instance at a 1-based position.
    #[must_use]
    pub fn by_position(&self, position: usize) -> Option<&Instance> {
        position
            .checked_sub(1)
            .and_then(|idx| self.instances.get(idx))
    }

    /// Resolves a position, unique name, or unique id.
    pub fn resolve(&self, identifier: &str) -> Result<&Instance, ResolveError> {
        let identifier = identifier.trim();
        let not_found = || ResolveError::NotFound(identifier.to_string());
        if !identifier.is_empty() && identifier.bytes().all(|b| b.is_ascii_digit()) {
            // Overflowing digit strings are simply out of range.
            return identifier
                .parse::<usize>()
                .ok()
                .and_then(|position| self.by_position(position))
                .ok_or_else(not_found);
        }
        if self.is_ambiguous(identifier) {
            return Err(ResolveError::Ambiguous(identifier.to_string()));
        }
        self.by_name(identifier)
            .or_else(|| self.by_id(identifier))
            .ok_or_else(not_found)
    }
}

/// Holds the current snapshot and rebuilds it from the remote inventory.
pub struct InstanceDirectory {
    transport: Arc<dyn RemoteTransport>,
    routes: Arc<RouteTable>,
    page_size: u32,
    snapshot: RwLock<Arc<Snapshot>>,
    telemetry: Option<FleetTelemetry>,
}

impl fmt::Debug for InstanceDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceDirectory")
            .field("page_size", &self.page_size)
            .field("instances", &self.snapshot.read().len())
            .finish_non_exhaustive()
    }
}

impl InstanceDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new(transport: Arc<dyn RemoteTransport>, routes: Arc<RouteTable>) -> Self {
        Self {
            transport,
            routes,
            page_size: DEFAULT_PAGE_SIZE,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            telemetry: None,
        }
    }

    /// Overrides the listing page size.
    #[must_use]
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Option<FleetTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Current snapshot. Cheap; the returned handle never changes underneath the caller.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Resolves against the current snapshot without refreshing.
    pub fn resolve(&self, identifier: &str) -> Result<Instance, ResolveError> {
        self.snapshot().resolve(identifier).cloned()
    }

    /// Rebuilds the snapshot from the remote inventory and swaps it in.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<Arc<Snapshot>, DirectoryError> {
        let overview = self
            .transport
            .call(self.routes.route(Operation::Overview).request())
            .await;
        if !overview.is_success() {
            let reason = overview.error_message();
            self.log(
                LogLevel::Warn,
                "fleet.directory.no_nodes",
                json!({ "status": overview.status, "error": reason }),
            );
            return Err(DirectoryError::NoNodes(reason));
        }
        let raw = RawOverview::decode(overview.data.as_ref().unwrap_or(&serde_json::Value::Null));

        let nodes: Vec<Node> = raw
            .remote
            .iter()
            .filter_map(|node| {
                let id = non_empty(node.uuid.as_ref())?.to_string();
                let display_name = non_empty(node.remarks.as_ref())
                    .or_else(|| non_empty(node.ip.as_ref()))
                    .unwrap_or(UNNAMED_NODE)
                    .to_string();
                Some(Node { id, display_name })
            })
            .collect();
        if nodes.is_empty() {
            let reason = if raw.remote.is_empty() {
                "overview lists no nodes".to_string()
            } else {
                "overview lists nodes without ids".to_string()
            };
            self.log(
                LogLevel::Warn,
                "fleet.directory.no_nodes",
                json!({ "error": reason }),
            );
            return Err(DirectoryError::NoNodes(reason));
        }

        let route = self.routes.route(Operation::ListInstances);
        let mut discovered = Vec::new();
        let mut skipped = Vec::new();
        for node in &nodes {
            let request = route
                .node_request(&node.id)
                .query(&route.params.page, "1")
                .query(&route.params.page_size, self.page_size.to_string());
            let page = match self.transport.call(request).await.into_result() {
                Ok(data) => data,
                Err(err) => {
                    self.log(
                        LogLevel::Warn,
                        "fleet.directory.node_skipped",
                        json!({ "node": node.id, "error": err.to_string() }),
                    );
                    skipped.push(node.id.clone());
                    continue;
                }
            };
            for raw in InstancePage::decode(page) {
                let Some(unique_id) = non_empty(raw.instance_uuid.as_ref()) else {
                    self.log(
                        LogLevel::Warn,
                        "fleet.directory.instance_without_id",
                        json!({ "node": node.id, "name": raw.nickname() }),
                    );
                    continue;
                };
                discovered.push(DiscoveredInstance {
                    name: raw.nickname().unwrap_or(UNNAMED_INSTANCE).to_string(),
                    unique_id: unique_id.to_string(),
                    node_id: node.id.clone(),
                    status: InstanceStatus::from_code(raw.status_code()),
                });
            }
        }

        let snapshot = Arc::new(Snapshot::build(nodes, discovered, skipped));
        *self.snapshot.write() = Arc::clone(&snapshot);
        self.log(
            LogLevel::Info,
            "fleet.directory.refreshed",
            json!({
                "nodes": snapshot.nodes().len(),
                "instances": snapshot.len(),
                "ambiguous": snapshot.ambiguous_names().len(),
                "skipped_nodes": snapshot.skipped_nodes(),
            }),
        );
        if let Some(tel) = &self.telemetry {
            let _ = tel
                .event(
                    "fleet.directory.refreshed",
                    json!({ "nodes": snapshot.nodes().len(), "instances": snapshot.len() }),
                )
                .await;
        }
        Ok(snapshot)
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        } else if level >= LogLevel::Warn {
            tracing::warn!(%metadata, "{message}");
        }
    }
}
