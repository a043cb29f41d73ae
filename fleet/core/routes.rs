use std::{fmt, str::FromStr};

use anyhow::{bail, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::remote::RemoteRequest;

/// Logical operations the fleet issues against the management API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Panel overview, including the node list and per-node metrics.
    Overview,
    /// Paginated instance listing for one node.
    ListInstances,
    /// Open (start) an instance.
    Start,
    /// Stop an instance.
    Stop,
    /// Write a line to an instance console.
    SendCommand,
    /// Fetch the recent console output of an instance.
    OutputLog,
}

impl Operation {
    /// Every operation, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::Overview,
        Self::ListInstances,
        Self::Start,
        Self::Stop,
        Self::SendCommand,
        Self::OutputLog,
    ];

    /// Stable snake-case name, as used in configuration keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Overview => "overview",
            Self::ListInstances => "list_instances",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::SendCommand => "send_command",
            Self::OutputLog => "output_log",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|op| op.as_str() == s.trim())
            .ok_or_else(|| anyhow::anyhow!("unknown operation '{s}'"))
    }
}

/// HTTP verbs the remote client knows how to send.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE", try_from = "String")]
pub enum HttpMethod {
    /// HTTP GET.
    #[default]
    Get,
    /// HTTP POST.
    Post,
    /// HTTP PUT.
    Put,
    /// HTTP DELETE.
    Delete,
}

impl HttpMethod {
    /// Upper-case verb.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }

    /// Whether request parameters travel in a JSON body rather than the query.
    #[must_use]
    pub const fn carries_body(self) -> bool {
        matches!(self, Self::Post | Self::Put)
    }
}

impl FromStr for HttpMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            other => bail!("unsupported method '{other}'"),
        }
    }
}

impl TryFrom<String> for HttpMethod {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<HttpMethod> for reqwest::Method {
    fn from(value: HttpMethod) -> Self {
        match value {
            HttpMethod::Get => Self::GET,
            HttpMethod::Post => Self::POST,
            HttpMethod::Put => Self::PUT,
            HttpMethod::Delete => Self::DELETE,
        }
    }
}

/// Query-parameter names a route expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamNames {
    /// Node (daemon) identifier.
    #[serde(default = "default_node_param")]
    pub node: String,
    /// Instance unique identifier.
    #[serde(default = "default_instance_param")]
    pub instance: String,
    /// Console command text.
    #[serde(default = "default_command_param")]
    pub command: String,
    /// Page number for listings.
    #[serde(default = "default_page_param")]
    pub page: String,
    /// Page size for listings.
    #[serde(default = "default_page_size_param")]
    pub page_size: String,
}

impl Default for ParamNames {
    fn default() -> Self {
        Self {
            node: default_node_param(),
            instance: default_instance_param(),
            command: default_command_param(),
            page: default_page_param(),
            page_size: default_page_size_param(),
        }
    }
}

/// A single route: where an operation lives and how to call it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Endpoint path, with or without the `/api` prefix.
    pub path: String,
    /// HTTP verb.
    #[serde(default)]
    pub method: HttpMethod,
    /// Parameter names.
    #[serde(default)]
    pub params: ParamNames,
}

impl Route {
    /// GET route with default parameter names.
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method: HttpMethod::Get,
            params: ParamNames::default(),
        }
    }

    /// Starts a request against this route.
    #[must_use]
    pub fn request(&self) -> RemoteRequest {
        RemoteRequest::new(self.path.clone(), self.method.as_str())
    }

    /// Request addressed at one node.
    #[must_use]
    pub fn node_request(&self, node_id: &str) -> RemoteRequest {
        self.request().query(&self.params.node, node_id)
    }

    /// Request addressed at one instance on one node.
    #[must_use]
    pub fn instance_request(&self, node_id: &str, unique_id: &str) -> RemoteRequest {
        self.request()
            .query(&self.params.instance, unique_id)
            .query(&self.params.node, node_id)
    }
}

/// Named presets of the route table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteLayout {
    /// `/protected_instance/*` routes used by current panels.
    #[default]
    Protected,
    /// `/instance/*` routes used by older panels.
    Legacy,
}

impl RouteLayout {
    const fn instance_prefix(self) -> &'static str {
        match self {
            Self::Protected => "/protected_instance",
            Self::Legacy => "/instance",
        }
    }
}

/// Route table section of the configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutesConfig {
    /// Preset the table starts from.
    #[serde(default)]
    pub layout: RouteLayout,
    /// Per-operation replacements, keyed by operation name.
    #[serde(default)]
    pub overrides: IndexMap<String, Route>,
}

/// Mapping from operation to route.
#[derive(Debug, Clone)]
pub struct RouteTable {
    layout: RouteLayout,
    routes: IndexMap<Operation, Route>,
}

impl RouteTable {
    /// Builds the table for a preset layout.
    #[must_use]
    pub fn layout(layout: RouteLayout) -> Self {
        let prefix = layout.instance_prefix();
        let mut routes = IndexMap::new();
        routes.insert(Operation::Overview, Route::get("/overview"));
        routes.insert(
            Operation::ListInstances,
            Route::get("/service/remote_service_instances"),
        );
        routes.insert(Operation::Start, Route::get(format!("{prefix}/open")));
        routes.insert(Operation::Stop, Route::get(format!("{prefix}/stop")));
        routes.insert(Operation::SendCommand, Route::get(format!("{prefix}/command")));
        routes.insert(Operation::OutputLog, Route::get(format!("{prefix}/outputlog")));
        Self { layout, routes }
    }

    /// Builds the table from configuration, applying overrides on top of the preset.
    pub fn from_config(config: &RoutesConfig) -> Result<Self> {
        let mut table = Self::layout(config.layout);
        for (name, route) in &config.overrides {
            let operation: Operation = name.parse()?;
            if route.path.trim().is_empty() {
                bail!("route override for '{operation}' has an empty path");
            }
            table = table.with_route(operation, route.clone());
        }
        Ok(table)
    }

    /// Replaces a single route.
    #[must_use]
    pub fn with_route(mut self, operation: Operation, route: Route) -> Self {
        self.routes.insert(operation, route);
        self
    }

    /// Returns the route for an operation.
    #[must_use]
    pub fn route(&self, operation: Operation) -> &Route {
        // Every preset populates all operations and overrides only replace entries.
        &self.routes[&operation]
    }

    /// Preset this table was built from.
    #[must_use]
    pub const fn preset(&self) -> RouteLayout {
        self.layout
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::layout(RouteLayout::default())
    }
}

fn default_node_param() -> String {
    "daemonId".into()
}

fn default_instance_param() -> String {
    "uuid".into()
}

fn default_command_param() -> String {
    "command".into()
}

fn default_page_param() -> String {
    "page".into()
}

fn default_page_size_param() -> String {
    "page_size".into()
}
