#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms,
    missing_docs
)]

//! Fleet core – instance directory, panel client, cooldowns, and the command controller.

/// Telemetry builder for fleet operations.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Operation-to-endpoint route table.
#[path = "../routes.rs"]
pub mod routes;

/// Panel client producing normalized results.
#[path = "../remote.rs"]
pub mod remote;

#[path = "../payload.rs"]
mod payload;

/// Per-instance cooldown gate.
#[path = "../cooldown.rs"]
pub mod cooldown;

/// Node and instance inventory with identifier resolution.
#[path = "../directory.rs"]
pub mod directory;

/// Fleet health aggregation.
#[path = "../status.rs"]
pub mod status;

/// Operator authorization.
#[path = "../access.rs"]
pub mod access;

/// TOML configuration.
#[path = "../config.rs"]
pub mod config;

/// Command controller sequencing lookup, cooldown, and panel calls.
#[path = "../controller.rs"]
pub mod controller;

pub use access::{
    extract_operator_id, normalize_operator_id, AccessError, GrantOutcome, MemoryOperatorRegistry,
    OperatorRegistry,
};
pub use config::FleetConfig;
pub use controller::{
    ActionOutcome, ActionReport, CommandReport, FleetController, FleetControllerBuilder,
    FleetError, LifecycleAction,
};
pub use cooldown::{Clock, CooldownActive, CooldownGate, ManualClock, SystemClock};
pub use directory::{
    DirectoryError, Instance, InstanceDirectory, InstanceStatus, Node, ResolveError, Snapshot,
};
pub use remote::{
    NormalizedResult, RemoteClient, RemoteError, RemoteRequest, RemoteTransport,
    ScriptedTransport,
};
pub use routes::{HttpMethod, Operation, Route, RouteLayout, RouteTable};
pub use status::{summarize, FleetSummary, NodeSummary};
pub use telemetry::{FleetTelemetry, FleetTelemetryBuilder};
