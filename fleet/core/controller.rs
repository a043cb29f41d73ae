use std::{fmt, sync::Arc, time::Duration};

use anyhow::Context;
use serde::Serialize;
use serde_json::{json, Value};
use shared_logging::LogLevel;
use thiserror::Error;
use tracing::instrument;

use crate::{
    config::FleetConfig,
    cooldown::CooldownGate,
    directory::{DirectoryError, Instance, InstanceDirectory, ResolveError, Snapshot},
    remote::{RemoteClient, RemoteError, RemoteTransport},
    routes::{Operation, RouteTable},
    status::{summarize, FleetSummary},
    telemetry::FleetTelemetry,
};

const TRUNCATION_MARK: &str = "...";

/// Failures surfaced by [`FleetController`].
#[derive(Debug, Error)]
pub enum FleetError {
    /// The inventory could not be rebuilt.
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    /// The identifier did not name exactly one instance.
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    /// The panel call failed.
    #[error("{operation} failed: {source}")]
    Remote {
        /// Operation being attempted.
        operation: Operation,
        /// Underlying failure.
        #[source]
        source: RemoteError,
    },
    /// Console commands must contain text.
    #[error("command text is empty")]
    EmptyCommand,
}

impl FleetError {
    /// True for mistakes in operator input, as opposed to system faults.
    #[must_use]
    pub const fn is_user_error(&self) -> bool {
        matches!(self, Self::Resolve(_) | Self::EmptyCommand)
    }

    fn remote(operation: Operation, source: RemoteError) -> Self {
        Self::Remote { operation, source }
    }
}

/// Lifecycle actions subject to the cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    /// Open the instance.
    Start,
    /// Stop the instance.
    Stop,
}

impl LifecycleAction {
    const fn operation(self) -> Operation {
        match self {
            Self::Start => Operation::Start,
            Self::Stop => Operation::Stop,
        }
    }

    const fn event_type(self) -> &'static str {
        match self {
            Self::Start => "fleet.instance.started",
            Self::Stop => "fleet.instance.stopped",
        }
    }
}

impl fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Start => "start",
            Self::Stop => "stop",
        })
    }
}

/// How a lifecycle request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The panel accepted the request.
    Accepted,
    /// Refused locally; the instance was acted on too recently.
    CoolingDown {
        /// Time until the instance may be acted on again.
        remaining: Duration,
    },
}

/// Result of a start or stop request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionReport {
    /// Requested action.
    pub action: LifecycleAction,
    /// Resolved target.
    pub instance: Instance,
    /// What happened.
    pub outcome: ActionOutcome,
}

/// Result of a console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReport {
    /// Resolved target.
    pub instance: Instance,
    /// Command as sent.
    pub command: String,
    /// Tail of the console output, when it could be fetched.
    pub output: Option<String>,
}

/// Entry point for operator commands: resolves identifiers, applies the
/// cooldown and calls the panel.
pub struct FleetController {
    transport: Arc<dyn RemoteTransport>,
    routes: Arc<RouteTable>,
    directory: InstanceDirectory,
    cooldown: CooldownGate,
    settle_delay: Duration,
    output_tail_chars: usize,
    telemetry: Option<FleetTelemetry>,
}

impl fmt::Debug for FleetController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FleetController")
            .field("routes", &self.routes.preset())
            .field("directory", &self.directory)
            .field("cooldown", &self.cooldown.window())
            .finish_non_exhaustive()
    }
}

impl FleetController {
    /// Builder entry point.
    #[must_use]
    pub fn builder(transport: Arc<dyn RemoteTransport>) -> FleetControllerBuilder {
        FleetControllerBuilder::new(transport)
    }

    /// Wires an HTTP-backed controller from configuration.
    pub fn from_config(
        config: &FleetConfig,
        telemetry: Option<FleetTelemetry>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let client = RemoteClient::builder(&config.panel.url, &config.panel.api_key)
            .timeout(config.panel.timeout())
            .connect_timeout(config.panel.connect_timeout())
            .telemetry_opt(telemetry.clone())
            .build()?;
        let routes = RouteTable::from_config(&config.routes).context("loading route table")?;
        Ok(Self::builder(Arc::new(client))
            .routes(routes)
            .cooldown(CooldownGate::new(config.cooldown.window()))
            .page_size(config.directory.page_size)
            .settle_delay(config.command.settle_delay())
            .output_tail_chars(config.command.output_tail_chars)
            .telemetry_opt(telemetry)
            .build())
    }

    /// Instance directory.
    #[must_use]
    pub const fn directory(&self) -> &InstanceDirectory {
        &self.directory
    }

    /// Cooldown gate.
    #[must_use]
    pub const fn cooldown(&self) -> &CooldownGate {
        &self.cooldown
    }

    /// Current snapshot, without refreshing.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.directory.snapshot()
    }

    /// Rebuilds the inventory.
    pub async fn refresh(&self) -> Result<Arc<Snapshot>, FleetError> {
        Ok(self.directory.refresh().await?)
    }

    /// Refreshes and returns the numbered inventory.
    #[instrument(skip(self))]
    pub async fn list(&self) -> Result<Arc<Snapshot>, FleetError> {
        self.refresh().await
    }

    /// Starts an instance.
    pub async fn start(&self, identifier: &str) -> Result<ActionReport, FleetError> {
        self.lifecycle(LifecycleAction::Start, identifier).await
    }

    /// Stops an instance.
    pub async fn stop(&self, identifier: &str) -> Result<ActionReport, FleetError> {
        self.lifecycle(LifecycleAction::Stop, identifier).await
    }

    #[instrument(skip(self))]
    async fn lifecycle(
        &self,
        action: LifecycleAction,
        identifier: &str,
    ) -> Result<ActionReport, FleetError> {
        let instance = self.directory.resolve(identifier)?;
        let claim = match self.cooldown.try_claim(&instance.unique_id) {
            Ok(claim) => claim,
            Err(active) => {
                return Ok(ActionReport {
                    action,
                    instance,
                    outcome: ActionOutcome::CoolingDown {
                        remaining: active.remaining,
                    },
                });
            }
        };

        let operation = action.operation();
        let request = self
            .routes
            .route(operation)
            .instance_request(&instance.node_id, &instance.unique_id);
        if let Err(err) = self.transport.call(request).await.into_result() {
            // The claim is dropped here, so no cooldown starts.
            self.log(
                LogLevel::Error,
                "fleet.instance.action_failed",
                json!({ "action": action, "uuid": instance.unique_id, "error": err.to_string() }),
            );
            return Err(FleetError::remote(operation, err));
        }
        claim.commit();

        let payload = instance_payload(&instance);
        self.log(LogLevel::Info, action.event_type(), payload.clone());
        self.emit(action.event_type(), payload).await;
        Ok(ActionReport {
            action,
            instance,
            outcome: ActionOutcome::Accepted,
        })
    }

    /// Writes a line to an instance console and returns the recent output.
    ///
    /// Not subject to the cooldown. A failed output fetch leaves `output` empty.
    #[instrument(skip(self, text))]
    pub async fn send_command(
        &self,
        identifier: &str,
        text: &str,
    ) -> Result<CommandReport, FleetError> {
        let command = text.trim();
        if command.is_empty() {
            return Err(FleetError::EmptyCommand);
        }
        let instance = self.directory.resolve(identifier)?;

        let route = self.routes.route(Operation::SendCommand);
        let request = route.instance_request(&instance.node_id, &instance.unique_id);
        let request = if route.method.carries_body() {
            let mut body = serde_json::Map::new();
            body.insert(route.params.command.clone(), Value::String(command.to_string()));
            request.body(Value::Object(body))
        } else {
            request.query(&route.params.command, command)
        };
        if let Err(err) = self.transport.call(request).await.into_result() {
            self.log(
                LogLevel::Error,
                "fleet.instance.command_failed",
                json!({ "uuid": instance.unique_id, "error": err.to_string() }),
            );
            return Err(FleetError::remote(Operation::SendCommand, err));
        }

        let mut payload = instance_payload(&instance);
        payload["command"] = Value::String(command.to_string());
        self.log(LogLevel::Info, "fleet.instance.command", payload.clone());
        self.emit("fleet.instance.command", payload).await;

        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }
        let output = self.fetch_output(&instance).await;
        Ok(CommandReport {
            instance,
            command: command.to_string(),
            output,
        })
    }

    async fn fetch_output(&self, instance: &Instance) -> Option<String> {
        let request = self
            .routes
            .route(Operation::OutputLog)
            .instance_request(&instance.node_id, &instance.unique_id);
        match self.transport.call(request).await.into_result() {
            Ok(Value::String(text)) if !text.is_empty() => {
                Some(tail_chars(&text, self.output_tail_chars))
            }
            Ok(_) => None,
            Err(err) => {
                self.log(
                    LogLevel::Warn,
                    "fleet.instance.output_unavailable",
                    json!({ "uuid": instance.unique_id, "error": err.to_string() }),
                );
                None
            }
        }
    }

    /// Fleet-wide health from the panel overview.
    #[instrument(skip(self))]
    pub async fn status(&self) -> Result<FleetSummary, FleetError> {
        let result = self
            .transport
            .call(self.routes.route(Operation::Overview).request())
            .await;
        let time = result.time;
        let data = result
            .into_result()
            .map_err(|err| FleetError::remote(Operation::Overview, err))?;
        Ok(summarize(&data).with_panel_time(time))
    }

    fn log(&self, level: LogLevel, message: &str, metadata: Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }

    async fn emit(&self, event_type: &str, payload: Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.event(event_type, payload).await;
        }
    }
}

fn instance_payload(instance: &Instance) -> Value {
    json!({
        "uuid": instance.unique_id,
        "name": instance.name,
        "node": instance.node_id,
    })
}

/// Last `limit` characters of `text`, marked when cut.
fn tail_chars(text: &str, limit: usize) -> String {
    let count = text.chars().count();
    if count <= limit {
        return text.to_string();
    }
    let tail: String = text.chars().skip(count - limit).collect();
    format!("{TRUNCATION_MARK}{tail}")
}

/// Builder for [`FleetController`].
pub struct FleetControllerBuilder {
    transport: Arc<dyn RemoteTransport>,
    routes: RouteTable,
    cooldown: CooldownGate,
    page_size: Option<u32>,
    settle_delay: Duration,
    output_tail_chars: usize,
    telemetry: Option<FleetTelemetry>,
}

impl FleetControllerBuilder {
    fn new(transport: Arc<dyn RemoteTransport>) -> Self {
        Self {
            transport,
            routes: RouteTable::default(),
            cooldown: CooldownGate::default(),
            page_size: None,
            settle_delay: Duration::from_secs(1),
            output_tail_chars: 500,
            telemetry: None,
        }
    }

    /// Sets the route table.
    #[must_use]
    pub fn routes(mut self, routes: RouteTable) -> Self {
        self.routes = routes;
        self
    }

    /// Sets the cooldown gate.
    #[must_use]
    pub fn cooldown(mut self, cooldown: CooldownGate) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Sets the listing page size.
    #[must_use]
    pub const fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Wait between sending a command and reading its output.
    #[must_use]
    pub const fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Characters of console output kept in command reports.
    #[must_use]
    pub const fn output_tail_chars(mut self, chars: usize) -> Self {
        self.output_tail_chars = chars;
        self
    }

    /// Sets telemetry optionally.
    #[must_use]
    pub fn telemetry_opt(mut self, telemetry: Option<FleetTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Builds the controller.
    #[must_use]
    pub fn build(self) -> FleetController {
        let routes = Arc::new(self.routes);
        let mut directory = InstanceDirectory::new(Arc::clone(&self.transport), Arc::clone(&routes))
            .with_telemetry(self.telemetry.clone());
        if let Some(page_size) = self.page_size {
            directory = directory.page_size(page_size);
        }
        FleetController {
            transport: self.transport,
            routes,
            directory,
            cooldown: self.cooldown,
            settle_delay: self.settle_delay,
            output_tail_chars: self.output_tail_chars,
            telemetry: self.telemetry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cooldown::{ManualClock, DEFAULT_COOLDOWN},
        remote::{NormalizedResult, ScriptedTransport},
        routes::{HttpMethod, Route, RouteLayout},
    };
    use serde_json::json;
    use shared_event_bus::EventBacklog;

    const LIST: &str = "/service/remote_service_instances";
    const OPEN: &str = "/protected_instance/open";
    const STOP: &str = "/protected_instance/stop";
    const COMMAND: &str = "/protected_instance/command";
    const OUTPUT: &str = "/protected_instance/outputlog";

    fn inventory() -> ScriptedTransport {
        ScriptedTransport::new()
            .respond(
                "/overview",
                NormalizedResult::ok(json!({ "remote": [{ "uuid": "n1", "remarks": "alpha" }] })),
            )
            .respond(
                LIST,
                NormalizedResult::ok(json!({ "data": [
                    { "instanceUuid": "u1", "config": { "nickname": "Lobby" }, "status": 0 },
                    { "instanceUuid": "u2", "config": { "nickname": "Survival" }, "status": 3 }
                ] })),
            )
    }

    fn controller(transport: &ScriptedTransport) -> (FleetController, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let controller = FleetController::builder(Arc::new(transport.clone()))
            .cooldown(CooldownGate::with_clock(DEFAULT_COOLDOWN, clock.clone()))
            .settle_delay(Duration::ZERO)
            .build();
        (controller, clock)
    }

    #[tokio::test]
    async fn start_is_gated_by_cooldown() {
        let transport = inventory().respond(OPEN, NormalizedResult::ok(Value::Null));
        let (controller, clock) = controller(&transport);
        controller.list().await.unwrap();

        let first = controller.start("Lobby").await.unwrap();
        assert_eq!(first.outcome, ActionOutcome::Accepted);
        assert_eq!(first.instance.unique_id, "u1");
        let call = &transport.calls_to(OPEN)[0];
        assert_eq!(call.param("uuid"), Some("u1"));
        assert_eq!(call.param("daemonId"), Some("n1"));

        let second = controller.start("1").await.unwrap();
        assert!(matches!(second.outcome, ActionOutcome::CoolingDown { .. }));
        assert_eq!(transport.calls_to(OPEN).len(), 1);

        clock.advance(DEFAULT_COOLDOWN);
        let third = controller.start("u1").await.unwrap();
        assert_eq!(third.outcome, ActionOutcome::Accepted);
        assert_eq!(transport.calls_to(OPEN).len(), 2);
    }

    #[tokio::test]
    async fn failed_stop_does_not_start_cooldown() {
        let transport = inventory().respond(
            STOP,
            NormalizedResult::remote_error(500, "daemon busy"),
        );
        let (controller, _clock) = controller(&transport);
        controller.refresh().await.unwrap();

        let err = controller.stop("Survival").await.unwrap_err();
        assert!(matches!(
            err,
            FleetError::Remote { operation: Operation::Stop, source: RemoteError::Api { status: 500, .. } }
        ));
        assert!(!err.is_user_error());
        assert!(!controller.cooldown().is_cooling("u2"));
    }

    #[tokio::test]
    async fn unknown_identifiers_are_user_errors() {
        let transport = inventory();
        let (controller, _clock) = controller(&transport);
        let stale = controller.start("Lobby").await.unwrap_err();
        assert!(matches!(stale, FleetError::Resolve(ResolveError::NotFound(_))));

        controller.refresh().await.unwrap();
        let err = controller.stop("7").await.unwrap_err();
        assert!(err.is_user_error());
        assert!(transport.calls_to(STOP).is_empty());
    }

    #[tokio::test]
    async fn command_returns_output_tail_without_cooldown() {
        let log = format!("{}DONE", "x".repeat(600));
        let transport = inventory()
            .respond(COMMAND, NormalizedResult::ok(Value::Null))
            .respond(OUTPUT, NormalizedResult::ok(Value::String(log)));
        let (controller, _clock) = controller(&transport);
        controller.refresh().await.unwrap();

        let report = controller.send_command("2", "  say hello world ").await.unwrap();
        assert_eq!(report.command, "say hello world");
        let output = report.output.unwrap();
        assert!(output.starts_with("..."));
        assert!(output.ends_with("DONE"));
        assert_eq!(output.chars().count(), 503);
        assert_eq!(
            transport.calls_to(COMMAND)[0].param("command"),
            Some("say hello world")
        );

        controller.send_command("2", "list").await.unwrap();
        assert_eq!(transport.calls_to(COMMAND).len(), 2);
        assert!(!controller.cooldown().is_cooling("u2"));
    }

    #[tokio::test]
    async fn command_survives_missing_output() {
        let transport = inventory()
            .respond(COMMAND, NormalizedResult::ok(Value::Null))
            .respond(OUTPUT, NormalizedResult::transport_error(504, "read timeout"));
        let (controller, _clock) = controller(&transport);
        controller.refresh().await.unwrap();
        let report = controller.send_command("Lobby", "save-all").await.unwrap();
        assert_eq!(report.output, None);

        assert!(matches!(
            controller.send_command("Lobby", "   ").await,
            Err(FleetError::EmptyCommand)
        ));
    }

    #[tokio::test]
    async fn status_summarizes_overview() {
        let mut overview = NormalizedResult::ok(json!({
            "version": "10.2.1",
            "remoteCount": { "available": 1, "total": 1 },
            "remote": [{ "uuid": "n1", "available": true, "system": { "cpuUsage": 1.4 }, "instance": { "running": 1, "total": 2 } }]
        }));
        overview.time = Some(1_700_000_000_000);
        let transport = ScriptedTransport::new().respond("/overview", overview);
        let (controller, _clock) = controller(&transport);
        let summary = controller.status().await.unwrap();
        assert_eq!(summary.instance_count_running, 1);
        assert_eq!(summary.per_node[0].cpu_fraction, 1.4);
        assert!(summary.panel_time.is_some());

        let down = ScriptedTransport::new()
            .respond("/overview", NormalizedResult::transport_error(504, "connect timeout"));
        let (controller, _clock) = super::tests::controller(&down);
        assert!(matches!(
            controller.status().await,
            Err(FleetError::Remote { operation: Operation::Overview, .. })
        ));
    }

    #[tokio::test]
    async fn lifecycle_events_are_published() {
        let backlog = Arc::new(EventBacklog::new(16));
        let telemetry = FleetTelemetry::builder("fleet")
            .event_sink(backlog.clone())
            .build()
            .unwrap();
        let transport = inventory().respond(STOP, NormalizedResult::ok(Value::Null));
        let controller = FleetController::builder(Arc::new(transport))
            .settle_delay(Duration::ZERO)
            .telemetry_opt(Some(telemetry))
            .build();
        controller.refresh().await.unwrap();
        controller.stop("Survival").await.unwrap();

        assert_eq!(backlog.of_kind("fleet.directory.refreshed").len(), 1);
        let stopped = backlog.of_kind("fleet.instance.stopped");
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].instance.as_deref(), Some("u2"));
        assert_eq!(backlog.for_instance("u2").len(), 1);
    }

    #[tokio::test]
    async fn legacy_layout_with_post_override() {
        let routes = RouteTable::layout(RouteLayout::Legacy).with_route(
            Operation::SendCommand,
            Route {
                method: HttpMethod::Post,
                ..Route::get("/instance/command")
            },
        );
        let transport = inventory()
            .respond("/instance/command", NormalizedResult::ok(Value::Null))
            .respond("/instance/outputlog", NormalizedResult::ok(json!("ok")));
        let controller = FleetController::builder(Arc::new(transport.clone()))
            .routes(routes)
            .settle_delay(Duration::ZERO)
            .build();
        controller.refresh().await.unwrap();
        let report = controller.send_command("Lobby", "help").await.unwrap();
        assert_eq!(report.output.as_deref(), Some("ok"));
        let sent = &transport.calls_to("/instance/command")[0];
        assert_eq!(sent.method, "POST");
        assert_eq!(sent.body, Some(json!({ "command": "help" })));
        assert_eq!(sent.param("command"), None);
        assert_eq!(sent.param("uuid"), Some("u1"));
    }

    #[test]
    fn tail_counts_characters() {
        assert_eq!(tail_chars("short", 10), "short");
        assert_eq!(tail_chars("ééééé", 2), "...éé");
    }
}
