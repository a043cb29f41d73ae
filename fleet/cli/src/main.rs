use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fleet_core::{
    access::{ensure_authorized, grant, revoke},
    FleetConfig, FleetController, FleetTelemetry, GrantOutcome, MemoryOperatorRegistry,
    OperatorRegistry,
};
use serde_json::json;
use shared_event_bus::{tail_events, EventLog};
use shared_logging::{read_tail, LogLevel};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    runtime::Runtime,
};
use tracing_subscriber::EnvFilter;

mod operators;
mod render;

use operators::FileOperatorRegistry;

const DEFAULT_CONFIG: &str = "fleet.toml";

#[derive(Parser, Debug)]
#[command(name = "fleet", version, about = "Operate MCSManager instances across nodes")]
struct Cli {
    /// Configuration file; `fleet.toml` in the working directory when present.
    #[arg(long, short, env = "FLEET_CONFIG")]
    config: Option<PathBuf>,
    /// Panel base URL, overriding the configuration.
    #[arg(long, env = "FLEET_PANEL_URL")]
    panel_url: Option<String>,
    /// Panel API key, overriding the configuration.
    #[arg(long, env = "FLEET_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    /// Operator id issuing the command.
    #[arg(long, env = "FLEET_OPERATOR")]
    operator: Option<String>,
    /// Diagnostic log filter written to stderr.
    #[arg(long, default_value = "warn")]
    log_filter: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Commands {
    /// Refreshes and prints the numbered instance list.
    List {
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Starts an instance by number, name or uuid.
    Start { identifier: String },
    /// Stops an instance by number, name or uuid.
    Stop { identifier: String },
    /// Sends a console command and prints the recent output.
    Cmd {
        identifier: String,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Prints panel and node health.
    Status {
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Authorizes an operator (admins only).
    Op { user: String },
    /// Withdraws an operator (admins only).
    Deop { user: String },
    /// Interactive session keeping the instance list between commands.
    Repl,
    /// Prints the most recent audit records.
    Audit {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Show lifecycle events instead of the audit log.
        #[arg(long)]
        events: bool,
    },
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::List { .. } => "list",
            Self::Start { .. } => "start",
            Self::Stop { .. } => "stop",
            Self::Cmd { .. } => "cmd",
            Self::Status { .. } => "status",
            Self::Op { .. } => "op",
            Self::Deop { .. } => "deop",
            Self::Repl => "repl",
            Self::Audit { .. } => "audit",
        }
    }
}

/// One line typed at the `repl` prompt.
#[derive(Parser, Debug)]
#[command(no_binary_name = true, disable_version_flag = true)]
struct ReplLine {
    #[command(subcommand)]
    command: Commands,
}

/// Splits a REPL line into words. Console text after `cmd <identifier>` is kept verbatim.
fn repl_words(line: &str) -> Vec<&str> {
    let mut words = Vec::new();
    let mut rest = line.trim();
    while !rest.is_empty() {
        if words.len() == 2 && words[0] == "cmd" {
            words.push(rest);
            break;
        }
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        words.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    words
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_filter)?;
    let runtime = Runtime::new().context("starting tokio runtime")?;
    runtime.block_on(run(cli))
}

fn init_tracing(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(filter)
        .or_else(|_| EnvFilter::try_new("warn"))
        .context("initializing log filter")?;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(
        cli.config.as_deref(),
        cli.panel_url.as_deref(),
        cli.api_key.as_deref(),
    )?;
    if let Commands::Audit { limit, events } = cli.command {
        println!("{}", audit_report(&config, limit, events)?);
        return Ok(());
    }

    let registry = open_registry(&config)?;
    let telemetry = build_telemetry(&config)?;
    let controller = FleetController::from_config(&config, Some(telemetry.clone()))?;
    let session = Session {
        controller,
        registry,
        operator: cli.operator,
        telemetry: Some(telemetry),
    };

    if cli.command == Commands::Repl {
        return session.repl().await;
    }
    let output = session.execute(&cli.command, true).await?;
    println!("{output}");
    Ok(())
}

fn load_config(
    path: Option<&Path>,
    panel_url: Option<&str>,
    api_key: Option<&str>,
) -> Result<FleetConfig> {
    let mut config = match path {
        Some(path) => FleetConfig::load(path)?,
        None if Path::new(DEFAULT_CONFIG).exists() => FleetConfig::load(DEFAULT_CONFIG)?,
        None => FleetConfig::default(),
    };
    if let Some(url) = panel_url {
        config.panel.url = url.trim().trim_end_matches('/').to_string();
    }
    if let Some(key) = api_key {
        config.panel.api_key = key.to_string();
    }
    Ok(config)
}

fn audit_report(config: &FleetConfig, limit: usize, events: bool) -> Result<String> {
    let settings = &config.telemetry;
    if events {
        let path = settings
            .event_log
            .as_ref()
            .context("telemetry.event_log is not configured")?;
        return Ok(render::render_events(&tail_events(path, limit)?));
    }
    let path = settings
        .log_path
        .as_ref()
        .context("telemetry.log_path is not configured")?;
    Ok(render::render_audit(&read_tail(path, limit)?))
}

/// No admins and no operator file means access control is off.
fn open_registry(config: &FleetConfig) -> Result<Option<Arc<dyn OperatorRegistry>>> {
    let access = &config.access;
    let registry: Arc<dyn OperatorRegistry> = match &access.operators_file {
        Some(path) => Arc::new(FileOperatorRegistry::load(path, &access.admins)?),
        None if access.admins.is_empty() => return Ok(None),
        None => Arc::new(MemoryOperatorRegistry::new(access.admins.iter().cloned())),
    };
    Ok(Some(registry))
}

fn build_telemetry(config: &FleetConfig) -> Result<FleetTelemetry> {
    let settings = &config.telemetry;
    let mut builder = FleetTelemetry::builder("fleet").min_level(settings.min_level.parse()?);
    if let Some(path) = &settings.log_path {
        builder = builder.log_path(path);
    }
    if let Some(path) = &settings.event_log {
        builder = builder.event_sink(Arc::new(EventLog::open(path)?));
    }
    builder.build()
}

struct Session {
    controller: FleetController,
    registry: Option<Arc<dyn OperatorRegistry>>,
    operator: Option<String>,
    telemetry: Option<FleetTelemetry>,
}

impl Session {
    fn operator(&self) -> Result<&str> {
        self.operator
            .as_deref()
            .context("an operator id is required (--operator or FLEET_OPERATOR)")
    }

    fn authorize(&self) -> Result<()> {
        if let Some(registry) = &self.registry {
            ensure_authorized(registry.as_ref(), self.operator()?)?;
        }
        Ok(())
    }

    fn audit(&self, command: &Commands) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(
                LogLevel::Info,
                "fleet.cli.command",
                json!({ "command": command.name(), "operator": self.operator }),
            );
        }
    }

    /// Checks the operator and records the command in the audit log.
    fn admit(&self, command: &Commands) -> Result<()> {
        self.authorize()?;
        self.audit(command);
        Ok(())
    }

    /// Runs one command; `refresh` rebuilds the instance list before lookups.
    async fn execute(&self, command: &Commands, refresh: bool) -> Result<String> {
        tracing::debug!(command = command.name(), refresh, "dispatching");
        match command {
            Commands::Op { user } => self.change_access(user, true),
            Commands::Deop { user } => self.change_access(user, false),
            Commands::Repl => bail!("already in an interactive session"),
            Commands::Audit { .. } => bail!("audit is only available as a top-level command"),
            Commands::List { json } => {
                self.admit(command)?;
                let snapshot = self.controller.list().await?;
                Ok(if *json {
                    serde_json::to_string_pretty(snapshot.instances())?
                } else {
                    render::render_list(&snapshot)
                })
            }
            Commands::Start { identifier } => {
                self.admit(command)?;
                self.prepare(refresh).await?;
                Ok(render::render_action(&self.controller.start(identifier).await?))
            }
            Commands::Stop { identifier } => {
                self.admit(command)?;
                self.prepare(refresh).await?;
                Ok(render::render_action(&self.controller.stop(identifier).await?))
            }
            Commands::Cmd {
                identifier,
                command: words,
            } => {
                self.admit(command)?;
                self.prepare(refresh).await?;
                let report = self
                    .controller
                    .send_command(identifier, &words.join(" "))
                    .await?;
                Ok(render::render_command(&report))
            }
            Commands::Status { json } => {
                self.admit(command)?;
                let summary = self.controller.status().await?;
                Ok(if *json {
                    serde_json::to_string_pretty(&summary)?
                } else {
                    render::render_status(&summary)
                })
            }
        }
    }

    async fn prepare(&self, refresh: bool) -> Result<()> {
        if refresh {
            self.controller.refresh().await?;
        }
        Ok(())
    }

    fn change_access(&self, user: &str, authorize: bool) -> Result<String> {
        let registry = self
            .registry
            .as_ref()
            .context("access control is disabled; configure access.admins first")?;
        let actor = self.operator()?;
        let (id, outcome) = if authorize {
            grant(registry.as_ref(), actor, user)?
        } else {
            revoke(registry.as_ref(), actor, user)?
        };
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(
                LogLevel::Info,
                if authorize { "fleet.access.granted" } else { "fleet.access.revoked" },
                json!({ "operator": id, "by": actor, "changed": outcome == GrantOutcome::Changed }),
            );
        }
        Ok(match (authorize, outcome) {
            (true, GrantOutcome::Changed) => format!("operator {id} authorized"),
            (true, GrantOutcome::Unchanged) => format!("operator {id} is already authorized"),
            (false, GrantOutcome::Changed) => format!("operator {id} removed"),
            (false, GrantOutcome::Unchanged) => format!("operator {id} was not authorized"),
        })
    }

    async fn repl(&self) -> Result<()> {
        match self.execute(&Commands::List { json: false }, false).await {
            Ok(listing) => println!("{listing}"),
            Err(err) => eprintln!("error: {err:#}"),
        }
        println!("type a command (list, start, stop, cmd, status, op, deop) or 'quit'");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if matches!(line, "quit" | "exit") {
                break;
            }
            let parsed = match ReplLine::try_parse_from(repl_words(line)) {
                Ok(parsed) => parsed,
                Err(err) => {
                    eprintln!("{err}");
                    continue;
                }
            };
            match self.execute(&parsed.command, false).await {
                Ok(output) => println!("{output}"),
                Err(err) => eprintln!("error: {err:#}"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{NormalizedResult, ScriptedTransport};
    use serde_json::Value;
    use std::time::Duration;
    use tempfile::tempdir;

    fn transport() -> ScriptedTransport {
        ScriptedTransport::new()
            .respond(
                "/overview",
                NormalizedResult::ok(json!({ "remote": [{ "uuid": "n1", "remarks": "alpha" }] })),
            )
            .respond(
                "/service/remote_service_instances",
                NormalizedResult::ok(json!([
                    { "instanceUuid": "u1", "config": { "nickname": "Lobby" }, "status": 3 }
                ])),
            )
            .respond("/protected_instance/open", NormalizedResult::ok(Value::Null))
    }

    fn session(registry: Option<Arc<dyn OperatorRegistry>>, operator: Option<&str>) -> Session {
        let controller = FleetController::builder(Arc::new(transport()))
            .settle_delay(Duration::ZERO)
            .build();
        Session {
            controller,
            registry,
            operator: operator.map(str::to_string),
            telemetry: None,
        }
    }

    #[test]
    fn cmd_collects_trailing_words() {
        let cli = Cli::try_parse_from(["fleet", "cmd", "2", "say", "-hello", "world"]).unwrap();
        assert_eq!(
            cli.command,
            Commands::Cmd {
                identifier: "2".into(),
                command: vec!["say".into(), "-hello".into(), "world".into()],
            }
        );
        assert!(Cli::try_parse_from(["fleet", "cmd", "2"]).is_err());
        let line = ReplLine::try_parse_from(repl_words("stop   Lobby")).unwrap();
        assert_eq!(line.command, Commands::Stop { identifier: "Lobby".into() });
    }

    #[test]
    fn repl_keeps_console_text_verbatim() {
        assert_eq!(repl_words("  cmd 1 say  a   b "), ["cmd", "1", "say  a   b"]);
        assert_eq!(repl_words("start\tLobby"), ["start", "Lobby"]);
        assert!(repl_words("   ").is_empty());
        let line = ReplLine::try_parse_from(repl_words("cmd 1 say  a   b")).unwrap();
        assert_eq!(
            line.command,
            Commands::Cmd {
                identifier: "1".into(),
                command: vec!["say  a   b".into()],
            }
        );
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fleet.toml");
        std::fs::write(&path, "[panel]\nurl = \"http://old\"\napi_key = \"old\"\n").unwrap();
        let config = load_config(Some(&path), Some("http://new:23333/"), None).unwrap();
        assert_eq!(config.panel.url, "http://new:23333");
        assert_eq!(config.panel.api_key, "old");
    }

    #[tokio::test]
    async fn audit_reads_configured_logs() {
        let dir = tempdir().unwrap();
        let mut config = FleetConfig::default();
        assert!(audit_report(&config, 5, false).is_err());

        config.telemetry.log_path = Some(dir.path().join("audit.jsonl"));
        config.telemetry.event_log = Some(dir.path().join("events.jsonl"));
        let telemetry = build_telemetry(&config).unwrap();
        telemetry
            .log(LogLevel::Info, "fleet.cli.command", json!({ "command": "list" }))
            .unwrap();
        telemetry
            .event("fleet.instance.started", json!({ "uuid": "u1", "name": "Lobby" }))
            .await
            .unwrap();

        assert!(audit_report(&config, 5, false)
            .unwrap()
            .contains("fleet.cli.command"));
        let events = audit_report(&config, 5, true).unwrap();
        assert!(events.contains("fleet.instance.started"));
        assert!(events.contains("Lobby"));
    }

    #[test]
    fn registry_is_optional() {
        let config = FleetConfig::default();
        assert!(open_registry(&config).unwrap().is_none());

        let dir = tempdir().unwrap();
        let mut config = FleetConfig::default();
        config.access.admins = vec!["1".into()];
        assert!(open_registry(&config).unwrap().is_some());
        config.access.operators_file = Some(dir.path().join("operators.toml"));
        let registry = open_registry(&config).unwrap().unwrap();
        assert!(registry.is_admin("1"));
    }

    #[tokio::test]
    async fn one_shot_start_refreshes_first() {
        let session = session(None, None);
        let output = session
            .execute(&Commands::Start { identifier: "Lobby".into() }, true)
            .await
            .unwrap();
        assert_eq!(output, "start sent to Lobby");
    }

    #[tokio::test]
    async fn unauthorized_operator_is_refused() {
        let registry: Arc<dyn OperatorRegistry> = Arc::new(MemoryOperatorRegistry::new(["1"]));
        let outsider = session(Some(registry.clone()), Some("99"));
        assert!(outsider
            .execute(&Commands::List { json: false }, true)
            .await
            .is_err());
        assert!(outsider.change_access("99", true).is_err());

        let admin = session(Some(registry.clone()), Some("1"));
        assert_eq!(
            admin.change_access("[CQ:at,qq=99]", true).unwrap(),
            "operator 99 authorized"
        );
        let listing = outsider
            .execute(&Commands::List { json: false }, true)
            .await
            .unwrap();
        assert!(listing.contains("[1] [running ] Lobby"));
        assert_eq!(
            admin.change_access("not-a-user", false).unwrap_err().to_string(),
            "'not-a-user' is not a valid operator id or mention"
        );
    }
}
