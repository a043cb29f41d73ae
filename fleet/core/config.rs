use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::routes::RoutesConfig;

/// Top-level fleet configuration document.
#[derive(Debug, Clone, Default)]
pub struct FleetConfig {
    /// Management panel connection.
    pub panel: PanelSettings,
    /// Route layout and overrides.
    pub routes: RoutesConfig,
    /// Cooldown between lifecycle actions.
    pub cooldown: CooldownSettings,
    /// Instance discovery.
    pub directory: DirectorySettings,
    /// Console command handling.
    pub command: CommandSettings,
    /// Audit log and event sinks.
    pub telemetry: TelemetrySettings,
    /// Operator authorization.
    pub access: AccessSettings,
}

impl FleetConfig {
    /// Loads configuration from a TOML file. Relative paths resolve against
    /// the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading fleet config {}", path.display()))?;
        let source_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::parse(&raw, source_dir).with_context(|| format!("parsing {}", path.display()))
    }

    /// Parses a TOML document; relative paths resolve against `source_dir`.
    pub fn parse(raw: &str, source_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut document: FleetConfigSerde = toml::from_str(raw)?;
        let source_dir = source_dir.into();
        let resolve = |path: PathBuf| {
            if path.is_absolute() {
                path
            } else {
                source_dir.join(path)
            }
        };
        document.panel.url = document.panel.url.trim().trim_end_matches('/').to_string();
        document.telemetry.log_path = document.telemetry.log_path.map(resolve);
        document.telemetry.event_log = document.telemetry.event_log.map(resolve);
        document.access.operators_file = document.access.operators_file.map(resolve);
        Ok(Self {
            panel: document.panel,
            routes: document.routes,
            cooldown: document.cooldown,
            directory: document.directory,
            command: document.command,
            telemetry: document.telemetry,
            access: document.access,
        })
    }

    /// Checks the settings needed to talk to the panel.
    pub fn validate(&self) -> Result<()> {
        if self.panel.url.is_empty() {
            bail!("panel.url is required");
        }
        if !(self.panel.url.starts_with("http://") || self.panel.url.starts_with("https://")) {
            bail!("panel.url must be an http(s) URL, got '{}'", self.panel.url);
        }
        if self.panel.api_key.trim().is_empty() {
            bail!("panel.api_key is required");
        }
        if self.panel.timeout_secs == 0 {
            bail!("panel.timeout_secs must be positive");
        }
        if self.directory.page_size == 0 {
            bail!("directory.page_size must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct FleetConfigSerde {
    #[serde(default)]
    panel: PanelSettings,
    #[serde(default)]
    routes: RoutesConfig,
    #[serde(default)]
    cooldown: CooldownSettings,
    #[serde(default)]
    directory: DirectorySettings,
    #[serde(default)]
    command: CommandSettings,
    #[serde(default)]
    telemetry: TelemetrySettings,
    #[serde(default)]
    access: AccessSettings,
}

/// Panel endpoint and credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct PanelSettings {
    /// Base URL, e.g. `http://panel:23333`.
    #[serde(default)]
    pub url: String,
    /// API key sent as the `apikey` query parameter.
    #[serde(default)]
    pub api_key: String,
    /// Overall request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Connection timeout.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl PanelSettings {
    /// Overall request timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Connection timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for PanelSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: String::new(),
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Cooldown window.
#[derive(Debug, Clone, Deserialize)]
pub struct CooldownSettings {
    /// Seconds between start/stop actions on one instance.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl CooldownSettings {
    /// Window as a duration.
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for CooldownSettings {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
        }
    }
}

/// Instance discovery.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectorySettings {
    /// Page size requested from every node.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for DirectorySettings {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
        }
    }
}

/// Console command handling.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandSettings {
    /// Wait before fetching output after a command.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Characters of console output returned to the caller.
    #[serde(default = "default_output_tail_chars")]
    pub output_tail_chars: usize,
}

impl CommandSettings {
    /// Settle delay as a duration.
    #[must_use]
    pub const fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            output_tail_chars: default_output_tail_chars(),
        }
    }
}

/// Audit log and event sinks. Both are optional.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetrySettings {
    /// JSON-lines audit log.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// JSON-lines event log.
    #[serde(default)]
    pub event_log: Option<PathBuf>,
    /// Lowest level written to the audit log.
    #[serde(default = "default_log_level")]
    pub min_level: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_path: None,
            event_log: None,
            min_level: default_log_level(),
        }
    }
}

/// Who may drive the fleet.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccessSettings {
    /// Operator ids with admin rights.
    #[serde(default)]
    pub admins: Vec<String>,
    /// File holding the authorized operator list.
    #[serde(default)]
    pub operators_file: Option<PathBuf>,
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_connect_timeout_secs() -> u64 {
    10
}

const fn default_window_secs() -> u64 {
    10
}

const fn default_page_size() -> u32 {
    100
}

const fn default_settle_delay_ms() -> u64 {
    1_000
}

const fn default_output_tail_chars() -> usize {
    500
}

fn default_log_level() -> String {
    "info".into()
}
