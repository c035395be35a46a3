use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Environment variable overriding `session.interval` (whole seconds).
pub const ENV_INTERVAL: &str = "POOLSCOPE_INTERVAL";
/// Environment variable overriding `publish.node_name`.
pub const ENV_NODE_NAME: &str = "POOLSCOPE_NODE_NAME";
/// Environment variable overriding `publish.transport_override`.
pub const ENV_TRANSPORT_OVERRIDE: &str = "POOLSCOPE_TRANSPORT_OVERRIDE";
/// Environment variable overriding `publish.socket`.
pub const ENV_SOCKET: &str = "POOLSCOPE_SOCKET";
/// Environment variable selecting command capture: the program followed by
/// its whitespace-separated arguments.
pub const ENV_CAPTURE_COMMAND: &str = "POOLSCOPE_CAPTURE_COMMAND";

/// Top-level configuration for the poolscope agent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Capture session timing and buffering.
    #[serde(default)]
    pub session: SessionConfig,

    /// Event source selection.
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Metric publishing configuration.
    #[serde(default)]
    pub publish: PublishConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Capture session timing.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Aggregation window length. Must be whole seconds. Default: 60s.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Windows per capture session before a clean restart. Default: 50.
    #[serde(default = "default_max_intervals")]
    pub max_intervals: u32,

    /// Pause before restarting a session that ended before its window
    /// limit. Default: 1s.
    #[serde(default = "default_restart_delay", with = "humantime_serde")]
    pub restart_delay: Duration,

    /// Capacity of the capture event channel. Default: 4096.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

/// Which capture implementation feeds the sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureKind {
    /// Spawn an external tracing command and parse its stdout.
    #[default]
    Command,
    /// Deterministic generator for debugging and demos.
    Synthetic,
}

/// Event source configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub kind: CaptureKind,

    #[serde(default)]
    pub command: CommandCaptureConfig,

    #[serde(default)]
    pub synthetic: SyntheticCaptureConfig,
}

/// External tracing command.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandCaptureConfig {
    /// Executable to spawn. Required when `capture.kind` is `command`.
    #[serde(default)]
    pub program: String,

    /// Arguments passed to the program.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Synthetic generator shape.
#[derive(Debug, Clone, Deserialize)]
pub struct SyntheticCaptureConfig {
    /// Default: 200.
    #[serde(default = "default_events_per_second")]
    pub events_per_second: u32,

    /// Default: 2.
    #[serde(default = "default_pools")]
    pub pools: usize,

    /// Default: 3.
    #[serde(default = "default_datasets_per_pool")]
    pub datasets_per_pool: usize,
}

/// Metric publishing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PublishConfig {
    /// Host component of every metric path. Default: local host name.
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// collectd unixsock path. Default: "/var/run/collectd-unixsock".
    #[serde(default = "default_socket")]
    pub socket: PathBuf,

    /// Bypass the socket: "-" or "stdout" for standard output, anything
    /// else is run with `sh -c` and fed the records on stdin.
    #[serde(default)]
    pub transport_override: String,

    /// Windows buffered ahead of the writer. Default: 4.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Budget for writing one window. Default: 10s.
    #[serde(default = "default_export_timeout", with = "humantime_serde")]
    pub export_timeout: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_max_intervals() -> u32 {
    50
}

fn default_restart_delay() -> Duration {
    Duration::ZERO
}

fn default_event_buffer() -> usize {
    4096
}

fn default_events_per_second() -> u32 {
    200
}

fn default_pools() -> usize {
    2
}

fn default_datasets_per_pool() -> usize {
    3
}

fn default_node_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn default_socket() -> PathBuf {
    PathBuf::from("/var/run/collectd-unixsock")
}

fn default_queue_size() -> usize {
    4
}

fn default_export_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            max_intervals: default_max_intervals(),
            restart_delay: default_restart_delay(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl Default for SyntheticCaptureConfig {
    fn default() -> Self {
        Self {
            events_per_second: default_events_per_second(),
            pools: default_pools(),
            datasets_per_pool: default_datasets_per_pool(),
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            socket: default_socket(),
            transport_override: String::new(),
            queue_size: default_queue_size(),
            export_timeout: default_export_timeout(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file, apply environment overrides and
    /// validate the result.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let mut cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.apply_env_overrides()?;
        cfg.validate()?;

        Ok(cfg)
    }

    /// Build configuration from defaults and environment overrides only.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Config::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `POOLSCOPE_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_INTERVAL) {
            let secs: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("{ENV_INTERVAL} must be whole seconds, got {raw:?}"))?;
            self.session.interval = Duration::from_secs(secs);
        }

        if let Some(node) = lookup(ENV_NODE_NAME) {
            self.publish.node_name = node;
        }

        if let Some(transport) = lookup(ENV_TRANSPORT_OVERRIDE) {
            self.publish.transport_override = transport;
        }

        if let Some(socket) = lookup(ENV_SOCKET) {
            self.publish.socket = PathBuf::from(socket);
        }

        if let Some(raw) = lookup(ENV_CAPTURE_COMMAND) {
            let mut words = raw.split_whitespace().map(str::to_string);
            let Some(program) = words.next() else {
                bail!("{ENV_CAPTURE_COMMAND} is set but names no program");
            };
            self.capture.kind = CaptureKind::Command;
            self.capture.command = CommandCaptureConfig {
                program,
                args: words.collect(),
            };
        }

        Ok(())
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.session.interval.is_zero() {
            bail!("session.interval must be positive");
        }

        if self.session.interval.subsec_nanos() != 0 {
            bail!(
                "session.interval must be whole seconds, got {:?}",
                self.session.interval
            );
        }

        if self.session.max_intervals == 0 {
            bail!("session.max_intervals must be positive");
        }

        if self.session.event_buffer == 0 {
            bail!("session.event_buffer must be positive");
        }

        if self.publish.node_name.trim().is_empty() {
            bail!("publish.node_name is required");
        }

        if self.publish.node_name.contains(['/', '"', ' ']) {
            bail!(
                "publish.node_name must not contain '/', '\"' or spaces: {:?}",
                self.publish.node_name
            );
        }

        if self.publish.queue_size == 0 {
            bail!("publish.queue_size must be positive");
        }

        if self.publish.export_timeout.is_zero() {
            bail!("publish.export_timeout must be positive");
        }

        if self.capture.kind == CaptureKind::Command && self.capture.command.program.is_empty() {
            bail!(
                "capture.command.program is required when capture.kind is command \
                 (set it in the config file or via {ENV_CAPTURE_COMMAND})"
            );
        }

        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when enabled");
        }

        Ok(())
    }
}

impl SessionConfig {
    /// Window length in whole seconds, as published in `interval=`.
    pub fn interval_secs(&self) -> u64 {
        self.interval.as_secs()
    }
}
