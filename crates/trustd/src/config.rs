//! Daemon configuration
//!
//! Configuration files:
//! - ~/.config/trustd/config.yaml - timeouts, prompt command, store location
//!
//! Everything in the file can be overridden on the command line. The
//! binding selectors (which transport, which bus, which local agent) are
//! fixed for the lifetime of a daemon.

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use trustd_core::Paths;

/// Prefix of every well-known bus name and object path we use
pub const BUS_PREFIX: &str = "io.trustd";

/// Which message bus a binding talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BusScope {
    /// The user's session bus
    Session,
    /// The system bus
    System,
    /// A session bus whose address must be present in DBUS_SESSION_BUS_ADDRESS
    SessionFromEnv,
    /// A system bus whose address must be present in DBUS_SYSTEM_BUS_ADDRESS
    SystemFromEnv,
}

impl BusScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::System => "system",
            Self::SessionFromEnv => "session-from-env",
            Self::SystemFromEnv => "system-from-env",
        }
    }
}

impl fmt::Display for BusScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which transport binding carries the stub <-> skeleton protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteAgentKind {
    LocalSocket,
    Bus,
}

/// Which decision policy the skeleton consults on a store miss
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum LocalAgentKind {
    AlwaysDeny,
    AlwaysGrant,
    Interactive,
}

impl LocalAgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlwaysDeny => "always-deny",
            Self::AlwaysGrant => "always-grant",
            Self::Interactive => "interactive",
        }
    }
}

/// Where a remote agent reaches its peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    LocalSocket(PathBuf),
    Bus { scope: BusScope, name: String },
}

impl Endpoint {
    /// Resolve the endpoint for a binding, filling in per-service defaults
    pub fn resolve(
        kind: RemoteAgentKind,
        service: &str,
        path: Option<PathBuf>,
        scope: Option<BusScope>,
        name: Option<String>,
        paths: &Paths,
    ) -> Self {
        match kind {
            RemoteAgentKind::LocalSocket => {
                Self::LocalSocket(path.unwrap_or_else(|| paths.endpoint(service)))
            }
            RemoteAgentKind::Bus => Self::Bus {
                scope: scope.unwrap_or(BusScope::Session),
                name: name.unwrap_or_else(|| agent_bus_name(service)),
            },
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalSocket(path) => write!(f, "unix:{}", path.display()),
            Self::Bus { scope, name } => write!(f, "bus:{}@{}", name, scope),
        }
    }
}

/// Well-known name the stub of a service claims on the bus
pub fn agent_bus_name(service: &str) -> String {
    format!("{}.Agent.{}", BUS_PREFIX, bus_element(service))
}

/// Well-known name a skeleton exposes its trust store under
pub fn store_bus_name(service: &str) -> String {
    format!("{}.Store.{}", BUS_PREFIX, bus_element(service))
}

/// Map a service name onto a valid bus name element
fn bus_element(service: &str) -> String {
    let element: String = service
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();

    match element.chars().next() {
        None => "_".to_string(),
        Some(c) if c.is_ascii_digit() => format!("_{}", element),
        Some(_) => element,
    }
}

/// Settings loaded from the configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// How long the stub waits for a relayed answer
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// How long in-flight requests may drain after a termination signal
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// How long a starting skeleton keeps trying to reach its stub
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Delay between reconnection attempts after a lost channel
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// Longest accepted line on any channel
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Interactive agent settings
    #[serde(default)]
    pub prompt: PromptConfig,

    /// Trust store settings
    #[serde(default)]
    pub store: StoreConfig,
}

fn default_request_timeout_ms() -> u64 {
    120_000
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_reconnect_interval_ms() -> u64 {
    500
}

fn default_max_frame_bytes() -> usize {
    4096
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            max_frame_bytes: default_max_frame_bytes(),
            prompt: PromptConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from the default location
    pub fn load(paths: &Paths) -> Result<Self> {
        Self::load_from(&paths.config_file())
    }

    /// Load configuration from a specific path, defaults if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {:?}", path))?;
            let config: Self = serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config from {:?}", path))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

/// Interactive agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Prompt command and its arguments; exit status 0 grants
    #[serde(default)]
    pub command: Vec<String>,

    /// How long a human gets to answer
    #[serde(default = "default_prompt_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_prompt_timeout_ms() -> u64 {
    60_000
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_ms: default_prompt_timeout_ms(),
        }
    }
}

impl PromptConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Trust store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding one database per service
    #[serde(default)]
    pub dir: Option<String>,
}

impl StoreConfig {
    /// Database path for a service
    pub fn path_for(&self, service: &str, paths: &Paths) -> PathBuf {
        match &self.dir {
            Some(dir) => expand_path(dir).join(format!("{}.db", trustd_core::paths::file_stem(service))),
            None => paths.store(service),
        }
    }
}

/// Expand ~ in a configured path
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).to_string())
}

/// Fully resolved settings of a stub instance
#[derive(Debug, Clone)]
pub struct StubConfig {
    pub service: String,
    pub endpoint: Endpoint,
    /// Extra local socket accepting caller connections
    pub caller_endpoint: Option<PathBuf>,
    /// Serve the process's stdin/stdout as a caller
    pub stdio_caller: bool,
    /// Restrict endpoint sockets to the owning user
    pub private_endpoints: bool,
    pub request_timeout: Duration,
    pub shutdown_grace: Duration,
    pub max_frame_bytes: usize,
}

impl StubConfig {
    pub fn new(service: impl Into<String>, endpoint: Endpoint, config: &DaemonConfig) -> Self {
        Self {
            service: service.into(),
            endpoint,
            caller_endpoint: None,
            stdio_caller: true,
            private_endpoints: false,
            request_timeout: config.request_timeout(),
            shutdown_grace: config.shutdown_grace(),
            max_frame_bytes: config.max_frame_bytes,
        }
    }
}

/// Fully resolved settings of a skeleton instance
#[derive(Debug, Clone)]
pub struct SkeletonConfig {
    pub service: String,
    pub endpoint: Endpoint,
    pub local_agent: LocalAgentKind,
    pub prompt: PromptConfig,
    /// Bus the store is exposed on, if any
    pub store_bus: Option<BusScope>,
    /// Database path; `None` keeps verdicts in memory only
    pub store_path: Option<PathBuf>,
    pub connect_timeout: Duration,
    pub reconnect_interval: Duration,
    pub max_frame_bytes: usize,
}

impl SkeletonConfig {
    pub fn new(
        service: impl Into<String>,
        endpoint: Endpoint,
        local_agent: LocalAgentKind,
        config: &DaemonConfig,
    ) -> Self {
        Self {
            service: service.into(),
            endpoint,
            local_agent,
            prompt: config.prompt.clone(),
            store_bus: None,
            store_path: None,
            connect_timeout: config.connect_timeout(),
            reconnect_interval: config.reconnect_interval(),
            max_frame_bytes: config.max_frame_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_bus_names() {
        assert_eq!(
            agent_bus_name("UnlikelyToEverExistOutsideOfTesting"),
            "io.trustd.Agent.UnlikelyToEverExistOutsideOfTesting"
        );
        assert_eq!(store_bus_name("com.example-app"), "io.trustd.Store.com_example_app");
        assert_eq!(agent_bus_name("3d"), "io.trustd.Agent._3d");
        assert_eq!(agent_bus_name(""), "io.trustd.Agent._");
    }

    #[test]
    fn test_endpoint_defaults() {
        let paths = Paths::under("/tmp/trustd-config-test");

        let endpoint = Endpoint::resolve(RemoteAgentKind::LocalSocket, "camera", None, None, None, &paths);
        assert_eq!(
            endpoint,
            Endpoint::LocalSocket(PathBuf::from("/tmp/trustd-config-test/run/camera.sock"))
        );

        let endpoint = Endpoint::resolve(RemoteAgentKind::Bus, "camera", None, None, None, &paths);
        assert_eq!(
            endpoint,
            Endpoint::Bus {
                scope: BusScope::Session,
                name: "io.trustd.Agent.camera".to_string()
            }
        );
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = DaemonConfig::load_from(&dir.path().join("config.yaml")).unwrap();
        assert_eq!(config.request_timeout(), Duration::from_secs(120));
        assert_eq!(config.prompt.timeout(), Duration::from_secs(60));
        assert!(config.prompt.command.is_empty());
    }

    #[test]
    fn test_partial_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "request_timeout_ms: 250\nprompt:\n  command: [\"/usr/bin/ask\", \"--modal\"]\nstore:\n  dir: /var/lib/trustd\n",
        )
        .unwrap();

        let config = DaemonConfig::load_from(&path).unwrap();
        assert_eq!(config.request_timeout(), Duration::from_millis(250));
        assert_eq!(config.shutdown_grace(), Duration::from_secs(5));
        assert_eq!(config.prompt.command, vec!["/usr/bin/ask", "--modal"]);
        assert_eq!(config.prompt.timeout_ms, 60_000);
        assert_eq!(
            config.store.path_for("camera", &Paths::under("/unused")),
            PathBuf::from("/var/lib/trustd/camera.db")
        );
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "request_timeout_ms: [nope]\n").unwrap();
        assert!(DaemonConfig::load_from(&path).is_err());
    }
}
