use std::{
    env, fs,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::Context as _;
use serde::Deserialize;

pub const PROJECT_CONFIG_FILE: &str = "requestrewind.toml";
pub const HOME_CONFIG_DIR: &str = ".requestrewind";
pub const HOME_CONFIG_FILE: &str = "config.toml";

const DEFAULT_LISTEN_PORT: u16 = 8080;
const DEFAULT_STORAGE_PATH: &str = "./requestrewind-data";
const DEFAULT_MAX_CONNECTIONS: usize = 10;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Which of the two mutually exclusive modes this invocation runs in.
/// A non-empty replay target host selects replay mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Capture,
    Replay,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplayConfig {
    /// Target host for replay, e.g. `http://staging.example.test`.
    /// Empty means the process runs in capture mode.
    #[serde(default)]
    pub target_host: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

fn default_listen() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_LISTEN_PORT)
}

fn default_storage_path() -> PathBuf {
    PathBuf::from(DEFAULT_STORAGE_PATH)
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            target_host: String::new(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            replay: ReplayConfig::default(),
            logging: None,
        }
    }
}

impl Config {
    /// Loads configuration with discovery: an explicit override path, then
    /// `./requestrewind.toml`, then `~/.requestrewind/config.toml`, then
    /// built-in defaults.
    pub fn load(override_path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = override_path {
            return Self::from_path(path);
        }

        let project = Path::new(PROJECT_CONFIG_FILE);
        if project.exists() {
            return Self::from_path(project)
                .with_context(|| format!("load project ./{PROJECT_CONFIG_FILE}"));
        }

        if let Some(home) = env::var_os("HOME") {
            let home_config = Path::new(&home).join(HOME_CONFIG_DIR).join(HOME_CONFIG_FILE);
            if home_config.exists() {
                return Self::from_path(&home_config)
                    .with_context(|| format!("load home config {}", home_config.display()));
            }
        }

        Ok(Self::default())
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    /// A non-empty CLI target host wins over the config file value and
    /// therefore forces replay mode.
    pub fn apply_target_host_override(&mut self, target_host: Option<&str>) {
        if let Some(target_host) = target_host {
            self.replay.target_host = target_host.trim().to_owned();
        }
    }

    pub fn mode(&self) -> Mode {
        if self.replay.target_host.is_empty() {
            Mode::Capture
        } else {
            Mode::Replay
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.storage.max_connections >= 1,
            "`storage.max_connections` must be at least 1"
        );
        anyhow::ensure!(
            self.replay.request_timeout_ms >= 1,
            "`replay.request_timeout_ms` must be at least 1"
        );
        Ok(())
    }
}

impl ReplayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(s).context("parse config TOML")?;
        config.validate()?;
        Ok(config)
    }
}
