//! Configuration loading and validation.
//!
//! ```toml
//! [local_server]
//! listen = "127.0.0.1:48100"
//!
//! [hosts]
//! enable = 1
//! trusted_dns = "8.8.8.8|208.67.222.222:5353"
//! trusted_dns_hosts = ["*.google.com"]
//! inject_range = "*.c.youtube.com|*.googlevideo.com"
//! except_cloud_hosts = ["*.corp.example"]
//! crlf = '\r\n'
//! cloud_hosts_repo = ["https://example.org/hosts.txt"]
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, Result, ValidationError};
use crate::hosts::PatternSet;

/// Port assumed for trusted DNS servers given without one.
const DNS_PORT: u16 = 53;

/// Main configuration for the host override layer.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The proxy's own listener, used as a fallback upstream by cloud sync.
    #[serde(default)]
    pub local_server: LocalServerSettings,

    /// Host override settings.
    #[serde(default)]
    pub hosts: HostsSettings,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Settings of the proxy listener this layer runs inside.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalServerSettings {
    /// Address the proxy listens on.
    pub listen: Option<SocketAddr>,
}

/// When host overrides are applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "ModeRepr")]
pub enum ResolutionMode {
    /// Never override.
    #[default]
    Disabled,
    /// Override only for CONNECT (tunnel) requests.
    HttpsOnly,
    /// Override for every request.
    All,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ModeRepr {
    Level(i64),
    Name(String),
}

impl TryFrom<ModeRepr> for ResolutionMode {
    type Error = String;

    fn try_from(repr: ModeRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            ModeRepr::Level(0) => Ok(Self::Disabled),
            ModeRepr::Level(1) => Ok(Self::HttpsOnly),
            ModeRepr::Level(2) => Ok(Self::All),
            ModeRepr::Level(other) => Err(format!("invalid hosts mode {other}, expected 0, 1 or 2")),
            ModeRepr::Name(name) => match name.to_ascii_lowercase().as_str() {
                "disabled" => Ok(Self::Disabled),
                "https_only" => Ok(Self::HttpsOnly),
                "all" => Ok(Self::All),
                _ => Err(format!(
                    "invalid hosts mode {name:?}, expected \"disabled\", \"https_only\" or \"all\""
                )),
            },
        }
    }
}

/// Host override settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostsSettings {
    /// Resolution mode (0/1/2 or disabled/https_only/all).
    #[serde(default)]
    pub enable: ResolutionMode,

    /// Trusted DNS servers, as an array or a pipe-separated string.
    /// Port 53 is assumed when omitted.
    #[serde(default, deserialize_with = "deserialize_server_list")]
    pub trusted_dns: Vec<SocketAddr>,

    /// Hosts resolved through the trusted DNS servers.
    #[serde(default, deserialize_with = "deserialize_list")]
    pub trusted_dns_hosts: Vec<String>,

    /// Per-server trusted DNS timeout in milliseconds.
    #[serde(default = "default_dns_timeout_ms")]
    pub dns_timeout_ms: u64,

    /// Block probe timeout in milliseconds.
    #[serde(default = "default_block_verify_timeout_ms")]
    pub block_verify_timeout_ms: u64,

    /// Response size above which range fetching kicks in, in bytes.
    #[serde(default = "default_range_fetch_limit_size")]
    pub range_fetch_limit_size: u32,

    /// Hosts that must be fetched in byte ranges.
    #[serde(default, deserialize_with = "deserialize_list")]
    pub inject_range: Vec<String>,

    /// Number of concurrent range fetchers per response.
    #[serde(default = "default_range_concurrent_fetcher")]
    pub range_concurrent_fetcher: u32,

    /// Range fetch timeout in seconds.
    #[serde(default = "default_range_fetch_timeout_secs")]
    pub range_fetch_timeout_secs: u64,

    /// Line-break sequence for the proxy loop, written with `\r` and `\n`
    /// escapes, e.g. `crlf = '\r\n'`.
    #[serde(default)]
    pub crlf: Option<String>,

    /// Hosts never taken from data directory or cloud files.
    #[serde(default, deserialize_with = "deserialize_list")]
    pub except_cloud_hosts: Vec<String>,

    /// Index of the only repo to sync; every repo is synced when unset.
    #[serde(default)]
    pub cloud_hosts: Option<usize>,

    /// Remote host list URLs; index `i` is cached as `hosts_<i>.txt`.
    #[serde(default)]
    pub cloud_hosts_repo: Vec<String>,

    /// Directory of operator-maintained host files.
    pub data_dir: Option<PathBuf>,

    /// Directory holding the cloud cache slots.
    pub cache_dir: Option<PathBuf>,
}

impl Default for HostsSettings {
    fn default() -> Self {
        Self {
            enable: ResolutionMode::default(),
            trusted_dns: Vec::new(),
            trusted_dns_hosts: Vec::new(),
            dns_timeout_ms: default_dns_timeout_ms(),
            block_verify_timeout_ms: default_block_verify_timeout_ms(),
            range_fetch_limit_size: default_range_fetch_limit_size(),
            inject_range: Vec::new(),
            range_concurrent_fetcher: default_range_concurrent_fetcher(),
            range_fetch_timeout_secs: default_range_fetch_timeout_secs(),
            crlf: None,
            except_cloud_hosts: Vec::new(),
            cloud_hosts: None,
            cloud_hosts_repo: Vec::new(),
            data_dir: None,
            cache_dir: None,
        }
    }
}

impl HostsSettings {
    /// Directory of operator-maintained host files.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("./share/hosts"))
    }

    /// Directory holding the cloud cache slots.
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(crate::hosts::sync::default_cache_dir)
    }

    #[must_use]
    pub const fn dns_timeout(&self) -> Duration {
        Duration::from_millis(self.dns_timeout_ms)
    }

    #[must_use]
    pub const fn block_verify_timeout(&self) -> Duration {
        Duration::from_millis(self.block_verify_timeout_ms)
    }

    #[must_use]
    pub const fn range_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.range_fetch_timeout_secs)
    }

    /// The `crlf` setting with its escapes expanded.
    ///
    /// Every `\r` escape becomes two carriage returns and every `\n` escape
    /// two line feeds; any other text is kept as is.
    #[must_use]
    pub fn crlf_bytes(&self) -> Option<Vec<u8>> {
        self.crlf.as_deref().map(expand_crlf)
    }

    pub fn except_patterns(&self) -> std::result::Result<PatternSet, ValidationError> {
        compile("except_cloud_hosts", &self.except_cloud_hosts)
    }

    pub fn inject_range_patterns(&self) -> std::result::Result<PatternSet, ValidationError> {
        compile("inject_range", &self.inject_range)
    }

    pub fn trusted_dns_patterns(&self) -> std::result::Result<PatternSet, ValidationError> {
        compile("trusted_dns_hosts", &self.trusted_dns_hosts)
    }

    /// Whether the startup cloud sync should run.
    #[must_use]
    pub fn sync_enabled(&self) -> bool {
        self.enable != ResolutionMode::Disabled && !self.cloud_hosts_repo.is_empty()
    }
}

fn expand_crlf(raw: &str) -> Vec<u8> {
    raw.replace("\\r", "\r\r")
        .replace("\\n", "\n\n")
        .into_bytes()
}

fn compile(key: &'static str, patterns: &[String]) -> std::result::Result<PatternSet, ValidationError> {
    PatternSet::compile(patterns).map_err(|source| ValidationError::InvalidPattern { key, source })
}

/// Metrics exporter configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Expose a Prometheus `/metrics` endpoint.
    #[serde(default)]
    pub enabled: bool,

    /// Address of the metrics endpoint.
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

const fn default_dns_timeout_ms() -> u64 {
    2_000
}

const fn default_block_verify_timeout_ms() -> u64 {
    1_500
}

const fn default_range_fetch_limit_size() -> u32 {
    256_000
}

const fn default_range_concurrent_fetcher() -> u32 {
    5
}

const fn default_range_fetch_timeout_secs() -> u64 {
    90
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9100))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListRepr {
    Piped(String),
    List(Vec<String>),
}

fn split_list(repr: ListRepr) -> Vec<String> {
    match repr {
        ListRepr::Piped(s) => s
            .split('|')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        ListRepr::List(items) => items,
    }
}

fn deserialize_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    ListRepr::deserialize(deserializer).map(split_list)
}

fn deserialize_server_list<'de, D>(
    deserializer: D,
) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    split_list(ListRepr::deserialize(deserializer)?)
        .iter()
        .map(|s| parse_server(s).map_err(serde::de::Error::custom))
        .collect()
}

fn parse_server(s: &str) -> std::result::Result<SocketAddr, String> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    s.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DNS_PORT))
        .map_err(|_| format!("invalid DNS server address: {s:?}"))
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    fn validate(&self) -> std::result::Result<(), ConfigError> {
        let hosts = &self.hosts;

        if hosts.dns_timeout_ms == 0 {
            return Err(ValidationError::ZeroDnsTimeout.into());
        }

        if hosts.block_verify_timeout_ms == 0 {
            return Err(ValidationError::ZeroBlockVerifyTimeout.into());
        }

        if hosts.range_concurrent_fetcher == 0 {
            return Err(ValidationError::ZeroRangeFetchers.into());
        }

        if hosts.range_fetch_timeout_secs == 0 {
            return Err(ValidationError::ZeroRangeFetchTimeout.into());
        }

        hosts.except_patterns()?;
        hosts.inject_range_patterns()?;
        hosts.trusted_dns_patterns()?;

        for (index, url) in hosts.cloud_hosts_repo.iter().enumerate() {
            if url.is_empty() {
                return Err(ValidationError::EmptyRepoUrl { index }.into());
            }
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ValidationError::InvalidRepoUrl {
                    index,
                    url: url.clone(),
                }
                .into());
            }
        }

        if let Some(index) = hosts.cloud_hosts
            && index >= hosts.cloud_hosts_repo.len()
        {
            return Err(ValidationError::RepoIndexOutOfRange {
                index,
                repos: hosts.cloud_hosts_repo.len(),
            }
            .into());
        }

        Ok(())
    }

    /// Port of the proxy listener, used for the cloud sync fallback.
    #[must_use]
    pub fn fallback_port(&self) -> Option<u16> {
        self.local_server.listen.map(|addr| addr.port())
    }
}
