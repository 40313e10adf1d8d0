//! Error types for the host override layer.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::hosts::PatternError;

/// Main error type for autohost operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("DNS protocol error: {0}")]
    Protocol(#[from] hickory_proto::ProtoError),

    #[error("DNS query to {0} timed out")]
    DnsTimeout(SocketAddr),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("metrics error: {0}")]
    Metrics(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[source] io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
}

/// Validation errors for configuration values.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("dns_timeout_ms must be greater than 0")]
    ZeroDnsTimeout,

    #[error("block_verify_timeout_ms must be greater than 0")]
    ZeroBlockVerifyTimeout,

    #[error("range_concurrent_fetcher must be greater than 0")]
    ZeroRangeFetchers,

    #[error("range_fetch_timeout_secs must be greater than 0")]
    ZeroRangeFetchTimeout,

    #[error("invalid host pattern in {key}: {source}")]
    InvalidPattern {
        key: &'static str,
        #[source]
        source: PatternError,
    },

    #[error("cloud_hosts_repo[{index}] is empty")]
    EmptyRepoUrl { index: usize },

    #[error("cloud_hosts = {index} but only {repos} repos are configured")]
    RepoIndexOutOfRange { index: usize, repos: usize },

    #[error("cloud_hosts_repo[{index}] must start with http:// or https://: {url:?}")]
    InvalidRepoUrl { index: usize, url: String },
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;
