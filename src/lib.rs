//! Autohost - host-resolution override layer for a forward proxy.
//!
//! For a requested `host:port`, autohost decides whether the proxy should
//! connect somewhere else: to defeat DNS poisoning, to route around blocked
//! endpoints, and to classify hosts that need special handling.
//!
//! # Architecture
//!
//! - [`config`]: Configuration loading and validation
//! - [`hosts`]: Host file parsing, the merged host table and cloud sync
//! - [`dns`]: Trusted DNS resolution
//! - [`probe`]: Block detection for candidate addresses
//! - [`lookup`]: The per-connection entry point
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use autohost::config::ResolutionMode;
//! use autohost::dns::TrustedResolver;
//! use autohost::hosts::HostTable;
//! use autohost::lookup::LookupService;
//! use autohost::probe::NeverBlocked;
//!
//! # async fn example() {
//! let table = Arc::new(HostTable::default());
//! table.swap([("example.com".to_string(), "1.2.3.4".to_string())].into_iter().collect());
//!
//! let service = LookupService::new(
//!     ResolutionMode::HttpsOnly,
//!     table,
//!     TrustedResolver::disabled(),
//!     NeverBlocked,
//! );
//! let target = service.lookup_available_hostport("CONNECT", "example.com:443").await;
//! assert_eq!(target.as_deref(), Some("1.2.3.4:443"));
//! # }
//! ```

pub mod config;
pub mod dns;
pub mod error;
pub mod hosts;
pub mod lookup;
pub mod metrics;
pub mod probe;

pub use config::Config;
pub use error::{Error, Result};
