//! Block detection for override addresses.
//!
//! An override address is only handed out if it is reachable. The check sits
//! behind the [`BlockChecker`] trait so the proxy can plug in its own probe;
//! [`TcpProbe`] is a plain bounded TCP connect and [`CachedBlockChecker`]
//! remembers verdicts for a while so hot hosts are not probed on every
//! connection.

use std::future::Future;
use std::time::Duration;

use moka::future::Cache;
use tokio::net::TcpStream;

/// Default time allowed for a probe connection.
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_millis(1500);

/// Decides whether `address:port` is blocked.
pub trait BlockChecker: Send + Sync + 'static {
    fn is_blocked(&self, address: &str, port: u16) -> impl Future<Output = bool> + Send;
}

/// Treats an address as blocked when a TCP connection cannot be established
/// within the timeout.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(DEFAULT_VERIFY_TIMEOUT)
    }
}

impl BlockChecker for TcpProbe {
    async fn is_blocked(&self, address: &str, port: u16) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect((address, port))).await {
            Ok(Ok(_)) => false,
            Ok(Err(err)) => {
                tracing::debug!(address, port, error = %err, "probe connection failed");
                true
            }
            Err(_) => {
                tracing::debug!(address, port, "probe connection timed out");
                true
            }
        }
    }
}

/// Never reports an address as blocked.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverBlocked;

impl BlockChecker for NeverBlocked {
    async fn is_blocked(&self, _address: &str, _port: u16) -> bool {
        false
    }
}

/// Wraps a checker and caches its verdicts in memory for `ttl`.
///
/// Verdicts live for the process lifetime at most; nothing is persisted.
#[derive(Clone)]
pub struct CachedBlockChecker<B> {
    inner: B,
    verdicts: Cache<(String, u16), bool>,
}

impl<B: BlockChecker> CachedBlockChecker<B> {
    pub fn new(inner: B, ttl: Duration) -> Self {
        let verdicts = Cache::builder().time_to_live(ttl).build();
        Self { inner, verdicts }
    }

    /// Create a cache with TTL and maximum capacity.
    pub fn with_capacity(inner: B, ttl: Duration, max_capacity: u64) -> Self {
        let verdicts = Cache::builder()
            .time_to_live(ttl)
            .max_capacity(max_capacity)
            .build();
        Self { inner, verdicts }
    }

    pub fn entry_count(&self) -> u64 {
        self.verdicts.entry_count()
    }
}

impl<B: BlockChecker> BlockChecker for CachedBlockChecker<B> {
    async fn is_blocked(&self, address: &str, port: u16) -> bool {
        self.verdicts
            .get_with(
                (address.to_string(), port),
                self.inner.is_blocked(address, port),
            )
            .await
    }
}
