//! Per-connection override lookup.
//!
//! Resolution order for a `host:port`:
//!
//! 1. Mode gate (`Disabled`, or `HttpsOnly` on a non-CONNECT request, stop here)
//! 2. Trusted DNS, for configured target hosts
//! 3. Local overrides, then the merged host table
//!
//! Whatever the source, an address that fails the block check is never
//! returned.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::config::{HostsSettings, ResolutionMode};
use crate::dns::DnsOverride;
use crate::error::ValidationError;
use crate::hosts::{HostTable, PatternSet};
use crate::probe::BlockChecker;

/// Inputs for the proxy's decision to fetch a response in byte ranges.
#[derive(Debug, Clone)]
pub struct RangeFetchPolicy {
    /// Response size above which ranges are used, in bytes.
    pub limit_size: u32,
    /// Concurrent range fetchers per response.
    pub concurrent_fetchers: u32,
    /// Timeout for a ranged fetch.
    pub fetch_timeout: Duration,
    targets: PatternSet,
}

impl RangeFetchPolicy {
    pub fn new(targets: PatternSet) -> Self {
        Self {
            limit_size: 256_000,
            concurrent_fetchers: 5,
            fetch_timeout: Duration::from_secs(90),
            targets,
        }
    }

    /// Returns true if responses from `host` must be fetched in ranges.
    #[inline]
    pub fn applies_to(&self, host: &str) -> bool {
        self.targets.matches(host)
    }
}

impl Default for RangeFetchPolicy {
    fn default() -> Self {
        Self::new(PatternSet::default())
    }
}

/// Orchestrates trusted DNS, the host table and the block checker.
pub struct LookupService<D, B>
where
    D: DnsOverride,
    B: BlockChecker,
{
    mode: ResolutionMode,
    table: Arc<HostTable>,
    trusted: D,
    checker: B,
    except: PatternSet,
    range: RangeFetchPolicy,
    crlfs: Option<Vec<u8>>,
}

impl<D, B> LookupService<D, B>
where
    D: DnsOverride,
    B: BlockChecker,
{
    /// Create a service with no except-hosts and no range targets.
    pub fn new(mode: ResolutionMode, table: Arc<HostTable>, trusted: D, checker: B) -> Self {
        Self {
            mode,
            table,
            trusted,
            checker,
            except: PatternSet::default(),
            range: RangeFetchPolicy::default(),
            crlfs: None,
        }
    }

    /// Create a service from the `[hosts]` settings.
    pub fn from_settings(
        settings: &HostsSettings,
        table: Arc<HostTable>,
        trusted: D,
        checker: B,
    ) -> Result<Self, ValidationError> {
        let range = RangeFetchPolicy {
            limit_size: settings.range_fetch_limit_size,
            concurrent_fetchers: settings.range_concurrent_fetcher,
            fetch_timeout: settings.range_fetch_timeout(),
            targets: settings.inject_range_patterns()?,
        };

        Ok(Self::new(settings.enable, table, trusted, checker)
            .with_except_hosts(settings.except_patterns()?)
            .with_range_policy(range)
            .with_crlfs(settings.crlf_bytes()))
    }

    #[must_use]
    pub fn with_except_hosts(mut self, except: PatternSet) -> Self {
        self.except = except;
        self
    }

    #[must_use]
    pub fn with_range_policy(mut self, range: RangeFetchPolicy) -> Self {
        self.range = range;
        self
    }

    #[must_use]
    pub fn with_crlfs(mut self, crlfs: Option<Vec<u8>>) -> Self {
        self.crlfs = crlfs;
        self
    }

    /// Mode-gated lookup for a request with the given HTTP `method`.
    ///
    /// Returns the substitute `address:port`, or `None` to leave the
    /// destination unmodified.
    pub async fn lookup_available_hostport(&self, method: &str, hostport: &str) -> Option<String> {
        match self.mode {
            ResolutionMode::Disabled => return None,
            ResolutionMode::HttpsOnly if !method.eq_ignore_ascii_case("CONNECT") => return None,
            _ => {}
        }
        self.lookup_available_address(hostport).await
    }

    /// Ungated lookup: trusted DNS, then the host table, filtered by the
    /// block checker.
    #[instrument(skip(self), level = "debug")]
    pub async fn lookup_available_address(&self, hostport: &str) -> Option<String> {
        let Some((host, port)) = split_host_port(hostport) else {
            debug!("malformed host:port, leaving unmodified");
            record("malformed");
            return None;
        };

        if let Some(ip) = self.trusted.resolve(host).await {
            let address = ip.to_string();
            if self.checker.is_blocked(&address, port).await {
                debug!(%address, "trusted DNS answer is blocked");
                record("blocked");
                return None;
            }
            record("trusted_dns");
            return Some(join_host_port(&address, port));
        }

        let Some(address) = self.table.lookup(host) else {
            record("miss");
            return None;
        };

        if self.checker.is_blocked(&address, port).await {
            debug!(%address, "host table address is blocked");
            record("blocked");
            return None;
        }

        record("host_table");
        Some(join_host_port(&address, port))
    }

    /// Returns true if `host` is excluded from third-party override sources.
    #[inline]
    pub fn is_except_host(&self, host: &str) -> bool {
        self.except.matches(host)
    }

    /// Returns true if responses from `host` must be fetched in byte ranges.
    #[inline]
    pub fn needs_range_injection(&self, host: &str) -> bool {
        self.range.applies_to(host)
    }

    pub fn range_policy(&self) -> &RangeFetchPolicy {
        &self.range
    }

    /// Expanded line-break sequence for the proxy loop, if configured.
    pub fn crlfs(&self) -> Option<&[u8]> {
        self.crlfs.as_deref()
    }

    pub fn mode(&self) -> ResolutionMode {
        self.mode
    }

    pub fn table(&self) -> &Arc<HostTable> {
        &self.table
    }
}

fn record(outcome: &'static str) {
    metrics::counter!("autohost_lookups_total", "outcome" => outcome).increment(1);
}

/// Split `host:port` or `[v6]:port`.
pub fn split_host_port(hostport: &str) -> Option<(&str, u16)> {
    let (host, port) = if let Some(rest) = hostport.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        (host, rest.strip_prefix(':')?)
    } else {
        let (host, port) = hostport.rsplit_once(':')?;
        if host.contains(':') {
            // bare IPv6 without brackets is ambiguous
            return None;
        }
        (host, port)
    };

    if host.is_empty() {
        return None;
    }
    Some((host, port.parse().ok()?))
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosts::HostMapping;
    use crate::probe::NeverBlocked;
    use crate::probe::tests::StubChecker;
    use std::collections::HashMap;
    use std::net::IpAddr;

    /// Trusted DNS stub with fixed answers.
    #[derive(Default)]
    struct StubOverride {
        answers: HashMap<String, IpAddr>,
    }

    impl StubOverride {
        fn with(host: &str, ip: &str) -> Self {
            Self {
                answers: HashMap::from([(host.to_string(), ip.parse().unwrap())]),
            }
        }
    }

    impl DnsOverride for StubOverride {
        async fn resolve(&self, host: &str) -> Option<IpAddr> {
            self.answers.get(host).copied()
        }
    }

    fn table(entries: &[(&str, &str)]) -> Arc<HostTable> {
        let mapping: HostMapping = entries
            .iter()
            .map(|(n, a)| (n.to_string(), a.to_string()))
            .collect();
        Arc::new(HostTable::new(mapping, HostMapping::default()))
    }

    fn service<D: DnsOverride, B: BlockChecker>(
        mode: ResolutionMode,
        entries: &[(&str, &str)],
        trusted: D,
        checker: B,
    ) -> LookupService<D, B> {
        LookupService::new(mode, table(entries), trusted, checker)
    }

    #[tokio::test]
    async fn should_return_none_when_disabled() {
        let svc = service(
            ResolutionMode::Disabled,
            &[("example.com", "1.2.3.4")],
            StubOverride::default(),
            NeverBlocked,
        );

        assert_eq!(svc.lookup_available_hostport("CONNECT", "example.com:443").await, None);
    }

    #[tokio::test]
    async fn should_ignore_plain_requests_in_https_only_mode() {
        let svc = service(
            ResolutionMode::HttpsOnly,
            &[("example.com", "1.2.3.4")],
            StubOverride::default(),
            NeverBlocked,
        );

        assert_eq!(svc.lookup_available_hostport("GET", "example.com:80").await, None);
        assert_eq!(svc.lookup_available_hostport("POST", "example.com:443").await, None);
    }

    #[tokio::test]
    async fn should_override_connect_in_https_only_mode() {
        let svc = service(
            ResolutionMode::HttpsOnly,
            &[("example.com", "1.2.3.4")],
            StubOverride::default(),
            NeverBlocked,
        );

        assert_eq!(
            svc.lookup_available_hostport("CONNECT", "example.com:443").await.as_deref(),
            Some("1.2.3.4:443")
        );
        assert_eq!(
            svc.lookup_available_hostport("connect", "example.com:443").await.as_deref(),
            Some("1.2.3.4:443")
        );
    }

    #[tokio::test]
    async fn should_override_every_method_in_all_mode() {
        let svc = service(
            ResolutionMode::All,
            &[("example.com", "1.2.3.4")],
            StubOverride::default(),
            NeverBlocked,
        );

        assert_eq!(
            svc.lookup_available_hostport("GET", "example.com:80").await.as_deref(),
            Some("1.2.3.4:80")
        );
    }

    #[tokio::test]
    async fn should_return_none_for_unknown_host() {
        let svc = service(ResolutionMode::All, &[], StubOverride::default(), NeverBlocked);
        assert_eq!(svc.lookup_available_address("unknown.com:443").await, None);
    }

    #[tokio::test]
    async fn should_return_none_for_malformed_input() {
        let svc = service(
            ResolutionMode::All,
            &[("example.com", "1.2.3.4")],
            StubOverride::default(),
            NeverBlocked,
        );

        for input in ["example.com", "example.com:", "example.com:https", ":443", "example.com:70000"] {
            assert_eq!(svc.lookup_available_address(input).await, None, "input {input:?}");
        }
    }

    #[tokio::test]
    async fn should_prefer_trusted_dns_over_table() {
        let svc = service(
            ResolutionMode::All,
            &[("example.com", "1.2.3.4")],
            StubOverride::with("example.com", "8.8.8.8"),
            NeverBlocked,
        );

        assert_eq!(
            svc.lookup_available_address("example.com:443").await.as_deref(),
            Some("8.8.8.8:443")
        );
    }

    #[tokio::test]
    async fn should_not_fall_back_to_table_when_trusted_answer_is_blocked() {
        let svc = service(
            ResolutionMode::All,
            &[("example.com", "1.2.3.4")],
            StubOverride::with("example.com", "8.8.8.8"),
            StubChecker::blocking(["8.8.8.8"]),
        );

        assert_eq!(svc.lookup_available_address("example.com:443").await, None);
    }

    #[tokio::test]
    async fn should_never_return_blocked_table_address() {
        let checker = StubChecker::blocking(["6.6.6.6"]);
        let svc = service(
            ResolutionMode::All,
            &[("bad.com", "6.6.6.6"), ("good.com", "1.1.1.1")],
            StubOverride::default(),
            checker.clone(),
        );

        assert_eq!(svc.lookup_available_address("bad.com:443").await, None);
        assert_eq!(
            svc.lookup_available_address("good.com:443").await.as_deref(),
            Some("1.1.1.1:443")
        );
        assert_eq!(checker.calls(), 2);
    }

    #[tokio::test]
    async fn should_consult_local_overrides_first() {
        let local: HostMapping = [("example.com".to_string(), "9.9.9.9".to_string())]
            .into_iter()
            .collect();
        let table = table(&[("example.com", "1.2.3.4")]);
        table.set_local_overrides(local);
        let svc = LookupService::new(ResolutionMode::All, table, StubOverride::default(), NeverBlocked);

        assert_eq!(
            svc.lookup_available_address("example.com:443").await.as_deref(),
            Some("9.9.9.9:443")
        );
    }

    #[tokio::test]
    async fn should_see_table_updates() {
        let svc = service(ResolutionMode::All, &[], StubOverride::default(), NeverBlocked);
        assert_eq!(svc.lookup_available_address("late.com:443").await, None);

        svc.table()
            .swap([("late.com".to_string(), "5.5.5.5".to_string())].into_iter().collect());

        assert_eq!(
            svc.lookup_available_address("late.com:443").await.as_deref(),
            Some("5.5.5.5:443")
        );
    }

    #[tokio::test]
    async fn should_bracket_ipv6_overrides() {
        let svc = service(
            ResolutionMode::All,
            &[("v6.com", "2001:db8::1")],
            StubOverride::default(),
            NeverBlocked,
        );

        assert_eq!(
            svc.lookup_available_address("v6.com:443").await.as_deref(),
            Some("[2001:db8::1]:443")
        );
    }

    #[test]
    fn should_classify_hosts() {
        let svc = service(ResolutionMode::All, &[], StubOverride::default(), NeverBlocked)
            .with_except_hosts(PatternSet::compile(["*.corp"]).unwrap())
            .with_range_policy(RangeFetchPolicy::new(
                PatternSet::compile(["*.googlevideo.com"]).unwrap(),
            ));

        assert!(svc.is_except_host("mail.corp"));
        assert!(!svc.is_except_host("mail.com"));
        assert!(svc.needs_range_injection("r1.googlevideo.com"));
        assert!(!svc.needs_range_injection("www.google.com"));
    }

    #[test]
    fn should_build_from_settings() {
        let settings = HostsSettings {
            enable: ResolutionMode::HttpsOnly,
            inject_range: vec!["*.youtube.com".to_string()],
            except_cloud_hosts: vec!["*.lan".to_string()],
            range_fetch_limit_size: 1024,
            crlf: Some("\\r\\n".to_string()),
            ..HostsSettings::default()
        };

        let svc = LookupService::from_settings(
            &settings,
            Arc::new(HostTable::default()),
            StubOverride::default(),
            NeverBlocked,
        )
        .unwrap();

        assert_eq!(svc.mode(), ResolutionMode::HttpsOnly);
        assert!(svc.is_except_host("nas.lan"));
        assert!(svc.needs_range_injection("www.youtube.com"));
        assert_eq!(svc.range_policy().limit_size, 1024);
        assert_eq!(svc.range_policy().concurrent_fetchers, 5);
        assert_eq!(svc.crlfs(), Some(&b"\r\r\n\n"[..]));
    }

    #[test]
    fn should_split_host_port() {
        assert_eq!(split_host_port("example.com:443"), Some(("example.com", 443)));
        assert_eq!(split_host_port("[::1]:8080"), Some(("::1", 8080)));
        assert_eq!(split_host_port("::1:8080"), None);
        assert_eq!(split_host_port("[::1]"), None);
        assert_eq!(split_host_port("example.com"), None);
    }

    #[test]
    fn should_join_host_port() {
        assert_eq!(join_host_port("1.2.3.4", 443), "1.2.3.4:443");
        assert_eq!(join_host_port("::1", 443), "[::1]:443");
    }
}
