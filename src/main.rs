//! Autohost - Entry point.
//!
//! Loads the configuration, builds the host table, starts the cloud sync in
//! the background and resolves each `host:port` given on the command line as
//! a CONNECT request would be resolved by the proxy.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use autohost::config::Config;
use autohost::dns::TrustedResolver;
use autohost::hosts::{CloudSync, HostTable};
use autohost::lookup::{LookupService, split_host_port};
use autohost::probe::{CachedBlockChecker, TcpProbe};

/// How long block probe verdicts are reused.
const PROBE_CACHE_TTL: Duration = Duration::from_secs(300);

async fn run() -> Result<()> {
    let config_path = std::env::var("CONFIG_PATH")
        .map(Cow::Owned)
        .unwrap_or(Cow::Borrowed("autohost.toml"));
    let config = Config::load(config_path.as_ref()).context("Failed to load configuration")?;

    autohost::metrics::init(&config.metrics).context("Failed to initialize metrics")?;
    if config.metrics.enabled {
        info!("Metrics enabled on {}", config.metrics.listen);
    }

    let hosts = &config.hosts;
    let data_dir = hosts.data_dir();
    let cache_dir = hosts.cache_dir();
    let except = hosts.except_patterns().context("Invalid except_cloud_hosts")?;

    info!("Hosts mode: {:?}", hosts.enable);
    info!("Data directory: {}", data_dir.display());
    info!("Cache directory: {}", cache_dir.display());
    info!("Trusted DNS servers: {}", hosts.trusted_dns.len());

    if let Err(err) = tokio::fs::create_dir_all(&cache_dir).await {
        warn!("Failed to create cache directory: {err}");
    }

    let table = {
        let (data_dir, cache_dir, except) = (data_dir.clone(), cache_dir.clone(), except.clone());
        tokio::task::spawn_blocking(move || HostTable::load(&data_dir, &cache_dir, &except))
            .await
            .context("Host table load task failed")?
    };
    let table = Arc::new(table);
    info!(
        "Host table loaded with {} entries and {} local overrides",
        table.len(),
        table.local_overrides().len()
    );

    let sync = if hosts.sync_enabled() {
        let sync = CloudSync::new(
            hosts.cloud_hosts_repo.clone(),
            data_dir,
            cache_dir,
            except,
            Arc::clone(&table),
            config.fallback_port(),
        )
        .context("Failed to create cloud sync")?
        .with_selected_repo(hosts.cloud_hosts);
        info!("Syncing {} cloud host repos in background", hosts.cloud_hosts_repo.len());
        Some(sync.spawn())
    } else {
        None
    };

    let trusted = TrustedResolver::new(
        hosts.trusted_dns.clone(),
        hosts.trusted_dns_patterns().context("Invalid trusted_dns_hosts")?,
    )
    .with_timeout(hosts.dns_timeout());
    let checker = CachedBlockChecker::new(TcpProbe::new(hosts.block_verify_timeout()), PROBE_CACHE_TTL);
    let service = LookupService::from_settings(hosts, Arc::clone(&table), trusted, checker)
        .context("Invalid hosts settings")?;

    // lookups are served from whatever table is loaded while the sync runs
    for hostport in std::env::args().skip(1) {
        let host = split_host_port(&hostport).map_or(hostport.as_str(), |(host, _)| host);
        let target = service.lookup_available_hostport("CONNECT", &hostport).await;
        println!(
            "{hostport} -> {} (except: {}, range: {})",
            target.as_deref().unwrap_or("unchanged"),
            service.is_except_host(host),
            service.needs_range_injection(host),
        );
    }

    if let Some(handle) = sync {
        let report = handle.await.context("Cloud sync task failed")?;
        info!(
            "Cloud sync finished: {} fetched, {} failed, {} entries",
            report.fetched.len(),
            report.failed.len(),
            report.entries
        );
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    run().await
}
