//! Cloud host list synchronisation.
//!
//! Downloads each configured repo into its `hosts_<i>.txt` cache slot, then
//! rebuilds and swaps the [`HostTable`]. A repo that cannot be fetched
//! directly is retried once through the proxy's own listening port, for
//! networks where direct access to the repo host is itself blocked.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Proxy};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

use super::{HostTable, PatternSet, cache_file_name};

/// Default timeout for HTTP requests in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// User-Agent header value for HTTP requests.
const USER_AGENT: &str = concat!("autohost/", env!("CARGO_PKG_VERSION"));

/// Error type for a single repo fetch.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// HTTP request returned something other than 200.
    #[error("HTTP request failed for {url}: status {status}")]
    HttpStatus {
        /// URL that was requested.
        url: String,
        /// HTTP status code returned.
        status: u16,
    },

    /// Network error during HTTP request.
    #[error("network error fetching {url}: {source}")]
    Network {
        /// URL that was requested.
        url: String,
        /// Underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// Timeout fetching the remote URL.
    #[error("timeout fetching {url}")]
    Timeout {
        /// URL that timed out.
        url: String,
    },

    /// I/O error while writing the cache slot.
    #[error("cache I/O error for {path:?}: {source}")]
    CacheIo {
        /// Path to the cache file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to create HTTP client.
    #[error("failed to create HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
}

/// Outcome of one [`CloudSync::sync_once`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Repo indices whose cache slot was refreshed.
    pub fetched: Vec<usize>,
    /// Repo indices that failed both the direct and the fallback fetch.
    pub failed: Vec<usize>,
    /// Size of the merged table after the rebuild.
    pub entries: usize,
}

/// Fetches remote host lists into the cache directory and refreshes the table.
pub struct CloudSync {
    direct: Client,
    fallback: Option<Client>,
    repos: Vec<String>,
    data_dir: PathBuf,
    cache_dir: PathBuf,
    except: PatternSet,
    table: Arc<HostTable>,
    selected: Option<usize>,
}

impl CloudSync {
    /// Create a sync job.
    ///
    /// `fallback_port` is the port the proxy itself listens on; when set, a
    /// failed direct fetch is retried through `http://127.0.0.1:<port>`.
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP client cannot be created.
    pub fn new(
        repos: Vec<String>,
        data_dir: PathBuf,
        cache_dir: PathBuf,
        except: PatternSet,
        table: Arc<HostTable>,
        fallback_port: Option<u16>,
    ) -> Result<Self, SyncError> {
        let direct = Self::client_builder()
            .no_proxy()
            .build()
            .map_err(SyncError::ClientBuild)?;

        let fallback = fallback_port
            .map(|port| {
                let proxy = Proxy::all(format!("http://127.0.0.1:{port}"))
                    .map_err(SyncError::ClientBuild)?;
                Self::client_builder()
                    .proxy(proxy)
                    .build()
                    .map_err(SyncError::ClientBuild)
            })
            .transpose()?;

        Ok(Self {
            direct,
            fallback,
            repos,
            data_dir,
            cache_dir,
            except,
            table,
            selected: None,
        })
    }

    /// Only fetch the repo at `index`; the other cache slots are left as they are.
    #[must_use]
    pub fn with_selected_repo(mut self, index: Option<usize>) -> Self {
        self.selected = index;
        self
    }

    fn client_builder() -> reqwest::ClientBuilder {
        Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .gzip(true)
    }

    /// Run [`sync_once`](Self::sync_once) on a background task.
    pub fn spawn(self) -> JoinHandle<SyncReport> {
        tokio::spawn(async move { self.sync_once().await })
    }

    /// Fetch every repo, then rebuild and swap the host table.
    ///
    /// A failed repo is logged and skipped; it never aborts the others.
    pub async fn sync_once(&self) -> SyncReport {
        let mut report = SyncReport::default();

        for (index, url) in self.repos.iter().enumerate() {
            if self.selected.is_some_and(|selected| selected != index) {
                continue;
            }
            let cache_path = self.cache_path(index);
            match self.fetch_and_cache(url, &cache_path).await {
                Ok(()) => {
                    tracing::info!(index, url = %url, "synced cloud hosts");
                    report.fetched.push(index);
                }
                Err(err) => {
                    tracing::warn!(index, url = %url, error = %err, "failed to fetch cloud hosts");
                    report.failed.push(index);
                }
            }
        }

        report.entries = self.rebuild().await;
        report
    }

    async fn fetch_and_cache(&self, url: &str, cache_path: &Path) -> Result<(), SyncError> {
        let body = match self.fetch(&self.direct, url).await {
            Ok(body) => body,
            Err(err) => {
                let Some(fallback) = &self.fallback else {
                    return Err(err);
                };
                tracing::debug!(url = %url, error = %err, "direct fetch failed, retrying through local proxy");
                self.fetch(fallback, url).await?
            }
        };

        self.save_cache(cache_path, &body).await
    }

    async fn fetch(&self, client: &Client, url: &str) -> Result<Vec<u8>, SyncError> {
        let network_error = |err: reqwest::Error| {
            if err.is_timeout() {
                SyncError::Timeout {
                    url: url.to_string(),
                }
            } else {
                SyncError::Network {
                    url: url.to_string(),
                    source: err,
                }
            }
        };

        let response = client.get(url).send().await.map_err(network_error)?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(SyncError::HttpStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let body = response.bytes().await.map_err(network_error)?;
        Ok(body.to_vec())
    }

    /// Replace the cache slot with the raw body.
    ///
    /// The body goes to a hidden temporary file first and is renamed over the
    /// slot, so a failed write leaves the previous slot intact.
    async fn save_cache(&self, cache_path: &Path, content: &[u8]) -> Result<(), SyncError> {
        if let Some(parent) = cache_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| SyncError::CacheIo {
                    path: parent.to_path_buf(),
                    source: err,
                })?;
        }

        let staging = temp_path(cache_path);
        if let Err(err) = write_file(&staging, content).await {
            let _ = fs::remove_file(&staging).await;
            return Err(SyncError::CacheIo {
                path: staging,
                source: err,
            });
        }

        fs::rename(&staging, cache_path)
            .await
            .map_err(|err| SyncError::CacheIo {
                path: cache_path.to_path_buf(),
                source: err,
            })?;

        tracing::debug!(path = ?cache_path, bytes = content.len(), "saved cloud hosts to cache");
        Ok(())
    }

    /// Rebuild the merged table off the async runtime and swap it in.
    async fn rebuild(&self) -> usize {
        let data_dir = self.data_dir.clone();
        let cache_dir = self.cache_dir.clone();
        let except = self.except.clone();

        let mapping = match tokio::task::spawn_blocking(move || {
            HostTable::rebuild(&data_dir, &cache_dir, &except)
        })
        .await
        {
            Ok(mapping) => mapping,
            Err(err) => {
                tracing::error!(error = %err, "host table rebuild task failed");
                return self.table.len();
            }
        };

        let entries = mapping.len();
        self.table.swap(mapping);
        entries
    }

    fn cache_path(&self, index: usize) -> PathBuf {
        self.cache_dir.join(cache_file_name(index))
    }
}

/// `<dir>/.<name>.tmp`; hidden files are skipped by the merge pass.
fn temp_path(cache_path: &Path) -> PathBuf {
    let name = cache_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    cache_path.with_file_name(format!(".{name}.tmp"))
}

async fn write_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(content).await?;
    file.flush().await?;
    file.sync_all().await
}

/// Returns the default cloud hosts cache directory.
///
/// `~/.cache/autohost/hosts`, or `./user/.cache/autohost/hosts` when the home
/// directory cannot be determined.
#[must_use]
pub fn default_cache_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("./user"))
        .join(".cache")
        .join("autohost")
        .join("hosts")
}
