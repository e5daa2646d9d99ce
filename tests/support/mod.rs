#![allow(clippy::type_complexity)]
#![allow(dead_code)]

mod http_utils;
mod origin;

pub use http_utils::*;
pub use origin::*;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration as StdDuration, SystemTime, UNIX_EPOCH};

use anyhow::{Result, anyhow};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use cachebay::{
    clock::ManualClock,
    proxy::{
        self, AppContext,
        cache::{CacheOptions, HttpCache},
        origin::{Http1Origin, Origin},
    },
    settings::Settings,
};

/// Start of every test clock, on a whole second so HTTP dates line up.
pub const CLOCK_START_SECS: u64 = 1_700_000_000;

pub fn clock_start() -> SystemTime {
    UNIX_EPOCH + StdDuration::from_secs(CLOCK_START_SECS)
}

pub fn http_date_at(offset_secs: i64) -> String {
    let at = if offset_secs >= 0 {
        clock_start() + StdDuration::from_secs(offset_secs as u64)
    } else {
        clock_start() - StdDuration::from_secs(offset_secs.unsigned_abs())
    };
    httpdate::fmt_http_date(at)
}

pub fn find_free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

pub async fn wait_for_listener(addr: SocketAddr) -> Result<()> {
    for _ in 0..50 {
        match timeout(StdDuration::from_millis(50), TcpStream::connect(addr)).await {
            Ok(Ok(mut stream)) => {
                stream.shutdown().await.ok();
                return Ok(());
            }
            _ => sleep(StdDuration::from_millis(50)).await,
        }
    }
    Err(anyhow!("listener {addr} did not become ready"))
}

/// Settings tuned for tests: short grace periods and no background sweeps
/// that would race the assertions.
pub fn default_test_settings(listen: SocketAddr, cache_dir: Option<PathBuf>) -> Settings {
    let mut settings = Settings::with_defaults(listen);
    settings.client_timeout = 5;
    settings.upstream_connect_timeout = 2;
    settings.upstream_timeout = 5;
    settings.cache_dir = cache_dir;
    settings.refresh_timeout_ms = 2_000;
    settings.max_restart_count = 1;
    settings.worker_pool_size = 4;
    settings.restart_interval = 3_600;
    settings.eviction_interval = 3_600;
    settings.max_chunk_size = 16;
    settings.disconnect_grace_ms = 200;
    settings.deletion_queue_capacity = 64;
    settings
}

pub struct ProxyHarness {
    pub addr: SocketAddr,
    pub settings: Arc<Settings>,
    pub cache: Option<HttpCache>,
    pub clock: ManualClock,
    cache_dir: Option<TempDir>,
    handle: JoinHandle<()>,
}

impl ProxyHarness {
    pub fn cache(&self) -> &HttpCache {
        self.cache.as_ref().expect("harness was built without a cache")
    }

    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_ref().map(TempDir::path)
    }

    /// Data files currently on disk, sidecars excluded.
    pub fn data_files(&self) -> Vec<PathBuf> {
        let Some(root) = self.cache_dir() else {
            return Vec::new();
        };
        let mut found = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.extension().is_none_or(|ext| ext != "meta") {
                    found.push(path);
                }
            }
        }
        found
    }

    /// Lets background fetches settle and queued deletions run.
    pub async fn settle(&self) {
        if let Some(cache) = &self.cache {
            assert!(
                cache.drain(StdDuration::from_secs(5)).await,
                "origin fetches did not settle"
            );
            cache.flush_deletions().await;
        }
    }
}

impl Drop for ProxyHarness {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct ProxyHarnessBuilder {
    with_cache: bool,
    clock: ManualClock,
    settings_override: Option<Box<dyn FnOnce(&mut Settings) + Send>>,
}

impl Default for ProxyHarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyHarnessBuilder {
    pub fn new() -> Self {
        Self {
            with_cache: true,
            clock: ManualClock::new(clock_start()),
            settings_override: None,
        }
    }

    pub fn without_cache(mut self) -> Self {
        self.with_cache = false;
        self
    }

    pub fn with_settings<F>(mut self, func: F) -> Self
    where
        F: FnOnce(&mut Settings) + Send + 'static,
    {
        self.settings_override = Some(Box::new(func));
        self
    }

    pub async fn spawn(mut self) -> Result<ProxyHarness> {
        let proxy_port = find_free_port()?;
        let proxy_addr: SocketAddr = format!("127.0.0.1:{proxy_port}")
            .parse()
            .expect("valid listen address");

        let cache_dir = if self.with_cache {
            Some(TempDir::new()?)
        } else {
            None
        };
        let mut settings = default_test_settings(
            proxy_addr,
            cache_dir.as_ref().map(|dir| dir.path().to_path_buf()),
        );
        if let Some(override_fn) = self.settings_override.take() {
            override_fn(&mut settings);
        }
        let proxy_addr = settings.listen;
        let settings = Arc::new(settings);

        let origin: Arc<dyn Origin> = Arc::new(Http1Origin::new(
            settings.upstream_connect_timeout(),
            settings.upstream_timeout(),
            settings.max_response_header_size,
        ));
        let cache = match CacheOptions::from_settings(&settings)? {
            Some(options) => Some(
                HttpCache::new(options, origin.clone(), Arc::new(self.clock.clone())).await?,
            ),
            None => None,
        };

        let app = AppContext::new(settings.clone(), origin, cache.clone());
        let handle = tokio::spawn(async move {
            if let Err(err) = proxy::run(app).await {
                tracing::error!(error = ?err, "proxy run failed");
            }
        });

        wait_for_listener(proxy_addr).await?;

        Ok(ProxyHarness {
            addr: proxy_addr,
            settings,
            cache,
            clock: self.clock,
            cache_dir,
            handle,
        })
    }
}
