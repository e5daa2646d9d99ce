pub mod cli;
pub mod clock;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod settings;
pub mod util;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use crate::clock::SystemClock;
use crate::proxy::cache::{CacheOptions, HttpCache};
use crate::proxy::origin::{Http1Origin, Origin};
use crate::settings::Settings;

/// How long shutdown waits for origin fetches that are still filling the
/// cache.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    if let Some(addr) = settings.metrics_listen {
        tokio::spawn(async move {
            info!(address = %addr, "metrics endpoint starting");
            if let Err(err) = crate::metrics::serve(addr).await {
                tracing::error!(error = %err, "metrics endpoint failed");
            }
        });
    }

    let origin: Arc<dyn Origin> = Arc::new(Http1Origin::new(
        settings.upstream_connect_timeout(),
        settings.upstream_timeout(),
        settings.max_response_header_size,
    ));
    let cache = match CacheOptions::from_settings(&settings)? {
        Some(options) => {
            Some(HttpCache::new(options, origin.clone(), Arc::new(SystemClock)).await?)
        }
        None => {
            info!("no cache_dir configured; forwarding without caching");
            None
        }
    };

    let app = proxy::AppContext::new(settings, origin, cache.clone());
    tokio::select! {
        result = proxy::run(app) => result,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("shutdown requested");
            if let Some(cache) = cache {
                cache.drain(SHUTDOWN_DRAIN).await;
                cache.flush_deletions().await;
            }
            Ok(())
        }
    }
}
