mod compare;
mod deleter;
mod entry;
mod evictor;
mod freshness;
mod key;
mod maintenance;
mod meta;
mod reader;
mod registry;
mod store;
mod transfer;

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::proxy::http::codec::{ResponseBodyPlan, encode_http1_response_head};
use crate::proxy::origin::Origin;
use crate::settings::Settings;

pub use entry::EntryState;

use deleter::Deleter;
use entry::{CacheEntry, Receiver};
use evictor::spawn_evictor;
use freshness::request_is_cacheable;
use key::{CacheKey, VarianceKey};
use maintenance::{
    BackgroundTasks, prepare_versioned_cache_dir, spawn_cache_dir_cleanup, spawn_restart_sweep,
};
use meta::EntryMeta;
use reader::{Delivery, WaitOutcome, read_from_cache, serve_entry};
use registry::Registry;
use store::CacheStore;

/// A lookup that keeps losing races (variant mismatches, files vanishing
/// underneath it) gives up after this many rounds and is passed through.
const MAX_LOOKUP_ATTEMPTS: usize = 4;

const GATEWAY_ERROR_BODY: &[u8] = b"origin fetch failed\n";

#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub dir: PathBuf,
    pub max_size: u64,
    pub max_entries: NonZeroUsize,
    /// How long a client with a stale copy waits for the refresh before
    /// the stale copy is served.
    pub refresh_timeout: Duration,
    pub max_restart_count: u32,
    pub worker_pool_size: usize,
    pub restart_interval: Duration,
    pub eviction_interval: Duration,
    pub max_chunk_size: usize,
    pub disconnect_grace: Duration,
    pub deletion_queue_capacity: usize,
}

impl CacheOptions {
    /// `None` when no cache directory is configured.
    pub fn from_settings(settings: &Settings) -> Result<Option<Self>> {
        let Some(dir) = settings.cache_dir.clone() else {
            return Ok(None);
        };
        Ok(Some(Self {
            dir,
            max_size: settings.cache_max_size,
            max_entries: settings.cache_max_entries_nonzero()?,
            refresh_timeout: settings.refresh_timeout(),
            max_restart_count: settings.max_restart_count,
            worker_pool_size: settings.worker_pool_size,
            restart_interval: settings.restart_interval(),
            eviction_interval: settings.eviction_interval(),
            max_chunk_size: settings.max_chunk_size,
            disconnect_grace: settings.disconnect_grace(),
            deletion_queue_capacity: settings.deletion_queue_capacity,
        }))
    }
}

pub(crate) struct CacheState {
    options: CacheOptions,
    store: CacheStore,
    registry: Registry,
    deleter: Deleter,
    origin: Arc<dyn Origin>,
    clock: SharedClock,
    pool: Arc<Semaphore>,
}

#[derive(Clone)]
pub struct HttpCache {
    state: Arc<CacheState>,
    _tasks: Arc<BackgroundTasks>,
}

/// The parts of a client request the cache looks at.
#[derive(Debug, Clone)]
pub struct CacheRequest {
    pub method: Method,
    /// Absolute-form target.
    pub uri: Uri,
    pub headers: HeaderMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOutcome {
    /// A fresh or revalidated stored copy answered the request.
    ServedFromCache,
    /// The refresh did not finish in time (or failed) and the stale copy
    /// answered instead.
    ServedStale,
    /// The response came from an origin fetch, streamed through the cache.
    Fetched,
    /// Nothing was written; the caller should forward the request itself.
    NoCache,
}

impl LookupOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            LookupOutcome::ServedFromCache => "hit",
            LookupOutcome::ServedStale => "stale",
            LookupOutcome::Fetched => "miss",
            LookupOutcome::NoCache => "bypass",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Lookup {
    pub outcome: LookupOutcome,
    pub status: Option<StatusCode>,
    pub bytes: u64,
}

impl Lookup {
    fn bypass() -> Self {
        Self {
            outcome: LookupOutcome::NoCache,
            status: None,
            bytes: 0,
        }
    }

    fn delivered(outcome: LookupOutcome, delivery: Delivery) -> Self {
        Self {
            outcome,
            status: Some(delivery.status),
            bytes: delivery.bytes,
        }
    }
}

/// What a lookup decided to do while it held the key's variant list.
enum Plan {
    Fresh(Arc<CacheEntry>),
    /// Wait a bounded time for a refresh, falling back to `stale`.
    Refresh {
        receiver: Receiver,
        stale: Arc<CacheEntry>,
    },
    /// Stream whatever the fetch behind `receiver` produces.
    Join(Receiver),
}

impl HttpCache {
    pub async fn new(
        options: CacheOptions,
        origin: Arc<dyn Origin>,
        clock: SharedClock,
    ) -> Result<Self> {
        let (root, cleanup_dirs) = prepare_versioned_cache_dir(&options.dir).await?;
        spawn_cache_dir_cleanup(cleanup_dirs);

        let store = CacheStore::new(root.clone());
        match store.remove_orphans().await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "removed cache files without metadata"),
            Err(err) => warn!(error = %err, "failed to scan cache for orphaned files"),
        }

        let deleter = Deleter::spawn(store.clone(), options.deletion_queue_capacity);
        let evictor = spawn_evictor(
            root.clone(),
            options.max_size,
            options.eviction_interval,
            deleter.clone(),
        );

        let state = Arc::new(CacheState {
            registry: Registry::new(options.max_entries),
            pool: Arc::new(Semaphore::new(options.worker_pool_size.max(1))),
            store,
            deleter,
            origin,
            clock,
            options,
        });
        let sweep = spawn_restart_sweep(state.clone(), state.options.restart_interval);
        info!(dir = %root.display(), "cache ready");
        Ok(Self {
            state,
            _tasks: Arc::new(BackgroundTasks::new([evictor, sweep])),
        })
    }

    /// Answers `request` from the cache, fetching through it as needed.
    /// `NoCache` means nothing was written to `client`.
    pub async fn lookup<W>(&self, request: &CacheRequest, client: &mut W) -> Result<Lookup>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let lookup = self.lookup_inner(request, client).await;
        if let Ok(lookup) = &lookup {
            crate::metrics::record_cache_lookup(lookup.outcome.as_str());
        }
        lookup
    }

    async fn lookup_inner<W>(&self, request: &CacheRequest, client: &mut W) -> Result<Lookup>
    where
        W: AsyncWrite + Unpin + Send,
    {
        if !request_is_cacheable(&request.method, &request.headers) {
            return Ok(Lookup::bypass());
        }
        let key = match CacheKey::from_uri(&request.uri) {
            Ok(key) => key,
            Err(err) => {
                debug!(uri = %request.uri, error = %err, "request target has no cache key");
                return Ok(Lookup::bypass());
            }
        };

        for attempt in 0..MAX_LOOKUP_ATTEMPTS {
            let plan = self.state.plan(&key, request).await?;
            let lookup = match plan {
                Plan::Fresh(entry) => {
                    serve_entry(&self.state, &entry, &request.headers, client, None)
                        .await?
                        .map(|delivery| Lookup::delivered(LookupOutcome::ServedFromCache, delivery))
                }
                Plan::Join(mut receiver) => {
                    let outcome = read_from_cache(&self.state, &mut receiver, client, None).await;
                    drop(receiver);
                    match outcome {
                        WaitOutcome::Served(delivery) => {
                            Some(Lookup::delivered(LookupOutcome::Fetched, delivery))
                        }
                        WaitOutcome::Truncated(delivery) => {
                            debug!(key = %key, bytes = delivery.bytes, "response cut short");
                            Some(Lookup::delivered(LookupOutcome::Fetched, delivery))
                        }
                        WaitOutcome::NoMatch | WaitOutcome::NotModified => None,
                        WaitOutcome::Failed | WaitOutcome::Timeout => {
                            Some(write_gateway_error(client).await?)
                        }
                        WaitOutcome::UserAgentGaveUp => {
                            return Err(anyhow!("client stopped reading"));
                        }
                    }
                }
                Plan::Refresh {
                    mut receiver,
                    stale,
                } => {
                    let bound = Some(self.state.options.refresh_timeout);
                    let outcome = read_from_cache(&self.state, &mut receiver, client, bound).await;
                    drop(receiver);
                    let fallback = match outcome {
                        WaitOutcome::Served(delivery) | WaitOutcome::Truncated(delivery) => {
                            Some(Lookup::delivered(LookupOutcome::Fetched, delivery))
                        }
                        WaitOutcome::NoMatch => None,
                        WaitOutcome::UserAgentGaveUp => {
                            return Err(anyhow!("client stopped reading"));
                        }
                        WaitOutcome::NotModified => {
                            serve_entry(&self.state, &stale, &request.headers, client, None)
                                .await?
                                .map(|delivery| {
                                    Lookup::delivered(LookupOutcome::ServedFromCache, delivery)
                                })
                        }
                        WaitOutcome::Timeout | WaitOutcome::Failed => {
                            debug!(key = %key, outcome = ?outcome, "serving stale copy");
                            serve_entry(&self.state, &stale, &request.headers, client, None)
                                .await?
                                .map(|delivery| Lookup::delivered(LookupOutcome::ServedStale, delivery))
                        }
                    };
                    fallback
                }
            };
            if let Some(lookup) = lookup {
                return Ok(lookup);
            }
            debug!(key = %key, attempt, "cache lookup retrying");
        }
        Ok(Lookup::bypass())
    }

    /// Runs one eviction pass now and returns how many files it queued.
    pub async fn run_eviction(&self) -> Result<u64> {
        let stats =
            evictor::sweep(self.state.store.root(), self.state.options.max_size, &self.state.deleter)
                .await?;
        Ok(stats.queued)
    }

    /// Waits until every queued deletion has been carried out.
    pub async fn flush_deletions(&self) {
        self.state.deleter.flush().await;
    }

    /// Waits for in-flight origin fetches to stop, up to `limit`. Returns
    /// whether everything settled.
    pub async fn drain(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let busy = self
                .state
                .registry
                .live_entries()
                .iter()
                .filter(|entry| entry.is_running())
                .count();
            if busy == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(busy, "origin fetches still running");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn write_gateway_error<W>(client: &mut W) -> Result<Lookup>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    let head = encode_http1_response_head(
        StatusCode::BAD_GATEWAY,
        &headers,
        ResponseBodyPlan::Fixed(GATEWAY_ERROR_BODY.len() as u64),
    );
    client.write_all(&head).await.context("writing 502 to client")?;
    client
        .write_all(GATEWAY_ERROR_BODY)
        .await
        .context("writing 502 body to client")?;
    client.flush().await.context("flushing client")?;
    Ok(Lookup {
        outcome: LookupOutcome::Fetched,
        status: Some(StatusCode::BAD_GATEWAY),
        bytes: GATEWAY_ERROR_BODY.len() as u64,
    })
}

impl CacheState {
    async fn plan(self: &Arc<Self>, key: &CacheKey, request: &CacheRequest) -> Result<Plan> {
        let list = self.registry.variants(key.as_str());
        let mut entries = list.entries.lock().await;
        self.prune(&mut entries).await;
        if entries.is_empty() {
            *entries = self.rebuild(key).await;
        }

        let now = self.clock.now();
        entries.sort_by(|a, b| {
            b.state()
                .readiness()
                .cmp(&a.state().readiness())
                .then_with(|| a.refreshness(now).cmp(&b.refreshness(now)))
        });

        // Only the best entry per variant is considered; idle runners-up
        // for the same variant are dropped.
        let mut leaders: Vec<Arc<CacheEntry>> = Vec::new();
        let mut redundant = Vec::new();
        entries.retain(|entry| {
            let vary = entry.vary();
            if leaders.iter().any(|leader| leader.vary() == vary) {
                if !entry.is_running() && entry.receiver_count() == 0 {
                    redundant.push(entry.clone());
                    return false;
                }
                return true;
            }
            leaders.push(entry.clone());
            true
        });
        for entry in redundant {
            debug!(key = %key, path = %entry.path().display(), "dropping superseded variant");
            self.discard(&entry).await;
        }

        let chosen = leaders
            .into_iter()
            .find(|entry| entry.matches(&request.headers));

        match chosen {
            Some(entry) if entry.state() == EntryState::Full => {
                if !entry.is_stale(now) {
                    return Ok(Plan::Fresh(entry));
                }
                if let Some(live) = entry.refreshing()
                    && !live.state().is_terminal()
                {
                    let receiver = self.attach(&live, request).await;
                    return Ok(Plan::Refresh {
                        receiver,
                        stale: entry,
                    });
                }
                let live = self.create_entry(key, request, Some(entry.clone())).await?;
                entry.set_refreshing(&live);
                debug!(key = %key, "stored copy is stale; refreshing");
                let receiver = self.attach(&live, request).await;
                Ok(Plan::Refresh {
                    receiver,
                    stale: entry,
                })
            }
            Some(entry) => {
                let receiver = self.attach(&entry, request).await;
                Ok(Plan::Join(receiver))
            }
            None => {
                let entry = self.create_entry(key, request, None).await?;
                entries.push(entry.clone());
                let receiver = self.attach(&entry, request).await;
                Ok(Plan::Join(receiver))
            }
        }
    }

    /// Registers a client on `entry` and makes sure a fetch is running.
    async fn attach(self: &Arc<Self>, entry: &Arc<CacheEntry>, request: &CacheRequest) -> Receiver {
        let mut receiver = entry.register(request.headers.clone());
        receiver.open_body().await;
        if !entry.is_running() && !entry.state().is_terminal() {
            entry.prepare_restart(&request.headers);
            self.submit(entry.clone());
        }
        receiver
    }

    async fn create_entry(
        &self,
        key: &CacheKey,
        request: &CacheRequest,
        stale: Option<Arc<CacheEntry>>,
    ) -> Result<Arc<CacheEntry>> {
        let pending = self.deleter.pending_snapshot();
        let path = self.store.allocate(key, &pending).await?;
        let entry = CacheEntry::pending(
            key.clone(),
            request.uri.clone(),
            path,
            request.headers.clone(),
            stale,
        );
        self.registry.track(&entry);
        Ok(entry)
    }

    /// Drops entries that can no longer serve anyone: failed or discarded
    /// fetches, and copies whose file is gone or queued for deletion.
    async fn prune(&self, entries: &mut Vec<Arc<CacheEntry>>) {
        let mut kept = Vec::with_capacity(entries.len());
        for entry in entries.drain(..) {
            let state = entry.state();
            if state.is_terminal() && state != EntryState::Full {
                continue;
            }
            if !entry.is_running() {
                let exists = tokio::fs::try_exists(entry.path()).await.unwrap_or(false);
                if !exists || self.deleter.is_pending(entry.path()) {
                    self.registry.forget(&entry);
                    continue;
                }
            }
            kept.push(entry);
        }
        *entries = kept;
    }

    /// Reconstructs the variant list for `key` from its files on disk.
    async fn rebuild(&self, key: &CacheKey) -> Vec<Arc<CacheEntry>> {
        let paths = match self.store.list_variants(key).await {
            Ok(paths) => paths,
            Err(err) => {
                warn!(key = %key, error = %err, "failed to list cached variants");
                return Vec::new();
            }
        };

        let mut rebuilt = Vec::new();
        for path in paths {
            if self.deleter.is_pending(&path) {
                continue;
            }
            if let Some(live) = self.registry.live(&path) {
                let state = live.state();
                let refreshing = live.stale().is_some() && state != EntryState::Full;
                if !refreshing && (state == EntryState::Full || !state.is_terminal()) {
                    rebuilt.push(live);
                }
                continue;
            }

            let Some(record) = CacheStore::read_meta(&path).await else {
                debug!(path = %path.display(), "data file without metadata");
                self.deleter.queue(path).await;
                continue;
            };
            if record.key != key.as_str() {
                // Digest collision: the file belongs to another key.
                continue;
            }
            let restored = match (EntryMeta::from_persisted(&record), record.uri.parse::<Uri>()) {
                (Some(meta), Ok(uri)) => {
                    let size = tokio::fs::metadata(&path)
                        .await
                        .map(|metadata| metadata.len())
                        .unwrap_or(0);
                    let vary = VarianceKey::from_pairs(&record.vary);
                    CacheEntry::restored(key.clone(), uri, path.clone(), meta, vary, size)
                }
                _ => None,
            };
            match restored {
                Some(entry) => {
                    self.registry.track(&entry);
                    rebuilt.push(entry);
                }
                None => {
                    debug!(path = %path.display(), "cached file is unusable");
                    self.deleter.queue(path).await;
                }
            }
        }
        if !rebuilt.is_empty() {
            debug!(key = %key, variants = rebuilt.len(), "rebuilt cache entries from disk");
        }
        rebuilt
    }
}
