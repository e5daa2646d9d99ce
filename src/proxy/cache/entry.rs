use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use http::{HeaderMap, Uri};
use parking_lot::Mutex;
use tokio::fs::File;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::warn;

use super::freshness;
use super::key::{CacheKey, VarianceKey};
use super::meta::{EntryMeta, PersistedEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    New,
    Partial,
    Full,
    NotModified,
    NotCached,
    Error,
}

impl EntryState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, EntryState::New | EntryState::Partial)
    }

    fn rank(self) -> u8 {
        match self {
            EntryState::New => 0,
            EntryState::Partial => 1,
            _ => 2,
        }
    }

    /// Ordering key for variant selection: complete copies first.
    pub(crate) fn readiness(self) -> u8 {
        match self {
            EntryState::Full => 2,
            EntryState::Partial => 1,
            _ => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntryState::New => "new",
            EntryState::Partial => "partial",
            EntryState::Full => "full",
            EntryState::NotModified => "not_modified",
            EntryState::NotCached => "not_cached",
            EntryState::Error => "error",
        }
    }
}

/// Snapshot published to waiters on every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Progress {
    pub state: EntryState,
    pub size: u64,
    /// The current attempt's response head is installed. Only complete
    /// entries carry it over from an earlier attempt.
    pub headers_ready: bool,
    /// Bumped when the body restarts from byte zero.
    pub generation: u32,
    /// The fetch stopped retrying; waiters must not expect more bytes.
    pub abandoned: bool,
}

struct EntryInner {
    state: EntryState,
    meta: Option<EntryMeta>,
    vary: Option<VarianceKey>,
    size: u64,
    template: HeaderMap,
    stale: Option<Arc<CacheEntry>>,
    refreshing: Weak<CacheEntry>,
    uncacheable: bool,
}

#[derive(Default)]
struct ReceiverSet {
    slots: Vec<Arc<ReceiverSlot>>,
    idle_since: Option<Instant>,
}

struct ReceiverSlot {
    request_headers: HeaderMap,
    interrupted: AtomicBool,
    notify: Notify,
}

/// One stored response and the fetch that fills it.
pub(crate) struct CacheEntry {
    key: CacheKey,
    uri: Uri,
    path: PathBuf,
    inner: Mutex<EntryInner>,
    progress: watch::Sender<Progress>,
    receivers: Mutex<ReceiverSet>,
    receivers_changed: Notify,
    running: AtomicBool,
    restarts: AtomicU32,
    gave_up: AtomicBool,
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key.as_str())
            .field("path", &self.path)
            .field("progress", &*self.progress.borrow())
            .finish()
    }
}

impl CacheEntry {
    fn build(key: CacheKey, uri: Uri, path: PathBuf, inner: EntryInner) -> Arc<Self> {
        let (progress, _) = watch::channel(Progress {
            state: inner.state,
            size: inner.size,
            headers_ready: inner.state == EntryState::Full,
            generation: 0,
            abandoned: false,
        });
        Arc::new(Self {
            key,
            uri,
            path,
            inner: Mutex::new(inner),
            progress,
            receivers: Mutex::new(ReceiverSet::default()),
            receivers_changed: Notify::new(),
            running: AtomicBool::new(false),
            restarts: AtomicU32::new(0),
            gave_up: AtomicBool::new(false),
        })
    }

    /// Entry for a response not fetched yet. `stale` is the copy being
    /// revalidated, if any.
    pub(crate) fn pending(
        key: CacheKey,
        uri: Uri,
        path: PathBuf,
        template: HeaderMap,
        stale: Option<Arc<CacheEntry>>,
    ) -> Arc<Self> {
        Self::build(
            key,
            uri,
            path,
            EntryInner {
                state: EntryState::New,
                meta: None,
                vary: None,
                size: 0,
                template,
                stale,
                refreshing: Weak::new(),
                uncacheable: false,
            },
        )
    }

    /// Entry rebuilt from a data file and its sidecar. Returns `None` when
    /// the pair describes nothing worth serving or resuming.
    pub(crate) fn restored(
        key: CacheKey,
        uri: Uri,
        path: PathBuf,
        meta: EntryMeta,
        vary: VarianceKey,
        size: u64,
    ) -> Option<Arc<Self>> {
        if meta.status != http::StatusCode::OK {
            return None;
        }
        let complete = match meta.content_length {
            Some(length) => size >= length,
            None => meta.digest.is_some(),
        };
        let state = if complete {
            EntryState::Full
        } else if size > 0 {
            EntryState::Partial
        } else {
            return None;
        };
        Some(Self::build(
            key,
            uri,
            path,
            EntryInner {
                state,
                meta: Some(meta),
                vary: Some(vary),
                size,
                template: HeaderMap::new(),
                stale: None,
                refreshing: Weak::new(),
                uncacheable: false,
            },
        ))
    }

    pub(crate) fn key(&self) -> &CacheKey {
        &self.key
    }

    pub(crate) fn uri(&self) -> &Uri {
        &self.uri
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn state(&self) -> EntryState {
        self.inner.lock().state
    }

    pub(crate) fn size(&self) -> u64 {
        self.inner.lock().size
    }

    pub(crate) fn progress(&self) -> Progress {
        *self.progress.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    pub(crate) fn meta(&self) -> Option<EntryMeta> {
        self.inner.lock().meta.clone()
    }

    pub(crate) fn vary(&self) -> Option<VarianceKey> {
        self.inner.lock().vary.clone()
    }

    /// Unknown variance, before the response headers arrive, matches any
    /// request.
    pub(crate) fn matches(&self, request_headers: &HeaderMap) -> bool {
        match &self.inner.lock().vary {
            Some(vary) => vary.matches(request_headers),
            None => true,
        }
    }

    pub(crate) fn digest(&self) -> Option<String> {
        self.inner.lock().meta.as_ref().and_then(|m| m.digest.clone())
    }

    pub(crate) fn stale(&self) -> Option<Arc<CacheEntry>> {
        self.inner.lock().stale.clone()
    }

    pub(super) fn take_stale(&self) -> Option<Arc<CacheEntry>> {
        self.inner.lock().stale.take()
    }

    pub(crate) fn refreshing(&self) -> Option<Arc<CacheEntry>> {
        self.inner.lock().refreshing.upgrade()
    }

    pub(crate) fn set_refreshing(&self, entry: &Arc<CacheEntry>) {
        self.inner.lock().refreshing = Arc::downgrade(entry);
    }

    pub(crate) fn is_stale(&self, now: SystemTime) -> bool {
        let inner = self.inner.lock();
        match (&inner.meta, inner.state) {
            (Some(meta), EntryState::Full) => {
                freshness::freshness_lifetime(meta) <= freshness::current_age(meta, now)
            }
            _ => false,
        }
    }

    pub(crate) fn refreshness(&self, now: SystemTime) -> i64 {
        self.inner
            .lock()
            .meta
            .as_ref()
            .map(|meta| freshness::refreshness(meta, now))
            .unwrap_or(0)
    }

    /// The only place state changes. Moves forward through
    /// New, Partial, then one terminal state; anything else is refused.
    pub(crate) fn advance_state(&self, next: EntryState) -> bool {
        let mut inner = self.inner.lock();
        let current = inner.state;
        if current == next && !current.is_terminal() {
            return true;
        }
        if current.is_terminal() || next.rank() < current.rank() {
            warn!(
                key = %self.key,
                from = current.as_str(),
                to = next.as_str(),
                "refusing backwards cache entry transition"
            );
            return false;
        }
        inner.state = next;
        self.progress.send_modify(|p| p.state = next);
        true
    }

    pub(super) fn template(&self) -> HeaderMap {
        self.inner.lock().template.clone()
    }

    pub(super) fn is_uncacheable(&self) -> bool {
        self.inner.lock().uncacheable
    }

    /// Installs response headers. `restart_body` drops bytes already held
    /// because the origin sent a whole new representation.
    pub(super) fn publish_headers(
        &self,
        meta: EntryMeta,
        vary: VarianceKey,
        uncacheable: bool,
        restart_body: bool,
    ) {
        let mut inner = self.inner.lock();
        inner.meta = Some(meta);
        inner.vary = Some(vary);
        inner.uncacheable |= uncacheable;
        if restart_body {
            inner.size = 0;
        }
        let size = inner.size;
        self.progress.send_modify(|p| {
            p.headers_ready = true;
            p.size = size;
            if restart_body {
                p.generation = p.generation.wrapping_add(1);
            }
        });
    }

    /// A resume was accepted: the head kept from the earlier attempt still
    /// describes the body.
    pub(super) fn confirm_headers(&self) {
        self.progress.send_if_modified(|p| !std::mem::replace(&mut p.headers_ready, true));
    }

    pub(super) fn update_meta(&self, update: impl FnOnce(&mut EntryMeta)) {
        if let Some(meta) = self.inner.lock().meta.as_mut() {
            update(meta);
        }
    }

    /// Records bytes appended to the data file and wakes readers.
    pub(super) fn record_written(&self, bytes: u64) -> u64 {
        let mut inner = self.inner.lock();
        inner.size = inner.size.saturating_add(bytes);
        let size = inner.size;
        self.progress.send_modify(|p| p.size = size);
        size
    }

    /// Folds a not-modified outcome into this stored copy.
    pub(super) fn absorb_revalidation(
        &self,
        update: &HeaderMap,
        request_time: SystemTime,
        response_time: SystemTime,
    ) {
        self.update_meta(|meta| meta.absorb_revalidation(update, request_time, response_time));
    }

    pub(super) fn persisted(&self) -> Option<PersistedEntry> {
        let inner = self.inner.lock();
        let meta = inner.meta.as_ref()?;
        let vary = inner.vary.as_ref().map(VarianceKey::to_pairs).unwrap_or_default();
        Some(meta.to_persisted(self.key.as_str(), &self.uri.to_string(), vary))
    }

    pub(crate) fn register(self: &Arc<Self>, request_headers: HeaderMap) -> Receiver {
        let slot = Arc::new(ReceiverSlot {
            request_headers,
            interrupted: AtomicBool::new(false),
            notify: Notify::new(),
        });
        {
            let mut set = self.receivers.lock();
            set.slots.push(slot.clone());
            set.idle_since = None;
        }
        self.receivers_changed.notify_one();
        Receiver {
            entry: self.clone(),
            slot,
            body: None,
        }
    }

    fn unregister(&self, slot: &Arc<ReceiverSlot>) {
        {
            let mut set = self.receivers.lock();
            set.slots.retain(|other| !Arc::ptr_eq(other, slot));
            if set.slots.is_empty() {
                set.idle_since = Some(Instant::now());
            }
        }
        self.receivers_changed.notify_one();
    }

    pub(crate) fn receiver_count(&self) -> usize {
        self.receivers.lock().slots.len()
    }

    /// Wakes every receiver whose request negotiates a different variant
    /// than the headers just received.
    pub(super) fn interrupt_mismatched(&self) -> usize {
        let Some(vary) = self.vary() else {
            return 0;
        };
        let set = self.receivers.lock();
        let mut interrupted = 0;
        for slot in &set.slots {
            if !vary.matches(&slot.request_headers) {
                slot.interrupted.store(true, Ordering::SeqCst);
                slot.notify.notify_one();
                interrupted += 1;
            }
        }
        interrupted
    }

    /// Resolves once no receiver has been attached for `grace`.
    pub(super) async fn wait_abandoned(&self, grace: Duration) {
        loop {
            let changed = self.receivers_changed.notified();
            let idle_since = {
                let mut set = self.receivers.lock();
                if set.slots.is_empty() {
                    Some(*set.idle_since.get_or_insert_with(Instant::now))
                } else {
                    None
                }
            };
            match idle_since {
                None => changed.await,
                Some(since) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(since + grace) => {
                            if self.receiver_count() == 0 {
                                return;
                            }
                        }
                        _ = changed => {}
                    }
                }
            }
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(super) fn try_start(&self) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.gave_up.store(false, Ordering::SeqCst);
        self.progress.send_if_modified(|p| {
            let was_abandoned = std::mem::replace(&mut p.abandoned, false);
            let had_headers =
                p.state != EntryState::Full && std::mem::replace(&mut p.headers_ready, false);
            was_abandoned || had_headers
        });
        true
    }

    pub(super) fn finish_run(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Re-arms an idle entry for a new client: fresh retry budget and the
    /// new request's headers for the origin round trip.
    pub(super) fn prepare_restart(&self, template: &HeaderMap) {
        self.inner.lock().template = template.clone();
        self.restarts.store(0, Ordering::SeqCst);
    }

    pub(super) fn bump_restarts(&self) -> u32 {
        self.restarts.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(super) fn reset_restarts(&self) {
        self.restarts.store(0, Ordering::SeqCst);
    }

    pub(super) fn set_gave_up(&self) {
        self.gave_up.store(true, Ordering::SeqCst);
    }

    pub(crate) fn gave_up(&self) -> bool {
        self.gave_up.load(Ordering::SeqCst)
    }

    pub(super) fn mark_abandoned(&self) {
        self.progress.send_modify(|p| p.abandoned = true);
    }
}

/// A client attached to an entry. Dropping it detaches the client.
pub(crate) struct Receiver {
    entry: Arc<CacheEntry>,
    slot: Arc<ReceiverSlot>,
    body: Option<File>,
}

impl Receiver {
    pub(crate) fn entry(&self) -> &Arc<CacheEntry> {
        &self.entry
    }

    pub(crate) fn request_headers(&self) -> &HeaderMap {
        &self.slot.request_headers
    }

    /// Opens the data file now so the bytes stay readable even if the
    /// fetch unlinks the file before this client is done.
    pub(crate) async fn open_body(&mut self) {
        if self.body.is_none() {
            self.body = File::open(self.entry.path()).await.ok();
        }
    }

    pub(crate) fn take_body(&mut self) -> Option<File> {
        self.body.take()
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.slot.interrupted.load(Ordering::SeqCst)
    }

    pub(crate) async fn interrupted(&self) {
        loop {
            let notified = self.slot.notify.notified();
            if self.is_interrupted() {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.entry.unregister(&self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::from_unix_secs;
    use http::header::{ACCEPT_LANGUAGE, VARY};
    use http::{HeaderValue, StatusCode};

    fn entry() -> Arc<CacheEntry> {
        let key = CacheKey::from_key("http://example.com:80/x".to_string());
        CacheEntry::pending(
            key,
            Uri::from_static("http://example.com/x"),
            PathBuf::from("/nonexistent/entry.0"),
            HeaderMap::new(),
            None,
        )
    }

    fn meta(content_length: Option<u64>) -> EntryMeta {
        EntryMeta {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            content_length,
            digest: None,
            not_modified_count: 0,
            last_not_modified: None,
            request_time: from_unix_secs(0),
            response_time: from_unix_secs(0),
            created: from_unix_secs(0),
        }
    }

    #[test]
    fn state_only_moves_forward() {
        let entry = entry();
        assert!(entry.advance_state(EntryState::Partial));
        assert!(!entry.advance_state(EntryState::New));
        assert!(entry.advance_state(EntryState::Full));
        assert!(!entry.advance_state(EntryState::Error));
        assert!(!entry.advance_state(EntryState::Full));
        assert_eq!(entry.progress().state, EntryState::Full);
    }

    #[test]
    fn restored_state_follows_file_size() {
        let key = CacheKey::from_key("k".to_string());
        let uri = Uri::from_static("http://example.com/x");
        let full = CacheEntry::restored(
            key.clone(),
            uri.clone(),
            PathBuf::from("a"),
            meta(Some(10)),
            VarianceKey::empty(),
            10,
        )
        .expect("full");
        assert_eq!(full.state(), EntryState::Full);
        assert!(full.progress().headers_ready);
        let partial = CacheEntry::restored(
            key.clone(),
            uri.clone(),
            PathBuf::from("b"),
            meta(Some(10)),
            VarianceKey::empty(),
            4,
        )
        .expect("partial");
        assert_eq!(partial.state(), EntryState::Partial);
        assert!(!partial.progress().headers_ready);
        assert!(
            CacheEntry::restored(key, uri, PathBuf::from("c"), meta(None), VarianceKey::empty(), 0)
                .is_none()
        );
    }

    #[test]
    fn receivers_detach_on_drop() {
        let entry = entry();
        let first = entry.register(HeaderMap::new());
        let second = entry.register(HeaderMap::new());
        assert_eq!(entry.receiver_count(), 2);
        drop(first);
        assert_eq!(entry.receiver_count(), 1);
        drop(second);
        assert_eq!(entry.receiver_count(), 0);
    }

    #[tokio::test]
    async fn mismatched_receivers_are_interrupted() {
        let entry = entry();
        let mut finnish = HeaderMap::new();
        finnish.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("fi"));
        let mut english = HeaderMap::new();
        english.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en"));
        let fi = entry.register(finnish.clone());
        let en = entry.register(english);

        let mut response = HeaderMap::new();
        response.insert(VARY, HeaderValue::from_static("Accept-Language"));
        let vary = VarianceKey::from_response(&response, &finnish).expect("cacheable");
        entry.publish_headers(meta(None), vary, false, false);

        assert_eq!(entry.interrupt_mismatched(), 1);
        assert!(!fi.is_interrupted());
        assert!(en.is_interrupted());
        en.interrupted().await;
        assert!(entry.progress().headers_ready);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_abandoned_honours_grace() {
        let entry = entry();
        let receiver = entry.register(HeaderMap::new());
        let waiter = {
            let entry = entry.clone();
            tokio::spawn(async move { entry.wait_abandoned(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!waiter.is_finished());
        drop(receiver);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());
        tokio::time::sleep(Duration::from_secs(2)).await;
        waiter.await.expect("join");
    }

    #[test]
    fn restart_bookkeeping() {
        let entry = entry();
        assert!(entry.try_start());
        assert!(!entry.try_start());
        assert_eq!(entry.bump_restarts(), 1);
        entry.mark_abandoned();
        entry.finish_run();
        assert!(entry.progress().abandoned);
        assert!(entry.try_start());
        assert!(!entry.progress().abandoned);
        entry.prepare_restart(&HeaderMap::new());
        assert_eq!(entry.bump_restarts(), 1);
    }

    #[test]
    fn each_attempt_must_publish_its_own_head() {
        let entry = entry();
        assert!(entry.try_start());
        entry.publish_headers(meta(Some(10)), VarianceKey::empty(), false, false);
        entry.record_written(5);
        entry.advance_state(EntryState::Partial);
        entry.finish_run();
        assert!(entry.progress().headers_ready);

        assert!(entry.try_start());
        let progress = entry.progress();
        assert!(!progress.headers_ready);
        assert_eq!(progress.size, 5);
        entry.confirm_headers();
        assert!(entry.progress().headers_ready);
    }
}
