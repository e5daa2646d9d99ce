use std::io::SeekFrom;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, anyhow};
use http::header::{
    CONTENT_RANGE, HOST, IF_MATCH, IF_MODIFIED_SINCE, IF_NONE_MATCH, IF_RANGE,
    IF_UNMODIFIED_SINCE, RANGE,
};
use http::{HeaderMap, HeaderValue, StatusCode};
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, trace, warn};

use crate::proxy::headers::strip_hop_by_hop;
use crate::proxy::origin::{OriginBody, OriginRequest, OriginResponse};

use super::CacheState;
use super::entry::{CacheEntry, EntryState};
use super::freshness::response_is_storable;
use super::key::VarianceKey;
use super::meta::EntryMeta;
use super::store::CacheStore;

#[derive(Debug, Error)]
pub(crate) enum TransferError {
    #[error("every client left before the body was complete")]
    ClientsGone,
    #[error("origin resumed at byte {got}, expected {expected}")]
    UnexpectedRange { expected: u64, got: u64 },
    #[error("origin body ended after {received} of {expected} bytes")]
    Incomplete { received: u64, expected: u64 },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchKind {
    Initial,
    Conditional,
    Resume,
}

impl FetchKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            FetchKind::Initial => "initial",
            FetchKind::Conditional => "conditional",
            FetchKind::Resume => "resume",
        }
    }
}

const CLIENT_VALIDATORS: [http::header::HeaderName; 6] = [
    IF_MATCH,
    IF_NONE_MATCH,
    IF_MODIFIED_SINCE,
    IF_UNMODIFIED_SINCE,
    IF_RANGE,
    RANGE,
];

fn fetch_kind(entry: &CacheEntry) -> FetchKind {
    if entry.state() == EntryState::Partial && entry.size() > 0 {
        return FetchKind::Resume;
    }
    let has_validators = entry
        .stale()
        .and_then(|stale| stale.meta())
        .is_some_and(|meta| meta.etag().is_some() || meta.last_modified().is_some());
    if has_validators {
        FetchKind::Conditional
    } else {
        FetchKind::Initial
    }
}

fn insert_str(headers: &mut HeaderMap, name: http::header::HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// Origin request for one attempt: the client's end-to-end headers minus
/// its own validators, plus whatever validators this attempt needs.
fn build_request(entry: &CacheEntry, kind: FetchKind) -> anyhow::Result<OriginRequest> {
    let mut headers = entry.template();
    strip_hop_by_hop(&mut headers);
    for name in CLIENT_VALIDATORS {
        headers.remove(name);
    }
    let authority = entry
        .uri()
        .authority()
        .ok_or_else(|| anyhow!("cache entry {} has no authority", entry.key()))?;
    headers.insert(
        HOST,
        HeaderValue::from_str(authority.as_str()).context("invalid origin authority")?,
    );

    match kind {
        FetchKind::Initial => {}
        FetchKind::Conditional => {
            if let Some(meta) = entry.stale().and_then(|stale| stale.meta()) {
                if let Some(etag) = meta.etag() {
                    insert_str(&mut headers, IF_NONE_MATCH, etag);
                }
                if let Some(last_modified) = meta.last_modified() {
                    insert_str(&mut headers, IF_MODIFIED_SINCE, last_modified);
                }
            }
        }
        FetchKind::Resume => {
            insert_str(&mut headers, RANGE, &format!("bytes={}-", entry.size()));
            if let Some(meta) = entry.meta() {
                if meta.accepts_byte_ranges() {
                    if let Some(validator) = meta.etag().or(meta.last_modified()) {
                        insert_str(&mut headers, IF_RANGE, validator);
                    }
                } else {
                    if let Some(etag) = meta.etag() {
                        insert_str(&mut headers, IF_MATCH, etag);
                    }
                    if let Some(last_modified) = meta.last_modified() {
                        insert_str(&mut headers, IF_UNMODIFIED_SINCE, last_modified);
                    }
                }
            }
        }
    }

    Ok(OriginRequest::get(entry.uri().clone(), headers))
}

/// First byte position of a `Content-Range: bytes a-b/c` header.
fn content_range_start(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}

impl CacheState {
    /// Starts a fetch for `entry` unless one is already running. The task
    /// waits for a worker permit before contacting the origin.
    pub(super) fn submit(self: &Arc<Self>, entry: Arc<CacheEntry>) {
        if !entry.try_start() {
            return;
        }
        let state = self.clone();
        tokio::spawn(async move {
            let permit = match state.pool.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    entry.finish_run();
                    return;
                }
            };
            let result = state.call(&entry).await;
            drop(permit);
            state.complete_attempt(&entry, result).await;
        });
    }

    async fn call(&self, entry: &Arc<CacheEntry>) -> Result<(), TransferError> {
        let kind = fetch_kind(entry);
        let request = build_request(entry, kind)?;
        let request_time = self.clock.now();
        crate::metrics::record_origin_fetch(kind.as_str());
        debug!(key = %entry.key(), kind = kind.as_str(), size = entry.size(), "fetching from origin");

        let response = self.origin.fetch(request).await?;
        let response_time = self.clock.now();
        trace!(key = %entry.key(), status = response.status.as_u16(), "origin answered");

        match (kind, response.status) {
            (FetchKind::Conditional, StatusCode::NOT_MODIFIED) => {
                self.absorb_not_modified(entry, &response.headers, request_time, response_time)
                    .await;
                Ok(())
            }
            (FetchKind::Resume, StatusCode::PARTIAL_CONTENT) => {
                let expected = entry.size();
                let got = content_range_start(&response.headers).unwrap_or(0);
                if got != expected {
                    return Err(TransferError::UnexpectedRange { expected, got });
                }
                entry.confirm_headers();
                let declared = entry.meta().and_then(|meta| meta.content_length);
                let mut body = response.body;
                self.receive_body(entry, &mut body, declared, true).await?;
                self.finish_full(entry).await;
                Ok(())
            }
            (_, StatusCode::OK) => {
                self.accept_full_response(entry, kind, response, request_time, response_time)
                    .await
            }
            (FetchKind::Resume, status) => {
                warn!(key = %entry.key(), status = status.as_u16(), "origin refused to resume");
                entry.advance_state(EntryState::Error);
                self.discard(entry).await;
                Ok(())
            }
            (_, status) => {
                self.relay_uncacheable(entry, response, status, request_time, response_time)
                    .await
            }
        }
    }

    async fn accept_full_response(
        &self,
        entry: &Arc<CacheEntry>,
        kind: FetchKind,
        response: OriginResponse,
        request_time: SystemTime,
        response_time: SystemTime,
    ) -> Result<(), TransferError> {
        let restart_body = kind == FetchKind::Resume || entry.size() > 0;
        if restart_body {
            let file = OpenOptions::new()
                .write(true)
                .open(entry.path())
                .await
                .with_context(|| format!("failed to open {}", entry.path().display()))?;
            file.set_len(0).await.context("failed to truncate cache file")?;
            debug!(key = %entry.key(), "origin sent a full body; restarting from zero");
        }

        let template = entry.template();
        let (vary, vary_ok) = match VarianceKey::from_response(&response.headers, &template) {
            Ok(vary) => (vary, true),
            Err(_) => (VarianceKey::empty(), false),
        };
        let storable = vary_ok && response_is_storable(&response.headers);
        let meta = EntryMeta {
            status: StatusCode::OK,
            headers: response.headers.clone(),
            content_length: response.content_length,
            digest: None,
            not_modified_count: 0,
            last_not_modified: None,
            request_time,
            response_time,
            created: response_time,
        };
        entry.publish_headers(meta, vary, !storable, restart_body);
        let interrupted = entry.interrupt_mismatched();
        if interrupted > 0 {
            debug!(key = %entry.key(), interrupted, "receivers negotiated a different variant");
        }
        if storable && entry.stale().is_none() {
            self.persist(entry).await;
        }

        let declared = response.content_length;
        let mut body = response.body;
        self.receive_body(entry, &mut body, declared, true).await?;
        self.finish_full(entry).await;
        Ok(())
    }

    /// Anything other than 200 or a matching 206: the body still reaches
    /// waiting clients, then the entry fails.
    async fn relay_uncacheable(
        &self,
        entry: &Arc<CacheEntry>,
        response: OriginResponse,
        status: StatusCode,
        request_time: SystemTime,
        response_time: SystemTime,
    ) -> Result<(), TransferError> {
        let meta = EntryMeta {
            status,
            headers: response.headers.clone(),
            content_length: response.content_length,
            digest: None,
            not_modified_count: 0,
            last_not_modified: None,
            request_time,
            response_time,
            created: response_time,
        };
        let restart_body = entry.size() > 0;
        entry.publish_headers(meta, VarianceKey::empty(), true, restart_body);
        let mut body = response.body;
        if let Err(err) = self.receive_body(entry, &mut body, response.content_length, false).await
        {
            debug!(key = %entry.key(), error = %err, "relay of non-cacheable response ended early");
        }
        entry.advance_state(EntryState::Error);
        self.discard(entry).await;
        Ok(())
    }

    /// Appends origin bytes to the data file until the body ends, the
    /// declared length is reached, or every client has been gone for the
    /// disconnect grace.
    async fn receive_body(
        &self,
        entry: &Arc<CacheEntry>,
        body: &mut OriginBody,
        declared: Option<u64>,
        grows_state: bool,
    ) -> Result<(), TransferError> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(entry.path())
            .await
            .with_context(|| format!("failed to open {}", entry.path().display()))?;
        file.seek(SeekFrom::Start(entry.size()))
            .await
            .context("failed to seek cache file")?;

        let mut buf = vec![0u8; self.options.max_chunk_size.max(1)];
        let grace = self.options.disconnect_grace;
        loop {
            if let Some(expected) = declared
                && entry.size() >= expected
            {
                return Ok(());
            }
            let read = tokio::select! {
                read = body.read_chunk(&mut buf) => read?,
                _ = entry.wait_abandoned(grace) => return Err(TransferError::ClientsGone),
            };
            if read == 0 {
                let received = entry.size();
                return match declared {
                    Some(expected) if received < expected => {
                        Err(TransferError::Incomplete { received, expected })
                    }
                    _ => Ok(()),
                };
            }
            file.write_all(&buf[..read])
                .await
                .context("failed to write cache file")?;
            file.flush().await.context("failed to flush cache file")?;
            entry.record_written(read as u64);
            if grows_state {
                entry.advance_state(EntryState::Partial);
            }
        }
    }

    /// The body is complete: decide whether it becomes the current copy,
    /// collapses into its stale predecessor, or is thrown away.
    async fn finish_full(&self, entry: &Arc<CacheEntry>) {
        if entry.is_uncacheable() {
            debug!(key = %entry.key(), "response is not storable");
            entry.advance_state(EntryState::NotCached);
            self.discard(entry).await;
            // The origin no longer lets this resource be stored.
            if let Some(stale) = entry.stale() {
                self.retire(&stale).await;
            }
            return;
        }
        let digest = match CacheStore::content_digest(entry.path()).await {
            Ok(digest) => digest,
            Err(err) => {
                warn!(key = %entry.key(), error = %err, "failed to digest cache file");
                entry.advance_state(EntryState::Error);
                self.discard(entry).await;
                return;
            }
        };

        if let Some(stale) = entry.stale()
            && stale.digest().as_deref() == Some(digest.as_str())
            && let Some(meta) = entry.meta()
        {
            debug!(key = %entry.key(), "refetched body is unchanged");
            stale.absorb_revalidation(&meta.headers, meta.request_time, meta.response_time);
            self.persist(&stale).await;
            entry.advance_state(EntryState::NotModified);
            self.discard(entry).await;
            return;
        }

        entry.update_meta(|meta| meta.digest = Some(digest));
        self.persist(entry).await;
        entry.advance_state(EntryState::Full);
        self.promote(entry).await;
    }

    async fn absorb_not_modified(
        &self,
        entry: &Arc<CacheEntry>,
        update: &HeaderMap,
        request_time: SystemTime,
        response_time: SystemTime,
    ) {
        if let Some(stale) = entry.stale() {
            stale.absorb_revalidation(update, request_time, response_time);
            self.persist(&stale).await;
            debug!(key = %entry.key(), "stored copy revalidated");
        }
        entry.advance_state(EntryState::NotModified);
        self.discard(entry).await;
    }

    /// Makes a completed entry the current copy for its key and retires
    /// the copy it replaces.
    async fn promote(&self, entry: &Arc<CacheEntry>) {
        let list = self.registry.variants(entry.key().as_str());
        let mut entries = list.entries.lock().await;
        if !entries.iter().any(|other| Arc::ptr_eq(other, entry)) {
            entries.push(entry.clone());
        }
        drop(entries);
        if let Some(stale) = entry.stale() {
            self.retire(&stale).await;
        }
    }

    /// Removes a superseded copy from its variant list and deletes it.
    async fn retire(&self, stale: &Arc<CacheEntry>) {
        let list = self.registry.variants(stale.key().as_str());
        list.entries
            .lock()
            .await
            .retain(|other| !Arc::ptr_eq(other, stale));
        self.discard(stale).await;
    }

    pub(super) async fn persist(&self, entry: &CacheEntry) {
        let Some(record) = entry.persisted() else {
            return;
        };
        if let Err(err) = CacheStore::write_meta(entry.path(), &record).await {
            warn!(key = %entry.key(), error = %err, "failed to write cache metadata");
        }
    }

    pub(super) async fn discard(&self, entry: &Arc<CacheEntry>) {
        self.registry.forget(entry);
        self.deleter.queue(entry.path().to_path_buf()).await;
    }

    async fn complete_attempt(&self, entry: &Arc<CacheEntry>, result: Result<(), TransferError>) {
        match result {
            Ok(()) => entry.reset_restarts(),
            Err(TransferError::ClientsGone) => {
                debug!(key = %entry.key(), size = entry.size(), "clients gone; fetch stopped");
                entry.set_gave_up();
            }
            Err(err @ TransferError::UnexpectedRange { .. }) => {
                warn!(key = %entry.key(), error = %err, "discarding partial copy");
                entry.advance_state(EntryState::Error);
                self.discard(entry).await;
                entry.mark_abandoned();
            }
            Err(err) => {
                let restarts = entry.bump_restarts();
                crate::metrics::record_entry_restart();
                warn!(
                    key = %entry.key(),
                    error = %err,
                    restarts,
                    receivers = entry.receiver_count(),
                    "origin fetch attempt failed"
                );
                if entry.receiver_count() == 0 || restarts > self.options.max_restart_count {
                    if entry.state() == EntryState::New {
                        entry.advance_state(EntryState::Error);
                        self.discard(entry).await;
                    }
                    entry.mark_abandoned();
                }
            }
        }
        // A refresh that stopped short is never resumed: nothing else can find it.
        let stopped = entry.gave_up() || entry.progress().abandoned;
        if stopped && !entry.state().is_terminal() && entry.stale().is_some() {
            entry.advance_state(EntryState::Error);
            self.discard(entry).await;
        }
        if entry.state().is_terminal() {
            entry.take_stale();
        }
        entry.finish_run();
    }
}
