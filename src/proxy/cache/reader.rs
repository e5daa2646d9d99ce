use std::fs::FileTimes;
use std::io::ErrorKind;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use http::header::{AGE, IF_MODIFIED_SINCE, IF_NONE_MATCH};
use http::{HeaderMap, HeaderValue, StatusCode};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::proxy::http::codec::{ResponseBodyPlan, encode_http1_response_head};

use super::CacheState;
use super::compare::etag_list_contains;
use super::entry::{CacheEntry, EntryState, Receiver};
use super::freshness::current_age;
use super::meta::EntryMeta;

/// What reached the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Delivery {
    pub status: StatusCode,
    pub bytes: u64,
}

/// How a wait on an entry ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    Served(Delivery),
    /// Headers went out but the body stopped short.
    Truncated(Delivery),
    Timeout,
    NotModified,
    NoMatch,
    Failed,
    UserAgentGaveUp,
}

fn client_validators_match(meta: &EntryMeta, request_headers: &HeaderMap) -> bool {
    if let Some(list) = request_headers
        .get(IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
    {
        return meta
            .etag()
            .is_some_and(|etag| etag_list_contains(list, etag));
    }
    let since = request_headers
        .get(IF_MODIFIED_SINCE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| httpdate::parse_http_date(value).ok());
    let modified = meta
        .last_modified()
        .and_then(|value| httpdate::parse_http_date(value).ok());
    matches!((since, modified), (Some(since), Some(modified)) if modified <= since)
}

fn touch_accessed(file: std::fs::File) {
    let times = FileTimes::new().set_accessed(SystemTime::now());
    if let Err(err) = file.set_times(times) {
        trace!(error = %err, "failed to update cache file access time");
    }
}

/// Serves a complete entry from its data file, answering the client's own
/// validators with 304. `Ok(None)` means the file is gone.
pub(super) async fn serve_entry<W>(
    state: &CacheState,
    entry: &CacheEntry,
    request_headers: &HeaderMap,
    client: &mut W,
    opened: Option<File>,
) -> Result<Option<Delivery>>
where
    W: AsyncWrite + Unpin + Send,
{
    let Some(meta) = entry.meta() else {
        return Ok(None);
    };
    let file = match opened {
        Some(file) => file,
        None => match File::open(entry.path()).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to open {}", entry.path().display()));
            }
        },
    };
    if let Ok(handle) = file.try_clone().await {
        touch_accessed(handle.into_std().await);
    }

    let size = entry.size();
    let mut headers = meta.headers.clone();
    let age = current_age(&meta, state.clock.now()).max(0);
    headers.insert(AGE, HeaderValue::from(age));

    if client_validators_match(&meta, request_headers) {
        let head =
            encode_http1_response_head(StatusCode::NOT_MODIFIED, &headers, ResponseBodyPlan::Empty);
        client.write_all(&head).await.context("writing 304 to client")?;
        client.flush().await.context("flushing client")?;
        return Ok(Some(Delivery {
            status: StatusCode::NOT_MODIFIED,
            bytes: 0,
        }));
    }

    let head = encode_http1_response_head(meta.status, &headers, ResponseBodyPlan::Fixed(size));
    client.write_all(&head).await.context("writing cached head to client")?;
    let mut body = file.take(size);
    let bytes = tokio::io::copy(&mut body, client)
        .await
        .context("streaming cached body to client")?;
    client.flush().await.context("flushing client")?;
    Ok(Some(Delivery {
        status: meta.status,
        bytes,
    }))
}

/// Waits on the receiver's entry and delivers what it produces.
///
/// With `bound` set the wait is for a terminal state only, and gives up
/// after the bound so the caller can fall back to a stale copy. Without
/// it, bytes are streamed to the client as the fetch writes them.
pub(super) async fn read_from_cache<W>(
    state: &CacheState,
    receiver: &mut Receiver,
    client: &mut W,
    bound: Option<Duration>,
) -> WaitOutcome
where
    W: AsyncWrite + Unpin + Send,
{
    match bound {
        Some(limit) => wait_for_completion(state, receiver, client, limit).await,
        None => stream_while_fetching(state, receiver, client).await,
    }
}

async fn serve_complete<W>(state: &CacheState, receiver: &mut Receiver, client: &mut W) -> WaitOutcome
where
    W: AsyncWrite + Unpin + Send,
{
    let entry = receiver.entry().clone();
    if !entry.matches(receiver.request_headers()) {
        return WaitOutcome::NoMatch;
    }
    let body = receiver.take_body();
    match serve_entry(state, &entry, receiver.request_headers(), client, body).await {
        Ok(Some(delivery)) => WaitOutcome::Served(delivery),
        Ok(None) => WaitOutcome::NoMatch,
        Err(err) => {
            debug!(key = %entry.key(), error = %err, "client stopped reading cached response");
            WaitOutcome::UserAgentGaveUp
        }
    }
}

async fn wait_for_completion<W>(
    state: &CacheState,
    receiver: &mut Receiver,
    client: &mut W,
    limit: Duration,
) -> WaitOutcome
where
    W: AsyncWrite + Unpin + Send,
{
    let entry: std::sync::Arc<CacheEntry> = receiver.entry().clone();
    let mut progress = entry.subscribe();
    let deadline = Instant::now() + limit;
    loop {
        let snapshot = *progress.borrow_and_update();
        if snapshot.state.is_terminal() || snapshot.abandoned {
            break;
        }
        tokio::select! {
            changed = progress.changed() => {
                if changed.is_err() {
                    return WaitOutcome::Failed;
                }
            }
            _ = receiver.interrupted() => return WaitOutcome::NoMatch,
            _ = tokio::time::sleep_until(deadline) => return WaitOutcome::Timeout,
        }
    }
    match entry.state() {
        // A late non-storable answer is still the current response; the
        // receiver's handle outlives the discarded file.
        EntryState::Full | EntryState::NotCached => serve_complete(state, receiver, client).await,
        EntryState::NotModified => WaitOutcome::NotModified,
        _ => WaitOutcome::Failed,
    }
}

async fn stream_while_fetching<W>(
    state: &CacheState,
    receiver: &mut Receiver,
    client: &mut W,
) -> WaitOutcome
where
    W: AsyncWrite + Unpin + Send,
{
    let entry: std::sync::Arc<CacheEntry> = receiver.entry().clone();
    let mut progress = entry.subscribe();

    // Heads left over from an earlier attempt are not trusted: a resume can
    // still be answered with a different representation.
    let generation = loop {
        let snapshot = *progress.borrow_and_update();
        if receiver.is_interrupted() {
            return WaitOutcome::NoMatch;
        }
        if snapshot.headers_ready {
            break snapshot.generation;
        }
        if snapshot.state == EntryState::NotModified {
            return WaitOutcome::NotModified;
        }
        if snapshot.abandoned || snapshot.state.is_terminal() {
            return WaitOutcome::Failed;
        }
        tokio::select! {
            changed = progress.changed() => {
                if changed.is_err() {
                    return WaitOutcome::Failed;
                }
            }
            _ = receiver.interrupted() => return WaitOutcome::NoMatch,
        }
    };

    if !entry.matches(receiver.request_headers()) {
        return WaitOutcome::NoMatch;
    }
    if entry.state() == EntryState::Full {
        return serve_complete(state, receiver, client).await;
    }
    let Some(meta) = entry.meta() else {
        return WaitOutcome::Failed;
    };
    let mut file = match receiver.take_body() {
        Some(file) => file,
        None => match File::open(entry.path()).await {
            Ok(file) => file,
            Err(err) => {
                debug!(key = %entry.key(), error = %err, "data file vanished before streaming");
                return WaitOutcome::Failed;
            }
        },
    };

    let status = meta.status;
    let declared = meta.content_length;
    let plan = match declared {
        Some(length) => ResponseBodyPlan::Fixed(length),
        None => ResponseBodyPlan::UntilClose,
    };
    let head = encode_http1_response_head(status, &meta.headers, plan);
    if client.write_all(&head).await.is_err() {
        return WaitOutcome::UserAgentGaveUp;
    }

    let mut sent = 0u64;
    loop {
        let snapshot = *progress.borrow_and_update();
        let delivery = Delivery {
            status,
            bytes: sent,
        };
        if snapshot.generation != generation {
            return WaitOutcome::Truncated(delivery);
        }
        if snapshot.size > sent {
            let mut chunk = (&mut file).take(snapshot.size - sent);
            match tokio::io::copy(&mut chunk, client).await {
                Ok(0) => return WaitOutcome::Truncated(delivery),
                Ok(copied) => sent += copied,
                Err(err) => {
                    debug!(key = %entry.key(), error = %err, sent, "client stopped reading");
                    return WaitOutcome::UserAgentGaveUp;
                }
            }
            continue;
        }
        let short = declared.is_some_and(|length| sent < length);
        if !short && declared.is_some() {
            return WaitOutcome::Served(delivery);
        }
        if snapshot.state.is_terminal() {
            return if short {
                WaitOutcome::Truncated(delivery)
            } else {
                WaitOutcome::Served(delivery)
            };
        }
        if snapshot.abandoned {
            return WaitOutcome::Truncated(delivery);
        }
        tokio::select! {
            changed = progress.changed() => {
                if changed.is_err() {
                    return WaitOutcome::Truncated(delivery);
                }
            }
            _ = receiver.interrupted() => return WaitOutcome::Truncated(delivery),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::from_unix_secs;

    fn meta(headers: &[(&'static str, &'static str)]) -> EntryMeta {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(*name, HeaderValue::from_static(value));
        }
        EntryMeta {
            status: StatusCode::OK,
            headers: map,
            content_length: Some(3),
            digest: None,
            not_modified_count: 0,
            last_not_modified: None,
            request_time: from_unix_secs(0),
            response_time: from_unix_secs(0),
            created: from_unix_secs(0),
        }
    }

    #[test]
    fn if_none_match_uses_weak_comparison() {
        let stored = meta(&[("etag", "W/\"v1\"")]);
        let mut request = HeaderMap::new();
        request.insert(IF_NONE_MATCH, HeaderValue::from_static("\"v0\", \"v1\""));
        assert!(client_validators_match(&stored, &request));
        request.insert(IF_NONE_MATCH, HeaderValue::from_static("\"v2\""));
        assert!(!client_validators_match(&stored, &request));
    }

    #[test]
    fn if_modified_since_compares_dates() {
        let stored = meta(&[("last-modified", "Mon, 01 Jan 2024 00:00:00 GMT")]);
        let mut request = HeaderMap::new();
        request.insert(
            IF_MODIFIED_SINCE,
            HeaderValue::from_static("Tue, 02 Jan 2024 00:00:00 GMT"),
        );
        assert!(client_validators_match(&stored, &request));
        request.insert(
            IF_MODIFIED_SINCE,
            HeaderValue::from_static("Sun, 31 Dec 2023 00:00:00 GMT"),
        );
        assert!(!client_validators_match(&stored, &request));
    }

    #[test]
    fn if_none_match_takes_precedence() {
        let stored = meta(&[
            ("etag", "\"v1\""),
            ("last-modified", "Mon, 01 Jan 2024 00:00:00 GMT"),
        ]);
        let mut request = HeaderMap::new();
        request.insert(IF_NONE_MATCH, HeaderValue::from_static("\"other\""));
        request.insert(
            IF_MODIFIED_SINCE,
            HeaderValue::from_static("Tue, 02 Jan 2024 00:00:00 GMT"),
        );
        assert!(!client_validators_match(&stored, &request));
    }
}
