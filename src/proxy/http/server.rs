use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use anyhow::Result;
use http::{Method, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::debug;

use crate::logging::AccessLogBuilder;
use crate::proxy::AppContext;
use crate::proxy::cache::{CacheRequest, LookupOutcome};
use crate::proxy::request::{ParsedRequest, parse_http1_request};

use super::body::{BodyPlan, BodyTooLarge, read_request_body};
use super::codec::{Http1RequestHead, read_http1_request_head};
use super::forward::{PassThrough, forward_uncached};
use super::respond::{respond_with_access_log, shutdown_stream};

/// Serves one request per connection; every response closes the stream.
pub async fn handle_http<S>(stream: S, peer: SocketAddr, app: AppContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let settings = &app.settings;
    let client_timeout = settings.client_timeout();
    let mut reader = BufReader::new(stream);
    let start = Instant::now();

    let head = match read_http1_request_head(
        &mut reader,
        peer,
        client_timeout,
        client_timeout,
        settings.max_request_header_size,
    )
    .await
    {
        Ok(Some(head)) => head,
        Ok(None) => return Ok(()),
        Err(err) => {
            debug!(peer = %peer, error = %err, "unreadable request head");
            return respond_with_access_log(
                reader.get_mut(),
                StatusCode::BAD_REQUEST,
                None,
                b"malformed request\n",
                client_timeout,
                0,
                start.elapsed(),
                AccessLogBuilder::new(peer).error_reason("bad_request").error_detail(err.to_string()),
            )
            .await;
        }
    };
    let Http1RequestHead {
        method,
        target,
        headers,
    } = head;
    let bytes_in = headers.total_bytes() as u64;

    if method == Method::CONNECT {
        let log = AccessLogBuilder::new(peer).method("CONNECT").host(target.clone());
        return respond_with_access_log(
            reader.get_mut(),
            StatusCode::NOT_IMPLEMENTED,
            None,
            b"CONNECT is not supported\n",
            client_timeout,
            bytes_in,
            start.elapsed(),
            log.error_reason("connect_unsupported"),
        )
        .await;
    }

    let parsed = match parse_http1_request(method.clone(), &target, headers.host()) {
        Ok(parsed) => parsed,
        Err(err) => {
            let log = AccessLogBuilder::new(peer).method(method.as_str());
            return respond_with_access_log(
                reader.get_mut(),
                StatusCode::BAD_REQUEST,
                None,
                b"invalid request target\n",
                client_timeout,
                bytes_in,
                start.elapsed(),
                log.error_reason("bad_target").error_detail(err.to_string()),
            )
            .await;
        }
    };
    let log = parsed.access_log_builder(peer);
    let uri = match parsed.absolute_uri() {
        Ok(uri) => uri,
        Err(err) => {
            return respond_with_access_log(
                reader.get_mut(),
                StatusCode::BAD_REQUEST,
                None,
                b"invalid request target\n",
                client_timeout,
                bytes_in,
                start.elapsed(),
                log.error_reason("bad_target").error_detail(err.to_string()),
            )
            .await;
        }
    };

    let plan = BodyPlan::from_framing(headers.content_length(), headers.is_chunked());
    let body = match read_request_body(
        &mut reader,
        plan,
        client_timeout,
        peer,
        settings.max_request_body_size,
    )
    .await
    {
        Ok(body) => body,
        Err(err) if err.is::<BodyTooLarge>() => {
            return respond_with_access_log(
                reader.get_mut(),
                StatusCode::PAYLOAD_TOO_LARGE,
                None,
                b"request body too large\n",
                client_timeout,
                bytes_in,
                start.elapsed(),
                log.error_reason("body_too_large"),
            )
            .await;
        }
        Err(err) => {
            log.status(StatusCode::BAD_REQUEST)
                .bytes(bytes_in, 0)
                .elapsed(start.elapsed())
                .error_reason("body_read")
                .error_detail(err.to_string())
                .log();
            return Ok(());
        }
    };
    let bytes_in = bytes_in + body.len() as u64;
    let forward_headers = headers.forward_header_map();

    crate::metrics::inc_inflight();
    let mut counting = CountingWriter::new(reader.get_mut());
    let result = serve_request(
        &app,
        &parsed,
        CacheRequest {
            method,
            uri,
            headers: forward_headers,
        },
        body,
        &mut counting,
    )
    .await;
    let written = counting.written();
    crate::metrics::dec_inflight();

    let client = reader.get_mut();
    match result {
        Ok((cache, status, bytes_out)) => {
            let mut log = log
                .cache(cache.as_str())
                .bytes(bytes_in, bytes_out)
                .elapsed(start.elapsed());
            if let Some(status) = status {
                log = log.status(status);
            }
            log.log();
            if let Err(err) = shutdown_stream(client, client_timeout).await {
                debug!(peer = %peer, error = %err, "client shutdown failed");
            }
            Ok(())
        }
        Err(err) if written > 0 => {
            // Part of a response already went out; all that is left is to close.
            log.bytes(bytes_in, written)
                .elapsed(start.elapsed())
                .error_reason("response_aborted")
                .error_detail(format!("{err:#}"))
                .log();
            Ok(())
        }
        Err(err) => {
            crate::metrics::record_upstream_error("request");
            let detail = format!("{err:#}");
            respond_with_access_log(
                client,
                StatusCode::BAD_GATEWAY,
                None,
                b"origin request failed\n",
                client_timeout,
                bytes_in,
                start.elapsed(),
                log.error_reason("upstream").error_detail(detail),
            )
            .await
        }
    }
}

/// Counts bytes that reach the client so a failed request knows whether a
/// response was already started.
struct CountingWriter<'a, W> {
    inner: &'a mut W,
    written: u64,
}

impl<'a, W> CountingWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self { inner, written: 0 }
    }

    fn written(&self) -> u64 {
        self.written
    }
}

impl<W> AsyncWrite for CountingWriter<'_, W>
where
    W: AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = &mut *self;
        let poll = Pin::new(&mut *this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = &poll {
            this.written += *written as u64;
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.inner).poll_shutdown(cx)
    }
}

/// Runs the request through the cache when there is one, or straight to
/// the origin when the cache declines it.
async fn serve_request<W>(
    app: &AppContext,
    parsed: &ParsedRequest,
    request: CacheRequest,
    body: bytes::Bytes,
    client: &mut W,
) -> Result<(LookupOutcome, Option<StatusCode>, u64)>
where
    W: AsyncWrite + Unpin + Send,
{
    if let Some(cache) = &app.cache
        && body.is_empty()
    {
        let lookup = cache.lookup(&request, client).await?;
        if lookup.outcome != LookupOutcome::NoCache {
            return Ok((lookup.outcome, lookup.status, lookup.bytes));
        }
    }

    debug!(host = %parsed.host, path = %parsed.path, "forwarding without cache");
    let relayed = forward_uncached(
        app.origin.as_ref(),
        PassThrough {
            method: request.method,
            uri: request.uri,
            headers: request.headers,
            body,
        },
        client,
        app.settings.client_timeout(),
    )
    .await?;
    Ok((LookupOutcome::NoCache, Some(relayed.status), relayed.bytes_out))
}
