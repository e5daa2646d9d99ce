use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{HeaderMap, Method};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::Instant;
use tracing::debug;

use super::headers::Http1HeaderAccumulator;
use super::line::read_line_with_deadline;

pub(crate) struct Http1RequestHead {
    pub method: Method,
    pub target: String,
    pub headers: Http1HeaderAccumulator,
}

/// Reads a request line and header block. `Ok(None)` means the client went
/// away (or stayed silent past `idle_timeout`) before sending anything.
pub(crate) async fn read_http1_request_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    idle_timeout: Duration,
    header_timeout: Duration,
    max_header_bytes: usize,
) -> Result<Option<Http1RequestHead>>
where
    S: AsyncRead + Unpin,
{
    let available = match tokio::time::timeout(idle_timeout, reader.fill_buf()).await {
        Ok(Ok(buf)) => buf,
        Ok(Err(err)) => {
            return Err(err).with_context(|| format!("waiting for request data from {peer}"));
        }
        Err(_) => return Ok(None),
    };
    if available.is_empty() {
        return Ok(None);
    }

    let deadline = Instant::now() + header_timeout;
    let mut request_line = String::new();
    let request_line_bytes =
        read_line_with_deadline(reader, &mut request_line, deadline, peer, max_header_bytes)
            .await?;
    if request_line_bytes == 0 {
        debug!(peer = %peer, "connection closed before request line");
        return Ok(None);
    }
    if !request_line.ends_with('\n') {
        bail!("request line for {peer} missing newline terminator");
    }
    let request_line = request_line.trim_end_matches(['\r', '\n']);
    if request_line.is_empty() {
        bail!("empty request line from {peer}");
    }

    let mut parts = request_line.split_whitespace();
    let method_str = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing method"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing target"))?;
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing version"))?;
    if parts.next().is_some() {
        bail!("malformed request line: unexpected data");
    }
    match version {
        "HTTP/1.1" => {}
        "HTTP/1.0" => bail!("HTTP/1.0 requests are not supported"),
        other => bail!("invalid HTTP version '{other}'"),
    }

    let method = Method::from_bytes(method_str.as_bytes())
        .with_context(|| format!("invalid method '{method_str}'"))?;

    let remaining = max_header_bytes
        .checked_sub(request_line_bytes)
        .ok_or_else(|| anyhow!("request headers exceed configured limit"))?;
    ensure!(remaining > 0, "request headers exceed configured limit");
    let mut headers = Http1HeaderAccumulator::new(remaining);
    let mut header_line = String::new();
    loop {
        let read =
            read_line_with_deadline(reader, &mut header_line, deadline, peer, remaining).await?;
        if read == 0 {
            break;
        }
        if !headers
            .push_line(&header_line)
            .with_context(|| format!("invalid header from {peer}"))?
        {
            break;
        }
    }

    Ok(Some(Http1RequestHead {
        method,
        target: target.to_string(),
        headers,
    }))
}

/// Serializes an origin-form request head. `Host` must already be present
/// in `headers`; framing is derived from `body_len`.
pub(crate) fn encode_http1_request_head(
    method: &Method,
    target: &str,
    headers: &HeaderMap,
    body_len: usize,
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(method.as_str().as_bytes());
    buffer.push(b' ');
    buffer.extend_from_slice(target.as_bytes());
    buffer.extend_from_slice(b" HTTP/1.1\r\n");
    for (name, value) in headers {
        if *name == http::header::CONTENT_LENGTH || *name == http::header::CONNECTION {
            continue;
        }
        buffer.extend_from_slice(name.as_str().as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }
    if body_len > 0 || matches!(*method, Method::POST | Method::PUT | Method::PATCH) {
        buffer.extend_from_slice(format!("Content-Length: {body_len}\r\n").as_bytes());
    }
    buffer.extend_from_slice(b"Connection: close\r\n\r\n");
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn peer() -> SocketAddr {
        "127.0.0.1:12345".parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn read_request_head_times_out_on_partial_line() {
        let (mut client, server) = tokio::io::duplex(64);

        let handle = tokio::spawn(async move {
            let mut reader = BufReader::new(server);
            read_http1_request_head(
                &mut reader,
                peer(),
                Duration::from_millis(50),
                Duration::from_millis(50),
                1024,
            )
            .await
        });

        tokio::task::yield_now().await;
        client
            .write_all(b"GET / HTTP/1.1")
            .await
            .expect("write partial line");
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(100)).await;

        match handle.await.expect("request head join") {
            Ok(_) => panic!("expected timeout on partial line"),
            Err(err) => assert!(err.to_string().contains("timed out"), "{err}"),
        }
    }

    #[tokio::test]
    async fn parses_absolute_form_request() -> Result<()> {
        let raw = b"GET http://example.com/a HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let head = read_http1_request_head(
            &mut reader,
            peer(),
            Duration::from_secs(1),
            Duration::from_secs(1),
            1024,
        )
        .await?
        .expect("request head");
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.target, "http://example.com/a");
        assert_eq!(head.headers.host(), Some("example.com"));
        assert!(head.headers.forward_header_map().contains_key("accept"));
        Ok(())
    }

    #[tokio::test]
    async fn read_request_head_rejects_http10() {
        let raw = b"GET / HTTP/1.0\r\nHost: example.com\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let err = match read_http1_request_head(
            &mut reader,
            peer(),
            Duration::from_secs(1),
            Duration::from_secs(1),
            1024,
        )
        .await
        {
            Ok(_) => panic!("HTTP/1.0 should be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("HTTP/1.0"), "{err}");
    }

    #[test]
    fn encodes_request_with_framing() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::HOST, "example.com".parse().unwrap());
        headers.insert(http::header::CONNECTION, "keep-alive".parse().unwrap());
        let encoded = encode_http1_request_head(&Method::GET, "/a?b=1", &headers, 0);
        let text = String::from_utf8(encoded).unwrap();
        assert!(text.starts_with("GET /a?b=1 HTTP/1.1\r\n"));
        assert!(text.contains("host: example.com\r\n"));
        assert!(!text.contains("keep-alive"));
        assert!(!text.contains("Content-Length"));
        assert!(text.ends_with("Connection: close\r\n\r\n"));
    }
}
