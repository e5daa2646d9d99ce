use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{HeaderMap, StatusCode, Version};
use tokio::io::{AsyncRead, BufReader};
use tracing::warn;

use crate::proxy::headers::{connection_tokens, is_hop_by_hop};

use super::headers::{Http1HeaderLine, header_lines_to_map};
use super::line::read_line_with_timeout;

pub(crate) const VIA_VALUE: &str = "1.1 cachebay";

/// How the body following an encoded response head is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseBodyPlan {
    Empty,
    Fixed(u64),
    UntilClose,
}

pub(crate) struct Http1ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    pub headers: Vec<Http1HeaderLine>,
    pub content_length: Option<u64>,
    pub chunked: bool,
}

impl Http1ResponseHead {
    pub fn header_map(&self) -> HeaderMap {
        header_lines_to_map(self.headers.iter())
    }
}

struct HeaderBudget {
    limit: usize,
    used: usize,
}

impl HeaderBudget {
    fn new(limit: usize) -> Self {
        Self { limit, used: 0 }
    }

    fn record(&mut self, bytes: usize) -> Result<()> {
        self.used = self.used.saturating_add(bytes);
        ensure!(
            self.used <= self.limit,
            "origin response headers exceed configured limit"
        );
        Ok(())
    }
}

/// Serializes a response head for a client. Stored hop-by-hop fields and
/// any stale framing are replaced by what `body_plan` dictates.
pub(crate) fn encode_http1_response_head(
    status: StatusCode,
    headers: &HeaderMap,
    body_plan: ResponseBodyPlan,
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(b"HTTP/1.1 ");
    buffer.extend_from_slice(status.as_str().as_bytes());
    buffer.push(b' ');
    buffer.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
    buffer.extend_from_slice(b"\r\n");

    let tokens = connection_tokens(headers);
    for (name, value) in headers {
        let name = name.as_str();
        if is_hop_by_hop(name)
            || tokens.contains(name)
            || name == "content-length"
            || name == "via"
        {
            continue;
        }
        buffer.extend_from_slice(name.as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }

    match body_plan {
        ResponseBodyPlan::Fixed(length) => {
            buffer.extend_from_slice(format!("Content-Length: {length}\r\n").as_bytes());
        }
        ResponseBodyPlan::Empty => {
            if status != StatusCode::NOT_MODIFIED && status != StatusCode::NO_CONTENT {
                buffer.extend_from_slice(b"Content-Length: 0\r\n");
            }
        }
        ResponseBodyPlan::UntilClose => {}
    }

    let via = match headers.get(http::header::VIA).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {VIA_VALUE}"),
        None => VIA_VALUE.to_string(),
    };
    buffer.extend_from_slice(format!("Via: {via}\r\n").as_bytes());
    buffer.extend_from_slice(b"Connection: close\r\n\r\n");
    buffer
}

pub(crate) async fn read_http1_response_head<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_header_bytes: usize,
) -> Result<Http1ResponseHead>
where
    S: AsyncRead + Unpin,
{
    ensure!(
        max_header_bytes > 0,
        "max response header size must be greater than zero"
    );
    let mut status_line = String::new();
    let mut budget = HeaderBudget::new(max_header_bytes);

    let bytes = read_line_with_timeout(
        reader,
        &mut status_line,
        timeout_dur,
        peer,
        max_header_bytes,
    )
    .await?;
    if bytes == 0 {
        bail!("origin closed connection before sending status line");
    }
    budget.record(bytes)?;
    let (version, status) = parse_http1_status_line(status_line.trim_end_matches(['\r', '\n']))?;

    let mut headers = Vec::new();
    let mut content_length = None;
    let mut chunked = false;
    let mut transfer_encoding_present = false;

    let mut header_line = String::new();
    loop {
        let read = read_line_with_timeout(
            reader,
            &mut header_line,
            timeout_dur,
            peer,
            max_header_bytes,
        )
        .await?;
        if read == 0 {
            bail!("origin closed connection during headers");
        }
        budget.record(read)?;
        let trimmed_line = header_line.trim_end_matches(['\r', '\n']);
        if trimmed_line.is_empty() {
            break;
        }
        let (name, value) = trimmed_line
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator from origin"))?;
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            if content_length.is_some() {
                bail!("multiple Content-Length headers from origin are not supported");
            }
            let parsed: u64 = value
                .parse()
                .with_context(|| format!("invalid Content-Length value '{value}'"))?;
            content_length = Some(parsed);
        }
        if name.eq_ignore_ascii_case("transfer-encoding") {
            transfer_encoding_present = true;
            if value.to_ascii_lowercase().contains("chunked") {
                chunked = true;
            }
        }
        headers.push(Http1HeaderLine::new(name, value));
    }

    if transfer_encoding_present && content_length.is_some() {
        warn!(
            peer = %peer,
            "origin response contained both Transfer-Encoding and Content-Length; rejecting"
        );
        bail!("origin response must not include both Transfer-Encoding and Content-Length");
    }

    Ok(Http1ResponseHead {
        version,
        status,
        headers,
        content_length,
        chunked,
    })
}

pub(crate) fn parse_http1_status_line(value: &str) -> Result<(Version, StatusCode)> {
    let mut parts = value.split_whitespace();
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("origin status line missing HTTP version"))?;
    let status = parts
        .next()
        .ok_or_else(|| anyhow!("origin status line missing status code"))?;

    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => bail!("unsupported origin HTTP version '{other}'"),
    };

    let status_code: u16 = status
        .parse()
        .with_context(|| format!("invalid origin status code '{status}'"))?;
    let status = StatusCode::from_u16(status_code)
        .map_err(|_| anyhow!("unsupported origin status code '{status_code}'"))?;

    Ok((version, status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn peer() -> SocketAddr {
        "127.0.0.1:80".parse().unwrap()
    }

    #[test]
    fn encode_strips_hop_by_hop_and_sets_framing() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONNECTION, HeaderValue::from_static("Foo"));
        headers.insert("foo", HeaderValue::from_static("bar"));
        headers.insert(http::header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from_static("999"));
        headers.insert("x-test", HeaderValue::from_static("1"));

        let encoded = encode_http1_response_head(StatusCode::OK, &headers, ResponseBodyPlan::Fixed(5));
        let text = String::from_utf8(encoded).unwrap();

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(!text.contains("foo: bar"));
        assert!(!text.contains("chunked"));
        assert!(!text.contains("999"));
        assert!(text.contains("x-test: 1\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.contains("Via: 1.1 cachebay\r\n"));
        assert!(text.ends_with("Connection: close\r\n\r\n"));
    }

    #[test]
    fn encode_appends_to_existing_via() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::VIA, HeaderValue::from_static("1.0 upstream"));
        let encoded =
            encode_http1_response_head(StatusCode::NOT_MODIFIED, &headers, ResponseBodyPlan::Empty);
        let text = String::from_utf8(encoded).unwrap();
        assert!(text.contains("Via: 1.0 upstream, 1.1 cachebay\r\n"));
        assert!(!text.contains("Content-Length"));
    }

    #[test]
    fn parse_status_line_accepts_both_versions() -> Result<()> {
        let (version, status) = parse_http1_status_line("HTTP/1.1 404 Not Found")?;
        assert_eq!(version, Version::HTTP_11);
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (version, _) = parse_http1_status_line("HTTP/1.0 200 OK")?;
        assert_eq!(version, Version::HTTP_10);
        Ok(())
    }

    #[test]
    fn parse_status_line_rejects_garbage() {
        let err = parse_http1_status_line("BAD 200 OK").unwrap_err();
        assert!(err.to_string().contains("unsupported origin HTTP version"), "{err}");
        let err = parse_http1_status_line("HTTP/1.1").unwrap_err();
        assert!(err.to_string().contains("missing status code"), "{err}");
        let err = parse_http1_status_line("HTTP/1.1 twohundred OK").unwrap_err();
        assert!(err.to_string().contains("invalid origin status code"), "{err}");
    }

    #[tokio::test]
    async fn read_head_collects_framing() -> Result<()> {
        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\nETag: \"a\"\r\n\r\nbody";
        let mut reader = BufReader::new(&response[..]);
        let head = read_http1_response_head(&mut reader, Duration::from_secs(1), peer(), 1024).await?;
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.content_length, Some(10));
        assert!(!head.chunked);
        assert_eq!(head.header_map().get("etag").unwrap(), "\"a\"");
        Ok(())
    }

    #[tokio::test]
    async fn read_head_rejects_conflicting_framing() {
        let response =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nContent-Length: 5\r\n\r\n";
        let mut reader = BufReader::new(&response[..]);
        let result = read_http1_response_head(&mut reader, Duration::from_secs(1), peer(), 1024).await;
        match result {
            Err(err) => assert!(err.to_string().contains("must not include both"), "{err}"),
            Ok(_) => panic!("Transfer-Encoding with Content-Length should be rejected"),
        }
    }

    #[tokio::test]
    async fn read_head_enforces_budget() {
        let response = b"HTTP/1.1 200 OK\r\nX-Long: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n\r\n";
        let mut reader = BufReader::new(&response[..]);
        let result = read_http1_response_head(&mut reader, Duration::from_secs(1), peer(), 32).await;
        assert!(result.is_err());
    }
}
