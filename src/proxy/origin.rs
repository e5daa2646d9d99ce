//! Origin access. The cache talks to origins through the [`Origin`] trait so
//! tests and embedders can substitute their own transport.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::proxy::headers::strip_hop_by_hop;
use crate::proxy::http::body::{expect_chunk_terminator, read_chunk_size, skip_chunk_trailers};
use crate::proxy::http::codec::{encode_http1_request_head, read_http1_response_head};
use crate::util::timeout_with_context;

#[derive(Debug, Clone)]
pub struct OriginRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OriginRequest {
    pub fn get(uri: Uri, headers: HeaderMap) -> Self {
        Self {
            method: Method::GET,
            uri,
            headers,
            body: Bytes::new(),
        }
    }
}

pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub body: OriginBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Fixed(u64),
    Chunked,
    UntilClose,
}

#[derive(Clone, Copy)]
enum BodyState {
    Done,
    Fixed { remaining: u64 },
    Chunked { remaining: u64, started: bool },
    UntilClose,
}

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;

/// Decoded response body. Reads return payload bytes only; chunk framing
/// is removed.
pub struct OriginBody {
    reader: BufReader<BoxedRead>,
    state: BodyState,
    read_timeout: Duration,
    peer: SocketAddr,
}

impl OriginBody {
    pub fn new(
        reader: BoxedRead,
        framing: BodyFraming,
        read_timeout: Duration,
        peer: SocketAddr,
    ) -> Self {
        let state = match framing {
            BodyFraming::Empty | BodyFraming::Fixed(0) => BodyState::Done,
            BodyFraming::Fixed(remaining) => BodyState::Fixed { remaining },
            BodyFraming::Chunked => BodyState::Chunked {
                remaining: 0,
                started: false,
            },
            BodyFraming::UntilClose => BodyState::UntilClose,
        };
        Self {
            reader: BufReader::new(reader),
            state,
            read_timeout,
            peer,
        }
    }

    pub fn empty() -> Self {
        Self::from_bytes(Bytes::new())
    }

    pub fn from_bytes(body: Bytes) -> Self {
        let framing = BodyFraming::Fixed(body.len() as u64);
        Self::new(
            Box::new(std::io::Cursor::new(body)),
            framing,
            Duration::from_secs(30),
            SocketAddr::from(([127, 0, 0, 1], 0)),
        )
    }

    /// True once nothing is left to read, including bodies that never had
    /// any payload.
    pub fn is_complete(&self) -> bool {
        matches!(self.state, BodyState::Done)
    }

    /// Reads the next slice of payload. Returns 0 once the body is complete.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.state {
                BodyState::Done => return Ok(0),
                BodyState::Fixed { remaining } => {
                    let want = remaining.min(buf.len() as u64) as usize;
                    let read = self.read_raw(&mut buf[..want]).await?;
                    if read == 0 {
                        bail!(
                            "origin {} closed connection with {remaining} body bytes outstanding",
                            self.peer
                        );
                    }
                    let left = remaining - read as u64;
                    self.state = if left == 0 {
                        BodyState::Done
                    } else {
                        BodyState::Fixed { remaining: left }
                    };
                    return Ok(read);
                }
                BodyState::UntilClose => {
                    let read = self.read_raw(buf).await?;
                    if read == 0 {
                        self.state = BodyState::Done;
                    }
                    return Ok(read);
                }
                BodyState::Chunked { remaining, .. } if remaining > 0 => {
                    let want = remaining.min(buf.len() as u64) as usize;
                    let read = self.read_raw(&mut buf[..want]).await?;
                    if read == 0 {
                        bail!("origin {} closed connection inside a chunk", self.peer);
                    }
                    self.state = BodyState::Chunked {
                        remaining: remaining - read as u64,
                        started: true,
                    };
                    return Ok(read);
                }
                BodyState::Chunked { started, .. } => {
                    if started {
                        expect_chunk_terminator(&mut self.reader, self.read_timeout, self.peer)
                            .await?;
                    }
                    let size = read_chunk_size(&mut self.reader, self.read_timeout, self.peer)
                        .await?;
                    if size == 0 {
                        skip_chunk_trailers(&mut self.reader, self.read_timeout, self.peer)
                            .await?;
                        self.state = BodyState::Done;
                    } else {
                        self.state = BodyState::Chunked {
                            remaining: size,
                            started: true,
                        };
                    }
                }
            }
        }
    }

    async fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize> {
        timeout_with_context(
            self.read_timeout,
            self.reader.read(buf),
            format!("reading response body from origin {}", self.peer),
        )
        .await
    }

    /// Drains the remaining payload into memory, up to `limit` bytes.
    pub async fn collect(mut self, limit: u64) -> Result<Bytes> {
        let mut collected = Vec::new();
        let mut buf = vec![0u8; 8192];
        loop {
            let read = self.read_chunk(&mut buf).await?;
            if read == 0 {
                return Ok(Bytes::from(collected));
            }
            if collected.len() as u64 + read as u64 > limit {
                bail!("origin response body exceeds {limit} bytes");
            }
            collected.extend_from_slice(&buf[..read]);
        }
    }
}

#[async_trait]
pub trait Origin: Send + Sync {
    async fn fetch(&self, request: OriginRequest) -> Result<OriginResponse>;
}

/// Plain HTTP/1.1 origin client. Each request uses a fresh connection that
/// is closed once the body has been read.
#[derive(Debug, Clone)]
pub struct Http1Origin {
    connect_timeout: Duration,
    io_timeout: Duration,
    max_header_bytes: usize,
}

impl Http1Origin {
    pub fn new(connect_timeout: Duration, io_timeout: Duration, max_header_bytes: usize) -> Self {
        Self {
            connect_timeout,
            io_timeout,
            max_header_bytes,
        }
    }
}

fn body_framing(
    method: &Method,
    status: StatusCode,
    content_length: Option<u64>,
    chunked: bool,
) -> BodyFraming {
    if *method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return BodyFraming::Empty;
    }
    if chunked {
        return BodyFraming::Chunked;
    }
    match content_length {
        Some(length) => BodyFraming::Fixed(length),
        None => BodyFraming::UntilClose,
    }
}

#[async_trait]
impl Origin for Http1Origin {
    async fn fetch(&self, request: OriginRequest) -> Result<OriginResponse> {
        match request.uri.scheme_str() {
            Some("http") | None => {}
            Some(other) => bail!("unsupported origin scheme '{other}'"),
        }
        let host = request
            .uri
            .host()
            .ok_or_else(|| anyhow!("origin request '{}' has no host", request.uri))?
            .to_string();
        let port = request.uri.port_u16().unwrap_or(80);
        let target = request
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let stream = timeout_with_context(
            self.connect_timeout,
            TcpStream::connect((host.as_str(), port)),
            format!("connecting to origin {host}:{port}"),
        )
        .await?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(host = %host, port, error = %err, "failed to set TCP_NODELAY on origin stream");
        }
        let peer = stream
            .peer_addr()
            .with_context(|| format!("origin {host}:{port} peer address"))?;
        debug!(host = %host, port, peer = %peer, "connected to origin");

        let mut headers = request.headers.clone();
        if !headers.contains_key(http::header::HOST) {
            let authority = if port == 80 {
                host.clone()
            } else {
                format!("{host}:{port}")
            };
            headers.insert(
                http::header::HOST,
                HeaderValue::from_str(&authority)
                    .with_context(|| format!("invalid origin authority '{authority}'"))?,
            );
        }
        let head = encode_http1_request_head(&request.method, target, &headers, request.body.len());

        let mut reader = BufReader::new(stream);
        timeout_with_context(
            self.io_timeout,
            reader.get_mut().write_all(&head),
            format!("writing request head to origin {peer}"),
        )
        .await?;
        if !request.body.is_empty() {
            timeout_with_context(
                self.io_timeout,
                reader.get_mut().write_all(&request.body),
                format!("writing request body to origin {peer}"),
            )
            .await?;
        }

        let head =
            read_http1_response_head(&mut reader, self.io_timeout, peer, self.max_header_bytes)
                .await?;
        let framing = body_framing(&request.method, head.status, head.content_length, head.chunked);
        let mut response_headers = head.header_map();
        strip_hop_by_hop(&mut response_headers);
        debug!(
            peer = %peer,
            status = head.status.as_u16(),
            framing = ?framing,
            version = ?head.version,
            "origin response head received"
        );

        Ok(OriginResponse {
            status: head.status,
            headers: response_headers,
            content_length: match framing {
                BodyFraming::Fixed(length) => Some(length),
                _ => None,
            },
            body: OriginBody::new(Box::new(reader), framing, self.io_timeout, peer),
        })
    }
}
