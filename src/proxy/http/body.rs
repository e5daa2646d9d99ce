use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

use crate::{proxy::http::codec::read_line_with_timeout, util::timeout_with_context};

const MAX_CHUNK_LINE_LENGTH: usize = 8192;

#[derive(Debug, Error)]
#[error("request body exceeds configured limit")]
pub struct BodyTooLarge {
    pub bytes_read: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyPlan {
    Empty,
    Fixed(u64),
    Chunked,
}

impl BodyPlan {
    pub fn from_framing(content_length: Option<u64>, chunked: bool) -> Self {
        if chunked {
            BodyPlan::Chunked
        } else {
            match content_length {
                Some(0) | None => BodyPlan::Empty,
                Some(length) => BodyPlan::Fixed(length),
            }
        }
    }
}

/// Reads a chunk-size line and returns the decoded size. Extensions after
/// `;` are ignored.
pub(crate) async fn read_chunk_size<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    peer: SocketAddr,
) -> Result<u64>
where
    S: AsyncRead + Unpin,
{
    let mut line = String::new();
    let read =
        read_line_with_timeout(reader, &mut line, timeout_dur, peer, MAX_CHUNK_LINE_LENGTH).await?;
    if read == 0 {
        bail!("unexpected EOF while reading chunk size from {peer}");
    }
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let size_str = trimmed
        .split_once(';')
        .map(|(size, _)| size)
        .unwrap_or(trimmed)
        .trim();
    u64::from_str_radix(size_str, 16).with_context(|| format!("invalid chunk size '{size_str}'"))
}

/// Consumes the trailer section after the last chunk.
pub(crate) async fn skip_chunk_trailers<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    peer: SocketAddr,
) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        let read =
            read_line_with_timeout(reader, &mut line, timeout_dur, peer, MAX_CHUNK_LINE_LENGTH)
                .await?;
        if read == 0 || line.trim_end_matches(['\r', '\n']).is_empty() {
            return Ok(());
        }
    }
}

pub(crate) async fn expect_chunk_terminator<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    peer: SocketAddr,
) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut crlf = [0u8; 2];
    timeout_with_context(
        timeout_dur,
        reader.read_exact(&mut crlf),
        format!("reading chunk terminator from {peer}"),
    )
    .await?;
    if &crlf != b"\r\n" {
        bail!("invalid chunk terminator when reading from {peer}");
    }
    Ok(())
}

/// Buffers a client request body so it can be replayed to the origin.
pub async fn read_request_body<S>(
    reader: &mut BufReader<S>,
    plan: BodyPlan,
    client_timeout: Duration,
    peer: SocketAddr,
    max_body_size: u64,
) -> Result<Bytes>
where
    S: AsyncRead + Unpin,
{
    match plan {
        BodyPlan::Empty => Ok(Bytes::new()),
        BodyPlan::Fixed(length) => {
            if length > max_body_size {
                return Err(BodyTooLarge { bytes_read: 0 }.into());
            }
            let mut body = BytesMut::zeroed(length as usize);
            timeout_with_context(
                client_timeout,
                reader.read_exact(&mut body),
                "reading request body from client",
            )
            .await?;
            Ok(body.freeze())
        }
        BodyPlan::Chunked => {
            let mut body = BytesMut::new();
            loop {
                let size = read_chunk_size(reader, client_timeout, peer).await?;
                if size == 0 {
                    skip_chunk_trailers(reader, client_timeout, peer).await?;
                    break;
                }
                let total = body.len() as u64 + size;
                if total > max_body_size {
                    return Err(BodyTooLarge {
                        bytes_read: body.len() as u64,
                    }
                    .into());
                }
                let start = body.len();
                body.resize(total as usize, 0);
                timeout_with_context(
                    client_timeout,
                    reader.read_exact(&mut body[start..]),
                    format!("reading chunk data from {peer}"),
                )
                .await?;
                expect_chunk_terminator(reader, client_timeout, peer).await?;
            }
            Ok(body.freeze())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:5555".parse().unwrap()
    }

    #[tokio::test]
    async fn reads_fixed_body() -> Result<()> {
        let mut reader = BufReader::new(&b"hello world"[..]);
        let body =
            read_request_body(&mut reader, BodyPlan::Fixed(5), Duration::from_secs(1), peer(), 64)
                .await?;
        assert_eq!(&body[..], b"hello");
        Ok(())
    }

    #[tokio::test]
    async fn decodes_chunked_body_with_extensions_and_trailers() -> Result<()> {
        let raw = b"5;name=x\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: 1\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let body =
            read_request_body(&mut reader, BodyPlan::Chunked, Duration::from_secs(1), peer(), 64)
                .await?;
        assert_eq!(&body[..], b"hello world");
        Ok(())
    }

    #[tokio::test]
    async fn rejects_oversized_body() {
        let raw = b"a\r\n0123456789\r\n0\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let err =
            read_request_body(&mut reader, BodyPlan::Chunked, Duration::from_secs(1), peer(), 4)
                .await
                .unwrap_err();
        assert!(err.downcast_ref::<BodyTooLarge>().is_some(), "{err}");
    }

    #[test]
    fn plan_follows_framing() {
        assert_eq!(BodyPlan::from_framing(None, false), BodyPlan::Empty);
        assert_eq!(BodyPlan::from_framing(Some(3), false), BodyPlan::Fixed(3));
        assert_eq!(BodyPlan::from_framing(None, true), BodyPlan::Chunked);
    }
}
