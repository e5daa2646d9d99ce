use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow, bail, ensure};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::Instant;

use crate::util::timeout_with_context;

/// Reads one LF-terminated line, keeping the terminator, without letting a
/// slow peer hold the reader past `deadline`. Returns 0 on a clean EOF.
pub(crate) async fn read_line_with_deadline<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    deadline: Instant,
    peer: SocketAddr,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    ensure!(max_len > 0, "line length limit must be greater than zero");
    buf.clear();
    let mut collected = Vec::new();
    let context = format!("reading line from {peer}");

    loop {
        let remaining = remaining_deadline(deadline, &context)?;
        let available =
            timeout_with_context(remaining, reader.fill_buf(), context.as_str()).await?;

        if available.is_empty() {
            if collected.is_empty() {
                return Ok(0);
            }
            bail!("connection closed while reading line from {peer}");
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());

        if collected.len().saturating_add(consume) > max_len {
            bail!("line from {peer} exceeds configured limit of {max_len} bytes");
        }

        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);

        if newline_pos.is_some() {
            break;
        }
    }

    *buf = String::from_utf8(collected)
        .map_err(|_| anyhow!("line from {peer} contained invalid bytes"))?;
    Ok(buf.len())
}

pub(crate) async fn read_line_with_timeout<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    read_line_with_deadline(reader, buf, Instant::now() + timeout_dur, peer, max_len).await
}

pub(crate) fn remaining_deadline(deadline: Instant, context: &str) -> Result<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .ok_or_else(|| anyhow!("timed out {context}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    #[tokio::test]
    async fn reads_lines_and_reports_eof() -> Result<()> {
        let mut reader = BufReader::new(&b"first\r\nsecond\n"[..]);
        let mut line = String::new();
        let limit = Duration::from_secs(1);
        assert_eq!(read_line_with_timeout(&mut reader, &mut line, limit, peer(), 64).await?, 7);
        assert_eq!(line, "first\r\n");
        read_line_with_timeout(&mut reader, &mut line, limit, peer(), 64).await?;
        assert_eq!(line, "second\n");
        assert_eq!(read_line_with_timeout(&mut reader, &mut line, limit, peer(), 64).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn rejects_overlong_line() {
        let mut reader = BufReader::new(&b"0123456789\n"[..]);
        let mut line = String::new();
        let err = read_line_with_timeout(&mut reader, &mut line, Duration::from_secs(1), peer(), 4)
            .await
            .expect_err("line over limit");
        assert!(err.to_string().contains("exceeds configured limit"), "{err}");
    }
}
