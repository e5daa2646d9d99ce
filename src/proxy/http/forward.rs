use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::proxy::origin::{Origin, OriginRequest};
use crate::util::timeout_with_context;

use super::codec::{ResponseBodyPlan, encode_http1_response_head};

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// A request the cache declined, sent straight to the origin.
pub(super) struct PassThrough {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub(super) struct Relayed {
    pub status: StatusCode,
    pub bytes_out: u64,
}

/// Relays one origin round trip to the client without storing anything.
pub(super) async fn forward_uncached<W>(
    origin: &dyn Origin,
    request: PassThrough,
    client: &mut W,
    client_timeout: Duration,
) -> Result<Relayed>
where
    W: AsyncWrite + Unpin + Send,
{
    let PassThrough {
        method,
        uri,
        headers,
        body,
    } = request;
    let response = origin
        .fetch(OriginRequest {
            method,
            uri,
            headers,
            body,
        })
        .await?;

    let plan = match response.content_length {
        Some(length) => ResponseBodyPlan::Fixed(length),
        None if response.body.is_complete() => ResponseBodyPlan::Empty,
        None => ResponseBodyPlan::UntilClose,
    };
    let head = encode_http1_response_head(response.status, &response.headers, plan);
    timeout_with_context(
        client_timeout,
        client.write_all(&head),
        "writing response head to client",
    )
    .await?;

    let mut body = response.body;
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut bytes_out = 0u64;
    loop {
        let read = body.read_chunk(&mut buf).await?;
        if read == 0 {
            break;
        }
        timeout_with_context(
            client_timeout,
            client.write_all(&buf[..read]),
            "writing response body to client",
        )
        .await?;
        bytes_out += read as u64;
    }
    client.flush().await.context("flushing client")?;
    debug!(status = response.status.as_u16(), bytes_out, "relayed uncached response");
    Ok(Relayed {
        status: response.status,
        bytes_out,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::origin::{OriginBody, OriginResponse};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct EchoOrigin {
        seen: Mutex<Option<(Method, Bytes)>>,
    }

    #[async_trait]
    impl Origin for EchoOrigin {
        async fn fetch(&self, request: OriginRequest) -> Result<OriginResponse> {
            let body = request.body.clone();
            *self.seen.lock() = Some((request.method, request.body));
            let mut headers = HeaderMap::new();
            headers.insert("content-type", "text/plain".parse()?);
            Ok(OriginResponse {
                status: StatusCode::CREATED,
                headers,
                content_length: Some(body.len() as u64),
                body: OriginBody::from_bytes(body),
            })
        }
    }

    #[tokio::test]
    async fn relays_request_body_and_response() -> Result<()> {
        let origin = EchoOrigin::default();
        let mut client = Vec::new();
        let relayed = forward_uncached(
            &origin,
            PassThrough {
                method: Method::POST,
                uri: "http://origin.test/submit".parse()?,
                headers: HeaderMap::new(),
                body: Bytes::from_static(b"form=1"),
            },
            &mut client,
            Duration::from_secs(1),
        )
        .await?;

        assert_eq!(relayed.status, StatusCode::CREATED);
        assert_eq!(relayed.bytes_out, 6);
        let text = String::from_utf8(client)?;
        assert!(text.starts_with("HTTP/1.1 201 Created\r\n"));
        assert!(text.contains("Content-Length: 6\r\n"));
        assert!(text.ends_with("\r\n\r\nform=1"));
        let seen = origin.seen.lock().clone();
        assert_eq!(seen, Some((Method::POST, Bytes::from_static(b"form=1"))));
        Ok(())
    }
}
