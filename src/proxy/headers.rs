use std::collections::HashSet;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::HeaderMap;
use http::header::{CONNECTION, HeaderName};

/// Headers that describe one hop and never travel with a stored response
/// or a forwarded request.
pub(crate) const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub(crate) fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.contains(&name)
}

pub(crate) fn connection_tokens(headers: &HeaderMap) -> HashSet<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Drops hop-by-hop headers, including the ones named by `Connection`.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let tokens = connection_tokens(headers);
    let doomed: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop(name.as_str()) || tokens.contains(name.as_str()))
        .cloned()
        .collect();
    for name in doomed {
        headers.remove(name);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeaderAction {
    Forward,
    Skip,
}

/// Validates request header lines as they are read and extracts the
/// framing fields the proxy needs.
#[derive(Debug, Clone)]
pub(crate) struct RequestHeaderSanitizer {
    max_bytes: usize,
    consumed: usize,
    host: Option<String>,
    content_length: Option<u64>,
    chunked: bool,
}

impl RequestHeaderSanitizer {
    pub(crate) fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            consumed: 0,
            host: None,
            content_length: None,
            chunked: false,
        }
    }

    pub(crate) fn reserve(&mut self, byte_len: usize) -> Result<()> {
        self.consumed = self
            .consumed
            .checked_add(byte_len)
            .ok_or_else(|| anyhow!("header section exceeds configured limit"))?;
        ensure!(
            self.consumed <= self.max_bytes,
            "header section exceeds configured limit"
        );
        Ok(())
    }

    pub(crate) fn record(&mut self, name: &str, value: &str, byte_len: usize) -> Result<HeaderAction> {
        self.reserve(byte_len)?;
        let lower = name.to_ascii_lowercase();
        match lower.as_str() {
            "host" => {
                if self.host.is_some() {
                    bail!("duplicate Host header");
                }
                ensure!(!value.is_empty(), "Host header must not be empty");
                self.host = Some(value.to_ascii_lowercase());
                Ok(HeaderAction::Forward)
            }
            "content-length" => {
                if self.chunked {
                    bail!("request must not include both Content-Length and Transfer-Encoding");
                }
                if self.content_length.is_some() {
                    bail!("multiple Content-Length headers are not supported");
                }
                let length: u64 = value
                    .parse()
                    .with_context(|| format!("invalid Content-Length value '{value}'"))?;
                self.content_length = Some(length);
                Ok(HeaderAction::Skip)
            }
            "transfer-encoding" => {
                if !value.trim().eq_ignore_ascii_case("chunked") {
                    bail!("unsupported Transfer-Encoding '{value}'");
                }
                if self.content_length.is_some() {
                    bail!("request must not include both Content-Length and Transfer-Encoding");
                }
                self.chunked = true;
                Ok(HeaderAction::Skip)
            }
            _ => Ok(HeaderAction::Forward),
        }
    }

    pub(crate) fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub(crate) fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub(crate) fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub(crate) fn total_bytes(&self) -> usize {
        self.consumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn rejects_duplicate_host() {
        let mut sanitizer = RequestHeaderSanitizer::new(256);
        assert!(matches!(
            sanitizer.record("Host", "example.com", 16),
            Ok(HeaderAction::Forward)
        ));
        let err = sanitizer
            .record("Host", "other.example.com", 32)
            .expect_err("expected duplicate host to error");
        assert!(err.to_string().contains("duplicate Host"), "{err:?}");
    }

    #[test]
    fn rejects_conflicting_framing() {
        let mut sanitizer = RequestHeaderSanitizer::new(256);
        sanitizer
            .record("Transfer-Encoding", "chunked", 32)
            .expect("chunked accepted");
        let err = sanitizer
            .record("Content-Length", "10", 24)
            .expect_err("expected conflict to error");
        assert!(err.to_string().contains("both Content-Length"), "{err:?}");
    }

    #[test]
    fn enforces_byte_budget() {
        let mut sanitizer = RequestHeaderSanitizer::new(10);
        let err = sanitizer
            .record("Accept", "text/plain", 20)
            .expect_err("over budget");
        assert!(err.to_string().contains("configured limit"), "{err:?}");
    }

    #[test]
    fn strips_named_and_listed_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("close, X-Secret"));
        headers.insert("x-secret", HeaderValue::from_static("1"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("accept", HeaderValue::from_static("*/*"));
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("accept"));
    }
}
