use std::net::SocketAddr;

use anyhow::{Context, Result, anyhow, bail};
use http::{Method, Uri};

use crate::logging::AccessLogBuilder;

const HTTP_DEFAULT_PORT: u16 = 80;

/// A proxied request target after parsing the start line.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: Method,
    pub host: String,
    pub port: u16,
    pub path: String,
}

/// Parse an HTTP/1.1 request target, absolute-form or origin-form plus
/// `Host`, into a [`ParsedRequest`]. Only `http` targets are proxied.
pub fn parse_http1_request(
    method: Method,
    target: &str,
    host_header: Option<&str>,
) -> Result<ParsedRequest> {
    let uri: Uri = target
        .parse()
        .with_context(|| format!("invalid request target '{target}'"))?;

    if let Some(scheme) = uri.scheme_str() {
        if !scheme.eq_ignore_ascii_case("http") {
            bail!("unsupported scheme '{scheme}'");
        }
        let authority = uri
            .authority()
            .map(|auth| auth.as_str())
            .ok_or_else(|| anyhow!("request missing authority"))?;
        let (host, port) = parse_host_header(authority)?;
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        return Ok(ParsedRequest {
            method,
            host,
            port: port.unwrap_or(HTTP_DEFAULT_PORT),
            path,
        });
    }

    if !target.starts_with('/') {
        bail!("request target must be absolute-form or origin-form");
    }
    let host_header = host_header
        .ok_or_else(|| anyhow!("request missing Host header required for origin-form request"))?;
    let (host, port) = parse_host_header(host_header)?;

    Ok(ParsedRequest {
        method,
        host,
        port: port.unwrap_or(HTTP_DEFAULT_PORT),
        path: target.to_string(),
    })
}

/// Return a path with query parameters removed for logging purposes.
pub fn redacted_path(path: &str) -> String {
    path.split('?').next().unwrap_or("/").to_string()
}

/// Parse a Host header value into a normalized host + port.
pub fn parse_host_header(value: &str) -> Result<(String, Option<u16>)> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        bail!("empty Host header");
    }
    if trimmed.chars().any(|c| c.is_whitespace()) {
        bail!("authority must not contain whitespace");
    }
    if trimmed.contains('@') {
        bail!("authority must not contain userinfo");
    }
    if trimmed.contains('/')
        || trimmed.contains('?')
        || trimmed.contains('#')
        || trimmed.contains('\\')
    {
        bail!("authority must not contain path or query");
    }
    let uri: Uri = format!("http://{trimmed}")
        .parse()
        .with_context(|| format!("invalid Host header '{trimmed}'"))?;
    let host = uri
        .host()
        .ok_or_else(|| anyhow!("Host header missing hostname"))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();
    Ok((host, uri.port_u16()))
}

impl ParsedRequest {
    pub fn access_log_builder(&self, peer: SocketAddr) -> AccessLogBuilder {
        AccessLogBuilder::new(peer)
            .method(self.method.as_str())
            .host(self.authority())
            .path(redacted_path(&self.path))
    }

    /// `host[:port]`, with the port omitted when it is the default.
    pub fn authority(&self) -> String {
        let mut host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port != HTTP_DEFAULT_PORT {
            host.push(':');
            host.push_str(&self.port.to_string());
        }
        host
    }

    /// Absolute URI naming the origin resource.
    pub fn absolute_uri(&self) -> Result<Uri> {
        let authority = self.authority();
        Uri::builder()
            .scheme("http")
            .authority(authority.as_str())
            .path_and_query(self.path.as_str())
            .build()
            .with_context(|| format!("failed to build URI for http://{authority}"))
    }
}
