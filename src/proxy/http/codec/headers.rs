use anyhow::{Result, anyhow, bail};
use http::HeaderMap;
use http::header::{HeaderName, HeaderValue};

use crate::proxy::headers::{HeaderAction, RequestHeaderSanitizer, is_hop_by_hop};

#[derive(Debug, Clone)]
pub(crate) struct Http1HeaderLine {
    pub name: String,
    pub value: String,
    lower_name: String,
}

impl Http1HeaderLine {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let lower_name = name.to_ascii_lowercase();
        Self {
            name,
            value: value.into(),
            lower_name,
        }
    }

    pub fn lower_name(&self) -> &str {
        &self.lower_name
    }
}

/// Collects request header lines, validating each through the sanitizer.
pub(crate) struct Http1HeaderAccumulator {
    sanitizer: RequestHeaderSanitizer,
    headers: Vec<Http1HeaderLine>,
}

impl Http1HeaderAccumulator {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            sanitizer: RequestHeaderSanitizer::new(max_bytes),
            headers: Vec::new(),
        }
    }

    /// Returns `false` once the blank line ending the header block is seen.
    pub fn push_line(&mut self, line: &str) -> Result<bool> {
        let line_len = line.len();
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            self.sanitizer.reserve(line_len)?;
            return Ok(false);
        }

        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator"))?;
        let name = name.trim();
        let value = value.trim();
        if name.is_empty() {
            bail!("header name must not be empty");
        }
        HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| anyhow!("invalid header name '{name}'"))?;
        if let HeaderAction::Forward = self.sanitizer.record(name, value, line_len)? {
            self.headers.push(Http1HeaderLine::new(name, value));
        }
        Ok(true)
    }

    pub fn host(&self) -> Option<&str> {
        self.sanitizer.host()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.sanitizer.content_length()
    }

    pub fn is_chunked(&self) -> bool {
        self.sanitizer.is_chunked()
    }

    pub fn total_bytes(&self) -> usize {
        self.sanitizer.total_bytes()
    }

    fn connection_tokens(&self) -> Vec<String> {
        self.headers
            .iter()
            .filter(|header| header.lower_name() == "connection")
            .flat_map(|header| header.value.split(','))
            .map(|token| token.trim().to_ascii_lowercase())
            .filter(|token| !token.is_empty())
            .collect()
    }

    /// End-to-end request headers: hop-by-hop fields and anything named in
    /// `Connection` are left out.
    pub fn forward_header_map(&self) -> HeaderMap {
        let tokens = self.connection_tokens();
        header_lines_to_map(self.headers.iter().filter(|header| {
            !is_hop_by_hop(header.lower_name())
                && !tokens.iter().any(|token| token == header.lower_name())
        }))
    }
}

pub(crate) fn header_lines_to_map<'a, I>(headers: I) -> HeaderMap
where
    I: Iterator<Item = &'a Http1HeaderLine>,
{
    let mut map = HeaderMap::new();
    for header in headers {
        if let Ok(name) = HeaderName::from_bytes(header.name.as_bytes())
            && let Ok(value) = HeaderValue::from_bytes(header.value.as_bytes())
        {
            map.append(name, value);
        }
    }
    map
}
