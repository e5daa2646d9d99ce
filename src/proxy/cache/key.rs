use std::fmt;

use anyhow::{Result, anyhow};
use http::header::{HeaderName, VARY};
use http::{HeaderMap, Uri};
use sha1::{Digest, Sha1};

use super::compare::comparator_for;

pub(super) const MAX_VARY_HEADERS: usize = 8;
pub(super) const MAX_VARY_BYTES: usize = 8 * 1024;

/// Normalized `scheme://host:port/decoded-path[?query]` identity of a cached
/// resource. Several variants may share one key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct CacheKey {
    key: String,
    digest: String,
}

impl CacheKey {
    pub(crate) fn from_uri(uri: &Uri) -> Result<Self> {
        let scheme = uri
            .scheme_str()
            .ok_or_else(|| anyhow!("cache key requires an absolute URI"))?
            .to_ascii_lowercase();
        let host = uri
            .host()
            .ok_or_else(|| anyhow!("cache key requires a host"))?
            .to_ascii_lowercase();
        let port = uri.port_u16().unwrap_or(match scheme.as_str() {
            "https" => 443,
            _ => 80,
        });
        let raw_path = uri.path();
        let path = match urlencoding::decode(raw_path) {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => raw_path.to_string(),
        };
        let path = if path.is_empty() { "/".to_string() } else { path };
        let mut key = format!("{scheme}://{host}:{port}{path}");
        if let Some(query) = uri.query() {
            key.push('?');
            key.push_str(query);
        }
        Ok(Self::from_key(key))
    }

    pub(crate) fn from_key(key: String) -> Self {
        let digest = hex::encode(Sha1::digest(key.as_bytes()));
        Self { key, digest }
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.key
    }

    /// Hex SHA-1 of the key; drives the on-disk shard layout.
    pub(crate) fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Request header values captured for each header named by a response's
/// `Vary`. Empty when the response did not vary.
#[derive(Debug, Clone, Default)]
pub(crate) struct VarianceKey {
    values: Vec<(HeaderName, Option<String>)>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum VaryError {
    /// `Vary: *` or an oversized vary set; the response cannot be stored.
    Uncacheable,
}

impl VarianceKey {
    pub(crate) fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn from_response(
        resp_headers: &HeaderMap,
        req_headers: &HeaderMap,
    ) -> Result<Self, VaryError> {
        let mut values: Vec<(HeaderName, Option<String>)> = Vec::new();
        let mut vary_bytes = 0usize;
        for value in resp_headers.get_all(VARY) {
            let Ok(list) = value.to_str() else {
                return Err(VaryError::Uncacheable);
            };
            for header_name in list.split(',') {
                let header_name = header_name.trim();
                if header_name.is_empty() {
                    continue;
                }
                if header_name == "*" {
                    return Err(VaryError::Uncacheable);
                }
                let Ok(name) = HeaderName::from_bytes(header_name.as_bytes()) else {
                    return Err(VaryError::Uncacheable);
                };
                if values.iter().any(|(existing, _)| *existing == name) {
                    continue;
                }
                if values.len() + 1 > MAX_VARY_HEADERS {
                    return Err(VaryError::Uncacheable);
                }
                let captured = joined_value(req_headers, &name);
                vary_bytes = vary_bytes
                    .saturating_add(name.as_str().len())
                    .saturating_add(captured.as_ref().map(String::len).unwrap_or(0));
                if vary_bytes > MAX_VARY_BYTES {
                    return Err(VaryError::Uncacheable);
                }
                values.push((name, captured));
            }
        }
        values.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        Ok(Self { values })
    }

    pub(crate) fn from_pairs(pairs: &[(String, Option<String>)]) -> Self {
        let mut values: Vec<(HeaderName, Option<String>)> = pairs
            .iter()
            .filter_map(|(name, value)| {
                HeaderName::from_bytes(name.as_bytes())
                    .ok()
                    .map(|name| (name, value.clone()))
            })
            .collect();
        values.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        Self { values }
    }

    pub(crate) fn to_pairs(&self) -> Vec<(String, Option<String>)> {
        self.values
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.clone()))
            .collect()
    }

    /// Whether a live request negotiates the same representation.
    pub(crate) fn matches(&self, req_headers: &HeaderMap) -> bool {
        self.values.iter().all(|(name, captured)| {
            let current = joined_value(req_headers, name);
            comparator_for(name).equal(captured.as_deref(), current.as_deref())
        })
    }
}

impl PartialEq for VarianceKey {
    fn eq(&self, other: &Self) -> bool {
        self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(other.values.iter())
                .all(|((name_a, a), (name_b, b))| {
                    name_a == name_b && comparator_for(name_a).equal(a.as_deref(), b.as_deref())
                })
    }
}

fn joined_value(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    let parts: Vec<&str> = headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use http::header::{ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE};

    fn headers(pairs: &[(HeaderName, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(name.clone(), HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn key_normalizes_host_port_and_path() -> Result<()> {
        let a = CacheKey::from_uri(&"http://Example.COM/a%20b?x=1".parse()?)?;
        let b = CacheKey::from_uri(&"http://example.com:80/a%20b?x=1".parse()?)?;
        assert_eq!(a.as_str(), "http://example.com:80/a b?x=1");
        assert_eq!(a, b);
        assert_eq!(a.digest().len(), 40);
        Ok(())
    }

    #[test]
    fn vary_star_is_uncacheable() {
        let resp = headers(&[(VARY, "*")]);
        assert_eq!(
            VarianceKey::from_response(&resp, &HeaderMap::new()).unwrap_err(),
            VaryError::Uncacheable
        );
    }

    #[test]
    fn captures_absent_header_as_none() {
        let resp = headers(&[(VARY, "Accept-Language")]);
        let key = VarianceKey::from_response(&resp, &HeaderMap::new()).expect("cacheable");
        assert!(key.matches(&HeaderMap::new()));
        assert!(!key.matches(&headers(&[(ACCEPT_LANGUAGE, "fi")])));
    }

    #[test]
    fn matches_requests_under_header_rules() {
        let resp = headers(&[(VARY, "Accept, Accept-Encoding")]);
        let req = headers(&[
            (ACCEPT, "text/html, application/json;q=0.5"),
            (ACCEPT_ENCODING, "gzip"),
        ]);
        let key = VarianceKey::from_response(&resp, &req).expect("cacheable");
        let reordered = headers(&[
            (ACCEPT, "application/json;q=0.5, text/html"),
            (ACCEPT_ENCODING, "GZIP"),
        ]);
        assert!(key.matches(&reordered));
        let other = headers(&[(ACCEPT, "text/plain"), (ACCEPT_ENCODING, "gzip")]);
        assert!(!key.matches(&other));
    }

    #[test]
    fn equality_is_order_independent_over_names() {
        let a = VarianceKey::from_pairs(&[
            ("accept".into(), Some("text/html".into())),
            ("accept-encoding".into(), None),
        ]);
        let b = VarianceKey::from_pairs(&[
            ("accept-encoding".into(), None),
            ("accept".into(), Some("TEXT/HTML".into())),
        ]);
        assert_eq!(a, b);
        assert_ne!(a, VarianceKey::empty());
    }
}
