use std::time::SystemTime;

use http::header::{CONNECTION, CONTENT_LENGTH, HeaderName, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};

use crate::clock::{from_unix_secs, unix_secs};

/// Provenance of a cached response. Lives next to the data file as a JSON
/// sidecar so a restarted process can rebuild its entries.
#[derive(Debug, Clone)]
pub(crate) struct EntryMeta {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub digest: Option<String>,
    pub not_modified_count: u32,
    pub last_not_modified: Option<SystemTime>,
    pub request_time: SystemTime,
    pub response_time: SystemTime,
    pub created: SystemTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PersistedEntry {
    pub key: String,
    pub uri: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub vary: Vec<(String, Option<String>)>,
    pub content_length: Option<u64>,
    pub digest: Option<String>,
    #[serde(default)]
    pub not_modified_count: u32,
    pub last_not_modified: Option<i64>,
    pub request_time: i64,
    pub response_time: i64,
    pub created: i64,
}

impl EntryMeta {
    pub(crate) fn to_persisted(
        &self,
        key: &str,
        uri: &str,
        vary: Vec<(String, Option<String>)>,
    ) -> PersistedEntry {
        PersistedEntry {
            key: key.to_string(),
            uri: uri.to_string(),
            status: self.status.as_u16(),
            headers: headermap_to_vec(&self.headers),
            vary,
            content_length: self.content_length,
            digest: self.digest.clone(),
            not_modified_count: self.not_modified_count,
            last_not_modified: self.last_not_modified.map(unix_secs),
            request_time: unix_secs(self.request_time),
            response_time: unix_secs(self.response_time),
            created: unix_secs(self.created),
        }
    }

    pub(crate) fn from_persisted(persisted: &PersistedEntry) -> Option<Self> {
        let status = StatusCode::from_u16(persisted.status).ok()?;
        Some(Self {
            status,
            headers: to_headermap(&persisted.headers),
            content_length: persisted.content_length,
            digest: persisted.digest.clone(),
            not_modified_count: persisted.not_modified_count,
            last_not_modified: persisted.last_not_modified.map(from_unix_secs),
            request_time: from_unix_secs(persisted.request_time),
            response_time: from_unix_secs(persisted.response_time),
            created: from_unix_secs(persisted.created),
        })
    }

    /// Folds a revalidation result into this copy: the newer headers replace
    /// stored ones, the age restarts, and the not-modified history grows.
    pub(crate) fn absorb_revalidation(
        &mut self,
        update: &HeaderMap,
        request_time: SystemTime,
        response_time: SystemTime,
    ) {
        merge_headers(&mut self.headers, update);
        self.not_modified_count = self.not_modified_count.saturating_add(1);
        self.last_not_modified = Some(response_time);
        self.request_time = request_time;
        self.response_time = response_time;
    }

    pub(crate) fn etag(&self) -> Option<&str> {
        header_str(&self.headers, http::header::ETAG)
    }

    pub(crate) fn last_modified(&self) -> Option<&str> {
        header_str(&self.headers, http::header::LAST_MODIFIED)
    }

    pub(crate) fn accepts_byte_ranges(&self) -> bool {
        self.headers
            .get_all(http::header::ACCEPT_RANGES)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|unit| unit.trim().eq_ignore_ascii_case("bytes"))
    }
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> Option<&str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// RFC 7234 §4.3.4: replace stored fields with the ones carried by the
/// update, leaving framing headers alone.
pub(crate) fn merge_headers(stored: &mut HeaderMap, update: &HeaderMap) {
    for name in update.keys() {
        if *name == CONTENT_LENGTH || *name == TRANSFER_ENCODING || *name == CONNECTION {
            continue;
        }
        stored.remove(name);
        for value in update.get_all(name) {
            stored.append(name.clone(), value.clone());
        }
    }
}

pub(crate) fn to_headermap(items: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in items {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(value),
        ) {
            map.append(name, value);
        }
    }
    map
}

pub(crate) fn headermap_to_vec(map: &HeaderMap) -> Vec<(String, String)> {
    map.iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}
