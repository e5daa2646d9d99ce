use std::time::SystemTime;

use http::header::{
    AGE, AUTHORIZATION, CACHE_CONTROL, DATE, EXPIRES, LAST_MODIFIED, PRAGMA, SET_COOKIE,
};
use http::{HeaderMap, Method};

use crate::clock::unix_secs;

use super::meta::EntryMeta;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CacheControl {
    pub public: bool,
    pub private: bool,
    pub no_cache: bool,
    pub no_store: bool,
    pub max_age: Option<i64>,
    pub s_maxage: Option<i64>,
}

pub(crate) fn parse_cache_control(headers: &HeaderMap) -> CacheControl {
    let mut cc = CacheControl::default();

    for value in headers.get_all(CACHE_CONTROL) {
        let Ok(s) = value.to_str() else {
            continue;
        };
        for part in s.split(',') {
            let part = part.trim();
            let (name, arg) = match part.split_once('=') {
                Some((name, arg)) => (name.trim(), Some(arg.trim().trim_matches('"'))),
                None => (part, None),
            };
            if name.eq_ignore_ascii_case("public") {
                cc.public = true;
            } else if name.eq_ignore_ascii_case("private") {
                cc.private = true;
            } else if name.eq_ignore_ascii_case("no-cache") {
                cc.no_cache = true;
            } else if name.eq_ignore_ascii_case("no-store") {
                cc.no_store = true;
            } else if name.eq_ignore_ascii_case("max-age") {
                if let Some(secs) = arg.and_then(|v| v.parse::<i64>().ok()) {
                    cc.max_age = Some(secs.max(0));
                }
            } else if name.eq_ignore_ascii_case("s-maxage")
                && let Some(secs) = arg.and_then(|v| v.parse::<i64>().ok())
            {
                cc.s_maxage = Some(secs.max(0));
            }
        }
    }
    cc
}

/// Whether a client request may be answered from, or stored into, the cache.
pub(crate) fn request_is_cacheable(method: &Method, headers: &HeaderMap) -> bool {
    if method != Method::GET {
        return false;
    }
    if headers.contains_key(AUTHORIZATION) {
        return false;
    }
    let cc = parse_cache_control(headers);
    if cc.no_store || cc.no_cache {
        return false;
    }
    !headers
        .get_all(PRAGMA)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.to_ascii_lowercase().contains("no-cache"))
}

/// Post hoc check on a completed 200 response. `Vary: *` is rejected
/// separately when the variance key is built.
pub(crate) fn response_is_storable(headers: &HeaderMap) -> bool {
    let cc = parse_cache_control(headers);
    !(cc.no_store || cc.private || headers.contains_key(SET_COOKIE))
}

fn header_date(headers: &HeaderMap, name: http::header::HeaderName) -> Option<Option<i64>> {
    let value = headers.get(name)?;
    Some(
        value
            .to_str()
            .ok()
            .and_then(|s| httpdate::parse_http_date(s.trim()).ok())
            .map(unix_secs),
    )
}

/// Freshness lifetime in seconds. Zero means always stale.
pub(crate) fn freshness_lifetime(meta: &EntryMeta) -> i64 {
    let cc = parse_cache_control(&meta.headers);
    if let Some(secs) = cc.s_maxage {
        return secs;
    }
    if let Some(secs) = cc.max_age {
        return secs;
    }

    let date = header_date(&meta.headers, DATE).flatten();
    if let Some(date) = date
        && let Some(expires) = header_date(&meta.headers, EXPIRES)
    {
        return match expires {
            Some(expires) => (expires - date).max(0),
            None => 0,
        };
    }
    if let Some(date) = date
        && let Some(Some(last_modified)) = header_date(&meta.headers, LAST_MODIFIED)
    {
        return ((date - last_modified) / 10).max(0);
    }

    if meta.not_modified_count > 0
        && let Some(last) = meta.last_not_modified
    {
        let age = (unix_secs(last) - unix_secs(meta.created)).max(0);
        return age + i64::from(meta.not_modified_count) * age / 10;
    }
    0
}

/// Current age in seconds as of `now`.
pub(crate) fn current_age(meta: &EntryMeta, now: SystemTime) -> i64 {
    let response_time = unix_secs(meta.response_time);
    let request_time = unix_secs(meta.request_time);
    let apparent = match header_date(&meta.headers, DATE).flatten() {
        Some(date) => (response_time - date).max(0),
        None => (response_time - unix_secs(meta.created)).max(0),
    };
    let age_header = meta
        .headers
        .get(AGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<i64>().ok())
        .unwrap_or(0);
    let corrected = apparent.max(age_header + (response_time - request_time));
    corrected + (unix_secs(now) - response_time)
}

/// Lifetime minus age; negative values are past their lifetime.
pub(crate) fn refreshness(meta: &EntryMeta, now: SystemTime) -> i64 {
    freshness_lifetime(meta) - current_age(meta, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::from_unix_secs;
    use http::{HeaderValue, StatusCode};

    const T0: i64 = 1_700_000_000;

    fn meta(headers: &[(http::header::HeaderName, String)]) -> EntryMeta {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(name.clone(), HeaderValue::from_str(value).unwrap());
        }
        EntryMeta {
            status: StatusCode::OK,
            headers: map,
            content_length: None,
            digest: None,
            not_modified_count: 0,
            last_not_modified: None,
            request_time: from_unix_secs(T0),
            response_time: from_unix_secs(T0),
            created: from_unix_secs(T0),
        }
    }

    fn http_date(secs: i64) -> String {
        httpdate::fmt_http_date(from_unix_secs(secs))
    }

    #[test]
    fn parses_directives_case_insensitively() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CACHE_CONTROL,
            HeaderValue::from_static("Public, MAX-AGE=\"3600\", s-maxage=10"),
        );
        let cc = parse_cache_control(&headers);
        assert!(cc.public);
        assert_eq!(cc.max_age, Some(3600));
        assert_eq!(cc.s_maxage, Some(10));
        assert!(!cc.private);
    }

    #[test]
    fn request_cacheability() {
        let mut headers = HeaderMap::new();
        assert!(request_is_cacheable(&Method::GET, &headers));
        assert!(!request_is_cacheable(&Method::POST, &headers));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        assert!(!request_is_cacheable(&Method::GET, &headers));
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic eDp5"));
        assert!(!request_is_cacheable(&Method::GET, &headers));
        let mut headers = HeaderMap::new();
        headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
        assert!(!request_is_cacheable(&Method::GET, &headers));
    }

    #[test]
    fn storable_rejects_private_and_cookies() {
        let mut headers = HeaderMap::new();
        assert!(response_is_storable(&headers));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("private"));
        assert!(!response_is_storable(&headers));
        let mut headers = HeaderMap::new();
        headers.insert(SET_COOKIE, HeaderValue::from_static("a=b"));
        assert!(!response_is_storable(&headers));
    }

    #[test]
    fn s_maxage_wins_over_max_age() {
        let m = meta(&[(CACHE_CONTROL, "max-age=60, s-maxage=5".into())]);
        assert_eq!(freshness_lifetime(&m), 5);
    }

    #[test]
    fn expires_minus_date() {
        let m = meta(&[
            (DATE, http_date(T0)),
            (EXPIRES, http_date(T0 + 300)),
        ]);
        assert_eq!(freshness_lifetime(&m), 300);
        let m = meta(&[(DATE, http_date(T0)), (EXPIRES, "0".into())]);
        assert_eq!(freshness_lifetime(&m), 0);
    }

    #[test]
    fn last_modified_heuristic_is_a_tenth() {
        let m = meta(&[
            (DATE, http_date(T0)),
            (LAST_MODIFIED, http_date(T0 - 600)),
        ]);
        assert_eq!(freshness_lifetime(&m), 60);
    }

    #[test]
    fn revalidation_history_extends_lifetime() {
        let mut m = meta(&[]);
        assert_eq!(freshness_lifetime(&m), 0);
        m.not_modified_count = 2;
        m.last_not_modified = Some(from_unix_secs(T0 + 100));
        assert_eq!(freshness_lifetime(&m), 100 + 2 * 100 / 10);
    }

    #[test]
    fn current_age_accounts_for_age_header_and_residency() {
        let mut m = meta(&[(DATE, http_date(T0 - 5)), (AGE, "30".into())]);
        m.request_time = from_unix_secs(T0 - 2);
        let now = from_unix_secs(T0 + 10);
        assert_eq!(current_age(&m, now), 32 + 10);
        let m = meta(&[(DATE, http_date(T0 - 5))]);
        assert_eq!(current_age(&m, now), 5 + 10);
    }

    #[test]
    fn refreshness_goes_negative_once_stale() {
        let m = meta(&[(CACHE_CONTROL, "max-age=10".into()), (DATE, http_date(T0))]);
        assert_eq!(refreshness(&m, from_unix_secs(T0 + 4)), 6);
        assert!(refreshness(&m, from_unix_secs(T0 + 20)) < 0);
    }
}
