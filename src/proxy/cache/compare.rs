use std::cmp::Ordering;

use http::HeaderName;

/// Equality strategies for header values captured by `Vary` or used as
/// validators. Picked per header name by [`comparator_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Comparator {
    Exact,
    WeakEtag,
    WeightedList,
}

pub(crate) fn comparator_for(name: &HeaderName) -> Comparator {
    match name.as_str() {
        "etag" | "if-none-match" | "if-match" | "if-range" => Comparator::WeakEtag,
        "authorization" | "cookie" | "host" => Comparator::Exact,
        _ => Comparator::WeightedList,
    }
}

impl Comparator {
    pub(crate) fn equal(self, left: Option<&str>, right: Option<&str>) -> bool {
        match (left, right) {
            (None, None) => true,
            (Some(left), Some(right)) => match self {
                Comparator::Exact => left == right,
                Comparator::WeakEtag => weak_etag_eq(left, right),
                Comparator::WeightedList => weighted_list_eq(left, right),
            },
            _ => false,
        }
    }
}

/// Weak comparison (RFC 7232 §2.3.2). A wildcard never matches.
pub(crate) fn weak_etag_eq(left: &str, right: &str) -> bool {
    if left.contains('*') || right.contains('*') {
        return false;
    }
    strip_weak(left) == strip_weak(right)
}

/// True when any tag in a comma separated `If-None-Match` style list weakly
/// matches `etag`.
pub(crate) fn etag_list_contains(list: &str, etag: &str) -> bool {
    list.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .any(|tag| weak_etag_eq(tag, etag))
}

fn strip_weak(value: &str) -> &str {
    let value = value.trim();
    value.strip_prefix("W/").unwrap_or(value)
}

#[derive(Debug, PartialEq)]
struct WeightedToken {
    weight: u16,
    sort_key: String,
    normalized: String,
}

pub(crate) fn weighted_list_eq(left: &str, right: &str) -> bool {
    let left = weighted_tokens(left);
    let right = weighted_tokens(right);
    left.len() == right.len()
        && left
            .iter()
            .zip(right.iter())
            .all(|(a, b)| a.normalized == b.normalized)
}

fn weighted_tokens(value: &str) -> Vec<WeightedToken> {
    let mut tokens: Vec<WeightedToken> = value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(parse_weighted_token)
        .collect();
    tokens.sort_by(|a, b| match b.weight.cmp(&a.weight) {
        Ordering::Equal => a.sort_key.cmp(&b.sort_key),
        other => other,
    });
    tokens
}

fn parse_weighted_token(part: &str) -> WeightedToken {
    let mut weight = 1000u16;
    let mut kept = Vec::new();
    for (idx, segment) in part.split(';').enumerate() {
        let segment = segment.trim();
        if idx > 0
            && let Some(q) = segment
                .strip_prefix("q=")
                .or_else(|| segment.strip_prefix("Q="))
        {
            weight = parse_qvalue(q);
            continue;
        }
        kept.push(segment);
    }
    let token = kept.join(";");
    WeightedToken {
        weight,
        sort_key: token.to_ascii_lowercase(),
        normalized: token
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect(),
    }
}

fn parse_qvalue(value: &str) -> u16 {
    match value.trim().parse::<f32>() {
        Ok(q) if q.is_finite() => (q.clamp(0.0, 1.0) * 1000.0).round() as u16,
        _ => 0,
    }
}
