use crate::frontend::context::{unix_now, ReqParams};
use regex::Regex;
use std::time::Duration;

/// TSDB query endpoint families, identified by the last path segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsdbFamily {
    Query,
    QueryRange,
    Labels,
    Values,
    Series,
}

pub fn tsdb_family(path: &str) -> Option<TsdbFamily> {
    match path.trim_end_matches('/').rsplit('/').next() {
        Some("query") => Some(TsdbFamily::Query),
        Some("query_range") => Some(TsdbFamily::QueryRange),
        Some("labels") => Some(TsdbFamily::Labels),
        Some("values") => Some(TsdbFamily::Values),
        Some("series") => Some(TsdbFamily::Series),
        _ => None,
    }
}

/// Prometheus "time cannot be represented" sentinels, accepted verbatim by
/// the TSDB query API.
const MIN_TIME_SENTINEL: &str = "-292273086-05-16T16:47:06Z";
const MAX_TIME_SENTINEL: &str = "292277026-08-04T15:42:51Z";

/// Compiled selector regexes, built once at startup and shared by all
/// requests of a frontend.
pub struct QueryParsers {
    /// Captures the quoted value of `uuid=`, `uuid=~` and `service_name=`
    /// selectors. The leading character class stands in for a negative
    /// look-behind: `gpuuuid` ends in `uuid` but is preceded by a letter,
    /// so it never matches. Value capture is non-greedy.
    uuid: Regex,
    /// Captures the quoted value of `ceems_id=` selectors.
    cluster_id: Regex,
}

impl Default for QueryParsers {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryParsers {
    pub fn new() -> Self {
        Self {
            uuid: Regex::new(
                r#"(?:^|[^a-zA-Z0-9_])(?:uuid|service_name)\s*(?:=~|=)\s*"([^"]*?)""#,
            )
            .expect("valid uuid selector regex"),
            cluster_id: Regex::new(r#"(?:^|[^a-zA-Z0-9_])ceems_id\s*(?:=~|=)\s*"([^"]*?)""#)
                .expect("valid ceems_id selector regex"),
        }
    }

    /// All UUIDs appearing in uuid/service_name selector positions across
    /// the given query strings, in input order, deduplicated. Alternation
    /// (`a|b|c`) inside one selector value contributes each alternative.
    pub fn extract_uuids(&self, queries: &[String]) -> Vec<String> {
        let mut uuids: Vec<String> = Vec::new();
        for query in queries {
            for caps in self.uuid.captures_iter(query) {
                for candidate in caps[1].split('|') {
                    let candidate = candidate.trim();
                    if candidate.is_empty() {
                        continue;
                    }
                    if !uuids.iter().any(|u| u == candidate) {
                        uuids.push(candidate.to_string());
                    }
                }
            }
        }
        uuids
    }

    /// Cluster id override from `ceems_id=` selectors; when several are
    /// present, the last one wins.
    pub fn extract_cluster_id(&self, queries: &[String]) -> Option<String> {
        let mut found = None;
        for query in queries {
            for caps in self.cluster_id.captures_iter(query) {
                found = Some(caps[1].to_string());
            }
        }
        found
    }
}

/// Parse one TSDB-family request into `ReqParams`.
///
/// Returns `None` when the path is outside the query endpoint families.
/// Parsing is best-effort: a request whose form or time cannot be read
/// yields empty UUIDs and a zero query period; verification decides what
/// that means.
pub fn parse_tsdb_params(
    parsers: &QueryParsers,
    cluster_id: &str,
    method: &http::Method,
    uri: &http::Uri,
    headers: &http::HeaderMap,
    body: &[u8],
) -> Option<ReqParams> {
    let family = tsdb_family(uri.path())?;

    let pairs = form_pairs(uri.query(), method, headers, body);

    let query_key = match family {
        TsdbFamily::Query | TsdbFamily::QueryRange => "query",
        _ => "match[]",
    };
    let queries: Vec<String> = pairs
        .iter()
        .filter(|(k, _)| k == query_key)
        .map(|(_, v)| v.clone())
        .collect();

    let time_key = match family {
        TsdbFamily::Query => "time",
        _ => "start",
    };
    let now = unix_now();
    let start = pairs
        .iter()
        .find(|(k, _)| k == time_key)
        .and_then(|(_, v)| parse_time(v, now));

    let final_cluster_id = parsers
        .extract_cluster_id(&queries)
        .unwrap_or_else(|| cluster_id.to_string());

    Some(build_params(
        final_cluster_id,
        parsers.extract_uuids(&queries),
        start,
        now,
    ))
}

pub(crate) fn build_params(
    cluster_id: String,
    uuids: Vec<String>,
    start: Option<u64>,
    now: u64,
) -> ReqParams {
    let start = start.unwrap_or(now);
    ReqParams {
        cluster_id,
        uuids,
        start,
        query_period: Duration::from_secs(now.saturating_sub(start)),
    }
}

/// Merge the URL query string with an urlencoded POST body, preserving
/// repeated keys. The body slice is caller-owned, so downstream handlers
/// re-read it untouched.
fn form_pairs(
    query: Option<&str>,
    method: &http::Method,
    headers: &http::HeaderMap,
    body: &[u8],
) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = Vec::new();
    if let Some(q) = query {
        pairs.extend(
            url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned())),
        );
    }

    if method == http::Method::POST {
        let is_form = headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
            .unwrap_or(false);
        if is_form {
            pairs.extend(
                url::form_urlencoded::parse(body).map(|(k, v)| (k.into_owned(), v.into_owned())),
            );
        }
    }

    pairs
}

/// TSDB time syntax: RFC 3339 (nanos allowed), decimal epoch seconds, or
/// the min/max sentinel strings.
pub fn parse_time(s: &str, now: u64) -> Option<u64> {
    match s {
        MIN_TIME_SENTINEL => return Some(0),
        MAX_TIME_SENTINEL => return Some(now),
        _ => {}
    }

    if let Ok(secs) = s.parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Some(secs as u64);
        }
        return None;
    }

    humantime::parse_rfc3339(s)
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
}
