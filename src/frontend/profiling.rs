use crate::frontend::context::{unix_now, ReqParams};
use crate::frontend::parser::{build_params, QueryParsers};
use prost::Message;

/// Profiling query endpoints, identified by the last path segment of the
/// RPC-style path (e.g. `/querier.v1.QuerierService/SelectMergeStacktraces`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfilingFamily {
    SelectMergeStacktraces,
    LabelNames,
    LabelValues,
}

pub fn profiling_family(path: &str) -> Option<ProfilingFamily> {
    match path.trim_end_matches('/').rsplit('/').next() {
        Some("SelectMergeStacktraces") => Some(ProfilingFamily::SelectMergeStacktraces),
        Some("LabelNames") => Some(ProfilingFamily::LabelNames),
        Some("LabelValues") => Some(ProfilingFamily::LabelValues),
        _ => None,
    }
}

/// Wire messages of the profiling querier API. Declared by hand with
/// explicit tags; only the fields the parser consumes are interpreted,
/// unknown fields are skipped by the decoder.
#[derive(Clone, PartialEq, Message)]
pub struct SelectMergeStacktracesRequest {
    #[prost(string, tag = "1")]
    pub profile_type_id: String,
    #[prost(string, tag = "2")]
    pub label_selector: String,
    /// Milliseconds since epoch.
    #[prost(int64, tag = "3")]
    pub start: i64,
    #[prost(int64, tag = "4")]
    pub end: i64,
    #[prost(int64, optional, tag = "5")]
    pub max_nodes: Option<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct LabelNamesRequest {
    #[prost(string, repeated, tag = "1")]
    pub matchers: Vec<String>,
    #[prost(int64, tag = "2")]
    pub start: i64,
    #[prost(int64, tag = "3")]
    pub end: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct LabelValuesRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, repeated, tag = "2")]
    pub matchers: Vec<String>,
    #[prost(int64, tag = "3")]
    pub start: i64,
    #[prost(int64, tag = "4")]
    pub end: i64,
}

/// Decode a request body that is either a bare protobuf message or wrapped
/// in the RPC framing envelope (1 flag byte + u32 big-endian length).
fn decode_body<M: Message + Default>(body: &[u8]) -> Option<M> {
    if let Ok(msg) = M::decode(body) {
        return Some(msg);
    }
    if body.len() >= 5 {
        let declared = u32::from_be_bytes([body[1], body[2], body[3], body[4]]) as usize;
        if declared == body.len() - 5 {
            if let Ok(msg) = M::decode(&body[5..]) {
                return Some(msg);
            }
        }
    }
    None
}

/// Parse one profiling-family request into `ReqParams`.
///
/// Returns `None` when the path is outside the profiling endpoint families.
/// An undecodable body yields empty UUIDs and a zero query period, same as
/// the TSDB parser's best-effort stance.
pub fn parse_pyroscope_params(
    parsers: &QueryParsers,
    cluster_id: &str,
    path: &str,
    body: &[u8],
) -> Option<ReqParams> {
    let family = profiling_family(path)?;

    let (selectors, start_millis): (Vec<String>, i64) = match family {
        ProfilingFamily::SelectMergeStacktraces => decode_body::<SelectMergeStacktracesRequest>(body)
            .map(|m| (vec![m.label_selector], m.start))
            .unwrap_or_default(),
        ProfilingFamily::LabelNames => decode_body::<LabelNamesRequest>(body)
            .map(|m| (m.matchers, m.start))
            .unwrap_or_default(),
        ProfilingFamily::LabelValues => decode_body::<LabelValuesRequest>(body)
            .map(|m| (m.matchers, m.start))
            .unwrap_or_default(),
    };

    let now = unix_now();
    let start = if start_millis > 0 {
        Some((start_millis / 1000) as u64)
    } else {
        None
    };

    let final_cluster_id = parsers
        .extract_cluster_id(&selectors)
        .unwrap_or_else(|| cluster_id.to_string());

    Some(build_params(
        final_cluster_id,
        parsers.extract_uuids(&selectors),
        start,
        now,
    ))
}
