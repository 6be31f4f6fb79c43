//! Request builder: turns a detached batch into outbound HTTP requests.
//!
//! A batch is encoded as a JSON array holding one batch object, gzip
//! compressed, and tagged with the headers the ingestion API expects. Batches
//! whose compressed payload exceeds [`MAX_COMPRESSED_BYTES`] are halved until
//! each part fits or holds a single entity.

use crate::config::Config;
use crate::error::BuildError;
use crate::span::RecordedSpan;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE, USER_AGENT,
};
use reqwest::Method;
use serde::Serialize;
use serde_json::value::RawValue;
use std::io::{Read, Write};
use url::Url;

/// Largest compressed payload sent in a single request.
pub const MAX_COMPRESSED_BYTES: usize = 1_000_000;

const API_KEY: &str = "api-key";
const DATA_FORMAT: &str = "data-format";
const DATA_FORMAT_VERSION: &str = "data-format-version";

/// Which pipeline a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Spans,
    Metrics,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Spans => "spans",
            Self::Metrics => "metrics",
        }
    }

    fn destination(self, config: &Config) -> &str {
        match self {
            Self::Spans => config.spans_url(),
            Self::Metrics => config.metrics_url(),
        }
    }
}

/// A ready-to-send request.
#[derive(Debug, Clone)]
pub struct HarvestRequest {
    pub kind: EntityKind,
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    /// gzip-compressed payload
    pub body: Vec<u8>,
    /// Payload before compression, kept for the audit log
    pub uncompressed_body: Vec<u8>,
}

impl HarvestRequest {
    /// Uncompressed payload as text.
    pub fn uncompressed_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.uncompressed_body)
    }
}

/// gzip-compresses `data`.
pub fn compress(data: &[u8]) -> Result<Vec<u8>, BuildError> {
    let mut enc = GzEncoder::new(Vec::with_capacity(data.len() / 4), Compression::default());
    enc.write_all(data)
        .map_err(|e| BuildError::Compress(e.to_string()))?;
    enc.finish().map_err(|e| BuildError::Compress(e.to_string()))
}

/// Reverses [`compress`].
pub fn uncompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

fn header_value(name: &'static str, value: &str) -> Result<HeaderValue, BuildError> {
    HeaderValue::from_str(value).map_err(|_| BuildError::InvalidHeader { name })
}

fn parse_destination(config: &Config, kind: EntityKind) -> Result<Url, BuildError> {
    let raw = kind.destination(config);
    Url::parse(raw).map_err(|e| BuildError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })
}

fn headers(config: &Config, kind: EntityKind) -> Result<HeaderMap, BuildError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    headers.insert(
        HeaderName::from_static(API_KEY),
        header_value("Api-Key", &config.api_key)?,
    );
    headers.insert(USER_AGENT, header_value("User-Agent", &config.user_agent())?);
    if kind == EntityKind::Spans {
        headers.insert(
            HeaderName::from_static(DATA_FORMAT),
            HeaderValue::from_static("newrelic"),
        );
        headers.insert(
            HeaderName::from_static(DATA_FORMAT_VERSION),
            HeaderValue::from_static("1"),
        );
    }
    Ok(headers)
}

fn assemble(
    url: &Url,
    headers: &HeaderMap,
    kind: EntityKind,
    uncompressed_body: Vec<u8>,
) -> Result<HarvestRequest, BuildError> {
    let body = compress(&uncompressed_body)?;
    Ok(HarvestRequest {
        kind,
        method: Method::POST,
        url: url.clone(),
        headers: headers.clone(),
        body,
        uncompressed_body,
    })
}

/// Builds a single request for an already-encoded payload.
pub fn build_request(
    config: &Config,
    kind: EntityKind,
    uncompressed_body: Vec<u8>,
) -> Result<HarvestRequest, BuildError> {
    let url = parse_destination(config, kind)?;
    let headers = headers(config, kind)?;
    assemble(&url, &headers, kind, uncompressed_body)
}

/// Encodes `items` with `encode` and builds as many requests as needed to
/// keep each compressed body under [`MAX_COMPRESSED_BYTES`].
///
/// The destination is parsed first, so a bad URL fails before any encoding.
pub fn build_requests<T>(
    config: &Config,
    kind: EntityKind,
    items: &[T],
    encode: &dyn Fn(&[T]) -> Result<Vec<u8>, BuildError>,
) -> Result<Vec<HarvestRequest>, BuildError> {
    if items.is_empty() {
        return Ok(Vec::new());
    }
    let url = parse_destination(config, kind)?;
    let headers = headers(config, kind)?;

    let mut out = Vec::new();
    split_into(&url, &headers, kind, items, encode, &mut out)?;
    Ok(out)
}

fn split_into<T>(
    url: &Url,
    headers: &HeaderMap,
    kind: EntityKind,
    items: &[T],
    encode: &dyn Fn(&[T]) -> Result<Vec<u8>, BuildError>,
    out: &mut Vec<HarvestRequest>,
) -> Result<(), BuildError> {
    let request = assemble(url, headers, kind, encode(items)?)?;
    if request.body.len() <= MAX_COMPRESSED_BYTES || items.len() < 2 {
        out.push(request);
        return Ok(());
    }

    tracing::debug!(
        kind = kind.as_str(),
        items = items.len(),
        compressed = request.body.len(),
        "payload too large, splitting batch"
    );
    let (left, right) = items.split_at(items.len() / 2);
    split_into(url, headers, kind, left, encode, out)?;
    split_into(url, headers, kind, right, encode, out)
}

#[derive(Serialize)]
struct SpanCommon<'a> {
    attributes: &'a RawValue,
}

#[derive(Serialize)]
struct SpanBatch<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    common: Option<SpanCommon<'a>>,
    spans: &'a [RecordedSpan],
}

/// Shared fields of a metric batch.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MetricCommon<'a> {
    /// Start of the harvest window, epoch ms
    pub timestamp: i64,
    /// Length of the harvest window, ms
    #[serde(rename = "interval.ms")]
    pub interval_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<&'a RawValue>,
}

#[derive(Serialize)]
struct MetricBatch<'a> {
    common: MetricCommon<'a>,
    metrics: &'a [Box<RawValue>],
}

/// `[{"common":{...},"spans":[...]}]`
pub fn encode_spans(
    common: Option<&RawValue>,
    spans: &[RecordedSpan],
) -> Result<Vec<u8>, BuildError> {
    let batch = SpanBatch {
        common: common.map(|attributes| SpanCommon { attributes }),
        spans,
    };
    serde_json::to_vec(&[batch]).map_err(|e| BuildError::Encode(e.to_string()))
}

/// `[{"common":{...},"metrics":[...]}]`
pub fn encode_metrics(
    common: MetricCommon<'_>,
    metrics: &[Box<RawValue>],
) -> Result<Vec<u8>, BuildError> {
    let batch = MetricBatch { common, metrics };
    serde_json::to_vec(&[batch]).map_err(|e| BuildError::Encode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::Span;
    use std::time::{Duration, UNIX_EPOCH};

    fn config() -> Config {
        Config::new("api-key")
    }

    #[test]
    fn test_compress_round_trip() {
        let data = br#"[{"metrics":[]}]"#;
        let compressed = compress(data).unwrap();
        assert_eq!(&compressed[..2], &[0x1f, 0x8b]);
        assert_eq!(uncompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_metric_request_headers() {
        let req = build_request(&config(), EntityKind::Metrics, b"[]".to_vec()).unwrap();
        assert_eq!(req.method, Method::POST);
        assert_eq!(req.url.as_str(), "https://metric-api.newrelic.com/metric/v1");
        assert_eq!(req.headers["content-type"], "application/json");
        assert_eq!(req.headers["content-encoding"], "gzip");
        assert_eq!(req.headers["api-key"], "api-key");
        assert!(!req.headers["user-agent"].is_empty());
        assert!(req.headers.get("data-format").is_none());
    }

    #[test]
    fn test_span_request_headers() {
        let req = build_request(&config(), EntityKind::Spans, b"[]".to_vec()).unwrap();
        assert_eq!(req.url.as_str(), "https://trace-api.newrelic.com/trace/v1");
        assert_eq!(req.headers["data-format"], "newrelic");
        assert_eq!(req.headers["data-format-version"], "1");
    }

    #[test]
    fn test_invalid_url() {
        let config = config().with_metrics_url("t h i s  i s  n o t  a  h o s t%");
        let err = build_request(&config, EntityKind::Metrics, Vec::new()).unwrap_err();
        assert!(matches!(err, BuildError::InvalidUrl { .. }));

        let encode = |_: &[u8]| -> Result<Vec<u8>, BuildError> {
            panic!("encoded before url check")
        };
        assert!(build_requests(&config, EntityKind::Metrics, &[1u8], &encode).is_err());
    }

    #[test]
    fn test_empty_batch_builds_nothing() {
        let encode = |_: &[u8]| -> Result<Vec<u8>, BuildError> { Ok(b"[]".to_vec()) };
        let reqs = build_requests(&config(), EntityKind::Spans, &[], &encode).unwrap();
        assert!(reqs.is_empty());
    }

    #[test]
    fn test_oversized_batch_is_split() {
        // Incompressible-ish payload: every item contributes distinct bytes.
        let items: Vec<u64> = (0..4).collect();
        let encode = |chunk: &[u64]| -> Result<Vec<u8>, BuildError> {
            let mut out = Vec::new();
            for i in chunk {
                let mut x = *i + 1;
                for _ in 0..(MAX_COMPRESSED_BYTES / 3) {
                    // xorshift keeps the stream from compressing well
                    x ^= x << 13;
                    x ^= x >> 7;
                    x ^= x << 17;
                    out.push((x & 0xff) as u8);
                }
            }
            Ok(out)
        };

        let reqs = build_requests(&config(), EntityKind::Spans, &items, &encode).unwrap();
        assert!(reqs.len() >= 2, "expected a split, got {}", reqs.len());
        assert!(reqs.iter().all(|r| r.body.len() <= MAX_COMPRESSED_BYTES));
    }

    #[test]
    fn test_encode_spans_payload() {
        let span =
            Span::new("id", "trace", "op").with_timestamp(UNIX_EPOCH + Duration::from_secs(1));
        let (recorded, _) = RecordedSpan::from_span(span, UNIX_EPOCH);

        let js = encode_spans(None, std::slice::from_ref(&recorded)).unwrap();
        let js = String::from_utf8(js).unwrap();
        assert!(js.starts_with(r#"[{"spans":[{"id":"id","trace.id":"trace","timestamp":1000"#));

        let common = RawValue::from_string(r#"{"host":"a"}"#.into()).unwrap();
        let js = encode_spans(Some(&common), &[recorded]).unwrap();
        assert!(String::from_utf8(js)
            .unwrap()
            .starts_with(r#"[{"common":{"attributes":{"host":"a"}},"spans":["#));
    }

    #[test]
    fn test_encode_metrics_payload() {
        let metric =
            RawValue::from_string(r#"{"name":"","type":"count","value":0}"#.into()).unwrap();
        let common = MetricCommon {
            timestamp: 1000,
            interval_ms: 5000,
            attributes: None,
        };
        let js = encode_metrics(common, &[metric]).unwrap();
        assert_eq!(
            String::from_utf8(js).unwrap(),
            r#"[{"common":{"timestamp":1000,"interval.ms":5000},"metrics":[{"name":"","type":"count","value":0}]}]"#
        );
    }
}
