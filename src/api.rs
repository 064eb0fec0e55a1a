use crate::model::{Category, Stats};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

pub const CLIENT_NAME: &str = "appenlight-rust";
pub const LANGUAGE: &str = "rust";
pub const REMOTE_HTTP_NAMESPACE: &str = "remote.http";

pub(crate) fn iso8601(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Flatten a nested tag structure into `(dotted.key, value)` pairs.
///
/// Objects and arrays are walked recursively in their natural order, array
/// positions becoming key segments. Strings are kept verbatim and every other
/// leaf is rendered as its JSON text. A scalar root has no keys and yields
/// nothing.
pub fn flatten_tags(tags: &Value) -> Vec<(String, String)> {
    let mut flat = Vec::new();
    flatten_into(tags, None, &mut flat);
    flat
}

fn flatten_into(value: &Value, prefix: Option<&str>, flat: &mut Vec<(String, String)>) {
    let key_for = |segment: &str| match prefix {
        Some(p) => format!("{}.{}", p, segment),
        None => segment.to_string(),
    };
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                flatten_leaf(v, key_for(k), flat);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                flatten_leaf(v, key_for(&i.to_string()), flat);
            }
        }
        _ => {}
    }
}

fn flatten_leaf(value: &Value, key: String, flat: &mut Vec<(String, String)>) {
    match value {
        Value::Object(_) | Value::Array(_) => flatten_into(value, Some(&key), flat),
        Value::String(s) => flat.push((key, s.clone())),
        other => flat.push((key, other.to_string())),
    }
}

/// A retained child span, as listed under `slow_calls` in a report.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct SlowCall {
    pub start: String,
    pub end: String,
    #[serde(rename = "type")]
    pub category: Category,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statement: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    pub duration: f64,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct RequestSummary {
    #[serde(rename = "REQUEST_METHOD")]
    pub method: String,
    #[serde(rename = "PATH_INFO")]
    pub path: String,
    #[serde(rename = "QUERY", skip_serializing_if = "Option::is_none")]
    pub query: Option<Map<String, Value>>,
}

impl RequestSummary {
    pub fn new(method: &str, path: &str, query: &[(String, String)]) -> Self {
        let query = if query.is_empty() {
            None
        } else {
            Some(
                query
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            )
        };
        RequestSummary {
            method: method.to_string(),
            path: path.to_string(),
            query,
        }
    }
}

/// Detailed record for a request that errored or ran slow.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct ReportRecord {
    pub client: String,
    pub version: String,
    pub language: String,
    pub view_name: String,
    pub server: String,
    pub http_status: u16,
    pub ip: Option<String>,
    pub start_time: String,
    pub end_time: String,
    pub user_agent: Option<String>,
    pub request_id: String,
    pub request: RequestSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub tags: Vec<(String, String)>,
    pub request_stats: Stats,
    pub slow_calls: Vec<SlowCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub priority: u8,
}

/// Aggregate timing for one request, serialized as `[name, stats]`.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct MetricsRecord(pub String, pub Stats);

/// Body sent for one flush of the metrics channel.
#[derive(Debug, Serialize)]
pub(crate) struct MetricsEnvelope<'a> {
    pub server: &'a str,
    pub timestamp: String,
    pub metrics: &'a [MetricsRecord],
}

/// Per-destination latency sample for an outbound HTTP call.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct CustomMetricRecord {
    pub timestamp: String,
    pub namespace: String,
    pub server_name: String,
    pub tags: Vec<(String, Value)>,
}

impl CustomMetricRecord {
    pub fn remote_http(
        timestamp: String,
        server_name: &str,
        method: &str,
        hostname: &str,
        path: &str,
        pathname: &str,
        duration: f64,
    ) -> Self {
        let tag = |k: &str, v: Value| (k.to_string(), v);
        CustomMetricRecord {
            timestamp,
            namespace: REMOTE_HTTP_NAMESPACE.to_string(),
            server_name: server_name.to_string(),
            tags: vec![
                tag("type", Value::from("remote")),
                tag("subtype", Value::from("http")),
                tag("method", Value::from(method)),
                tag("hostname", Value::from(hostname)),
                tag("path", Value::from(path)),
                tag("pathname", Value::from(pathname)),
                tag("value", Value::from(duration)),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pairs(expected: &[(&str, &str)]) -> Vec<(String, String)> {
        expected
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_flatten_nested_tags() {
        let tags = json!({"a": {"b": 1, "c": {"d": 2}}});
        assert_eq!(flatten_tags(&tags), pairs(&[("a.b", "1"), ("a.c.d", "2")]));
    }

    #[test]
    fn test_flatten_keeps_input_order() {
        let tags = json!({"zeta": "z", "alpha": {"y": true, "b": null}, "mid": 1.5});
        assert_eq!(
            flatten_tags(&tags),
            pairs(&[
                ("zeta", "z"),
                ("alpha.y", "true"),
                ("alpha.b", "null"),
                ("mid", "1.5")
            ])
        );
    }

    #[test]
    fn test_flatten_arrays_and_scalar_roots() {
        let tags = json!({"hosts": ["a", "b"]});
        assert_eq!(
            flatten_tags(&tags),
            pairs(&[("hosts.0", "a"), ("hosts.1", "b")])
        );
        assert!(flatten_tags(&Value::Null).is_empty());
        assert!(flatten_tags(&json!("loose")).is_empty());
    }

    #[test]
    fn test_metrics_record_is_a_pair() {
        let record = MetricsRecord("GET:/users".into(), Stats::default());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json[0], json!("GET:/users"));
        assert_eq!(json[1]["main"], json!(0.0));
        assert_eq!(json[1]["sql_calls"], json!(0));
    }

    #[test]
    fn test_map_custom_metric() {
        let record = CustomMetricRecord::remote_http(
            "2024-01-01T00:00:00.000Z".into(),
            "web-1",
            "POST",
            "api.example.com",
            "/v1/items?x=1",
            "/v1/items",
            0.25,
        );
        let expected = json!({
            "timestamp": "2024-01-01T00:00:00.000Z",
            "namespace": "remote.http",
            "server_name": "web-1",
            "tags": [
                ["type", "remote"],
                ["subtype", "http"],
                ["method", "POST"],
                ["hostname", "api.example.com"],
                ["path", "/v1/items?x=1"],
                ["pathname", "/v1/items"],
                ["value", 0.25],
            ],
        });
        assert_eq!(serde_json::to_value(&record).unwrap(), expected);
    }

    #[test]
    fn test_request_summary_query() {
        let summary = RequestSummary::new("GET", "/search", &[]);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json, json!({"REQUEST_METHOD": "GET", "PATH_INFO": "/search"}));

        let summary = RequestSummary::new("GET", "/search", &[("q".into(), "rust".into())]);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["QUERY"], json!({"q": "rust"}));
    }
}
