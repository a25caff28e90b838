use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::VecDeque;

use crate::models::event::NewWideEvent;
use crate::models::trace::NewSpan;

// ── OTLP/HTTP-JSON request shapes ──

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportTraceRequest {
    #[serde(default)]
    pub resource_spans: Vec<ResourceSpans>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpans {
    #[serde(default)]
    pub resource: Option<Resource>,
    #[serde(default)]
    pub scope_spans: Vec<ScopeSpans>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Resource {
    #[serde(default)]
    pub attributes: Vec<KeyValue>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeSpans {
    #[serde(default)]
    pub spans: Vec<OtlpSpan>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtlpSpan {
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub span_id: String,
    #[serde(default)]
    pub parent_span_id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub start_time_unix_nano: Option<UnixNano>,
    #[serde(default)]
    pub end_time_unix_nano: Option<UnixNano>,
    #[serde(default)]
    pub status: Option<OtlpStatus>,
    #[serde(default)]
    pub attributes: Vec<KeyValue>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OtlpStatus {
    #[serde(default)]
    pub code: Value,
}

/// OTLP's proto3-JSON mapping serializes uint64 nanos as strings, but plenty
/// of emitters send plain numbers. Accept both.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum UnixNano {
    Number(u64),
    Text(String),
}

impl UnixNano {
    pub fn millis(&self) -> Option<i64> {
        let nanos = match self {
            UnixNano::Number(n) => Some(*n),
            UnixNano::Text(s) => s.trim().parse::<u64>().ok(),
        }?;
        Some((nanos / 1_000_000) as i64)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyValue {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: Option<AnyValue>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnyValue {
    #[serde(default)]
    pub string_value: Option<String>,
    #[serde(default)]
    pub int_value: Option<Value>,
    #[serde(default)]
    pub bool_value: Option<bool>,
    #[serde(default)]
    pub double_value: Option<f64>,
}

impl AnyValue {
    /// Collapse to a JSON primitive, preserving the OTLP value kinds.
    /// `intValue` arrives as a string in canonical OTLP JSON and is parsed.
    fn to_json(&self) -> Option<Value> {
        if let Some(s) = &self.string_value {
            return Some(Value::String(s.clone()));
        }
        if let Some(raw) = &self.int_value {
            let parsed = match raw {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.trim().parse::<i64>().ok(),
                _ => None,
            };
            if let Some(i) = parsed {
                return Some(Value::from(i));
            }
        }
        if let Some(b) = self.bool_value {
            return Some(Value::Bool(b));
        }
        if let Some(d) = self.double_value {
            return serde_json::Number::from_f64(d).map(Value::Number);
        }
        None
    }
}

pub fn flatten_attributes(attributes: &[KeyValue]) -> Map<String, Value> {
    let mut map = Map::new();
    for kv in attributes {
        if let Some(value) = kv.value.as_ref().and_then(AnyValue::to_json) {
            map.insert(kv.key.clone(), value);
        }
    }
    map
}

// ── OTLP logs request shapes ──

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportLogsRequest {
    #[serde(default)]
    pub resource_logs: Vec<ResourceLogs>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLogs {
    #[serde(default)]
    pub scope_logs: Vec<ScopeLogs>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeLogs {
    #[serde(default)]
    pub log_records: Vec<LogRecord>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    #[serde(default)]
    pub attributes: Vec<KeyValue>,
    #[serde(default)]
    pub body: Option<AnyValue>,
}

// ── Span normalization ──

/// A 32-hex trace id is rewritten to the canonical 8-4-4-4-12 hyphenated
/// form; anything else passes through unchanged.
pub fn canonical_trace_id(raw: &str) -> String {
    if raw.len() != 32 || !raw.is_ascii() {
        return raw.to_string();
    }
    format!(
        "{}-{}-{}-{}-{}",
        &raw[0..8],
        &raw[8..12],
        &raw[12..16],
        &raw[16..20],
        &raw[20..32]
    )
}

fn status_is_error(status: Option<&OtlpStatus>) -> bool {
    let Some(status) = status else { return false };
    match &status.code {
        Value::Number(n) => n.as_i64() == Some(2),
        Value::String(s) => s.trim() == "2",
        _ => false,
    }
}

pub fn normalize_traces(req: &ExportTraceRequest) -> Vec<NewSpan> {
    let mut spans = Vec::new();
    for resource_spans in &req.resource_spans {
        let service_name = resource_spans
            .resource
            .as_ref()
            .and_then(|r| r.attributes.iter().find(|kv| kv.key == "service.name"))
            .and_then(|kv| kv.value.as_ref())
            .and_then(|v| v.string_value.clone())
            .unwrap_or_else(|| "unknown".to_string());

        for scope_spans in &resource_spans.scope_spans {
            for span in &scope_spans.spans {
                let start_time = span
                    .start_time_unix_nano
                    .as_ref()
                    .and_then(UnixNano::millis)
                    .unwrap_or(0);
                let end_time = span.end_time_unix_nano.as_ref().and_then(UnixNano::millis);
                spans.push(NewSpan {
                    trace_id: canonical_trace_id(&span.trace_id),
                    span_id: span.span_id.clone(),
                    parent_span_id: span.parent_span_id.clone().filter(|p| !p.is_empty()),
                    service_name: service_name.clone(),
                    operation_name: span.name.clone(),
                    start_time,
                    end_time,
                    duration_ms: end_time.map(|end| end - start_time),
                    status: if status_is_error(span.status.as_ref()) {
                        "error".to_string()
                    } else {
                        "ok".to_string()
                    },
                    attributes: flatten_attributes(&span.attributes),
                });
            }
        }
    }
    spans
}

// ── Wide-event normalization ──

fn string_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn id_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Durations keep NULL when absent or non-finite.
fn duration_field(obj: &Map<String, Value>, key: &str) -> Option<f64> {
    match obj.get(key) {
        Some(Value::Number(n)) => n.as_f64().filter(|f| f.is_finite()),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

/// Counters coerce hard to 0 so aggregates stay well-defined.
fn count_field(obj: &Map<String, Value>, key: &str) -> i64 {
    match obj.get(key) {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
            .unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse::<i64>().unwrap_or(0),
        _ => 0,
    }
}

/// Extract the structured columns from a wide event's dotted keys. The whole
/// original event, unknown keys included, is kept as the attributes blob.
pub fn normalize_wide_event(raw: &Value) -> anyhow::Result<NewWideEvent> {
    let obj = raw
        .as_object()
        .ok_or_else(|| anyhow::anyhow!("wide event must be a JSON object"))?;
    Ok(NewWideEvent {
        trace_id: string_field(obj, "trace_id"),
        service_name: string_field(obj, "service.name").unwrap_or_else(|| "unknown".to_string()),
        operation_type: string_field(obj, "graphql.operation_type"),
        field_name: string_field(obj, "graphql.field_name"),
        outcome: string_field(obj, "outcome").unwrap_or_else(|| "unknown".to_string()),
        duration_ms: duration_field(obj, "duration.total_ms"),
        user_id: id_field(obj, "user.id"),
        error_count: count_field(obj, "error_count"),
        rpc_call_count: count_field(obj, "count.rpc_calls"),
        attributes: raw.clone(),
    })
}

/// `/v1/events` accepts a single event or an array of them.
pub fn normalize_events_body(body: &Value) -> anyhow::Result<Vec<NewWideEvent>> {
    match body {
        Value::Array(items) => items.iter().map(normalize_wide_event).collect(),
        other => Ok(vec![normalize_wide_event(other)?]),
    }
}

/// Filter OTLP log records down to wide events: either the attributes carry
/// `log.type=wide_event` or the body string contains the `[WIDE_EVENT]`
/// marker. Accepted records map exactly like `/v1/events` payloads.
pub fn normalize_logs(req: &ExportLogsRequest) -> anyhow::Result<Vec<NewWideEvent>> {
    let mut events = Vec::new();
    for resource_logs in &req.resource_logs {
        for scope_logs in &resource_logs.scope_logs {
            for record in &scope_logs.log_records {
                let attrs = flatten_attributes(&record.attributes);
                let tagged = attrs.get("log.type").and_then(|v| v.as_str()) == Some("wide_event");
                let marked = record
                    .body
                    .as_ref()
                    .and_then(|b| b.string_value.as_deref())
                    .is_some_and(|s| s.contains("[WIDE_EVENT]"));
                if !tagged && !marked {
                    continue;
                }
                events.push(normalize_wide_event(&Value::Object(attrs))?);
            }
        }
    }
    Ok(events)
}

// ── Broadcast staging ──

/// Bounded ring for rows awaiting broadcast. Overflow discards the oldest
/// staged row; ingest is never blocked by fan-out.
pub struct StageBuffer {
    items: VecDeque<Value>,
    capacity: usize,
}

impl StageBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, item: Value) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Partition the staged rows into broadcast frames of at most
    /// `batch_size` items, preserving input order.
    pub fn into_chunks(self, batch_size: usize) -> Vec<Vec<Value>> {
        let items: Vec<Value> = self.items.into();
        items
            .chunks(batch_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn otlp_trace_body() -> Value {
        serde_json::json!({
            "resourceSpans": [{
                "resource": {
                    "attributes": [
                        {"key": "service.name", "value": {"stringValue": "svc"}}
                    ]
                },
                "scopeSpans": [{
                    "spans": [{
                        "traceId": "0123456789abcdef0123456789abcdef",
                        "spanId": "aaaaaaaaaaaaaaaa",
                        "name": "GET /checkout",
                        "startTimeUnixNano": "1700000000000000000",
                        "endTimeUnixNano": "1700000000250000000",
                        "status": {"code": 2},
                        "attributes": [
                            {"key": "http.status_code", "value": {"intValue": "500"}},
                            {"key": "retry", "value": {"boolValue": true}},
                            {"key": "load", "value": {"doubleValue": 0.75}}
                        ]
                    }]
                }]
            }]
        })
    }

    #[test]
    fn otlp_span_normalizes_end_to_end() {
        let req: ExportTraceRequest = serde_json::from_value(otlp_trace_body()).unwrap();
        let spans = normalize_traces(&req);
        assert_eq!(spans.len(), 1);
        let span = &spans[0];
        assert_eq!(span.trace_id, "01234567-89ab-cdef-0123-456789abcdef");
        assert_eq!(span.service_name, "svc");
        assert_eq!(span.operation_name, "GET /checkout");
        assert_eq!(span.start_time, 1_700_000_000_000);
        assert_eq!(span.end_time, Some(1_700_000_000_250));
        assert_eq!(span.duration_ms, Some(250));
        assert_eq!(span.status, "error");
        assert_eq!(span.attributes["http.status_code"], serde_json::json!(500));
        assert_eq!(span.attributes["retry"], serde_json::json!(true));
        assert_eq!(span.attributes["load"], serde_json::json!(0.75));
    }

    #[test]
    fn trace_id_canonicalization_is_length_gated() {
        assert_eq!(
            canonical_trace_id("0123456789abcdef0123456789abcdef"),
            "01234567-89ab-cdef-0123-456789abcdef"
        );
        assert_eq!(canonical_trace_id("abc"), "abc");
        assert_eq!(canonical_trace_id(""), "");
        // Already hyphenated ids are 36 chars and pass through.
        let hyphenated = "01234567-89ab-cdef-0123-456789abcdef";
        assert_eq!(canonical_trace_id(hyphenated), hyphenated);
    }

    #[test]
    fn only_status_code_two_maps_to_error() {
        for (code, expected) in [
            (serde_json::json!(2), true),
            (serde_json::json!("2"), true),
            (serde_json::json!(0), false),
            (serde_json::json!(1), false),
            (serde_json::json!(3), false),
        ] {
            let status = OtlpStatus { code };
            assert_eq!(status_is_error(Some(&status)), expected);
        }
        assert!(!status_is_error(None));
    }

    #[test]
    fn missing_parent_and_missing_service_get_defaults() {
        let body = serde_json::json!({
            "resourceSpans": [{
                "scopeSpans": [{
                    "spans": [{
                        "traceId": "t",
                        "spanId": "s",
                        "parentSpanId": "",
                        "startTimeUnixNano": 1_700_000_000_000_000_000u64
                    }]
                }]
            }]
        });
        let req: ExportTraceRequest = serde_json::from_value(body).unwrap();
        let spans = normalize_traces(&req);
        assert_eq!(spans[0].service_name, "unknown");
        assert_eq!(spans[0].parent_span_id, None);
        assert_eq!(spans[0].end_time, None);
        assert_eq!(spans[0].duration_ms, None);
        assert_eq!(spans[0].status, "ok");
    }

    #[test]
    fn wide_event_extracts_structured_columns_and_keeps_everything() {
        let raw = serde_json::json!({
            "trace_id": "t1",
            "service.name": "gw",
            "graphql.operation_type": "mutation",
            "graphql.field_name": "checkout",
            "outcome": "error",
            "duration.total_ms": 42.5,
            "user.id": 981,
            "error_count": 1,
            "count.rpc_calls": 3,
            "totally.unknown": {"nested": [1, 2]},
        });
        let event = normalize_wide_event(&raw).unwrap();
        assert_eq!(event.trace_id.as_deref(), Some("t1"));
        assert_eq!(event.service_name, "gw");
        assert_eq!(event.operation_type.as_deref(), Some("mutation"));
        assert_eq!(event.field_name.as_deref(), Some("checkout"));
        assert_eq!(event.outcome, "error");
        assert_eq!(event.duration_ms, Some(42.5));
        assert_eq!(event.user_id.as_deref(), Some("981"));
        assert_eq!(event.error_count, 1);
        assert_eq!(event.rpc_call_count, 3);
        assert_eq!(event.attributes, raw);
    }

    #[test]
    fn defensive_numeric_coercion() {
        let raw = serde_json::json!({
            "service.name": "gw",
            "outcome": "success",
            "duration.total_ms": "not-a-number",
            "error_count": {"weird": true},
            "count.rpc_calls": "7",
        });
        let event = normalize_wide_event(&raw).unwrap();
        assert_eq!(event.duration_ms, None);
        assert_eq!(event.error_count, 0);
        assert_eq!(event.rpc_call_count, 7);
    }

    #[test]
    fn events_body_accepts_object_or_array() {
        let single = serde_json::json!({"service.name": "a", "outcome": "success"});
        assert_eq!(normalize_events_body(&single).unwrap().len(), 1);

        let array = serde_json::json!([
            {"trace_id": "t1", "service.name": "gw", "outcome": "success", "duration.total_ms": 42},
            {"trace_id": "t1", "service.name": "gw", "outcome": "error", "error_count": 1},
        ]);
        let events = normalize_events_body(&array).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].error_count, 1);

        assert!(normalize_events_body(&serde_json::json!("nope")).is_err());
    }

    #[test]
    fn log_records_are_filtered_to_wide_events() {
        let body = serde_json::json!({
            "resourceLogs": [{
                "scopeLogs": [{
                    "logRecords": [
                        {
                            "attributes": [
                                {"key": "log.type", "value": {"stringValue": "wide_event"}},
                                {"key": "service.name", "value": {"stringValue": "gw"}},
                                {"key": "outcome", "value": {"stringValue": "success"}}
                            ]
                        },
                        {
                            "body": {"stringValue": "[WIDE_EVENT] checkout finished"},
                            "attributes": [
                                {"key": "service.name", "value": {"stringValue": "checkout"}}
                            ]
                        },
                        {
                            "body": {"stringValue": "plain log line"},
                            "attributes": []
                        }
                    ]
                }]
            }]
        });
        let req: ExportLogsRequest = serde_json::from_value(body).unwrap();
        let events = normalize_logs(&req).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].service_name, "gw");
        assert_eq!(events[1].service_name, "checkout");
    }

    #[test]
    fn stage_buffer_discards_oldest_on_overflow() {
        let mut buffer = StageBuffer::new(3);
        for i in 0..5 {
            buffer.push(serde_json::json!(i));
        }
        assert_eq!(buffer.len(), 3);
        let chunks = buffer.into_chunks(10);
        assert_eq!(
            chunks,
            vec![vec![
                serde_json::json!(2),
                serde_json::json!(3),
                serde_json::json!(4),
            ]]
        );
    }

    #[test]
    fn chunking_preserves_order_and_sizes() {
        let mut buffer = StageBuffer::new(500);
        for i in 0..450 {
            buffer.push(serde_json::json!(i));
        }
        let chunks = buffer.into_chunks(200);
        assert_eq!(chunks.len(), 3); // ceil(450 / 200)
        assert_eq!(chunks[0].len(), 200);
        assert_eq!(chunks[1].len(), 200);
        assert_eq!(chunks[2].len(), 50);
        assert_eq!(chunks[0][0], serde_json::json!(0));
        assert_eq!(chunks[2][49], serde_json::json!(449));
    }
}
