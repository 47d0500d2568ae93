//! The `traces.json` document MLflow reads span trees from.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::telemetry::{
    KEY_SPAN_INPUTS, KEY_SPAN_OUTPUTS, KEY_SPAN_TYPE, KEY_TRACE_REQUEST_ID, SpanRecord, Status,
    TraceRecord,
};

#[derive(Debug, Serialize)]
pub struct TraceData {
    pub spans: Vec<ExportedSpan>,
}

#[derive(Debug, Serialize)]
pub struct SpanContext {
    pub span_id: String,
    pub trace_id: String,
}

#[derive(Debug, Serialize)]
pub struct ExportedSpan {
    pub name: String,
    pub context: SpanContext,
    pub parent_id: Option<String>,
    pub start_time: u64,
    pub end_time: Option<u64>,
    pub status_code: &'static str,
    pub status_message: String,
    /// Every value is itself JSON-encoded, as MLflow stores them.
    pub attributes: Map<String, Value>,
    pub events: Vec<Value>,
}

/// Build the span document for a finished trace. `trace_id` is the 32-hex
/// OpenTelemetry-style id shared by every span of the trace.
pub fn trace_data(rec: &TraceRecord, trace_id: &str) -> TraceData {
    TraceData {
        spans: rec.spans.iter().map(|s| export_span(s, trace_id)).collect(),
    }
}

fn export_span(span: &SpanRecord, trace_id: &str) -> ExportedSpan {
    let mut attributes = Map::new();
    attributes.insert(
        KEY_TRACE_REQUEST_ID.to_string(),
        encoded(&Value::String(span.request_id.clone())),
    );
    attributes.insert(
        KEY_SPAN_TYPE.to_string(),
        encoded(&Value::String(span.span_type.as_str().to_string())),
    );
    attributes.insert(KEY_SPAN_INPUTS.to_string(), encoded(&span.inputs));
    if let Some(out) = &span.outputs {
        attributes.insert(KEY_SPAN_OUTPUTS.to_string(), encoded(out));
    }
    for (k, v) in &span.attributes {
        attributes.insert(k.clone(), encoded(v));
    }

    ExportedSpan {
        name: span.name.clone(),
        context: SpanContext {
            span_id: hex_id(&span.span_id),
            trace_id: hex_id(trace_id),
        },
        parent_id: span.parent_id.as_deref().map(hex_id),
        start_time: span.start_time_ns,
        end_time: span.end_time_ns,
        status_code: status_code(span.status),
        status_message: String::new(),
        attributes,
        events: Vec::new(),
    }
}

fn encoded(v: &Value) -> Value {
    Value::String(v.to_string())
}

fn hex_id(id: &str) -> String {
    format!("0x{id}")
}

fn status_code(status: Status) -> &'static str {
    match status {
        Status::Ok => "OK",
        Status::Error => "ERROR",
        Status::InProgress => "UNSET",
    }
}
