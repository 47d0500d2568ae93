use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpanType {
    Chain,
    Agent,
    ChatModel,
    #[default]
    Unknown,
}

impl SpanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chain => "CHAIN",
            Self::Agent => "AGENT",
            Self::ChatModel => "CHAT_MODEL",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// Status shared by spans and traces. Uses MLflow's spelling on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[default]
    Ok,
    Error,
    InProgress,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Error => "ERROR",
            Self::InProgress => "IN_PROGRESS",
        }
    }
}

/// Identifies a live span inside a trace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanHandle {
    pub request_id: String,
    pub span_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartTrace {
    /// Name of the root span.
    pub name: String,
    /// Experiment (or project) the trace is filed under.
    pub experiment: String,
    pub span_type: SpanType,
    pub inputs: Value,
    pub tags: BTreeMap<String, String>,
}

impl StartTrace {
    pub fn new(name: impl Into<String>, experiment: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            experiment: experiment.into(),
            span_type: SpanType::Chain,
            inputs: Value::Object(Default::default()),
            tags: BTreeMap::new(),
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EndTrace {
    pub status: Status,
    pub outputs: Option<Value>,
    pub metadata: BTreeMap<String, String>,
}

impl EndTrace {
    pub fn ok() -> Self {
        Self::with_status(Status::Ok)
    }

    pub fn error() -> Self {
        Self::with_status(Status::Error)
    }

    pub fn with_status(status: Status) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn outputs(mut self, outputs: Value) -> Self {
        self.outputs = Some(outputs);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartSpan {
    pub request_id: String,
    pub parent_id: String,
    pub name: String,
    pub span_type: SpanType,
    pub inputs: Value,
    pub attributes: BTreeMap<String, Value>,
    /// Defaults to "now" in the backend when absent.
    pub start_time_ns: Option<u64>,
}

impl StartSpan {
    pub fn new(
        request_id: impl Into<String>,
        parent_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            parent_id: parent_id.into(),
            name: name.into(),
            span_type: SpanType::Unknown,
            inputs: Value::Null,
            attributes: BTreeMap::new(),
            start_time_ns: None,
        }
    }

    pub fn span_type(mut self, t: SpanType) -> Self {
        self.span_type = t;
        self
    }

    pub fn inputs(mut self, inputs: Value) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn start_ns(mut self, ns: u64) -> Self {
        self.start_time_ns = Some(ns);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndSpan {
    pub request_id: String,
    pub span_id: String,
    pub outputs: Option<Value>,
    pub attributes: BTreeMap<String, Value>,
    pub status: Status,
    /// Defaults to "now" in the backend when absent.
    pub end_time_ns: Option<u64>,
}

impl EndSpan {
    pub fn new(request_id: impl Into<String>, span_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            span_id: span_id.into(),
            outputs: None,
            attributes: BTreeMap::new(),
            status: Status::Ok,
            end_time_ns: None,
        }
    }

    pub fn outputs(mut self, outputs: Value) -> Self {
        self.outputs = Some(outputs);
        self
    }

    pub fn status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn end_ns(mut self, ns: u64) -> Self {
        self.end_time_ns = Some(ns);
        self
    }
}

/// What `get_trace` reports about a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceInfo {
    pub request_id: String,
    pub root_span_id: String,
    pub name: String,
    pub experiment: String,
    pub status: Status,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRecord {
    pub request_id: String,
    pub span_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub span_type: SpanType,
    pub start_time_ns: u64,
    pub end_time_ns: Option<u64>,
    pub inputs: Value,
    pub outputs: Option<Value>,
    pub attributes: BTreeMap<String, Value>,
    pub status: Status,
}

impl SpanRecord {
    pub fn is_open(&self) -> bool {
        self.end_time_ns.is_none()
    }
}

/// A buffered trace with all of its spans, root first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub info: TraceInfo,
    pub outputs: Option<Value>,
    pub metadata: BTreeMap<String, String>,
    pub spans: Vec<SpanRecord>,
}

impl TraceRecord {
    pub fn root(&self) -> Option<&SpanRecord> {
        self.span(&self.info.root_span_id)
    }

    pub fn span(&self, span_id: &str) -> Option<&SpanRecord> {
        self.spans.iter().find(|s| s.span_id == span_id)
    }

    pub fn children_of<'a>(&'a self, span_id: &'a str) -> impl Iterator<Item = &'a SpanRecord> + 'a {
        self.spans
            .iter()
            .filter(move |s| s.parent_id.as_deref() == Some(span_id))
    }

    pub fn is_closed(&self) -> bool {
        self.info.status != Status::InProgress
    }
}
