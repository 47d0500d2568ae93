use thiserror::Error;

use crate::baml::BamlError;

/// Core error type for baml-trace.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum BamlTraceError {
    /// The LLM function itself failed. This is the only kind the tracer intercepts.
    #[error(transparent)]
    Baml(#[from] BamlError),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("malformed call log: {0}")]
    MalformedLog(String),

    #[error("trace not found: {request_id}")]
    TraceNotFound { request_id: String },

    #[error("trace {request_id} is already closed")]
    TraceClosed { request_id: String },

    #[error("span {span_id} is not open in trace {request_id}")]
    SpanNotOpen { request_id: String, span_id: String },

    #[error("span {span_id} ends at {end_ns}ns before it starts at {start_ns}ns")]
    InvalidTiming {
        span_id: String,
        start_ns: u64,
        end_ns: u64,
    },

    #[error("backend unavailable: {backend}")]
    Unavailable { backend: String },

    #[error("backend error from {backend}: {code} {message}")]
    Backend {
        backend: String,
        code: String,
        message: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CoreResult<T> = std::result::Result<T, BamlTraceError>;

impl BamlTraceError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedLog(msg.into())
    }
}
