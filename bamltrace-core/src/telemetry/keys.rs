/// Span/trace attribute keys.
/// Keep these stable; changing them is a breaking change for dashboards.
pub const KEY_BAML_ID: &str = "baml.id";
pub const KEY_BAML_TOKENS_IN: &str = "baml.tokens_in";
pub const KEY_BAML_TOKENS_OUT: &str = "baml.tokens_out";

/// Per network call
pub const KEY_CALL_STATUS: &str = "status";
pub const KEY_CALL_TOKENS_IN: &str = "tokens_in";
pub const KEY_CALL_TOKENS_OUT: &str = "tokens_out";
pub const KEY_CALL_CLIENT: &str = "client_name";
pub const KEY_CALL_SELECTED: &str = "selected";
pub const KEY_CALL_METHOD: &str = "http.method";
pub const KEY_CALL_URL: &str = "http.url";

pub const TAG_EXPERIMENT: &str = "experiment";

/// Trace-level metadata written by the single-call variant
pub const KEY_TOTAL_TOKENS_IN: &str = "total_tokens_in";
pub const KEY_TOTAL_TOKENS_OUT: &str = "total_tokens_out";
pub const KEY_ERROR_MESSAGE: &str = "error.message";

// MLflow's own keys
pub const KEY_SPAN_TYPE: &str = "mlflow.spanType";
pub const KEY_SPAN_INPUTS: &str = "mlflow.spanInputs";
pub const KEY_SPAN_OUTPUTS: &str = "mlflow.spanOutputs";
pub const KEY_CHAT_MESSAGES: &str = "mlflow.chat.messages";
pub const KEY_CHAT_TOOLS: &str = "mlflow.chat.tools";
pub const KEY_TRACE_REQUEST_ID: &str = "mlflow.traceRequestId";
pub const KEY_TRACE_NAME: &str = "mlflow.traceName";
pub const KEY_TRACE_INPUTS: &str = "mlflow.traceInputs";
pub const KEY_TRACE_OUTPUTS: &str = "mlflow.traceOutputs";
pub const KEY_ARTIFACT_LOCATION: &str = "mlflow.artifactLocation";
