//! Re-emits a function's call log as spans: one `AGENT` span per log entry,
//! one `CHAT_MODEL` child per network call.

use serde_json::{Value, json};

use crate::baml::FunctionLog;
use crate::error::CoreResult;
use crate::telemetry::{
    EndSpan, KEY_BAML_ID, KEY_BAML_TOKENS_IN, KEY_BAML_TOKENS_OUT, KEY_CALL_CLIENT,
    KEY_CALL_METHOD, KEY_CALL_SELECTED, KEY_CALL_STATUS, KEY_CALL_TOKENS_IN,
    KEY_CALL_TOKENS_OUT, KEY_CALL_URL, SpanType, StartSpan, TraceBackend,
};

/// Emit `log` under `parent_id`. Returns the number of child (network call) spans.
///
/// Chat messages of every call are extracted before any span is opened, so a
/// malformed entry fails without leaving spans open.
pub(crate) async fn emit_function_log(
    backend: &dyn TraceBackend,
    request_id: &str,
    parent_id: &str,
    log: &FunctionLog,
    inputs: &Value,
) -> CoreResult<usize> {
    let chats = log
        .calls
        .iter()
        .map(|c| c.chat_messages())
        .collect::<CoreResult<Vec<_>>>()?;

    let func_span = backend
        .start_span(
            StartSpan::new(request_id, parent_id, &log.function_name)
                .span_type(SpanType::Agent)
                .inputs(inputs.clone())
                .attribute(KEY_BAML_ID, log.id.as_str())
                .attribute(KEY_BAML_TOKENS_IN, log.usage.input_tokens)
                .attribute(KEY_BAML_TOKENS_OUT, log.usage.output_tokens)
                .start_ns(log.timing.start_ns()),
        )
        .await?;

    for (call, messages) in log.calls.iter().zip(chats) {
        let cs = backend
            .start_span(
                StartSpan::new(request_id, &func_span.span_id, format!("LLMCall:{}", call.provider))
                    .span_type(SpanType::ChatModel)
                    .inputs(call.http_request.body.clone())
                    .attribute(KEY_CALL_STATUS, call.status())
                    .attribute(KEY_CALL_TOKENS_IN, call.usage.input_tokens)
                    .attribute(KEY_CALL_TOKENS_OUT, call.usage.output_tokens)
                    .attribute(KEY_CALL_CLIENT, call.client_name.as_str())
                    .attribute(KEY_CALL_SELECTED, call.selected)
                    .attribute(KEY_CALL_METHOD, call.http_request.method.as_str())
                    .attribute(KEY_CALL_URL, call.http_request.url.as_str())
                    .start_ns(call.timing.start_ns()),
            )
            .await?;
        backend
            .set_span_chat_messages(request_id, &cs.span_id, messages)
            .await?;
        if let Some(tools) = call.chat_tools() {
            backend
                .set_span_chat_tools(request_id, &cs.span_id, tools)
                .await?;
        }
        let resp_body = call
            .http_response
            .as_ref()
            .map(|r| r.body.clone())
            .unwrap_or(Value::Null);
        backend
            .end_span(
                EndSpan::new(request_id, &cs.span_id)
                    .outputs(json!({ "resp": resp_body }))
                    .end_ns(call.timing.end_ns()),
            )
            .await?;
    }

    backend
        .end_span(
            EndSpan::new(request_id, &func_span.span_id)
                .outputs(json!({ "out": log.raw_llm_response }))
                .end_ns(log.timing.end_ns()),
        )
        .await?;

    tracing::debug!(
        request_id,
        function = %log.function_name,
        log_id = %log.id,
        calls = log.calls.len(),
        "emitted function log"
    );
    Ok(log.calls.len())
}
