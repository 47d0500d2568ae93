use async_trait::async_trait;
use serde_json::Value;

use crate::error::CoreResult;
use crate::telemetry::{
    EndSpan, EndTrace, KEY_CHAT_MESSAGES, KEY_CHAT_TOOLS, SpanHandle, StartSpan, StartTrace,
    TraceBackend, TraceBuffer, TraceInfo, TraceRecord, now_ns,
};

/// Keeps every trace in process memory. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    buffer: TraceBuffer,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn traces(&self) -> Vec<TraceRecord> {
        self.buffer.snapshot()
    }

    pub fn trace(&self, request_id: &str) -> Option<TraceRecord> {
        self.buffer.get(request_id)
    }
}

pub(crate) fn new_span_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..16].to_string()
}

#[async_trait]
impl TraceBackend for InMemoryBackend {
    async fn start_trace(&self, req: StartTrace) -> CoreResult<SpanHandle> {
        let request_id = format!("tr-{}", uuid::Uuid::new_v4().simple());
        let root_span_id = new_span_id();
        let handle = self
            .buffer
            .open_trace(&request_id, &root_span_id, &req, now_ns())?;
        tracing::debug!(request_id = %handle.request_id, name = %req.name, "trace started");
        Ok(handle)
    }

    async fn end_trace(&self, request_id: &str, req: EndTrace) -> CoreResult<()> {
        let status = req.status;
        self.buffer.close_trace(request_id, req, now_ns())?;
        tracing::debug!(request_id, status = status.as_str(), "trace ended");
        Ok(())
    }

    async fn start_span(&self, req: StartSpan) -> CoreResult<SpanHandle> {
        self.buffer.open_span(&new_span_id(), req, now_ns())
    }

    async fn end_span(&self, req: EndSpan) -> CoreResult<()> {
        self.buffer.close_span(req, now_ns())
    }

    async fn get_trace(&self, request_id: &str) -> CoreResult<TraceInfo> {
        self.buffer.info(request_id)
    }

    async fn set_span_chat_messages(
        &self,
        request_id: &str,
        span_id: &str,
        messages: Vec<Value>,
    ) -> CoreResult<()> {
        self.buffer
            .set_attribute(request_id, span_id, KEY_CHAT_MESSAGES, Value::Array(messages))
    }

    async fn set_span_chat_tools(
        &self,
        request_id: &str,
        span_id: &str,
        tools: Vec<Value>,
    ) -> CoreResult<()> {
        self.buffer
            .set_attribute(request_id, span_id, KEY_CHAT_TOOLS, Value::Array(tools))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BamlTraceError;
    use crate::telemetry::{SpanType, Status};
    use serde_json::json;

    #[tokio::test]
    async fn records_a_trace_tree() {
        let backend = InMemoryBackend::new();
        let root = backend
            .start_trace(StartTrace::new("wf", "exp").tag("experiment", "exp"))
            .await
            .unwrap();
        assert!(root.request_id.starts_with("tr-"));
        assert_eq!(root.span_id.len(), 16);

        let info = backend.get_trace(&root.request_id).await.unwrap();
        assert_eq!(info.root_span_id, root.span_id);
        assert_eq!(info.tags["experiment"], "exp");
        assert_eq!(info.status, Status::InProgress);

        let child = backend
            .start_span(
                StartSpan::new(&root.request_id, &root.span_id, "LLMCall:openai")
                    .span_type(SpanType::ChatModel)
                    .start_ns(1),
            )
            .await
            .unwrap();
        backend
            .set_span_chat_messages(&root.request_id, &child.span_id, vec![json!({"role": "user"})])
            .await
            .unwrap();
        backend
            .set_span_chat_tools(&root.request_id, &child.span_id, vec![json!({"type": "function"})])
            .await
            .unwrap();
        backend
            .end_span(EndSpan::new(&root.request_id, &child.span_id).end_ns(2))
            .await
            .unwrap();
        backend.end_trace(&root.request_id, EndTrace::ok()).await.unwrap();

        let rec = backend.trace(&root.request_id).unwrap();
        assert_eq!(rec.spans.len(), 2);
        let c = rec.span(&child.span_id).unwrap();
        assert_eq!(c.attributes[KEY_CHAT_MESSAGES], json!([{"role": "user"}]));
        assert_eq!(c.attributes[KEY_CHAT_TOOLS], json!([{"type": "function"}]));
        assert_eq!(rec.info.status, Status::Ok);
        assert_eq!(backend.traces().len(), 1);
    }

    #[tokio::test]
    async fn ending_a_trace_twice_fails() {
        let backend = InMemoryBackend::new();
        let root = backend.start_trace(StartTrace::new("wf", "exp")).await.unwrap();
        backend.end_trace(&root.request_id, EndTrace::ok()).await.unwrap();
        let err = backend
            .end_trace(&root.request_id, EndTrace::ok())
            .await
            .unwrap_err();
        assert!(matches!(err, BamlTraceError::TraceClosed { .. }));
    }
}
