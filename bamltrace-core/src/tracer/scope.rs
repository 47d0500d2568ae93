use std::sync::Arc;

use crate::error::CoreResult;
use crate::telemetry::{EndTrace, StartTrace, TraceBackend};

/// Identifiers of an open trace, handed to code running inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TraceContext {
    pub request_id: String,
    pub root_span_id: String,
}

/// Guard for an open trace.
///
/// `finish` ends the trace. A scope dropped without `finish` (early return,
/// `?`, cancellation) ends the trace with `ERROR` on the ambient tokio
/// runtime, so a trace is never left open by the code that opened it.
pub struct TraceScope {
    backend: Arc<dyn TraceBackend>,
    ctx: TraceContext,
    finished: bool,
}

impl TraceScope {
    pub(crate) async fn open(backend: Arc<dyn TraceBackend>, req: StartTrace) -> CoreResult<Self> {
        let root = backend.start_trace(req).await?;
        Ok(Self {
            backend,
            ctx: TraceContext {
                request_id: root.request_id,
                root_span_id: root.span_id,
            },
            finished: false,
        })
    }

    pub fn context(&self) -> &TraceContext {
        &self.ctx
    }

    pub fn request_id(&self) -> &str {
        &self.ctx.request_id
    }

    pub fn root_span_id(&self) -> &str {
        &self.ctx.root_span_id
    }

    /// End the trace. Consumes the scope; the backend is called exactly once.
    pub async fn finish(mut self, end: EndTrace) -> CoreResult<()> {
        self.finished = true;
        self.backend.end_trace(&self.ctx.request_id, end).await
    }
}

impl Drop for TraceScope {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let request_id = self.ctx.request_id.clone();
        tracing::warn!(request_id = %request_id, "trace scope dropped before finish; ending trace as ERROR");
        let backend = self.backend.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = backend.end_trace(&request_id, EndTrace::error()).await {
                        tracing::warn!(request_id = %request_id, error = %e, "failed to end dropped trace");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(request_id = %request_id, "no tokio runtime; trace left open");
            }
        }
    }
}

impl std::fmt::Debug for TraceScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceScope")
            .field("ctx", &self.ctx)
            .field("finished", &self.finished)
            .finish()
    }
}
