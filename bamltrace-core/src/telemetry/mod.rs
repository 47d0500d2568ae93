//! Tracing-backend primitives: the backend interface, span/trace payloads and
//! the client-side span buffer shared by the concrete backends.
//!
//! Backends are always injected (`Arc<dyn TraceBackend>`); nothing here is a
//! process-wide singleton.

pub mod buffer;
pub mod keys;
pub mod memory;
pub mod types;
#[cfg(test)]
pub mod test_span;

pub use buffer::TraceBuffer;
pub use keys::*;
pub use memory::InMemoryBackend;
pub use types::*;

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::CoreResult;

/// Fixed factor between the call-log clock (ms) and span timestamps (ns).
pub const NANOS_PER_MILLI: u64 = 1_000_000;

#[inline]
pub fn ms_to_ns(ms: u64) -> u64 {
    ms.saturating_mul(NANOS_PER_MILLI)
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Implement this to receive traces and spans.
///
/// Requirements:
/// - Implementations must be thread-safe (`Send + Sync`) and `'static`.
/// - Identifiers returned by `start_trace`/`start_span` are opaque to callers.
/// - Every started span is ended at most once; ending twice is an error.
#[async_trait]
pub trait TraceBackend: Send + Sync + 'static {
    /// Open a trace and its root span.
    async fn start_trace(&self, req: StartTrace) -> CoreResult<SpanHandle>;

    /// Close the trace (and its root span).
    async fn end_trace(&self, request_id: &str, req: EndTrace) -> CoreResult<()>;

    async fn start_span(&self, req: StartSpan) -> CoreResult<SpanHandle>;

    async fn end_span(&self, req: EndSpan) -> CoreResult<()>;

    async fn get_trace(&self, request_id: &str) -> CoreResult<TraceInfo>;

    async fn set_span_chat_messages(
        &self,
        request_id: &str,
        span_id: &str,
        messages: Vec<Value>,
    ) -> CoreResult<()>;

    // Optional; backends that don't render tools can ignore them.
    async fn set_span_chat_tools(
        &self,
        _request_id: &str,
        _span_id: &str,
        _tools: Vec<Value>,
    ) -> CoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ms_to_ns_is_exact() {
        assert_eq!(ms_to_ns(1000 + 200), 1_200_000_000);
        assert_eq!(ms_to_ns(0), 0);
        assert_eq!(ms_to_ns(1), NANOS_PER_MILLI);
    }

    #[test]
    fn clocks_agree() {
        let ms = now_ms();
        let ns = now_ns();
        assert!(ns / NANOS_PER_MILLI >= ms);
    }
}
