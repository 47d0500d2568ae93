//! Client-side span buffer.
//!
//! Spans live here from `start_span` until their trace is closed. The buffer
//! enforces the lifecycle rules every backend relies on: a span is closed at
//! most once, never before it starts, and only while its trace is open.

use std::sync::{Mutex, MutexGuard};

use serde_json::Value;

use crate::error::{BamlTraceError, CoreResult};
use crate::telemetry::types::{
    EndSpan, EndTrace, SpanHandle, SpanRecord, StartSpan, StartTrace, Status, TraceInfo,
    TraceRecord,
};

#[derive(Debug, Default)]
pub struct TraceBuffer {
    traces: Mutex<Vec<TraceRecord>>,
}

impl TraceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, Vec<TraceRecord>> {
        self.traces.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_open_trace<T>(
        &self,
        request_id: &str,
        f: impl FnOnce(&mut TraceRecord) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let mut traces = self.guard();
        let trace = traces
            .iter_mut()
            .find(|t| t.info.request_id == request_id)
            .ok_or_else(|| BamlTraceError::TraceNotFound {
                request_id: request_id.to_string(),
            })?;
        if trace.is_closed() {
            return Err(BamlTraceError::TraceClosed {
                request_id: request_id.to_string(),
            });
        }
        f(trace)
    }

    /// Register a new trace with its root span.
    pub fn open_trace(
        &self,
        request_id: &str,
        root_span_id: &str,
        req: &StartTrace,
        start_ns: u64,
    ) -> CoreResult<SpanHandle> {
        let mut traces = self.guard();
        if traces.iter().any(|t| t.info.request_id == request_id) {
            return Err(BamlTraceError::Validation(format!(
                "trace {request_id} already exists"
            )));
        }
        let root = SpanRecord {
            request_id: request_id.to_string(),
            span_id: root_span_id.to_string(),
            parent_id: None,
            name: req.name.clone(),
            span_type: req.span_type,
            start_time_ns: start_ns,
            end_time_ns: None,
            inputs: req.inputs.clone(),
            outputs: None,
            attributes: Default::default(),
            status: Status::InProgress,
        };
        traces.push(TraceRecord {
            info: TraceInfo {
                request_id: request_id.to_string(),
                root_span_id: root_span_id.to_string(),
                name: req.name.clone(),
                experiment: req.experiment.clone(),
                status: Status::InProgress,
                tags: req.tags.clone(),
            },
            outputs: None,
            metadata: Default::default(),
            spans: vec![root],
        });
        Ok(SpanHandle {
            request_id: request_id.to_string(),
            span_id: root_span_id.to_string(),
        })
    }

    pub fn open_span(&self, span_id: &str, req: StartSpan, now_ns: u64) -> CoreResult<SpanHandle> {
        let request_id = req.request_id.clone();
        self.with_open_trace(&request_id, |trace| {
            if trace.span(&req.parent_id).is_none() {
                return Err(BamlTraceError::Validation(format!(
                    "parent span {} is not part of trace {}",
                    req.parent_id, req.request_id
                )));
            }
            trace.spans.push(SpanRecord {
                request_id: req.request_id.clone(),
                span_id: span_id.to_string(),
                parent_id: Some(req.parent_id),
                name: req.name,
                span_type: req.span_type,
                start_time_ns: req.start_time_ns.unwrap_or(now_ns),
                end_time_ns: None,
                inputs: req.inputs,
                outputs: None,
                attributes: req.attributes,
                status: Status::InProgress,
            });
            Ok(SpanHandle {
                request_id: req.request_id,
                span_id: span_id.to_string(),
            })
        })
    }

    pub fn close_span(&self, req: EndSpan, now_ns: u64) -> CoreResult<()> {
        self.with_open_trace(&req.request_id, |trace| {
            let not_open = || BamlTraceError::SpanNotOpen {
                request_id: req.request_id.clone(),
                span_id: req.span_id.clone(),
            };
            // The root span only closes with its trace.
            if req.span_id == trace.info.root_span_id {
                return Err(not_open());
            }
            let span = trace
                .spans
                .iter_mut()
                .find(|s| s.span_id == req.span_id)
                .filter(|s| s.is_open())
                .ok_or_else(not_open)?;
            let end_ns = req.end_time_ns.unwrap_or(now_ns);
            if end_ns < span.start_time_ns {
                return Err(BamlTraceError::InvalidTiming {
                    span_id: req.span_id.clone(),
                    start_ns: span.start_time_ns,
                    end_ns,
                });
            }
            span.end_time_ns = Some(end_ns);
            span.outputs = req.outputs;
            span.status = req.status;
            span.attributes.extend(req.attributes);
            Ok(())
        })
    }

    /// Set one attribute on an open span.
    pub fn set_attribute(
        &self,
        request_id: &str,
        span_id: &str,
        key: &str,
        value: Value,
    ) -> CoreResult<()> {
        self.with_open_trace(request_id, |trace| {
            let span = trace
                .spans
                .iter_mut()
                .find(|s| s.span_id == span_id)
                .filter(|s| s.is_open())
                .ok_or_else(|| BamlTraceError::SpanNotOpen {
                    request_id: request_id.to_string(),
                    span_id: span_id.to_string(),
                })?;
            span.attributes.insert(key.to_string(), value);
            Ok(())
        })
    }

    /// Close the trace and its root span; returns the finished record.
    pub fn close_trace(&self, request_id: &str, req: EndTrace, now_ns: u64) -> CoreResult<TraceRecord> {
        self.with_open_trace(request_id, |trace| {
            let dangling = trace
                .spans
                .iter()
                .filter(|s| s.is_open() && s.span_id != trace.info.root_span_id)
                .count();
            if dangling > 0 {
                tracing::warn!(request_id, dangling, "closing trace with spans still open");
            }
            let root_id = trace.info.root_span_id.clone();
            if let Some(root) = trace.spans.iter_mut().find(|s| s.span_id == root_id) {
                root.end_time_ns = Some(now_ns.max(root.start_time_ns));
                root.status = req.status;
                root.outputs = req.outputs.clone();
            }
            trace.info.status = req.status;
            trace.outputs = req.outputs;
            trace.metadata.extend(req.metadata);
            Ok(trace.clone())
        })
    }

    pub fn info(&self, request_id: &str) -> CoreResult<TraceInfo> {
        self.guard()
            .iter()
            .find(|t| t.info.request_id == request_id)
            .map(|t| t.info.clone())
            .ok_or_else(|| BamlTraceError::TraceNotFound {
                request_id: request_id.to_string(),
            })
    }

    pub fn get(&self, request_id: &str) -> Option<TraceRecord> {
        self.guard()
            .iter()
            .find(|t| t.info.request_id == request_id)
            .cloned()
    }

    /// Every trace seen so far, in start order.
    pub fn snapshot(&self) -> Vec<TraceRecord> {
        self.guard().clone()
    }

    /// Drop closed traces once they've been exported.
    pub fn evict(&self, request_id: &str) {
        self.guard()
            .retain(|t| !(t.info.request_id == request_id && t.is_closed()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn buffer_with_trace() -> TraceBuffer {
        let b = TraceBuffer::new();
        b.open_trace("tr-1", "root", &StartTrace::new("wf", "exp"), 100)
            .unwrap();
        b
    }

    #[test]
    fn span_lifecycle() {
        let b = buffer_with_trace();
        let h = b
            .open_span("s1", StartSpan::new("tr-1", "root", "child").start_ns(150), 0)
            .unwrap();
        assert_eq!(h.span_id, "s1");
        b.set_attribute("tr-1", "s1", "k", json!(1)).unwrap();
        b.close_span(EndSpan::new("tr-1", "s1").end_ns(200).outputs(json!("o")), 0)
            .unwrap();

        let rec = b.get("tr-1").unwrap();
        let s = rec.span("s1").unwrap();
        assert_eq!(s.end_time_ns, Some(200));
        assert_eq!(s.attributes["k"], json!(1));
        assert_eq!(s.status, Status::Ok);
        assert_eq!(rec.children_of("root").count(), 1);
    }

    #[test]
    fn closing_twice_fails() {
        let b = buffer_with_trace();
        b.open_span("s1", StartSpan::new("tr-1", "root", "child"), 10).unwrap();
        b.close_span(EndSpan::new("tr-1", "s1"), 20).unwrap();
        let err = b.close_span(EndSpan::new("tr-1", "s1"), 30).unwrap_err();
        assert!(matches!(err, BamlTraceError::SpanNotOpen { .. }));
    }

    #[test]
    fn end_before_start_is_rejected() {
        let b = buffer_with_trace();
        b.open_span("s1", StartSpan::new("tr-1", "root", "child").start_ns(500), 0)
            .unwrap();
        let err = b
            .close_span(EndSpan::new("tr-1", "s1").end_ns(499), 0)
            .unwrap_err();
        assert!(matches!(
            err,
            BamlTraceError::InvalidTiming { start_ns: 500, end_ns: 499, .. }
        ));
        // still open, a valid close goes through
        b.close_span(EndSpan::new("tr-1", "s1").end_ns(500), 0).unwrap();
    }

    #[test]
    fn unknown_parent_is_rejected() {
        let b = buffer_with_trace();
        let err = b
            .open_span("s1", StartSpan::new("tr-1", "nope", "child"), 0)
            .unwrap_err();
        assert!(matches!(err, BamlTraceError::Validation(_)));
    }

    #[test]
    fn root_span_closes_only_with_trace() {
        let b = buffer_with_trace();
        let err = b.close_span(EndSpan::new("tr-1", "root"), 200).unwrap_err();
        assert!(matches!(err, BamlTraceError::SpanNotOpen { .. }));

        let rec = b
            .close_trace("tr-1", EndTrace::ok().metadata("m", "1"), 50)
            .unwrap();
        assert_eq!(rec.info.status, Status::Ok);
        // never ends before it started
        assert_eq!(rec.root().unwrap().end_time_ns, Some(100));
        assert_eq!(rec.metadata["m"], "1");
    }

    #[test]
    fn closed_trace_rejects_everything() {
        let b = buffer_with_trace();
        b.close_trace("tr-1", EndTrace::ok(), 200).unwrap();
        assert!(matches!(
            b.close_trace("tr-1", EndTrace::ok(), 300),
            Err(BamlTraceError::TraceClosed { .. })
        ));
        assert!(matches!(
            b.open_span("s", StartSpan::new("tr-1", "root", "late"), 300),
            Err(BamlTraceError::TraceClosed { .. })
        ));
    }

    #[test]
    fn unknown_trace_and_eviction() {
        let b = buffer_with_trace();
        assert!(matches!(b.info("missing"), Err(BamlTraceError::TraceNotFound { .. })));
        assert!(matches!(
            b.open_trace("tr-1", "r2", &StartTrace::new("wf", "exp"), 0),
            Err(BamlTraceError::Validation(_))
        ));
        // open traces survive eviction
        b.evict("tr-1");
        assert!(b.get("tr-1").is_some());
        b.close_trace("tr-1", EndTrace::ok(), 200).unwrap();
        b.evict("tr-1");
        assert!(b.snapshot().is_empty());
    }
}
