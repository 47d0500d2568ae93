//! Trace correlation for LLM function calls.
//!
//! A [`Tracer`] groups one or more function invocations into one trace and
//! turns each invocation's call log into spans on the injected backend.
//!
//! Three entry points:
//! - [`Tracer::trace_function`]: run one function inside an existing trace, or
//!   inside a fresh trace named after the function when no trace is given.
//! - [`Tracer::in_trace`]: run a block of calls inside one shared trace that is
//!   always closed, whatever the block does.
//! - [`Tracer::trace_single_call`]: one function, one trace, aggregate token
//!   usage and the result recorded on the trace when it closes.

mod emit;
pub mod scope;

pub use scope::{TraceContext, TraceScope};

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use serde_json::{Value, json};
use tracing_futures::Instrument;

use crate::baml::{BamlError, BamlFunction, BamlOptions, Collector};
use crate::config::{TraceCfg, TraceMode};
use crate::error::{BamlTraceError, CoreResult};
use crate::telemetry::{
    EndTrace, KEY_ERROR_MESSAGE, KEY_TOTAL_TOKENS_IN, KEY_TOTAL_TOKENS_OUT, StartTrace, Status,
    TAG_EXPERIMENT, TraceBackend,
};

/// Where an invocation's spans go.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceTarget {
    /// Existing trace; `None` opens a standalone trace for the call.
    pub request_id: Option<String>,
    /// Parent span; `None` means the trace's root span.
    pub parent_id: Option<String>,
}

impl TraceTarget {
    pub fn standalone() -> Self {
        Self::default()
    }

    pub fn request(request_id: impl Into<String>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            parent_id: None,
        }
    }

    pub fn within(ctx: &TraceContext) -> Self {
        Self {
            request_id: Some(ctx.request_id.clone()),
            parent_id: Some(ctx.root_span_id.clone()),
        }
    }

    pub fn parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

/// A function failure reported as a value instead of an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionFailure {
    pub function: String,
    pub error: String,
    pub traceback: String,
}

impl FunctionFailure {
    /// The traceback is the error's kind and message followed by the
    /// backtrace recorded where the error was raised.
    pub fn capture(function: &str, err: &BamlError) -> Self {
        Self {
            function: function.to_string(),
            error: err.to_string(),
            traceback: format!("{}: {}\n{}", err.kind.as_str(), err, err.backtrace),
        }
    }

    /// The single-row `[{"error", "traceback"}]` shape older consumers expect.
    pub fn to_error_rows(&self) -> Value {
        json!([{ "error": self.error, "traceback": self.traceback }])
    }
}

impl std::fmt::Display for FunctionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed: {}", self.function, self.error)
    }
}

/// Outcome of a traced invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation<T> {
    Completed(T),
    Failed(FunctionFailure),
}

impl<T> Invocation<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(v) => Some(v),
            Self::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&FunctionFailure> {
        match self {
            Self::Completed(_) => None,
            Self::Failed(f) => Some(f),
        }
    }

    pub fn into_result(self) -> Result<T, FunctionFailure> {
        match self {
            Self::Completed(v) => Ok(v),
            Self::Failed(f) => Err(f),
        }
    }
}

impl<T: Serialize> Invocation<T> {
    /// The result as JSON; failures render as error rows.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Completed(v) => serde_json::to_value(v)
                .unwrap_or_else(|e| json!({ "serialization_error": e.to_string() })),
            Self::Failed(f) => f.to_error_rows(),
        }
    }
}

#[derive(Clone)]
pub struct Tracer {
    backend: Arc<dyn TraceBackend>,
    settings: TraceCfg,
}

impl Tracer {
    pub fn new(backend: Arc<dyn TraceBackend>) -> Self {
        Self::with_settings(backend, TraceCfg::default())
    }

    pub fn with_settings(backend: Arc<dyn TraceBackend>, settings: TraceCfg) -> Self {
        Self { backend, settings }
    }

    pub fn backend(&self) -> &Arc<dyn TraceBackend> {
        &self.backend
    }

    pub fn settings(&self) -> &TraceCfg {
        &self.settings
    }

    /// Open a trace for a group of calls. The returned scope must be finished;
    /// dropping it ends the trace as `ERROR`.
    pub async fn start_trace(&self, group: &str) -> CoreResult<TraceScope> {
        let req = StartTrace::new(&self.settings.root_span_name, group).tag(TAG_EXPERIMENT, group);
        let scope = TraceScope::open(self.backend.clone(), req).await?;
        tracing::info!(group, request_id = scope.request_id(), "trace opened");
        Ok(scope)
    }

    /// Run `body` inside one trace and end that trace exactly once: `OK` when
    /// the body returns `Ok`, `ERROR` when it returns `Err` or panics. Panics
    /// resume after the trace is closed.
    pub async fn in_trace<B, Fut, T>(&self, group: &str, body: B) -> CoreResult<T>
    where
        B: FnOnce(TraceContext) -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        let scope = self.start_trace(group).await?;
        let outcome = AssertUnwindSafe(body(scope.context().clone()))
            .catch_unwind()
            .await;
        match outcome {
            Ok(result) => {
                let end = match &result {
                    Ok(_) => EndTrace::ok(),
                    Err(e) => EndTrace::error().metadata(KEY_ERROR_MESSAGE, e.to_string()),
                };
                close_after(scope, end, result).await
            }
            Err(panic) => {
                if let Err(e) = scope.finish(EndTrace::error()).await {
                    tracing::warn!(error = %e, "failed to end trace after panic");
                }
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Invoke `func` and report its call log as spans.
    ///
    /// Without a request id the call gets its own trace, named after the
    /// function. With a request id but no parent the spans hang off that
    /// trace's root span. `BamlError`s come back as `Invocation::Failed`;
    /// every other error is returned as `Err`.
    pub async fn trace_function<F: BamlFunction>(
        &self,
        func: &F,
        args: &F::Args,
        target: TraceTarget,
    ) -> CoreResult<Invocation<F::Output>> {
        let span = tracing::info_span!(
            "baml.trace_function",
            function = %func.name(),
            request_id = tracing::field::Empty,
        );
        async move {
            let Some(request_id) = target.request_id else {
                return self.trace_standalone(func, args).await;
            };
            tracing::Span::current().record("request_id", request_id.as_str());
            let parent_id = match target.parent_id {
                Some(p) => p,
                None => self.backend.get_trace(&request_id).await?.root_span_id,
            };
            let (invocation, _) = self.invoke(func, args, &request_id, &parent_id).await?;
            Ok(invocation)
        }
        .instrument(span)
        .await
    }

    /// One function, one trace. The trace closes unconditionally and carries
    /// the aggregate token usage and the result.
    pub async fn trace_single_call<F>(
        &self,
        func: &F,
        args: &F::Args,
    ) -> CoreResult<Invocation<F::Output>>
    where
        F: BamlFunction,
        F::Output: Serialize,
    {
        let span = tracing::info_span!(
            "baml.trace_single_call",
            function = %func.name(),
            request_id = tracing::field::Empty,
        );
        async move {
            let scope = self.start_trace(func.name()).await?;
            let ctx = scope.context().clone();
            tracing::Span::current().record("request_id", ctx.request_id.as_str());

            let result = self
                .invoke(func, args, &ctx.request_id, &ctx.root_span_id)
                .await;
            let end = match &result {
                Ok((invocation, collector)) => {
                    let usage = collector.usage();
                    let status = if invocation.is_completed() {
                        Status::Ok
                    } else {
                        Status::Error
                    };
                    EndTrace::with_status(status)
                        .outputs(invocation.to_json())
                        .metadata(KEY_TOTAL_TOKENS_IN, usage.input_tokens.to_string())
                        .metadata(KEY_TOTAL_TOKENS_OUT, usage.output_tokens.to_string())
                }
                Err(e) => EndTrace::error().metadata(KEY_ERROR_MESSAGE, e.to_string()),
            };
            close_after(scope, end, result)
                .await
                .map(|(invocation, _)| invocation)
        }
        .instrument(span)
        .await
    }

    /// Pick the configured variant for calls that don't name a trace.
    pub async fn trace<F>(
        &self,
        func: &F,
        args: &F::Args,
        target: TraceTarget,
    ) -> CoreResult<Invocation<F::Output>>
    where
        F: BamlFunction,
        F::Output: Serialize,
    {
        match (self.settings.mode, target.request_id.is_none()) {
            (TraceMode::SingleCall, true) => self.trace_single_call(func, args).await,
            _ => self.trace_function(func, args, target).await,
        }
    }

    async fn trace_standalone<F: BamlFunction>(
        &self,
        func: &F,
        args: &F::Args,
    ) -> CoreResult<Invocation<F::Output>> {
        let scope = self.start_trace(func.name()).await?;
        let ctx = scope.context().clone();
        tracing::Span::current().record("request_id", ctx.request_id.as_str());

        let result = self
            .invoke(func, args, &ctx.request_id, &ctx.root_span_id)
            .await;
        let end = match &result {
            Ok((Invocation::Completed(_), _)) => EndTrace::ok(),
            Ok((Invocation::Failed(f), _)) => {
                EndTrace::error().metadata(KEY_ERROR_MESSAGE, f.error.clone())
            }
            Err(e) => EndTrace::error().metadata(KEY_ERROR_MESSAGE, e.to_string()),
        };
        close_after(scope, end, result)
            .await
            .map(|(invocation, _)| invocation)
    }

    async fn invoke<F: BamlFunction>(
        &self,
        func: &F,
        args: &F::Args,
        request_id: &str,
        parent_id: &str,
    ) -> CoreResult<(Invocation<F::Output>, Arc<Collector>)> {
        let collector = Collector::shared(self.settings.collector_name.clone());
        let options = BamlOptions::new(collector.clone());
        let args_json = serde_json::to_value(args).map_err(|e| BamlTraceError::Other(e.into()))?;
        let inputs = json!({ "args": args_json });

        let invocation = match func.call(args, &options).await {
            Ok(output) => {
                for log in collector.logs() {
                    emit::emit_function_log(
                        self.backend.as_ref(),
                        request_id,
                        parent_id,
                        &log,
                        &inputs,
                    )
                    .await?;
                }
                Invocation::Completed(output)
            }
            Err(BamlTraceError::Baml(e)) => {
                tracing::warn!(function = %func.name(), kind = e.kind.as_str(), "BAML Error: {e}");
                Invocation::Failed(FunctionFailure::capture(func.name(), &e))
            }
            Err(other) => return Err(other),
        };
        Ok((invocation, collector))
    }
}

/// Finish `scope`, then hand back `result`. An error from `result` wins over
/// an error from closing the trace.
async fn close_after<T>(scope: TraceScope, end: EndTrace, result: CoreResult<T>) -> CoreResult<T> {
    let request_id = scope.request_id().to_string();
    let closed = scope.finish(end).await;
    match result {
        Ok(v) => closed.map(|_| v),
        Err(e) => {
            if let Err(close_err) = closed {
                tracing::warn!(request_id = %request_id, error = %close_err, "failed to end trace");
            }
            Err(e)
        }
    }
}
