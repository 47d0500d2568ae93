pub mod baml;
pub mod config;
pub mod error;
pub mod http_client;
pub mod mlflow;
pub mod model;
pub mod telemetry;
pub mod tracer;

pub use baml::{BamlError, BamlFunction, BamlOptions, Collector, FunctionLog};
pub use config::Config;
pub use error::{BamlTraceError, CoreResult};
pub use mlflow::MlflowBackend;
pub use telemetry::{InMemoryBackend, TraceBackend};
pub use tracer::{FunctionFailure, Invocation, TraceContext, TraceScope, TraceTarget, Tracer};
