//! The LLM-function side: what a traced function looks like, the options it
//! receives and the logs it leaves behind.

pub mod collector;
pub mod error;
pub mod openai;

pub use collector::{Collector, FunctionLog, HttpRequestRecord, HttpResponseRecord, LlmCall, Timing, Usage};
pub use error::{BamlError, BamlErrorKind};

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::CoreResult;

/// Per-call options handed to a function. Functions record their activity in
/// `collector`.
#[derive(Debug, Clone)]
pub struct BamlOptions {
    pub collector: Arc<Collector>,
}

impl BamlOptions {
    pub fn new(collector: Arc<Collector>) -> Self {
        Self { collector }
    }
}

/// A prompt-templated LLM function.
///
/// Implementations return `BamlTraceError::Baml` for failures of the function
/// itself (bad model output, provider rejection). Anything else is treated as
/// an infrastructure failure by the tracer.
#[async_trait]
pub trait BamlFunction: Send + Sync {
    type Args: Serialize + Send + Sync;
    type Output: Send;

    fn name(&self) -> &str;

    async fn call(&self, args: &Self::Args, options: &BamlOptions) -> CoreResult<Self::Output>;
}

/// Parse a model reply as JSON, tolerating a surrounding markdown code fence.
pub fn parse_llm_json<T: DeserializeOwned>(raw: &str) -> Result<T, BamlError> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    serde_json::from_str(body)
        .map_err(|e| BamlError::validation(format!("failed to parse LLM response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_and_bare_json() {
        let bare: Vec<u32> = parse_llm_json("[1, 2]").unwrap();
        assert_eq!(bare, vec![1, 2]);
        let fenced: Vec<u32> = parse_llm_json("```json\n[3]\n```\n").unwrap();
        assert_eq!(fenced, vec![3]);
        let plain_fence: Vec<u32> = parse_llm_json("```\n[4]\n```").unwrap();
        assert_eq!(plain_fence, vec![4]);
    }

    #[test]
    fn unparseable_reply_is_validation_error() {
        let err = parse_llm_json::<Vec<u32>>("I could not find items").unwrap_err();
        assert_eq!(err.kind, BamlErrorKind::Validation);
        assert!(err.message.starts_with("failed to parse LLM response"));
    }

    #[test]
    fn options_share_the_collector() {
        let collector = Collector::shared("c");
        let opts = BamlOptions::new(collector.clone());
        assert_eq!(opts.collector.name(), "c");
        assert!(Arc::ptr_eq(&opts.collector, &collector));
    }
}
