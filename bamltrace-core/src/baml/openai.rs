use reqwest::Method;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::Value;

use crate::baml::{
    BamlError, BamlOptions, FunctionLog, HttpRequestRecord, HttpResponseRecord, LlmCall, Timing,
    Usage,
};
use crate::config::{HttpCfg, LlmCfg};
use crate::error::{BamlTraceError, CoreResult};
use crate::http_client::{HttpClient, truncate};
use crate::model::{ChatMessage, PromptRequest};
use crate::telemetry::now_ms;

/// Runs LLM functions against an OpenAI-compatible chat endpoint, one chat
/// completion per function call, and records each call into the collector.
#[derive(Debug, Clone)]
pub struct OpenAiFunctionClient {
    http: HttpClient,
    base: String,
    model: String,
    provider: String, // usually "openai"
    api_key: SecretString,
}

impl OpenAiFunctionClient {
    pub fn new(http: HttpClient, api_key: SecretString, base: String, model: String) -> Self {
        Self {
            http,
            api_key,
            base,
            model,
            provider: "openai".into(),
        }
    }

    /// Build from config; the API key is read from the env var `llm.api_key_env` names.
    pub fn from_config(llm: &LlmCfg, http: &HttpCfg) -> CoreResult<Self> {
        let key = std::env::var(&llm.api_key_env).map_err(|_| {
            BamlTraceError::Validation(format!(
                "environment variable {} is not set",
                llm.api_key_env
            ))
        })?;
        let client = HttpClient::from_cfg(&llm.provider, http)?;
        let mut this = Self::new(
            client,
            SecretString::new(key.into()),
            llm.base.trim_end_matches('/').to_string(),
            llm.model.clone(),
        );
        this.provider = llm.provider.clone();
        Ok(this)
    }

    #[cfg(test)]
    pub fn new_for_tests(server_base: &str) -> Self {
        Self::new(
            HttpClient::new_default("openai").unwrap(),
            SecretString::new("test-key".into()),
            server_base.to_string(),
            "gpt-4o-mini".to_string(),
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn headers(&self) -> Vec<(String, String)> {
        vec![
            (
                "Authorization".to_string(),
                format!("Bearer {}", self.api_key.expose_secret()),
            ),
            ("Content-Type".to_string(), "application/json".to_string()),
        ]
    }

    /// Send `prompt` for `function_name` and return the assistant text.
    ///
    /// The call is recorded in `options.collector` whatever the outcome, as
    /// long as the provider answered. Non-2xx answers become
    /// `BamlError::client_http`; transport failures stay `Unavailable`.
    pub async fn complete(
        &self,
        function_name: &str,
        prompt: &PromptRequest,
        options: &BamlOptions,
    ) -> CoreResult<String> {
        let payload = OAChatReq {
            model: &self.model,
            messages: &prompt.messages,
            temperature: prompt.temperature,
            max_tokens: prompt.max_output_tokens,
        };
        let body = serde_json::to_value(&payload).map_err(|e| BamlTraceError::Other(e.into()))?;
        let owned_headers = self.headers();
        let hdrs: Vec<(&str, &str)> = owned_headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let url = format!("{}/v1/chat/completions", self.base);

        let started_ms = now_ms();
        let raw = self
            .http
            .send_raw(Method::POST, &url, Some(&body), &hdrs)
            .await?;

        let timing = Timing {
            start_time_utc_ms: started_ms,
            duration_ms: raw.latency_ms as u64,
        };
        let usage = extract_usage(&raw.body);
        let content = raw
            .body
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string);
        let success = raw.is_success();
        let error_message = (!success).then(|| provider_error_message(&raw.body));

        let call = LlmCall {
            client_name: self.model.clone(),
            provider: self.provider.clone(),
            timing,
            http_request: HttpRequestRecord {
                url,
                method: "POST".into(),
                body,
            },
            http_response: Some(HttpResponseRecord {
                status: raw.status,
                body: raw.body,
            }),
            usage,
            selected: success,
        };
        options.collector.record(FunctionLog {
            id: uuid::Uuid::new_v4().to_string(),
            function_name: function_name.to_string(),
            timing,
            usage,
            calls: vec![call],
            raw_llm_response: content.clone(),
        });

        if let Some(msg) = error_message {
            return Err(BamlError::client_http(raw.status, msg).into());
        }
        content.ok_or_else(|| BamlError::validation("LLM response has no message content").into())
    }
}

// ---- Wire structs (minimal) ----
#[derive(Serialize)]
struct OAChatReq<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

fn extract_usage(body: &Value) -> Usage {
    let field = |name: &str| {
        body.get("usage")
            .and_then(|u| u.get(name))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };
    Usage::new(field("prompt_tokens"), field("completion_tokens"))
}

fn provider_error_message(body: &Value) -> String {
    match body.pointer("/error/message").and_then(Value::as_str) {
        Some(m) => m.to_string(),
        None => match body {
            Value::String(s) => truncate(s, 300),
            other => truncate(&other.to_string(), 300),
        },
    }
}
