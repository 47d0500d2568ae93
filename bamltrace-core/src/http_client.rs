use std::time::{Duration, Instant};

use reqwest::{Client, Method, StatusCode};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::config::HttpCfg;
use crate::error::{BamlTraceError, CoreResult};

/// A response whose status has not been judged yet.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    /// Parsed JSON body, or the body text as a JSON string when it isn't JSON.
    pub body: Value,
    pub latency_ms: u32,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Thin wrapper around reqwest::Client with defaults and helpers.
/// `label` names the remote side in errors ("mlflow", "openai", ...).
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    user_agent: String,
    label: String,
}

impl HttpClient {
    pub fn new_default(label: &str) -> CoreResult<Self> {
        Self::from_cfg(label, &HttpCfg::default())
    }

    pub fn from_cfg(label: &str, cfg: &HttpCfg) -> CoreResult<Self> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
            .timeout(Duration::from_millis(cfg.request_timeout_ms));
        if let Some(n) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| BamlTraceError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: "baml-trace/0.1".to_string(),
            label: label.to_string(),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Send a request and hand back status and body without mapping errors.
    /// Only transport failures, including a body cut off mid-read, are
    /// reported as `Err`.
    pub async fn send_raw<T: Serialize + ?Sized>(
        &self,
        method: Method,
        url: &str,
        body: Option<&T>,
        headers: &[(&str, &str)],
    ) -> CoreResult<RawResponse> {
        let start = Instant::now();
        let mut req = self
            .inner
            .request(method, url)
            .header("User-Agent", &self.user_agent);
        if let Some(b) = body {
            req = req.json(b);
        }
        for (k, v) in headers {
            req = req.header(*k, *v);
        }

        let resp = req.send().await.map_err(|e| {
            tracing::debug!(backend = %self.label, error = %e, "http transport failure");
            BamlTraceError::Unavailable {
                backend: self.label.clone(),
            }
        })?;

        let status = resp.status().as_u16();
        let text = resp.text().await.map_err(|e| {
            tracing::debug!(backend = %self.label, status, error = %e, "http body read failure");
            BamlTraceError::Unavailable {
                backend: self.label.clone(),
            }
        })?;
        let latency_ms = start.elapsed().as_millis() as u32;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok(RawResponse {
            status,
            body,
            latency_ms,
        })
    }

    async fn send_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<&T>,
        headers: &[(&str, &str)],
    ) -> CoreResult<R> {
        let raw = self.send_raw(method, url, body, headers).await?;
        if !raw.is_success() {
            return Err(map_http_error(&self.label, raw.status, &raw.body));
        }
        serde_json::from_value::<R>(raw.body).map_err(|e| BamlTraceError::Backend {
            backend: self.label.clone(),
            code: raw.status.to_string(),
            message: format!("json decode error: {e}"),
        })
    }

    pub async fn get_json<R: DeserializeOwned>(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> CoreResult<R> {
        self.send_json::<(), R>(Method::GET, url, None, headers).await
    }

    pub async fn post_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
    ) -> CoreResult<R> {
        self.send_json(Method::POST, url, Some(body), headers).await
    }

    pub async fn patch_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
    ) -> CoreResult<R> {
        self.send_json(Method::PATCH, url, Some(body), headers).await
    }

    /// PUT a JSON document where the response body is irrelevant.
    pub async fn put_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
    ) -> CoreResult<()> {
        let raw = self.send_raw(Method::PUT, url, Some(body), headers).await?;
        if !raw.is_success() {
            return Err(map_http_error(&self.label, raw.status, &raw.body));
        }
        Ok(())
    }
}

pub(crate) fn map_http_error(backend: &str, status: u16, body: &Value) -> BamlTraceError {
    let status_code = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status_code.is_server_error() {
        return BamlTraceError::Unavailable {
            backend: backend.to_string(),
        };
    }
    let text = match body {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    BamlTraceError::Backend {
        backend: backend.to_string(),
        code: status.to_string(),
        message: truncate(&text, 300),
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        let mut t = s[..end].to_string();
        t.push_str("...");
        t
    } else {
        s.to_string()
    }
}
