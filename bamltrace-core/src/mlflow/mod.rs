//! MLflow tracking-server backend.
//!
//! Spans are buffered client-side while a trace is open. When the trace ends
//! the span tree is uploaded as `traces.json` to the trace's artifact
//! location, then the trace info is finalized with a PATCH.

pub mod export;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use reqwest::{Method, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::Config;
use crate::error::{BamlTraceError, CoreResult};
use crate::http_client::{HttpClient, map_http_error, truncate};
use crate::telemetry::memory::new_span_id;
use crate::telemetry::{
    EndSpan, EndTrace, KEY_ARTIFACT_LOCATION, KEY_CHAT_MESSAGES, KEY_CHAT_TOOLS,
    KEY_TRACE_INPUTS, KEY_TRACE_NAME, KEY_TRACE_OUTPUTS, SpanHandle, StartSpan, StartTrace,
    TraceBackend, TraceBuffer, TraceInfo, TraceRecord, now_ms, now_ns,
};

const ARTIFACT_SCHEME: &str = "mlflow-artifacts:";
const RESOURCE_DOES_NOT_EXIST: &str = "RESOURCE_DOES_NOT_EXIST";
/// The tracking server rejects longer request-metadata values.
const MAX_METADATA_CHARS: usize = 250;

#[derive(Debug, Serialize)]
struct KeyValue {
    key: String,
    value: String,
}

fn kv(key: &str, value: impl Into<String>) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: value.into(),
    }
}

fn metadata_value(s: &str) -> String {
    truncate(s, MAX_METADATA_CHARS - 3)
}

#[derive(Debug, Deserialize)]
struct TraceInfoResp {
    trace_info: WireTraceInfo,
}

#[derive(Debug, Deserialize)]
struct WireTraceInfo {
    request_id: String,
    #[serde(default)]
    tags: Vec<WireTag>,
}

#[derive(Debug, Deserialize)]
struct WireTag {
    key: String,
    #[serde(default)]
    value: String,
}

impl WireTraceInfo {
    fn tag(&self, key: &str) -> Option<String> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.clone())
    }
}

#[derive(Debug, Deserialize)]
struct CreateExperimentResp {
    experiment_id: String,
}

/// Per-trace export state kept between start and end.
#[derive(Debug, Clone)]
struct ExportMeta {
    trace_id: String,
    artifact_location: Option<String>,
}

#[derive(Debug)]
pub struct MlflowBackend {
    http: HttpClient,
    base: String,
    token: Option<SecretString>,
    buffer: TraceBuffer,
    experiments: Mutex<HashMap<String, String>>,
    exports: Mutex<HashMap<String, ExportMeta>>,
}

impl MlflowBackend {
    pub fn new(http: HttpClient, base: impl Into<String>, token: Option<SecretString>) -> Self {
        Self {
            http,
            base: base.into().trim_end_matches('/').to_string(),
            token,
            buffer: TraceBuffer::new(),
            experiments: Mutex::new(HashMap::new()),
            exports: Mutex::new(HashMap::new()),
        }
    }

    /// Build from `tracking` and `http` config. Only http(s) tracking servers
    /// are supported. The bearer token is read from the env var
    /// `tracking.token_env` names, when set.
    pub fn from_config(cfg: &Config) -> CoreResult<Self> {
        let uri = cfg.tracking.uri.trim_end_matches('/');
        if !(uri.starts_with("http://") || uri.starts_with("https://")) {
            return Err(BamlTraceError::Validation(format!(
                "tracking uri {uri} is not an http(s) endpoint"
            )));
        }
        let token = std::env::var(&cfg.tracking.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .map(|t| SecretString::new(t.into()));
        let http = HttpClient::from_cfg("mlflow", &cfg.http)?;
        Ok(Self::new(http, uri, token))
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn api(&self, path: &str) -> String {
        format!("{}/api/2.0/mlflow/{}", self.base, path)
    }

    fn headers(&self) -> Vec<(String, String)> {
        let mut h = Vec::new();
        if let Some(t) = &self.token {
            h.push((
                "Authorization".to_string(),
                format!("Bearer {}", t.expose_secret()),
            ));
        }
        h
    }

    fn experiments(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.experiments.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn exports(&self) -> MutexGuard<'_, HashMap<String, ExportMeta>> {
        self.exports.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Resolve an experiment name to its id, creating the experiment when the
    /// server doesn't know it. Ids are cached per name.
    async fn experiment_id(&self, name: &str) -> CoreResult<String> {
        if let Some(id) = self.experiments().get(name).cloned() {
            return Ok(id);
        }
        let owned = self.headers();
        let hdrs = borrow_headers(&owned);

        let mut url = Url::parse(&self.api("experiments/get-by-name"))
            .map_err(|e| BamlTraceError::Validation(format!("invalid tracking uri: {e}")))?;
        url.query_pairs_mut().append_pair("experiment_name", name);
        let raw = self
            .http
            .send_raw::<()>(Method::GET, url.as_str(), None, &hdrs)
            .await?;

        let missing = raw.status == 404
            || raw.body.get("error_code").and_then(Value::as_str) == Some(RESOURCE_DOES_NOT_EXIST);
        let id = if raw.is_success() {
            raw.body
                .pointer("/experiment/experiment_id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| BamlTraceError::Backend {
                    backend: self.http.label().to_string(),
                    code: raw.status.to_string(),
                    message: "get-by-name response has no experiment_id".into(),
                })?
        } else if missing {
            tracing::info!(experiment = name, "creating MLflow experiment");
            let created: CreateExperimentResp = self
                .http
                .post_json(&self.api("experiments/create"), &json!({ "name": name }), &hdrs)
                .await?;
            created.experiment_id
        } else {
            return Err(map_http_error(self.http.label(), raw.status, &raw.body));
        };

        self.experiments().insert(name.to_string(), id.clone());
        Ok(id)
    }

    async fn fetch_artifact_location(&self, request_id: &str) -> CoreResult<Option<String>> {
        let owned = self.headers();
        let hdrs = borrow_headers(&owned);
        let resp: TraceInfoResp = self
            .http
            .get_json(&self.api(&format!("traces/{request_id}/info")), &hdrs)
            .await?;
        Ok(resp.trace_info.tag(KEY_ARTIFACT_LOCATION))
    }

    async fn upload_trace_data(&self, rec: &TraceRecord, meta: ExportMeta) -> CoreResult<()> {
        let request_id = rec.info.request_id.as_str();
        let location = match meta.artifact_location {
            Some(l) => Some(l),
            None => self.fetch_artifact_location(request_id).await?,
        };
        let Some(location) = location else {
            tracing::warn!(request_id, "trace has no artifact location; spans not uploaded");
            return Ok(());
        };
        let Some(path) = location.strip_prefix(ARTIFACT_SCHEME) else {
            tracing::warn!(
                request_id,
                location = %location,
                "artifact location is not served by the tracking server; spans not uploaded"
            );
            return Ok(());
        };

        let url = format!(
            "{}/api/2.0/mlflow-artifacts/artifacts/{}/traces.json",
            self.base,
            path.trim_matches('/')
        );
        let owned = self.headers();
        let hdrs = borrow_headers(&owned);
        self.http
            .put_json(&url, &export::trace_data(rec, &meta.trace_id), &hdrs)
            .await?;
        tracing::debug!(request_id, spans = rec.spans.len(), "uploaded trace data");
        Ok(())
    }
}

fn borrow_headers(owned: &[(String, String)]) -> Vec<(&str, &str)> {
    owned
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect()
}

#[async_trait]
impl TraceBackend for MlflowBackend {
    async fn start_trace(&self, req: StartTrace) -> CoreResult<SpanHandle> {
        let experiment_id = self.experiment_id(&req.experiment).await?;
        let mut tags = vec![kv(KEY_TRACE_NAME, req.name.clone())];
        tags.extend(req.tags.iter().map(|(k, v)| kv(k, v.clone())));
        let body = json!({
            "experiment_id": experiment_id,
            "timestamp_ms": now_ms(),
            "request_metadata": [kv(KEY_TRACE_INPUTS, metadata_value(&req.inputs.to_string()))],
            "tags": tags,
        });

        let owned = self.headers();
        let hdrs = borrow_headers(&owned);
        let resp: TraceInfoResp = self.http.post_json(&self.api("traces"), &body, &hdrs).await?;
        let info = resp.trace_info;

        let handle = self
            .buffer
            .open_trace(&info.request_id, &new_span_id(), &req, now_ns())?;
        self.exports().insert(
            info.request_id.clone(),
            ExportMeta {
                trace_id: uuid::Uuid::new_v4().simple().to_string(),
                artifact_location: info.tag(KEY_ARTIFACT_LOCATION),
            },
        );
        tracing::debug!(request_id = %handle.request_id, experiment_id = %experiment_id, "MLflow trace started");
        Ok(handle)
    }

    async fn end_trace(&self, request_id: &str, req: EndTrace) -> CoreResult<()> {
        let status = req.status;
        let mut metadata = Vec::new();
        if let Some(out) = &req.outputs {
            metadata.push(kv(KEY_TRACE_OUTPUTS, metadata_value(&out.to_string())));
        }
        metadata.extend(req.metadata.iter().map(|(k, v)| kv(k, metadata_value(v))));

        let rec = self.buffer.close_trace(request_id, req, now_ns())?;
        let meta = self.exports().remove(request_id);
        let uploaded = match meta {
            Some(m) => self.upload_trace_data(&rec, m).await,
            None => Ok(()),
        };
        if let Err(e) = &uploaded {
            tracing::warn!(request_id, error = %e, "failed to upload trace data");
        }

        let body = json!({
            "request_id": request_id,
            "timestamp_ms": now_ms(),
            "status": status.as_str(),
            "request_metadata": metadata,
            "tags": [],
        });
        let owned = self.headers();
        let hdrs = borrow_headers(&owned);
        let patched = self
            .http
            .patch_json::<_, Value>(&self.api(&format!("traces/{request_id}")), &body, &hdrs)
            .await
            .map(|_| ());
        self.buffer.evict(request_id);
        tracing::debug!(request_id, status = status.as_str(), "MLflow trace ended");
        uploaded.and(patched)
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
