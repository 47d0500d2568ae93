use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::error::{BamlTraceError, CoreResult};

/// Where traces are sent.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TrackingCfg {
    /// Base URL of the MLflow tracking server.
    #[serde(default = "default_tracking_uri")]
    pub uri: String,
    /// Experiment used for grouped traces when the caller doesn't name one.
    #[serde(default = "default_experiment")]
    pub experiment: String,
    /// Name of the environment variable that holds a bearer token, if any.
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

impl Default for TrackingCfg {
    fn default() -> Self {
        Self {
            uri: default_tracking_uri(),
            experiment: default_experiment(),
            token_env: default_token_env(),
        }
    }
}

fn default_tracking_uri() -> String {
    "http://localhost:5000".to_string()
}
fn default_experiment() -> String {
    "baml_inventory_multi".to_string()
}
fn default_token_env() -> String {
    "MLFLOW_TRACKING_TOKEN".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TraceMode {
    /// Open a trace once, run N calls under it, close it once.
    #[default]
    Grouped,
    /// One trace per call, closed with aggregate usage on the trace.
    SingleCall,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TraceCfg {
    #[serde(default)]
    pub mode: TraceMode,
    /// Name given to the root span of every trace.
    #[serde(default = "default_root_span_name")]
    pub root_span_name: String,
    /// Name given to the per-invocation log collector.
    #[serde(default = "default_collector_name")]
    pub collector_name: String,
}

impl Default for TraceCfg {
    fn default() -> Self {
        Self {
            mode: TraceMode::default(),
            root_span_name: default_root_span_name(),
            collector_name: default_collector_name(),
        }
    }
}

fn default_root_span_name() -> String {
    "baml_multi_workflow".to_string()
}
fn default_collector_name() -> String {
    "baml_collector".to_string()
}

/// OpenAI-compatible endpoint backing the LLM functions.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct LlmCfg {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_base")]
    pub base: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Name of the environment variable that contains the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for LlmCfg {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            base: default_llm_base(),
            model: default_llm_model(),
            api_key_env: default_api_key_env(),
        }
    }
}

fn default_llm_provider() -> String {
    "openai".to_string()
}
fn default_llm_base() -> String {
    "https://api.openai.com".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total request timeout in milliseconds (default 60000ms)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    60_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct Config {
    #[serde(default)]
    pub tracking: TrackingCfg,
    #[serde(default)]
    pub trace: TraceCfg,
    #[serde(default)]
    pub llm: LlmCfg,
    /// HTTP client configuration (timeouts, pooling). Missing in older configs → defaults.
    #[serde(default)]
    pub http: HttpCfg,
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(BamlTraceError::from)?;
        let s = std::str::from_utf8(&bytes).map_err(|e| BamlTraceError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                serde_json::from_str::<Self>(s).map_err(|e| BamlTraceError::Other(e.into()))?
            }
            Some("toml") => {
                toml::from_str::<Self>(s).map_err(|e| BamlTraceError::Other(e.into()))?
            }
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| BamlTraceError::Other(e.into()))
                .or_else(|_| {
                    toml::from_str::<Self>(s).map_err(|e| BamlTraceError::Other(e.into()))
                })?,
        };
        Ok(cfg)
    }

    /// Load from `path` when given, defaults otherwise, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> CoreResult<Self> {
        let mut cfg = match path {
            Some(p) => Self::from_path(p)?,
            None => Self::default(),
        };
        cfg.apply_env_overrides(|k| std::env::var(k).ok());
        Ok(cfg)
    }

    /// `MLFLOW_TRACKING_URI` wins over the file, like the MLflow SDK.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(uri) = lookup("MLFLOW_TRACKING_URI").filter(|u| !u.trim().is_empty()) {
            self.tracking.uri = uri.trim_end_matches('/').to_string();
        }
    }
}
