//! Call-log records produced while an LLM function runs, and the collector
//! that accumulates them.
//!
//! Records arriving as untyped JSON (e.g. exported from another runtime) go
//! through [`FunctionLog::from_json`], which validates every field the tracer
//! relies on and reports `MalformedLog` otherwise.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BamlTraceError, CoreResult};
use crate::telemetry::ms_to_ns;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn merge(self, other: Usage) -> Usage {
        Usage {
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
        }
    }
}

/// Wall-clock timing at millisecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Timing {
    pub start_time_utc_ms: u64,
    pub duration_ms: u64,
}

impl Timing {
    pub fn start_ns(&self) -> u64 {
        ms_to_ns(self.start_time_utc_ms)
    }

    pub fn end_ns(&self) -> u64 {
        ms_to_ns(self.start_time_utc_ms + self.duration_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequestRecord {
    pub url: String,
    pub method: String,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponseRecord {
    pub status: u16,
    pub body: Value,
}

impl HttpResponseRecord {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// One network call to a model provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmCall {
    pub client_name: String,
    pub provider: String,
    pub timing: Timing,
    pub http_request: HttpRequestRecord,
    /// Absent when the request never got an answer.
    pub http_response: Option<HttpResponseRecord>,
    pub usage: Usage,
    /// Whether this call's response became the function's result.
    pub selected: bool,
}

impl LlmCall {
    /// Request `messages` followed by the response's first choice message.
    ///
    /// Calls that failed (no response, or a non-2xx status) yield only the
    /// request messages. A successful response without a first choice is
    /// malformed.
    pub fn chat_messages(&self) -> CoreResult<Vec<Value>> {
        let mut messages = self
            .http_request
            .body
            .get("messages")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| {
                BamlTraceError::malformed(format!(
                    "{} call request body has no messages array",
                    self.provider
                ))
            })?;

        let Some(resp) = self.http_response.as_ref().filter(|r| r.is_success()) else {
            return Ok(messages);
        };
        let reply = resp
            .body
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .cloned()
            .ok_or_else(|| {
                BamlTraceError::malformed(format!(
                    "{} call response has no choices[0].message",
                    self.provider
                ))
            })?;
        messages.push(reply);
        Ok(messages)
    }

    /// Tool definitions sent with the request, if any.
    pub fn chat_tools(&self) -> Option<Vec<Value>> {
        self.http_request
            .body
            .get("tools")
            .and_then(Value::as_array)
            .filter(|t| !t.is_empty())
            .cloned()
    }

    pub fn status(&self) -> Option<u16> {
        self.http_response.as_ref().map(|r| r.status)
    }
}

/// Everything one function invocation did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionLog {
    pub id: String,
    pub function_name: String,
    pub timing: Timing,
    pub usage: Usage,
    pub calls: Vec<LlmCall>,
    pub raw_llm_response: Option<String>,
}

// ---- Loose wire shapes accepted by `from_json` ----
#[derive(Deserialize)]
struct WireLog {
    id: Option<String>,
    function_name: Option<String>,
    timing: Option<WireTiming>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    calls: Vec<WireCall>,
    #[serde(default)]
    raw_llm_response: Option<String>,
}

#[derive(Deserialize)]
struct WireTiming {
    start_time_utc_ms: Option<i64>,
    duration_ms: Option<i64>,
}

#[derive(Deserialize, Default)]
struct WireUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct WireCall {
    #[serde(default)]
    client_name: Option<String>,
    provider: Option<String>,
    timing: Option<WireTiming>,
    http_request: Option<WireRequest>,
    #[serde(default)]
    http_response: Option<WireResponse>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    selected: bool,
}

#[derive(Deserialize)]
struct WireRequest {
    #[serde(default)]
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    body: Value,
}

fn default_method() -> String {
    "POST".to_string()
}

#[derive(Deserialize)]
struct WireResponse {
    status: Option<u16>,
    #[serde(default)]
    body: Value,
}

fn parse_timing(t: Option<WireTiming>, what: &str) -> CoreResult<Timing> {
    let t = t.ok_or_else(|| BamlTraceError::malformed(format!("{what} has no timing")))?;
    let start = t
        .start_time_utc_ms
        .ok_or_else(|| BamlTraceError::malformed(format!("{what} has no start_time_utc_ms")))?;
    let duration = t
        .duration_ms
        .ok_or_else(|| BamlTraceError::malformed(format!("{what} has no duration_ms")))?;
    if start < 0 || duration < 0 {
        return Err(BamlTraceError::malformed(format!(
            "{what} has negative timing (start {start}ms, duration {duration}ms)"
        )));
    }
    Ok(Timing {
        start_time_utc_ms: start as u64,
        duration_ms: duration as u64,
    })
}

fn parse_usage(u: Option<WireUsage>) -> Usage {
    let u = u.unwrap_or_default();
    Usage::new(u.input_tokens.unwrap_or(0), u.output_tokens.unwrap_or(0))
}

/// Bodies may arrive as JSON or as a string holding JSON.
fn parse_body(body: Value) -> Value {
    match body {
        Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
        other => other,
    }
}

impl FunctionLog {
    pub fn from_json(value: &Value) -> CoreResult<Self> {
        let wire: WireLog = serde_json::from_value(value.clone())
            .map_err(|e| BamlTraceError::malformed(format!("log entry: {e}")))?;
        let id = wire
            .id
            .ok_or_else(|| BamlTraceError::malformed("log entry has no id"))?;
        let function_name = wire
            .function_name
            .filter(|n| !n.is_empty())
            .ok_or_else(|| BamlTraceError::malformed(format!("log {id} has no function_name")))?;
        let timing = parse_timing(wire.timing, &format!("log {id}"))?;

        let mut calls = Vec::with_capacity(wire.calls.len());
        for (i, c) in wire.calls.into_iter().enumerate() {
            let what = format!("log {id} call #{i}");
            let provider = c
                .provider
                .ok_or_else(|| BamlTraceError::malformed(format!("{what} has no provider")))?;
            let req = c
                .http_request
                .ok_or_else(|| BamlTraceError::malformed(format!("{what} has no http_request")))?;
            let http_response = match c.http_response {
                Some(r) => Some(HttpResponseRecord {
                    status: r.status.ok_or_else(|| {
                        BamlTraceError::malformed(format!("{what} response has no status"))
                    })?,
                    body: parse_body(r.body),
                }),
                None => None,
            };
            calls.push(LlmCall {
                client_name: c.client_name.unwrap_or_else(|| provider.clone()),
                timing: parse_timing(c.timing, &what)?,
                provider,
                http_request: HttpRequestRecord {
                    url: req.url,
                    method: req.method,
                    body: parse_body(req.body),
                },
                http_response,
                usage: parse_usage(c.usage),
                selected: c.selected,
            });
        }

        Ok(Self {
            id,
            function_name,
            timing,
            usage: parse_usage(wire.usage),
            calls,
            raw_llm_response: wire.raw_llm_response,
        })
    }
}

/// Accumulates the logs of the function calls it is attached to.
#[derive(Debug)]
pub struct Collector {
    name: String,
    logs: Mutex<Vec<FunctionLog>>,
}

impl Collector {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            logs: Mutex::new(Vec::new()),
        }
    }

    pub fn shared(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn guard(&self) -> MutexGuard<'_, Vec<FunctionLog>> {
        self.logs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, log: FunctionLog) {
        tracing::trace!(collector = %self.name, log_id = %log.id, "collector recorded log");
        self.guard().push(log);
    }

    /// Validate an untyped log entry and record it.
    pub fn record_json(&self, value: &Value) -> CoreResult<()> {
        let log = FunctionLog::from_json(value)?;
        self.record(log);
        Ok(())
    }

    pub fn logs(&self) -> Vec<FunctionLog> {
        self.guard().clone()
    }

    pub fn last(&self) -> Option<FunctionLog> {
        self.guard().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    /// Token usage summed over every recorded log.
    pub fn usage(&self) -> Usage {
        self.guard()
            .iter()
            .fold(Usage::default(), |acc, l| acc.merge(l.usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_log_json() -> Value {
        json!({
            "id": "log-1",
            "function_name": "ListInventory",
            "timing": {"start_time_utc_ms": 1000, "duration_ms": 250},
            "usage": {"input_tokens": 12, "output_tokens": 34},
            "raw_llm_response": "[]",
            "calls": [{
                "client_name": "GPT4oMini",
                "provider": "openai",
                "timing": {"start_time_utc_ms": 1000, "duration_ms": 200},
                "http_request": {
                    "url": "https://api.openai.com/v1/chat/completions",
                    "method": "POST",
                    "body": "{\"model\":\"gpt-4o-mini\",\"messages\":[{\"role\":\"user\",\"content\":\"hi\"}]}"
                },
                "http_response": {
                    "status": 200,
                    "body": {"choices": [{"message": {"role": "assistant", "content": "[]"}}]}
                },
                "usage": {"input_tokens": 12, "output_tokens": 34},
                "selected": true
            }]
        })
    }

    #[test]
    fn parses_log_with_string_bodies() {
        let log = FunctionLog::from_json(&sample_log_json()).unwrap();
        assert_eq!(log.function_name, "ListInventory");
        assert_eq!(log.calls.len(), 1);
        let call = &log.calls[0];
        assert_eq!(call.http_request.body["model"], "gpt-4o-mini");
        assert_eq!(call.status(), Some(200));
        assert!(call.selected);
        assert_eq!(call.timing.end_ns(), 1_200_000_000);
    }

    #[test]
    fn timing_converts_ms_to_ns_exactly() {
        let t = Timing {
            start_time_utc_ms: 1000,
            duration_ms: 200,
        };
        assert_eq!(t.start_ns(), 1_000_000_000);
        assert_eq!(t.end_ns(), (1000 + 200) * 1_000_000);
    }

    #[test]
    fn chat_messages_appends_first_choice() {
        let log = FunctionLog::from_json(&sample_log_json()).unwrap();
        let msgs = log.calls[0].chat_messages().unwrap();
        assert_eq!(
            msgs,
            vec![
                json!({"role": "user", "content": "hi"}),
                json!({"role": "assistant", "content": "[]"}),
            ]
        );
    }

    #[test]
    fn failed_call_keeps_request_messages_only() {
        let mut v = sample_log_json();
        v["calls"][0]["http_response"] = json!({"status": 500, "body": "upstream down"});
        let log = FunctionLog::from_json(&v).unwrap();
        let msgs = log.calls[0].chat_messages().unwrap();
        assert_eq!(msgs.len(), 1);
    }

    #[test]
    fn successful_call_without_choices_is_malformed() {
        let mut v = sample_log_json();
        v["calls"][0]["http_response"]["body"] = json!({"id": "x"});
        let log = FunctionLog::from_json(&v).unwrap();
        let err = log.calls[0].chat_messages().unwrap_err();
        assert!(matches!(err, BamlTraceError::MalformedLog(m) if m.contains("choices")));
    }

    #[test]
    fn missing_duration_is_malformed() {
        let mut v = sample_log_json();
        v["calls"][0]["timing"] = json!({"start_time_utc_ms": 1000});
        let err = FunctionLog::from_json(&v).unwrap_err();
        match err {
            BamlTraceError::MalformedLog(msg) => assert!(msg.contains("duration_ms")),
            other => panic!("expected MalformedLog, got {other:?}"),
        }
    }

    #[test]
    fn negative_timing_is_malformed() {
        let mut v = sample_log_json();
        v["timing"] = json!({"start_time_utc_ms": 1000, "duration_ms": -5});
        assert!(matches!(
            FunctionLog::from_json(&v),
            Err(BamlTraceError::MalformedLog(_))
        ));
    }

    #[test]
    fn tools_are_exposed_when_present() {
        let mut v = sample_log_json();
        v["calls"][0]["http_request"]["body"] = json!({
            "messages": [],
            "tools": [{"type": "function", "function": {"name": "lookup"}}]
        });
        let log = FunctionLog::from_json(&v).unwrap();
        assert_eq!(log.calls[0].chat_tools().unwrap().len(), 1);
    }

    #[test]
    fn collector_sums_usage() {
        let c = Collector::new("baml_collector");
        assert!(c.is_empty());
        c.record_json(&sample_log_json()).unwrap();
        c.record_json(&sample_log_json()).unwrap();
        assert_eq!(c.len(), 2);
        assert_eq!(c.usage(), Usage::new(24, 68));
        assert_eq!(c.usage().total(), 92);
        assert_eq!(c.last().unwrap().id, "log-1");
    }

    #[test]
    fn collector_rejects_malformed_json() {
        let c = Collector::new("baml_collector");
        let err = c.record_json(&json!({"function_name": "X"})).unwrap_err();
        assert!(matches!(err, BamlTraceError::MalformedLog(_)));
        assert!(c.is_empty());
    }
}
