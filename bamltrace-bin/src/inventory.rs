//! The inventory demo: two LLM functions over a small stock list, traced
//! standalone and as one grouped workflow.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bamltrace_core::baml::openai::OpenAiFunctionClient;
use bamltrace_core::baml::parse_llm_json;
use bamltrace_core::model::{ChatMessage, PromptRequest};
use bamltrace_core::telemetry::TraceRecord;
use bamltrace_core::{BamlFunction, BamlOptions, CoreResult, Invocation, TraceTarget, Tracer};
use serde::{Deserialize, Serialize};

pub const INVENTORY_TEXT: &str = "
Current Stock:
- Apples: 100 units, $0.50 each, SKU: APL123
- Oranges: 75 units, $0.75 each, SKU: ORG456
- Bananas: 50 units, $0.60 each, SKU: BAN789
";

pub const UPDATE_MESSAGE: &str = "I just received a shipment of 20 apples, and sold 5 oranges.";

const ITEM_SCHEMA: &str = "Answer with a JSON array only. Each element is an object with the \
fields \"item\" (string), \"quantity\" (integer), \"price\" (number, unit price in dollars) \
and \"sku\" (string).";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub item: String,
    pub quantity: i64,
    pub price: f64,
    pub sku: String,
}

impl fmt::Display for InventoryItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} units at ${} each (SKU: {})",
            self.item, self.quantity, self.price, self.sku
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ListInventoryArgs {
    pub inventory_text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateInventoryArgs {
    pub items: Vec<InventoryItem>,
    pub update_message: String,
}

/// Extract inventory items from free text.
pub struct ListInventory {
    client: Arc<OpenAiFunctionClient>,
}

#[async_trait]
impl BamlFunction for ListInventory {
    type Args = ListInventoryArgs;
    type Output = Vec<InventoryItem>;

    fn name(&self) -> &str {
        "ListInventory"
    }

    async fn call(&self, args: &Self::Args, options: &BamlOptions) -> CoreResult<Self::Output> {
        let prompt = PromptRequest::new(vec![
            ChatMessage::system(format!(
                "Extract every inventory item from the stock list. {ITEM_SCHEMA}"
            )),
            ChatMessage::user(args.inventory_text.clone()),
        ])
        .temperature(0.0);
        let raw = self.client.complete(self.name(), &prompt, options).await?;
        Ok(parse_llm_json(&raw)?)
    }
}

/// Apply a shipment/sales message to a list of items.
pub struct UpdateInventory {
    client: Arc<OpenAiFunctionClient>,
}

#[async_trait]
impl BamlFunction for UpdateInventory {
    type Args = UpdateInventoryArgs;
    type Output = Vec<InventoryItem>;

    fn name(&self) -> &str {
        "UpdateInventory"
    }

    async fn call(&self, args: &Self::Args, options: &BamlOptions) -> CoreResult<Self::Output> {
        let items = serde_json::to_string(&args.items)
            .map_err(|e| bamltrace_core::BamlTraceError::Other(e.into()))?;
        let prompt = PromptRequest::new(vec![
            ChatMessage::system(format!(
                "Update the inventory according to the message. Received goods add to the \
                 quantity, sold goods subtract from it. {ITEM_SCHEMA}"
            )),
            ChatMessage::user(format!(
                "Inventory:\n{items}\n\nMessage:\n{}",
                args.update_message
            )),
        ])
        .temperature(0.0);
        let raw = self.client.complete(self.name(), &prompt, options).await?;
        Ok(parse_llm_json(&raw)?)
    }
}

pub struct Inventory {
    list: ListInventory,
    update: UpdateInventory,
}

impl Inventory {
    pub fn new(client: Arc<OpenAiFunctionClient>) -> Self {
        Self {
            list: ListInventory {
                client: client.clone(),
            },
            update: UpdateInventory { client },
        }
    }

    /// `ListInventory` on the sample text in a trace of its own.
    pub async fn run_single(&self, tracer: &Tracer) -> CoreResult<Vec<String>> {
        let args = ListInventoryArgs {
            inventory_text: INVENTORY_TEXT.to_string(),
        };
        let items = tracer
            .trace(&self.list, &args, TraceTarget::standalone())
            .await?;
        Ok(render("Single-call trace items:", &items))
    }

    /// `ListInventory` then `UpdateInventory` on its result, in one trace
    /// filed under `group`. The update is skipped when the listing failed.
    pub async fn run_multi(&self, tracer: &Tracer, group: &str) -> CoreResult<Vec<String>> {
        let (initial, updated) = tracer
            .in_trace(group, |ctx| async move {
                let args = ListInventoryArgs {
                    inventory_text: INVENTORY_TEXT.to_string(),
                };
                let initial = tracer
                    .trace_function(&self.list, &args, TraceTarget::within(&ctx))
                    .await?;
                let updated = match &initial {
                    Invocation::Completed(items) => {
                        let args = UpdateInventoryArgs {
                            items: items.clone(),
                            update_message: UPDATE_MESSAGE.to_string(),
                        };
                        Some(
                            tracer
                                .trace_function(&self.update, &args, TraceTarget::within(&ctx))
                                .await?,
                        )
                    }
                    Invocation::Failed(_) => None,
                };
                Ok((initial, updated))
            })
            .await?;

        let mut lines = render("Multi-call trace initial items:", &initial);
        match updated {
            Some(updated) => lines.extend(render("Multi-call trace updated items:", &updated)),
            None => lines.push("Multi-call trace update skipped: listing failed".to_string()),
        }
        Ok(lines)
    }
}

/// Items one per line, or the failure's error rows.
pub fn render(title: &str, result: &Invocation<Vec<InventoryItem>>) -> Vec<String> {
    let mut out = vec![title.to_string()];
    match result {
        Invocation::Completed(items) => out.extend(items.iter().map(ToString::to_string)),
        Invocation::Failed(f) => out.push(f.to_error_rows().to_string()),
    }
    out
}

/// Indented span tree per trace, for `--dry-run`.
pub fn summarize(traces: &[TraceRecord]) -> Vec<String> {
    let mut out = Vec::new();
    for t in traces {
        out.push(format!(
            "trace {} [{}] {} span(s)",
            t.info.request_id,
            t.info.status.as_str(),
            t.spans.len()
        ));
        walk(t, &t.info.root_span_id, 1, &mut out);
    }
    out
}

fn walk(t: &TraceRecord, span_id: &str, depth: usize, out: &mut Vec<String>) {
    let Some(span) = t.span(span_id) else {
        return;
    };
    out.push(format!(
        "{}{} {}",
        "  ".repeat(depth),
        span.span_type.as_str(),
        span.name
    ));
    for child in t.children_of(span_id) {
        walk(t, &child.span_id, depth + 1, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bamltrace_core::http_client::HttpClient;
    use bamltrace_core::telemetry::{SpanType, Status};
    use bamltrace_core::InMemoryBackend;
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use secrecy::SecretString;
    use serde_json::json;

    fn client(server: &MockServer) -> Arc<OpenAiFunctionClient> {
        Arc::new(OpenAiFunctionClient::new(
            HttpClient::new_default("openai").unwrap(),
            SecretString::new("test-key".into()),
            server.base_url(),
            "gpt-4o-mini".to_string(),
        ))
    }

    fn completion(content: &str) -> serde_json::Value {
        json!({
            "choices": [{"message": {"role": "assistant", "content": content}}],
            "usage": {"prompt_tokens": 40, "completion_tokens": 20}
        })
    }

    const LISTED: &str = r#"```json
[{"item":"Apples","quantity":100,"price":0.5,"sku":"APL123"},
 {"item":"Oranges","quantity":75,"price":0.75,"sku":"ORG456"}]
```"#;

    const UPDATED: &str = r#"[{"item":"Apples","quantity":120,"price":0.5,"sku":"APL123"},
 {"item":"Oranges","quantity":70,"price":0.75,"sku":"ORG456"}]"#;

    #[test]
    fn items_render_like_the_report() {
        let item = InventoryItem {
            item: "Apples".into(),
            quantity: 100,
            price: 0.5,
            sku: "APL123".into(),
        };
        assert_eq!(item.to_string(), "Apples: 100 units at $0.5 each (SKU: APL123)");
    }

    #[tokio::test]
    async fn multi_run_groups_both_functions_in_one_trace() {
        let server = MockServer::start();
        let list = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .body_contains("Extract every inventory item");
            then.status(200).json_body(completion(LISTED));
        });
        let update = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .body_contains("Update the inventory")
                .body_contains("shipment of 20 apples");
            then.status(200).json_body(completion(UPDATED));
        });

        let backend = Arc::new(InMemoryBackend::new());
        let tracer = Tracer::new(backend.clone());
        let lines = Inventory::new(client(&server))
            .run_multi(&tracer, "baml_inventory_multi")
            .await
            .unwrap();

        list.assert_hits(1);
        update.assert_hits(1);
        assert_eq!(
            lines,
            vec![
                "Multi-call trace initial items:",
                "Apples: 100 units at $0.5 each (SKU: APL123)",
                "Oranges: 75 units at $0.75 each (SKU: ORG456)",
                "Multi-call trace updated items:",
                "Apples: 120 units at $0.5 each (SKU: APL123)",
                "Oranges: 70 units at $0.75 each (SKU: ORG456)",
            ]
        );

        let traces = backend.traces();
        assert_eq!(traces.len(), 1);
        let t = &traces[0];
        assert_eq!(t.info.status, Status::Ok);
        let funcs: Vec<_> = t.children_of(&t.info.root_span_id).collect();
        assert_eq!(
            funcs.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            vec!["ListInventory", "UpdateInventory"]
        );
        assert!(funcs.iter().all(|s| s.span_type == SpanType::Agent));
        assert_eq!(funcs[1].inputs["args"]["update_message"], UPDATE_MESSAGE);

        let summary = summarize(&traces);
        assert!(summary[0].ends_with("[OK] 5 span(s)"));
        assert_eq!(summary[1], "  CHAIN baml_multi_workflow");
        assert_eq!(summary[2], "    AGENT ListInventory");
        assert_eq!(summary[3], "      CHAT_MODEL LLMCall:openai");
    }

    #[tokio::test]
    async fn failed_listing_prints_error_rows_and_skips_update() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(completion("Sorry, I can't help with that."));
        });

        let backend = Arc::new(InMemoryBackend::new());
        let tracer = Tracer::new(backend.clone());
        let lines = Inventory::new(client(&server))
            .run_multi(&tracer, "baml_inventory_multi")
            .await
            .unwrap();

        assert_eq!(lines[0], "Multi-call trace initial items:");
        let rows: serde_json::Value = serde_json::from_str(&lines[1]).unwrap();
        assert!(rows[0]["error"]
            .as_str()
            .unwrap()
            .starts_with("failed to parse LLM response"));
        assert_eq!(lines[2], "Multi-call trace update skipped: listing failed");

        // the failed function leaves no spans, the grouped trace still closes
        let t = &backend.traces()[0];
        assert_eq!(t.spans.len(), 1);
        assert_eq!(t.info.status, Status::Ok);
    }

    #[tokio::test]
    async fn single_run_opens_a_trace_named_after_the_function() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(completion(LISTED));
        });

        let backend = Arc::new(InMemoryBackend::new());
        let tracer = Tracer::new(backend.clone());
        let lines = Inventory::new(client(&server))
            .run_single(&tracer)
            .await
            .unwrap();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "Single-call trace items:");

        let t = &backend.traces()[0];
        assert_eq!(t.info.experiment, "ListInventory");
        assert_eq!(t.info.tags["experiment"], "ListInventory");
    }
}
