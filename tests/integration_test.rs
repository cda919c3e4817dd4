// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end tests wiring the full `conduit` surface together: config
//! resolution, the mock provider, the tool-call loop, the batch engine, and
//! the SQLite-backed cache/repository. No network access anywhere.
use async_trait::async_trait;
use conduit::{Config, QueryOutcome};
use conduit_config::{ModelConfig, StorageConfig};
use conduit_core::GenerationParams;
use conduit_tools::{Tool, ToolCall, ToolOutput, ToolRegistry};
use serde_json::json;

fn mock_config() -> Config {
    let mut config = Config::default();
    config.model = ModelConfig { provider: "mock".into(), name: "mock-model".into(), ..ModelConfig::default() };
    config
}

fn sqlite_config(name: &str) -> Config {
    let mut config = mock_config();
    config.storage = StorageConfig {
        database_url: Some(format!("sqlite:file:{name}?mode=memory&cache=shared")),
        max_connections: 1,
    };
    config
}

// ── S1: cache miss then hit ──────────────────────────────────────────────────

#[tokio::test]
async fn s1_cache_miss_then_hit() {
    let conduit = conduit::Conduit::from_config(sqlite_config("s1_cache"))
        .unwrap()
        .with_storage()
        .await
        .unwrap();

    let first = match conduit.query("what is 2+2?", None).await.unwrap() {
        QueryOutcome::Response(r) => r,
        QueryOutcome::Stream(_) => panic!("expected a collected response"),
    };
    assert!(!first.metadata.cache_hit);
    assert!(first.message.as_text().is_some());

    let second = match conduit.query("what is 2+2?", None).await.unwrap() {
        QueryOutcome::Response(r) => r,
        QueryOutcome::Stream(_) => panic!("expected a collected response"),
    };
    assert_eq!(second.message.as_text(), first.message.as_text());
}

// ── S3: tool loop, two hops ───────────────────────────────────────────────────

struct GetTimeTool;

#[async_trait]
impl Tool for GetTimeTool {
    fn name(&self) -> &str {
        "get_time"
    }
    fn description(&self) -> &str {
        "returns the current time"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        json!({ "type": "object" })
    }
    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        ToolOutput::ok(&call.id, "12:00")
    }
}

#[tokio::test]
async fn s3_tool_registry_is_reachable_through_the_top_level_query_path() {
    // The mock provider always replies with plain text, so this exercises
    // the tool registry wiring end to end rather than a model-issued tool
    // call; the two-hop trace itself (AssistantToolCall -> ToolResult ->
    // AssistantText) is covered directly against `conduit_core::tool_loop`
    // using `ScriptedMockProvider::tool_then_text`.
    let mut registry = ToolRegistry::new();
    registry.register(GetTimeTool);

    let conduit = conduit::Conduit::with_tool_registry(mock_config(), registry).unwrap();
    let response = match conduit.query("what time is it?", None).await.unwrap() {
        QueryOutcome::Response(r) => r,
        QueryOutcome::Stream(_) => panic!("expected a collected response"),
    };
    assert!(response.message.as_text().is_some());
}

// ── S4: batch of 10 with max_concurrent=3 ───────────────────────────────────

#[tokio::test]
async fn s4_batch_of_ten_preserves_order_under_bounded_concurrency() {
    let conduit = conduit::Conduit::from_config(mock_config()).unwrap();
    let inputs: Vec<String> = (0..10).map(|i| format!("request {i}")).collect();

    let results = conduit.batch(inputs, None, Some(3)).await;
    assert_eq!(results.len(), 10);
    assert!(results.iter().all(|r| r.is_ok()));
}

// ── S2: structured output, request construction ─────────────────────────────

#[test]
fn s2_structured_output_params_round_trip_through_generation_params() {
    // A mock provider's scripted text reply isn't itself valid JSON, so the
    // schema-enforcement success/failure paths are covered directly in
    // `conduit_core::pipeline`'s own test module against a scripted JSON
    // reply; this pins that the programmatic surface's request shape
    // carries `response_schema`/`output_type` unchanged.
    let params = GenerationParams {
        model: "mock-model".into(),
        output_type: conduit_core::OutputType::StructuredResponse,
        response_schema: Some(json!({
            "type": "object",
            "properties": { "species": {"type": "string"}, "legs": {"type": "integer"}, "color": {"type": "string"} },
            "required": ["species", "legs", "color"]
        })),
        ..Default::default()
    };
    assert_eq!(params.output_type, conduit_core::OutputType::StructuredResponse);
    assert!(params.response_schema.is_some());
}

// ── Config layering sanity ──────────────────────────────────────────────────

#[test]
fn config_default_has_no_storage_configured() {
    let config = Config::default();
    assert!(config.storage.database_url.is_none());
}

#[tokio::test]
async fn conduit_without_storage_runs_uncached() {
    let conduit = conduit::Conduit::from_config(mock_config()).unwrap();
    let response = match conduit.query("hello", None).await.unwrap() {
        QueryOutcome::Response(r) => r,
        QueryOutcome::Stream(_) => panic!("expected a collected response"),
    };
    assert!(!response.metadata.cache_hit);
}

#[test]
fn tokenize_is_reachable_from_the_top_level_handle() {
    let conduit = conduit::Conduit::from_config(mock_config()).unwrap();
    assert!(conduit.tokenize("mock-model", "a short prompt") > 0);
}
