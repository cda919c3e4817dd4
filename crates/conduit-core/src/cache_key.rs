// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use conduit_model::{Message, MessageContent};
use sha2::{Digest, Sha256};

use crate::dto::GenerationRequest;

/// Recursively sort object keys so two semantically-identical JSON values
/// always serialize to the same string, regardless of field order.
fn canonical_json(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted: Vec<(&String, &serde_json::Value)> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), canonical_json(v));
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonical_json).collect())
        }
        other => other.clone(),
    }
}

fn canonical_json_string(value: &serde_json::Value) -> String {
    serde_json::to_string(&canonical_json(value)).unwrap_or_default()
}

/// Strip volatile fields (timestamp, message ids) and normalize each message
/// to its discriminated JSON form, for cache-key purposes only. Large binary
/// content (images/audio) is part of this normalized form already, never
/// hashed as raw bytes — `Message`'s `Serialize` impl already represents
/// them as base64 strings inside the JSON.
fn messages_for_cache(messages: &[Message]) -> serde_json::Value {
    let normalized: Vec<serde_json::Value> = messages
        .iter()
        .map(|m| {
            serde_json::json!({
                "role": role_tag(m),
                "content": serde_json::to_value(&m.content).unwrap_or(serde_json::Value::Null),
            })
        })
        .collect();
    serde_json::Value::Array(normalized)
}

fn role_tag(m: &Message) -> &'static str {
    match m.content {
        MessageContent::Text(_) | MessageContent::ContentParts(_) => match m.role {
            conduit_model::Role::System => "system",
            conduit_model::Role::User => "user",
            conduit_model::Role::Assistant => "assistant",
            conduit_model::Role::Tool => "tool",
        },
        MessageContent::ToolCall { .. } => "assistant",
        MessageContent::ToolResult { .. } => "tool",
    }
}

/// SHA-256 digest of a JSON Schema, used in place of the full schema text in
/// the cache key so two requests with identical schemas (but arrived at via
/// different code paths) hash identically.
fn schema_digest(schema: &Option<serde_json::Value>) -> String {
    match schema {
        None => "none".to_string(),
        Some(s) => {
            let mut hasher = Sha256::new();
            hasher.update(canonical_json_string(s).as_bytes());
            hex::encode(hasher.finalize())
        }
    }
}

/// `cache_key(request)` per §4.4: SHA-256 over the pipe-joined, LM-affecting
/// fields of the request. Two requests differing only in volatile fields
/// (timestamps, message ids) or in fields this function does not read
/// produce the same key.
pub fn cache_key(req: &GenerationRequest, provider: &str) -> String {
    let parts = [
        req.params.model.clone(),
        canonical_json_string(&messages_for_cache(&req.messages)),
        req.params
            .temperature
            .map(|t| t.to_string())
            .unwrap_or_else(|| "none".to_string()),
        schema_digest(&req.params.response_schema),
        "none".to_string(), // num_ctx: resolved by the adapter, not carried on the request DTO
        provider.to_string(),
        canonical_json_string(
            req.params
                .client_params
                .as_ref()
                .unwrap_or(&serde_json::json!({})),
        ),
    ];
    let joined = parts.join("|");
    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    hex::encode(hasher.finalize())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
