// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared base implementation for OpenAI-compatible chat completion APIs.
//!
//! Roughly 25 providers speak the same `/chat/completions` + `/models` wire
//! format.  This module provides a single `OpenAICompatProvider` that every
//! such driver configures with its own defaults (URL, auth style, headers).
//!
//! # Auth styles
//! - `Bearer` — `Authorization: Bearer <key>` (most providers)
//! - `ApiKeyHeader` — `api-key: <key>` (Azure OpenAI)
//! - `None` — no authentication (local servers like Ollama / LM Studio)
//!
//! # Usage
//! Configure via `conduit_config::ModelConfig` and call `conduit_model::from_config`.
//! This module is `pub(crate)` — direct construction is handled in
//! `conduit_model::from_config`.

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    catalog::{static_catalog, ModelCatalogEntry},
    provider::ResponseStream,
    CompletionRequest, ResponseEvent, Role,
};

/// How to send the API key in HTTP requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>` — standard for most providers.
    Bearer,
    /// `api-key: <key>` — Azure OpenAI style.
    ApiKeyHeader,
    /// No authentication header — local servers (Ollama, vLLM, LM Studio).
    None,
}

/// OpenAI-compatible chat completion provider.
///
/// Used as the implementation for every provider that speaks the standard
/// `/v1/chat/completions` SSE streaming wire format.
pub struct OpenAICompatProvider {
    /// Provider id returned by `ModelProvider::name()`.
    driver_name: &'static str,
    /// Model id forwarded to the API.
    model: String,
    /// API key (pre-resolved from config or env).
    api_key: Option<String>,
    /// Full chat completions URL, e.g. `https://api.groq.com/openai/v1/chat/completions`.
    chat_url: String,
    /// Full models list URL (optional).  `None` → fall back to static catalog.
    models_url: Option<String>,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
    /// Additional HTTP headers (e.g. `HTTP-Referer` for OpenRouter).
    extra_headers: Vec<(String, String)>,
    auth_style: AuthStyle,
    /// Extra key-value pairs merged verbatim into the request body.
    ///
    /// Populated from `ModelConfig.driver_options`.  Use this to pass
    /// provider-specific parameters that conduit does not model natively, e.g.:
    ///   • `parse_tool_calls: false` — disable llama.cpp grammar constraints
    ///     so the model can emit reasoning text alongside tool calls
    ///   • `reasoning_format: "deepseek"` — enable thinking extraction on
    ///     llama.cpp for reasoning-capable models (QwQ, DeepSeek-R1, Qwen3)
    extra_body: serde_json::Value,
}

impl OpenAICompatProvider {
    /// Construct a provider from its full endpoint URLs and auth configuration.
    ///
    /// # Parameters
    /// - `driver_name` — stable id from the registry (e.g. `"groq"`)
    /// - `model` — model identifier forwarded to the API
    /// - `api_key` — pre-resolved key (may be `None` for local servers)
    /// - `base_url` — API base that ends **before** `/chat/completions`, e.g.
    ///   `https://api.groq.com/openai/v1`
    /// - `max_tokens` — `None` uses the catalog default or 4096
    /// - `temperature` — `None` defaults to 0.2
    /// - `extra_headers` — additional `(name, value)` pairs sent on every request
    /// - `auth_style` — how the key is attached to requests
    /// - `extra_body` — JSON object merged verbatim into the request body
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        driver_name: &'static str,
        model: String,
        api_key: Option<String>,
        base_url: &str,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        extra_headers: Vec<(String, String)>,
        auth_style: AuthStyle,
        extra_body: serde_json::Value,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            driver_name,
            model,
            api_key,
            chat_url: format!("{base}/chat/completions"),
            models_url: Some(format!("{base}/models")),
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.2),
            client: reqwest::Client::new(),
            extra_headers,
            auth_style,
            extra_body,
        }
    }

    /// Construct a provider from a **pre-built** chat completions URL.
    ///
    /// Use this when the full URL cannot be derived by appending
    /// `/chat/completions` to a base — e.g. Azure OpenAI, which encodes the
    /// deployment name and API version as path/query segments:
    /// `https://<resource>.openai.azure.com/openai/deployments/<deployment>/chat/completions?api-version=…`
    ///
    /// No `/models` URL is configured; the static catalog is used for model
    /// discovery.
    #[allow(clippy::too_many_arguments)]
    pub fn with_full_chat_url(
        driver_name: &'static str,
        model: String,
        api_key: Option<String>,
        chat_url: impl Into<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        extra_headers: Vec<(String, String)>,
        auth_style: AuthStyle,
        extra_body: serde_json::Value,
    ) -> Self {
        Self {
            driver_name,
            model,
            api_key,
            chat_url: chat_url.into(),
            models_url: None,
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.2),
            client: reqwest::Client::new(),
            extra_headers,
            auth_style,
            extra_body,
        }
    }
}

#[async_trait]
impl crate::ModelProvider for OpenAICompatProvider {
    fn name(&self) -> &str {
        self.driver_name
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    /// List models via `GET /models`, enriched with static catalog metadata.
    /// Falls back to catalog-only when no API key is present or the endpoint
    /// is unavailable.
    async fn list_models(&self) -> anyhow::Result<Vec<ModelCatalogEntry>> {
        let catalog_entries: Vec<ModelCatalogEntry> = static_catalog()
            .into_iter()
            .filter(|e| e.provider == self.driver_name)
            .collect();

        let url = match &self.models_url {
            Some(u) => u.clone(),
            None => return Ok(catalog_entries),
        };

        let key = match &self.api_key {
            Some(k) => k.clone(),
            None => {
                // Local provider with no key — just return catalog.
                return Ok(catalog_entries);
            }
        };

        let mut req = self.client.get(&url);
        req = match self.auth_style {
            AuthStyle::Bearer => req.bearer_auth(&key),
            AuthStyle::ApiKeyHeader => req.header("api-key", &key),
            AuthStyle::None => req,
        };
        for (name, val) in &self.extra_headers {
            req = req.header(name.as_str(), val.as_str());
        }

        let resp = match req.send().await {
            Ok(r) => r,
            Err(_) => {
                // Network error (e.g. local server not running) – return catalog.
                return Ok(catalog_entries);
            }
        };

        if !resp.status().is_success() {
            // Non-critical – return static catalog.
            return Ok(catalog_entries);
        }

        let body: Value = match resp.json().await {
            Ok(v) => v,
            Err(_) => return Ok(catalog_entries),
        };

        let mut entries: Vec<ModelCatalogEntry> = Vec::new();
        if let Some(data) = body["data"].as_array() {
            for item in data {
                let id = match item["id"].as_str() {
                    Some(s) => s.to_string(),
                    None => continue,
                };
                // Enrich with static catalog if available.
                if let Some(cat) = catalog_entries.iter().find(|e| e.id == id) {
                    entries.push(cat.clone());
                } else {
                    entries.push(ModelCatalogEntry {
                        id: id.clone(),
                        name: id.clone(),
                        provider: self.driver_name.to_string(),
                        context_window: 0,
                        max_output_tokens: 0,
                        description: String::new(),
                        // Unknown model: conservative default (text only).
                        input_modalities: vec![crate::catalog::InputModality::Text],
                    });
                }
            }
        }

        if entries.is_empty() {
            return Ok(catalog_entries);
        }
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        // Merge dynamic suffix into the system message before serialization.
        // OpenAI has a single "system" message; there is no separate uncached
        // block concept, so we simply append the volatile context to the text.
        let messages: Vec<Value> = if let Some(suffix) = &req.system_dynamic_suffix {
            let mut msgs = req.messages.clone();
            if let Some(sys) = msgs.first_mut() {
                if sys.role == crate::Role::System {
                    use crate::MessageContent;
                    if let MessageContent::Text(t) = &sys.content {
                        let combined = format!("{t}\n\n{suffix}");
                        sys.content = MessageContent::Text(combined);
                    }
                }
            }
            build_openai_messages(&msgs)
        } else {
            build_openai_messages(&req.messages)
        };

        let tools: Vec<Value> = req.tools.iter().map(|t| json!({
            "type": "function",
            "function": {
                "name": t.name,
                "description": t.description,
                "parameters": t.parameters,
            }
        })).collect();

        // OpenAI's API now uses "max_completion_tokens" for newer models (gpt-5, o1, etc.)
        // Other providers still use "max_tokens"
        let max_tokens_key = if self.driver_name == "openai" {
            "max_completion_tokens"
        } else {
            "max_tokens"
        };
        
        // GPT-5 models only support temperature=1 (the default)
        // Reasoning models (o1, o3) don't support temperature parameter at all
        let use_temperature = if self.driver_name == "openai" {
            !(self.model.starts_with("o1-") 
                || self.model.starts_with("o3-")
                || self.model.starts_with("gpt-5"))
        } else {
            true
        };
        
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": req.stream,
            max_tokens_key: self.max_tokens,
            "stream_options": { "include_usage": true },
        });
        if use_temperature {
            body["temperature"] = json!(self.temperature);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        // OpenRouter supports a `prompt_cache_key` body field that pins all
        // requests sharing the same key to the same cached KV prefix.  Using
        // the session ID ensures every turn within a session benefits from the
        // cached system prompt + stable conversation prefix even across
        // requests that would otherwise be treated as independent by the
        // gateway.  Other providers that speak the same field (e.g. Venice)
        // also benefit automatically.
        if self.driver_name == "openrouter" {
            if let Some(key) = &req.cache_key {
                body["prompt_cache_key"] = json!(key);
            }
        }

        // Merge driver_options (extra_body) into the request.  Keys from the
        // user-supplied JSON object override anything conduit set above, so users
        // can fine-tune provider-specific behaviour without code changes:
        //
        //   • `parse_tool_calls: false`      – disable llama.cpp grammar so
        //                                      the model can emit reasoning
        //                                      text alongside tool calls
        //   • `reasoning_format: "deepseek"` – extract <think> → reasoning_content
        //   • any other provider-specific key that conduit doesn't model natively
        if let Some(map) = self.extra_body.as_object() {
            for (k, v) in map {
                body[k] = v.clone();
            }
        }

        debug!(
            driver = %self.driver_name,
            model = %self.model,
            tool_count = tools.len(),
            message_count = messages.len(),
            "sending completion request"
        );
        
        // Log full request body at trace level for debugging schema issues
        tracing::trace!(request_body = ?body, "full completion request");

        let mut http_req = self.client.post(&self.chat_url).json(&body);
        http_req = match self.auth_style {
            AuthStyle::Bearer => {
                let key = self.api_key.as_deref()
                    .context("API key not set; provide api_key or api_key_env in config")?;
                http_req.bearer_auth(key)
            }
            AuthStyle::ApiKeyHeader => {
                let key = self.api_key.as_deref()
                    .context("API key not set; provide api_key or api_key_env in config")?;
                http_req.header("api-key", key)
            }
            AuthStyle::None => http_req,
        };
        for (name, val) in &self.extra_headers {
            http_req = http_req.header(name.as_str(), val.as_str());
        }

        let resp = http_req.send().await
            .with_context(|| format!("{} request failed", self.driver_name))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("{} error {status}: {text}", self.driver_name);
        }

        let byte_stream = resp.bytes_stream();
        // SSE events can be split across multiple TCP packets.  Maintain a
        // line buffer across chunks; emit events only for complete lines.
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let events: Vec<anyhow::Result<ResponseEvent>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_sse_lines(buf)
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Parse a single complete SSE `data:` line into a [`ResponseEvent`].
///
/// Returns `None` for empty lines, comment lines, or unparseable data.
fn parse_sse_data_line(line: &str) -> Option<anyhow::Result<ResponseEvent>> {
    let data = line.strip_prefix("data: ")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(ResponseEvent::Done));
    }
    let v: Value = serde_json::from_str(data).ok()?;
    Some(parse_sse_chunk(&v))
}

/// Drain all complete `\n`-terminated SSE lines from `buf`.
///
/// Any trailing incomplete line (bytes not yet terminated by `\n`) is left
/// in `buf` so it can be extended by the next TCP chunk.  This is necessary
/// because a single SSE event may be split across multiple TCP packets.
pub(crate) fn drain_complete_sse_lines(buf: &mut String) -> Vec<anyhow::Result<ResponseEvent>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        // Strip the optional Windows-style \r before \n.
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        // Advance buffer past the consumed line including the \n.
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(ev) = parse_sse_data_line(&line) {
            events.push(ev);
        }
    }
    events
}

fn role_str(r: &Role) -> &'static str {
    match r {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn parse_sse_chunk(v: &Value) -> anyhow::Result<ResponseEvent> {
    // Usage-only chunk (emitted when stream_options.include_usage = true)
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        // OpenAI reports cached tokens in prompt_tokens_details.cached_tokens.
        // DeepSeek V3 reports them as prompt_cache_hit_tokens on the root
        // usage object.  We try OpenAI format first, then fall back to
        // DeepSeek's format so both providers are covered without extra
        // provider-specific dispatch.
        let cache_read_tokens = usage
            .get("prompt_tokens_details")
            .and_then(|d| d.get("cached_tokens"))
            .and_then(|t| t.as_u64())
            .or_else(|| usage.get("prompt_cache_hit_tokens").and_then(|t| t.as_u64()))
            .unwrap_or(0) as u32;
        return Ok(ResponseEvent::Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
            cache_read_tokens,
            cache_write_tokens: 0,
        });
    }

    // llama.cpp performance metrics (top-level `timings` object)
    // These arrive in the final SSE chunk with finish_reason=stop and provide
    // cache hit counts and generation speed that are incredibly useful for CI
    // debugging.  We convert them into a Usage event so the CI runner can emit
    // them as `[conduit:tokens]` trace output.
    if let Some(timings) = v.get("timings") {
        let cache_n = timings["cache_n"].as_u64().unwrap_or(0) as u32;
        let prompt_n = timings["prompt_n"].as_u64().unwrap_or(0) as u32;
        let predicted_n = timings["predicted_n"].as_u64().unwrap_or(0) as u32;

        // llama.cpp reports cache hits + fresh tokens separately; combine them
        // into input_tokens for consistency with standard Usage reporting.
        return Ok(ResponseEvent::Usage {
            input_tokens: cache_n + prompt_n,
            output_tokens: predicted_n,
            cache_read_tokens: cache_n,
            cache_write_tokens: 0,
        });
    }

    let choice = &v["choices"][0];

    // finish_reason=length means the model hit its output-token limit.
    // Emit MaxTokens so the agent knows any pending tool-call arguments
    // are truncated.  The [DONE] sentinel that follows will emit Done.
    if choice["finish_reason"].as_str() == Some("length") {
        return Ok(ResponseEvent::MaxTokens);
    }

    let delta = &choice["delta"];

    // Tool call delta — OpenAI may send multiple parallel tool calls in one
    // chunk, each identified by an "index" field.  We only emit the first
    // element here because each SSE chunk carries exactly one tool-call delta
    // in practice; the index routes accumulation in the agent.
    if let Some(tool_calls) = delta.get("tool_calls") {
        if let Some(tc) = tool_calls.get(0) {
            let index = tc["index"].as_u64().unwrap_or(0) as usize;
            let id = tc["id"].as_str().unwrap_or("").to_string();
            let name = tc["function"]["name"].as_str().unwrap_or("").to_string();
            let args = tc["function"]["arguments"].as_str().unwrap_or("").to_string();
            return Ok(ResponseEvent::ToolCall { index, id, name, arguments: args });
        }
    }

    // Thinking delta — two common field names for chain-of-thought reasoning:
    //   • `reasoning_content` — llama.cpp, Qwen3, DeepSeek-R1, xAI Grok-3-mini
    //   • `reasoning`         — OpenRouter (and some other aggregators)
    // Both carry the same semantics: readable CoT text that arrived before the
    // final answer.  Prefer `reasoning_content`; fall back to `reasoning`.
    let thinking_text = delta.get("reasoning_content").and_then(|c| c.as_str())
        .or_else(|| delta.get("reasoning").and_then(|c| c.as_str()));
    if let Some(thinking) = thinking_text {
        if !thinking.is_empty() {
            return Ok(ResponseEvent::ThinkingDelta(thinking.to_string()));
        }
    }

    // Text delta
    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
        return Ok(ResponseEvent::TextDelta(text.to_string()));
    }

    Ok(ResponseEvent::TextDelta(String::new()))
}

/// Convert a slice of [`Message`]s into the OpenAI wire-format JSON array.
///
/// Extracted as a free function so it can be unit-tested without making HTTP
/// requests.
///
/// **Parallel tool call coalescing**: OpenAI requires that all tool calls from
/// one assistant turn appear inside a *single* assistant message as a
/// `tool_calls` array.  Conduit stores each tool call as a separate
/// `MessageContent::ToolCall` entry internally (easier to work with), so this
/// function merges consecutive `ToolCall` messages into one JSON object before
/// sending them to the API.
pub(crate) fn build_openai_messages(messages: &[crate::Message]) -> Vec<Value> {
    use crate::{ContentPart, MessageContent, ToolContentPart, ToolResultContent};

    fn tool_call_to_json(tool_call_id: &str, function: &crate::FunctionCall) -> Value {
        json!({
            "id": tool_call_id,
            "type": "function",
            "function": {
                "name": function.name,
                "arguments": function.arguments,
            }
        })
    }

    fn tool_result_to_json(tool_call_id: &str, content: &ToolResultContent) -> Value {
        let wire_content: Value = match content {
            ToolResultContent::Text(t) => json!(t),
            ToolResultContent::Parts(parts) if !parts.is_empty() => {
                let arr: Vec<Value> = parts.iter().map(|p| match p {
                    ToolContentPart::Text { text } => json!({ "type": "text", "text": text }),
                    ToolContentPart::Image { image_url } => json!({
                        "type": "image_url",
                        "image_url": { "url": image_url },
                    }),
                }).collect();
                json!(arr)
            }
            ToolResultContent::Parts(_) => json!(""),
        };
        json!({ "role": "tool", "tool_call_id": tool_call_id, "content": wire_content })
    }

    let mut result: Vec<Value> = Vec::with_capacity(messages.len());
    let mut i = 0;

    while i < messages.len() {
        let m = &messages[i];

        // Merge consecutive ToolCall messages into one assistant message so
        // the wire format satisfies OpenAI's parallel-tool-call contract.
        if let MessageContent::ToolCall { tool_call_id, function } = &m.content {
            let mut calls = vec![tool_call_to_json(tool_call_id, function)];
            i += 1;
            while i < messages.len() {
                if let MessageContent::ToolCall { tool_call_id, function } = &messages[i].content {
                    calls.push(tool_call_to_json(tool_call_id, function));
                    i += 1;
                } else {
                    break;
                }
            }
            result.push(json!({ "role": "assistant", "tool_calls": calls }));
            continue;
        }

        let v = match &m.content {
            MessageContent::Text(t) => json!({
                "role": role_str(&m.role),
                "content": t,
            }),
            MessageContent::ContentParts(parts) if !parts.is_empty() => {
                let content: Vec<Value> = parts.iter().map(|p| match p {
                    ContentPart::Text { text } => json!({ "type": "text", "text": text }),
                    ContentPart::Image { image_url, detail } => {
                        let mut img_obj = json!({ "url": image_url });
                        if let Some(d) = detail {
                            img_obj["detail"] = json!(d);
                        }
                        json!({ "type": "image_url", "image_url": img_obj })
                    }
                }).collect();
                json!({ "role": role_str(&m.role), "content": content })
            }
            MessageContent::ContentParts(_) => {
                json!({ "role": role_str(&m.role), "content": "" })
            }
            MessageContent::ToolCall { .. } => unreachable!("handled above"),
            MessageContent::ToolResult { tool_call_id, content } => {
                tool_result_to_json(tool_call_id, content)
            }
        };
        result.push(v);
        i += 1;
    }

    result
}
