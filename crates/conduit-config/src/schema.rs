// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// Used for config fields that should be enabled unless the user explicitly
/// sets them to `false`.  `#[serde(default)]` on a `bool` always falls back
/// to `bool::default()` (i.e. `false`), so a named function is required.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Named provider configurations.
    ///
    /// Define custom endpoints, local models, or additional accounts here and
    /// reference them by name with `--model <key>` or `--model <key>/<model>`.
    ///
    /// ```yaml
    /// providers:
    ///   my_ollama:
    ///     provider: openai        # uses the OpenAI-compatible wire format
    ///     base_url: http://localhost:11434/v1
    ///     name: llama3.2          # default model for this provider
    ///   work_anthropic:
    ///     provider: anthropic
    ///     api_key_env: WORK_ANTHROPIC_KEY
    ///     name: claude-opus-4-5
    /// ```
    #[serde(default)]
    pub providers: std::collections::HashMap<String, ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier.  Run `conduit list-providers` for the full list.
    /// Common values: "openai" | "anthropic" | "google" | "azure" | "aws" |
    /// "groq" | "openrouter" | "ollama" | "mistral" | "deepseek" | "mock"
    pub provider: String,
    /// Model name forwarded to the provider API
    pub name: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files
    pub api_key: Option<String>,
    /// Base URL override.  Useful for local proxies, LiteLLM, or Cloudflare.
    /// For most hosted providers the correct default is auto-selected.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0)
    pub temperature: Option<f32>,

    // ── Azure OpenAI ─────────────────────────────────────────────────────────
    /// Azure resource name (the subdomain of `.openai.azure.com`).
    /// Required when provider = "azure" and base_url is not set.
    pub azure_resource: Option<String>,
    /// Azure deployment name.  Defaults to `model.name` when not set.
    pub azure_deployment: Option<String>,
    /// Azure REST API version string, e.g. `"2024-02-01"`.
    pub azure_api_version: Option<String>,

    // ── AWS Bedrock ───────────────────────────────────────────────────────────
    /// AWS region override (also honoured via AWS_DEFAULT_REGION env var).
    pub aws_region: Option<String>,

    // ── Prompt caching ────────────────────────────────────────────────────────
    /// Attach an explicit cache-control marker to the system message.
    ///
    /// **Anthropic**: adds `"cache_control": {"type": "ephemeral"}` to the
    /// system block, which tells the API to cache the prefix up to and
    /// including that block.  Anthropic charges a one-time write fee and
    /// subsequent calls save ~90% on cached input tokens.
    ///
    /// **Other providers**: OpenAI and Google cache automatically; this flag
    /// has no effect for those providers.
    #[serde(default = "default_true")]
    pub cache_system_prompt: bool,

    /// Use the extended (1-hour) cache TTL instead of the default 5-minute
    /// window.  Applies to the system prompt (when `cache_system_prompt = true`)
    /// and to tool definitions (when `cache_tools = true`).  Only meaningful
    /// for the Anthropic provider.  Sends the
    /// `anthropic-beta: extended-cache-ttl-2025-04-11` header automatically.
    ///
    /// Conversation caching (`cache_conversation`) always uses the 5-minute
    /// TTL regardless of this setting, because conversation turns are
    /// typically frequent enough to keep the cache refreshed within 5 minutes.
    #[serde(default)]
    pub extended_cache_time: bool,

    /// Cache tool definitions using Anthropic prompt caching.
    ///
    /// Tool definitions are stable across requests within a session, making
    /// them ideal for caching.  The last tool in the list receives a
    /// `cache_control` marker so Anthropic caches all tool definitions as a
    /// prefix.  Uses the same TTL as `extended_cache_time` controls (1-hour
    /// when true, 5-minute otherwise).
    ///
    /// With many tools (each ~200-500 tokens), this can save thousands of
    /// tokens per request.
    #[serde(default = "default_true")]
    pub cache_tools: bool,

    /// Enable automatic conversation caching (Anthropic only).
    ///
    /// Adds a top-level `cache_control` marker that instructs Anthropic to
    /// automatically cache conversation history up to the last message.
    /// Subsequent turns read prior context from cache at 10% of the base
    /// token cost, dramatically reducing cost for multi-turn sessions.
    ///
    /// The cache breakpoint automatically advances with each new turn so no
    /// manual management is needed.
    #[serde(default = "default_true")]
    pub cache_conversation: bool,

    /// Cache image content blocks in conversation history (Anthropic only).
    ///
    /// Images are token-expensive: even a modest screenshot costs hundreds of
    /// input tokens every turn it remains in context.  Marking the oldest image
    /// blocks with `cache_control` preserves them across turns, saving ~90% on
    /// those tokens for the rest of the session.
    ///
    /// Uses the same TTL tier as `extended_cache_time` controls.  The number
    /// of cached images is bounded by the remaining Anthropic breakpoint budget
    /// (maximum 4 breakpoints total across system, tools, conversation, and
    /// images/tool-results).
    #[serde(default = "default_true")]
    pub cache_images: bool,

    /// Cache large tool results in conversation history (Anthropic only).
    ///
    /// When a tool-call loop reads files, runs commands, or fetches documents,
    /// those tool results can consume thousands of tokens on every subsequent
    /// turn. Marking them with `cache_control` once saves ~90% on those
    /// tokens for all following turns.
    ///
    /// A result is eligible when its serialised content exceeds 4 096
    /// characters (~1 024 tokens, the Anthropic minimum cacheable length for
    /// Sonnet-class models).  The oldest eligible results are cached first;
    /// the count is bounded by the remaining breakpoint budget.
    ///
    /// Uses the same TTL tier as `extended_cache_time` controls.
    #[serde(default = "default_true")]
    pub cache_tool_results: bool,

    // ── Provider-specific extras ──────────────────────────────────────────────
    /// Free-form provider-specific options forwarded as-is to the driver.
    /// Useful for headers or parameters not covered by the standard fields.
    #[serde(default)]
    pub driver_options: serde_json::Value,

    // ── Mock provider ─────────────────────────────────────────────────────────
    /// Path to YAML mock-responses file (used when provider = "mock").
    /// Can also be set via the CONDUIT_MOCK_RESPONSES environment variable.
    pub mock_responses_file: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            name: "gpt-4o".into(),
            // api_key_env is intentionally None here.  resolve_api_key() falls
            // through to the driver registry, which already knows the canonical
            // env-var name for each provider (OPENAI_API_KEY, ANTHROPIC_API_KEY,
            // etc.).  Hard-coding it here would shadow the registry lookup and
            // cause the wrong key to be sent whenever a caller overrides the
            // provider per-request.
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_tokens: Some(4096),
            temperature: Some(0.2),
            azure_resource: None,
            azure_deployment: None,
            azure_api_version: None,
            aws_region: None,
            // Comprehensive caching is on by default for every provider that
            // supports it (currently Anthropic).  The flags are no-ops for
            // providers such as OpenAI that cache automatically.  Only the
            // extended (1-hour) TTL remains opt-in because it carries a 2×
            // write cost that is only worthwhile when turns are >5 min apart.
            cache_system_prompt: true,
            extended_cache_time: false,
            cache_tools: true,
            cache_conversation: true,
            cache_images: true,
            cache_tool_results: true,
            driver_options: serde_json::Value::Null,
            mock_responses_file: None,
        }
    }
}

fn default_max_tool_hops() -> u32 {
    200
}

/// Runtime knobs for the orchestration layer (pipeline, batch engine, tool loop).
///
/// Distinct from `ModelConfig`, which describes *which* provider/model to call;
/// this describes *how* calls are run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Maximum number of tool-call round-trips before a single request
    /// surfaces `ToolLoopExhausted` instead of looping forever.
    #[serde(default = "default_max_tool_hops")]
    pub max_tool_hops: u32,
    /// Dispatch tool calls within one turn concurrently when the registry
    /// marks them safe to do so. When false, tools always run serially.
    #[serde(default = "default_true")]
    pub parallel_tool_calls: bool,
    /// Upper bound on concurrent in-flight requests for a batch call when the
    /// caller does not supply an explicit `max_concurrent`.
    #[serde(default = "default_batch_concurrency")]
    pub default_batch_concurrency: usize,
    /// Namespace used to partition cache entries and stored sessions when the
    /// caller does not supply an explicit project name.
    #[serde(default = "default_project_name")]
    pub project_name: String,
}

fn default_batch_concurrency() -> usize {
    8
}

fn default_project_name() -> String {
    "default".into()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_tool_hops: default_max_tool_hops(),
            parallel_tool_calls: true,
            default_batch_concurrency: default_batch_concurrency(),
            project_name: default_project_name(),
        }
    }
}

/// Connection settings for the cache/repository backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database URL for the response cache and conversation repository.
    /// Accepts a `postgres://` URL, or a `sqlite://` URL for local/test use.
    /// When unset, callers must supply pre-constructed handles explicitly.
    pub database_url: Option<String>,
    /// Maximum number of pooled connections.
    #[serde(default = "default_pool_size")]
    pub max_connections: u32,
}

fn default_pool_size() -> u32 {
    5
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: default_pool_size(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
