// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use conduit_model::Message;
use conduit_tools::ToolRegistry;
use serde::{Deserialize, Serialize};

/// What shape of output the caller wants back from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    #[default]
    Text,
    Image,
    Audio,
    Transcription,
    StructuredResponse,
}

/// Sampling and shape parameters for one generation call.
#[derive(Debug, Clone, Default)]
pub struct GenerationParams {
    pub model: String,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    /// JSON Schema the response must validate against, when `output_type ==
    /// StructuredResponse`.
    pub response_schema: Option<serde_json::Value>,
    pub output_type: OutputType,
    pub stream: bool,
    pub client_params: Option<serde_json::Value>,
    pub system: Option<String>,
}

/// How to run the call, as opposed to what to generate.
#[derive(Clone)]
pub struct ConduitOptions {
    pub project_name: String,
    pub cache: Option<Arc<dyn crate::CacheHandle>>,
    pub repository: Option<Arc<dyn crate::RepositoryHandle>>,
    pub verbosity: Verbosity,
    pub tool_registry: Option<Arc<ToolRegistry>>,
    pub parallel_tool_calls: bool,
    pub max_tool_hops: u32,
    /// Attach `raw_response` to surfaced errors. Off by default — keeps the
    /// common error path small.
    pub debug_payload: bool,
}

impl Default for ConduitOptions {
    fn default() -> Self {
        Self {
            project_name: "default".to_string(),
            cache: None,
            repository: None,
            verbosity: Verbosity::Normal,
            tool_registry: None,
            parallel_tool_calls: true,
            max_tool_hops: 200,
            debug_payload: false,
        }
    }
}

impl std::fmt::Debug for ConduitOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConduitOptions")
            .field("project_name", &self.project_name)
            .field("has_cache", &self.cache.is_some())
            .field("has_repository", &self.repository.is_some())
            .field("verbosity", &self.verbosity)
            .field("parallel_tool_calls", &self.parallel_tool_calls)
            .field("max_tool_hops", &self.max_tool_hops)
            .field("debug_payload", &self.debug_payload)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Silent,
    Normal,
    Debug,
}

/// A single outbound generation request. Constructed by the caller, consumed
/// once by the Pipeline, then dropped.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub messages: Vec<Message>,
    pub params: GenerationParams,
    pub options: ConduitOptionsSnapshot,
}

/// Cheaply-cloneable, hashable snapshot of the bits of `ConduitOptions` that
/// affect the cache key or need to travel with a cloned request. The handles
/// themselves (cache/repository/tool_registry) stay in the live
/// `ConduitOptions` the caller holds — a `GenerationRequest` is serializable
/// and the handles are not.
#[derive(Debug, Clone)]
pub struct ConduitOptionsSnapshot {
    pub project_name: String,
    pub parallel_tool_calls: bool,
    pub max_tool_hops: u32,
}

impl From<&ConduitOptions> for ConduitOptionsSnapshot {
    fn from(o: &ConduitOptions) -> Self {
        Self {
            project_name: o.project_name.clone(),
            parallel_tool_calls: o.parallel_tool_calls,
            max_tool_hops: o.max_tool_hops,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub duration_ms: u64,
    pub model_slug: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub stop_reason: StopReason,
    pub cache_hit: bool,
}

/// One pending tool invocation requested by the model, carried on a
/// `GenerationResponse` when `metadata.stop_reason == ToolCalls`. A single
/// turn may request several of these — the tool-call loop (§4.11) dispatches
/// them together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// JSON-encoded argument object, as received from the provider.
    pub arguments: String,
}

/// The normalized reply to a `GenerationRequest`. Serializable so
/// `conduit-cache` can store one as an opaque JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub message: Message,
    pub metadata: ResponseMetadata,
    /// Populated only when `metadata.stop_reason == ToolCalls`.
    pub tool_calls: Vec<ToolCallRequest>,
    /// Set when `params.output_type == StructuredResponse` and `content`
    /// validated against `params.response_schema`. Lives here rather than on
    /// `Message` because `Message` is the shared wire type every provider
    /// adapter constructs directly; this is orchestration metadata the
    /// Pipeline's post-process step adds on top, the same way it adds
    /// `metadata`.
    pub parsed: Option<serde_json::Value>,
}

/// One usage event fed to the process-wide odometer sink by the Pipeline's
/// post-process step.
#[derive(Debug, Clone)]
pub struct OdometerEvent {
    pub provider: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub timestamp_ms: i64,
}

/// Per-provider custom configuration keyed by provider id, as accepted by
/// `resolve_model_from_config` (§4.1.1) ahead of catalog lookup.
pub type CustomProviders = HashMap<String, conduit_config::ModelConfig>;

// ─── Unit tests ──────────────────────────────────────────────────────────────
