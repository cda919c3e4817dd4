// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The programmatic surface (§6): `query`, `batch`, `tokenize`, plus direct
//! access to the Conversation/Session types for callers that want to manage
//! history themselves. Wires together `conduit-config` (layered YAML
//! config), `conduit-model` (provider adapters + catalog), `conduit-core`
//! (Session/Pipeline/tool loop/error taxonomy), `conduit-stream` (raw
//! streaming chunk parsing), `conduit-cache`/`conduit-repo` (the pluggable
//! Postgres/SQLite backends) and `conduit-batch` (bounded-concurrency
//! batch dispatch). There is no CLI or TUI front-end here — this crate is a
//! library only.
use std::sync::Arc;

use conduit_batch::{BatchEngine, BatchItem};
use conduit_core::{
    run_tool_loop, ConduitError, ConduitOptions, ConduitOptionsSnapshot, Conversation,
    GenerationParams, GenerationRequest, GenerationResponse, Pipeline, Session,
};
use conduit_model::{Message, ModelProvider, ResponseStream};
use conduit_tools::ToolRegistry;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub use conduit_batch::BatchOutcome;
pub use conduit_config::Config;
pub use conduit_core::{CacheHandle, RepositoryHandle, SessionSummary, Verbosity};
pub use conduit_model::CompletionRequest;

/// What `query` hands back: either a fully collected response, or — when
/// `params.stream` was requested — the provider's raw event stream for the
/// caller to iterate directly (the single-shot Pipeline always collects;
/// see `conduit_core::pipeline` for why streaming bypasses it).
pub enum QueryOutcome {
    Response(GenerationResponse),
    Stream(ResponseStream),
}

/// What `tokenize` accepts: a raw prompt string, or a full message history.
pub enum TokenizePayload {
    Text(String),
    Messages(Vec<Message>),
}

impl From<&str> for TokenizePayload {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for TokenizePayload {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Vec<Message>> for TokenizePayload {
    fn from(messages: Vec<Message>) -> Self {
        Self::Messages(messages)
    }
}

/// The top-level runtime handle. Construct with [`Conduit::from_config`],
/// optionally attach a storage backend with
/// [`Conduit::with_storage`], then call [`Conduit::query`] / [`Conduit::batch`].
pub struct Conduit {
    config: Config,
    provider: Arc<dyn ModelProvider>,
    pipeline: Arc<Pipeline>,
    tool_registry: Arc<ToolRegistry>,
}

impl Conduit {
    /// Build a runtime from a resolved [`Config`]. Does not touch storage —
    /// call [`Conduit::with_storage`] afterwards to attach a cache and
    /// conversation repository from `config.storage.database_url`.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        Self::with_tool_registry(config, ToolRegistry::new())
    }

    /// Like [`Conduit::from_config`], but with an application-supplied tool
    /// registry wired into every `query`/`batch` call's tool-call loop.
    pub fn with_tool_registry(config: Config, registry: ToolRegistry) -> anyhow::Result<Self> {
        let provider: Arc<dyn ModelProvider> = Arc::from(conduit_model::from_config(&config.model)?);
        let tool_registry = Arc::new(registry);
        let options = ConduitOptions {
            project_name: config.runtime.project_name.clone(),
            parallel_tool_calls: config.runtime.parallel_tool_calls,
            max_tool_hops: config.runtime.max_tool_hops,
            tool_registry: Some(Arc::clone(&tool_registry)),
            ..ConduitOptions::default()
        };
        let pipeline = Arc::new(Pipeline::new(Arc::clone(&provider), config.model.provider.clone(), options));
        Ok(Self { config, provider, pipeline, tool_registry })
    }

    /// Connect `config.storage.database_url` (if set) and rebuild the
    /// internal Pipeline with a cache and conversation repository attached.
    /// A no-op when `database_url` is unset.
    pub async fn with_storage(mut self) -> anyhow::Result<Self> {
        let Some(url) = self.config.storage.database_url.clone() else { return Ok(self) };
        let max_connections = self.config.storage.max_connections;
        let project_name = self.config.runtime.project_name.clone();

        let cache = conduit_cache::ResponseCache::connect(&url, max_connections, project_name.clone()).await?;
        let repo = conduit_repo::ConversationRepository::connect(&url, max_connections, project_name.clone()).await?;

        let options = ConduitOptions {
            project_name,
            parallel_tool_calls: self.config.runtime.parallel_tool_calls,
            max_tool_hops: self.config.runtime.max_tool_hops,
            tool_registry: Some(Arc::clone(&self.tool_registry)),
            cache: Some(Arc::new(cache)),
            repository: Some(Arc::new(repo)),
            ..ConduitOptions::default()
        };
        self.pipeline = Arc::new(Pipeline::new(
            Arc::clone(&self.provider),
            self.config.model.provider.clone(),
            options,
        ));
        Ok(self)
    }

    fn snapshot(&self) -> ConduitOptionsSnapshot {
        ConduitOptionsSnapshot {
            project_name: self.config.runtime.project_name.clone(),
            parallel_tool_calls: self.config.runtime.parallel_tool_calls,
            max_tool_hops: self.config.runtime.max_tool_hops,
        }
    }

    /// Run one turn: append `input` as a user message to a fresh
    /// Session/Conversation, then drive the tool-call loop until a terminal
    /// `stop_reason` or `max_tool_hops` is hit. When `params.stream` is set,
    /// the Pipeline is bypassed and the provider's raw event stream is
    /// returned directly (the tool-call loop only applies to collected
    /// responses).
    pub async fn query(
        &self,
        input: impl Into<String>,
        params: Option<GenerationParams>,
    ) -> Result<QueryOutcome, ConduitError> {
        let params = params.unwrap_or_else(|| GenerationParams {
            model: self.config.model.name.clone(),
            ..GenerationParams::default()
        });

        let mut session = Session::new();
        let mut conversation = Conversation { session_id: session.id, messages: Vec::new() };
        conversation.add(&mut session, Message::user(input.into()))?;

        if params.stream {
            let req = CompletionRequest {
                messages: conversation.messages.iter().map(|m| m.message.clone()).collect(),
                tools: Vec::new(),
                stream: true,
                system_dynamic_suffix: None,
            };
            let stream = self
                .provider
                .complete(req)
                .await
                .map_err(conduit_core::classify_adapter_error)?;
            return Ok(QueryOutcome::Stream(stream));
        }

        let cancel = CancellationToken::new();
        let response = run_tool_loop(
            &self.pipeline,
            &self.tool_registry,
            params,
            &mut session,
            &mut conversation,
            &self.snapshot(),
            &cancel,
        )
        .await?;
        Ok(QueryOutcome::Response(response))
    }

    /// Run `inputs` through independent, isolated single-shot pipelines
    /// (no tool-call loop — batch items are meant for bulk one-shot
    /// generation) with at most `max_concurrent` in flight, in input order.
    pub async fn batch(
        &self,
        inputs: Vec<String>,
        params: Option<GenerationParams>,
        max_concurrent: Option<usize>,
    ) -> Vec<Result<GenerationResponse, ConduitError>> {
        let base_params = params.unwrap_or_else(|| GenerationParams {
            model: self.config.model.name.clone(),
            ..GenerationParams::default()
        });
        let snapshot = self.snapshot();

        let items: Vec<BatchItem> = inputs
            .into_iter()
            .map(|text| {
                let mut session = Session::new();
                let mut conversation = Conversation { session_id: session.id, messages: Vec::new() };
                if let Err(e) = conversation.add(&mut session, Message::user(text)) {
                    warn!(error = %e, "failed to seed batch item conversation");
                }
                let request = GenerationRequest {
                    messages: conversation.messages.iter().map(|m| m.message.clone()).collect(),
                    params: base_params.clone(),
                    options: snapshot.clone(),
                };
                BatchItem::new(request, session, conversation)
            })
            .collect();

        let engine = BatchEngine::new(Arc::clone(&self.pipeline));
        engine
            .run(items, max_concurrent, CancellationToken::new())
            .await
            .into_iter()
            .map(|outcome| outcome.response)
            .collect()
    }

    /// Approximate token count for `payload` (char-count heuristic, per
    /// `Message::approx_tokens`). `model` is accepted for forward
    /// compatibility with provider-specific tokenizers but unused today.
    pub fn tokenize(&self, _model: &str, payload: impl Into<TokenizePayload>) -> usize {
        match payload.into() {
            TokenizePayload::Text(t) => Message::user(t).approx_tokens(),
            TokenizePayload::Messages(messages) => messages.iter().map(Message::approx_tokens).sum(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
