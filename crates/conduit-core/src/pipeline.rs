// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;
use std::time::Instant;

use conduit_model::{CompletionRequest, Message, ModelProvider, ResponseEvent};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::cache_key::cache_key;
use crate::dto::{ConduitOptions, GenerationRequest, GenerationResponse, OdometerEvent, ResponseMetadata, StopReason};
use crate::error::ConduitError;
use crate::odometer::record;
use crate::session::{Conversation, Session};

/// Runs one `GenerationRequest` through prepare → cache-probe → dispatch →
/// post-process → persist, per §4.9. A `Pipeline` is cheap to construct —
/// it borrows nothing and holds only the provider and options for this call.
pub struct Pipeline {
    provider: Arc<dyn ModelProvider>,
    provider_id: String,
    options: ConduitOptions,
}

impl Pipeline {
    pub fn new(provider: Arc<dyn ModelProvider>, provider_id: impl Into<String>, options: ConduitOptions) -> Self {
        Self { provider, provider_id: provider_id.into(), options }
    }

    /// Execute the pipeline for one request. `session`/`conversation` are
    /// mutated in place on success (the user and assistant messages are
    /// appended) when `options.repository` is set — persistence always
    /// appends the initiating user message regardless of whether history was
    /// included in the prompt (§9 open-question decision).
    #[instrument(skip(self, session, conversation, cancel), fields(model = %req.params.model, project = %self.options.project_name))]
    pub async fn run(
        &self,
        req: GenerationRequest,
        session: &mut Session,
        conversation: &mut Conversation,
        cancel: &CancellationToken,
    ) -> Result<GenerationResponse, ConduitError> {
        if cancel.is_cancelled() {
            return Err(ConduitError::Cancelled);
        }

        // 1. Prepare: a user message must exist at the tail.
        if !matches!(req.messages.last(), Some(m) if m.role == conduit_model::Role::User) {
            return Err(ConduitError::ValidationError(
                "GenerationRequest must end in a user message".into(),
            ));
        }
        if let Some(t) = req.params.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(ConduitError::ValidationError(format!(
                    "temperature {t} out of the supported [0, 2] range"
                )));
            }
        }

        let key = cache_key(&req, &self.provider_id);

        // 2. Cache probe.
        let start = Instant::now();
        if let Some(cache) = &self.options.cache {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ConduitError::Cancelled),
                hit = cache.get(&key) => {
                    if let Ok(Some(mut resp)) = hit {
                        debug!(cache_key = %key, "cache hit");
                        resp.metadata.cache_hit = true;
                        resp.metadata.duration_ms = start.elapsed().as_millis() as u64;
                        return Ok(resp);
                    }
                }
            }
        }

        // 3. Dispatch.
        let completion_req = CompletionRequest {
            messages: req.messages.clone(),
            tools: Vec::new(),
            stream: false,
            system_dynamic_suffix: None,
        };
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Err(ConduitError::Cancelled),
            res = self.provider.complete(completion_req) => classify(res)?,
        };

        // 4. Collect (streaming callers should iterate the raw adapter
        // instead of going through Pipeline::run; this call always returns a
        // completed response).
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ConduitError::Cancelled),
            collected = collect(stream) => collected?,
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let metadata = ResponseMetadata {
            duration_ms,
            model_slug: req.params.model.clone(),
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
            stop_reason: response.stop_reason,
            cache_hit: false,
        };
        let mut generation_response = GenerationResponse {
            message: response.message,
            metadata,
            tool_calls: response.tool_calls,
            parsed: None,
        };

        // 5. Post-process: validate structured output, then update the
        // odometer. Validation precedes persistence so a schema mismatch
        // never gets cached or saved.
        if req.params.output_type == crate::dto::OutputType::StructuredResponse {
            if let Some(schema) = &req.params.response_schema {
                generation_response.parsed = Some(validate_structured_output(&generation_response.message, schema)?);
            }
        }
        record(OdometerEvent {
            provider: self.provider_id.clone(),
            model: req.params.model.clone(),
            input_tokens: generation_response.metadata.input_tokens,
            output_tokens: generation_response.metadata.output_tokens,
            timestamp_ms: generation_response.metadata.duration_ms as i64,
        });

        // 6. Persist. A `ToolCalls` stop reason is an intermediate step — the
        // tool-call loop owns appending the tool-call/tool-result messages
        // for that round and re-enters the pipeline for the next hop, so only
        // a terminal turn is persisted here. The initiating user message is
        // always appended when persistence is on, regardless of whether
        // history was included in the prompt (§9 open-question decision).
        if generation_response.metadata.stop_reason != StopReason::ToolCalls
            && (self.options.repository.is_some() || self.options.cache.is_some())
        {
            conversation
                .add(session, req.messages.last().cloned().expect("validated above"))
                .ok(); // a duplicate append (same content re-submitted) is not fatal
            conversation.add(session, generation_response.message.clone())?;
        }
        if generation_response.metadata.stop_reason != StopReason::ToolCalls {
            if let Some(repo) = &self.options.repository {
                if let Err(e) = repo.save(session, None).await {
                    warn!(error = %e, "failed to persist session after successful generation");
                }
            }
            if let Some(cache) = &self.options.cache {
                if let Err(e) = cache.set(&key, &generation_response).await {
                    warn!(error = %e, "failed to write cache entry");
                }
            }
        }

        generation_response.metadata.duration_ms = duration_ms;
        Ok(generation_response)
    }
}

/// Minimal internal collected-response shape used while draining a
/// `ResponseStream` into one `GenerationResponse`.
struct Collected {
    message: Message,
    usage: conduit_model::Usage,
    stop_reason: StopReason,
    tool_calls: Vec<crate::dto::ToolCallRequest>,
}

fn classify(res: anyhow::Result<conduit_model::ResponseStream>) -> Result<conduit_model::ResponseStream, ConduitError> {
    res.map_err(classify_adapter_error)
}

/// Validate `message`'s text content as JSON against `schema`, returning the
/// parsed value on success. An adapter that already populated structured
/// content directly would short-circuit this in step 4; none of the current
/// adapters do, so every `StructuredResponse` call is validated here.
fn validate_structured_output(message: &Message, schema: &serde_json::Value) -> Result<serde_json::Value, ConduitError> {
    let text = message.as_text().ok_or_else(|| {
        ConduitError::SchemaMismatch("structured response content is not plain text".into())
    })?;
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| ConduitError::SchemaMismatch(format!("response is not valid JSON: {e}")))?;
    let compiled = jsonschema::validator_for(schema)
        .map_err(|e| ConduitError::SchemaMismatch(format!("invalid response_schema: {e}")))?;
    if let Err(e) = compiled.validate(&value) {
        return Err(ConduitError::SchemaMismatch(e.to_string()));
    }
    Ok(value)
}

/// Turns an adapter's `anyhow::Error` into the right `ConduitError` variant
/// by inspecting its message, mirroring the teacher's
/// `extract_n_ctx_from_error` text-sniffing approach for distinguishing a
/// context-overflow failure from a generic one.
pub fn classify_adapter_error(err: anyhow::Error) -> ConduitError {
    let text = err.to_string();
    let lower = text.to_lowercase();
    if lower.contains("401") || lower.contains("unauthorized") || lower.contains("invalid api key") {
        ConduitError::AuthError(text)
    } else if lower.contains("429") || lower.contains("rate limit") {
        ConduitError::RateLimited { retry_after: None, attempt: 1 }
    } else if lower.contains("context") && (lower.contains("too long") || lower.contains("too large") || lower.contains("maximum context")) {
        ConduitError::ContextTooLarge { tokens: 0, window: 0 }
    } else if lower.contains("timed out") || lower.contains("timeout") {
        ConduitError::Timeout(std::time::Duration::from_secs(60))
    } else if lower.contains("connection") || lower.contains("network") || lower.contains("dns") {
        ConduitError::NetworkError(text)
    } else if lower.contains("5") && (lower.contains("server error") || lower.contains("bad gateway") || lower.contains("unavailable")) {
        ConduitError::UpstreamUnavailable(text)
    } else {
        ConduitError::BadRequest(text)
    }
}

async fn collect(mut stream: conduit_model::ResponseStream) -> Result<Collected, ConduitError> {
    let mut text = String::new();
    let mut tool_calls: Vec<crate::dto::ToolCallRequest> = Vec::new();
    let mut usage = conduit_model::Usage::default();
    let mut had_error = None;

    while let Some(event) = stream.next().await {
        match event.map_err(classify_adapter_error)? {
            ResponseEvent::TextDelta(d) => text.push_str(&d),
            ResponseEvent::ThinkingDelta(_) => {}
            ResponseEvent::ToolCall { id, name, arguments, .. } => {
                tool_calls.push(crate::dto::ToolCallRequest { id, name, arguments });
            }
            ResponseEvent::Usage { input_tokens, output_tokens, .. } => {
                usage.input_tokens = input_tokens;
                usage.output_tokens = output_tokens;
            }
            ResponseEvent::Done => break,
            ResponseEvent::Error(e) => had_error = Some(e),
        }
    }
    if let Some(e) = had_error {
        if text.is_empty() && tool_calls.is_empty() {
            return Err(ConduitError::UpstreamUnavailable(e));
        }
    }

    let (message, stop_reason) = if !tool_calls.is_empty() {
        // The first call is carried on `message` for callers that only look
        // at the single-message shape; the full set lives on `tool_calls` —
        // the tool-call loop is the one that iterates all of them.
        let first = &tool_calls[0];
        (
            Message {
                role: conduit_model::Role::Assistant,
                content: conduit_model::MessageContent::ToolCall {
                    tool_call_id: first.id.clone(),
                    function: conduit_model::FunctionCall {
                        name: first.name.clone(),
                        arguments: first.arguments.clone(),
                    },
                },
            },
            StopReason::ToolCalls,
        )
    } else {
        (Message::assistant(text), StopReason::Stop)
    };

    Ok(Collected { message, usage, stop_reason, tool_calls })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
