// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use conduit_model::{FunctionCall, Message, MessageContent, Role};
use conduit_tools::{ToolCall, ToolOutput, ToolRegistry};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::dto::{ConduitOptionsSnapshot, GenerationParams, GenerationRequest, GenerationResponse, StopReason};
use crate::error::ConduitError;
use crate::pipeline::Pipeline;
use crate::session::{Conversation, Session};

/// Drives the three-phase tool round of §4.11, grounded in the teacher's
/// `Agent::run_agentic_loop_cancellable`: (1) push assistant tool-call
/// messages, (2) dispatch each tool invocation — concurrently via
/// `tokio::spawn` when `parallel_tool_calls` is set and every tool in this
/// round is registry-declared thread-safe, otherwise serialized — turning a
/// panicked task into an error `ToolOutput` rather than propagating it, (3)
/// push the tool-result messages back in original call order. Re-enters the
/// Pipeline after every round until a terminal `stop_reason` or
/// `max_tool_hops` is reached.
pub async fn run_tool_loop(
    pipeline: &Pipeline,
    registry: &Arc<ToolRegistry>,
    mut params: GenerationParams,
    session: &mut Session,
    conversation: &mut Conversation,
    options: &ConduitOptionsSnapshot,
    cancel: &CancellationToken,
) -> Result<GenerationResponse, ConduitError> {
    let mut hops: u32 = 0;
    loop {
        let req = GenerationRequest {
            messages: conversation.messages.iter().map(|m| m.message.clone()).collect(),
            params: params.clone(),
            options: options.clone(),
        };
        let response = pipeline.run(req, session, conversation, cancel).await?;

        if response.metadata.stop_reason != StopReason::ToolCalls {
            return Ok(response);
        }

        hops += 1;
        if hops > options.max_tool_hops {
            return Err(ConduitError::ToolLoopExhausted(options.max_tool_hops));
        }

        // Phase 1: push one ToolCall message per requested call.
        let mut calls = Vec::with_capacity(response.tool_calls.len());
        for tc in &response.tool_calls {
            conversation.add(
                session,
                Message {
                    role: Role::Assistant,
                    content: MessageContent::ToolCall {
                        tool_call_id: tc.id.clone(),
                        function: FunctionCall { name: tc.name.clone(), arguments: tc.arguments.clone() },
                    },
                },
            )?;
            let args: serde_json::Value =
                serde_json::from_str(&tc.arguments).unwrap_or(serde_json::Value::Null);
            calls.push(ToolCall { id: tc.id.clone(), name: tc.name.clone(), args });
        }

        // Phase 2: dispatch.
        let parallel_ok = options.parallel_tool_calls
            && registry.all_concurrent_safe(calls.iter().map(|c| c.name.as_str()));
        let outputs: Vec<ToolOutput> = if parallel_ok {
            let mut tasks = Vec::with_capacity(calls.len());
            for call in calls.clone() {
                let registry = Arc::clone(registry);
                tasks.push(tokio::spawn(async move { registry.execute(&call).await }));
            }
            let mut outputs = Vec::with_capacity(tasks.len());
            for (i, task) in tasks.into_iter().enumerate() {
                let out = match task.await {
                    Ok(o) => o,
                    Err(e) => {
                        warn!(call_id = %calls[i].id, error = %e, "tool task panicked");
                        ToolOutput::err(&calls[i].id, format!("tool execution panicked: {e}"))
                    }
                };
                outputs.push(out);
            }
            outputs
        } else {
            let mut outputs = Vec::with_capacity(calls.len());
            for call in &calls {
                outputs.push(registry.execute(call).await);
            }
            outputs
        };

        // Phase 3: push tool-result messages in original call order.
        for (call, output) in calls.iter().zip(outputs.iter()) {
            let msg = if output.has_images() {
                use conduit_model::ToolContentPart;
                let parts: Vec<ToolContentPart> = output
                    .parts
                    .iter()
                    .map(|p| match p {
                        conduit_tools::ToolOutputPart::Text(t) => ToolContentPart::Text { text: t.clone() },
                        conduit_tools::ToolOutputPart::Image(url) => ToolContentPart::Image { image_url: url.clone() },
                    })
                    .collect();
                Message::tool_result_with_parts(&call.id, parts)
            } else {
                Message::tool_result(&call.id, &output.content)
            };
            conversation.add(session, msg)?;
        }

        params = params.clone();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
