// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim)
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments
    pub args: Value,
}

/// A single content item in a rich tool output.
///
/// Most tools produce only `Text`.  Vision-capable tools may produce a mix
/// of `Text` and `Image` items.
#[derive(Debug, Clone)]
pub enum ToolOutputPart {
    /// Plain UTF-8 text.
    Text(String),
    /// Base64 data URL: `data:<mime>;base64,<b64>`.
    Image(String),
}

/// The result of executing a tool.
///
/// `content` is always the plain-text representation of the output (the
/// concatenation of all `Text` parts); `parts` carries the richer structured
/// form. The tool-call loop maps `parts` into the matching
/// [`conduit_model::ToolResultContent`] variant when building the conversation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    /// Plain-text content — concatenation of all Text parts.
    pub content: String,
    /// Structured parts (text and/or images).  For tools that only return
    /// text this contains exactly one `Text` part mirroring `content`.
    pub parts: Vec<ToolOutputPart>,
    /// If true, the tool execution failed non-fatally (returned error message).
    pub is_error: bool,
}

impl ToolOutput {
    /// Successful plain-text result.
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let text = content.into();
        let call_id = call_id.into();
        Self {
            call_id,
            content: text.clone(),
            parts: vec![ToolOutputPart::Text(text)],
            is_error: false,
        }
    }

    /// Error result containing a plain-text error message.
    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        let text = msg.into();
        let call_id = call_id.into();
        Self {
            call_id,
            content: text.clone(),
            parts: vec![ToolOutputPart::Text(text)],
            is_error: true,
        }
    }

    /// Result with arbitrary parts (text and/or images).
    ///
    /// `content` is set to the concatenation of all Text parts.
    pub fn with_parts(call_id: impl Into<String>, parts: Vec<ToolOutputPart>) -> Self {
        let text = parts
            .iter()
            .filter_map(|p| match p {
                ToolOutputPart::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            call_id: call_id.into(),
            content: text,
            parts,
            is_error: false,
        }
    }

    /// Return `true` if this output contains at least one image part.
    pub fn has_images(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, ToolOutputPart::Image(_)))
    }
}

/// Describes the shape of a tool's text output for context-aware truncation.
///
/// A caller-supplied truncation step (outside this crate) may use this
/// category to pick the right extraction strategy when a result exceeds a
/// token budget. Each tool declares its own category; the registry never
/// hard-codes tool names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputCategory {
    /// Terminal / process output: keep the first N + last M lines so both
    /// the command preamble and the final result are visible.
    HeadTail,
    /// Ordered match list: keep the leading matches so the caller sees the
    /// highest-relevance results first.
    MatchList,
    /// File content: keep a head and tail window with a separator so both
    /// the top of the file and its end remain visible.
    FileContent,
    /// Generic text: hard-truncate at the character boundary.
    #[default]
    Generic,
}

/// Trait that every tool registered with a [`crate::ToolRegistry`] must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters
    fn parameters_schema(&self) -> Value;
    /// Describes the shape of this tool's output for context-aware truncation.
    ///
    /// Override this when your tool produces output whose leading or trailing
    /// portion is more useful than a hard cut.  The default is
    /// [`OutputCategory::Generic`] (hard truncation).
    fn output_category(&self) -> OutputCategory {
        OutputCategory::Generic
    }
    /// Whether this tool is safe to run concurrently with other tool calls
    /// in the same turn.  The tool-call loop consults this before dispatching
    /// a batch of calls via `tokio::spawn`.  Default: `true`.
    fn concurrent_safe(&self) -> bool {
        true
    }
    /// Execute the tool.  Errors should be wrapped in [`ToolOutput::err`].
    async fn execute(&self, call: &ToolCall) -> ToolOutput;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
