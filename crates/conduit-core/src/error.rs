// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use thiserror::Error;

/// The runtime's error taxonomy. One variant per failure kind the Pipeline,
/// adapters, or tool loop can surface to a caller.
#[derive(Debug, Error)]
pub enum ConduitError {
    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("authentication failed: {0}")]
    AuthError(String),

    #[error("rate limited (attempt {attempt})")]
    RateLimited {
        retry_after: Option<Duration>,
        attempt: u32,
    },

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("content refused: {reason}")]
    ContentRefused { reason: String },

    #[error("context too large: {tokens} tokens exceeds window of {window}")]
    ContextTooLarge { tokens: usize, window: usize },

    #[error("structured output did not match schema: {0}")]
    SchemaMismatch(String),

    #[error("tool loop exhausted max_tool_hops={0}")]
    ToolLoopExhausted(u32),

    #[error("cancelled")]
    Cancelled,
}

impl ConduitError {
    /// Stable lowercase kind tag, for log fields and the user-visible error
    /// envelope's `category` — independent of the Display message text.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownModel(_) => "unknown_model",
            Self::ValidationError(_) => "validation_error",
            Self::AuthError(_) => "auth_error",
            Self::RateLimited { .. } => "rate_limited",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::NetworkError(_) => "network_error",
            Self::Timeout(_) => "timeout",
            Self::BadRequest(_) => "bad_request",
            Self::ContentRefused { .. } => "content_refused",
            Self::ContextTooLarge { .. } => "context_too_large",
            Self::SchemaMismatch(_) => "schema_mismatch",
            Self::ToolLoopExhausted(_) => "tool_loop_exhausted",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the adapter layer is expected to retry this kind on its own.
    /// Upper layers (Pipeline, BatchEngine) never retry — see §7 propagation
    /// policy — this only documents which kinds the adapter retry loop covers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::UpstreamUnavailable(_) | Self::NetworkError(_)
        )
    }
}

/// Extra detail attached to an error for higher-verbosity renderers. Never
/// populated unless `ConduitOptions::debug_payload` is set.
#[derive(Debug, Clone, Default)]
pub struct ErrorDetail {
    pub exception_type: Option<String>,
    pub stack_trace: Option<String>,
    pub request_params: Option<serde_json::Value>,
    pub retry_count: u32,
    pub raw_response: Option<String>,
}

/// The user-visible error envelope: `{kind, message, category, timestamp}`
/// plus the optional `detail`.
#[derive(Debug, Clone)]
pub struct ErrorEnvelope {
    pub kind: &'static str,
    pub message: String,
    pub category: &'static str,
    pub timestamp_ms: i64,
    pub detail: Option<ErrorDetail>,
}

impl ErrorEnvelope {
    pub fn from_error(err: &ConduitError, timestamp_ms: i64, detail: Option<ErrorDetail>) -> Self {
        let category = if err.is_retryable() { "transient" } else { "terminal" };
        Self {
            kind: err.kind(),
            message: err.to_string(),
            category,
            timestamp_ms,
            detail,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
