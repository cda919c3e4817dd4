// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Provider-agnostic orchestration core: the Session/Conversation DAG, the
//! canonical request/response DTOs, cache-key hashing, the single-shot
//! Pipeline, the tool-call loop, and the typed error taxonomy. Application
//! front-ends and the `conduit-batch`/`conduit-cache`/`conduit-repo` crates
//! build on top of the types exported here; this crate makes no network
//! calls of its own and knows nothing about any specific provider beyond the
//! `conduit_model::ModelProvider` trait object it is handed.
mod cache_key;
mod dto;
mod error;
mod handles;
mod odometer;
mod pipeline;
mod session;
mod tool_loop;

pub use cache_key::cache_key;
pub use dto::{
    ConduitOptions, ConduitOptionsSnapshot, CustomProviders, GenerationParams, GenerationRequest,
    GenerationResponse, OdometerEvent, OutputType, ResponseMetadata, StopReason, ToolCallRequest,
    Verbosity,
};
pub use error::{ConduitError, ErrorDetail, ErrorEnvelope};
pub use handles::{CacheHandle, RepositoryHandle, SessionSummary};
pub use odometer::record as record_odometer_event;
pub use pipeline::{classify_adapter_error, Pipeline};
pub use session::{Conversation, ConversationState, Session, StoredMessage};
pub use tool_loop::run_tool_loop;
