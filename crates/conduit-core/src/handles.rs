// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;

use crate::dto::GenerationResponse;
use crate::error::ConduitError;
use crate::session::{Conversation, Session};

/// Pluggable response cache, consumed by the Pipeline's cache-probe and
/// persist steps. `conduit-cache` provides the canonical relational
/// implementation; tests use an in-memory double.
#[async_trait]
pub trait CacheHandle: Send + Sync {
    async fn get(&self, cache_key: &str) -> Result<Option<GenerationResponse>, ConduitError>;
    async fn set(&self, cache_key: &str, response: &GenerationResponse) -> Result<(), ConduitError>;
    async fn wipe(&self) -> Result<(), ConduitError>;
}

/// Pluggable conversation store, consumed by the Pipeline's persist step.
/// `conduit-repo` provides the canonical relational implementation.
#[async_trait]
pub trait RepositoryHandle: Send + Sync {
    async fn save(&self, session: &Session, title: Option<&str>) -> Result<(), ConduitError>;
    async fn load(&self, session_id: &str) -> Result<Option<Session>, ConduitError>;
    async fn rehydrate_from_leaf(&self, message_id: &str) -> Result<Option<Conversation>, ConduitError>;
    async fn list(&self, limit: usize) -> Result<Vec<SessionSummary>, ConduitError>;
    async fn delete(&self, session_id: &str) -> Result<(), ConduitError>;
    async fn wipe(&self) -> Result<(), ConduitError>;
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: String,
    pub project_name: String,
    pub title: Option<String>,
    pub last_updated_ms: i64,
}
