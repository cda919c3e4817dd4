// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The canonical relational `ResponseCache` (C7): a `cache_entries` table
//! keyed by `(cache_name, cache_key)`, upserted on write. Postgres in
//! production, SQLite for the hermetic test suite — see [`pool::Pool`].
mod pool;

pub use pool::Pool;

use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::{CacheHandle, ConduitError, GenerationResponse};

/// A pluggable response cache backed by a shared [`Pool`]. `cache_name` is
/// the project name from `ConduitOptions` — multiple caches may share one
/// database, partitioned by this column.
pub struct ResponseCache {
    pool: Arc<Pool>,
    cache_name: String,
}

impl ResponseCache {
    /// Connect to `database_url` (reusing a pool already open for that URL)
    /// and ensure the `cache_entries` table exists.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        cache_name: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let pool = pool::get_or_create(database_url, max_connections).await?;
        let cache = Self { pool, cache_name: cache_name.into() };
        cache.ensure_schema().await?;
        Ok(cache)
    }

    async fn ensure_schema(&self) -> anyhow::Result<()> {
        match &*self.pool {
            Pool::Postgres(p) => {
                sqlx::query(
                    "CREATE TABLE IF NOT EXISTS cache_entries (
                        cache_name text NOT NULL,
                        cache_key  text NOT NULL,
                        payload    jsonb NOT NULL,
                        created_at timestamptz NOT NULL DEFAULT now(),
                        updated_at timestamptz NOT NULL DEFAULT now(),
                        PRIMARY KEY (cache_name, cache_key)
                    )",
                )
                .execute(p)
                .await?;
            }
            Pool::Sqlite(p) => {
                sqlx::query(
                    "CREATE TABLE IF NOT EXISTS cache_entries (
                        cache_name text NOT NULL,
                        cache_key  text NOT NULL,
                        payload    text NOT NULL,
                        created_at timestamp NOT NULL DEFAULT CURRENT_TIMESTAMP,
                        updated_at timestamp NOT NULL DEFAULT CURRENT_TIMESTAMP,
                        PRIMARY KEY (cache_name, cache_key)
                    )",
                )
                .execute(p)
                .await?;
            }
        }
        Ok(())
    }

    fn storage_error(context: &str, err: sqlx::Error) -> ConduitError {
        ConduitError::UpstreamUnavailable(format!("{context}: {err}"))
    }
}

#[async_trait]
impl CacheHandle for ResponseCache {
    async fn get(&self, cache_key: &str) -> Result<Option<GenerationResponse>, ConduitError> {
        let row: Option<(String,)> = match &*self.pool {
            Pool::Postgres(p) => {
                sqlx::query_as("SELECT payload::text FROM cache_entries WHERE cache_name = $1 AND cache_key = $2")
                    .bind(&self.cache_name)
                    .bind(cache_key)
                    .fetch_optional(p)
                    .await
                    .map_err(|e| Self::storage_error("cache get", e))?
            }
            Pool::Sqlite(p) => {
                sqlx::query_as("SELECT payload FROM cache_entries WHERE cache_name = ? AND cache_key = ?")
                    .bind(&self.cache_name)
                    .bind(cache_key)
                    .fetch_optional(p)
                    .await
                    .map_err(|e| Self::storage_error("cache get", e))?
            }
        };
        match row {
            None => Ok(None),
            Some((payload,)) => serde_json::from_str(&payload)
                .map(Some)
                .map_err(|e| ConduitError::BadRequest(format!("corrupt cache payload: {e}"))),
        }
    }

    async fn set(&self, cache_key: &str, response: &GenerationResponse) -> Result<(), ConduitError> {
        let payload = serde_json::to_string(response)
            .map_err(|e| ConduitError::ValidationError(format!("response not serializable: {e}")))?;
        match &*self.pool {
            Pool::Postgres(p) => {
                sqlx::query(
                    "INSERT INTO cache_entries (cache_name, cache_key, payload, updated_at)
                     VALUES ($1, $2, $3::jsonb, now())
                     ON CONFLICT (cache_name, cache_key)
                     DO UPDATE SET payload = excluded.payload, updated_at = now()",
                )
                .bind(&self.cache_name)
                .bind(cache_key)
                .bind(&payload)
                .execute(p)
                .await
                .map_err(|e| Self::storage_error("cache set", e))?;
            }
            Pool::Sqlite(p) => {
                sqlx::query(
                    "INSERT INTO cache_entries (cache_name, cache_key, payload, updated_at)
                     VALUES (?, ?, ?, CURRENT_TIMESTAMP)
                     ON CONFLICT(cache_name, cache_key)
                     DO UPDATE SET payload = excluded.payload, updated_at = CURRENT_TIMESTAMP",
                )
                .bind(&self.cache_name)
                .bind(cache_key)
                .bind(&payload)
                .execute(p)
                .await
                .map_err(|e| Self::storage_error("cache set", e))?;
            }
        }
        Ok(())
    }

    async fn wipe(&self) -> Result<(), ConduitError> {
        match &*self.pool {
            Pool::Postgres(p) => {
                sqlx::query("DELETE FROM cache_entries WHERE cache_name = $1")
                    .bind(&self.cache_name)
                    .execute(p)
                    .await
                    .map_err(|e| Self::storage_error("cache wipe", e))?;
            }
            Pool::Sqlite(p) => {
                sqlx::query("DELETE FROM cache_entries WHERE cache_name = ?")
                    .bind(&self.cache_name)
                    .execute(p)
                    .await
                    .map_err(|e| Self::storage_error("cache wipe", e))?;
            }
        }
        Ok(())
    }
}
