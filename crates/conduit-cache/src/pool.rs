// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Connection-pool construction, shared per `(database_url, scheduler)` per
//! §5 — here "scheduler" is the process's one `tokio` runtime, so pools are
//! keyed by `database_url` alone. A per-key async mutex guards construction
//! so two concurrent callers resolving the same URL never race to open two
//! pools.
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::Mutex as AsyncMutex;

/// The backend a `ResponseCache`/`ConversationRepository` is actually
/// talking to. Postgres is canonical (§6); SQLite backs the hermetic test
/// suite (§8.1).
pub enum Pool {
    Postgres(sqlx::PgPool),
    Sqlite(sqlx::SqlitePool),
}

type Registry = AsyncMutex<HashMap<String, Arc<Pool>>>;

static POOLS: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    POOLS.get_or_init(|| AsyncMutex::new(HashMap::new()))
}

/// Resolve (creating if necessary) the shared pool for `database_url`.
/// Dispatches on the URL scheme: `sqlite:` routes to `SqlitePool`, anything
/// else is assumed to be a Postgres URL.
pub async fn get_or_create(database_url: &str, max_connections: u32) -> anyhow::Result<Arc<Pool>> {
    let mut guard = registry().lock().await;
    if let Some(pool) = guard.get(database_url) {
        return Ok(Arc::clone(pool));
    }

    let pool = if database_url.starts_with("sqlite:") {
        let p = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Pool::Sqlite(p)
    } else {
        let p = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Pool::Postgres(p)
    };

    let pool = Arc::new(pool);
    guard.insert(database_url.to_string(), Arc::clone(&pool));
    Ok(pool)
}

/// Drop `database_url` from the registry, forcing the next `get_or_create`
/// call to open a fresh pool. Used by tests that want a clean database per
/// test function while sharing the same URL string.
#[cfg(test)]
pub async fn forget(database_url: &str) {
    registry().lock().await.remove(database_url);
}
