// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Connection-pool construction shared per `(database_url, scheduler)`,
//! identical in shape to `conduit-cache`'s pool module — duplicated rather
//! than shared because each crate owns its own schema migrations and the
//! two backends genuinely have no other coupling.
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::Mutex as AsyncMutex;

pub enum Pool {
    Postgres(sqlx::PgPool),
    Sqlite(sqlx::SqlitePool),
}

type Registry = AsyncMutex<HashMap<String, Arc<Pool>>>;

static POOLS: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    POOLS.get_or_init(|| AsyncMutex::new(HashMap::new()))
}

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
