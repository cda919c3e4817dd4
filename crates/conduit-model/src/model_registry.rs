// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! C1 ModelRegistry: canonical lookup of model identity, provider membership,
//! and context-window size, layered over the bundled catalog
//! ([`crate::catalog`]) the way [`crate::registry::DRIVERS`] layers provider
//! metadata over the same bundled data. Read-mostly: the only mutation path
//! is [`reconcile`], which is not expected to run during steady-state
//! request handling.
use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;

use crate::catalog::{self, ModelCatalogEntry};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown model: {0}")]
    UnknownModel(String),
}

/// A small number of well-known short names that resolve to a canonical
/// catalog id. Aliases resolve transitively exactly once — chaining an
/// alias to another alias is a configuration error the bundled table avoids
/// by construction.
fn bundled_aliases() -> &'static [(&'static str, &'static str)] {
    &[
        ("gpt4o", "gpt-4o"),
        ("opus", "claude-opus-4-6"),
        ("sonnet", "claude-sonnet-4-5"),
        ("haiku", "claude-haiku-4-5"),
        ("gemini-pro", "gemini-2.5-pro"),
        ("gemini-flash", "gemini-2.5-flash"),
    ]
}

/// Operator-provided context-window overrides, keyed by canonical model id.
/// Populated by [`set_context_window_override`]; read by [`context_window`].
/// A `RwLock` gives concurrent readers and an exclusive writer, matching
/// §4.1's "safe for concurrent readers; mutations are exclusive" rule.
static OVERRIDES: RwLock<Option<HashMap<String, u32>>> = RwLock::new(None);

fn with_overrides<R>(f: impl FnOnce(&HashMap<String, u32>) -> R) -> R {
    let guard = OVERRIDES.read().expect("overrides lock poisoned");
    match guard.as_ref() {
        Some(map) => f(map),
        None => f(&HashMap::new()),
    }
}

/// Install (or replace) the operator-provided context-window override table.
/// Exclusive: callers should invoke this during startup/config-reload, not
/// from the hot request path.
pub fn set_context_window_overrides(overrides: HashMap<String, u32>) {
    let mut guard = OVERRIDES.write().expect("overrides lock poisoned");
    *guard = Some(overrides);
}

/// Resolve an alias or bare model name to the catalog's canonical id.
/// Aliases resolve transitively once (alias → canonical), never chained.
/// Unknown names fail with [`RegistryError::UnknownModel`].
pub fn resolve(alias_or_name: &str) -> Result<String, RegistryError> {
    if let Some((_, canonical)) = bundled_aliases().iter().find(|(a, _)| *a == alias_or_name) {
        return Ok((*canonical).to_string());
    }
    if catalog::lookup_by_model_name(alias_or_name).is_some() {
        return Ok(alias_or_name.to_string());
    }
    Err(RegistryError::UnknownModel(alias_or_name.to_string()))
}

/// Deterministic provider lookup: the first catalog entry (in bundled
/// declaration order) whose id or name matches `name` wins. Unknown names
/// fail with [`RegistryError::UnknownModel`].
pub fn provider_of(name: &str) -> Result<String, RegistryError> {
    catalog::lookup_by_model_name(name)
        .map(|e| e.provider)
        .ok_or_else(|| RegistryError::UnknownModel(name.to_string()))
}

/// Context window for `name`: provider manifest first, operator override
/// last (the override wins when present), matching §4.1's precedence.
pub fn context_window(name: &str) -> Result<u32, RegistryError> {
    let entry = lookup(name)?;
    Ok(with_overrides(|o| o.get(&entry.id).copied().unwrap_or(entry.context_window)))
}

pub fn is_supported(name: &str) -> bool {
    catalog::lookup_by_model_name(name).is_some()
        || bundled_aliases().iter().any(|(a, _)| *a == name)
}

fn lookup(name: &str) -> Result<ModelCatalogEntry, RegistryError> {
    catalog::lookup_by_model_name(name).ok_or_else(|| RegistryError::UnknownModel(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_canonical_name_is_identity() {
        assert_eq!(resolve("gpt-4o").unwrap(), "gpt-4o");
    }

    #[test]
    fn resolve_alias_maps_to_canonical() {
        assert_eq!(resolve("opus").unwrap(), "claude-opus-4-6");
    }

    #[test]
    fn resolve_unknown_name_fails() {
        assert!(resolve("not-a-real-model").is_err());
    }

    #[test]
    fn provider_of_known_model() {
        assert_eq!(provider_of("claude-sonnet-4-5").unwrap(), "anthropic");
    }

    #[test]
    fn provider_of_unknown_model_fails() {
        assert!(provider_of("ghost-9000").is_err());
    }

    #[test]
    fn context_window_uses_catalog_without_override() {
        let cw = context_window("gpt-4o").unwrap();
        assert_eq!(cw, 128000);
    }

    #[test]
    fn context_window_override_wins_over_catalog() {
        let mut overrides = HashMap::new();
        overrides.insert("gpt-4o-mini".to_string(), 999_999);
        set_context_window_overrides(overrides);
        assert_eq!(context_window("gpt-4o-mini").unwrap(), 999_999);
        set_context_window_overrides(HashMap::new());
    }

    #[test]
    fn is_supported_true_for_catalog_entry() {
        assert!(is_supported("gemini-2.5-pro"));
    }

    #[test]
    fn is_supported_true_for_alias() {
        assert!(is_supported("haiku"));
    }

    #[test]
    fn is_supported_false_for_unknown() {
        assert!(!is_supported("definitely-not-a-model"));
    }
}
