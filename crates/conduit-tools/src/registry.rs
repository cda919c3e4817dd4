// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use crate::{Tool, ToolCall, ToolOutput};

/// A tool schema – mirrors conduit_model::ToolSchema but keeps the tools crate
/// independent from the model crate.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Central registry holding all available tools, consulted by the tool-call loop.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

// SAFETY: ToolRegistry is Sync because:
// - HashMap<String, Arc<dyn Tool>> is Sync (String is Sync, Arc<T: Send + Sync> is Sync)
// - Tools implement Send + Sync (required by the Tool trait)
// - No interior mutability exists after construction (all methods take &self)
// - Parallel tool execution is safe because tools are immutable after registration
unsafe impl Sync for ToolRegistry {}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Produce schemas for all registered tools, sorted by name.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self.tools.values().map(|t| ToolSchema {
            name: t.name().to_string(),
            description: t.description().to_string(),
            parameters: t.parameters_schema(),
        }).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub async fn execute(&self, call: &ToolCall) -> ToolOutput {
        match self.tools.get(&call.name) {
            Some(tool) => tool.execute(call).await,
            None => ToolOutput::err(
                &call.id,
                format!("unknown tool: {}", call.name),
            ),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// True when every tool in `names` (all of which must be registered) is
    /// safe to dispatch concurrently with the others in the same turn.
    pub fn all_concurrent_safe<'a>(&self, names: impl Iterator<Item = &'a str>) -> bool {
        names.all(|n| self.tools.get(n).map(|t| t.concurrent_safe()).unwrap_or(true))
    }
}

impl Default for ToolRegistry {
    fn default() -> Self { Self::new() }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
