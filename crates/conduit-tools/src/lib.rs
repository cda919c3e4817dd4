// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Generic tool trait and registry consumed by the tool-call loop.
//!
//! This crate is intentionally free of any built-in tool implementations —
//! those are an application concern. Host applications register their own
//! [`Tool`] implementations with a [`ToolRegistry`] and hand it to the
//! conduit-core pipeline via `ConduitOptions::tool_registry`.
pub mod registry;
pub mod tool;

pub use registry::{ToolRegistry, ToolSchema};
pub use tool::{OutputCategory, Tool, ToolCall, ToolOutput, ToolOutputPart};
