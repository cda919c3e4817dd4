// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Abstracts over the handful of JSON shapes different providers wrap a
//! streamed text delta in, so the parser above can stay shape-agnostic.

/// Try each known chunk shape in turn and return the first text delta
/// found. Shapes that are present but carry no string (e.g. a `delta` with
/// only a `role` field, common on the first chunk of a turn) are skipped
/// rather than treated as an error.
pub fn extract_chunk_text(value: &serde_json::Value) -> Option<String> {
    // OpenAI-compatible: {"choices":[{"delta":{"content":"..."}}]}
    if let Some(s) = value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|v| v.as_str())
    {
        return Some(s.to_string());
    }
    // Anthropic-style: {"delta":{"text":"..."}}
    if let Some(s) = value.get("delta").and_then(|d| d.get("text")).and_then(|v| v.as_str()) {
        return Some(s.to_string());
    }
    // Bare: {"text":"..."}
    if let Some(s) = value.get("text").and_then(|v| v.as_str()) {
        return Some(s.to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_openai_shape() {
        let v = json!({"choices": [{"delta": {"content": "hi"}}]});
        assert_eq!(extract_chunk_text(&v).as_deref(), Some("hi"));
    }

    #[test]
    fn extracts_anthropic_shape() {
        let v = json!({"delta": {"text": "hi"}});
        assert_eq!(extract_chunk_text(&v).as_deref(), Some("hi"));
    }

    #[test]
    fn extracts_bare_text_shape() {
        let v = json!({"text": "hi"});
        assert_eq!(extract_chunk_text(&v).as_deref(), Some("hi"));
    }

    #[test]
    fn returns_none_for_role_only_delta() {
        let v = json!({"choices": [{"delta": {"role": "assistant"}}]});
        assert_eq!(extract_chunk_text(&v), None);
    }

    #[test]
    fn returns_none_for_unrecognized_shape() {
        let v = json!({"something_else": 1});
        assert_eq!(extract_chunk_text(&v), None);
    }
}
