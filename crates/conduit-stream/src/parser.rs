// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use thiserror::Error;

use crate::chunk::extract_chunk_text;
use crate::json_scan::find_json_object;
use crate::xml_scan::find_xml_block;

#[derive(Debug, Error)]
pub enum StreamParseError {
    #[error("upstream chunk error: {0}")]
    Upstream(String),
    #[error("stream ended before a complete object was found")]
    Incomplete,
}

/// What the parser is scanning the accumulated buffer for.
#[derive(Debug, Clone)]
pub enum ParseTarget {
    Json,
    Xml { tag: String },
}

/// What an accepted match carried, plus the raw text that preceded it.
#[derive(Debug, Clone)]
pub struct ExtractResult {
    pub text_before: String,
    pub parsed: Option<serde_json::Value>,
    /// Raw inner text, populated for `ParseTarget::Xml`; `None` for JSON.
    pub raw: Option<String>,
    pub buffer_consumed: usize,
}

/// A chunk source the parser can drain and, on early termination, close.
/// `conduit-model` adapters implement this over their provider-specific
/// SSE/stream reader; tests use an in-memory `Vec`-backed double.
#[async_trait]
pub trait ChunkSource: Send {
    async fn next_chunk(&mut self) -> Option<anyhow::Result<serde_json::Value>>;
    fn close(&mut self);
}

/// Finds the first complete JSON or XML object in a chunked stream,
/// generalizing the teacher's escape-aware character scan (§4.6.1) from
/// repairing one delimited fragment to locating the fragment's boundaries
/// in an open-ended stream.
pub struct StreamParser {
    target: ParseTarget,
    close_on_match: bool,
    check_interval: usize,
}

impl StreamParser {
    pub fn new(target: ParseTarget) -> Self {
        Self { target, close_on_match: false, check_interval: 1 }
    }

    pub fn with_close_on_match(mut self, close_on_match: bool) -> Self {
        self.close_on_match = close_on_match;
        self
    }

    /// How many chunks to accumulate between re-scans of the buffer. Must
    /// be at least 1 — a value of 0 would never scan.
    pub fn with_check_interval(mut self, check_interval: usize) -> Self {
        self.check_interval = check_interval.max(1);
        self
    }

    /// Drain `source` until the first complete object is found, or the
    /// stream ends. On a match, when `close_on_match` is set, `source`'s
    /// `close()` is invoked before returning — trailing content already
    /// produced by the upstream is discarded, a token-cost optimization for
    /// providers billed per streamed token.
    pub async fn extract_first(
        &self,
        source: &mut dyn ChunkSource,
    ) -> Result<ExtractResult, StreamParseError> {
        let mut buffer = String::new();
        let mut since_last_scan = 0usize;

        while let Some(chunk) = source.next_chunk().await {
            let value = chunk.map_err(|e| StreamParseError::Upstream(e.to_string()))?;
            if let Some(text) = extract_chunk_text(&value) {
                buffer.push_str(&text);
            }
            since_last_scan += 1;

            if since_last_scan >= self.check_interval {
                since_last_scan = 0;
                if let Some(result) = self.try_extract(&buffer) {
                    if self.close_on_match {
                        source.close();
                    }
                    return Ok(result);
                }
            }
        }

        // One final scan in case the stream ended exactly on a boundary
        // check_interval never triggered for.
        self.try_extract(&buffer).ok_or(StreamParseError::Incomplete)
    }

    fn try_extract(&self, buffer: &str) -> Option<ExtractResult> {
        match &self.target {
            ParseTarget::Json => find_json_object(buffer).map(|e| ExtractResult {
                text_before: e.text_before,
                parsed: Some(e.value),
                raw: None,
                buffer_consumed: e.consumed,
            }),
            ParseTarget::Xml { tag } => find_xml_block(buffer, tag).map(|e| ExtractResult {
                text_before: e.text_before,
                parsed: None,
                raw: Some(e.inner),
                buffer_consumed: e.consumed,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct VecChunkSource {
        chunks: std::vec::IntoIter<serde_json::Value>,
        closed: Arc<AtomicBool>,
    }

    impl VecChunkSource {
        fn new(chunks: Vec<serde_json::Value>, closed: Arc<AtomicBool>) -> Self {
            Self { chunks: chunks.into_iter(), closed }
        }
    }

    #[async_trait]
    impl ChunkSource for VecChunkSource {
        async fn next_chunk(&mut self) -> Option<anyhow::Result<serde_json::Value>> {
            self.chunks.next().map(Ok)
        }
        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn openai_chunk(text: &str) -> serde_json::Value {
        json!({"choices": [{"delta": {"content": text}}]})
    }

    #[tokio::test]
    async fn extracts_json_split_across_chunks() {
        let closed = Arc::new(AtomicBool::new(false));
        let mut source = VecChunkSource::new(
            vec![
                openai_chunk(r#"here: {"a":"#),
                openai_chunk(r#" 1} done"#),
            ],
            closed.clone(),
        );
        let parser = StreamParser::new(ParseTarget::Json);
        let result = parser.extract_first(&mut source).await.unwrap();
        assert_eq!(result.text_before, "here: ");
        assert_eq!(result.parsed.unwrap()["a"], 1);
        assert!(!closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn close_on_match_closes_the_source() {
        let closed = Arc::new(AtomicBool::new(false));
        let mut source = VecChunkSource::new(
            vec![openai_chunk(r#"{"a": 1}"#), openai_chunk("trailing junk")],
            closed.clone(),
        );
        let parser = StreamParser::new(ParseTarget::Json).with_close_on_match(true);
        let result = parser.extract_first(&mut source).await.unwrap();
        assert_eq!(result.parsed.unwrap()["a"], 1);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn incomplete_stream_is_an_error() {
        let closed = Arc::new(AtomicBool::new(false));
        let mut source = VecChunkSource::new(vec![openai_chunk(r#"{"a": 1"#)], closed);
        let parser = StreamParser::new(ParseTarget::Json);
        let err = parser.extract_first(&mut source).await.unwrap_err();
        assert!(matches!(err, StreamParseError::Incomplete));
    }

    #[tokio::test]
    async fn xml_target_extracts_inner_text() {
        let closed = Arc::new(AtomicBool::new(false));
        let mut source = VecChunkSource::new(
            vec![openai_chunk("<answer>"), openai_chunk("42</answer>")],
            closed,
        );
        let parser = StreamParser::new(ParseTarget::Xml { tag: "answer".into() });
        let result = parser.extract_first(&mut source).await.unwrap();
        assert_eq!(result.raw.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn check_interval_defers_scanning() {
        // Match is complete after chunk 1, but check_interval=2 means the
        // parser only rescans after the second chunk arrives.
        let closed = Arc::new(AtomicBool::new(false));
        let mut source = VecChunkSource::new(
            vec![openai_chunk(r#"{"a": 1}"#), openai_chunk("more text")],
            closed,
        );
        let parser = StreamParser::new(ParseTarget::Json).with_check_interval(2);
        let result = parser.extract_first(&mut source).await.unwrap();
        assert_eq!(result.parsed.unwrap()["a"], 1);
    }
}
