// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Character-level scan for the first complete JSON object or array in a
//! buffer of streamed text. Generalizes the `in_string`/escape tracking the
//! teacher's `fix_invalid_json_escapes` uses to repair one delimited
//! argument string into a scan that instead finds where the delimiters are.

/// A JSON value extracted from a larger buffer, plus the text that preceded
/// it and how much of the buffer the match consumed.
#[derive(Debug, Clone)]
pub struct JsonExtraction {
    pub text_before: String,
    pub value: serde_json::Value,
    pub consumed: usize,
}

/// Scan `buf` for the first `{`/`[` that opens a balanced, parseable JSON
/// value. Candidate starts that fail to parse (false positives — e.g. a
/// brace inside a code sample the model is narrating) are skipped and
/// scanning resumes just past them.
pub fn find_json_object(buf: &str) -> Option<JsonExtraction> {
    let bytes = buf.as_bytes();
    let mut search_from = 0usize;

    while let Some(rel_start) = bytes[search_from..]
        .iter()
        .position(|&b| b == b'{' || b == b'[')
    {
        let start = search_from + rel_start;
        match scan_balanced(&bytes[start..]) {
            Some(end_rel) => {
                let end = start + end_rel;
                let candidate = &buf[start..end];
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(candidate) {
                    return Some(JsonExtraction {
                        text_before: buf[..start].to_string(),
                        value,
                        consumed: end,
                    });
                }
                // Parseable delimiters but not valid JSON (e.g. trailing
                // comma) — resume just past this candidate's opening char.
                search_from = start + 1;
            }
            None => {
                // Depth never returned to zero within the buffer — either
                // incomplete (more chunks to come) or this start was a stray
                // brace. Either way nothing else in the buffer can close it
                // before this point, so stop scanning.
                return None;
            }
        }
    }
    None
}

/// Track `depth`/`in_string`/`escaped` starting at `bytes[0]` (a `{` or
/// `[`). Returns the index one past the matching close, or `None` if the
/// buffer runs out before depth returns to zero.
fn scan_balanced(bytes: &[u8]) -> Option<usize> {
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}
