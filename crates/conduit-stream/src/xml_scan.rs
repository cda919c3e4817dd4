// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Character-level scan for a balanced `<tag>...</tag>` block, tracking
//! nesting depth of one specific tag name rather than general XML/HTML
//! structure (siblings and other tags inside the block are not tracked).

#[derive(Debug, Clone)]
pub struct XmlExtraction {
    pub text_before: String,
    /// Raw text between the outermost start and matching end tag.
    pub inner: String,
    pub consumed: usize,
}

/// Find the first `<tag ...>...</tag>` block in `buf` whose nesting (other
/// `<tag>`/`</tag>` pairs inside it) is balanced. Returns `None` if the
/// buffer runs out before the outer tag closes — the caller treats that as
/// "incomplete, wait for more chunks".
pub fn find_xml_block(buf: &str, tag: &str) -> Option<XmlExtraction> {
    let open_needle = format!("<{tag}");
    let close_needle = format!("</{tag}>");

    let start = buf.find(&open_needle)?;
    let open_tag_end = buf[start..].find('>')? + start + 1;

    let mut depth = 1i32;
    let mut cursor = open_tag_end;
    let inner_start = open_tag_end;

    loop {
        let next_open = buf[cursor..].find(&open_needle).map(|i| cursor + i);
        let next_close = buf[cursor..].find(&close_needle).map(|i| cursor + i);

        match (next_open, next_close) {
            (Some(o), Some(c)) if o < c => {
                depth += 1;
                cursor = o + open_needle.len();
            }
            (_, Some(c)) => {
                depth -= 1;
                if depth == 0 {
                    let inner = buf[inner_start..c].to_string();
                    let consumed = c + close_needle.len();
                    return Some(XmlExtraction {
                        text_before: buf[..start].to_string(),
                        inner,
                        consumed,
                    });
                }
                cursor = c + close_needle.len();
            }
            _ => return None, // ran out of buffer before depth returned to zero
        }
    }
}
