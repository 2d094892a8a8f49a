//! Minimal reader for `listener "tcp"` blocks in a server config file
//!
//! Only the attributes directly inside each listener block are collected;
//! nested blocks (`telemetry`, `profiling`, ...) are skipped. Comments in all
//! three HCL styles are ignored.

use std::collections::BTreeMap;

/// Attributes of one `listener "tcp"` block
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListenerBlock {
    attributes: BTreeMap<String, String>,
}

impl ListenerBlock {
    fn from_body(body: &str) -> Self {
        let mut top_level = String::with_capacity(body.len());
        let mut depth = 0usize;
        let mut quote = QuoteState::default();

        for c in body.chars() {
            if quote.feed(c) {
                if depth == 0 {
                    top_level.push(c);
                }
                continue;
            }
            match c {
                '{' => depth += 1,
                '}' => depth = depth.saturating_sub(1),
                _ if depth == 0 => top_level.push(c),
                _ => {}
            }
        }

        let attributes = top_level
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(key, value)| {
                let value = value.trim().trim_end_matches(',').trim();
                (key.trim().to_string(), unquote(value).to_string())
            })
            .filter(|(key, _)| !key.is_empty())
            .collect();

        Self { attributes }
    }

    /// Raw (unquoted) value of an attribute
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// True if `tls_disable` is falsy and both cert and key files are set
    pub fn tls_enabled(&self) -> bool {
        let disabled = self.get("tls_disable").map(is_truthy).unwrap_or(false);
        let has = |key: &str| self.get(key).map(|v| !v.is_empty()).unwrap_or(false);
        !disabled && has("tls_cert_file") && has("tls_key_file")
    }
}

/// Extract every `listener "tcp"` block from a config document
pub fn parse_tcp_listeners(source: &str) -> Vec<ListenerBlock> {
    const KEYWORD: &str = "listener";
    const LABEL: &str = "\"tcp\"";

    let clean = strip_comments(source);
    let mut blocks = Vec::new();
    let mut rest = clean.as_str();

    while let Some(pos) = rest.find(KEYWORD) {
        let at_boundary = rest[..pos]
            .chars()
            .last()
            .map(|c| !(c.is_alphanumeric() || c == '_'))
            .unwrap_or(true);
        let after = &rest[pos + KEYWORD.len()..];

        if at_boundary {
            if let Some(labelled) = after.trim_start().strip_prefix(LABEL) {
                if let Some(body) = labelled.trim_start().strip_prefix('{') {
                    if let Some(end) = closing_brace(body) {
                        blocks.push(ListenerBlock::from_body(&body[..end]));
                        rest = &body[end + 1..];
                        continue;
                    }
                }
            }
        }
        rest = after;
    }

    blocks
}

/// HCL accepts booleans, 0/1 and their quoted forms
pub fn is_truthy(value: &str) -> bool {
    matches!(
        unquote(value.trim()).to_ascii_lowercase().as_str(),
        "true" | "1"
    )
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// Index of the brace closing an already-opened block
fn closing_brace(body: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote = QuoteState::default();
    for (i, c) in body.char_indices() {
        if quote.feed(c) {
            continue;
        }
        match c {
            '{' => depth += 1,
            '}' if depth == 0 => return Some(i),
            '}' => depth -= 1,
            _ => {}
        }
    }
    None
}

fn strip_comments(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    let mut quote = QuoteState::default();

    while let Some(c) = chars.next() {
        if quote.feed(c) {
            out.push(c);
            continue;
        }
        match c {
            '#' => skip_line(&mut chars, &mut out),
            '/' if chars.peek() == Some(&'/') => skip_line(&mut chars, &mut out),
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    if c == '\n' {
                        out.push('\n');
                    }
                    prev = c;
                }
            }
            _ => out.push(c),
        }
    }
    out
}

fn skip_line(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, out: &mut String) {
    for c in chars.by_ref() {
        if c == '\n' {
            out.push('\n');
            break;
        }
    }
}

/// Tracks whether the scanner is inside a double-quoted string
#[derive(Default)]
struct QuoteState {
    inside: bool,
    escaped: bool,
}

impl QuoteState {
    /// Feed one character; returns true if it belongs to a string literal
    fn feed(&mut self, c: char) -> bool {
        if self.inside {
            if self.escaped {
                self.escaped = false;
            } else if c == '\\' {
                self.escaped = true;
            } else if c == '"' {
                self.inside = false;
            }
            true
        } else if c == '"' {
            self.inside = true;
            true
        } else {
            false
        }
    }
}
