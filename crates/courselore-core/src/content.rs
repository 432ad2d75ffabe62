//! Reference content processor.
//!
//! Handles the subset of Markdown that matters for notifications: paragraphs,
//! line breaks, code spans/blocks (which never contain mentions) and
//! `@mentions`. Everything is HTML-escaped; no raw HTML passes through.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::Result;
use crate::models::{Mention, ProcessedContent};
use crate::traits::ContentProcessor;

static CODE_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[^\n]*\n.*?```").expect("valid code block pattern"));

static INLINE_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"`[^`\n]+`").expect("valid inline code pattern"));

static MENTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(^|[^A-Za-z0-9_@])@([A-Za-z0-9]+(?:--[A-Za-z0-9-]+)?)")
        .expect("valid mention pattern")
});

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid pattern"));

/// Extract the mentions in `source`, ignoring code.
pub fn extract_mentions(source: &str) -> BTreeSet<Mention> {
    let without_blocks = CODE_BLOCK.replace_all(source, " ");
    let without_code = INLINE_CODE.replace_all(&without_blocks, " ");
    MENTION
        .captures_iter(&without_code)
        .filter_map(|cap| cap.get(2).and_then(|m| Mention::parse(m.as_str())))
        .collect()
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn render_inline(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for code in INLINE_CODE.find_iter(text) {
        out.push_str(&decorate_mentions(&escape_html(&text[last..code.start()])));
        let inner = &code.as_str()[1..code.as_str().len() - 1];
        out.push_str(&format!("<code>{}</code>", escape_html(inner)));
        last = code.end();
    }
    out.push_str(&decorate_mentions(&escape_html(&text[last..])));
    out.replace('\n', "<br>")
}

fn decorate_mentions(text: &str) -> String {
    MENTION
        .replace_all(text, |caps: &regex::Captures| {
            let token = &caps[2];
            if Mention::parse(token).is_some() {
                format!(r#"{}<strong class="mention">@{}</strong>"#, &caps[1], token)
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

/// Paragraphs, line breaks, code and mentions; everything else is text.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicContentProcessor;

impl BasicContentProcessor {
    pub fn new() -> Self {
        Self
    }

    fn render(source: &str) -> String {
        let mut html = String::new();
        let mut last = 0;
        for block in CODE_BLOCK.find_iter(source) {
            html.push_str(&Self::render_paragraphs(&source[last..block.start()]));
            let body = block.as_str();
            let inner = body
                .split_once('\n')
                .map(|(_, rest)| rest.trim_end_matches("```"))
                .unwrap_or_default();
            html.push_str(&format!("<pre><code>{}</code></pre>", escape_html(inner)));
            last = block.end();
        }
        html.push_str(&Self::render_paragraphs(&source[last..]));
        html
    }

    fn render_paragraphs(text: &str) -> String {
        text.split("\n\n")
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| format!("<p>{}</p>", render_inline(p)))
            .collect()
    }
}

impl ContentProcessor for BasicContentProcessor {
    fn process(&self, source: &str) -> Result<ProcessedContent> {
        Ok(ProcessedContent {
            html: Self::render(source),
            search: WHITESPACE.replace_all(source.trim(), " ").into_owned(),
            mentions: extract_mentions(source),
        })
    }
}
