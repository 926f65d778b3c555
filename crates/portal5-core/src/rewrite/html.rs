//! Server-side HTML rewriting.
//!
//! Injects the client observer script as the first child of `<head>`. This is
//! a targeted splice, not an HTML parser: markup it cannot place the script
//! into is passed through unmodified.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use regex::Regex;
use url::form_urlencoded;
use url::Url;

/// Path of the client observer script.
pub const OBSERVER_PATH: &str = "/~/client/injection.js";

/// Returns the observer script URL carrying `base` as its argument.
pub fn observer_script_src(base: &Url) -> String {
    let args = serde_json::json!({ "base": base.as_str() }).to_string();
    let encoded: String = form_urlencoded::byte_serialize(STANDARD.encode(args).as_bytes()).collect();
    format!("{OBSERVER_PATH}?args={encoded}")
}

/// Splices the observer script into HTML documents.
pub struct ContentRewriter {
    head_open: Regex,
    html_open: Regex,
    doctype: Regex,
    comment: Regex,
}

impl ContentRewriter {
    /// Creates a rewriter.
    pub fn new() -> Self {
        Self {
            head_open: Regex::new(r"(?i)<head(?:\s[^>]*)?>").expect("valid head pattern"),
            html_open: Regex::new(r"(?i)<html(?:\s[^>]*)?>").expect("valid html pattern"),
            doctype: Regex::new(r"(?i)^\s*<!doctype[^>]*>").expect("valid doctype pattern"),
            comment: Regex::new(r"(?s)<!--.*?(?:-->|\z)").expect("valid comment pattern"),
        }
    }

    /// Returns true if `content_type` denotes an HTML document.
    pub fn is_html(content_type: Option<&str>) -> bool {
        content_type
            .and_then(|ct| ct.split(';').next())
            .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("text/html"))
    }

    /// Injects the observer script for `base` into `markup`.
    ///
    /// Returns `None` if the markup is empty or has no recognizable document
    /// structure.
    pub fn inject(&self, markup: &str, base: &Url) -> Option<String> {
        if markup.trim().is_empty() {
            return None;
        }

        let tag = format!(
            r#"<script src="{}" referrerpolicy="no-referrer"></script>"#,
            observer_script_src(base)
        );

        // Tags inside comments are not structure. Offsets in `visible` match
        // `markup` byte for byte.
        let visible = self.blank_comments(markup);
        let (at, insert) = if let Some(head) = self.head_open.find(&visible) {
            (head.end(), tag)
        } else if let Some(html) = self.html_open.find(&visible) {
            (html.end(), format!("<head>{tag}</head>"))
        } else if let Some(doctype) = self.doctype.find(&visible) {
            (doctype.end(), format!("<head>{tag}</head>"))
        } else if visible.trim_start().starts_with('<') {
            (0, format!("<head>{tag}</head>"))
        } else {
            return None;
        };

        let mut rewritten = String::with_capacity(markup.len() + insert.len());
        rewritten.push_str(&markup[..at]);
        rewritten.push_str(&insert);
        rewritten.push_str(&markup[at..]);
        Some(rewritten)
    }

    /// Replaces every comment with spaces of the same byte length.
    fn blank_comments(&self, markup: &str) -> String {
        self.comment
            .replace_all(markup, |caps: &regex::Captures<'_>| " ".repeat(caps[0].len()))
            .into_owned()
    }

    /// Rewrites a response body. Non-UTF-8 bodies are left alone.
    pub fn rewrite_body(&self, body: &[u8], base: &Url) -> Option<Vec<u8>> {
        let markup = std::str::from_utf8(body).ok()?;
        self.inject(markup, base).map(String::into_bytes)
    }
}

impl Default for ContentRewriter {
    fn default() -> Self {
        Self::new()
    }
}
