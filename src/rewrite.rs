//! HTML rewriting passes
//! Patterns compile once from the backend origin; the public origin side
//! varies per request and is spliced in at replacement time

use anyhow::{Context, Result};
use regex::{Captures, NoExpand, Regex};
use url::Url;

/// Compiled rewrite patterns for one backend origin.
///
/// The origin pattern matches `http://` or `https://` (either scheme,
/// case-insensitive, regardless of how the backend is configured) followed
/// by the backend host, including the explicit port when there is one.
pub struct RewriteRules {
    origin: Regex,
    attr: Regex,
    base_href: Regex,
    base_tag: Regex,
    head_open: Regex,
    single_quoted: Regex,
    double_quoted: Regex,
}

impl RewriteRules {
    /// Compile the pass patterns for a backend origin
    pub fn new(backend: &Url) -> Result<Self> {
        let host = backend.host_str().context("backend URL has no host")?;
        let mut literal = regex::escape(host);
        if let Some(port) = backend.port() {
            literal.push_str(&format!(":{}", port));
        }

        Ok(Self {
            origin: Regex::new(&format!(r"(?i)https?://{}", literal))?,
            attr: Regex::new(&format!(
                r#"(?i)(href|src|action)=['"]https?://{}([^'"]*)['"]"#,
                literal
            ))?,
            base_href: Regex::new(r#"(?i)<base\s+href=["'][^"']*["']"#)?,
            base_tag: Regex::new(r"(?i)<base[\s/>]")?,
            head_open: Regex::new(r"(?i)<head(\s[^>]*)?>")?,
            single_quoted: Regex::new(&format!(r#"(?i)'https?://{}([^'"]*)'"#, literal))?,
            double_quoted: Regex::new(&format!(r#"(?i)"https?://{}([^'"]*)""#, literal))?,
        })
    }

    /// Run the passes in order. Site-root paths (`href="/x"`) are left
    /// untouched; the forced `<base>` makes them resolve against the
    /// public origin. Non-matching content comes through byte-identical.
    pub fn rewrite_html(&self, html: &str, public_origin: &str) -> String {
        let html = self.rewrite_origins(html, public_origin);
        let html = self.rewrite_attributes(&html, public_origin);
        let html = self.force_base_tag(&html, public_origin);
        self.rewrite_quoted(&html, public_origin)
    }

    /// Replace every absolute backend-origin URL, wherever it appears
    fn rewrite_origins(&self, html: &str, public_origin: &str) -> String {
        self.origin
            .replace_all(html, NoExpand(public_origin))
            .into_owned()
    }

    /// Rewrite href/src/action attributes pointing at the backend; the
    /// rewritten attribute is emitted double-quoted
    fn rewrite_attributes(&self, html: &str, public_origin: &str) -> String {
        self.attr
            .replace_all(html, |caps: &Captures| {
                format!(r#"{}="{}{}""#, &caps[1], public_origin, &caps[2])
            })
            .into_owned()
    }

    /// Point any existing `<base>` at the public origin, or insert one right
    /// after the opening `<head>` tag. A document with no `<head>` gets the
    /// tag at the very start.
    fn force_base_tag(&self, html: &str, public_origin: &str) -> String {
        let replacement = format!(r#"<base href="{}/""#, public_origin);
        let html = self
            .base_href
            .replace_all(html, NoExpand(&replacement))
            .into_owned();

        if self.base_tag.is_match(&html) {
            return html;
        }

        let tag = format!(r#"<base href="{}/">"#, public_origin);
        match self.head_open.find(&html) {
            Some(head) => {
                let mut out = String::with_capacity(html.len() + tag.len());
                out.push_str(&html[..head.end()]);
                out.push_str(&tag);
                out.push_str(&html[head.end()..]);
                out
            }
            None => format!("{}{}", tag, html),
        }
    }

    /// Rewrite quoted string literals (e.g. in inline scripts), preserving
    /// the quote character. One pattern per quote kind: the match must not
    /// run past the closing quote.
    fn rewrite_quoted(&self, html: &str, public_origin: &str) -> String {
        let html = self.single_quoted.replace_all(html, |caps: &Captures| {
            format!("'{}{}'", public_origin, &caps[1])
        });
        self.double_quoted
            .replace_all(&html, |caps: &Captures| {
                format!(r#""{}{}""#, public_origin, &caps[1])
            })
            .into_owned()
    }
}
