//! `{{key}}` placeholder templates for alert subjects and bodies.
//!
//! Rendering never fails: a placeholder whose key is missing from the payload
//! is left in the output verbatim, so a broken template still produces a
//! readable (if incomplete) alert.
//!
//! Templates may carry light markup. Payload values are data, never markup:
//! [`render_html`] escapes them, and the plain-text forms of a [`Template`]
//! are built by stripping the template first and substituting afterwards.
//!
//! ```
//! use alert_template::{Payload, render};
//! use serde_json::json;
//!
//! let mut payload = Payload::new();
//! payload.insert("battery".to_string(), json!(15));
//!
//! assert_eq!(render("Battery at {{battery}}%", &payload), "Battery at 15%");
//! assert_eq!(render("{{voltage}}V", &payload), "{{voltage}}V");
//! ```

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Flat key → scalar mapping a template is rendered against.
pub type Payload = BTreeMap<String, Value>;

static PLACEHOLDER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").unwrap());

static LINE_BREAK_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>|</p\s*>|</div\s*>|</li\s*>|</h[1-6]\s*>|</tr\s*>").unwrap());

static TAG_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());

static BLANK_RUN_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

/// Stringify a payload value for insertion into rendered text.
///
/// Strings are inserted without quotes and `null` renders as an empty string.
/// Numbers and booleans use their JSON form (`11.2`, `true`).
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Replace every `{{key}}` with the stringified `payload[key]`.
pub fn render(template: &str, payload: &Payload) -> String {
    substitute(template, payload, stringify)
}

/// Like [`render`], but every inserted value is HTML-escaped.
///
/// Markup written in the template itself is kept as is.
pub fn render_html(template: &str, payload: &Payload) -> String {
    substitute(template, payload, |value| escape_html(&stringify(value)))
}

fn substitute<F>(template: &str, payload: &Payload, format_value: F) -> String
where
    F: Fn(&Value) -> String,
{
    PLACEHOLDER_REGEX
        .replace_all(template, |caps: &Captures<'_>| match payload.get(&caps[1]) {
            Some(value) => format_value(value),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Keys referenced by a template, in order of first appearance.
pub fn placeholders(template: &str) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for caps in PLACEHOLDER_REGEX.captures_iter(template) {
        let key = &caps[1];
        if !keys.iter().any(|k| k == key) {
            keys.push(key.to_string());
        }
    }
    keys
}

/// Keys referenced by a template that the payload does not provide.
pub fn missing_keys(template: &str, payload: &Payload) -> Vec<String> {
    placeholders(template)
        .into_iter()
        .filter(|k| !payload.contains_key(k))
        .collect()
}

/// Strip markup from rendered rich text.
///
/// Block-level closers and `<br>` become line breaks, every other tag is
/// dropped, and the usual entities are decoded.
pub fn to_plain_text(rich: &str) -> String {
    let with_breaks = LINE_BREAK_REGEX.replace_all(rich, "\n");
    let stripped = TAG_REGEX.replace_all(&with_breaks, "");
    let decoded = decode_entities(&stripped);

    let lines: Vec<&str> = decoded.lines().map(str::trim).collect();
    let joined = lines.join("\n");
    BLANK_RUN_REGEX
        .replace_all(joined.trim(), "\n\n")
        .into_owned()
}

/// Escape text for embedding in HTML.
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

fn decode_entities(text: &str) -> String {
    // `&amp;` last so "&amp;lt;" decodes to "&lt;" and not "<".
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// A subject/body template pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    /// Subject line template.
    pub subject: String,
    /// Body template; may contain light markup.
    pub body: String,
}

/// Output of [`Template::render`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    /// Rendered subject line, plain text.
    pub subject: String,
    /// Rendered body as HTML: template markup kept, values escaped.
    pub body: String,
    /// Rendered body as plain text, values verbatim.
    pub plain_body: String,
}

impl Template {
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
        }
    }

    /// Render subject and body against `payload`.
    ///
    /// Markup is stripped from the template before substitution, so values
    /// containing `<`, `>` or `&` come through the plain forms untouched.
    pub fn render(&self, payload: &Payload) -> Rendered {
        Rendered {
            subject: render(&to_plain_text(&self.subject), payload),
            body: render_html(&self.body, payload),
            plain_body: render(&to_plain_text(&self.body), payload),
        }
    }

    /// Keys used by the subject or body that `payload` lacks.
    pub fn missing_keys(&self, payload: &Payload) -> Vec<String> {
        let mut missing = missing_keys(&self.subject, payload);
        for key in missing_keys(&self.body, payload) {
            if !missing.contains(&key) {
                missing.push(key);
            }
        }
        missing
    }
}
