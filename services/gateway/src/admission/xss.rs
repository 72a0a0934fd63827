//! Markup stripping for the bodies of state-changing requests.
//!
//! Form and JSON bodies are rewritten so every value is plain text: tags go,
//! script and style elements go with their content, and stray angle brackets
//! are escaped. Parameters listed under a matching allow rule keep their HTML.
//! Safe methods and other content types pass through untouched.

use std::borrow::Cow;
use std::sync::OnceLock;

use axum::http::Method;
use cms_pattern_match::AntMatcher;
use regex::Regex;
use serde_json::Value;
use url::form_urlencoded;

use crate::config::XssConfig;

/// JSON nested deeper than this is left as sent.
const MAX_JSON_DEPTH: usize = 32;

const ACTIVE_BLOCK_PATTERN: &str =
    r"(?is)<script\b[^>]*>.*?</script\s*>|<style\b[^>]*>.*?</style\s*>|<!--.*?-->";
const TAG_PATTERN: &str = r"(?s)</?[A-Za-z!][^>]*>";

fn active_block_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(ACTIVE_BLOCK_PATTERN).expect("active block pattern is valid"))
}

fn tag_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(TAG_PATTERN).expect("tag pattern is valid"))
}

/// Reduces `value` to text. Values without angle brackets come back borrowed.
pub fn strip_markup(value: &str) -> Cow<'_, str> {
    if !value.contains(['<', '>']) {
        return Cow::Borrowed(value);
    }
    let without_blocks = active_block_regex().replace_all(value, "");
    let text = tag_regex().replace_all(&without_blocks, "");
    Cow::Owned(text.replace('<', "&lt;").replace('>', "&gt;"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Form,
    Json,
}

impl BodyKind {
    fn from_content_type(content_type: &str) -> Option<Self> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if essence == "application/x-www-form-urlencoded" {
            Some(BodyKind::Form)
        } else if essence == "application/json" || essence.ends_with("+json") {
            Some(BodyKind::Json)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct XssSanitizer {
    enabled: bool,
    ignored_paths: Vec<String>,
    allow_html: Vec<(String, Vec<String>)>,
    matcher: AntMatcher,
}

impl XssSanitizer {
    pub fn from_config(config: &XssConfig) -> Self {
        Self {
            enabled: config.enabled,
            ignored_paths: config.ignored_paths.clone(),
            allow_html: config.allow_html.clone(),
            matcher: AntMatcher::paths(),
        }
    }

    /// The body format to clean for this request, if any.
    pub fn body_kind(&self, method: &Method, path: &str, content_type: Option<&str>) -> Option<BodyKind> {
        if !self.enabled || matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS) {
            return None;
        }
        if self
            .ignored_paths
            .iter()
            .any(|pattern| self.matcher.matches(pattern, path))
        {
            return None;
        }
        content_type.and_then(BodyKind::from_content_type)
    }

    /// First allow rule matching `path` wins.
    fn allowed_params(&self, path: &str) -> &[String] {
        self.allow_html
            .iter()
            .find(|(pattern, _)| self.matcher.matches(pattern, path))
            .map(|(_, params)| params.as_slice())
            .unwrap_or_default()
    }

    pub fn clean(&self, kind: BodyKind, path: &str, body: &[u8]) -> Option<Vec<u8>> {
        match kind {
            BodyKind::Form => self.clean_form(path, body),
            BodyKind::Json => self.clean_json(path, body),
        }
    }

    /// Re-encodes a urlencoded body with cleaned values. `None` when no value
    /// needed cleaning.
    pub fn clean_form(&self, path: &str, body: &[u8]) -> Option<Vec<u8>> {
        let allowed = self.allowed_params(path);
        let mut changed = false;
        let mut serializer = form_urlencoded::Serializer::new(String::new());

        for (name, value) in form_urlencoded::parse(body) {
            if allowed.iter().any(|param| param.as_str() == name.as_ref()) {
                serializer.append_pair(&name, &value);
                continue;
            }
            let cleaned = strip_markup(&value);
            changed |= matches!(cleaned, Cow::Owned(_));
            serializer.append_pair(&name, &cleaned);
        }

        changed.then(|| serializer.finish().into_bytes())
    }

    /// Cleans every string value of a JSON body. Allowed fields keep their
    /// whole subtree at any depth. `None` when nothing changed or the body is
    /// not JSON.
    pub fn clean_json(&self, path: &str, body: &[u8]) -> Option<Vec<u8>> {
        let mut value: Value = serde_json::from_slice(body).ok()?;
        if !clean_value(&mut value, self.allowed_params(path), 0) {
            return None;
        }
        serde_json::to_vec(&value).ok()
    }
}

fn clean_value(value: &mut Value, allowed: &[String], depth: usize) -> bool {
    if depth > MAX_JSON_DEPTH {
        return false;
    }

    match value {
        Value::String(text) => {
            let cleaned = match strip_markup(text) {
                Cow::Owned(cleaned) => Some(cleaned),
                Cow::Borrowed(_) => None,
            };
            match cleaned {
                Some(cleaned) => {
                    *text = cleaned;
                    true
                }
                None => false,
            }
        }
        Value::Array(items) => {
            let mut changed = false;
            for item in items.iter_mut() {
                changed |= clean_value(item, allowed, depth + 1);
            }
            changed
        }
        Value::Object(map) => {
            let mut changed = false;
            for (key, item) in map.iter_mut() {
                if allowed.iter().any(|param| param == key) {
                    continue;
                }
                changed |= clean_value(item, allowed, depth + 1);
            }
            changed
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sanitizer(allow_html: &[(&str, &[&str])]) -> XssSanitizer {
        XssSanitizer::from_config(&XssConfig {
            enabled: true,
            ignored_paths: vec!["/editor/raw/**".to_string()],
            allow_html: allow_html
                .iter()
                .map(|(pattern, params)| {
                    (
                        pattern.to_string(),
                        params.iter().map(|p| p.to_string()).collect(),
                    )
                })
                .collect(),
        })
    }

    #[test]
    fn strips_tags_and_script_bodies() {
        assert_eq!(strip_markup("<script>alert('xss')</script>hello"), "hello");
        assert_eq!(strip_markup("<img src=x onerror=alert(1)>hello"), "hello");
        assert_eq!(strip_markup("<p>notice</p><STYLE>p{}</style>"), "notice");
        assert_eq!(strip_markup("a < b"), "a &lt; b");
        assert!(matches!(strip_markup("plain text & more"), Cow::Borrowed(_)));
    }

    #[test]
    fn only_state_changing_requests_with_known_bodies() {
        let xss = sanitizer(&[]);
        let form = Some("application/x-www-form-urlencoded; charset=UTF-8");

        assert_eq!(xss.body_kind(&Method::POST, "/board", form), Some(BodyKind::Form));
        assert_eq!(
            xss.body_kind(&Method::PUT, "/board", Some("application/merge-patch+json")),
            Some(BodyKind::Json)
        );
        assert_eq!(xss.body_kind(&Method::GET, "/board", form), None);
        assert_eq!(xss.body_kind(&Method::POST, "/board", Some("multipart/form-data")), None);
        assert_eq!(xss.body_kind(&Method::POST, "/editor/raw/7", form), None);
        assert_eq!(xss.body_kind(&Method::POST, "/board", None), None);
    }

    #[test]
    fn form_values_are_cleaned_except_allowed_params() {
        let xss = sanitizer(&[("/board/**", &["content"])]);
        let body = b"title=%3Cscript%3Ealert(1)%3C%2Fscript%3Etest&content=%3Cp%3Ebody%3C%2Fp%3E";

        let cleaned = xss.clean_form("/board/write", body).unwrap();
        let pairs: Vec<(String, String)> = form_urlencoded::parse(&cleaned).into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("title".to_string(), "test".to_string()),
                ("content".to_string(), "<p>body</p>".to_string()),
            ]
        );

        // The allow rule is path scoped.
        let cleaned = xss.clean_form("/comments", body).unwrap();
        assert!(!String::from_utf8(cleaned).unwrap().contains("%3Cp%3E"));

        assert!(xss.clean_form("/board/write", b"title=hello&page=2").is_none());
    }

    #[test]
    fn json_strings_are_cleaned_at_every_depth() {
        let xss = sanitizer(&[("/board/**", &["content"])]);
        let body = serde_json::json!({
            "title": "<script>alert('xss')</script>hello",
            "content": "<p>본문</p><script>alert(1)</script>",
            "tags": ["<b>news</b>", "plain"],
            "author": { "name": "<i>kim</i>", "age": 30 },
        });

        let cleaned = xss
            .clean_json("/board/write", &serde_json::to_vec(&body).unwrap())
            .unwrap();
        let cleaned: Value = serde_json::from_slice(&cleaned).unwrap();
        assert_eq!(cleaned["title"], "hello");
        assert_eq!(cleaned["content"], "<p>본문</p><script>alert(1)</script>");
        assert_eq!(cleaned["tags"], serde_json::json!(["news", "plain"]));
        assert_eq!(cleaned["author"]["name"], "kim");
        assert_eq!(cleaned["author"]["age"], 30);

        assert!(xss.clean_json("/board/write", br#"{"title":"hello"}"#).is_none());
        assert!(xss.clean_json("/board/write", b"not json <b>").is_none());
    }
}
