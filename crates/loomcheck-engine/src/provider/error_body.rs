use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

pub const USAGE_LIMIT_MESSAGE: &str = "Model usage limit reached: the provider quota for this API key is \
     exhausted. Wait a few minutes before retrying, or check the plan and billing details.";

const MESSAGE_MAX_CHARS: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProviderErrorBody {
    pub code: Option<u16>,
    pub status: Option<String>,
    pub message: Option<String>,
}

/// Pull the first embedded JSON error body out of `text`, if any, such as
/// `{"error": {"code": 429, "status": "RESOURCE_EXHAUSTED"}}`.
pub fn parse(text: &str) -> Option<ProviderErrorBody> {
    let found = embedded_object_pattern().find(text)?;
    let value: Value = serde_json::from_str(found.as_str()).ok()?;
    let error = value.get("error").unwrap_or(&value);
    let body = ProviderErrorBody {
        code: error
            .get("code")
            .and_then(Value::as_u64)
            .and_then(|code| u16::try_from(code).ok()),
        status: error
            .get("status")
            .and_then(Value::as_str)
            .map(str::to_string),
        message: error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
    };
    if body == ProviderErrorBody::default() {
        return None;
    }
    Some(body)
}

pub fn is_quota_exhausted(text: &str) -> bool {
    match parse(text) {
        Some(body) => {
            body.code == Some(429)
                || body
                    .status
                    .as_deref()
                    .map(|status| status.eq_ignore_ascii_case("RESOURCE_EXHAUSTED"))
                    .unwrap_or(false)
        }
        None => text.contains("RESOURCE_EXHAUSTED"),
    }
}

/// Short operator-facing description of an HTTP error body.
pub fn describe(body: &str) -> String {
    if let Some(parsed) = parse(body) {
        let mut parts = Vec::new();
        if let Some(status) = parsed.status {
            parts.push(status);
        }
        if let Some(message) = parsed.message {
            parts.push(message);
        }
        if !parts.is_empty() {
            return truncate_text(&parts.join(": "), MESSAGE_MAX_CHARS);
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "empty error body".to_string();
    }
    truncate_text(trimmed, MESSAGE_MAX_CHARS)
}

fn embedded_object_pattern() -> &'static Regex {
    static EMBEDDED_OBJECT: OnceLock<Regex> = OnceLock::new();
    EMBEDDED_OBJECT
        .get_or_init(|| Regex::new(r"\{[\s\S]*\}").expect("embedded object regex compiles"))
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
