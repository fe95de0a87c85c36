//! Client for the Anthropic Messages API.
//!
//! Every model call in Tailor goes through [`LlmClient`]. A call is a single
//! HTTP request: the customization pipeline owns timeouts, retry budget and
//! backoff, so nothing here loops.
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub mod prompts;

pub const DEFAULT_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Hardcoded so a config change can't silently swap the model.
pub const MODEL: &str = "claude-sonnet-4-5";
/// A rewritten resume rarely needs more than a few thousand tokens.
const MAX_OUTPUT_TOKENS: u32 = 8192;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("LLM returned empty content")]
    EmptyContent,

    /// The completion hit the output token limit and ends mid-document.
    #[error("LLM output truncated after {0} tokens")]
    Truncated(u32),
}

impl LlmError {
    /// 429, 5xx, transport failures and empty or cut-off completions are
    /// worth retrying; any other 4xx means the request itself is bad.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Http(_) | LlmError::EmptyContent | LlmError::Truncated(_) => true,
            LlmError::Api { status, .. } => *status == 429 || *status >= 500,
        }
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'static str,
    max_tokens: u32,
    system: &'a str,
    messages: [Turn<'a>; 1],
}

#[derive(Serialize)]
struct Turn<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<Block>,
    stop_reason: Option<String>,
    usage: TokenUsage,
}

#[derive(Deserialize)]
struct Block {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct TokenUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

impl MessagesResponse {
    /// Concatenated text blocks, in order.
    fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter(|b| b.kind == "text")
            .map(|b| b.text.as_str())
            .collect()
    }
}

#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    api_key: String,
    endpoint: String,
}

impl LlmClient {
    /// `transport_timeout` only backstops the caller's own deadline.
    pub fn new(
        api_key: String,
        endpoint: String,
        transport_timeout: Duration,
    ) -> Result<Self, LlmError> {
        let http = Client::builder().timeout(transport_timeout).build()?;
        Ok(Self {
            http,
            api_key,
            endpoint,
        })
    }

    /// Sends one user turn and returns the model's text with any wrapping
    /// code fence removed.
    pub async fn call_text(&self, prompt: &str, system: &str) -> Result<String, LlmError> {
        let body = MessagesRequest {
            model: MODEL,
            max_tokens: MAX_OUTPUT_TOKENS,
            system,
            messages: [Turn {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .http
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let raw = response.text().await.unwrap_or_default();
            return Err(api_error(status, raw));
        }

        let parsed: MessagesResponse = response.json().await?;
        debug!(
            input_tokens = parsed.usage.input_tokens,
            output_tokens = parsed.usage.output_tokens,
            stop_reason = parsed.stop_reason.as_deref().unwrap_or("none"),
            "LLM call finished"
        );

        if parsed.stop_reason.as_deref() == Some("max_tokens") {
            warn!("LLM output hit the {MAX_OUTPUT_TOKENS} token limit");
            return Err(LlmError::Truncated(parsed.usage.output_tokens));
        }

        let text = parsed.joined_text();
        let text = strip_code_fences(&text);
        if text.is_empty() {
            return Err(LlmError::EmptyContent);
        }
        Ok(text.to_string())
    }
}

/// Prefers the message from Anthropic's error envelope over the raw body.
fn api_error(status: StatusCode, raw: String) -> LlmError {
    let message = serde_json::from_str::<ErrorEnvelope>(&raw)
        .map(|e| e.error.message)
        .unwrap_or(raw);
    LlmError::Api {
        status: status.as_u16(),
        message,
    }
}

/// Removes a surrounding ``` fence, with or without an info string.
pub fn strip_code_fences(text: &str) -> &str {
    let text = text.trim();
    let Some(opened) = text.strip_prefix("```") else {
        return text;
    };
    // The info string ("markdown", "md") runs to the first newline.
    let body = match opened.find('\n') {
        Some(idx) if !opened[..idx].contains(' ') => &opened[idx + 1..],
        _ => opened,
    };
    let body = body.trim_end();
    body.strip_suffix("```").unwrap_or(body).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_fences_with_language_tag() {
        let input = "```markdown\n# Jane Doe\n- Rust\n```";
        assert_eq!(strip_code_fences(input), "# Jane Doe\n- Rust");
    }

    #[test]
    fn test_strip_code_fences_without_tag() {
        assert_eq!(strip_code_fences("```\n## Skills\n```"), "## Skills");
    }

    #[test]
    fn test_strip_code_fences_no_fences() {
        assert_eq!(strip_code_fences("  # Jane Doe\n"), "# Jane Doe");
    }

    #[test]
    fn test_strip_code_fences_unterminated() {
        assert_eq!(strip_code_fences("```md\n# Jane"), "# Jane");
    }

    #[test]
    fn test_retryable_classification() {
        let api = |status| LlmError::Api {
            status,
            message: String::new(),
        };
        assert!(api(429).is_retryable());
        assert!(api(529).is_retryable());
        assert!(!api(400).is_retryable());
        assert!(!api(401).is_retryable());
        assert!(LlmError::EmptyContent.is_retryable());
        assert!(LlmError::Truncated(8192).is_retryable());
    }

    #[test]
    fn test_api_error_prefers_envelope_message() {
        let raw = r#"{"type":"error","error":{"type":"invalid_request_error","message":"prompt is too long"}}"#;
        match api_error(StatusCode::BAD_REQUEST, raw.to_string()) {
            LlmError::Api { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "prompt is too long");
            }
            other => panic!("unexpected {other:?}"),
        }
        match api_error(StatusCode::BAD_GATEWAY, "upstream reset".to_string()) {
            LlmError::Api { message, .. } => assert_eq!(message, "upstream reset"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_joined_text_skips_non_text_blocks() {
        let parsed: MessagesResponse = serde_json::from_str(
            r##"{"content":[{"type":"text","text":"# Jane"},{"type":"tool_use","id":"x"},{"type":"text","text":"\n- Rust"}],
                "stop_reason":"end_turn","usage":{"input_tokens":10,"output_tokens":4}}"##,
        )
        .unwrap();
        assert_eq!(parsed.joined_text(), "# Jane\n- Rust");
    }
}
