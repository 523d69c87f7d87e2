use crate::config::Config;
use crate::logw;
use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde_json::{Value, json};
use std::path::Path;
use tokio::fs;

const MAX_TOKENS: u32 = 300;
const REQUEST_TIMEOUT_SECS: u64 = 120;
const LOG_SNIPPET_CHARS: usize = 800;

pub const MOTION_SYSTEM_PROMPT: &str = "You write short prompts that describe how a still image could be animated. \
For every image you receive, reply with exactly one concise prompt about visible motion: people acting, objects moving, or the camera moving. \
Prefer large, dynamic motion such as walking, running, jumping or sweeping camera moves over subtle motion like standing or sitting. \
Name the subject first, then its motion, then anything else. \
Example: \"The girl moves gracefully, with clear movements, full of charm.\" \
Never explain, ask questions, or offer alternatives.";

fn snippet(raw: &str) -> String {
    raw.chars().take(LOG_SNIPPET_CHARS).collect()
}

pub fn image_mime(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("png") => "image/png",
        _ => "image/jpeg",
    }
}

pub fn image_data_url(bytes: &[u8], mime: &str) -> String {
    format!("data:{};base64,{}", mime, STANDARD.encode(bytes))
}

pub fn vision_request_body(model: &str, data_url: &str) -> Value {
    json!({
        "model": model,
        "messages": [
            {"role": "system", "content": MOTION_SYSTEM_PROMPT},
            {
                "role": "user",
                "content": [
                    {"type": "image_url", "image_url": {"url": data_url}}
                ]
            }
        ],
        "max_tokens": MAX_TOKENS,
    })
}

/// Trimmed text of `choices[0].message.content`, if there is any.
pub fn extract_first_choice(resp_json: &str) -> Option<String> {
    let root: Value = serde_json::from_str(resp_json).ok()?;

    if let Some(msg) = root.pointer("/error/message").and_then(Value::as_str) {
        logw(format!("OpenAI error message: {}", msg));
        return None;
    }

    let text = root
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)?
        .trim();
    if text.is_empty() {
        return None;
    }
    Some(text.to_string())
}

/// Asks the vision model for a motion prompt for `image_path`.
///
/// A non-2xx answer is logged and reported as `Ok(None)`; only transport and
/// file errors come back as `Err`.
pub async fn openai_motion_prompt(client: &Client, cfg: &Config, image_path: &Path) -> Result<Option<String>> {
    let bytes = fs::read(image_path)
        .await
        .with_context(|| format!("Failed to read image {}", image_path.display()))?;
    let data_url = image_data_url(&bytes, image_mime(image_path));
    let body = vision_request_body(&cfg.model, &data_url);

    let resp = client
        .post(cfg.chat_completions_url())
        .bearer_auth(&cfg.openai_key)
        .json(&body)
        .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .send()
        .await
        .context("OpenAI request failed")?;

    let status = resp.status();
    let raw = resp.text().await.unwrap_or_default();
    tracing::debug!(status = status.as_u16(), bytes = raw.len(), image = %image_path.display(), "vision response");

    if !status.is_success() {
        logw(format!("OpenAI HTTP {}", status.as_u16()));
        if !raw.is_empty() {
            logw(format!("OpenAI raw body: {}", snippet(&raw)));
        }
        return Ok(None);
    }

    let text = extract_first_choice(&raw);
    if text.is_none() && !raw.is_empty() {
        logw(format!("OpenAI response parse failed: {}", snippet(&raw)));
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_carries_model_instruction_and_inline_image() {
        let url = image_data_url(b"\x89PNG", "image/png");
        assert_eq!(url, "data:image/png;base64,iVBORw==");

        let body = vision_request_body("gpt-4o", &url);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["max_tokens"], 300);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], MOTION_SYSTEM_PROMPT);
        assert_eq!(body["messages"][1]["content"][0]["type"], "image_url");
        assert_eq!(body["messages"][1]["content"][0]["image_url"]["url"], url);
    }

    #[test]
    fn mime_follows_extension() {
        assert_eq!(image_mime(Path::new("a/b.PNG")), "image/png");
        assert_eq!(image_mime(Path::new("a/b.jpeg")), "image/jpeg");
        assert_eq!(image_mime(Path::new("a/b")), "image/jpeg");
    }

    #[test]
    fn first_choice_is_trimmed() {
        let raw = r#"{"choices":[{"message":{"content":"  The dog sprints across the field.\n"}},{"message":{"content":"other"}}]}"#;
        assert_eq!(
            extract_first_choice(raw).as_deref(),
            Some("The dog sprints across the field.")
        );
    }

    #[test]
    fn errors_and_empty_content_yield_nothing() {
        assert_eq!(extract_first_choice(r#"{"error":{"message":"bad key"}}"#), None);
        assert_eq!(extract_first_choice(r#"{"choices":[{"message":{"content":"   "}}]}"#), None);
        assert_eq!(extract_first_choice(r#"{"choices":[]}"#), None);
        assert_eq!(extract_first_choice("not json"), None);
    }
}
