use crate::constants::endpoints;
use crate::error::GpytError;
use crate::llm::traits::*;
use serde::Deserialize;
use serde_json::Value;

/// Build an Anthropic messages request. System messages are hoisted into the
/// top-level `system` field.
fn build_request_body(model: &str, max_tokens: u32, messages: &[Message]) -> Value {
    let system_prompt: String = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let conv_messages: Vec<Value> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            serde_json::json!({
                "role": m.role,
                "content": m.content,
            })
        })
        .collect();

    let mut body = serde_json::json!({
        "model": model,
        "max_tokens": max_tokens,
        "messages": conv_messages,
    });

    if !system_prompt.is_empty() {
        body["system"] = Value::String(system_prompt);
    }

    body
}

#[derive(Debug, Deserialize)]
struct ClaudeApiResponse {
    content: Vec<ClaudeContent>,
    usage: Option<ClaudeUsage>,
}

#[derive(Debug, Deserialize)]
struct ClaudeContent {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ClaudeUsage {
    input_tokens: u32,
    output_tokens: u32,
}

/// One non-streamed call to the Anthropic messages API.
pub(crate) async fn complete_messages(
    client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
    model: &str,
    max_tokens: u32,
    messages: &[Message],
) -> Result<(String, Option<Usage>), GpytError> {
    let url = format!("{}/v1/messages", base_url.trim_end_matches('/'));
    let request_body = build_request_body(model, max_tokens, messages);

    let response = client
        .post(&url)
        .header("x-api-key", api_key)
        .header("anthropic-version", endpoints::ANTHROPIC_VERSION)
        .header("content-type", "application/json")
        .json(&request_body)
        .send()
        .await?;

    let status = response.status();
    let response_text = response.text().await?;

    if !status.is_success() {
        return Err(GpytError::Backend(format!(
            "Claude API error ({status}): {response_text}"
        )));
    }

    let api_response: ClaudeApiResponse = serde_json::from_str(&response_text)
        .map_err(|e| GpytError::Backend(format!("Failed to parse response: {e}")))?;

    let content: String = api_response
        .content
        .iter()
        .filter(|c| c.content_type == "text")
        .map(|c| c.text.as_str())
        .collect();

    Ok((
        content,
        api_response.usage.map(|u| Usage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
        }),
    ))
}
