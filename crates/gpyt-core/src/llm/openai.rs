use crate::constants::{defaults, endpoints, models, prompts};
use crate::error::GpytError;
use crate::llm::history::ChatState;
use crate::llm::traits::*;
use futures::channel::mpsc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Metered backend speaking the OpenAI chat completions API with native streaming.
pub struct MeteredBackend {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    label: String,
    state: ChatState,
}

impl MeteredBackend {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: super::http_client(Duration::from_secs(defaults::REQUEST_TIMEOUT_SECS)),
            api_key: api_key.into(),
            model: models::DEFAULT_MODEL.to_string(),
            base_url: endpoints::OPENAI_BASE_URL.to_string(),
            label: label_for(models::DEFAULT_MODEL),
            state: ChatState::new(
                Some(prompts::SYSTEM_PROMPT.to_string()),
                models::DEFAULT_MODEL,
                true,
            ),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self.label = label_for(&self.model);
        self.state = ChatState::new(
            self.state.system_prompt(),
            &self.model,
            self.state.memory(),
        );
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.state = ChatState::new(Some(prompt.into()), &self.model, self.state.memory());
        self
    }

    pub fn with_memory(self, enabled: bool) -> Self {
        self.state.set_memory(enabled);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = super::http_client(timeout);
        self
    }

    /// Record the user's input and build the request for this turn.
    pub fn prepare_request(&self, input: &str) -> Vec<Message> {
        self.state.begin_turn(input)
    }
}

fn label_for(model: &str) -> String {
    match model {
        "gpt-3.5-turbo" => "GPT 3.5".to_string(),
        "gpt-4" => "GPT 4".to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

fn chat_url(base_url: &str) -> String {
    format!("{}/v1/chat/completions", base_url.trim_end_matches('/'))
}

/// One non-streamed chat completion against any OpenAI-compatible endpoint.
pub(crate) async fn complete_chat(
    client: &reqwest::Client,
    base_url: &str,
    api_key: Option<&str>,
    model: &str,
    messages: &[Message],
) -> Result<(String, Option<Usage>), GpytError> {
    let body = OpenAIRequest {
        model,
        messages,
        stream: None,
        stream_options: None,
    };

    let mut request = client.post(chat_url(base_url)).json(&body);
    if let Some(key) = api_key.filter(|k| !k.is_empty()) {
        request = request.header("Authorization", format!("Bearer {key}"));
    }
    let response = request.send().await?;

    let status = response.status();
    let response_text = response.text().await?;

    if !status.is_success() {
        return Err(GpytError::Backend(format!(
            "OpenAI API error ({status}): {response_text}"
        )));
    }

    let api_response: OpenAIResponse = serde_json::from_str(&response_text)
        .map_err(|e| GpytError::Backend(format!("Failed to parse response: {e}")))?;

    let choice = api_response
        .choices
        .first()
        .ok_or_else(|| GpytError::Backend("No response from API".into()))?;

    Ok((
        choice.message.content.clone().unwrap_or_default(),
        api_response.usage.map(|u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        }),
    ))
}

/// Interpret the payload of one SSE `data:` line.
pub(crate) fn parse_sse_data(data: &str) -> Vec<StreamEvent> {
    if data == "[DONE]" {
        return vec![StreamEvent::Done];
    }

    let event: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) => return vec![StreamEvent::Unrecognized(data.to_string())],
    };

    let mut events = Vec::new();

    // The final chunk carries usage with an empty choices array when
    // stream_options.include_usage is set.
    if let Some(usage) = event.get("usage").filter(|u| !u.is_null()) {
        let input = usage
            .get("prompt_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;
        let output = usage
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;
        if input > 0 || output > 0 {
            events.push(StreamEvent::Usage(Usage {
                input_tokens: input,
                output_tokens: output,
            }));
        }
    }

    let content = event
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|choices| choices.first())
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str());

    match content {
        Some(text) if !text.is_empty() => events.push(StreamEvent::TextDelta(text.to_string())),
        _ if events.is_empty() => events.push(StreamEvent::Unrecognized(data.to_string())),
        _ => {}
    }

    events
}

/// Splits a byte stream into lines. Bytes are decoded only once a whole line
/// has arrived, so a character split across network reads stays intact.
#[derive(Debug, Default)]
pub(crate) struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    /// Append `bytes` and return every line completed by them, trimmed.
    /// A line that is not valid UTF-8 comes back as `Err` with a lossy copy.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<Result<String, String>> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=end).collect();
            lines.push(match String::from_utf8(raw) {
                Ok(line) => Ok(line.trim().to_string()),
                Err(e) => Err(String::from_utf8_lossy(e.as_bytes()).trim().to_string()),
            });
        }
        lines
    }
}

/// Start a streamed chat completion and pump its SSE lines into a channel.
pub(crate) async fn stream_chat(
    client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
    model: &str,
    messages: &[Message],
) -> Result<ChunkStream, GpytError> {
    let body = OpenAIRequest {
        model,
        messages,
        stream: Some(true),
        stream_options: Some(StreamOptions {
            include_usage: true,
        }),
    };

    let response = client
        .post(chat_url(base_url))
        .header("Authorization", format!("Bearer {api_key}"))
        .json(&body)
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(GpytError::Backend(format!(
            "OpenAI API error ({status}): {text}"
        )));
    }

    let (tx, rx) = mpsc::unbounded();

    let mut stream = response.bytes_stream();
    tokio::spawn(async move {
        use futures::StreamExt;
        let mut lines = SseLineBuffer::default();

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    let _ = tx.unbounded_send(StreamEvent::Error(e.to_string()));
                    return;
                }
            };

            for line in lines.push(&chunk) {
                let line = match line {
                    Ok(line) => line,
                    Err(lossy) => {
                        let _ = tx.unbounded_send(StreamEvent::Unrecognized(lossy));
                        continue;
                    }
                };

                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };

                for event in parse_sse_data(data.trim()) {
                    let done = event == StreamEvent::Done;
                    let _ = tx.unbounded_send(event);
                    if done {
                        return;
                    }
                }
            }
        }

        let _ = tx.unbounded_send(StreamEvent::Done);
    });

    Ok(rx)
}

#[async_trait::async_trait]
impl Backend for MeteredBackend {
    fn name(&self) -> &str {
        &self.label
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supports_native_streaming: true,
            has_system_prompt: true,
            tracks_usage: true,
        }
    }

    async fn get_response(&self, input: &str) -> Result<String, GpytError> {
        let messages = self.prepare_request(input);
        let (content, usage) = complete_chat(
            &self.client,
            &self.base_url,
            Some(&self.api_key),
            &self.model,
            &messages,
        )
        .await?;
        if let Some(usage) = usage {
            self.state.report_usage(usage);
        }
        self.state.finish_turn(&content);
        Ok(content)
    }

    async fn get_response_stream(&self, input: &str) -> Result<ChunkStream, GpytError> {
        let messages = self.prepare_request(input);
        stream_chat(
            &self.client,
            &self.base_url,
            &self.api_key,
            &self.model,
            &messages,
        )
        .await
    }

    async fn summarize(&self, initial_message: &str) -> Result<String, GpytError> {
        let messages = [
            Message::system(prompts::SUMMARY_PROMPT),
            Message::user(initial_message.trim_end()),
        ];
        let (summary, _) = complete_chat(
            &self.client,
            &self.base_url,
            Some(&self.api_key),
            &self.model,
            &messages,
        )
        .await
        .map_err(|e| GpytError::Summary(e.to_string()))?;
        Ok(summary)
    }

    fn set_history(&self, prior: &[Message]) {
        self.state.set_history(prior);
    }

    fn clear_history(&self) {
        self.state.clear();
    }

    fn record_usage(&self, usage: Usage) {
        self.state.report_usage(usage);
    }

    fn log_assistant_response(&self, final_text: &str) {
        self.state.finish_turn(final_text);
    }

    fn history(&self) -> Vec<Message> {
        self.state.messages()
    }

    fn memory(&self) -> bool {
        self.state.memory()
    }

    fn set_memory(&self, enabled: bool) {
        self.state.set_memory(enabled);
    }

    fn usage(&self) -> Option<UsageSnapshot> {
        Some(self.state.usage())
    }
}
