use futures::StreamExt;
use gpyt_core::context::{ConversationArchive, ConversationStore};
use gpyt_core::llm::*;
use gpyt_core::session::{ChatSession, StreamAssembler};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

// ========================================================================
// Minimal HTTP responder
// ========================================================================

/// Serve `count` connections with the same canned response. Resolves to the
/// raw requests received.
async fn serve(
    count: usize,
    status: &'static str,
    content_type: &'static str,
    body: String,
) -> (String, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());

    let handle = tokio::spawn(async move {
        let mut requests = Vec::new();
        for _ in 0..count {
            let (mut socket, _) = listener.accept().await.unwrap();
            requests.push(read_request(&mut socket).await);
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        }
        requests
    });

    (base_url, handle)
}

/// Serve one connection: send the response head, then each body piece after
/// its delay. The body is delimited by closing the connection.
async fn serve_pieces(
    content_type: &'static str,
    pieces: Vec<(Duration, Vec<u8>)>,
) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_request(&mut socket).await;
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nConnection: close\r\n\r\n"
        );
        socket.write_all(head.as_bytes()).await.unwrap();
        socket.flush().await.unwrap();
        for (delay, piece) in pieces {
            tokio::time::sleep(delay).await;
            if socket.write_all(&piece).await.is_err() {
                break;
            }
            socket.flush().await.ok();
        }
        socket.shutdown().await.ok();
        request
    });

    (base_url, handle)
}

fn sse_line(data: &str) -> String {
    format!("data: {data}\n\n")
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);

        let text = String::from_utf8_lossy(&data).to_string();
        if let Some(header_end) = text.find("\r\n\r\n") {
            let content_length = text[..header_end]
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if data.len() >= header_end + 4 + content_length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&data).to_string()
}

fn body_of(request: &str) -> serde_json::Value {
    let body = request.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("");
    serde_json::from_str(body).unwrap()
}

async fn collect_text(stream: ChunkStream) -> String {
    let events: Vec<StreamEvent> = stream.collect().await;
    events
        .into_iter()
        .filter_map(|e| match e {
            StreamEvent::TextDelta(t) => Some(t),
            _ => None,
        })
        .collect()
}

// ========================================================================
// Metered backend (OpenAI SSE)
// ========================================================================

#[tokio::test]
async fn test_metered_backend_streams_sse() {
    let sse = [
        r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#,
        r#"data: {"choices":[{"delta":{"content":"The sun "}}]}"#,
        r#"data: {"choices":[{"delta":{"content":"is far."}}]}"#,
        "data: [DONE]",
    ]
    .join("\n\n")
        + "\n\n";
    let (base_url, server) = serve(1, "200 OK", "text/event-stream", sse).await;

    let backend = MeteredBackend::new("sk-test").with_base_url(&base_url);
    let stream = backend.get_response_stream("How far is the sun?").await.unwrap();

    let mut assembler = StreamAssembler::new(10);
    let text = assembler.drain(stream, |_| {}).await;
    assert_eq!(text, "The sun is far.");
    assert_eq!(assembler.skipped(), 1);

    let requests = server.await.unwrap();
    let request = &requests[0];
    assert!(request.starts_with("POST /v1/chat/completions"));
    assert!(request.to_ascii_lowercase().contains("authorization: bearer sk-test"));
    let body = body_of(request);
    assert_eq!(body["stream"], true);
    assert_eq!(body["model"], "gpt-3.5-turbo");
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][1]["content"], "How far is the sun?");
}

#[tokio::test]
async fn test_metered_stream_keeps_characters_split_across_reads() {
    let body = sse_line(r#"{"choices":[{"delta":{"content":"café ☀"}}]}"#) + &sse_line("[DONE]");
    let split = body.find('é').unwrap() + 1;
    let bytes = body.into_bytes();
    let (base_url, _server) = serve_pieces(
        "text/event-stream",
        vec![
            (Duration::ZERO, bytes[..split].to_vec()),
            (Duration::from_millis(50), bytes[split..].to_vec()),
        ],
    )
    .await;

    let backend = MeteredBackend::new("sk-test").with_base_url(&base_url);
    let stream = backend.get_response_stream("coffee?").await.unwrap();

    let mut assembler = StreamAssembler::new(10);
    assert_eq!(assembler.drain(stream, |_| {}).await, "café ☀");
    assert_eq!(assembler.skipped(), 0);
}

#[tokio::test]
async fn test_metered_stream_may_outlast_request_timeout() {
    let gap = Duration::from_millis(350);
    let (base_url, _server) = serve_pieces(
        "text/event-stream",
        vec![
            (
                Duration::ZERO,
                sse_line(r#"{"choices":[{"delta":{"content":"The sun "}}]}"#).into_bytes(),
            ),
            (gap, sse_line(r#"{"choices":[{"delta":{"content":"is "}}]}"#).into_bytes()),
            (gap, sse_line(r#"{"choices":[{"delta":{"content":"far."}}]}"#).into_bytes()),
            (gap, sse_line("[DONE]").into_bytes()),
        ],
    )
    .await;

    // No single gap reaches the timeout, but the whole stream does.
    let backend = MeteredBackend::new("sk-test")
        .with_base_url(&base_url)
        .with_timeout(Duration::from_millis(600));
    let stream = backend.get_response_stream("How far is the sun?").await.unwrap();

    let mut assembler = StreamAssembler::new(10);
    assert_eq!(assembler.drain(stream, |_| {}).await, "The sun is far.");
    assert!(!assembler.used_fallback());
}

#[tokio::test]
async fn test_metered_stream_stalled_past_timeout_fails() {
    let (base_url, _server) = serve_pieces(
        "text/event-stream",
        vec![
            (
                Duration::ZERO,
                sse_line(r#"{"choices":[{"delta":{"content":"The sun "}}]}"#).into_bytes(),
            ),
            (Duration::from_secs(3), sse_line("[DONE]").into_bytes()),
        ],
    )
    .await;

    let backend = MeteredBackend::new("sk-test")
        .with_base_url(&base_url)
        .with_timeout(Duration::from_millis(300));
    let stream = backend.get_response_stream("hi").await.unwrap();
    let events: Vec<StreamEvent> = stream.collect().await;

    assert_eq!(events[0], StreamEvent::TextDelta("The sun ".into()));
    assert!(matches!(events.last(), Some(StreamEvent::Error(_))));
}

#[tokio::test]
async fn test_metered_backend_error_status_is_backend_error() {
    let (base_url, _server) = serve(
        1,
        "429 Too Many Requests",
        "application/json",
        r#"{"error":{"message":"slow down"}}"#.to_string(),
    )
    .await;

    let backend = MeteredBackend::new("sk-test").with_base_url(&base_url);
    let err = backend.get_response_stream("hi").await.err().unwrap();
    assert!(err.is_backend());
    assert!(err.to_string().contains("429"));
}

#[tokio::test]
async fn test_metered_summary_does_not_touch_history() {
    let body = r#"{"choices":[{"message":{"content":"Sun distance"}}]}"#.to_string();
    let (base_url, server) = serve(1, "200 OK", "application/json", body).await;

    let backend = MeteredBackend::new("sk-test").with_base_url(&base_url);
    let summary = backend.get_conversation_summary("How far is the sun?").await;
    assert_eq!(summary, "Sun distance");
    assert_eq!(backend.history().len(), 1);

    let request = &server.await.unwrap()[0];
    let body = body_of(request);
    assert!(body.get("stream").is_none());
    assert!(body["messages"][0]["content"]
        .as_str()
        .unwrap()
        .contains("6 words"));
}

#[tokio::test]
async fn test_metered_usage_tracks_logged_turns() {
    let body = r#"{"choices":[{"message":{"content":"Roughly 150 million kilometres."}}]}"#.to_string();
    let (base_url, _server) = serve(1, "200 OK", "application/json", body).await;

    let backend = MeteredBackend::new("sk-test")
        .with_model("gpt-4")
        .with_base_url(&base_url);
    backend.get_response("How far is the sun?").await.unwrap();

    let usage = backend.usage().unwrap();
    assert!(usage.input_tokens > 0);
    assert!(usage.output_tokens > 0);
    assert!(usage.estimated_cost > 0.0);
    assert_eq!(usage.context_limit, Some(8_192));

    backend.clear_history();
    assert_eq!(backend.usage().unwrap().input_tokens, 0);
}

// ========================================================================
// Free backend (Ollama)
// ========================================================================

#[tokio::test]
async fn test_free_backend_fakes_stream_and_records_pair() {
    let body = r#"{"message":{"role":"assistant","content":"Hello there, friend"},"done":true}"#.to_string();
    let (base_url, server) = serve(1, "200 OK", "application/json", body).await;

    let backend = FreeBackend::new("llama3").with_base_url(&base_url);
    let stream = backend.get_response_stream("hi").await.unwrap();
    let events: Vec<StreamEvent> = stream.collect().await;

    assert_eq!(
        events,
        vec![
            StreamEvent::TextDelta("Hello th".into()),
            StreamEvent::TextDelta("ere, fri".into()),
            StreamEvent::TextDelta("end".into()),
            StreamEvent::Done,
        ]
    );
    assert_eq!(
        backend.history(),
        vec![Message::user("hi"), Message::assistant("Hello there, friend")]
    );

    let request = &server.await.unwrap()[0];
    assert!(request.starts_with("POST /api/chat"));
    let body = body_of(request);
    assert_eq!(body["stream"], false);
    assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    assert_eq!(body["messages"][0]["role"], "user");
}

#[tokio::test]
async fn test_free_backend_without_memory_drops_stale_turns() {
    let body = r#"{"message":{"role":"assistant","content":"fresh"}}"#.to_string();
    let (base_url, server) = serve(1, "200 OK", "application/json", body).await;

    let backend = FreeBackend::new("llama3")
        .with_base_url(&base_url)
        .with_memory(false);
    backend.set_history(&[Message::user("old question"), Message::assistant("old answer")]);

    assert_eq!(backend.get_response("new question").await.unwrap(), "fresh");
    assert!(backend.history().is_empty());

    let request = &server.await.unwrap()[0];
    let body = body_of(request);
    assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    assert_eq!(body["messages"][0]["content"], "new question");
}

#[tokio::test]
async fn test_free_backend_timeout_is_backend_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let _hold = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(socket);
    });

    let backend = FreeBackend::default()
        .with_base_url(&base_url)
        .with_timeout(Duration::from_millis(200));
    let err = backend.get_response("hi").await.err().unwrap();
    assert!(err.is_backend());
    assert!(backend.history().is_empty());
}

// ========================================================================
// Provider backend
// ========================================================================

#[tokio::test]
async fn test_openai_compatible_provider_without_key() {
    let body = r#"{"choices":[{"message":{"content":"local answer"}}]}"#.to_string();
    let (base_url, server) = serve(1, "200 OK", "application/json", body).await;

    let mut config = ProviderConfig::builtin(ProviderId::LmStudio);
    config.base_url = base_url;
    let backend = ProviderBackend::new(&config, "qwen").unwrap().with_chunk_chars(5);

    let text = collect_text(backend.get_response_stream("hello").await.unwrap()).await;
    assert_eq!(text, "local answer");
    backend.log_assistant_response(&text);
    assert_eq!(backend.history().len(), 3);

    let request = &server.await.unwrap()[0];
    assert!(!request.to_ascii_lowercase().contains("authorization:"));
    assert_eq!(body_of(request)["model"], "qwen");
}

#[tokio::test]
async fn test_claude_provider_uses_messages_api() {
    std::env::set_var("GPYT_TEST_CLAUDE_KEY", "ant-key");
    let body = r#"{"content":[{"type":"text","text":"Hi "},{"type":"text","text":"there"}],"usage":{"input_tokens":5,"output_tokens":2}}"#.to_string();
    let (base_url, server) = serve(1, "200 OK", "application/json", body).await;

    let config = ProviderConfig {
        id: ProviderId::Claude,
        enabled: true,
        api_key_env: "GPYT_TEST_CLAUDE_KEY".into(),
        base_url,
        default_model: "claude-3-haiku-20240307".into(),
    };
    let backend = ProviderBackend::new(&config, "claude-3-haiku-20240307").unwrap();
    assert_eq!(backend.get_response("hello").await.unwrap(), "Hi there");
    let usage = backend.usage().unwrap();
    assert_eq!((usage.input_tokens, usage.output_tokens), (5, 2));

    let request = &server.await.unwrap()[0];
    let lower = request.to_ascii_lowercase();
    assert!(request.starts_with("POST /v1/messages"));
    assert!(lower.contains("x-api-key: ant-key"));
    assert!(lower.contains("anthropic-version: 2023-06-01"));
    let body = body_of(request);
    assert!(body["system"].is_string());
    assert_eq!(body["messages"][0]["role"], "user");
}

// ========================================================================
// End to end through a session
// ========================================================================

#[tokio::test]
async fn test_session_over_free_backend_persists_conversation() {
    let body = r#"{"message":{"role":"assistant","content":"About 150 million km away."}}"#.to_string();
    // One call for the summary, one for the answer.
    let (base_url, _server) = serve(2, "200 OK", "application/json", body).await;

    let tmp = TempDir::new().unwrap();
    let backend: Arc<dyn Backend> = Arc::new(FreeBackend::new("llama3").with_base_url(&base_url));
    let session = ChatSession::new(
        ModelRouter::new(BackendKind::Free, backend),
        ConversationStore::new(ConversationArchive::new(tmp.path())),
    );

    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let guard = session.try_begin_turn().unwrap();
    let outcome = session.run_turn(guard, "How far is the sun?", tx).await;

    assert!(!outcome.used_fallback);
    assert_eq!(outcome.response, "About 150 million km away.");
    let convo = session.active_conversation().unwrap();
    assert_eq!(convo.summary, "About 150 million km away");
    assert!(outcome.saved_to.unwrap().exists());
}

#[tokio::test]
async fn test_session_uses_reported_stream_usage() {
    let sse = [
        r#"{"choices":[{"delta":{"content":"About 150 million km."}}]}"#,
        r#"{"choices":[],"usage":{"prompt_tokens":321,"completion_tokens":7}}"#,
        "[DONE]",
    ]
    .iter()
    .map(|data| sse_line(data))
    .collect::<String>();
    // The summary request cannot parse this body and falls back; the turn streams it.
    let (base_url, server) = serve(2, "200 OK", "text/event-stream", sse).await;

    let tmp = TempDir::new().unwrap();
    let backend = Arc::new(MeteredBackend::new("sk-test").with_base_url(&base_url));
    let session = ChatSession::new(
        ModelRouter::new(BackendKind::Default, backend.clone()),
        ConversationStore::new(ConversationArchive::new(tmp.path())),
    );

    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let guard = session.try_begin_turn().unwrap();
    let outcome = session.run_turn(guard, "How far is the sun?", tx).await;
    assert_eq!(outcome.response, "About 150 million km.");

    let usage = backend.usage().unwrap();
    assert_eq!(usage.input_tokens, 321);
    assert_eq!(usage.output_tokens, 7);

    let requests = server.await.unwrap();
    assert_eq!(body_of(&requests[1])["stream_options"]["include_usage"], true);
}

#[tokio::test]
async fn test_session_unreachable_backend_falls_back() {
    // Bind then drop so nothing listens on the port.
    let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
    let tmp = TempDir::new().unwrap();
    let backend: Arc<dyn Backend> =
        Arc::new(FreeBackend::new("llama3").with_base_url(format!("http://{addr}")));
    let session = ChatSession::new(
        ModelRouter::new(BackendKind::Free, Arc::clone(&backend)),
        ConversationStore::new(ConversationArchive::new(tmp.path())),
    );

    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let guard = session.try_begin_turn().unwrap();
    let outcome = session.run_turn(guard, "hello?", tx).await;

    assert!(outcome.used_fallback);
    assert_eq!(outcome.response, backend.fallback_message());
    let convo = session.active_conversation().unwrap();
    assert_eq!(convo.summary, "User Question");
    assert_eq!(convo.log.len(), 2);
}
