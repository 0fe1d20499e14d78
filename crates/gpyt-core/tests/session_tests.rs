use futures::channel::mpsc;
use gpyt_core::context::{ConversationArchive, ConversationStore};
use gpyt_core::error::GpytError;
use gpyt_core::llm::*;
use gpyt_core::session::{ChatSession, TurnEvent};
use gpyt_core::Role;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

// ========================================================================
// Mock backend
// ========================================================================

struct MockBackend {
    chunks: Vec<String>,
    fail_stream: bool,
    summary: Option<String>,
    state: ChatState,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl MockBackend {
    fn new(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            fail_stream: false,
            summary: Some("Sun distance question".to_string()),
            state: ChatState::new(Some("You are a test assistant.".into()), "mock", true),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn failing() -> Self {
        Self {
            fail_stream: true,
            ..Self::new(&[])
        }
    }

    fn with_summary(mut self, summary: Option<&str>) -> Self {
        self.summary = summary.map(str::to_string);
        self
    }

    fn without_memory(self) -> Self {
        self.state.set_memory(false);
        self
    }

    fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        "Mock"
    }

    fn model(&self) -> &str {
        "mock"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supports_native_streaming: true,
            has_system_prompt: true,
            tracks_usage: false,
        }
    }

    async fn get_response(&self, input: &str) -> Result<String, GpytError> {
        let request = self.state.begin_turn(input);
        self.requests.lock().unwrap().push(request);
        let text = self.chunks.concat();
        self.state.finish_turn(&text);
        Ok(text)
    }

    async fn get_response_stream(&self, input: &str) -> Result<ChunkStream, GpytError> {
        let request = self.state.begin_turn(input);
        self.requests.lock().unwrap().push(request);
        if self.fail_stream {
            return Err(GpytError::Backend("429 rate limited".into()));
        }
        let (tx, rx) = mpsc::unbounded();
        for chunk in &self.chunks {
            tx.unbounded_send(StreamEvent::TextDelta(chunk.clone())).unwrap();
        }
        tx.unbounded_send(StreamEvent::Done).unwrap();
        Ok(rx)
    }

    async fn summarize(&self, _initial_message: &str) -> Result<String, GpytError> {
        self.summary
            .clone()
            .ok_or_else(|| GpytError::Summary("summary endpoint down".into()))
    }

    fn set_history(&self, prior: &[Message]) {
        self.state.set_history(prior);
    }

    fn clear_history(&self) {
        self.state.clear();
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
}

fn session_with(mock: Arc<MockBackend>, root: &std::path::Path) -> ChatSession {
    let router = ModelRouter::new(BackendKind::Default, mock);
    let store = ConversationStore::new(ConversationArchive::new(root));
    ChatSession::new(router, store)
}

fn drain_events(rx: &mut UnboundedReceiver<TurnEvent>) -> Vec<TurnEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn run(session: &ChatSession, input: &str) -> (gpyt_core::session::TurnOutcome, Vec<TurnEvent>) {
    let (tx, mut rx) = unbounded_channel();
    let guard = session.try_begin_turn().unwrap();
    let outcome = session.run_turn(guard, input, tx).await;
    (outcome, drain_events(&mut rx))
}

// ========================================================================
// Streaming assembly through a turn
// ========================================================================

#[tokio::test]
async fn test_final_content_is_concatenation_for_any_interval() {
    let parts: Vec<String> = (0..37).map(|i| format!("w{i} ")).collect();
    let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
    let expected = parts.concat();

    for n in [1, 3, 10, 100] {
        let tmp = TempDir::new().unwrap();
        let mock = Arc::new(MockBackend::new(&refs));
        let session = session_with(mock, tmp.path()).with_update_every(n);

        let (outcome, events) = run(&session, "count for me").await;
        assert_eq!(outcome.response, expected, "interval {n}");

        let updates: Vec<&String> = events
            .iter()
            .filter_map(|e| match e {
                TurnEvent::Update { content } => Some(content),
                _ => None,
            })
            .collect();
        assert_eq!(updates.len(), 37 / n + 1, "interval {n}");
        assert_eq!(updates.last().unwrap().as_str(), expected);

        let convo = session.active_conversation().unwrap();
        assert_eq!(convo.log.last().unwrap().content, expected);
    }
}

#[tokio::test]
async fn test_events_arrive_in_order() {
    let tmp = TempDir::new().unwrap();
    let session = session_with(Arc::new(MockBackend::new(&["Hi", "!"])), tmp.path());

    let (_, events) = run(&session, "hello").await;
    assert!(matches!(
        events.first(),
        Some(TurnEvent::Started {
            new_conversation: true,
            ..
        })
    ));
    assert!(matches!(events.last(), Some(TurnEvent::Finished { saved_to: Some(_), .. })));
}

// ========================================================================
// Failure handling
// ========================================================================

#[tokio::test]
async fn test_failed_stream_yields_exactly_one_fallback_message() {
    let tmp = TempDir::new().unwrap();
    let mock = Arc::new(MockBackend::failing());
    let session = session_with(mock.clone(), tmp.path());

    let (outcome, _) = run(&session, "anyone there?").await;

    assert!(outcome.used_fallback);
    assert_eq!(outcome.response, mock.fallback_message());

    let convo = session.active_conversation().unwrap();
    assert_eq!(convo.log.len(), 2);
    assert_eq!(convo.log[0].role, Role::User);
    assert_eq!(convo.log[1].role, Role::Assistant);
    assert_eq!(convo.log[1].content, mock.fallback_message());
}

#[tokio::test]
async fn test_summary_failure_uses_placeholder() {
    let tmp = TempDir::new().unwrap();
    let mock = Arc::new(MockBackend::new(&["ok"]).with_summary(None));
    let session = session_with(mock, tmp.path());

    run(&session, "hello").await;
    assert_eq!(session.active_conversation().unwrap().summary, "User Question");
}

#[tokio::test]
async fn test_save_failure_is_reported_but_conversation_survives() {
    let tmp = TempDir::new().unwrap();
    let blocker = tmp.path().join("not-a-directory");
    std::fs::write(&blocker, "").unwrap();
    let session = session_with(Arc::new(MockBackend::new(&["fine"])), &blocker);

    let (outcome, events) = run(&session, "save me").await;

    assert!(outcome.saved_to.is_none());
    assert!(events
        .iter()
        .any(|e| matches!(e, TurnEvent::Diagnostic(msg) if msg.contains("could not be saved"))));
    assert_eq!(session.active_conversation().unwrap().log.len(), 2);
}

#[tokio::test]
async fn test_second_turn_rejected_while_in_flight() {
    let tmp = TempDir::new().unwrap();
    let session = session_with(Arc::new(MockBackend::new(&["x"])), tmp.path());

    let guard = session.try_begin_turn().unwrap();
    assert!(matches!(session.try_begin_turn(), Err(GpytError::TurnInProgress)));

    let (tx, _rx) = unbounded_channel();
    assert!(matches!(
        session.submit("second", tx),
        Err(GpytError::TurnInProgress)
    ));
    assert!(matches!(
        session.start_new_conversation().await,
        Err(GpytError::TurnInProgress)
    ));

    drop(guard);
    assert!(session.try_begin_turn().is_ok());
}

#[tokio::test]
async fn test_submit_runs_turn_in_background() {
    let tmp = TempDir::new().unwrap();
    let session = session_with(Arc::new(MockBackend::new(&["bg"])), tmp.path());

    let (tx, _rx) = unbounded_channel();
    let handle = session.submit("go", tx).unwrap();
    let outcome = handle.await.unwrap();

    assert_eq!(outcome.response, "bg");
    assert!(!session.is_turn_active());
}

// ========================================================================
// Memory semantics
// ========================================================================

#[tokio::test]
async fn test_memory_off_sends_only_current_turn() {
    let tmp = TempDir::new().unwrap();
    let mock = Arc::new(MockBackend::new(&["answer"]).without_memory());
    let session = session_with(mock.clone(), tmp.path());

    run(&session, "turn one").await;
    run(&session, "turn two").await;

    let requests = mock.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(
        requests[1],
        vec![
            Message::system("You are a test assistant."),
            Message::user("turn two")
        ]
    );
}

#[tokio::test]
async fn test_memory_on_sends_prior_exchange() {
    let tmp = TempDir::new().unwrap();
    let mock = Arc::new(MockBackend::new(&["answer"]));
    let session = session_with(mock.clone(), tmp.path());

    run(&session, "turn one").await;
    run(&session, "turn two").await;

    let second = &mock.requests()[1];
    assert_eq!(second.len(), 4);
    assert_eq!(second[1], Message::user("turn one"));
    assert_eq!(second[2], Message::assistant("answer"));
}

// ========================================================================
// Conversation lifecycle
// ========================================================================

#[tokio::test]
async fn test_sun_example_creates_conversation_and_record() {
    let tmp = TempDir::new().unwrap();
    let mock = Arc::new(
        MockBackend::new(&["About 150 ", "million km."])
            .with_summary(Some("The distance between the Earth and the Sun")),
    );
    let session = session_with(mock, tmp.path());

    let (outcome, _) = run(&session, "How far is the sun?").await;

    let convo = session.active_conversation().unwrap();
    assert!(convo.summary.split_whitespace().count() <= 6);
    assert_eq!(convo.log.len(), 2);
    assert_eq!(convo.log[0].content, "How far is the sun?");
    assert_eq!(convo.log[1].content, "About 150 million km.");

    let path = tmp
        .path()
        .join("conversations")
        .join(format!("convo-{}.json", convo.id));
    assert_eq!(outcome.saved_to.as_deref(), Some(path.as_path()));

    let record: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(record["id"], convo.id.as_str());
    assert_eq!(record["log"][0]["role"], "user");
    assert_eq!(record["log"][1]["content"], "About 150 million km.");
}

#[tokio::test]
async fn test_new_conversation_persists_and_lists_once() {
    let tmp = TempDir::new().unwrap();
    let mock = Arc::new(MockBackend::new(&["a"]));
    let session = session_with(mock.clone(), tmp.path());

    assert!(session.start_new_conversation().await.unwrap().is_none());

    run(&session, "first").await;
    let id = session.active_conversation().unwrap().id;

    let saved = session.start_new_conversation().await.unwrap().unwrap();
    assert!(saved.exists());
    assert!(session.active_conversation().is_none());
    assert_eq!(mock.history().len(), 1, "only the system prompt remains");

    session.select_previous_conversation(&id).await.unwrap();
    session.start_new_conversation().await.unwrap();
    session.select_previous_conversation(&id).await.unwrap();
    session.start_new_conversation().await.unwrap();

    let past = session.past_conversations();
    assert_eq!(past.iter().filter(|c| c.id == id).count(), 1);
}

#[tokio::test]
async fn test_select_previous_replays_history() {
    let tmp = TempDir::new().unwrap();
    let mock = Arc::new(MockBackend::new(&["reply"]));
    let session = session_with(mock.clone(), tmp.path());

    run(&session, "q1").await;
    run(&session, "q2").await;
    let id = session.active_conversation().unwrap().id;
    session.start_new_conversation().await.unwrap();

    let convo = session.select_previous_conversation(&id).await.unwrap();
    assert_eq!(convo.log.len(), 4);

    let history = mock.history();
    assert_eq!(history[0].role, Role::System);
    assert_eq!(&history[1..], &[
        Message::user("q1"),
        Message::assistant("reply"),
        Message::user("q2"),
        Message::assistant("reply"),
    ]);

    // The next turn continues the resumed conversation.
    run(&session, "q3").await;
    assert_eq!(session.active_conversation().unwrap().id, id);
}

#[tokio::test]
async fn test_loading_from_disk_does_not_duplicate_known_ids() {
    let tmp = TempDir::new().unwrap();
    let session = session_with(Arc::new(MockBackend::new(&["a"])), tmp.path());
    run(&session, "first").await;
    session.start_new_conversation().await.unwrap();

    let outcome = session.load_persisted_conversations().await.unwrap();
    assert_eq!(outcome.added, 0);
    assert_eq!(session.past_conversations().len(), 1);

    // A fresh session sees the same record once.
    let fresh = session_with(Arc::new(MockBackend::new(&["a"])), tmp.path());
    let outcome = fresh.load_persisted_conversations().await.unwrap();
    assert_eq!(outcome.added, 1);
    fresh.load_persisted_conversations().await.unwrap();
    assert_eq!(fresh.past_conversations().len(), 1);
}

#[tokio::test]
async fn test_unknown_conversation_cannot_be_selected() {
    let tmp = TempDir::new().unwrap();
    let session = session_with(Arc::new(MockBackend::new(&["a"])), tmp.path());
    assert!(matches!(
        session.select_previous_conversation("nope").await,
        Err(GpytError::ConversationNotFound(_))
    ));
}

#[tokio::test]
async fn test_switching_backend_applies_to_next_turn() {
    let tmp = TempDir::new().unwrap();
    let first = Arc::new(MockBackend::new(&["from first"]));
    let second = Arc::new(MockBackend::new(&["from second"]));
    let mut router = ModelRouter::new(BackendKind::Default, first.clone());
    router.register(BackendKind::Free, second.clone());
    let session = ChatSession::new(
        router,
        ConversationStore::new(ConversationArchive::new(tmp.path())),
    );

    run(&session, "one").await;
    session.select_backend(BackendKind::Free).unwrap();
    let (outcome, _) = run(&session, "two").await;

    assert_eq!(outcome.response, "from second");
    // The new backend was seeded with the conversation so far.
    assert_eq!(second.requests()[0].len(), 4);
    assert_eq!(session.status().kind, BackendKind::Free);
}
