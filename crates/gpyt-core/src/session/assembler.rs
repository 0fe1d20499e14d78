use crate::constants::defaults;
use crate::llm::{ChunkStream, StreamEvent, Usage};
use futures::StreamExt;

/// Per-turn assembly state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyState {
    Idle,
    Started,
    Receiving,
    Finalizing,
    Done,
    /// Stream acquisition failed; the fallback text is being assembled instead.
    Failed,
}

/// Accumulates a chunk stream into the final response text.
///
/// Display updates are throttled to every `update_every`th chunk, and the
/// full buffer is always flushed once more when the stream ends.
#[derive(Debug)]
pub struct StreamAssembler {
    state: AssemblyState,
    buffer: String,
    received: usize,
    skipped: usize,
    update_every: usize,
    fallback: String,
    used_fallback: bool,
    usage: Option<Usage>,
}

impl Default for StreamAssembler {
    fn default() -> Self {
        Self::new(defaults::UPDATE_EVERY)
    }
}

impl StreamAssembler {
    pub fn new(update_every: usize) -> Self {
        Self {
            state: AssemblyState::Idle,
            buffer: String::new(),
            received: 0,
            skipped: 0,
            update_every: update_every.max(1),
            fallback: String::new(),
            used_fallback: false,
            usage: None,
        }
    }

    /// Text used when the stream dies before producing anything.
    pub fn with_fallback(mut self, text: impl Into<String>) -> Self {
        self.fallback = text.into();
        self
    }

    pub fn state(&self) -> AssemblyState {
        self.state
    }

    pub fn content(&self) -> &str {
        &self.buffer
    }

    /// Chunks received so far, including skipped ones.
    pub fn received(&self) -> usize {
        self.received
    }

    /// Chunks that lacked the expected text field.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn used_fallback(&self) -> bool {
        self.used_fallback
    }

    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }

    /// The response placeholder is mounted.
    pub fn start(&mut self) {
        self.state = AssemblyState::Started;
    }

    /// Stream acquisition failed before any chunk arrived. The caller feeds
    /// the fallback chunk sequence through [`StreamAssembler::drain`] next.
    pub fn fail(&mut self, reason: &str) {
        tracing::warn!("Response stream unavailable: {reason}");
        self.state = AssemblyState::Failed;
        self.used_fallback = true;
    }

    /// Feed one event. Returns the buffer when a display update is due.
    /// `None` for the outer option means the stream is over.
    pub fn push(&mut self, event: StreamEvent) -> Option<Option<&str>> {
        if matches!(self.state, AssemblyState::Idle | AssemblyState::Started) {
            self.state = AssemblyState::Receiving;
        }

        match event {
            StreamEvent::TextDelta(text) => {
                self.received += 1;
                self.buffer.push_str(&text);
            }
            StreamEvent::Unrecognized(raw) => {
                self.received += 1;
                self.skipped += 1;
                tracing::debug!(skipped = self.skipped, "Skipping chunk without text: {raw}");
            }
            StreamEvent::Usage(usage) => {
                self.usage = Some(usage);
                return Some(None);
            }
            StreamEvent::Done => return None,
            StreamEvent::Error(err) => {
                if self.buffer.is_empty() && !self.fallback.is_empty() {
                    tracing::warn!("Stream failed before any text: {err}");
                    self.buffer = self.fallback.clone();
                    self.used_fallback = true;
                } else {
                    tracing::warn!("Stream failed after {} chunks, keeping partial response: {err}", self.received);
                }
                return None;
            }
        }

        if self.received % self.update_every == 0 {
            Some(Some(&self.buffer))
        } else {
            Some(None)
        }
    }

    /// Consume the whole stream, calling `on_update` on throttled updates and
    /// once more with the complete buffer at the end.
    pub async fn drain(&mut self, mut stream: ChunkStream, mut on_update: impl FnMut(&str)) -> String {
        if self.state == AssemblyState::Idle {
            self.start();
        }

        while let Some(event) = stream.next().await {
            match self.push(event) {
                Some(Some(snapshot)) => on_update(snapshot),
                Some(None) => {}
                None => break,
            }
        }

        if self.skipped > 0 {
            tracing::debug!("Skipped {} of {} chunks", self.skipped, self.received);
        }

        self.state = AssemblyState::Finalizing;
        on_update(&self.buffer);
        self.buffer.clone()
    }

    /// The finalized message has been recorded.
    pub fn complete(&mut self) {
        self.state = AssemblyState::Done;
    }
}
