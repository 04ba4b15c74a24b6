//! Streaming processor.
//!
//! Consumes cumulative [`StreamChunk`]s and reconciles them into the reply
//! slot:
//!
//! ```text
//! Idle ──start──▶ Streaming ──done / channel closed──▶ Finished
//!                     │ ──abort──────────────────────▶ Stopped
//!                     └──transport error─────────────▶ Errored
//! ```
//!
//! Intermediate chunks are coalesced by a fixed-rate ticker: the newest chunk
//! is committed at most `fps` times per second. The final chunk is always
//! committed, and partial text survives stop and error.

use crate::cleanup::{CleanupOptions, clean_up_message};
use crate::reply::{ReplyTarget, write_reply};
use promptloom_core::abort::AbortSignal;
use promptloom_core::backend::{ChunkReceiver, StreamChunk};
use promptloom_core::error::BackendError;
use promptloom_core::event::{EventBus, PipelineEvent};
use promptloom_core::message::MessageToolCall;
use promptloom_core::session::Session;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamState {
    #[default]
    Idle,
    Streaming,
    Finished,
    Stopped,
    Errored,
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Stopped | Self::Errored)
    }
}

/// Result of one processed response.
#[derive(Debug, Default)]
pub struct StreamOutcome {
    pub state: StreamState,
    /// Cleaned text of the primary candidate (without a continue prefix)
    pub text: String,
    /// Cleaned extra candidates
    pub swipes: Vec<String>,
    pub tool_calls: Vec<MessageToolCall>,
    pub reasoning: Option<String>,
    pub error: Option<BackendError>,
}

pub struct StreamingProcessor<'a> {
    cleanup: CleanupOptions<'a>,
    fps: u32,
    state: StreamState,
    commits: usize,
}

impl<'a> StreamingProcessor<'a> {
    pub fn new(cleanup: CleanupOptions<'a>, fps: u32) -> Self {
        Self {
            cleanup,
            fps: fps.max(1),
            state: StreamState::Idle,
            commits: 0,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Number of commits made to the reply slot so far.
    pub fn commits(&self) -> usize {
        self.commits
    }

    fn progress(
        &mut self,
        raw: &str,
        is_final: bool,
        session: &mut Session,
        target: &ReplyTarget,
        events: &EventBus,
    ) -> String {
        let text = clean_up_message(raw, &self.cleanup, is_final);
        write_reply(session, target, &text);
        self.commits += 1;

        if let Some(index) = target.message_index()
            && let Some(message) = session.chat.get(index)
        {
            events.publish(PipelineEvent::ChunkCommitted {
                message_index: index,
                text: message.mes.clone(),
            });
        }
        text
    }

    /// Reconcile a complete batch response (one final progress step).
    pub fn process_batch(
        &mut self,
        raw: &str,
        session: &mut Session,
        target: &ReplyTarget,
        events: &EventBus,
    ) -> String {
        self.state = StreamState::Streaming;
        let text = self.progress(raw, true, session, target, events);
        self.state = StreamState::Finished;
        text
    }

    /// Drive a chunk stream to a terminal state.
    ///
    /// Every await also watches `abort`; once it fires the receiver is dropped
    /// (which cancels the adapter's request) and the newest text is kept.
    pub async fn run(
        &mut self,
        mut chunks: ChunkReceiver,
        abort: &AbortSignal,
        session: &mut Session,
        target: &ReplyTarget,
        events: &EventBus,
    ) -> StreamOutcome {
        self.state = StreamState::Streaming;
        let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / f64::from(self.fps)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut latest = StreamChunk::default();
        let mut pending = false;
        let mut error = None;

        let state = loop {
            tokio::select! {
                biased;

                _ = abort.aborted() => {
                    debug!("Stream aborted");
                    break StreamState::Stopped;
                }

                received = chunks.recv() => match received {
                    Some(Ok(chunk)) => {
                        trace!(len = chunk.text.len(), done = chunk.done, "Chunk received");
                        let done = chunk.done;
                        latest = chunk;
                        pending = true;
                        if done {
                            break StreamState::Finished;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Stream failed");
                        error = Some(e);
                        break StreamState::Errored;
                    }
                    None => break StreamState::Finished,
                },

                _ = ticker.tick(), if pending => {
                    self.progress(&latest.text, false, session, target, events);
                    pending = false;
                }
            }
        };
        drop(chunks);

        let text = self.progress(&latest.text, true, session, target, events);
        let swipes = latest
            .swipes
            .iter()
            .map(|s| clean_up_message(s, &self.cleanup, true))
            .collect();
        self.state = state;
        debug!(state = ?state, commits = self.commits, len = text.len(), "Stream ended");

        StreamOutcome {
            state,
            text,
            swipes,
            tool_calls: latest.tool_calls,
            reasoning: latest.reasoning.filter(|r| !r.is_empty()),
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::open_slot;
    use promptloom_config::ContextConfig;
    use promptloom_core::character::{CharacterCard, Persona};
    use promptloom_core::message::ChatMessage;
    use promptloom_core::session::GenerationType;
    use tokio::sync::mpsc;

    fn session() -> Session {
        let mut s = Session::new(CharacterCard::named("Seraphina"), Persona::named("Alice"));
        s.chat.push(ChatMessage::user("Alice", "Hi"));
        s
    }

    fn opts(ctx: &ContextConfig) -> CleanupOptions<'_> {
        CleanupOptions {
            context: ctx,
            stop_strings: &[],
            user: "Alice",
            speaker: "Seraphina",
            prompt_bias: "",
            is_impersonate: false,
            is_continue: false,
        }
    }

    fn chunk(text: &str, done: bool) -> Result<StreamChunk, BackendError> {
        Ok(StreamChunk {
            done,
            ..StreamChunk::text(text)
        })
    }

    #[tokio::test]
    async fn final_chunk_wins() {
        let ctx = ContextConfig::default();
        let mut s = session();
        let target = open_slot(&mut s, GenerationType::Normal, "Seraphina");
        let events = EventBus::default();
        let mut rx_events = events.subscribe();

        let (tx, rx) = mpsc::channel(8);
        for (text, done) in [("Hel", false), ("Hello wor", false), ("Hello world.", true)] {
            tx.send(chunk(text, done)).await.unwrap();
        }

        let mut processor = StreamingProcessor::new(opts(&ctx), 30);
        let outcome = processor
            .run(rx, &AbortSignal::new(), &mut s, &target, &events)
            .await;

        assert_eq!(outcome.state, StreamState::Finished);
        assert_eq!(outcome.text, "Hello world.");
        assert_eq!(s.chat[1].mes, "Hello world.");

        let mut last = None;
        while let Ok(event) = rx_events.try_recv() {
            last = Some(event);
        }
        match last.as_deref() {
            Some(PipelineEvent::ChunkCommitted { message_index, text }) => {
                assert_eq!(*message_index, 1);
                assert_eq!(text, "Hello world.");
            }
            other => panic!("unexpected last event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_keeps_partial_text() {
        let ctx = ContextConfig::default();
        let mut s = session();
        let target = open_slot(&mut s, GenerationType::Normal, "Seraphina");
        let events = EventBus::default();
        let abort = AbortSignal::new();

        let (tx, rx) = mpsc::channel(8);
        tx.send(chunk("*waves", false)).await.unwrap();
        let stopper = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.abort();
        });

        let mut processor = StreamingProcessor::new(opts(&ctx), 30);
        let outcome = processor.run(rx, &abort, &mut s, &target, &events).await;
        assert_eq!(outcome.state, StreamState::Stopped);
        assert_eq!(processor.state(), StreamState::Stopped);
        // final cleanup does not balance markdown
        assert_eq!(s.chat[1].mes, "*waves");
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn transport_error_keeps_partial_text() {
        let ctx = ContextConfig::default();
        let mut s = session();
        let target = open_slot(&mut s, GenerationType::Normal, "Seraphina");
        let events = EventBus::default();

        let (tx, rx) = mpsc::channel(8);
        tx.send(chunk("Partial", false)).await.unwrap();
        tx.send(Err(BackendError::StreamInterrupted("reset".into())))
            .await
            .unwrap();

        let mut processor = StreamingProcessor::new(opts(&ctx), 30);
        let outcome = processor
            .run(rx, &AbortSignal::new(), &mut s, &target, &events)
            .await;
        assert_eq!(outcome.state, StreamState::Errored);
        assert!(matches!(outcome.error, Some(BackendError::StreamInterrupted(_))));
        assert_eq!(s.chat[1].mes, "Partial");
    }

    #[tokio::test]
    async fn closed_channel_finishes_and_cleans_swipes() {
        let ctx = ContextConfig::default();
        let mut s = session();
        let target = open_slot(&mut s, GenerationType::Normal, "Seraphina");
        let events = EventBus::default();

        let (tx, rx) = mpsc::channel(8);
        tx.send(Ok(StreamChunk {
            swipes: vec!["Seraphina: Other.".into()],
            ..StreamChunk::text("One.\nAlice: hi")
        }))
        .await
        .unwrap();
        drop(tx);

        let mut processor = StreamingProcessor::new(opts(&ctx), 30);
        let outcome = processor
            .run(rx, &AbortSignal::new(), &mut s, &target, &events)
            .await;
        assert_eq!(outcome.state, StreamState::Finished);
        assert_eq!(outcome.text, "One.");
        assert_eq!(outcome.swipes, vec!["Other."]);
    }

    #[test]
    fn batch_is_a_single_final_commit() {
        let ctx = ContextConfig::default();
        let mut s = session();
        let target = open_slot(&mut s, GenerationType::Normal, "Seraphina");
        let events = EventBus::default();
        let mut processor = StreamingProcessor::new(opts(&ctx), 30);
        let text = processor.process_batch("Seraphina: *nods*", &mut s, &target, &events);
        assert_eq!(text, "*nods*");
        assert_eq!(processor.commits(), 1);
        assert!(processor.state().is_terminal());
    }
}
