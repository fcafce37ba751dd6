//! Output normalizer
//!
//! Every backend's raw output becomes the same event sequence:
//! `Start`, zero or more `Delta`, then exactly one `Done` or `Error`.
//! Deltas always concatenate to the final text and nothing is emitted after
//! the terminal event. Upstream failures are turned into an `Error` event
//! here and never propagate further.

pub mod decoder;

pub use decoder::{ChunkDecoder, NdjsonDecoder, Utf8Decoder};

use crate::error::{BridgeError, Result};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Raw backend output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawChunk {
    /// Response bytes, decoded by the normalizer's [`ChunkDecoder`]
    Bytes(Vec<u8>),
    /// Already-final text (DOM snapshots, polled task output)
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Stop,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub input: u64,
    pub output: u64,
    pub total_tokens: u64,
}

/// Provider/model the message is attributed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMeta {
    pub provider: String,
    pub model: String,
}

impl MessageMeta {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

/// Running assistant message snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssistantMessage {
    pub role: &'static str,
    pub text: String,
    pub provider: String,
    pub model: String,
    pub usage: Usage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub timestamp: i64,
}

impl AssistantMessage {
    fn new(meta: &MessageMeta, text: &str) -> Self {
        Self {
            role: "assistant",
            text: text.to_string(),
            provider: meta.provider.clone(),
            model: meta.model.clone(),
            usage: Usage::default(),
            stop_reason: None,
            error_message: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NormalizedEvent {
    Start {
        partial: AssistantMessage,
    },
    Delta {
        text: String,
        partial: AssistantMessage,
    },
    Done {
        final_text: String,
        stop_reason: StopReason,
        message: AssistantMessage,
    },
    Error {
        message: String,
        partial: AssistantMessage,
    },
}

impl NormalizedEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NormalizedEvent::Done { .. } | NormalizedEvent::Error { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Streaming,
    Finished,
}

/// Event sequencer over one turn's output
pub struct Normalizer {
    meta: MessageMeta,
    decoder: Box<dyn ChunkDecoder>,
    text: String,
    phase: Phase,
}

impl Normalizer {
    pub fn new(meta: MessageMeta, decoder: Box<dyn ChunkDecoder>) -> Self {
        Self {
            meta,
            decoder,
            text: String::new(),
            phase: Phase::Idle,
        }
    }

    /// Normalizer for sources that only ever yield text
    pub fn text_only(meta: MessageMeta) -> Self {
        Self::new(meta, Box::new(Utf8Decoder::new()))
    }

    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Finished
    }

    fn ensure_started(&mut self, out: &mut Vec<NormalizedEvent>) {
        if self.phase == Phase::Idle {
            self.phase = Phase::Streaming;
            out.push(NormalizedEvent::Start {
                partial: AssistantMessage::new(&self.meta, ""),
            });
        }
    }

    fn delta(&mut self, text: String, out: &mut Vec<NormalizedEvent>) {
        if text.is_empty() {
            return;
        }
        self.text.push_str(&text);
        out.push(NormalizedEvent::Delta {
            text,
            partial: AssistantMessage::new(&self.meta, &self.text),
        });
    }

    pub fn start(&mut self) -> Vec<NormalizedEvent> {
        let mut out = Vec::new();
        if self.phase != Phase::Finished {
            self.ensure_started(&mut out);
        }
        out
    }

    pub fn push(&mut self, chunk: RawChunk) -> Vec<NormalizedEvent> {
        let mut out = Vec::new();
        if self.phase == Phase::Finished {
            return out;
        }
        self.ensure_started(&mut out);
        let text = match chunk {
            RawChunk::Bytes(bytes) => self.decoder.decode(&bytes),
            RawChunk::Text(text) => text,
        };
        self.delta(text, &mut out);
        out
    }

    pub fn finish(&mut self) -> Vec<NormalizedEvent> {
        let mut out = Vec::new();
        if self.phase == Phase::Finished {
            return out;
        }
        self.ensure_started(&mut out);
        let tail = self.decoder.flush();
        self.delta(tail, &mut out);

        let mut message = AssistantMessage::new(&self.meta, &self.text);
        message.stop_reason = Some(StopReason::Stop);
        out.push(NormalizedEvent::Done {
            final_text: self.text.clone(),
            stop_reason: StopReason::Stop,
            message,
        });
        self.phase = Phase::Finished;
        out
    }

    pub fn fail(&mut self, error: &BridgeError) -> Vec<NormalizedEvent> {
        let mut out = Vec::new();
        if self.phase == Phase::Finished {
            return out;
        }
        self.ensure_started(&mut out);

        let message = error.to_string();
        let mut partial = AssistantMessage::new(&self.meta, &self.text);
        partial.stop_reason = Some(StopReason::Error);
        partial.error_message = Some(message.clone());
        out.push(NormalizedEvent::Error { message, partial });
        self.phase = Phase::Finished;
        out
    }

    /// Run a complete, already-collected source through the sequencer
    pub fn run_all<I>(mut self, source: I) -> Vec<NormalizedEvent>
    where
        I: IntoIterator<Item = Result<RawChunk>>,
    {
        let mut events = self.start();
        for item in source {
            match item {
                Ok(chunk) => events.extend(self.push(chunk)),
                Err(e) => {
                    events.extend(self.fail(&e));
                    return events;
                }
            }
        }
        events.extend(self.finish());
        events
    }
}

/// Normalize a chunk stream; events are delivered as they are produced.
pub fn normalize<S>(source: S, mut normalizer: Normalizer) -> ReceiverStream<NormalizedEvent>
where
    S: Stream<Item = Result<RawChunk>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        let mut source = Box::pin(source);
        if !send_all(&tx, normalizer.start()).await {
            return;
        }
        while let Some(item) = source.next().await {
            let events = match item {
                Ok(chunk) => normalizer.push(chunk),
                Err(e) => {
                    log::warn!("Turn failed: {}", e);
                    normalizer.fail(&e)
                }
            };
            if !send_all(&tx, events).await || normalizer.is_finished() {
                return;
            }
        }
        send_all(&tx, normalizer.finish()).await;
    });
    ReceiverStream::new(rx)
}

/// Normalize a single-shot result (DOM fallback, task polling)
pub fn normalize_result(
    result: Result<String>,
    meta: MessageMeta,
) -> Vec<NormalizedEvent> {
    let source = match result {
        Ok(text) => vec![Ok(RawChunk::Text(text))],
        Err(e) => vec![Err(e)],
    };
    Normalizer::text_only(meta).run_all(source)
}

async fn send_all(tx: &mpsc::Sender<NormalizedEvent>, events: Vec<NormalizedEvent>) -> bool {
    for event in events {
        if tx.send(event).await.is_err() {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> MessageMeta {
        MessageMeta::new("grok-web", "grok-3")
    }

    fn delta_concat(events: &[NormalizedEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                NormalizedEvent::Delta { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    fn assert_well_formed(events: &[NormalizedEvent]) {
        assert!(matches!(events.first(), Some(NormalizedEvent::Start { .. })));
        let starts = events
            .iter()
            .filter(|e| matches!(e, NormalizedEvent::Start { .. }))
            .count();
        assert_eq!(starts, 1);
        let terminals = events.iter().filter(|e| e.is_terminal()).count();
        assert_eq!(terminals, 1);
        assert!(events.last().unwrap().is_terminal());
    }

    #[test]
    fn test_deltas_concatenate_to_final_text() {
        let source = vec![
            Ok(RawChunk::Bytes(b"Hel".to_vec())),
            Ok(RawChunk::Bytes(Vec::new())),
            Ok(RawChunk::Bytes("lo, 世".as_bytes().to_vec())),
            Ok(RawChunk::Text("界".to_string())),
        ];
        let events = Normalizer::text_only(meta()).run_all(source);
        assert_well_formed(&events);
        match events.last().unwrap() {
            NormalizedEvent::Done { final_text, .. } => {
                assert_eq!(final_text, "Hello, 世界");
                assert_eq!(&delta_concat(&events), final_text);
            }
            other => panic!("expected done, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_source_is_start_then_done() {
        let events = Normalizer::text_only(meta()).run_all(Vec::new());
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], NormalizedEvent::Start { .. }));
        match &events[1] {
            NormalizedEvent::Done { final_text, .. } => assert_eq!(final_text, ""),
            other => panic!("expected done, got {:?}", other),
        }
    }

    #[test]
    fn test_error_is_single_terminal() {
        let source = vec![
            Ok(RawChunk::Text("partial".to_string())),
            Err(BridgeError::TaskFailed("quota exceeded".to_string())),
            Ok(RawChunk::Text("ignored".to_string())),
        ];
        let events = Normalizer::text_only(meta()).run_all(source);
        assert_well_formed(&events);
        match events.last().unwrap() {
            NormalizedEvent::Error { message, partial } => {
                assert_eq!(message, "quota exceeded");
                assert_eq!(partial.stop_reason, Some(StopReason::Error));
                assert_eq!(partial.text, "partial");
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_nothing_after_terminal() {
        let mut n = Normalizer::text_only(meta());
        assert_eq!(n.finish().len(), 2);
        assert!(n.push(RawChunk::Text("late".to_string())).is_empty());
        assert!(n.finish().is_empty());
        assert!(n.fail(&BridgeError::Cancelled).is_empty());
    }

    #[test]
    fn test_single_shot_shape() {
        let events = normalize_result(Ok("hi".to_string()), meta());
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], NormalizedEvent::Start { .. }));
        match &events[1] {
            NormalizedEvent::Delta { text, partial } => {
                assert_eq!(text, "hi");
                assert_eq!(partial.text, "hi");
            }
            other => panic!("expected delta, got {:?}", other),
        }
        assert!(matches!(events[2], NormalizedEvent::Done { .. }));
    }

    #[test]
    fn test_ndjson_tail_flushed_on_finish() {
        let decoder = NdjsonDecoder::new(vec!["/contentDelta".to_string()]);
        let n = Normalizer::new(meta(), Box::new(decoder));
        let events = n.run_all(vec![Ok(RawChunk::Bytes(
            br#"{"contentDelta":"tail"}"#.to_vec(),
        ))]);
        assert_eq!(delta_concat(&events), "tail");
    }

    #[tokio::test]
    async fn test_stream_driver_matches_run_all() {
        let chunks = vec![
            Ok(RawChunk::Text("a".to_string())),
            Ok(RawChunk::Text("b".to_string())),
        ];
        let events: Vec<_> =
            normalize(futures::stream::iter(chunks), Normalizer::text_only(meta()))
                .collect()
                .await;
        assert_well_formed(&events);
        assert_eq!(delta_concat(&events), "ab");
    }

    #[test]
    fn test_event_serialization_tag() {
        let events = normalize_result(Ok("x".to_string()), meta());
        let json = serde_json::to_value(&events[2]).unwrap();
        assert_eq!(json["type"], "done");
        assert_eq!(json["final_text"], "x");
        assert_eq!(json["stop_reason"], "stop");
    }
}
