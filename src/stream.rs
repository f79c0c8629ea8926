use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::CompareError;

/// One increment from a model response pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Text to append to the accumulated response.
    TextDelta(String),
    Completed,
    Failed(CompareError),
}

/// A single actionable record recovered from the event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SseRecord {
    /// Payload following the `data:` prefix, expected to be JSON.
    Payload(String),
    /// The `[DONE]` end sentinel.
    Done,
}

/// Incremental decoder for `data:`-framed event-stream lines.
///
/// Bytes arrive at arbitrary chunk boundaries and are buffered raw; only a
/// complete line is decoded as text, so a multi-byte character split across
/// two reads comes out whole. `flush` drains whatever trailing partial line
/// remains at end of stream.
#[derive(Debug, Default)]
pub struct SseFramer {
    buffer: Vec<u8>,
}

impl SseFramer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseRecord> {
        self.buffer.extend_from_slice(chunk);
        let mut records = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(record) = parse_line(&String::from_utf8_lossy(&line)) {
                records.push(record);
            }
        }
        records
    }

    pub fn flush(&mut self) -> Option<SseRecord> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&String::from_utf8_lossy(&rest))
    }
}

/// Lines without the `data:` prefix (comments, bare keep-alives) are not
/// records and yield `None`.
fn parse_line(line: &str) -> Option<SseRecord> {
    let payload = line.trim().strip_prefix("data:")?.trim();
    if payload.is_empty() {
        return None;
    }
    if payload == "[DONE]" {
        return Some(SseRecord::Done);
    }
    Some(SseRecord::Payload(payload.to_owned()))
}

/// Pull assistant text out of a response object, trying the known shapes in
/// order: `delta.content`, `message.content`, then bare `text`. Only the
/// first choice is consulted; empty strings do not count as content.
pub fn extract_content(value: &Value) -> Option<String> {
    let choice = value.get("choices")?.get(0)?;
    ["/delta/content", "/message/content", "/text"]
        .iter()
        .find_map(|pointer| {
            choice
                .pointer(pointer)
                .and_then(Value::as_str)
                .filter(|text| !text.is_empty())
                .map(str::to_owned)
        })
}

/// Interpret a complete JSON body as a one-shot answer.
///
/// Emits the full text as a single delta followed by `Completed`; a body
/// with no recognizable content is an error, not an empty success.
pub async fn normalize_single_json(body: &[u8], events: &mpsc::Sender<StreamEvent>) {
    let event = match serde_json::from_slice::<Value>(body) {
        Ok(value) => match extract_content(&value) {
            Some(text) => {
                if events.send(StreamEvent::TextDelta(text)).await.is_err() {
                    return;
                }
                StreamEvent::Completed
            }
            None => StreamEvent::Failed(CompareError::NoContent),
        },
        Err(err) => StreamEvent::Failed(CompareError::ResponseParse(err.to_string())),
    };
    let _ = events.send(event).await;
}

/// Drive an event-stream body to completion.
///
/// Emits a `TextDelta` per well-formed chunk with content, skips malformed
/// chunks with a warning, and emits `Completed` on the `[DONE]` sentinel or
/// end of stream. Once `cancel` fires the reader stops and emits nothing
/// further; the caller decides what an aborted pipeline means.
pub async fn normalize_event_stream<S, B, E>(
    mut chunks: S,
    cancel: &CancellationToken,
    events: &mpsc::Sender<StreamEvent>,
) where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut framer = SseFramer::default();
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            item = chunks.next() => item,
        };
        let Some(item) = item else {
            break;
        };
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(err) => {
                let failure = StreamEvent::Failed(CompareError::Transport(err.to_string()));
                let _ = events.send(failure).await;
                return;
            }
        };
        for record in framer.push(chunk.as_ref()) {
            if !handle_record(record, events).await {
                return;
            }
        }
    }
    if let Some(record) = framer.flush() {
        if !handle_record(record, events).await {
            return;
        }
    }
    let _ = events.send(StreamEvent::Completed).await;
}

/// Returns `false` once the stream is finished: either the sentinel arrived
/// (after sending `Completed`) or the receiver went away.
async fn handle_record(record: SseRecord, events: &mpsc::Sender<StreamEvent>) -> bool {
    match record {
        SseRecord::Done => {
            let _ = events.send(StreamEvent::Completed).await;
            false
        }
        SseRecord::Payload(payload) => match serde_json::from_str::<Value>(&payload) {
            Ok(value) => {
                if let Some(text) = extract_content(&value) {
                    if events.send(StreamEvent::TextDelta(text)).await.is_err() {
                        return false;
                    }
                }
                true
            }
            Err(err) => {
                tracing::warn!("skipping malformed stream chunk ({err}): {payload}");
                true
            }
        },
    }
}
