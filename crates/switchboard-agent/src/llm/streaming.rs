//! Stream decoding pipeline.
//!
//! A producer task reads the HTTP body, feeds the [`SseDecoder`], hands
//! frames to the vendor's [`StreamHandler`] and pushes canonical
//! [`StreamEvent`]s through a bounded channel.  The consumer side is an
//! [`EventStream`]; [`accumulate`] drains it into a [`ChatResponse`] while
//! forwarding text deltas to an optional sink.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};
use crate::llm::adapter::StreamHandler;
use crate::llm::sse::SseDecoder;
use crate::llm::types::{
    ChatResponse, Choice, Content, Role, StopReason, StreamDelta, StreamEvent, Usage,
};

/// Receives each text delta as it arrives.
pub type TextDeltaCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Default channel capacity between producer and consumer.
pub const DEFAULT_STREAM_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Accumulator
// ---------------------------------------------------------------------------

/// A content slot under construction.
#[derive(Debug)]
enum Slot {
    Text(String),
    Tool {
        id: String,
        name: String,
        json: String,
        arguments: Option<Value>,
    },
}

/// Folds canonical stream events into a complete message.
#[derive(Debug)]
pub struct MessageAccumulator {
    vendor: String,
    id: String,
    model: String,
    role: Role,
    slots: Vec<Slot>,
    stop_reason: Option<StopReason>,
    usage: Usage,
    complete: bool,
}

impl MessageAccumulator {
    pub fn new(vendor: impl Into<String>) -> Self {
        Self {
            vendor: vendor.into(),
            id: String::new(),
            model: String::new(),
            role: Role::Assistant,
            slots: Vec::new(),
            stop_reason: None,
            usage: Usage::default(),
            complete: false,
        }
    }

    /// Whether `message_stop` has been applied.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Apply one event.  Indices must be contiguous and in range.
    pub fn apply(&mut self, event: &StreamEvent) -> Result<()> {
        match event {
            StreamEvent::MessageStart {
                id,
                model,
                role,
                usage,
            } => {
                self.id = id.clone();
                self.model = model.clone();
                self.role = *role;
                self.usage.merge(usage);
            }

            StreamEvent::ContentBlockStart { index, block } => {
                if *index != self.slots.len() {
                    return Err(AgentError::decode(
                        &self.vendor,
                        format!(
                            "content block {index} started out of order (expected {})",
                            self.slots.len()
                        ),
                    ));
                }
                let slot = match block {
                    Content::ToolUse { id, name, .. } => Slot::Tool {
                        id: id.clone(),
                        name: name.clone(),
                        json: String::new(),
                        arguments: None,
                    },
                    Content::Text { text } => Slot::Text(text.clone()),
                    _ => Slot::Text(String::new()),
                };
                self.slots.push(slot);
            }

            StreamEvent::ContentBlockDelta { index, delta } => {
                let vendor = &self.vendor;
                let slot = self.slots.get_mut(*index).ok_or_else(|| {
                    AgentError::decode(vendor, format!("delta for unknown content block {index}"))
                })?;
                match (slot, delta) {
                    (Slot::Text(text), StreamDelta::Text(chunk)) => text.push_str(chunk),
                    (Slot::Tool { json, .. }, StreamDelta::ToolInputJson(chunk)) => {
                        json.push_str(chunk)
                    }
                    _ => {
                        return Err(AgentError::decode(
                            vendor,
                            format!("delta kind does not match content block {index}"),
                        ));
                    }
                }
            }

            StreamEvent::ContentBlockStop { index } => {
                let vendor = &self.vendor;
                let slot = self.slots.get_mut(*index).ok_or_else(|| {
                    AgentError::decode(vendor, format!("stop for unknown content block {index}"))
                })?;
                if let Slot::Tool {
                    name,
                    json,
                    arguments,
                    ..
                } = slot
                {
                    *arguments = Some(parse_tool_json(vendor, name.as_str(), json.as_str())?);
                }
            }

            StreamEvent::MessageDelta { stop_reason, usage } => {
                if let Some(reason) = stop_reason {
                    self.stop_reason = Some(reason.clone());
                }
                if let Some(usage) = usage {
                    self.usage.merge(usage);
                }
            }

            StreamEvent::MessageStop => self.complete = true,
        }
        Ok(())
    }

    /// The finalized response.  Empty text blocks are dropped.
    pub fn into_response(self) -> Result<ChatResponse> {
        let mut content = Vec::with_capacity(self.slots.len());
        for slot in self.slots {
            match slot {
                Slot::Text(text) if text.is_empty() => {}
                Slot::Text(text) => content.push(Content::Text { text }),
                Slot::Tool {
                    id,
                    name,
                    json,
                    arguments,
                } => {
                    let arguments = match arguments {
                        Some(arguments) => arguments,
                        None => parse_tool_json(&self.vendor, &name, &json)?,
                    };
                    content.push(Content::ToolUse {
                        id,
                        name,
                        arguments,
                    });
                }
            }
        }

        if content.is_empty() {
            return Err(AgentError::EmptyResponse {
                vendor: self.vendor,
            });
        }

        Ok(ChatResponse {
            id: self.id,
            model: self.model,
            choices: vec![Choice {
                role: self.role,
                content,
                stop_reason: self.stop_reason,
            }],
            usage: self.usage,
        })
    }

    /// A lenient snapshot of what has arrived so far.  Unparseable tool
    /// arguments are kept as the raw JSON string.
    pub fn partial(&self) -> ChatResponse {
        let content = self
            .slots
            .iter()
            .filter_map(|slot| match slot {
                Slot::Text(text) if text.is_empty() => None,
                Slot::Text(text) => Some(Content::text(text.clone())),
                Slot::Tool {
                    id,
                    name,
                    json,
                    arguments,
                } => {
                    let arguments = arguments.clone().unwrap_or_else(|| {
                        serde_json::from_str(json).unwrap_or_else(|_| Value::String(json.clone()))
                    });
                    Some(Content::tool_use(id.clone(), name.clone(), arguments))
                }
            })
            .collect();

        ChatResponse {
            id: self.id.clone(),
            model: self.model.clone(),
            choices: vec![Choice {
                role: self.role,
                content,
                stop_reason: self.stop_reason.clone(),
            }],
            usage: self.usage,
        }
    }
}

fn parse_tool_json(vendor: &str, name: &str, json: &str) -> Result<Value> {
    if json.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(json).map_err(|e| {
        AgentError::decode(vendor, format!("invalid JSON in tool call `{name}` input: {e}"))
    })
}

// ---------------------------------------------------------------------------
// Event stream
// ---------------------------------------------------------------------------

/// Consumer side of a decoding pipeline.  Lazy and forward-only.
pub struct EventStream {
    vendor: String,
    rx: mpsc::Receiver<Result<StreamEvent>>,
    task: JoinHandle<()>,
}

impl EventStream {
    /// Build a stream from an existing receiver and producer task.
    pub fn new(
        vendor: impl Into<String>,
        rx: mpsc::Receiver<Result<StreamEvent>>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            vendor: vendor.into(),
            rx,
            task,
        }
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }
}

impl Stream for EventStream {
    type Item = Result<StreamEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Spawn the producer task decoding `bytes` into canonical events.
///
/// The channel holds at most `capacity` events; the producer waits when the
/// consumer falls behind.  The first error ends the stream.
pub fn spawn_decoder<S, B, E>(
    bytes: S,
    vendor: impl Into<String>,
    mut handler: Box<dyn StreamHandler>,
    cancel: CancellationToken,
    capacity: usize,
) -> EventStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let vendor = vendor.into();
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let task_vendor = vendor.clone();

    let task = tokio::spawn(async move {
        let vendor = task_vendor;
        let mut decoder = SseDecoder::new(vendor.clone());
        let mut bytes = std::pin::pin!(bytes);

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(%vendor, "stream producer cancelled");
                    return;
                }
                chunk = bytes.next() => chunk,
            };

            let frames = match chunk {
                Some(Ok(chunk)) => decoder.feed(chunk.as_ref()),
                Some(Err(e)) => {
                    let _ = tx
                        .send(Err(AgentError::Transport {
                            vendor: vendor.clone(),
                            reason: format!("stream read error: {e}"),
                        }))
                        .await;
                    return;
                }
                None => break,
            };

            let events = frames.and_then(|frames| {
                let mut events = Vec::new();
                for frame in &frames {
                    events.extend(handler.handle(frame)?);
                }
                Ok(events)
            });
            if !forward(&tx, events).await {
                return;
            }
            if decoder.is_done() {
                break;
            }
        }

        let tail = decoder.finish().and_then(|frames| {
            let mut events = Vec::new();
            for frame in &frames {
                events.extend(handler.handle(frame)?);
            }
            events.extend(handler.finish()?);
            Ok(events)
        });
        forward(&tx, tail).await;
    });

    EventStream::new(vendor, rx, task)
}

/// Send a batch of events, or the error.  Returns `false` when the
/// pipeline should stop.
async fn forward(
    tx: &mpsc::Sender<Result<StreamEvent>>,
    events: Result<Vec<StreamEvent>>,
) -> bool {
    match events {
        Ok(events) => {
            for event in events {
                if tx.send(Ok(event)).await.is_err() {
                    return false;
                }
            }
            true
        }
        Err(e) => {
            let _ = tx.send(Err(e)).await;
            false
        }
    }
}

/// Drain `stream` into a finalized response.
///
/// Text deltas are passed to `on_text` as they arrive.  On cancellation the
/// partial message is returned inside [`AgentError::Cancelled`]; decode and
/// stream errors discard it.
pub async fn accumulate(
    stream: &mut EventStream,
    on_text: Option<&TextDeltaCallback>,
    cancel: &CancellationToken,
) -> Result<ChatResponse> {
    let mut acc = MessageAccumulator::new(stream.vendor());

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(AgentError::Cancelled {
                    operation: "stream".into(),
                    partial: Some(Box::new(acc.partial())),
                });
            }
            next = stream.next() => next,
        };

        let Some(event) = next else { break };
        let event = event?;
        if let (
            Some(on_text),
            StreamEvent::ContentBlockDelta {
                delta: StreamDelta::Text(text),
                ..
            },
        ) = (on_text, &event)
        {
            on_text(text);
        }
        acc.apply(&event)?;
        if acc.is_complete() {
            break;
        }
    }

    if !acc.is_complete() && cancel.is_cancelled() {
        return Err(AgentError::Cancelled {
            operation: "stream".into(),
            partial: Some(Box::new(acc.partial())),
        });
    }
    acc.into_response()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::anthropic::AnthropicAdapter;
    use crate::llm::adapter::Adapter;
    use serde_json::json;
    use std::sync::Mutex;

    fn start() -> StreamEvent {
        StreamEvent::MessageStart {
            id: "m1".into(),
            model: "claude".into(),
            role: Role::Assistant,
            usage: Usage::default(),
        }
    }

    fn text_delta(index: usize, text: &str) -> StreamEvent {
        StreamEvent::ContentBlockDelta {
            index,
            delta: StreamDelta::Text(text.into()),
        }
    }

    #[test]
    fn three_text_deltas_accumulate() {
        for pieces in [["4", " is", " the answer"], ["4", " is the", " answer"]] {
            let mut acc = MessageAccumulator::new("test");
            acc.apply(&start()).unwrap();
            acc.apply(&StreamEvent::ContentBlockStart {
                index: 0,
                block: Content::text(""),
            })
            .unwrap();
            for piece in pieces {
                acc.apply(&text_delta(0, piece)).unwrap();
            }
            for event in [
                StreamEvent::ContentBlockStop { index: 0 },
                StreamEvent::MessageDelta {
                    stop_reason: Some(StopReason::EndTurn),
                    usage: None,
                },
                StreamEvent::MessageStop,
            ] {
                acc.apply(&event).unwrap();
            }
            let resp = acc.into_response().unwrap();
            assert_eq!(resp.text(), "4 is the answer", "split {pieces:?}");
            assert_eq!(resp.stop_reason(), Some(&StopReason::EndTurn));
            assert_eq!(resp.primary().unwrap().content.len(), 1);
        }
    }

    #[test]
    fn tool_json_parsed_at_stop() {
        let mut acc = MessageAccumulator::new("test");
        acc.apply(&StreamEvent::ContentBlockStart {
            index: 0,
            block: Content::tool_use("t1", "read", Value::Null),
        })
        .unwrap();
        for part in ["{\"pa", "th\":", "\"a\"}"] {
            acc.apply(&StreamEvent::ContentBlockDelta {
                index: 0,
                delta: StreamDelta::ToolInputJson(part.into()),
            })
            .unwrap();
        }
        acc.apply(&StreamEvent::ContentBlockStop { index: 0 }).unwrap();

        let resp = acc.into_response().unwrap();
        assert_eq!(resp.tool_uses()[0].arguments, json!({"path": "a"}));
    }

    #[test]
    fn empty_tool_input_becomes_object() {
        let mut acc = MessageAccumulator::new("test");
        acc.apply(&StreamEvent::ContentBlockStart {
            index: 0,
            block: Content::tool_use("t1", "now", Value::Null),
        })
        .unwrap();
        acc.apply(&StreamEvent::ContentBlockStop { index: 0 }).unwrap();
        assert_eq!(acc.into_response().unwrap().tool_uses()[0].arguments, json!({}));
    }

    #[test]
    fn out_of_range_indices_rejected() {
        let mut acc = MessageAccumulator::new("test");
        let err = acc
            .apply(&StreamEvent::ContentBlockStart {
                index: 1,
                block: Content::text(""),
            })
            .unwrap_err();
        assert!(matches!(err, AgentError::Decode { .. }));
        assert!(acc.apply(&text_delta(0, "x")).is_err());
        assert!(acc.apply(&StreamEvent::ContentBlockStop { index: 3 }).is_err());
    }

    #[test]
    fn invalid_tool_json_is_decode_error() {
        let mut acc = MessageAccumulator::new("test");
        acc.apply(&StreamEvent::ContentBlockStart {
            index: 0,
            block: Content::tool_use("t1", "read", Value::Null),
        })
        .unwrap();
        acc.apply(&StreamEvent::ContentBlockDelta {
            index: 0,
            delta: StreamDelta::ToolInputJson("{broken".into()),
        })
        .unwrap();
        let err = acc.apply(&StreamEvent::ContentBlockStop { index: 0 }).unwrap_err();
        assert!(matches!(err, AgentError::Decode { .. }));
    }

    #[test]
    fn usage_from_start_and_delta_merge() {
        let mut acc = MessageAccumulator::new("test");
        acc.apply(&StreamEvent::MessageStart {
            id: "m".into(),
            model: "x".into(),
            role: Role::Assistant,
            usage: Usage {
                input_tokens: 25,
                output_tokens: 1,
                ..Usage::default()
            },
        })
        .unwrap();
        acc.apply(&StreamEvent::MessageDelta {
            stop_reason: None,
            usage: Some(Usage {
                output_tokens: 15,
                ..Usage::default()
            }),
        })
        .unwrap();
        let partial = acc.partial();
        assert_eq!(partial.usage.input_tokens, 25);
        assert_eq!(partial.usage.output_tokens, 15);
    }

    fn anthropic_sse(chunks: &[&str]) -> Vec<std::result::Result<Vec<u8>, std::io::Error>> {
        chunks.iter().map(|c| Ok(c.as_bytes().to_vec())).collect()
    }

    #[tokio::test]
    async fn pipeline_forwards_text_and_finishes() {
        let body = anthropic_sse(&[
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"m1\",\"model\":\"claude\",\"usage\":{\"input_tokens\":3}}}\n\n",
            "event: content_block_start\ndata: {\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\nevent: ping\ndata: {}\n\n",
            "event: content_block_delta\ndata: {\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"4\"}}\n\n",
            "event: content_block_delta\ndata: {\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\" is\"}}\n\nevent: content_block_del",
            "ta\ndata: {\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\" the answer\"}}\n\n",
            "event: content_block_stop\ndata: {\"index\":0}\n\nevent: message_delta\ndata: {\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":4}}\n\n",
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
        ]);

        let cancel = CancellationToken::new();
        let mut stream = spawn_decoder(
            futures::stream::iter(body),
            "anthropic",
            AnthropicAdapter::new().stream_handler(),
            cancel.clone(),
            2,
        );

        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = seen.clone();
        let on_text: TextDeltaCallback = Arc::new(move |t| sink.lock().unwrap().push(t.to_owned()));

        let resp = accumulate(&mut stream, Some(&on_text), &cancel).await.unwrap();
        assert_eq!(resp.text(), "4 is the answer");
        assert_eq!(resp.usage.input_tokens, 3);
        assert_eq!(resp.usage.output_tokens, 4);
        assert_eq!(*seen.lock().unwrap(), vec!["4", " is", " the answer"]);
    }

    #[tokio::test]
    async fn truncated_stream_is_decode_error() {
        let body = anthropic_sse(&[
            "event: message_start\ndata: {\"message\":{\"id\":\"m1\",\"model\":\"claude\"}}\n\n",
            "event: content_block_start\ndata: {\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
        ]);
        let cancel = CancellationToken::new();
        let mut stream = spawn_decoder(
            futures::stream::iter(body),
            "anthropic",
            AnthropicAdapter::new().stream_handler(),
            cancel.clone(),
            8,
        );
        let err = accumulate(&mut stream, None, &cancel).await.unwrap_err();
        assert!(matches!(err, AgentError::Decode { .. }));
    }

    #[tokio::test]
    async fn cancellation_returns_partial_message() {
        let (tx, rx) = mpsc::channel(8);
        let producer = tokio::spawn(async {});
        let mut stream = EventStream::new("test", rx, producer);

        tx.send(Ok(start())).await.unwrap();
        tx.send(Ok(StreamEvent::ContentBlockStart {
            index: 0,
            block: Content::text(""),
        }))
        .await
        .unwrap();
        tx.send(Ok(text_delta(0, "partial"))).await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = accumulate(&mut stream, None, &cancel).await.unwrap_err();
        match err {
            AgentError::Cancelled { partial: Some(partial), .. } => {
                assert_eq!(partial.text(), "partial")
            }
            other => panic!("unexpected: {other}"),
        }
        drop(tx);
    }

    #[tokio::test]
    async fn transport_error_ends_stream() {
        let body: Vec<std::result::Result<Vec<u8>, std::io::Error>> = vec![
            Ok(b"event: message_start\ndata: {\"message\":{\"id\":\"m\"}}\n\n".to_vec()),
            Err(std::io::Error::other("connection reset")),
        ];
        let cancel = CancellationToken::new();
        let mut stream = spawn_decoder(
            futures::stream::iter(body),
            "anthropic",
            AnthropicAdapter::new().stream_handler(),
            cancel.clone(),
            8,
        );
        let err = accumulate(&mut stream, None, &cancel).await.unwrap_err();
        assert!(matches!(err, AgentError::Transport { .. }));
    }
}
