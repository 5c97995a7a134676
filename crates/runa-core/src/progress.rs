// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use runa_model::{ContentBlock, Message, StopReason, Usage};
use serde::Serialize;
use tokio::sync::mpsc;

/// Wire names mirror industry SSE streaming, with agent-loop extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventKind {
    AgentStart,
    AgentStop,
    IterationStart,
    IterationStop,
    MessageStart,
    MessageDelta,
    MessageStop,
    ContentBlockStart,
    ContentBlockDelta,
    ContentBlockStop,
    ToolExecutionStart,
    ToolExecutionOutput,
    ToolExecutionResult,
    Error,
}

/// Incremental payload for delta events.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

/// One event on a streaming run's output channel.
#[derive(Debug, Clone, Serialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub kind: StreamEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_block: Option<ContentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<StreamDelta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_stderr: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
}

impl StreamEvent {
    fn bare(kind: StreamEventKind) -> Self {
        Self {
            kind,
            message: None,
            content_block: None,
            delta: None,
            usage: None,
            tool_use_id: None,
            name: None,
            output: None,
            is_stderr: None,
            is_error: None,
            iteration: None,
        }
    }

    pub fn agent_start() -> Self {
        Self::bare(StreamEventKind::AgentStart)
    }

    pub fn agent_stop() -> Self {
        Self::bare(StreamEventKind::AgentStop)
    }

    pub fn iteration_start(iteration: u32) -> Self {
        Self {
            iteration: Some(iteration),
            ..Self::bare(StreamEventKind::IterationStart)
        }
    }

    pub fn iteration_stop(iteration: u32) -> Self {
        Self {
            iteration: Some(iteration),
            ..Self::bare(StreamEventKind::IterationStop)
        }
    }

    pub fn message_start() -> Self {
        Self {
            message: Some(Message::assistant("")),
            ..Self::bare(StreamEventKind::MessageStart)
        }
    }

    pub fn message_delta(stop_reason: StopReason, usage: Option<Usage>) -> Self {
        Self {
            delta: Some(StreamDelta {
                text: None,
                stop_reason: Some(stop_reason),
            }),
            usage,
            ..Self::bare(StreamEventKind::MessageDelta)
        }
    }

    pub fn message_stop() -> Self {
        Self::bare(StreamEventKind::MessageStop)
    }

    pub fn content_block_start() -> Self {
        Self {
            content_block: Some(ContentBlock::text("")),
            ..Self::bare(StreamEventKind::ContentBlockStart)
        }
    }

    pub fn content_block_delta(text: impl Into<String>) -> Self {
        Self {
            delta: Some(StreamDelta {
                text: Some(text.into()),
                stop_reason: None,
            }),
            ..Self::bare(StreamEventKind::ContentBlockDelta)
        }
    }

    pub fn content_block_stop() -> Self {
        Self::bare(StreamEventKind::ContentBlockStop)
    }

    pub fn tool_execution_start(tool_use_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            tool_use_id: Some(tool_use_id.into()),
            name: Some(name.into()),
            ..Self::bare(StreamEventKind::ToolExecutionStart)
        }
    }

    pub fn tool_execution_output(
        tool_use_id: impl Into<String>,
        chunk: impl Into<String>,
        is_stderr: bool,
    ) -> Self {
        Self {
            tool_use_id: Some(tool_use_id.into()),
            output: Some(chunk.into()),
            is_stderr: Some(is_stderr),
            ..Self::bare(StreamEventKind::ToolExecutionOutput)
        }
    }

    pub fn tool_execution_result(
        tool_use_id: impl Into<String>,
        output: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            tool_use_id: Some(tool_use_id.into()),
            output: Some(output.into()),
            is_error: Some(is_error),
            ..Self::bare(StreamEventKind::ToolExecutionResult)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            output: Some(message.into()),
            is_error: Some(true),
            ..Self::bare(StreamEventKind::Error)
        }
    }
}

/// Producer-side handle for the internal progress channel.
///
/// Bounded sends give a slow (but live) consumer backpressure.  Once the
/// consumer's cancellation is observed the sink switches to dropping events
/// so the pipeline can run to completion — delivery is sacrificed for
/// liveness, never the other way around.
#[derive(Clone)]
pub struct ProgressSink {
    tx: mpsc::Sender<StreamEvent>,
    cancelled: Arc<AtomicBool>,
}

impl ProgressSink {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                tx,
                cancelled: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    pub async fn emit(&self, event: StreamEvent) {
        if self.cancelled.load(Ordering::Relaxed) {
            return;
        }
        let _ = self.tx.send(event).await;
    }

    /// Flip to drop mode.  Emissions after this return immediately.
    pub fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Shared drop-mode flag, for the forwarder side.  Unlike a sink clone
    /// this holds no sender, so the channel can still close.
    pub(crate) fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_serialize_with_sse_names() {
        let ev = StreamEvent::content_block_delta("hi");
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "content_block_delta");
        assert_eq!(v["delta"]["text"], "hi");
    }

    #[test]
    fn absent_fields_are_omitted() {
        let json = serde_json::to_string(&StreamEvent::agent_start()).unwrap();
        assert_eq!(json, r#"{"type":"agent_start"}"#);
    }

    #[test]
    fn message_delta_carries_stop_reason() {
        let ev = StreamEvent::message_delta(StopReason::EndTurn, None);
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["delta"]["stop_reason"], "end_turn");
    }

    #[test]
    fn tool_execution_output_carries_stderr_flag() {
        let ev = StreamEvent::tool_execution_output("t1", "oops", true);
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["tool_use_id"], "t1");
        assert_eq!(v["is_stderr"], true);
    }

    #[tokio::test]
    async fn sink_delivers_until_cancelled_then_drops() {
        let (sink, mut rx) = ProgressSink::channel(8);
        sink.emit(StreamEvent::agent_start()).await;
        sink.mark_cancelled();
        sink.emit(StreamEvent::agent_stop()).await;
        drop(sink);
        let mut got = Vec::new();
        while let Some(ev) = rx.recv().await {
            got.push(ev.kind);
        }
        assert_eq!(got, vec![StreamEventKind::AgentStart]);
    }

    #[tokio::test]
    async fn sink_survives_dropped_receiver() {
        let (sink, rx) = ProgressSink::channel(1);
        drop(rx);
        sink.emit(StreamEvent::agent_start()).await;
    }
}
