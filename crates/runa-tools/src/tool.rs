// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::sandbox::SandboxManager;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier from the model (forwarded verbatim).
    pub id: String,
    pub name: String,
    /// Parsed JSON argument object.
    pub input: Value,
    pub session_id: String,
}

/// The result of executing a tool.
#[derive(Debug, Clone, Default)]
pub struct ToolResult {
    /// Plain-text output handed back to the model.
    pub output: String,
    /// Optional structured payload for programmatic consumers.
    pub data: Option<Value>,
    /// Reference to an artifact written outside the conversation (e.g. a
    /// large output spilled to the scratch directory).
    pub output_ref: Option<PathBuf>,
    pub metadata: serde_json::Map<String, Value>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn with_data(output: impl Into<String>, data: Value) -> Self {
        Self {
            output: output.into(),
            data: Some(data),
            ..Default::default()
        }
    }
}

/// One chunk of live tool output.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub chunk: String,
    pub is_stderr: bool,
}

/// Sink a streaming-capable tool writes incremental output into.
///
/// Installed on the [`ToolContext`] by the dispatcher rather than being part
/// of the [`Tool`] signature; tools that never look for it run unchanged.
/// An absent sink means the call is synchronous and only the final result is
/// observed.
#[derive(Clone)]
pub struct StreamSink {
    tx: mpsc::Sender<StreamChunk>,
}

impl StreamSink {
    pub fn new(tx: mpsc::Sender<StreamChunk>) -> Self {
        Self { tx }
    }

    /// Forward one chunk.  Send failures mean the consumer is gone; the tool
    /// keeps running and the chunk is dropped.
    pub async fn emit(&self, chunk: impl Into<String>, is_stderr: bool) {
        let _ = self
            .tx
            .send(StreamChunk {
                chunk: chunk.into(),
                is_stderr,
            })
            .await;
    }
}

/// Per-call execution environment handed to a tool.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub request_id: String,
    /// Session-scoped scratch directory for spilled outputs.  Created
    /// lazily by tools that need it; removed when the session is evicted.
    pub scratch_dir: PathBuf,
    /// Path/network/resource policy enforced around side effects.
    pub sandbox: Option<Arc<dyn SandboxManager>>,
    /// Present only when the run is streaming and the caller wants live
    /// output.
    pub stream: Option<StreamSink>,
}

/// Trait every callable tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema of the input object.
    fn schema(&self) -> Value;
    /// Execute the tool.  Errors are reported back to the model as a
    /// structured tool-result error by the dispatcher.
    async fn execute(&self, cx: &ToolContext, call: &ToolCall) -> anyhow::Result<ToolResult>;
    /// Release any long-lived resources (remote sessions, subprocesses).
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// True when `schema` declares at least one required input field.
///
/// Used to distinguish "this tool legitimately takes no arguments" from a
/// proxy having stripped the arguments off the wire.
pub fn schema_has_required_fields(schema: &Value) -> bool {
    schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|r| !r.is_empty())
        .unwrap_or(false)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn tool_result_ok_has_no_data() {
        let r = ToolResult::ok("done");
        assert_eq!(r.output, "done");
        assert!(r.data.is_none());
        assert!(r.metadata.is_empty());
    }

    #[test]
    fn tool_result_with_data_keeps_payload() {
        let r = ToolResult::with_data("done", json!({"count": 3}));
        assert_eq!(r.data.unwrap()["count"], 3);
    }

    #[test]
    fn schema_with_required_fields_detected() {
        let schema = json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"],
        });
        assert!(schema_has_required_fields(&schema));
    }

    #[test]
    fn schema_without_required_fields_detected() {
        assert!(!schema_has_required_fields(&json!({"type": "object"})));
        assert!(!schema_has_required_fields(
            &json!({"type": "object", "required": []})
        ));
    }

    #[tokio::test]
    async fn stream_sink_forwards_chunks_in_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let sink = StreamSink::new(tx);
        sink.emit("out", false).await;
        sink.emit("err", true).await;
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.chunk, "out");
        assert!(!first.is_stderr);
        assert!(second.is_stderr);
    }

    #[tokio::test]
    async fn stream_sink_survives_dropped_receiver() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sink = StreamSink::new(tx);
        // Must not panic or block.
        sink.emit("ignored", false).await;
    }
}
