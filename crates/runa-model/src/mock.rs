// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use tokio::sync::{mpsc, Semaphore};

use crate::{
    CompletionRequest, ModelReply, ModelProvider, ResponseEvent, ResponseStream, ToolCallRequest,
    Usage,
};

fn boxed(events: Vec<ResponseEvent>) -> ResponseStream {
    let wrapped: Vec<anyhow::Result<ResponseEvent>> = events.into_iter().map(Ok).collect();
    Box::pin(stream::iter(wrapped))
}

/// Deterministic mock provider for tests.  Echoes the last user message back
/// as the assistant response.
#[derive(Default)]
pub struct EchoProvider;

#[async_trait]
impl ModelProvider for EchoProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "echo-model"
    }

    async fn generate(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == crate::Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("[no input]")
            .to_string();

        let mut aggregated = ModelReply::text(format!("ECHO: {reply}"));
        aggregated.model = "echo-model".into();
        aggregated.usage = Usage {
            input_tokens: 10,
            output_tokens: 10,
            ..Default::default()
        };
        Ok(boxed(vec![
            ResponseEvent::TextDelta(format!("ECHO: {reply}")),
            ResponseEvent::Usage(aggregated.usage),
            ResponseEvent::Final(aggregated),
        ]))
    }
}

/// A pre-scripted mock provider.  Each call to `generate` pops the next
/// response script from the front of the queue, so tests can specify exact
/// event sequences — including tool calls — without network access.
pub struct ScriptedProvider {
    scripts: Arc<Mutex<Vec<Vec<ResponseEvent>>>>,
    model: String,
    /// The last `CompletionRequest` seen by this provider.  Written on each
    /// `generate()` call so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl ScriptedProvider {
    /// Build a provider from an ordered list of response scripts.
    pub fn new(scripts: Vec<Vec<ResponseEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            model: "scripted-model".into(),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_model_name(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Convenience: provider whose every call streams a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let r = reply.into();
        let mut aggregated = ModelReply::text(&r);
        aggregated.usage = Usage {
            input_tokens: 5,
            output_tokens: 5,
            ..Default::default()
        };
        Self::new(vec![vec![
            ResponseEvent::TextDelta(r),
            ResponseEvent::Usage(aggregated.usage),
            ResponseEvent::Final(aggregated),
        ]])
    }

    /// Convenience: first call emits a tool call, second call a text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args: serde_json::Value,
        final_text: impl Into<String>,
    ) -> Self {
        let call = ToolCallRequest {
            id: tool_id.into(),
            name: tool_name.into(),
            input: args,
        };
        Self::new(vec![
            vec![ResponseEvent::Final(ModelReply::with_tool_calls(
                "",
                vec![call],
            ))],
            vec![
                ResponseEvent::TextDelta(final_text.into()),
                ResponseEvent::Final(ModelReply::text("")),
            ],
        ])
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        *self.last_request.lock().unwrap() = Some(req);
        let mut events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed.
                vec![ResponseEvent::Final(ModelReply::text("[no more scripts]"))]
            } else {
                scripts.remove(0)
            }
        };
        // Scripts written as deltas only still need the aggregated reply;
        // synthesize it from the text deltas so every stream ends in Final.
        if !events
            .iter()
            .any(|e| matches!(e, ResponseEvent::Final(_)))
        {
            let text: String = events
                .iter()
                .filter_map(|e| match e {
                    ResponseEvent::TextDelta(t) => Some(t.as_str()),
                    _ => None,
                })
                .collect();
            events.push(ResponseEvent::Final(ModelReply::text(text)));
        }
        Ok(boxed(events))
    }
}

/// A provider that parks inside `generate` until released.
///
/// Used to observe concurrency: each call signals `started` and then waits
/// for one permit on the shared semaphore.  Tests assert how many `started`
/// signals arrive before any permits are added.
pub struct BlockingProvider {
    started: mpsc::UnboundedSender<String>,
    gate: Arc<Semaphore>,
    reply: String,
}

impl BlockingProvider {
    /// Returns the provider plus the `started` receiver and the release
    /// semaphore (constructed with zero permits).
    pub fn new(
        reply: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<String>, Arc<Semaphore>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Semaphore::new(0));
        (
            Self {
                started: tx,
                gate: Arc::clone(&gate),
                reply: reply.into(),
            },
            rx,
            gate,
        )
    }
}

#[async_trait]
impl ModelProvider for BlockingProvider {
    fn name(&self) -> &str {
        "blocking-mock"
    }
    fn model_name(&self) -> &str {
        "blocking-model"
    }

    async fn generate(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let marker = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == crate::Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let _ = self.started.send(marker);
        let permit = self.gate.acquire().await?;
        permit.forget();
        Ok(boxed(vec![ResponseEvent::Final(ModelReply::text(
            self.reply.clone(),
        ))]))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
