// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use futures::StreamExt;
use runa_model::{
    CompletionRequest, ContentBlock, Message, ModelProvider, ModelReply, ResponseEvent, RunUsage,
    StopReason, ToolCallRequest, ToolSchema,
};
use tracing::warn;

use crate::collab::Tracer;
use crate::compact::Compactor;
use crate::error::RuntimeError;
use crate::events::{Event, EventPayload};
use crate::history::{visible_from, SessionHistory};
use crate::hooks::HookExecutor;
use crate::progress::{ProgressSink, StreamEvent};
use crate::recorder::Recorder;
use crate::stats::TokenTracker;

/// The result of one assistant turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    /// True when the model produced no tool calls — the agent loop ends.
    pub done: bool,
}

/// Everything a driver needs for one run.  Built by the run pipeline from
/// the prepared run and the frozen options.
pub(crate) struct DriverParams {
    pub model: Arc<dyn ModelProvider>,
    pub tool_schemas: Vec<ToolSchema>,
    pub hooks: Arc<HookExecutor>,
    pub recorder: Arc<Recorder>,
    pub history: Arc<SessionHistory>,
    pub compactor: Arc<Compactor>,
    pub tracker: Option<Arc<TokenTracker>>,
    pub tracer: Arc<dyn Tracer>,
    pub system_prompt: String,
    pub enable_prompt_cache: bool,
    pub token_budget: Option<usize>,
    pub session_id: String,
    pub request_id: String,
    pub pending_prompt: Option<(String, Vec<ContentBlock>)>,
    pub progress: Option<ProgressSink>,
}

/// Drives exactly one model turn per `step()` call:
/// ingest the pending prompt, give the compactor a chance, snapshot + trim
/// the history, call the model (always streaming), absorb the assistant
/// message, and report whether the loop is done.
pub(crate) struct ConversationDriver {
    model: Arc<dyn ModelProvider>,
    tool_schemas: Vec<ToolSchema>,
    hooks: Arc<HookExecutor>,
    recorder: Arc<Recorder>,
    history: Arc<SessionHistory>,
    compactor: Arc<Compactor>,
    tracker: Option<Arc<TokenTracker>>,
    tracer: Arc<dyn Tracer>,
    system_prompt: String,
    enable_prompt_cache: bool,
    token_budget: Option<usize>,
    session_id: String,
    request_id: String,
    pending: Option<(String, Vec<ContentBlock>)>,
    progress: Option<ProgressSink>,
    usage: RunUsage,
    last_stop: StopReason,
}

impl ConversationDriver {
    pub fn new(p: DriverParams) -> Self {
        Self {
            model: p.model,
            tool_schemas: p.tool_schemas,
            hooks: p.hooks,
            recorder: p.recorder,
            history: p.history,
            compactor: p.compactor,
            tracker: p.tracker,
            tracer: p.tracer,
            system_prompt: p.system_prompt,
            enable_prompt_cache: p.enable_prompt_cache,
            token_budget: p.token_budget,
            session_id: p.session_id,
            request_id: p.request_id,
            pending: p.pending_prompt,
            progress: p.progress,
            usage: RunUsage::default(),
            last_stop: StopReason::EndTurn,
        }
    }

    pub fn usage(&self) -> RunUsage {
        self.usage
    }

    pub fn last_stop_reason(&self) -> StopReason {
        self.last_stop
    }

    pub async fn step(&mut self) -> Result<TurnOutcome, RuntimeError> {
        // 1. Ingest the prompt exactly once; later turns send history only.
        if let Some((prompt, blocks)) = self.pending.take() {
            let msg = if blocks.is_empty() {
                Message::user(&prompt)
            } else {
                Message::user_with_blocks(&prompt, blocks)
            };
            self.history.append(msg);
            self.hooks
                .notify(
                    &self.recorder,
                    Event::new(
                        &self.session_id,
                        &self.request_id,
                        EventPayload::UserPromptSubmit { prompt },
                    ),
                )
                .await;
        }

        // 2. Compaction check before the model sees the history.
        self.compactor
            .maybe_compact(
                &self.history,
                &self.session_id,
                &self.request_id,
                &self.hooks,
                &self.recorder,
            )
            .await?;

        // 3. Snapshot + read-time trim.
        let snapshot = self.history.snapshot();
        let start = match self.token_budget {
            Some(budget) => visible_from(&snapshot, budget),
            None => 0,
        };

        // 4. Assemble the request.
        let mut messages = Vec::with_capacity(snapshot.len() - start + 1);
        messages.push(Message::system(&self.system_prompt));
        messages.extend_from_slice(&snapshot[start..]);
        let request = CompletionRequest {
            messages,
            tools: self.tool_schemas.clone(),
            enable_prompt_cache: self.enable_prompt_cache,
            max_tokens: None,
        };

        // 5. Streaming model call; only the final aggregation is kept.
        let span = self.tracer.start_model_span(self.model.model_name());
        let reply = self.consume_stream(request).await;
        self.tracer.end_span(span);
        let reply = reply?;

        // 6. Absorb the assistant turn.
        self.history.append(Message::from_reply(&reply));
        self.usage.absorb(&reply.usage);
        self.last_stop = reply.stop_reason;
        if let Some(tracker) = &self.tracker {
            let model = if reply.model.is_empty() {
                self.model.model_name()
            } else {
                &reply.model
            };
            tracker.record(&self.session_id, model, &reply.usage);
        }

        let done = reply.tool_calls.is_empty();
        Ok(TurnOutcome {
            content: reply.content,
            tool_calls: reply.tool_calls,
            done,
        })
    }

    /// Consume the provider stream, forwarding message/content-block events
    /// to the progress sink and returning the aggregated reply.
    async fn consume_stream(
        &mut self,
        request: CompletionRequest,
    ) -> Result<ModelReply, RuntimeError> {
        let mut stream = self
            .model
            .generate(request)
            .await
            .map_err(RuntimeError::Other)?;

        if let Some(p) = &self.progress {
            p.emit(StreamEvent::message_start()).await;
        }

        let mut block_open = false;
        let mut streamed_text = false;
        let mut final_reply: Option<ModelReply> = None;
        while let Some(ev) = stream.next().await {
            match ev.map_err(RuntimeError::Other)? {
                ResponseEvent::TextDelta(delta) if !delta.is_empty() => {
                    streamed_text = true;
                    if let Some(p) = &self.progress {
                        if !block_open {
                            block_open = true;
                            p.emit(StreamEvent::content_block_start()).await;
                        }
                        p.emit(StreamEvent::content_block_delta(delta)).await;
                    }
                }
                ResponseEvent::Final(reply) => final_reply = Some(reply),
                ResponseEvent::Error(e) => warn!("model stream error: {e}"),
                _ => {}
            }
        }
        let reply = final_reply.ok_or_else(|| {
            RuntimeError::Other(anyhow::anyhow!("model stream ended without a final reply"))
        })?;

        if let Some(p) = &self.progress {
            // Providers that skip deltas still produce a visible block.
            if !streamed_text && !reply.content.is_empty() {
                block_open = true;
                p.emit(StreamEvent::content_block_start()).await;
                p.emit(StreamEvent::content_block_delta(&reply.content)).await;
            }
            if block_open {
                p.emit(StreamEvent::content_block_stop()).await;
            }
            p.emit(StreamEvent::message_delta(reply.stop_reason, Some(reply.usage)))
                .await;
            p.emit(StreamEvent::message_stop()).await;
        }

        Ok(reply)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
