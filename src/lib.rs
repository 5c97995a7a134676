// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Embeddable multi-session agent execution runtime.
//!
//! Given a prompt, a model backend, and a set of callable tools, [`Runtime`]
//! drives a bounded loop of model generation and tool invocation until the
//! model stops asking for tools.  Sessions serialize their own runs while
//! unrelated sessions proceed in parallel; hooks observe and gate tool use;
//! a compactor keeps long conversations inside the context budget.
//!
//! ```no_run
//! use std::sync::Arc;
//! use runa::{Options, RunRequest, Runtime};
//!
//! # async fn example(model: Arc<dyn runa::ModelProvider>) -> anyhow::Result<()> {
//! let runtime = Runtime::new(Options::new(model))?;
//! let response = runtime
//!     .run(RunRequest::new("summarize the build failure").with_session("ci-42"))
//!     .await?;
//! println!("{}", response.result.output);
//! runtime.close().await?;
//! # Ok(())
//! # }
//! ```

pub use runa_config::{
    CompactionConfig, HistoryConfig, LimitsConfig, ModelTier, StreamConfig, DEFAULT_HISTORY_DIR,
    DEFAULT_TOKEN_LIMIT,
};
pub use runa_core::{
    Activation, ActivationContext, ActivationOutcome, ApprovalQueue, ApprovalRecord,
    ApprovalState, CommandRegistry, CompactOutcome, Decision, DispatchOutcome, Event, EventKind,
    EventPayload, Hook, HookOutput, HookSpecificOutput, MemoryApprovalQueue, ModelPool,
    NoopTracer, Options, PermissionPrompt, PermissionQuery, Recorder, RulesLoader, RunArtifacts,
    RunRequest, RunResponse, RunResult, Runtime, RuntimeError, SessionHistory, SessionTokenStats,
    SkillRegistry, SpanId, StageInfo, StageMiddleware, StreamDelta, StreamEvent, StreamEventKind,
    SubagentProfile, SubagentRegistry, TotalTokenStats, Tracer, TurnOutcome,
};
pub use runa_model::{
    BlockingProvider, CompletionRequest, ContentBlock, EchoProvider, Message, ModelProvider,
    ModelReply, ResponseEvent, ResponseStream, Role, RunUsage, ScriptedProvider, StopReason,
    ToolCallRequest, ToolSchema, Usage,
};
pub use runa_tools::{
    AllowAllSandbox, ResourceLimits, SandboxManager, SandboxSnapshot, StreamChunk, StreamSink,
    Tool, ToolCall, ToolContext, ToolRegistry, ToolResult,
};
