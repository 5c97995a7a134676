// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The core of the agent execution runtime: run pipeline, session gate,
//! history store, hook/event pipeline, compactor, and streaming surface.
//! Model providers, tools, and the other collaborators plug in behind the
//! traits re-exported here.
mod collab;
mod compact;
mod dispatch;
mod driver;
mod error;
mod events;
mod gate;
mod history;
mod hooks;
mod middleware;
mod options;
mod persist;
mod pipeline;
mod progress;
mod recorder;
mod resolver;
mod runtime;
mod stats;

pub use collab::{
    Activation, ActivationContext, ActivationOutcome, CommandRegistry, NoopTracer, RulesLoader,
    SkillRegistry, SpanId, SubagentProfile, SubagentRegistry, Tracer,
};
pub use compact::{CompactOutcome, Compactor};
pub use dispatch::DispatchOutcome;
pub use driver::TurnOutcome;
pub use error::RuntimeError;
pub use events::{Event, EventKind, EventPayload};
pub use gate::{GateGuard, SessionGate};
pub use history::{visible_from, HistoryStore, SessionHistory};
pub use hooks::{Decision, Hook, HookExecutor, HookOutput, HookSpecificOutput, PreToolGate};
pub use middleware::{StageInfo, StageMiddleware};
pub use options::{ModelPool, Options};
pub use persist::{sanitize_session_id, HistoryPersistence};
pub use pipeline::{PreparedRun, RunArtifacts, RunRequest, RunResponse, RunResult};
pub use progress::{ProgressSink, StreamDelta, StreamEvent, StreamEventKind};
pub use recorder::Recorder;
pub use resolver::{
    ApprovalQueue, ApprovalRecord, ApprovalState, MemoryApprovalQueue, PermissionPrompt,
    PermissionQuery, PermissionResolver,
};
pub use runtime::Runtime;
pub use stats::{
    ModelTokenStats, SessionTokenStats, StatsCallback, TokenTracker, TotalTokenStats,
};
