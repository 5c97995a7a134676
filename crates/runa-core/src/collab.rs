// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use runa_config::ModelTier;
use serde_json::Value;

/// One matched declarative item (slash-command or skill) found in a prompt.
#[derive(Debug, Clone)]
pub struct Activation {
    pub name: String,
    /// Argument text following the trigger, when any.
    pub argument: Option<String>,
    /// The exact prompt line that triggered the match; commands have their
    /// line stripped from the prompt after execution.
    pub line: Option<String>,
}

/// Effects a command or skill applies to the run being prepared.
#[derive(Debug, Clone, Default)]
pub struct ActivationOutcome {
    /// Full prompt replacement.  Applied before `append_context`.
    pub prompt: Option<String>,
    /// Extra context appended to the prompt.
    pub append_context: Option<String>,
    /// Restrict the run's tool whitelist (intersected with the request's).
    pub tool_whitelist: Option<Vec<String>>,
    /// Arbitrary artifact surfaced on the response.
    pub artifact: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct ActivationContext {
    pub session_id: String,
    pub request_id: String,
}

/// Declarative slash-command registry.
#[async_trait]
pub trait CommandRegistry: Send + Sync {
    fn matches(&self, prompt: &str) -> Vec<Activation>;
    async fn execute(
        &self,
        activation: &Activation,
        cx: &ActivationContext,
    ) -> anyhow::Result<ActivationOutcome>;
}

/// Declarative skill registry; same activation surface, but matched skills
/// enrich the prompt rather than being stripped from it.
#[async_trait]
pub trait SkillRegistry: Send + Sync {
    fn matches(&self, prompt: &str) -> Vec<Activation>;
    async fn execute(
        &self,
        activation: &Activation,
        cx: &ActivationContext,
    ) -> anyhow::Result<ActivationOutcome>;
}

/// Alternate execution profile for a single run.
#[derive(Debug, Clone, Default)]
pub struct SubagentProfile {
    pub name: String,
    /// Empty means the subagent does not constrain the tool set.
    pub tool_whitelist: Vec<String>,
    /// Extra system-prompt context for this profile.
    pub base_context: Option<String>,
    pub model_tier: Option<ModelTier>,
}

/// Named subagent profiles.  An explicitly requested profile that does not
/// exist is an error; implicit prompt matching that finds nothing is not.
pub trait SubagentRegistry: Send + Sync {
    fn get(&self, name: &str) -> Option<SubagentProfile>;
    fn match_prompt(&self, prompt: &str) -> Option<SubagentProfile>;
}

/// Hot-reloadable rules content merged into the system prompt each turn.
pub trait RulesLoader: Send + Sync {
    fn content(&self) -> Option<String>;
    /// Stop any file watcher.  Called once during runtime close.
    fn close(&self) {}
}

pub type SpanId = u64;

/// Tracing backend contract.  The default is a no-op; embedders plug in an
/// OTEL exporter (or anything else) without the core linking against it.
pub trait Tracer: Send + Sync {
    fn start_agent_span(&self, session_id: &str, request_id: &str) -> SpanId;
    fn start_model_span(&self, model: &str) -> SpanId;
    fn start_tool_span(&self, tool: &str) -> SpanId;
    fn end_span(&self, span: SpanId);
    fn shutdown(&self) {}
}

#[derive(Debug, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn start_agent_span(&self, _session_id: &str, _request_id: &str) -> SpanId {
        0
    }
    fn start_model_span(&self, _model: &str) -> SpanId {
        0
    }
    fn start_tool_span(&self, _tool: &str) -> SpanId {
        0
    }
    fn end_span(&self, _span: SpanId) {}
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
