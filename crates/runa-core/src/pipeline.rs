// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;
use std::sync::Arc;

use runa_config::ModelTier;
use runa_model::{ContentBlock, ModelProvider, RunUsage, StopReason};
use runa_tools::{canonical_name, SandboxSnapshot};
use serde_json::Value;
use tracing::{debug, warn};

use crate::collab::{ActivationContext, ActivationOutcome, SubagentProfile};
use crate::driver::{ConversationDriver, DriverParams};
use crate::dispatch::ToolDispatcher;
use crate::error::RuntimeError;
use crate::events::{Event, EventPayload};
use crate::gate::GateGuard;
use crate::history::SessionHistory;
use crate::middleware::{
    each_after_model, each_after_tool, each_before_model, each_before_tool, StageInfo,
    StageMiddleware,
};
use crate::persist::sanitize_session_id;
use crate::progress::{ProgressSink, StreamEvent};
use crate::recorder::Recorder;
use crate::runtime::Runtime;

/// One agent invocation.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Conversation scope; a fresh UUID is assigned when absent.
    pub session_id: Option<String>,
    pub request_id: Option<String>,
    pub prompt: String,
    pub blocks: Vec<ContentBlock>,
    /// Tool names this run may call; empty allows all registered tools.
    pub tool_whitelist: Vec<String>,
    pub model_tier: Option<ModelTier>,
    /// Target a named subagent profile.  Unknown names are an error;
    /// omitting the field lets the registry match implicitly (or not at
    /// all).
    pub subagent: Option<String>,
    /// Per-request override of the runtime's prompt-cache default.
    pub enable_prompt_cache: Option<bool>,
}

impl RunRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub output: String,
    pub stop_reason: StopReason,
}

/// Artifacts produced by prompt preprocessing.
#[derive(Debug, Clone, Default)]
pub struct RunArtifacts {
    pub commands: Vec<Value>,
    pub skills: Vec<String>,
    pub subagent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunResponse {
    pub session_id: String,
    pub request_id: String,
    pub result: RunResult,
    /// Everything the per-request recorder captured, in program order.
    pub events: Vec<Event>,
    pub usage: RunUsage,
    pub artifacts: RunArtifacts,
    pub sandbox: Option<SandboxSnapshot>,
}

/// Immutable per-run bundle produced by `prepare`; lives for one run.
/// Holding it holds the session gate.
pub struct PreparedRun {
    pub session_id: String,
    pub request_id: String,
    pub prompt: String,
    pub blocks: Vec<ContentBlock>,
    pub history: Arc<SessionHistory>,
    pub recorder: Arc<Recorder>,
    /// Canonical tool names; empty means every registered tool.
    pub allow_set: HashSet<String>,
    pub subagent: Option<SubagentProfile>,
    pub model_tier: Option<ModelTier>,
    pub enable_prompt_cache: bool,
    pub artifacts: RunArtifacts,
    _guard: GateGuard,
}

/// What `drive` hands to `build_response`.
#[derive(Debug, Clone)]
pub(crate) struct DriveOutcome {
    pub output: String,
    pub stop_reason: StopReason,
    pub usage: RunUsage,
}

/// Fold `other` into `acc` with empty-means-unconstrained semantics.
fn intersect_whitelists(acc: HashSet<String>, other: HashSet<String>) -> HashSet<String> {
    if acc.is_empty() {
        other
    } else if other.is_empty() {
        acc
    } else {
        acc.intersection(&other).cloned().collect()
    }
}

fn canonical_set(names: &[String]) -> HashSet<String> {
    names.iter().map(|n| canonical_name(n)).collect()
}

impl Runtime {
    /// Normalize the request, fetch session state, run the pre-turn
    /// compaction check, and preprocess the prompt through the declarative
    /// registries.  The returned bundle owns the session gate.
    pub(crate) async fn prepare(
        &self,
        request: RunRequest,
        session_id: String,
        guard: GateGuard,
    ) -> Result<PreparedRun, RuntimeError> {
        let inner = self.inner();
        let request_id = request
            .request_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let recorder = Arc::new(Recorder::new());

        inner
            .hooks
            .notify(
                &recorder,
                Event::new(&session_id, &request_id, EventPayload::SessionStart),
            )
            .await;

        let history = inner.histories.get(&session_id);

        // Pre-turn compaction check: trigger evaluation only.  The driver
        // compacts after it ingests the prompt, which keeps the recorded
        // PreCompact/ContextCompacted events behind UserPromptSubmit.
        if inner
            .compactor
            .should_compact(history.len(), history.approx_tokens())
        {
            debug!(session_id = %session_id, "history over threshold; compacting on first turn");
        }

        let mut prompt = request.prompt.clone();
        let mut allow_set = canonical_set(&request.tool_whitelist);
        let mut artifacts = RunArtifacts::default();
        let acx = ActivationContext {
            session_id: session_id.clone(),
            request_id: request_id.clone(),
        };

        // Slash-commands embedded in the prompt run first and their trigger
        // lines are stripped.
        if let Some(commands) = &inner.opts.commands {
            for activation in commands.matches(&prompt) {
                let outcome = commands
                    .execute(&activation, &acx)
                    .await
                    .map_err(RuntimeError::Other)?;
                if let Some(line) = &activation.line {
                    prompt = strip_line(&prompt, line);
                }
                if let Some(artifact) = &outcome.artifact {
                    artifacts.commands.push(artifact.clone());
                }
                apply_outcome(&mut prompt, &mut allow_set, outcome);
                debug!(command = %activation.name, "slash-command applied");
            }
        }

        // Matched skills enrich the prompt.
        if let Some(skills) = &inner.opts.skills {
            for activation in skills.matches(&prompt) {
                let outcome = skills
                    .execute(&activation, &acx)
                    .await
                    .map_err(RuntimeError::Other)?;
                artifacts.skills.push(activation.name.clone());
                apply_outcome(&mut prompt, &mut allow_set, outcome);
            }
        }

        // Subagent dispatch: an explicit target must exist; implicit
        // matching is best-effort.
        let subagent = match (&request.subagent, &inner.opts.subagents) {
            (Some(name), Some(registry)) => Some(
                registry
                    .get(name)
                    .ok_or_else(|| anyhow::anyhow!("subagent {name} not found"))?,
            ),
            (Some(name), None) => {
                return Err(RuntimeError::Other(anyhow::anyhow!(
                    "subagent {name} requested but no subagent registry is configured"
                )));
            }
            (None, Some(registry)) => registry.match_prompt(&prompt),
            (None, None) => None,
        };
        if let Some(profile) = &subagent {
            allow_set = intersect_whitelists(allow_set, canonical_set(&profile.tool_whitelist));
            artifacts.subagent = Some(profile.name.clone());
        }

        let enable_prompt_cache = request
            .enable_prompt_cache
            .unwrap_or(inner.opts.enable_prompt_cache);

        Ok(PreparedRun {
            session_id,
            request_id,
            prompt,
            blocks: request.blocks,
            history,
            recorder,
            allow_set,
            model_tier: request.model_tier,
            subagent,
            enable_prompt_cache,
            artifacts,
            _guard: guard,
        })
    }

    /// The agent loop: model turn, then each tool call in order, until the
    /// model stops calling tools or a bound trips.
    pub(crate) async fn drive(
        &self,
        prepared: &PreparedRun,
        progress: Option<ProgressSink>,
        extra_middleware: &[Arc<dyn StageMiddleware>],
    ) -> Result<DriveOutcome, RuntimeError> {
        let inner = self.inner();

        let (model, selected_tier) = self.select_model(prepared)?;
        if let Some(tier) = selected_tier {
            inner
                .hooks
                .notify(
                    &prepared.recorder,
                    Event::new(
                        &prepared.session_id,
                        &prepared.request_id,
                        EventPayload::ModelSelected {
                            model: model.model_name().to_string(),
                            tier: tier.to_string(),
                        },
                    ),
                )
                .await;
        }

        if let Some(profile) = &prepared.subagent {
            inner
                .hooks
                .notify(
                    &prepared.recorder,
                    Event::new(
                        &prepared.session_id,
                        &prepared.request_id,
                        EventPayload::SubagentStart {
                            name: profile.name.clone(),
                        },
                    ),
                )
                .await;
        }

        let agent_span = inner
            .tracer
            .start_agent_span(&prepared.session_id, &prepared.request_id);
        let result = self
            .drive_loop(prepared, model, progress, extra_middleware)
            .await;
        inner.tracer.end_span(agent_span);

        if let Some(profile) = &prepared.subagent {
            inner
                .hooks
                .notify(
                    &prepared.recorder,
                    Event::new(
                        &prepared.session_id,
                        &prepared.request_id,
                        EventPayload::SubagentStop {
                            name: profile.name.clone(),
                        },
                    ),
                )
                .await;
        }

        let outcome = result?;

        inner
            .hooks
            .notify(
                &prepared.recorder,
                Event::new(
                    &prepared.session_id,
                    &prepared.request_id,
                    EventPayload::Stop {
                        reason: outcome.stop_reason.to_string(),
                    },
                ),
            )
            .await;

        if inner.opts.track_usage {
            inner
                .hooks
                .notify(
                    &prepared.recorder,
                    Event::new(
                        &prepared.session_id,
                        &prepared.request_id,
                        EventPayload::TokenUsage {
                            input_tokens: outcome.usage.input_tokens,
                            output_tokens: outcome.usage.output_tokens,
                            total_tokens: outcome.usage.total(),
                            cache_read_tokens: outcome.usage.cache_read_tokens,
                            cache_creation_tokens: outcome.usage.cache_creation_tokens,
                        },
                    ),
                )
                .await;
        }

        Ok(outcome)
    }

    async fn drive_loop(
        &self,
        prepared: &PreparedRun,
        model: Arc<dyn ModelProvider>,
        progress: Option<ProgressSink>,
        extra_middleware: &[Arc<dyn StageMiddleware>],
    ) -> Result<DriveOutcome, RuntimeError> {
        let inner = self.inner();
        let limits = &inner.opts.limits;

        let mut system_prompt = inner.opts.system_prompt.clone().unwrap_or_default();
        if let Some(profile) = &prepared.subagent {
            if let Some(ctx) = &profile.base_context {
                if !system_prompt.is_empty() {
                    system_prompt.push_str("\n\n");
                }
                system_prompt.push_str(ctx);
            }
        }
        if let Some(rules) = &inner.opts.rules {
            if let Some(content) = rules.content() {
                if !system_prompt.is_empty() {
                    system_prompt.push_str("\n\n");
                }
                system_prompt.push_str(&content);
            }
        }

        let tool_schemas = if prepared.allow_set.is_empty() {
            inner.registry.schemas()
        } else {
            inner
                .registry
                .schemas()
                .into_iter()
                .filter(|s| prepared.allow_set.contains(&canonical_name(&s.name)))
                .collect()
        };

        let mut driver = ConversationDriver::new(DriverParams {
            model,
            tool_schemas,
            hooks: Arc::clone(&inner.hooks),
            recorder: Arc::clone(&prepared.recorder),
            history: Arc::clone(&prepared.history),
            compactor: Arc::clone(&inner.compactor),
            tracker: inner.opts.track_usage.then(|| Arc::clone(&inner.tracker)),
            tracer: Arc::clone(&inner.tracer),
            system_prompt,
            enable_prompt_cache: prepared.enable_prompt_cache,
            token_budget: limits.token_budget,
            session_id: prepared.session_id.clone(),
            request_id: prepared.request_id.clone(),
            pending_prompt: Some((prepared.prompt.clone(), prepared.blocks.clone())),
            progress: progress.clone(),
        });

        let dispatcher = ToolDispatcher {
            registry: Arc::clone(&inner.registry),
            hooks: Arc::clone(&inner.hooks),
            resolver: Arc::clone(&inner.resolver),
            sandbox: inner.opts.sandbox.clone(),
            tracer: Arc::clone(&inner.tracer),
            recorder: Arc::clone(&prepared.recorder),
            history: Arc::clone(&prepared.history),
            allow_set: prepared.allow_set.clone(),
            session_id: prepared.session_id.clone(),
            request_id: prepared.request_id.clone(),
            scratch_dir: inner
                .scratch_root
                .join(sanitize_session_id(&prepared.session_id)),
            progress: progress.clone(),
        };

        let mut middleware: Vec<Arc<dyn StageMiddleware>> = inner.opts.middleware.clone();
        middleware.extend_from_slice(extra_middleware);
        let mw_timeout = limits.middleware_timeout;
        let max_iterations = limits.max_iterations;

        let loop_fut = async {
            let mut iteration = 0u32;
            loop {
                iteration += 1;
                if iteration > max_iterations {
                    return Err(RuntimeError::MaxIterationsExceeded(max_iterations));
                }
                let stage = StageInfo {
                    session_id: prepared.session_id.clone(),
                    request_id: prepared.request_id.clone(),
                    iteration,
                };
                if let Some(p) = &progress {
                    p.emit(StreamEvent::iteration_start(iteration)).await;
                }

                each_before_model(&middleware, mw_timeout, &stage).await;
                let turn = driver.step().await?;
                each_after_model(&middleware, mw_timeout, &stage, &turn).await;

                for call in &turn.tool_calls {
                    each_before_tool(&middleware, mw_timeout, &stage, call).await;
                    let outcome = dispatcher.dispatch(call).await;
                    each_after_tool(&middleware, mw_timeout, &stage, call, outcome.is_error)
                        .await;
                }

                if let Some(p) = &progress {
                    p.emit(StreamEvent::iteration_stop(iteration)).await;
                }

                if turn.done {
                    return Ok(turn.content);
                }
            }
        };

        let output = match limits.run_timeout {
            Some(deadline) => tokio::time::timeout(deadline, loop_fut)
                .await
                .map_err(|_| RuntimeError::Timeout(deadline))??,
            None => loop_fut.await?,
        };

        Ok(DriveOutcome {
            output,
            stop_reason: driver.last_stop_reason(),
            usage: driver.usage(),
        })
    }

    fn select_model(
        &self,
        prepared: &PreparedRun,
    ) -> Result<(Arc<dyn ModelProvider>, Option<ModelTier>), RuntimeError> {
        let inner = self.inner();
        let pool = &inner.opts.models;
        let requested = prepared
            .model_tier
            .or_else(|| prepared.subagent.as_ref().and_then(|s| s.model_tier));
        if let Some(tier) = requested {
            if let Some(provider) = pool.tiers.get(&tier) {
                return Ok((Arc::clone(provider), Some(tier)));
            }
            warn!(%tier, "no provider mapped to requested tier; using default model");
        }
        pool.default
            .as_ref()
            .map(|p| (Arc::clone(p), None))
            .ok_or(RuntimeError::MissingModel)
    }

    /// Drain the recorder (exactly once) and assemble the response.
    pub(crate) fn build_response(
        &self,
        prepared: PreparedRun,
        outcome: DriveOutcome,
    ) -> RunResponse {
        let sandbox = self.inner().opts.sandbox.as_ref().map(|s| s.snapshot());
        RunResponse {
            session_id: prepared.session_id.clone(),
            request_id: prepared.request_id.clone(),
            result: RunResult {
                output: outcome.output,
                stop_reason: outcome.stop_reason,
            },
            events: prepared.recorder.drain(),
            usage: outcome.usage,
            artifacts: prepared.artifacts,
            sandbox,
        }
    }
}

fn apply_outcome(prompt: &mut String, allow_set: &mut HashSet<String>, outcome: ActivationOutcome) {
    if let Some(rewrite) = outcome.prompt {
        *prompt = rewrite;
    }
    if let Some(ctx) = outcome.append_context {
        if !prompt.is_empty() {
            prompt.push_str("\n\n");
        }
        prompt.push_str(&ctx);
    }
    if let Some(whitelist) = outcome.tool_whitelist {
        let incoming = canonical_set(&whitelist);
        *allow_set = intersect_whitelists(std::mem::take(allow_set), incoming);
    }
}

/// Remove the first prompt line equal to `line` (trimmed comparison).
fn strip_line(prompt: &str, line: &str) -> String {
    let mut stripped = false;
    let kept: Vec<&str> = prompt
        .lines()
        .filter(|l| {
            if !stripped && l.trim() == line.trim() {
                stripped = true;
                false
            } else {
                true
            }
        })
        .collect();
    kept.join("\n").trim().to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intersect_treats_empty_as_unconstrained() {
        let a: HashSet<String> = HashSet::new();
        let b: HashSet<String> = ["x".to_string()].into();
        assert_eq!(intersect_whitelists(a.clone(), b.clone()), b);
        assert_eq!(intersect_whitelists(b.clone(), a), b);
    }

    #[test]
    fn intersect_non_empty_sets() {
        let a: HashSet<String> = ["x".to_string(), "y".to_string()].into();
        let b: HashSet<String> = ["y".to_string(), "z".to_string()].into();
        let out = intersect_whitelists(a, b);
        assert_eq!(out, ["y".to_string()].into());
    }

    #[test]
    fn strip_line_removes_only_the_first_match() {
        let prompt = "/deploy prod\ndo the thing\n/deploy prod";
        let out = strip_line(prompt, "/deploy prod");
        assert_eq!(out, "do the thing\n/deploy prod");
    }

    #[test]
    fn apply_outcome_rewrites_then_appends() {
        let mut prompt = "original".to_string();
        let mut allow = HashSet::new();
        apply_outcome(
            &mut prompt,
            &mut allow,
            ActivationOutcome {
                prompt: Some("rewritten".into()),
                append_context: Some("extra context".into()),
                tool_whitelist: Some(vec!["Echo".into()]),
                artifact: None,
            },
        );
        assert_eq!(prompt, "rewritten\n\nextra context");
        assert!(allow.contains("echo"));
    }
}
