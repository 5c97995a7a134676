// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use runa_config::{CompactionConfig, HistoryConfig, LimitsConfig, ModelTier, StreamConfig};
use runa_model::ModelProvider;
use runa_tools::{SandboxManager, Tool};

use crate::collab::{CommandRegistry, RulesLoader, SkillRegistry, SubagentRegistry, Tracer};
use crate::events::EventKind;
use crate::hooks::Hook;
use crate::middleware::StageMiddleware;
use crate::resolver::{ApprovalQueue, PermissionPrompt};
use crate::stats::StatsCallback;

/// Model providers by role.  The tier map feeds per-request and per-subagent
/// selection; the summary slots feed the compactor.
#[derive(Clone, Default)]
pub struct ModelPool {
    pub default: Option<Arc<dyn ModelProvider>>,
    pub tiers: HashMap<ModelTier, Arc<dyn ModelProvider>>,
    /// Compaction summary model; falls back to `default`.
    pub summary: Option<Arc<dyn ModelProvider>>,
    /// Used from the second summary attempt onward.
    pub summary_fallback: Option<Arc<dyn ModelProvider>>,
}

/// Everything a runtime is built from.
///
/// The runtime deep-clones this at construction (a frozen snapshot): the
/// containers are copied, so the caller may keep mutating their own
/// `Options` value without racing the live runtime.  Collaborators behind
/// `Arc`s are shared but immutable by contract.
#[derive(Clone, Default)]
pub struct Options {
    pub models: ModelPool,
    pub tools: Vec<Arc<dyn Tool>>,
    pub hooks: Vec<(EventKind, Arc<dyn Hook>)>,
    pub middleware: Vec<Arc<dyn StageMiddleware>>,

    pub sandbox: Option<Arc<dyn SandboxManager>>,
    pub approval_queue: Option<Arc<dyn ApprovalQueue>>,
    pub permission_prompt: Option<Arc<dyn PermissionPrompt>>,
    /// Block on the approval queue when every other permission layer
    /// abstains.
    pub wait_for_approval: bool,

    pub commands: Option<Arc<dyn CommandRegistry>>,
    pub skills: Option<Arc<dyn SkillRegistry>>,
    pub subagents: Option<Arc<dyn SubagentRegistry>>,
    pub rules: Option<Arc<dyn RulesLoader>>,
    pub tracer: Option<Arc<dyn Tracer>>,

    pub system_prompt: Option<String>,
    /// Runtime default; a request may override per run.
    pub enable_prompt_cache: bool,
    pub track_usage: bool,
    pub stats_callback: Option<StatsCallback>,

    pub compaction: CompactionConfig,
    pub history: HistoryConfig,
    pub limits: LimitsConfig,
    pub stream: StreamConfig,

    /// Root for per-session tool scratch directories.  Defaults to a
    /// runtime-named directory under the system temp dir.
    pub scratch_dir: Option<PathBuf>,
}

impl Options {
    /// Minimal options around a single provider.
    pub fn new(model: Arc<dyn ModelProvider>) -> Self {
        Self {
            models: ModelPool {
                default: Some(model),
                ..Default::default()
            },
            track_usage: true,
            ..Default::default()
        }
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_hook(mut self, kind: EventKind, hook: Arc<dyn Hook>) -> Self {
        self.hooks.push((kind, hook));
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// The frozen snapshot taken at runtime construction.
    pub(crate) fn frozen(&self) -> Options {
        self.clone()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
