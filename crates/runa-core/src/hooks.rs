// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::events::{Event, EventKind};
use crate::recorder::Recorder;

fn default_true() -> bool {
    true
}

/// A permission decision returned by a hook or the permission layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
    Ask,
}

/// Nested output block mirroring the wire format external hook processes
/// use: a permission decision may live here instead of at the top level.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookSpecificOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_decision: Option<Decision>,
}

/// The result of one hook invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    /// `false` aborts the guarded operation regardless of any decision.
    #[serde(rename = "continue", default = "default_true")]
    pub should_continue: bool,
    /// Replacement tool arguments; the last non-nil rewrite wins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook_specific_output: Option<HookSpecificOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Default for HookOutput {
    fn default() -> Self {
        Self {
            decision: None,
            should_continue: true,
            updated_input: None,
            hook_specific_output: None,
            reason: None,
        }
    }
}

impl HookOutput {
    pub fn allow() -> Self {
        Self {
            decision: Some(Decision::Allow),
            ..Default::default()
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            decision: Some(Decision::Deny),
            reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn ask() -> Self {
        Self {
            decision: Some(Decision::Ask),
            ..Default::default()
        }
    }

    pub fn rewrite(input: Value) -> Self {
        Self {
            updated_input: Some(input),
            ..Default::default()
        }
    }

    pub fn block() -> Self {
        Self {
            should_continue: false,
            ..Default::default()
        }
    }

    /// Effective permission decision: top-level wins, then the nested block.
    fn effective_decision(&self) -> Option<Decision> {
        self.decision.or_else(|| {
            self.hook_specific_output
                .as_ref()
                .and_then(|h| h.permission_decision)
        })
    }

    /// True when any channel of this output carries a deny.  A `deny`
    /// anywhere dominates an `allow` elsewhere in the same output.
    fn denies(&self) -> bool {
        self.decision == Some(Decision::Deny)
            || self
                .hook_specific_output
                .as_ref()
                .map(|h| h.permission_decision == Some(Decision::Deny))
                .unwrap_or(false)
    }

    fn asks(&self) -> bool {
        self.effective_decision() == Some(Decision::Ask)
    }
}

/// An external observer/decider invoked at a typed event boundary.
#[async_trait]
pub trait Hook: Send + Sync {
    async fn run(&self, event: &Event) -> anyhow::Result<HookOutput>;
}

/// Aggregated PreToolUse verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum PreToolGate {
    Deny { reason: String },
    Ask,
    Allow { updated_input: Option<Value> },
}

/// Fans out hook invocations for typed events and evaluates decisions.
///
/// Immutable after construction; shared read-only across concurrent runs.
/// Every invocation records the triggering event through the per-request
/// recorder passed in by the caller — never through shared state.
pub struct HookExecutor {
    hooks: HashMap<EventKind, Vec<Arc<dyn Hook>>>,
}

impl HookExecutor {
    pub fn new(registrations: Vec<(EventKind, Arc<dyn Hook>)>) -> Self {
        let mut hooks: HashMap<EventKind, Vec<Arc<dyn Hook>>> = HashMap::new();
        for (kind, hook) in registrations {
            hooks.entry(kind).or_default().push(hook);
        }
        Self { hooks }
    }

    pub fn has_hooks(&self, kind: EventKind) -> bool {
        self.hooks.get(&kind).map(|v| !v.is_empty()).unwrap_or(false)
    }

    fn hooks_for(&self, kind: EventKind) -> &[Arc<dyn Hook>] {
        self.hooks.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Fire-and-forget notification: record, invoke, ignore outcomes.
    pub async fn notify(&self, recorder: &Recorder, event: Event) {
        let kind = event.kind();
        recorder.record(event.clone());
        for hook in self.hooks_for(kind) {
            if let Err(e) = hook.run(&event).await {
                warn!(event = ?kind, error = %e, "notification hook failed");
            }
        }
    }

    /// Run all outputs for a decision-point event, treating a hook failure
    /// as a deny (a hook that cannot be consulted must not be bypassed).
    async fn collect(&self, event: &Event) -> Vec<HookOutput> {
        let mut outputs = Vec::new();
        for hook in self.hooks_for(event.kind()) {
            match hook.run(event).await {
                Ok(out) => outputs.push(out),
                Err(e) => {
                    warn!(event = ?event.kind(), error = %e, "decision hook failed");
                    outputs.push(HookOutput::deny(format!("hook failed: {e}")));
                }
            }
        }
        outputs
    }

    /// PreToolUse aggregation:
    /// 1. any explicit deny wins;
    /// 2. any `continue = false` wins;
    /// 3. any ask defers to the permission resolver;
    /// 4. otherwise the last non-nil `updated_input` replaces the arguments.
    pub async fn check_pre_tool_use(&self, recorder: &Recorder, event: Event) -> PreToolGate {
        recorder.record(event.clone());
        let outputs = self.collect(&event).await;

        if let Some(denying) = outputs.iter().find(|o| o.denies()) {
            return PreToolGate::Deny {
                reason: denying
                    .reason
                    .clone()
                    .unwrap_or_else(|| "denied by hook".into()),
            };
        }
        if let Some(blocking) = outputs.iter().find(|o| !o.should_continue) {
            return PreToolGate::Deny {
                reason: blocking
                    .reason
                    .clone()
                    .unwrap_or_else(|| "blocked by hook".into()),
            };
        }
        if outputs.iter().any(|o| o.asks()) {
            return PreToolGate::Ask;
        }
        let updated_input = outputs
            .iter()
            .rev()
            .find_map(|o| o.updated_input.clone());
        PreToolGate::Allow { updated_input }
    }

    /// PermissionRequest aggregation: deny > ask > allow.  `None` when no
    /// hook expressed a decision.
    pub async fn check_permission(&self, recorder: &Recorder, event: Event) -> Option<Decision> {
        recorder.record(event.clone());
        let outputs = self.collect(&event).await;
        let decisions: Vec<Decision> = outputs
            .iter()
            .filter_map(|o| {
                if !o.should_continue {
                    Some(Decision::Deny)
                } else {
                    o.effective_decision()
                }
            })
            .collect();
        if decisions.contains(&Decision::Deny) {
            Some(Decision::Deny)
        } else if decisions.contains(&Decision::Ask) {
            Some(Decision::Ask)
        } else if decisions.contains(&Decision::Allow) {
            Some(Decision::Allow)
        } else {
            None
        }
    }

    /// PreCompact veto: returns `false` when any hook blocks the compaction.
    pub async fn check_pre_compact(&self, recorder: &Recorder, event: Event) -> bool {
        recorder.record(event.clone());
        let outputs = self.collect(&event).await;
        !outputs.iter().any(|o| o.denies() || !o.should_continue)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::events::EventPayload;

    struct FixedHook(HookOutput);

    #[async_trait]
    impl Hook for FixedHook {
        async fn run(&self, _event: &Event) -> anyhow::Result<HookOutput> {
            Ok(self.0.clone())
        }
    }

    struct FailingHook;

    #[async_trait]
    impl Hook for FailingHook {
        async fn run(&self, _event: &Event) -> anyhow::Result<HookOutput> {
            anyhow::bail!("hook process crashed")
        }
    }

    fn executor(outputs: Vec<HookOutput>) -> HookExecutor {
        HookExecutor::new(
            outputs
                .into_iter()
                .map(|o| {
                    (
                        EventKind::PreToolUse,
                        Arc::new(FixedHook(o)) as Arc<dyn Hook>,
                    )
                })
                .collect(),
        )
    }

    fn pre_tool_event() -> Event {
        Event::new(
            "s",
            "r",
            EventPayload::PreToolUse {
                tool_name: "echo".into(),
                tool_input: json!({"text": "hi"}),
            },
        )
    }

    #[tokio::test]
    async fn no_hooks_allows_without_rewrite() {
        let ex = executor(vec![]);
        let rec = Recorder::new();
        let gate = ex.check_pre_tool_use(&rec, pre_tool_event()).await;
        assert_eq!(gate, PreToolGate::Allow { updated_input: None });
        // The triggering event itself is still recorded.
        assert_eq!(rec.len(), 1);
    }

    #[tokio::test]
    async fn deny_dominates_allow() {
        let ex = executor(vec![HookOutput::allow(), HookOutput::deny("nope")]);
        let rec = Recorder::new();
        match ex.check_pre_tool_use(&rec, pre_tool_event()).await {
            PreToolGate::Deny { reason } => assert_eq!(reason, "nope"),
            other => panic!("expected deny, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn nested_deny_dominates_top_level_allow_in_same_output() {
        // A hook may answer `allow` at the top level and `deny` in
        // hook_specific_output; deny wins.
        let out = HookOutput {
            decision: Some(Decision::Allow),
            hook_specific_output: Some(HookSpecificOutput {
                permission_decision: Some(Decision::Deny),
            }),
            ..Default::default()
        };
        let ex = executor(vec![out]);
        let rec = Recorder::new();
        assert!(matches!(
            ex.check_pre_tool_use(&rec, pre_tool_event()).await,
            PreToolGate::Deny { .. }
        ));
    }

    #[tokio::test]
    async fn continue_false_blocks_even_with_allow() {
        let out = HookOutput {
            decision: Some(Decision::Allow),
            should_continue: false,
            ..Default::default()
        };
        let ex = executor(vec![out]);
        let rec = Recorder::new();
        assert!(matches!(
            ex.check_pre_tool_use(&rec, pre_tool_event()).await,
            PreToolGate::Deny { .. }
        ));
    }

    #[tokio::test]
    async fn ask_defers_when_no_deny() {
        let ex = executor(vec![HookOutput::allow(), HookOutput::ask()]);
        let rec = Recorder::new();
        assert_eq!(
            ex.check_pre_tool_use(&rec, pre_tool_event()).await,
            PreToolGate::Ask
        );
    }

    #[tokio::test]
    async fn last_rewrite_wins() {
        let ex = executor(vec![
            HookOutput::rewrite(json!({"text": "first"})),
            HookOutput::allow(),
            HookOutput::rewrite(json!({"text": "second"})),
        ]);
        let rec = Recorder::new();
        match ex.check_pre_tool_use(&rec, pre_tool_event()).await {
            PreToolGate::Allow { updated_input } => {
                assert_eq!(updated_input.unwrap()["text"], "second");
            }
            other => panic!("expected allow, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failing_hook_denies() {
        let ex = HookExecutor::new(vec![(
            EventKind::PreToolUse,
            Arc::new(FailingHook) as Arc<dyn Hook>,
        )]);
        let rec = Recorder::new();
        match ex.check_pre_tool_use(&rec, pre_tool_event()).await {
            PreToolGate::Deny { reason } => assert!(reason.contains("hook failed")),
            other => panic!("expected deny, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn permission_deny_beats_ask_beats_allow() {
        let mk = |outs: Vec<HookOutput>| {
            HookExecutor::new(
                outs.into_iter()
                    .map(|o| {
                        (
                            EventKind::PermissionRequest,
                            Arc::new(FixedHook(o)) as Arc<dyn Hook>,
                        )
                    })
                    .collect(),
            )
        };
        let event = || {
            Event::new(
                "s",
                "r",
                EventPayload::PermissionRequest {
                    tool_name: "echo".into(),
                    tool_input: json!({}),
                },
            )
        };
        let rec = Recorder::new();

        let ex = mk(vec![HookOutput::allow(), HookOutput::ask(), HookOutput::deny("x")]);
        assert_eq!(ex.check_permission(&rec, event()).await, Some(Decision::Deny));

        let ex = mk(vec![HookOutput::allow(), HookOutput::ask()]);
        assert_eq!(ex.check_permission(&rec, event()).await, Some(Decision::Ask));

        let ex = mk(vec![HookOutput::allow()]);
        assert_eq!(ex.check_permission(&rec, event()).await, Some(Decision::Allow));

        let ex = mk(vec![HookOutput::default()]);
        assert_eq!(ex.check_permission(&rec, event()).await, None);
    }

    #[tokio::test]
    async fn pre_compact_blocked_by_continue_false() {
        let ex = HookExecutor::new(vec![(
            EventKind::PreCompact,
            Arc::new(FixedHook(HookOutput::block())) as Arc<dyn Hook>,
        )]);
        let rec = Recorder::new();
        let event = Event::new(
            "s",
            "r",
            EventPayload::PreCompact {
                message_count: 10,
                token_count: 1000,
            },
        );
        assert!(!ex.check_pre_compact(&rec, event).await);
    }

    #[tokio::test]
    async fn notify_ignores_hook_failures() {
        let ex = HookExecutor::new(vec![(
            EventKind::SessionStart,
            Arc::new(FailingHook) as Arc<dyn Hook>,
        )]);
        let rec = Recorder::new();
        ex.notify(&rec, Event::new("s", "r", EventPayload::SessionStart))
            .await;
        assert_eq!(rec.len(), 1);
    }

    #[test]
    fn hook_output_deserializes_wire_format() {
        let out: HookOutput = serde_json::from_str(
            r#"{"continue": false, "hook_specific_output": {"permission_decision": "ask"}}"#,
        )
        .unwrap();
        assert!(!out.should_continue);
        assert_eq!(
            out.hook_specific_output.unwrap().permission_decision,
            Some(Decision::Ask)
        );
    }
}
