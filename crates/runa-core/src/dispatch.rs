// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use runa_model::{Message, ToolCallRequest};
use runa_tools::{
    canonical_name, schema_has_required_fields, SandboxManager, StreamSink, ToolCall, ToolContext,
    ToolRegistry,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::collab::Tracer;
use crate::error::RuntimeError;
use crate::events::{Event, EventPayload};
use crate::history::SessionHistory;
use crate::hooks::{Decision, HookExecutor, PreToolGate};
use crate::progress::{ProgressSink, StreamEvent};
use crate::recorder::Recorder;
use crate::resolver::{PermissionQuery, PermissionResolver};

/// What happened to one dispatched call, for middleware and tests.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub call_id: String,
    pub is_error: bool,
    /// Stable kind label when the call failed before or during execution.
    pub error_kind: Option<&'static str>,
}

/// Policy-checked, hook-guarded tool invocation.
///
/// Every dispatch appends exactly one `tool` message to history — success,
/// whitelist miss, hook denial, pending approval, and execution failure all
/// leave a result keyed by the call id, so the conversation always satisfies
/// the one-result-per-tool_use wire invariant.
pub(crate) struct ToolDispatcher {
    pub registry: Arc<ToolRegistry>,
    pub hooks: Arc<HookExecutor>,
    pub resolver: Arc<PermissionResolver>,
    pub sandbox: Option<Arc<dyn SandboxManager>>,
    pub tracer: Arc<dyn Tracer>,
    pub recorder: Arc<Recorder>,
    pub history: Arc<SessionHistory>,
    /// Canonical names; empty allows every registered tool.
    pub allow_set: HashSet<String>,
    pub session_id: String,
    pub request_id: String,
    pub scratch_dir: PathBuf,
    pub progress: Option<ProgressSink>,
}

impl ToolDispatcher {
    pub async fn dispatch(&self, call: &ToolCallRequest) -> DispatchOutcome {
        let name = canonical_name(&call.name);

        if !self.allow_set.is_empty() && !self.allow_set.contains(&name) {
            let err = RuntimeError::ToolNotWhitelisted(call.name.clone());
            return self.reject(call, err.kind(), &err.to_string()).await;
        }

        let Some(tool) = self.registry.get(&name) else {
            return self
                .reject(call, "unknown_tool", &format!("unknown tool: {}", call.name))
                .await;
        };

        // Guard against upstream proxies stripping tool arguments: a tool
        // whose schema requires fields cannot run on an empty object.
        let input_missing = call.input.is_null()
            || call
                .input
                .as_object()
                .map(|o| o.is_empty())
                .unwrap_or(false);
        if input_missing && schema_has_required_fields(&tool.schema()) {
            return self
                .reject(
                    call,
                    "empty_arguments",
                    &format!(
                        "tool {} was called without arguments but its schema declares required fields",
                        call.name
                    ),
                )
                .await;
        }

        // PreToolUse gate, then the permission resolver when hooks ask.
        let gate = self
            .hooks
            .check_pre_tool_use(
                &self.recorder,
                Event::new(
                    &self.session_id,
                    &self.request_id,
                    EventPayload::PreToolUse {
                        tool_name: name.clone(),
                        tool_input: call.input.clone(),
                    },
                ),
            )
            .await;
        let mut input = call.input.clone();
        match gate {
            PreToolGate::Deny { reason } => {
                let err = RuntimeError::ToolUseDenied(reason);
                return self.reject(call, err.kind(), &err.to_string()).await;
            }
            PreToolGate::Ask => {
                let decision = self
                    .resolver
                    .resolve(
                        &self.hooks,
                        &self.recorder,
                        PermissionQuery {
                            session_id: self.session_id.clone(),
                            request_id: self.request_id.clone(),
                            tool_name: name.clone(),
                            tool_input: input.clone(),
                        },
                    )
                    .await;
                match decision {
                    Decision::Allow => {}
                    Decision::Deny => {
                        let err =
                            RuntimeError::ToolUseDenied("permission request denied".into());
                        return self.reject(call, err.kind(), &err.to_string()).await;
                    }
                    Decision::Ask => {
                        let err = RuntimeError::ToolUseRequiresApproval(call.name.clone());
                        return self.reject(call, err.kind(), &err.to_string()).await;
                    }
                }
            }
            PreToolGate::Allow { updated_input } => {
                if let Some(updated) = updated_input {
                    debug!(tool = %name, "tool input rewritten by hook");
                    input = updated;
                }
            }
        }

        if let Some(p) = &self.progress {
            p.emit(StreamEvent::tool_execution_start(&call.id, &name)).await;
        }

        // Streaming runs get a live sink; otherwise the tool runs silently.
        let (sink, chunk_forwarder) = match &self.progress {
            Some(p) => {
                let (tx, mut rx) = mpsc::channel::<runa_tools::StreamChunk>(32);
                let progress = p.clone();
                let tool_use_id = call.id.clone();
                let task = tokio::spawn(async move {
                    while let Some(chunk) = rx.recv().await {
                        progress
                            .emit(StreamEvent::tool_execution_output(
                                &tool_use_id,
                                chunk.chunk,
                                chunk.is_stderr,
                            ))
                            .await;
                    }
                });
                (Some(StreamSink::new(tx)), Some(task))
            }
            None => (None, None),
        };

        let cx = ToolContext {
            session_id: self.session_id.clone(),
            request_id: self.request_id.clone(),
            scratch_dir: self.scratch_dir.clone(),
            sandbox: self.sandbox.clone(),
            stream: sink,
        };
        let tool_call = ToolCall {
            id: call.id.clone(),
            name: name.clone(),
            input: input.clone(),
            session_id: self.session_id.clone(),
        };

        let span = self.tracer.start_tool_span(&name);
        let result = tool.execute(&cx, &tool_call).await;
        self.tracer.end_span(span);

        // All sink clones die with `cx`; wait for buffered chunks to flush
        // so output events never trail the result event.
        drop(cx);
        if let Some(task) = chunk_forwarder {
            let _ = task.await;
        }

        match result {
            Ok(res) => {
                self.post_tool_use(&name, &input, Some(&res.output), None).await;
                self.append_result(&call.id, res.output.clone());
                if let Some(p) = &self.progress {
                    p.emit(StreamEvent::tool_execution_result(&call.id, res.output, false))
                        .await;
                }
                DispatchOutcome {
                    call_id: call.id.clone(),
                    is_error: false,
                    error_kind: None,
                }
            }
            Err(e) => {
                warn!(tool = %name, error = %e, "tool execution failed");
                let msg = e.to_string();
                self.post_tool_use(&name, &input, None, Some(&msg)).await;
                let body = error_object("execution_error", &msg);
                self.append_result(&call.id, body.clone());
                if let Some(p) = &self.progress {
                    p.emit(StreamEvent::tool_execution_result(&call.id, body, true))
                        .await;
                }
                DispatchOutcome {
                    call_id: call.id.clone(),
                    is_error: true,
                    error_kind: Some("execution_error"),
                }
            }
        }
    }

    /// Short-circuit path: no execution happened, but the tool result is
    /// still appended so the wire invariant holds.
    async fn reject(
        &self,
        call: &ToolCallRequest,
        kind: &'static str,
        message: &str,
    ) -> DispatchOutcome {
        debug!(tool = %call.name, kind, "tool call rejected");
        let body = error_object(kind, message);
        self.append_result(&call.id, body.clone());
        if let Some(p) = &self.progress {
            p.emit(StreamEvent::tool_execution_result(&call.id, body, true))
                .await;
        }
        DispatchOutcome {
            call_id: call.id.clone(),
            is_error: true,
            error_kind: Some(kind),
        }
    }

    fn append_result(&self, call_id: &str, output: String) {
        self.history.append(Message::tool_result(call_id, output));
    }

    async fn post_tool_use(
        &self,
        tool_name: &str,
        input: &Value,
        output: Option<&str>,
        error: Option<&str>,
    ) {
        self.hooks
            .notify(
                &self.recorder,
                Event::new(
                    &self.session_id,
                    &self.request_id,
                    EventPayload::PostToolUse {
                        tool_name: tool_name.to_string(),
                        tool_input: input.clone(),
                        output: output.map(str::to_string),
                        error: error.map(str::to_string),
                    },
                ),
            )
            .await;
    }
}

/// JSON error body stored as the tool result for failed calls.
fn error_object(kind: &str, message: &str) -> String {
    json!({ "error": message, "kind": kind }).to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use runa_model::Role;
    use runa_tools::{Tool, ToolResult};
    use serde_json::json;

    use super::*;
    use crate::collab::NoopTracer;
    use crate::events::EventKind;
    use crate::hooks::{Hook, HookOutput};

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes text back"
        }
        fn schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"],
            })
        }
        async fn execute(&self, cx: &ToolContext, call: &ToolCall) -> anyhow::Result<ToolResult> {
            if let Some(sink) = &cx.stream {
                sink.emit("live chunk", false).await;
            }
            let text = call.input["text"].as_str().unwrap_or_default();
            Ok(ToolResult::ok(text))
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "failing"
        }
        fn description(&self) -> &str {
            "always fails"
        }
        fn schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _cx: &ToolContext, _call: &ToolCall) -> anyhow::Result<ToolResult> {
            anyhow::bail!("disk on fire")
        }
    }

    struct Fixture {
        dispatcher: ToolDispatcher,
    }

    fn fixture(hooks: Vec<(EventKind, Arc<dyn Hook>)>, allow: &[&str]) -> Fixture {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(FailingTool));
        Fixture {
            dispatcher: ToolDispatcher {
                registry: Arc::new(registry),
                hooks: Arc::new(HookExecutor::new(hooks)),
                resolver: Arc::new(PermissionResolver::new(None, None, false)),
                sandbox: None,
                tracer: Arc::new(NoopTracer),
                recorder: Arc::new(Recorder::new()),
                history: Arc::new(SessionHistory::new("s")),
                allow_set: allow.iter().map(|s| canonical_name(s)).collect(),
                session_id: "s".into(),
                request_id: "r".into(),
                scratch_dir: std::env::temp_dir(),
                progress: None,
            },
        }
    }

    fn call(name: &str, input: Value) -> ToolCallRequest {
        ToolCallRequest {
            id: "call-1".into(),
            name: name.into(),
            input,
        }
    }

    #[tokio::test]
    async fn successful_call_appends_result() {
        let f = fixture(vec![], &[]);
        let out = f.dispatcher.dispatch(&call("echo", json!({"text": "hi"}))).await;
        assert!(!out.is_error);
        let snap = f.dispatcher.history.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].role, Role::Tool);
        assert_eq!(snap[0].tool_call_id.as_deref(), Some("call-1"));
        assert_eq!(snap[0].content, "hi");
    }

    #[tokio::test]
    async fn whitelist_miss_appends_synthetic_error_result() {
        let f = fixture(vec![], &["other"]);
        let out = f.dispatcher.dispatch(&call("echo", json!({"text": "hi"}))).await;
        assert!(out.is_error);
        assert_eq!(out.error_kind, Some("tool_not_whitelisted"));
        let snap = f.dispatcher.history.snapshot();
        assert_eq!(snap.len(), 1, "denial must still leave a tool result");
        assert!(snap[0].content.contains("tool_not_whitelisted"));
    }

    #[tokio::test]
    async fn whitelist_matching_is_canonicalized() {
        let f = fixture(vec![], &[" Echo "]);
        let out = f.dispatcher.dispatch(&call("ECHO", json!({"text": "ok"}))).await;
        assert!(!out.is_error);
    }

    #[tokio::test]
    async fn unknown_tool_appends_error_result() {
        let f = fixture(vec![], &[]);
        let out = f.dispatcher.dispatch(&call("nope", json!({}))).await;
        assert_eq!(out.error_kind, Some("unknown_tool"));
        assert_eq!(f.dispatcher.history.len(), 1);
    }

    #[tokio::test]
    async fn empty_arguments_guard_short_circuits() {
        let f = fixture(vec![], &[]);
        let out = f.dispatcher.dispatch(&call("echo", json!({}))).await;
        assert_eq!(out.error_kind, Some("empty_arguments"));
        let snap = f.dispatcher.history.snapshot();
        assert!(snap[0].content.contains("empty_arguments"));
    }

    #[tokio::test]
    async fn hook_deny_blocks_execution() {
        struct DenyHook;
        #[async_trait]
        impl Hook for DenyHook {
            async fn run(&self, _e: &Event) -> anyhow::Result<HookOutput> {
                Ok(HookOutput::deny("not in this run"))
            }
        }
        let f = fixture(
            vec![(EventKind::PreToolUse, Arc::new(DenyHook) as Arc<dyn Hook>)],
            &[],
        );
        let out = f.dispatcher.dispatch(&call("echo", json!({"text": "x"}))).await;
        assert_eq!(out.error_kind, Some("tool_use_denied"));
        assert!(f.dispatcher.history.snapshot()[0]
            .content
            .contains("not in this run"));
    }

    #[tokio::test]
    async fn hook_ask_without_resolver_layers_requires_approval() {
        struct AskHook;
        #[async_trait]
        impl Hook for AskHook {
            async fn run(&self, _e: &Event) -> anyhow::Result<HookOutput> {
                Ok(HookOutput::ask())
            }
        }
        let f = fixture(
            vec![(EventKind::PreToolUse, Arc::new(AskHook) as Arc<dyn Hook>)],
            &[],
        );
        let out = f.dispatcher.dispatch(&call("echo", json!({"text": "x"}))).await;
        assert_eq!(out.error_kind, Some("tool_use_requires_approval"));
    }

    #[tokio::test]
    async fn hook_rewrite_changes_executed_input() {
        struct RewriteHook;
        #[async_trait]
        impl Hook for RewriteHook {
            async fn run(&self, _e: &Event) -> anyhow::Result<HookOutput> {
                Ok(HookOutput::rewrite(json!({"text": "rewritten"})))
            }
        }
        let f = fixture(
            vec![(EventKind::PreToolUse, Arc::new(RewriteHook) as Arc<dyn Hook>)],
            &[],
        );
        f.dispatcher.dispatch(&call("echo", json!({"text": "original"}))).await;
        assert_eq!(f.dispatcher.history.snapshot()[0].content, "rewritten");
    }

    #[tokio::test]
    async fn execution_failure_appends_json_error_object() {
        let f = fixture(vec![], &[]);
        let out = f.dispatcher.dispatch(&call("failing", json!({"x": 1}))).await;
        assert!(out.is_error);
        let body: Value =
            serde_json::from_str(&f.dispatcher.history.snapshot()[0].content).unwrap();
        assert_eq!(body["kind"], "execution_error");
        assert!(body["error"].as_str().unwrap().contains("disk on fire"));
    }

    #[tokio::test]
    async fn pre_and_post_tool_use_recorded_for_executed_calls() {
        let f = fixture(vec![], &[]);
        f.dispatcher.dispatch(&call("echo", json!({"text": "x"}))).await;
        let kinds: Vec<EventKind> = f
            .dispatcher
            .recorder
            .snapshot()
            .iter()
            .map(|e| e.kind())
            .collect();
        assert_eq!(kinds, vec![EventKind::PreToolUse, EventKind::PostToolUse]);
    }

    #[tokio::test]
    async fn streaming_run_forwards_tool_output_chunks() {
        use crate::progress::StreamEventKind;

        let (sink, mut rx) = ProgressSink::channel(64);
        let mut f = fixture(vec![], &[]);
        f.dispatcher.progress = Some(sink);
        f.dispatcher.dispatch(&call("echo", json!({"text": "hi"}))).await;
        drop(f);

        let mut kinds = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            kinds.push((ev.kind, ev.output));
        }
        assert_eq!(kinds[0].0, StreamEventKind::ToolExecutionStart);
        assert_eq!(kinds[1].0, StreamEventKind::ToolExecutionOutput);
        assert_eq!(kinds[1].1.as_deref(), Some("live chunk"));
        assert_eq!(kinds[2].0, StreamEventKind::ToolExecutionResult);
    }
}
