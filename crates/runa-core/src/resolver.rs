// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::warn;
use uuid::Uuid;

use crate::events::{Event, EventPayload};
use crate::hooks::{Decision, HookExecutor};
use crate::recorder::Recorder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Approved,
    AutoApproved,
    Denied,
}

#[derive(Debug, Clone)]
pub struct ApprovalRecord {
    pub id: String,
    pub state: ApprovalState,
}

/// Persistent approval queue contract (external collaborator).
#[async_trait]
pub trait ApprovalQueue: Send + Sync {
    /// Create a record for the command.  Implementations return it already
    /// `AutoApproved` when a prior whitelist covers the command.
    async fn request(&self, session_id: &str, command: &str) -> anyhow::Result<ApprovalRecord>;
    async fn approve(&self, id: &str, actor: &str, ttl: Option<Duration>) -> anyhow::Result<()>;
    async fn deny(&self, id: &str, actor: &str, reason: &str) -> anyhow::Result<()>;
    /// Block until the record leaves `Pending`.
    async fn wait(&self, id: &str) -> anyhow::Result<ApprovalState>;
    async fn is_whitelisted(&self, session_id: &str, command: &str) -> bool;
}

/// The question put to the host when every hook abstained with `ask`.
#[derive(Debug, Clone)]
pub struct PermissionQuery {
    pub session_id: String,
    pub request_id: String,
    pub tool_name: String,
    pub tool_input: Value,
}

/// Host-provided interactive decision layer (CLI/TUI front-ends).
#[async_trait]
pub trait PermissionPrompt: Send + Sync {
    async fn decide(&self, query: &PermissionQuery) -> Decision;
}

/// Composes the approval layers when a PreToolUse gate answers `ask`.
///
/// Layer order: approval-queue whitelist, PermissionRequest hooks, host
/// prompt callback, then (optionally) blocking on an external approver.
/// When every layer abstains the `ask` propagates and the dispatcher reports
/// `ToolUseRequiresApproval`.
pub struct PermissionResolver {
    queue: Option<Arc<dyn ApprovalQueue>>,
    prompt: Option<Arc<dyn PermissionPrompt>>,
    wait_for_approval: bool,
}

impl PermissionResolver {
    pub fn new(
        queue: Option<Arc<dyn ApprovalQueue>>,
        prompt: Option<Arc<dyn PermissionPrompt>>,
        wait_for_approval: bool,
    ) -> Self {
        Self {
            queue,
            prompt,
            wait_for_approval,
        }
    }

    pub async fn resolve(
        &self,
        hooks: &HookExecutor,
        recorder: &Recorder,
        query: PermissionQuery,
    ) -> Decision {
        let command = format!("{} {}", query.tool_name, query.tool_input);

        // 1. Approval queue: record the request; a prior whitelist entry
        //    auto-approves.
        let mut record: Option<ApprovalRecord> = None;
        if let Some(queue) = &self.queue {
            match queue.request(&query.session_id, &command).await {
                Ok(r) => {
                    if matches!(r.state, ApprovalState::Approved | ApprovalState::AutoApproved) {
                        return Decision::Allow;
                    }
                    record = Some(r);
                }
                Err(e) => warn!(error = %e, "approval queue request failed"),
            }
        }

        // 2. PermissionRequest hook layer.
        let event = Event::new(
            &query.session_id,
            &query.request_id,
            EventPayload::PermissionRequest {
                tool_name: query.tool_name.clone(),
                tool_input: query.tool_input.clone(),
            },
        );
        match hooks.check_permission(recorder, event).await {
            Some(Decision::Allow) => {
                self.mark(record.as_ref(), Decision::Allow, "hook").await;
                return Decision::Allow;
            }
            Some(Decision::Deny) => {
                self.mark(record.as_ref(), Decision::Deny, "hook").await;
                return Decision::Deny;
            }
            Some(Decision::Ask) | None => {}
        }

        // 3. Host callback.
        if let Some(prompt) = &self.prompt {
            match prompt.decide(&query).await {
                Decision::Allow => {
                    self.mark(record.as_ref(), Decision::Allow, "host").await;
                    return Decision::Allow;
                }
                Decision::Deny => {
                    self.mark(record.as_ref(), Decision::Deny, "host").await;
                    return Decision::Deny;
                }
                Decision::Ask => {}
            }
        }

        // 4. Block on an external approver.
        if self.wait_for_approval {
            if let (Some(queue), Some(record)) = (&self.queue, &record) {
                match queue.wait(&record.id).await {
                    Ok(ApprovalState::Approved) | Ok(ApprovalState::AutoApproved) => {
                        return Decision::Allow;
                    }
                    Ok(ApprovalState::Denied) => return Decision::Deny,
                    Ok(ApprovalState::Pending) => {}
                    Err(e) => warn!(error = %e, "approval wait failed"),
                }
            }
        }

        Decision::Ask
    }

    async fn mark(&self, record: Option<&ApprovalRecord>, decision: Decision, actor: &str) {
        let (Some(queue), Some(record)) = (&self.queue, record) else {
            return;
        };
        let res = match decision {
            Decision::Allow => queue.approve(&record.id, actor, None).await,
            Decision::Deny => queue.deny(&record.id, actor, "denied").await,
            Decision::Ask => Ok(()),
        };
        if let Err(e) = res {
            warn!(error = %e, "recording approval decision failed");
        }
    }
}

// ─── In-memory queue ──────────────────────────────────────────────────────────

struct QueueEntry {
    tx: watch::Sender<ApprovalState>,
}

/// Process-local [`ApprovalQueue`] used by tests and single-process
/// embeddings.  Whitelist entries are exact command prefixes per session.
#[derive(Default)]
pub struct MemoryApprovalQueue {
    entries: Mutex<HashMap<String, QueueEntry>>,
    whitelist: Mutex<HashSet<(String, String)>>,
}

impl MemoryApprovalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whitelist a command prefix for a session; later requests matching it
    /// are auto-approved.
    pub fn whitelist(&self, session_id: &str, command_prefix: &str) {
        self.whitelist
            .lock()
            .unwrap()
            .insert((session_id.to_string(), command_prefix.to_string()));
    }
}

#[async_trait]
impl ApprovalQueue for MemoryApprovalQueue {
    async fn request(&self, session_id: &str, command: &str) -> anyhow::Result<ApprovalRecord> {
        if self.is_whitelisted(session_id, command).await {
            return Ok(ApprovalRecord {
                id: Uuid::new_v4().to_string(),
                state: ApprovalState::AutoApproved,
            });
        }
        let id = Uuid::new_v4().to_string();
        let (tx, _rx) = watch::channel(ApprovalState::Pending);
        self.entries
            .lock()
            .unwrap()
            .insert(id.clone(), QueueEntry { tx });
        Ok(ApprovalRecord {
            id,
            state: ApprovalState::Pending,
        })
    }

    async fn approve(&self, id: &str, _actor: &str, _ttl: Option<Duration>) -> anyhow::Result<()> {
        let entries = self.entries.lock().unwrap();
        let entry = entries
            .get(id)
            .ok_or_else(|| anyhow::anyhow!("unknown approval record {id}"))?;
        let _ = entry.tx.send(ApprovalState::Approved);
        Ok(())
    }

    async fn deny(&self, id: &str, _actor: &str, _reason: &str) -> anyhow::Result<()> {
        let entries = self.entries.lock().unwrap();
        let entry = entries
            .get(id)
            .ok_or_else(|| anyhow::anyhow!("unknown approval record {id}"))?;
        let _ = entry.tx.send(ApprovalState::Denied);
        Ok(())
    }

    async fn wait(&self, id: &str) -> anyhow::Result<ApprovalState> {
        eprintln!("DEBUG wait: start");
        let mut rx = {
            let entries = self.entries.lock().unwrap();
            let entry = entries
                .get(id)
                .ok_or_else(|| anyhow::anyhow!("unknown approval record {id}"))?;
            entry.tx.subscribe()
        };
        eprintln!("DEBUG wait: subscribed, value={:?}", *rx.borrow());
        let state = *rx
            .wait_for(|s| !matches!(s, ApprovalState::Pending))
            .await?;
        eprintln!("DEBUG wait: got state={:?}", state);
        Ok(state)
    }

    async fn is_whitelisted(&self, session_id: &str, command: &str) -> bool {
        self.whitelist
            .lock()
            .unwrap()
            .iter()
            .any(|(s, prefix)| s == session_id && command.starts_with(prefix.as_str()))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::hooks::{Hook, HookOutput};
    use crate::events::EventKind;

    fn query() -> PermissionQuery {
        PermissionQuery {
            session_id: "s".into(),
            request_id: "r".into(),
            tool_name: "shell".into(),
            tool_input: json!({"command": "ls"}),
        }
    }

    fn no_hooks() -> HookExecutor {
        HookExecutor::new(vec![])
    }

    #[tokio::test]
    async fn all_layers_absent_propagates_ask() {
        let r = PermissionResolver::new(None, None, false);
        let d = r.resolve(&no_hooks(), &Recorder::new(), query()).await;
        assert_eq!(d, Decision::Ask);
    }

    #[tokio::test]
    async fn whitelisted_command_is_auto_approved() {
        let q = Arc::new(MemoryApprovalQueue::new());
        q.whitelist("s", "shell");
        let r = PermissionResolver::new(Some(q), None, false);
        let d = r.resolve(&no_hooks(), &Recorder::new(), query()).await;
        assert_eq!(d, Decision::Allow);
    }

    #[tokio::test]
    async fn hook_layer_decides_and_marks_record() {
        struct AllowHook;
        #[async_trait]
        impl Hook for AllowHook {
            async fn run(&self, _e: &Event) -> anyhow::Result<HookOutput> {
                Ok(HookOutput::allow())
            }
        }
        let hooks = HookExecutor::new(vec![(
            EventKind::PermissionRequest,
            Arc::new(AllowHook) as Arc<dyn Hook>,
        )]);
        let r = PermissionResolver::new(Some(Arc::new(MemoryApprovalQueue::new())), None, false);
        let d = r.resolve(&hooks, &Recorder::new(), query()).await;
        assert_eq!(d, Decision::Allow);
    }

    #[tokio::test]
    async fn host_prompt_is_consulted_after_hooks() {
        struct DenyPrompt;
        #[async_trait]
        impl PermissionPrompt for DenyPrompt {
            async fn decide(&self, _q: &PermissionQuery) -> Decision {
                Decision::Deny
            }
        }
        let r = PermissionResolver::new(None, Some(Arc::new(DenyPrompt)), false);
        let d = r.resolve(&no_hooks(), &Recorder::new(), query()).await;
        assert_eq!(d, Decision::Deny);
    }

    #[tokio::test]
    async fn wait_for_approval_blocks_until_external_approve() {
        let q = Arc::new(MemoryApprovalQueue::new());
        let record = q.request("s", "shell rm").await.unwrap();
        assert_eq!(record.state, ApprovalState::Pending);

        let q2 = Arc::clone(&q);
        let id = record.id.clone();
        let approver = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            q2.approve(&id, "operator", None).await.unwrap();
        });
        let state = q.wait(&record.id).await.unwrap();
        assert_eq!(state, ApprovalState::Approved);
        approver.await.unwrap();
    }

    #[tokio::test]
    async fn denied_record_resolves_wait_with_denied() {
        let q = MemoryApprovalQueue::new();
        let record = q.request("s", "anything").await.unwrap();
        q.deny(&record.id, "op", "too risky").await.unwrap();
        assert_eq!(q.wait(&record.id).await.unwrap(), ApprovalState::Denied);
    }
}
