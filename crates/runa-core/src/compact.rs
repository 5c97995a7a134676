// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeSet;
use std::fs;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use runa_config::CompactionConfig;
use runa_model::{CompletionRequest, Message, ModelProvider, ResponseEvent, Role};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::RuntimeError;
use crate::events::{Event, EventPayload};
use crate::history::SessionHistory;
use crate::hooks::HookExecutor;
use crate::persist::sanitize_session_id;
use crate::recorder::Recorder;

const SUMMARIZE_PROMPT: &str =
    "You are a context compaction assistant. Summarise the following conversation history \
     in a concise, information-dense way. Preserve all technical details, decisions, file \
     names, identifiers, and tool outputs that may be relevant to future work. \
     The summary will replace the original history to free up context space.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactOutcome {
    Compacted {
        tokens_before: usize,
        tokens_after: usize,
    },
    Skipped,
}

/// JSON artifact written after each compaction when a rollout directory is
/// configured.
#[derive(Debug, Serialize)]
struct RolloutRecord<'a> {
    session_id: &'a str,
    timestamp: DateTime<Utc>,
    summary: &'a str,
    original_messages: &'a [Message],
    preserved_messages: &'a [Message],
    tokens_before: usize,
    tokens_after: usize,
}

/// Threshold-driven summarization of older history.
///
/// One compaction proceeds at a time (compactor-wide mutex); the history
/// swap itself is a single atomic `replace`.  A PreCompact hook veto skips
/// silently; a summary-model failure after retries surfaces as the run's
/// error; rollout write failures are logged only.
pub struct Compactor {
    config: CompactionConfig,
    token_limit: usize,
    summary_model: Arc<dyn ModelProvider>,
    fallback_model: Option<Arc<dyn ModelProvider>>,
    lock: tokio::sync::Mutex<()>,
}

impl Compactor {
    pub fn new(
        config: CompactionConfig,
        token_limit: usize,
        summary_model: Arc<dyn ModelProvider>,
        fallback_model: Option<Arc<dyn ModelProvider>>,
    ) -> Self {
        Self {
            config,
            token_limit,
            summary_model,
            fallback_model,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Trigger predicate; cheap enough to call before every model turn.
    pub fn should_compact(&self, message_count: usize, tokens: usize) -> bool {
        self.config.enabled
            && message_count > self.config.preserve_count
            && tokens > 0
            && (tokens as f32) / (self.token_limit as f32) >= self.config.threshold
    }

    /// Compact the session's history when the trigger predicate holds.
    ///
    /// Returns `Skipped` when below threshold, vetoed by a PreCompact hook,
    /// or when nothing would be summarized.
    pub async fn maybe_compact(
        &self,
        history: &SessionHistory,
        session_id: &str,
        request_id: &str,
        hooks: &HookExecutor,
        recorder: &Recorder,
    ) -> Result<CompactOutcome, RuntimeError> {
        if !self.should_compact(history.len(), history.approx_tokens()) {
            return Ok(CompactOutcome::Skipped);
        }

        let _guard = self.lock.lock().await;

        // Re-read under the lock: a concurrent compaction of this session
        // may already have brought it under threshold.
        let snapshot = history.snapshot();
        let tokens_before: usize = snapshot.iter().map(|m| m.approx_tokens()).sum();
        if !self.should_compact(snapshot.len(), tokens_before) {
            return Ok(CompactOutcome::Skipped);
        }

        let pre = Event::new(
            session_id,
            request_id,
            EventPayload::PreCompact {
                message_count: snapshot.len(),
                token_count: tokens_before,
            },
        );
        if !hooks.check_pre_compact(recorder, pre).await {
            debug!(session_id, "compaction vetoed by PreCompact hook");
            return Ok(CompactOutcome::Skipped);
        }

        // Partition: the trailing preserve_count messages always survive.
        let cut = snapshot.len() - self.config.preserve_count;
        let kept = &snapshot[cut..];
        let older = &snapshot[..cut];

        // Indices of `older` that survive outside the summary.
        let mut preserved: BTreeSet<usize> = BTreeSet::new();
        if self.config.preserve_initial {
            for i in 0..self.config.initial_count.min(older.len()) {
                preserved.insert(i);
            }
        }
        if self.config.preserve_user_text {
            let mut budget = 0usize;
            for i in (0..older.len()).rev() {
                if preserved.contains(&i) || older[i].role != Role::User {
                    continue;
                }
                let t = older[i].approx_tokens();
                if budget + t > self.config.user_text_tokens {
                    break;
                }
                budget += t;
                preserved.insert(i);
            }
        }

        let summarize: Vec<&Message> = older
            .iter()
            .enumerate()
            .filter(|(i, _)| !preserved.contains(i))
            .map(|(_, m)| m)
            .collect();
        if summarize.is_empty() {
            return Ok(CompactOutcome::Skipped);
        }

        let summary = self.summarize(&summarize).await?;

        // Rebuild: initial prefix, summary, preserved user texts, kept tail.
        let initial_len = if self.config.preserve_initial {
            self.config.initial_count.min(older.len())
        } else {
            0
        };
        let mut rebuilt: Vec<Message> = Vec::with_capacity(preserved.len() + kept.len() + 1);
        for i in preserved.iter().filter(|i| **i < initial_len) {
            rebuilt.push(older[*i].clone());
        }
        rebuilt.push(Message::system(summary.clone()));
        for i in preserved.iter().filter(|i| **i >= initial_len) {
            rebuilt.push(older[*i].clone());
        }
        let preserved_snapshot: Vec<Message> = rebuilt
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned()
            .collect();
        rebuilt.extend_from_slice(kept);

        let tokens_after: usize = rebuilt.iter().map(|m| m.approx_tokens()).sum();
        let messages_after = rebuilt.len();
        history.replace(rebuilt);

        hooks
            .notify(
                recorder,
                Event::new(
                    session_id,
                    request_id,
                    EventPayload::ContextCompacted {
                        tokens_before,
                        tokens_after,
                        messages_before: snapshot.len(),
                        messages_after,
                    },
                ),
            )
            .await;

        self.write_rollout(
            session_id,
            &summary,
            &snapshot,
            &preserved_snapshot,
            tokens_before,
            tokens_after,
        );

        Ok(CompactOutcome::Compacted {
            tokens_before,
            tokens_after,
        })
    }

    /// One summary turn with bounded retries.  The fallback model takes over
    /// from the second attempt when configured.
    async fn summarize(&self, messages: &[&Message]) -> Result<String, RuntimeError> {
        let request = CompletionRequest {
            messages: vec![
                Message::system(SUMMARIZE_PROMPT),
                Message::user(serialize_history(messages)),
            ],
            max_tokens: Some(self.config.max_summary_tokens),
            ..Default::default()
        };

        let mut attempt = 0u32;
        loop {
            let provider = if attempt == 0 {
                &self.summary_model
            } else {
                self.fallback_model.as_ref().unwrap_or(&self.summary_model)
            };
            match run_summary_turn(provider.as_ref(), request.clone()).await {
                Ok(summary) if !summary.trim().is_empty() => return Ok(summary),
                Ok(_) if attempt >= self.config.max_retries => {
                    return Err(RuntimeError::Other(anyhow::anyhow!(
                        "summary model returned an empty summary"
                    )));
                }
                Err(e) if attempt >= self.config.max_retries => {
                    return Err(RuntimeError::Other(
                        e.context("context compaction summary failed"),
                    ));
                }
                outcome => {
                    if let Err(e) = outcome {
                        warn!(attempt, error = %e, "summary model call failed; retrying");
                    } else {
                        warn!(attempt, "summary model returned empty summary; retrying");
                    }
                    attempt += 1;
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }
    }

    fn write_rollout(
        &self,
        session_id: &str,
        summary: &str,
        original: &[Message],
        preserved: &[Message],
        tokens_before: usize,
        tokens_after: usize,
    ) {
        let Some(dir) = &self.config.rollout_dir else {
            return;
        };
        let record = RolloutRecord {
            session_id,
            timestamp: Utc::now(),
            summary,
            original_messages: original,
            preserved_messages: preserved,
            tokens_before,
            tokens_after,
        };
        let name = format!(
            "{}-{}.json",
            sanitize_session_id(session_id),
            record.timestamp.timestamp_millis()
        );
        let result = fs::create_dir_all(dir)
            .map_err(anyhow::Error::from)
            .and_then(|()| Ok(serde_json::to_vec(&record)?))
            .and_then(|body| {
                let path = dir.join(&name);
                let tmp = dir.join(format!(".{name}.tmp"));
                fs::write(&tmp, body)?;
                fs::rename(&tmp, &path)?;
                Ok(())
            });
        if let Err(e) = result {
            warn!(session_id, error = %e, "compaction rollout write failed");
        }
    }
}

/// Drive one tool-free summary turn and return the final text.
async fn run_summary_turn(
    provider: &dyn ModelProvider,
    request: CompletionRequest,
) -> anyhow::Result<String> {
    let mut stream = provider.generate(request).await?;
    let mut final_text: Option<String> = None;
    while let Some(ev) = stream.next().await {
        match ev? {
            ResponseEvent::Final(reply) => final_text = Some(reply.content),
            ResponseEvent::Error(e) => warn!("summary model stream error: {e}"),
            _ => {}
        }
    }
    final_text.ok_or_else(|| anyhow::anyhow!("summary stream ended without a final reply"))
}

/// Serialise messages into plain text for the compaction prompt.
fn serialize_history(messages: &[&Message]) -> String {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::Tool => "Tool",
                Role::System => "System",
            };
            let mut text = m.content.clone();
            for tc in &m.tool_calls {
                text.push_str(&format!(" [tool_call: {}({})]", tc.name, tc.input));
            }
            if let Some(id) = &m.tool_call_id {
                text = format!("[tool_result {id}] {text}");
            }
            format!("{role}: {text}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use runa_model::{ModelReply, ScriptedProvider};
    use serde_json::json;

    use super::*;

    fn hooks() -> HookExecutor {
        HookExecutor::new(vec![])
    }

    fn seeded_history(n: usize) -> SessionHistory {
        let h = SessionHistory::new("s");
        for i in 0..n {
            if i % 2 == 0 {
                h.append(Message::user(format!("user message number {i} {}", "x".repeat(40))));
            } else {
                h.append(Message::assistant(format!(
                    "assistant message number {i} {}",
                    "y".repeat(40)
                )));
            }
        }
        h
    }

    fn compactor(config: CompactionConfig, limit: usize, scripts: usize) -> Compactor {
        let replies: Vec<Vec<ResponseEvent>> = (0..scripts)
            .map(|_| vec![ResponseEvent::Final(ModelReply::text("condensed summary"))])
            .collect();
        Compactor::new(config, limit, Arc::new(ScriptedProvider::new(replies)), None)
    }

    #[tokio::test]
    async fn below_threshold_is_a_noop() {
        let c = compactor(CompactionConfig::default(), 1_000_000, 1);
        let h = seeded_history(20);
        let before = h.snapshot();
        let out = c
            .maybe_compact(&h, "s", "r", &hooks(), &Recorder::new())
            .await
            .unwrap();
        assert_eq!(out, CompactOutcome::Skipped);
        assert_eq!(h.len(), before.len());
    }

    #[tokio::test]
    async fn short_history_is_never_compacted() {
        let config = CompactionConfig {
            preserve_count: 5,
            threshold: 0.01,
            ..Default::default()
        };
        let c = compactor(config, 10, 1);
        let h = seeded_history(5); // len == preserve_count
        let out = c
            .maybe_compact(&h, "s", "r", &hooks(), &Recorder::new())
            .await
            .unwrap();
        assert_eq!(out, CompactOutcome::Skipped);
    }

    #[tokio::test]
    async fn compaction_replaces_older_messages_with_summary() {
        let config = CompactionConfig {
            threshold: 0.1,
            preserve_count: 3,
            ..Default::default()
        };
        let c = compactor(config, 100, 1);
        let h = seeded_history(12);
        let out = c
            .maybe_compact(&h, "s", "r", &hooks(), &Recorder::new())
            .await
            .unwrap();
        let (before, after) = match out {
            CompactOutcome::Compacted {
                tokens_before,
                tokens_after,
            } => (tokens_before, tokens_after),
            other => panic!("expected compaction, got {other:?}"),
        };
        assert!(after < before);

        let snap = h.snapshot();
        // summary + 3 kept messages
        assert_eq!(snap.len(), 4);
        assert_eq!(snap[0].role, Role::System);
        assert!(snap[0].content.contains("condensed summary"));
        assert!(snap[3].content.contains("number 11"));
    }

    #[tokio::test]
    async fn preserve_initial_keeps_head_before_summary() {
        let config = CompactionConfig {
            threshold: 0.1,
            preserve_count: 3,
            preserve_initial: true,
            initial_count: 1,
            ..Default::default()
        };
        let c = compactor(config, 100, 1);
        let h = seeded_history(12);
        let first = h.snapshot()[0].content.clone();
        c.maybe_compact(&h, "s", "r", &hooks(), &Recorder::new())
            .await
            .unwrap();
        let snap = h.snapshot();
        assert_eq!(snap[0].content, first, "initial message stays at the head");
        assert_eq!(snap[1].role, Role::System);
    }

    #[tokio::test]
    async fn preserve_user_text_keeps_recent_user_messages() {
        let config = CompactionConfig {
            threshold: 0.1,
            preserve_count: 2,
            preserve_user_text: true,
            user_text_tokens: 15,
            ..Default::default()
        };
        let c = compactor(config, 100, 1);
        let h = seeded_history(12);
        c.maybe_compact(&h, "s", "r", &hooks(), &Recorder::new())
            .await
            .unwrap();
        let snap = h.snapshot();
        // The most recent user message before the tail (index 8) survives
        // between the summary and the kept tail.
        let preserved_users: Vec<&Message> = snap
            .iter()
            .filter(|m| m.role == Role::User && m.content.contains("number 8"))
            .collect();
        assert_eq!(preserved_users.len(), 1);
        let sys_pos = snap.iter().position(|m| m.role == Role::System).unwrap();
        let user_pos = snap
            .iter()
            .position(|m| m.content.contains("number 8"))
            .unwrap();
        assert!(user_pos > sys_pos);
    }

    #[tokio::test]
    async fn pre_compact_block_skips_silently() {
        use crate::events::EventKind;
        use crate::hooks::{Hook, HookOutput};
        use async_trait::async_trait;

        struct Veto;
        #[async_trait]
        impl Hook for Veto {
            async fn run(&self, _e: &Event) -> anyhow::Result<HookOutput> {
                Ok(HookOutput::block())
            }
        }
        let hooks = HookExecutor::new(vec![(
            EventKind::PreCompact,
            Arc::new(Veto) as Arc<dyn Hook>,
        )]);
        let config = CompactionConfig {
            threshold: 0.1,
            preserve_count: 3,
            ..Default::default()
        };
        let c = compactor(config, 100, 1);
        let h = seeded_history(12);
        let len_before = h.len();
        let out = c
            .maybe_compact(&h, "s", "r", &hooks, &Recorder::new())
            .await
            .unwrap();
        assert_eq!(out, CompactOutcome::Skipped);
        assert_eq!(h.len(), len_before);
    }

    #[tokio::test]
    async fn disabled_compactor_never_fires() {
        let config = CompactionConfig {
            enabled: false,
            threshold: 0.01,
            preserve_count: 1,
            ..Default::default()
        };
        let c = compactor(config, 10, 1);
        let h = seeded_history(12);
        let out = c
            .maybe_compact(&h, "s", "r", &hooks(), &Recorder::new())
            .await
            .unwrap();
        assert_eq!(out, CompactOutcome::Skipped);
    }

    #[tokio::test]
    async fn summary_failure_retries_then_surfaces_error() {
        // Scripted provider with zero scripts returns "[no more scripts]",
        // which is non-empty, so build a provider that always errors instead.
        struct FailingProvider;
        #[async_trait::async_trait]
        impl ModelProvider for FailingProvider {
            fn name(&self) -> &str {
                "failing"
            }
            fn model_name(&self) -> &str {
                "failing"
            }
            async fn generate(
                &self,
                _req: CompletionRequest,
            ) -> anyhow::Result<runa_model::ResponseStream> {
                anyhow::bail!("provider unavailable")
            }
        }
        let config = CompactionConfig {
            threshold: 0.1,
            preserve_count: 3,
            max_retries: 1,
            retry_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let c = Compactor::new(config, 100, Arc::new(FailingProvider), None);
        let h = seeded_history(12);
        let err = c
            .maybe_compact(&h, "s", "r", &hooks(), &Recorder::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("compaction"));
        // History untouched on failure.
        assert_eq!(h.len(), 12);
    }

    #[tokio::test]
    async fn fallback_model_takes_over_after_first_failure() {
        struct FailingProvider;
        #[async_trait::async_trait]
        impl ModelProvider for FailingProvider {
            fn name(&self) -> &str {
                "failing"
            }
            fn model_name(&self) -> &str {
                "failing"
            }
            async fn generate(
                &self,
                _req: CompletionRequest,
            ) -> anyhow::Result<runa_model::ResponseStream> {
                anyhow::bail!("primary down")
            }
        }
        let config = CompactionConfig {
            threshold: 0.1,
            preserve_count: 3,
            max_retries: 2,
            retry_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let fallback = Arc::new(ScriptedProvider::always_text("fallback summary"));
        let c = Compactor::new(config, 100, Arc::new(FailingProvider), Some(fallback));
        let h = seeded_history(12);
        let out = c
            .maybe_compact(&h, "s", "r", &hooks(), &Recorder::new())
            .await
            .unwrap();
        assert!(matches!(out, CompactOutcome::Compacted { .. }));
        assert!(h.snapshot()[0].content.contains("fallback summary"));
    }

    #[tokio::test]
    async fn rollout_artifact_written_when_dir_configured() {
        let dir = tempfile::tempdir().unwrap();
        let config = CompactionConfig {
            threshold: 0.1,
            preserve_count: 3,
            rollout_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let c = compactor(config, 100, 1);
        let h = seeded_history(12);
        c.maybe_compact(&h, "sess/1", "r", &hooks(), &Recorder::new())
            .await
            .unwrap();
        let files: Vec<_> = fs::read_dir(dir.path()).unwrap().flatten().collect();
        assert_eq!(files.len(), 1);
        let body = fs::read_to_string(files[0].path()).unwrap();
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["session_id"], "sess/1");
        assert_eq!(v["summary"], "condensed summary");
        assert_eq!(v["original_messages"].as_array().unwrap().len(), 12);
        assert!(v["tokens_before"].as_u64().unwrap() > v["tokens_after"].as_u64().unwrap());
    }

    #[tokio::test]
    async fn recorder_sees_pre_compact_then_context_compacted() {
        use crate::events::EventKind;
        let config = CompactionConfig {
            threshold: 0.1,
            preserve_count: 3,
            ..Default::default()
        };
        let c = compactor(config, 100, 1);
        let h = seeded_history(12);
        let rec = Recorder::new();
        c.maybe_compact(&h, "s", "r", &hooks(), &rec).await.unwrap();
        let kinds: Vec<EventKind> = rec.drain().iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec![EventKind::PreCompact, EventKind::ContextCompacted]);
    }

    #[test]
    fn serialize_history_labels_roles_and_tool_traffic() {
        let mut assistant = Message::assistant("calling");
        assistant.tool_calls.push(runa_model::ToolCallRequest {
            id: "1".into(),
            name: "grep".into(),
            input: json!({"pattern": "fn main"}),
        });
        let user = Message::user("find main");
        let tool = Message::tool_result("1", "src/main.rs:1");
        let refs: Vec<&Message> = vec![&user, &assistant, &tool];
        let text = serialize_history(&refs);
        assert!(text.contains("User: find main"));
        assert!(text.contains("[tool_call: grep"));
        assert!(text.contains("[tool_result 1]"));
    }
}
