// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use runa_config::DEFAULT_TOKEN_LIMIT;
use runa_tools::ToolRegistry;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collab::{NoopTracer, Tracer};
use crate::compact::Compactor;
use crate::error::RuntimeError;
use crate::events::{Event, EventPayload};
use crate::gate::{GateGuard, SessionGate};
use crate::history::HistoryStore;
use crate::hooks::HookExecutor;
use crate::options::Options;
use crate::persist::{sanitize_session_id, HistoryPersistence};
use crate::pipeline::{RunRequest, RunResponse};
use crate::progress::{ProgressSink, StreamEvent};
use crate::resolver::PermissionResolver;
use crate::stats::{SessionTokenStats, TokenTracker, TotalTokenStats};

/// Background chores (history persistence, deferred cleanup) owned by the
/// runtime and drained at close with a bounded deadline.
pub(crate) struct TaskManager {
    set: tokio::sync::Mutex<JoinSet<()>>,
}

impl TaskManager {
    fn new() -> Self {
        Self {
            set: tokio::sync::Mutex::new(JoinSet::new()),
        }
    }

    pub(crate) async fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.set.lock().await.spawn(fut);
    }

    /// Wait for everything, aborting stragglers at the deadline.  Returns
    /// `true` when all tasks finished on their own.
    async fn shutdown(&self, deadline: Duration) -> bool {
        let mut set = self.set.lock().await;
        let drained = tokio::time::timeout(deadline, async {
            while set.join_next().await.is_some() {}
        })
        .await
        .is_ok();
        if !drained {
            set.abort_all();
            while set.join_next().await.is_some() {}
        }
        drained
    }
}

/// Decrements the in-flight run counter on drop, cancellation included.
struct RunToken {
    runs: Arc<watch::Sender<usize>>,
}

impl Drop for RunToken {
    fn drop(&mut self) {
        self.runs.send_modify(|c| *c = c.saturating_sub(1));
    }
}

pub(crate) struct RuntimeInner {
    pub opts: Options,
    pub registry: Arc<ToolRegistry>,
    pub hooks: Arc<HookExecutor>,
    pub gate: Arc<SessionGate>,
    pub histories: Arc<HistoryStore>,
    pub compactor: Arc<Compactor>,
    pub tracker: Arc<TokenTracker>,
    pub resolver: Arc<PermissionResolver>,
    pub tracer: Arc<dyn Tracer>,
    pub persistence: Option<Arc<HistoryPersistence>>,
    pub scratch_root: PathBuf,
    closed: StdMutex<bool>,
    runs: Arc<watch::Sender<usize>>,
    tasks: TaskManager,
    close_done: tokio::sync::Mutex<bool>,
}

/// The agent execution runtime: drives bounded model ↔ tool loops for many
/// concurrent sessions, one run per session at a time.
///
/// Cheap to clone; all clones share the same state.  Construction takes a
/// frozen snapshot of [`Options`], so the caller's value can keep changing
/// without racing live runs.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime").finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn new(options: Options) -> Result<Self, RuntimeError> {
        let opts = options.frozen();
        let default_model = opts.models.default.clone().ok_or(RuntimeError::MissingModel)?;

        let mut registry = ToolRegistry::new();
        for tool in &opts.tools {
            registry.register(Arc::clone(tool));
        }

        let hooks = Arc::new(HookExecutor::new(opts.hooks.clone()));
        let tracer: Arc<dyn Tracer> = opts
            .tracer
            .clone()
            .unwrap_or_else(|| Arc::new(NoopTracer));

        let persistence = opts.history.persist_dir.as_ref().map(|dir| {
            Arc::new(HistoryPersistence::new(dir.clone(), opts.history.retention))
        });
        if let Some(p) = &persistence {
            let pruned = p.prune();
            if pruned > 0 {
                info!(pruned, "pruned expired history envelopes");
            }
        }

        let scratch_root = opts
            .scratch_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("runa-scratch"));

        let mut histories = HistoryStore::new(opts.history.max_sessions);
        if let Some(p) = &persistence {
            let loader = Arc::clone(p);
            histories = histories.with_loader(move |id| loader.load(id));
        }
        let evict_scratch = scratch_root.clone();
        histories = histories.with_on_evict(move |id| {
            let dir = evict_scratch.join(sanitize_session_id(id));
            if dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(&dir) {
                    warn!(session_id = id, error = %e, "scratch cleanup on eviction failed");
                }
            }
        });

        let token_limit = opts.limits.token_budget.unwrap_or(DEFAULT_TOKEN_LIMIT);
        let summary_model = opts
            .models
            .summary
            .clone()
            .unwrap_or_else(|| Arc::clone(&default_model));
        let compactor = Arc::new(Compactor::new(
            opts.compaction.clone(),
            token_limit,
            summary_model,
            opts.models.summary_fallback.clone(),
        ));

        let tracker = Arc::new(TokenTracker::new(opts.stats_callback.clone()));
        let resolver = Arc::new(PermissionResolver::new(
            opts.approval_queue.clone(),
            opts.permission_prompt.clone(),
            opts.wait_for_approval,
        ));

        let (runs_tx, _runs_rx) = watch::channel(0usize);

        Ok(Self {
            inner: Arc::new(RuntimeInner {
                opts,
                registry: Arc::new(registry),
                hooks,
                gate: Arc::new(SessionGate::new()),
                histories: Arc::new(histories),
                compactor,
                tracker,
                resolver,
                tracer,
                persistence,
                scratch_root,
                closed: StdMutex::new(false),
                runs: Arc::new(runs_tx),
                tasks: TaskManager::new(),
                close_done: tokio::sync::Mutex::new(false),
            }),
        })
    }

    pub(crate) fn inner(&self) -> &RuntimeInner {
        &self.inner
    }

    /// Register the run against the close barrier, or fail when closed.
    fn begin_run(&self) -> Result<RunToken, RuntimeError> {
        let closed = self.inner.closed.lock().unwrap();
        if *closed {
            return Err(RuntimeError::RuntimeClosed);
        }
        self.inner.runs.send_modify(|c| *c += 1);
        drop(closed);
        Ok(RunToken {
            runs: Arc::clone(&self.inner.runs),
        })
    }

    // ── Synchronous surface ───────────────────────────────────────────────

    /// Run one agent invocation to completion and return the response.
    pub async fn run(&self, request: RunRequest) -> Result<RunResponse, RuntimeError> {
        self.run_inner(request, None).await
    }

    /// Like [`Runtime::run`], aborting when `cancel` fires.  Dropping the
    /// sender half also cancels.
    pub async fn run_with_cancel(
        &self,
        request: RunRequest,
        cancel: oneshot::Receiver<()>,
    ) -> Result<RunResponse, RuntimeError> {
        self.run_inner(request, Some(cancel)).await
    }

    async fn run_inner(
        &self,
        request: RunRequest,
        cancel: Option<oneshot::Receiver<()>>,
    ) -> Result<RunResponse, RuntimeError> {
        let _token = self.begin_run()?;
        if request.prompt.trim().is_empty() {
            return Err(RuntimeError::EmptyPrompt);
        }
        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let guard = self
            .inner
            .gate
            .try_acquire(&session_id)
            .ok_or_else(|| RuntimeError::ConcurrentExecution(session_id.clone()))?;

        let work = self.run_prepared(request, session_id, guard, None);
        match cancel {
            Some(mut c) => {
                tokio::pin!(work);
                tokio::select! {
                    biased;
                    _ = &mut c => Err(RuntimeError::Cancelled),
                    result = &mut work => result,
                }
            }
            None => work.await,
        }
    }

    /// Shared prepare → drive → respond path.  The gate guard travels inside
    /// the prepared run and is released when it drops — on every exit path.
    async fn run_prepared(
        &self,
        request: RunRequest,
        session_id: String,
        guard: GateGuard,
        progress: Option<ProgressSink>,
    ) -> Result<RunResponse, RuntimeError> {
        let prepared = self.prepare(request, session_id, guard).await?;
        let outcome = self.drive(&prepared, progress, &[]).await;

        let reason = if outcome.is_ok() { "completed" } else { "error" };
        self.inner
            .hooks
            .notify(
                &prepared.recorder,
                Event::new(
                    &prepared.session_id,
                    &prepared.request_id,
                    EventPayload::SessionEnd {
                        reason: reason.into(),
                    },
                ),
            )
            .await;

        if let Some(persistence) = &self.inner.persistence {
            let p = Arc::clone(persistence);
            let session_id = prepared.session_id.clone();
            let snapshot = prepared.history.snapshot();
            self.inner
                .tasks
                .spawn(async move {
                    if let Err(e) = p.save(&session_id, &snapshot) {
                        warn!(session_id = %session_id, error = %e, "history persistence failed");
                    }
                })
                .await;
        }

        match outcome {
            Ok(o) => Ok(self.build_response(prepared, o)),
            Err(e) => {
                // Drained exactly once even on failure; the events die with
                // the run rather than leaking into a later one.
                let _ = prepared.recorder.drain();
                Err(e)
            }
        }
    }

    // ── Streaming surface ─────────────────────────────────────────────────

    /// Run in streaming mode.  The producer closes the channel when done;
    /// the consumer must drain it.
    pub async fn run_stream(
        &self,
        request: RunRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, RuntimeError> {
        self.run_stream_inner(request, None).await
    }

    /// Streaming with a cancellation signal (send or drop the sender).
    /// After cancellation the run stops and pending events are dropped.
    pub async fn run_stream_with_cancel(
        &self,
        request: RunRequest,
        cancel: oneshot::Receiver<()>,
    ) -> Result<mpsc::Receiver<StreamEvent>, RuntimeError> {
        self.run_stream_inner(request, Some(cancel)).await
    }

    async fn run_stream_inner(
        &self,
        request: RunRequest,
        mut cancel: Option<oneshot::Receiver<()>>,
    ) -> Result<mpsc::Receiver<StreamEvent>, RuntimeError> {
        let token = self.begin_run()?;
        if request.prompt.trim().is_empty() {
            return Err(RuntimeError::EmptyPrompt);
        }
        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let (out_tx, out_rx) = mpsc::channel(self.inner.opts.stream.output_buffer.max(1));
        let (sink, mut progress_rx) = ProgressSink::channel(self.inner.opts.stream.progress_buffer);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        // Forwarder: drains the progress buffer into the output channel.
        // Before cancellation a full output channel blocks (backpressure);
        // after it, events are discarded so the producer finishes.  The
        // forwarder holds only the drop flag — a sink clone would keep the
        // progress channel open against its own drain loop.
        let drop_flag = sink.cancel_flag();
        let mut fw_cancel = cancel_rx;
        tokio::spawn(async move {
            'outer: while let Some(ev) = progress_rx.recv().await {
                if drop_flag.load(std::sync::atomic::Ordering::Relaxed) {
                    continue;
                }
                tokio::select! {
                    biased;
                    res = async { fw_cancel.wait_for(|c| *c).await.map(|_| ()) } => {
                        let res_is_ok = res.is_ok();
                        if res_is_ok {
                            drop_flag.store(true, std::sync::atomic::Ordering::Relaxed);
                            continue 'outer;
                        }
                        // The producer is gone; no cancellation can arrive.
                        if out_tx.send(ev).await.is_err() {
                            drop_flag.store(true, std::sync::atomic::Ordering::Relaxed);
                            break 'outer;
                        }
                    }
                    permit = out_tx.reserve() => match permit {
                        Ok(p) => p.send(ev),
                        Err(_) => {
                            drop_flag.store(true, std::sync::atomic::Ordering::Relaxed);
                            break 'outer;
                        }
                    }
                }
            }
            // Unblock the producer if it is still emitting into the buffer.
            while progress_rx.recv().await.is_some() {}
        });

        // Producer: drives the pipeline and owns the progress sink; dropping
        // the sink closes the chain, which closes the output channel.
        let runtime = self.clone();
        tokio::spawn(async move {
            let _token = token;
            let cancel_guard = cancel_tx;
            sink.emit(StreamEvent::agent_start()).await;

            let work = async {
                let guard = runtime
                    .inner
                    .gate
                    .try_acquire(&session_id)
                    .ok_or_else(|| RuntimeError::ConcurrentExecution(session_id.clone()))?;
                runtime
                    .run_prepared(request, session_id.clone(), guard, Some(sink.clone()))
                    .await
                    .map(|_| ())
            };
            let result = match cancel.as_mut() {
                Some(c) => {
                    tokio::pin!(work);
                    tokio::select! {
                        biased;
                        _ = c => {
                            let _ = cancel_guard.send(true);
                            sink.mark_cancelled();
                            Err(RuntimeError::Cancelled)
                        }
                        r = &mut work => r,
                    }
                }
                None => work.await,
            };

            if let Err(e) = result {
                debug!(error = %e, "streaming run failed");
                sink.emit(StreamEvent::error(e.to_string())).await;
            }
            sink.emit(StreamEvent::agent_stop()).await;
        });

        Ok(out_rx)
    }

    // ── Stats & lifecycle ─────────────────────────────────────────────────

    pub fn session_stats(&self, session_id: &str) -> Option<SessionTokenStats> {
        self.inner.tracker.session_stats(session_id)
    }

    pub fn total_stats(&self) -> TotalTokenStats {
        self.inner.tracker.total_stats()
    }

    /// Ids of currently resident sessions.
    pub fn session_ids(&self) -> Vec<String> {
        self.inner.histories.session_ids()
    }

    /// The session's history, creating it when absent.  Intended for
    /// seeding or inspecting a conversation between runs; it does not take
    /// the session gate.
    pub fn history(&self, session_id: &str) -> Arc<crate::history::SessionHistory> {
        self.inner.histories.get(session_id)
    }

    /// Shut the runtime down.  Idempotent; returns after every run that
    /// started before the close began has finished.
    pub async fn close(&self) -> anyhow::Result<()> {
        let mut done = self.inner.close_done.lock().await;
        if *done {
            return Ok(());
        }

        // New runs fail with RuntimeClosed from here on.
        {
            *self.inner.closed.lock().unwrap() = true;
        }

        // Barrier: wait for in-flight runs.
        let mut runs = self.inner.runs.subscribe();
        let _ = runs.wait_for(|c| *c == 0).await;

        if !self.inner.tasks.shutdown(Duration::from_secs(5)).await {
            warn!("background tasks aborted at close deadline");
        }

        let mut errors: Vec<String> = Vec::new();
        for id in self.inner.histories.session_ids() {
            let dir = self.inner.scratch_root.join(sanitize_session_id(&id));
            if dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(&dir) {
                    warn!(session_id = %id, error = %e, "scratch cleanup failed");
                    errors.push(format!("scratch {id}: {e}"));
                }
            }
        }

        if let Some(rules) = &self.inner.opts.rules {
            rules.close();
        }
        if let Err(e) = self.inner.registry.close().await {
            errors.push(format!("tool registry: {e}"));
        }
        self.inner.tracer.shutdown();

        *done = true;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "close finished with errors: {}",
                errors.join("; ")
            ))
        }
    }
}
