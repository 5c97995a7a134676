// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use runa_model::ToolCallRequest;
use tracing::warn;

use crate::driver::TurnOutcome;

/// Identifies the stage being observed.
#[derive(Debug, Clone)]
pub struct StageInfo {
    pub session_id: String,
    pub request_id: String,
    pub iteration: u32,
}

/// Observer of the agent loop's stage boundaries.
///
/// All methods default to no-ops, so implementations override only the
/// stages they care about.  Middleware cannot veto; failures and timeouts
/// are logged and the run proceeds.
#[async_trait]
pub trait StageMiddleware: Send + Sync {
    async fn before_model(&self, _stage: &StageInfo) -> anyhow::Result<()> {
        Ok(())
    }
    async fn after_model(&self, _stage: &StageInfo, _turn: &TurnOutcome) -> anyhow::Result<()> {
        Ok(())
    }
    async fn before_tool(
        &self,
        _stage: &StageInfo,
        _call: &ToolCallRequest,
    ) -> anyhow::Result<()> {
        Ok(())
    }
    async fn after_tool(
        &self,
        _stage: &StageInfo,
        _call: &ToolCallRequest,
        _is_error: bool,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Run one middleware future under the configured per-stage timeout.
pub(crate) async fn run_stage<F>(name: &'static str, timeout: Option<Duration>, fut: F)
where
    F: std::future::Future<Output = anyhow::Result<()>>,
{
    let result = match timeout {
        Some(t) => match tokio::time::timeout(t, fut).await {
            Ok(r) => r,
            Err(_) => {
                warn!(stage = name, timeout = ?t, "stage middleware timed out");
                return;
            }
        },
        None => fut.await,
    };
    if let Err(e) = result {
        warn!(stage = name, error = %e, "stage middleware failed");
    }
}

/// Invoke a stage across an ordered middleware chain.
pub(crate) async fn each_before_model(
    middleware: &[Arc<dyn StageMiddleware>],
    timeout: Option<Duration>,
    stage: &StageInfo,
) {
    for mw in middleware {
        run_stage("before_model", timeout, mw.before_model(stage)).await;
    }
}

pub(crate) async fn each_after_model(
    middleware: &[Arc<dyn StageMiddleware>],
    timeout: Option<Duration>,
    stage: &StageInfo,
    turn: &TurnOutcome,
) {
    for mw in middleware {
        run_stage("after_model", timeout, mw.after_model(stage, turn)).await;
    }
}

pub(crate) async fn each_before_tool(
    middleware: &[Arc<dyn StageMiddleware>],
    timeout: Option<Duration>,
    stage: &StageInfo,
    call: &ToolCallRequest,
) {
    for mw in middleware {
        run_stage("before_tool", timeout, mw.before_tool(stage, call)).await;
    }
}

pub(crate) async fn each_after_tool(
    middleware: &[Arc<dyn StageMiddleware>],
    timeout: Option<Duration>,
    stage: &StageInfo,
    call: &ToolCallRequest,
    is_error: bool,
) {
    for mw in middleware {
        run_stage("after_tool", timeout, mw.after_tool(stage, call, is_error)).await;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
