// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

/// Stable error kinds exposed by the runtime.
///
/// Upstream model/tool/collaborator failures travel through [`RuntimeError::Other`]
/// with their cause chain preserved.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// A run was requested after `close()`.
    #[error("runtime is closed")]
    RuntimeClosed,

    /// No default model provider was configured.
    #[error("no default model configured")]
    MissingModel,

    /// The request carried an empty prompt.
    #[error("prompt must not be empty")]
    EmptyPrompt,

    /// Another run is active on the same session.
    #[error("session {0} already has an active run")]
    ConcurrentExecution(String),

    /// The tool is outside the run's allow-set.
    #[error("tool {0} is not whitelisted for this run")]
    ToolNotWhitelisted(String),

    /// A hook or the permission layer denied the tool call.
    #[error("tool use denied: {0}")]
    ToolUseDenied(String),

    /// Every permission layer abstained; an external approval is required.
    #[error("tool use requires approval: {0}")]
    ToolUseRequiresApproval(String),

    /// The agent loop hit its iteration bound without finishing.
    #[error("agent loop exceeded {0} iterations")]
    MaxIterationsExceeded(u32),

    /// The caller cancelled the run.
    #[error("run cancelled")]
    Cancelled,

    /// The run exceeded its configured wall-clock bound.
    #[error("run timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RuntimeError {
    /// Snake-case kind label, used in synthetic tool-result error objects.
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeError::RuntimeClosed => "runtime_closed",
            RuntimeError::MissingModel => "missing_model",
            RuntimeError::EmptyPrompt => "empty_prompt",
            RuntimeError::ConcurrentExecution(_) => "concurrent_execution",
            RuntimeError::ToolNotWhitelisted(_) => "tool_not_whitelisted",
            RuntimeError::ToolUseDenied(_) => "tool_use_denied",
            RuntimeError::ToolUseRequiresApproval(_) => "tool_use_requires_approval",
            RuntimeError::MaxIterationsExceeded(_) => "max_iterations_exceeded",
            RuntimeError::Cancelled => "cancelled",
            RuntimeError::Timeout(_) => "timeout",
            RuntimeError::Other(_) => "error",
        }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_session_for_concurrent_execution() {
        let e = RuntimeError::ConcurrentExecution("s1".into());
        assert!(e.to_string().contains("s1"));
    }

    #[test]
    fn kind_labels_are_snake_case() {
        assert_eq!(
            RuntimeError::ToolNotWhitelisted("x".into()).kind(),
            "tool_not_whitelisted"
        );
        assert_eq!(RuntimeError::Cancelled.kind(), "cancelled");
    }

    #[test]
    fn anyhow_converts_into_other() {
        fn fails() -> Result<()> {
            Err(anyhow::anyhow!("upstream broke"))?;
            Ok(())
        }
        let e = fails().unwrap_err();
        assert!(matches!(e, RuntimeError::Other(_)));
        assert!(e.to_string().contains("upstream broke"));
    }
}
