// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Resource ceilings a sandbox imposes on tool side effects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum bytes a single tool may write.  0 = unlimited.
    pub max_output_bytes: u64,
    /// Maximum wall-clock seconds for a single tool call.  0 = unlimited.
    pub max_execution_secs: u64,
}

/// Read-only description of the active sandbox policy, attached to responses
/// so callers can see what constraints a run executed under.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxSnapshot {
    pub allowed_paths: Vec<String>,
    pub allowed_hosts: Vec<String>,
    pub limits: ResourceLimits,
}

/// Path/network/resource enforcer run around tool execution.
///
/// The runtime never enforces policy itself; tools consult the manager from
/// their [`crate::ToolContext`] before touching the filesystem or network.
pub trait SandboxManager: Send + Sync {
    /// Returns an error when `path` is outside the allowed set.
    fn check_path(&self, path: &Path) -> anyhow::Result<()>;
    /// Returns an error when `host` may not be contacted.
    fn check_network(&self, host: &str) -> anyhow::Result<()>;
    fn limits(&self) -> ResourceLimits;
    /// Policy description attached to run responses.
    fn snapshot(&self) -> SandboxSnapshot;
}

/// Permissive manager for tests and trusted embeddings.
#[derive(Debug, Default)]
pub struct AllowAllSandbox;

impl SandboxManager for AllowAllSandbox {
    fn check_path(&self, _path: &Path) -> anyhow::Result<()> {
        Ok(())
    }
    fn check_network(&self, _host: &str) -> anyhow::Result<()> {
        Ok(())
    }
    fn limits(&self) -> ResourceLimits {
        ResourceLimits::default()
    }
    fn snapshot(&self) -> SandboxSnapshot {
        SandboxSnapshot::default()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
