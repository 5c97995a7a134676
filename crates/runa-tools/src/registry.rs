// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use runa_model::ToolSchema;
use tracing::warn;

use crate::Tool;

/// Central registry holding all available tools.
///
/// Immutable after construction: registration happens while the runtime is
/// being assembled, execution only takes `&self`.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool under its canonical (trimmed, lower-cased) name.
    /// Registering the same name twice replaces the earlier tool.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(canonical_name(tool.name()), tool);
    }

    /// Look up by canonical name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(&canonical_name(name)).cloned()
    }

    /// Produce schemas for all registered tools, sorted by name for a stable
    /// request shape.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Close every tool, joining errors into one.  Individual failures are
    /// logged and do not stop the remaining tools from closing.
    pub async fn close(&self) -> anyhow::Result<()> {
        let mut first_err: Option<anyhow::Error> = None;
        for (name, tool) in &self.tools {
            if let Err(e) = tool.close().await {
                warn!(tool = %name, error = %e, "tool close failed");
                if first_err.is_none() {
                    first_err = Some(e.context(format!("closing tool {name}")));
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Canonical tool-name form used for registration, lookup, and whitelist
/// matching.
pub fn canonical_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
