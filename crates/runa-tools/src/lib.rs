// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod registry;
mod sandbox;
mod tool;

pub use registry::{canonical_name, ToolRegistry};
pub use sandbox::{AllowAllSandbox, ResourceLimits, SandboxManager, SandboxSnapshot};
pub use tool::{
    schema_has_required_fields, StreamChunk, StreamSink, Tool, ToolCall, ToolContext, ToolResult,
};
