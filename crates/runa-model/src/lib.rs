// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod mock;
mod provider;
mod types;

pub use mock::{BlockingProvider, EchoProvider, ScriptedProvider};
pub use provider::{ModelProvider, ResponseStream};
pub use types::{
    CompletionRequest, ContentBlock, Message, ModelReply, ResponseEvent, Role, RunUsage,
    StopReason, ToolCallRequest, ToolSchema, Usage,
};
