// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Discriminant of an [`EventPayload`], used for hook registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStart,
    SessionEnd,
    UserPromptSubmit,
    PreToolUse,
    PostToolUse,
    PermissionRequest,
    PreCompact,
    ContextCompacted,
    TokenUsage,
    Stop,
    SubagentStart,
    SubagentStop,
    ModelSelected,
}

/// Typed payload union, keyed on the wire by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    SessionStart,
    SessionEnd {
        reason: String,
    },
    UserPromptSubmit {
        prompt: String,
    },
    PreToolUse {
        tool_name: String,
        tool_input: Value,
    },
    PostToolUse {
        tool_name: String,
        tool_input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    PermissionRequest {
        tool_name: String,
        tool_input: Value,
    },
    PreCompact {
        message_count: usize,
        token_count: usize,
    },
    ContextCompacted {
        tokens_before: usize,
        tokens_after: usize,
        messages_before: usize,
        messages_after: usize,
    },
    TokenUsage {
        input_tokens: u64,
        output_tokens: u64,
        total_tokens: u64,
        cache_read_tokens: u64,
        cache_creation_tokens: u64,
    },
    Stop {
        reason: String,
    },
    SubagentStart {
        name: String,
    },
    SubagentStop {
        name: String,
    },
    ModelSelected {
        model: String,
        tier: String,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::SessionStart => EventKind::SessionStart,
            EventPayload::SessionEnd { .. } => EventKind::SessionEnd,
            EventPayload::UserPromptSubmit { .. } => EventKind::UserPromptSubmit,
            EventPayload::PreToolUse { .. } => EventKind::PreToolUse,
            EventPayload::PostToolUse { .. } => EventKind::PostToolUse,
            EventPayload::PermissionRequest { .. } => EventKind::PermissionRequest,
            EventPayload::PreCompact { .. } => EventKind::PreCompact,
            EventPayload::ContextCompacted { .. } => EventKind::ContextCompacted,
            EventPayload::TokenUsage { .. } => EventKind::TokenUsage,
            EventPayload::Stop { .. } => EventKind::Stop,
            EventPayload::SubagentStart { .. } => EventKind::SubagentStart,
            EventPayload::SubagentStop { .. } => EventKind::SubagentStop,
            EventPayload::ModelSelected { .. } => EventKind::ModelSelected,
        }
    }
}

/// One runtime event, observed by hooks and buffered by the per-request
/// recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub session_id: String,
    pub request_id: String,
    /// Stamped by the recorder when the producer left it unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(
        session_id: impl Into<String>,
        request_id: impl Into<String>,
        payload: EventPayload,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            request_id: request_id.into(),
            timestamp: None,
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
