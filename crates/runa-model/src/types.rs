use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Content blocks ───────────────────────────────────────────────────────────

/// A single typed block in a multi-modal message.
///
/// Binary payloads (images, documents) are base64 strings; providers
/// serialize them into their API-specific wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        /// MIME type, e.g. `image/png`.
        media_type: String,
        /// Base64-encoded payload.
        data: String,
    },
    Document {
        media_type: String,
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self::Image {
            media_type: media_type.into(),
            data: data.into(),
        }
    }
}

// ─── Messages ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model inside an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Opaque identifier from the model, forwarded verbatim.
    pub id: String,
    pub name: String,
    /// Parsed JSON argument object.
    pub input: Value,
}

/// One message in a conversation history.
///
/// Assistant messages may carry outstanding `tool_calls`; a `tool` message
/// carries the result for exactly one of them, keyed by `tool_call_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Ordered typed blocks for multi-modal turns.  Empty for plain text.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Model reasoning attached to an assistant turn, when the provider
    /// exposes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl Message {
    fn bare(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            blocks: Vec::new(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            reasoning: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::bare(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::bare(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::bare(Role::Assistant, content)
    }

    /// User message carrying typed content blocks alongside the prompt text.
    pub fn user_with_blocks(content: impl Into<String>, blocks: Vec<ContentBlock>) -> Self {
        Self {
            blocks,
            ..Self::bare(Role::User, content)
        }
    }

    /// Result message for one tool call.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::bare(Role::Tool, content)
        }
    }

    /// Assistant message built from an aggregated model reply.
    pub fn from_reply(reply: &ModelReply) -> Self {
        Self {
            role: Role::Assistant,
            content: reply.content.clone(),
            blocks: Vec::new(),
            tool_calls: reply.tool_calls.clone(),
            tool_call_id: None,
            reasoning: reply.reasoning.clone(),
        }
    }

    /// Approximate token count used for context management.
    ///
    /// 4-chars-per-token heuristic for text; images and documents use a flat
    /// conservative estimate since the runtime never decodes them.
    pub fn approx_tokens(&self) -> usize {
        let mut chars = self.content.len();
        for b in &self.blocks {
            chars += match b {
                ContentBlock::Text { text } => text.len(),
                ContentBlock::Image { .. } | ContentBlock::Document { .. } => 765 * 4,
            };
        }
        for tc in &self.tool_calls {
            chars += tc.name.len() + tc.input.to_string().len();
        }
        if let Some(r) = &self.reasoning {
            chars += r.len();
        }
        (chars / 4).max(1)
    }
}

// ─── Requests & streamed responses ────────────────────────────────────────────

/// A tool schema offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the input object.
    pub parameters: Value,
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    /// Mark the stable request prefix as cacheable for providers that
    /// support explicit prompt caching.
    pub enable_prompt_cache: bool,
    /// Output token bound; `None` leaves the provider default in place.
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    Error,
}

impl Default for StopReason {
    fn default() -> Self {
        StopReason::EndTurn
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StopReason::EndTurn => "end_turn",
            StopReason::ToolUse => "tool_use",
            StopReason::MaxTokens => "max_tokens",
            StopReason::StopSequence => "stop_sequence",
            StopReason::Error => "error",
        };
        f.write_str(s)
    }
}

/// Token usage from one provider turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Tokens served from the provider's prompt cache.
    pub cache_read_tokens: u64,
    /// Tokens written into the provider's prompt cache.
    pub cache_creation_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Usage accumulated over a whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub turns: u32,
}

impl RunUsage {
    pub fn absorb(&mut self, u: &Usage) {
        self.input_tokens += u.input_tokens;
        self.output_tokens += u.output_tokens;
        self.cache_read_tokens += u.cache_read_tokens;
        self.cache_creation_tokens += u.cache_creation_tokens;
        self.turns += 1;
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// The aggregated result of one completion.
///
/// Providers must deliver exactly one of these per stream, after all deltas,
/// regardless of whether the caller consumed the deltas.
#[derive(Debug, Clone, Default)]
pub struct ModelReply {
    pub content: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub stop_reason: StopReason,
    pub usage: Usage,
    /// Model identifier as reported by the provider.
    pub model: String,
}

impl ModelReply {
    /// Plain text reply that ends the turn.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    /// Reply that requests tool invocations.
    pub fn with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            content: content.into(),
            tool_calls,
            stop_reason: StopReason::ToolUse,
            ..Default::default()
        }
    }
}

/// A single streamed event from the model.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    /// A text chunk of the assistant response.
    TextDelta(String),
    /// A reasoning chunk (extended thinking).
    ReasoningDelta(String),
    /// Incremental tool-call arguments, keyed by the provider's parallel
    /// tool-call index.
    ToolCallDelta {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    /// Usage statistics, typically once near the end of the stream.
    Usage(Usage),
    /// The aggregated reply.  Terminal; exactly one per stream.
    Final(ModelReply),
    /// A recoverable provider warning.
    Error(String),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn user_message_sets_role_and_content() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.content, "hello");
        assert!(m.tool_calls.is_empty());
    }

    #[test]
    fn tool_result_carries_call_id() {
        let m = Message::tool_result("call-1", "output");
        assert_eq!(m.role, Role::Tool);
        assert_eq!(m.tool_call_id.as_deref(), Some("call-1"));
        assert_eq!(m.content, "output");
    }

    #[test]
    fn from_reply_copies_tool_calls_and_reasoning() {
        let reply = ModelReply {
            content: "thinking done".into(),
            reasoning: Some("step by step".into()),
            tool_calls: vec![ToolCallRequest {
                id: "1".into(),
                name: "echo".into(),
                input: json!({"text": "hi"}),
            }],
            ..Default::default()
        };
        let m = Message::from_reply(&reply);
        assert_eq!(m.role, Role::Assistant);
        assert_eq!(m.tool_calls.len(), 1);
        assert_eq!(m.reasoning.as_deref(), Some("step by step"));
    }

    #[test]
    fn approx_tokens_divides_by_four_with_min_one() {
        assert_eq!(Message::user("12345678").approx_tokens(), 2);
        assert_eq!(Message::user("").approx_tokens(), 1);
    }

    #[test]
    fn approx_tokens_counts_tool_call_name_and_args() {
        let mut m = Message::assistant("");
        m.tool_calls.push(ToolCallRequest {
            id: "x".into(),
            name: "aaaa".into(),
            input: json!({"k": "vvvv"}),
        });
        // name (4) + serialized args ({"k":"vvvv"} = 12) = 16 chars → 4 tokens
        assert_eq!(m.approx_tokens(), 4);
    }

    #[test]
    fn message_round_trips_through_json() {
        let m = Message::user_with_blocks(
            "see attachment",
            vec![ContentBlock::image("image/png", "aGVsbG8=")],
        );
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.role, Role::User);
        assert_eq!(back.blocks, m.blocks);
    }

    #[test]
    fn empty_collections_are_omitted_from_json() {
        let json = serde_json::to_string(&Message::user("hi")).unwrap();
        assert!(!json.contains("tool_calls"));
        assert!(!json.contains("blocks"));
        assert!(!json.contains("reasoning"));
    }

    #[test]
    fn stop_reason_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&StopReason::ToolUse).unwrap(),
            "\"tool_use\""
        );
    }

    #[test]
    fn stop_reason_display_matches_wire_names() {
        assert_eq!(StopReason::MaxTokens.to_string(), "max_tokens");
        assert_eq!(StopReason::EndTurn.to_string(), "end_turn");
    }

    #[test]
    fn run_usage_absorbs_turn_usage() {
        let mut run = RunUsage::default();
        run.absorb(&Usage {
            input_tokens: 10,
            output_tokens: 5,
            cache_read_tokens: 3,
            cache_creation_tokens: 1,
        });
        run.absorb(&Usage {
            input_tokens: 20,
            output_tokens: 7,
            ..Default::default()
        });
        assert_eq!(run.input_tokens, 30);
        assert_eq!(run.output_tokens, 12);
        assert_eq!(run.cache_read_tokens, 3);
        assert_eq!(run.turns, 2);
        assert_eq!(run.total(), 42);
    }
}
