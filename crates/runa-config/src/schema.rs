// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be enabled unless explicitly turned
/// off need a named function.
fn default_true() -> bool {
    true
}

fn default_threshold() -> f32 {
    0.8
}

fn default_preserve_count() -> usize {
    5
}

fn default_initial_count() -> usize {
    1
}

fn default_user_text_tokens() -> usize {
    1_000
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_summary_tokens() -> u32 {
    2_048
}

fn default_max_sessions() -> usize {
    1_000
}

fn default_max_iterations() -> u32 {
    25
}

fn default_output_buffer() -> usize {
    512
}

fn default_progress_buffer() -> usize {
    256
}

/// Fallback context budget when the embedder does not configure one.
pub const DEFAULT_TOKEN_LIMIT: usize = 200_000;

/// Conventional location for persisted history envelopes, relative to the
/// embedding application's state directory.
pub const DEFAULT_HISTORY_DIR: &str = ".runa/history";

/// Categorical model size label used to pick a concrete provider from the
/// runtime's model pool.  A request may override the tier, a subagent profile
/// may map to one, and the pool's default is used otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Low,
    Mid,
    High,
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelTier::Low => write!(f, "low"),
            ModelTier::Mid => write!(f, "mid"),
            ModelTier::High => write!(f, "high"),
        }
    }
}

/// Threshold-driven history summarization.
///
/// Compaction fires when the estimated token count of a session's history
/// reaches `threshold` of the context budget.  The most recent
/// `preserve_count` messages are always kept verbatim; optionally the first
/// `initial_count` messages and the most recent user messages (up to
/// `user_text_tokens`) survive as well.  Everything else is replaced by a
/// model-generated summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Fraction of the context budget (0, 1] at which compaction triggers.
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    /// Number of trailing messages always preserved verbatim.  Must be ≥ 1.
    #[serde(default = "default_preserve_count")]
    pub preserve_count: usize,
    /// Keep the first `initial_count` messages (typically the opening user
    /// instruction) out of the summary.
    #[serde(default)]
    pub preserve_initial: bool,
    #[serde(default = "default_initial_count")]
    pub initial_count: usize,
    /// Preserve the most recent user messages verbatim, newest first, until
    /// their combined estimate exceeds `user_text_tokens`.
    #[serde(default)]
    pub preserve_user_text: bool,
    #[serde(default = "default_user_text_tokens")]
    pub user_text_tokens: usize,
    /// Retries for the summary model call.  From the second attempt onward
    /// the fallback model is used when one is configured.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: Duration,
    /// Upper bound passed to the summary model.
    #[serde(default = "default_max_summary_tokens")]
    pub max_summary_tokens: u32,
    /// When set, every compaction writes a JSON artifact describing what was
    /// summarized into this directory.  Write failures are logged, never
    /// fatal.
    #[serde(default)]
    pub rollout_dir: Option<PathBuf>,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_threshold(),
            preserve_count: default_preserve_count(),
            preserve_initial: false,
            initial_count: default_initial_count(),
            preserve_user_text: false,
            user_text_tokens: default_user_text_tokens(),
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            max_summary_tokens: default_max_summary_tokens(),
            rollout_dir: None,
        }
    }
}

/// Bounds and storage for the per-session conversation logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Maximum resident sessions; the least-recently-used session is evicted
    /// when a new one would exceed this.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Directory for persisted history envelopes.  `None` disables
    /// persistence entirely.
    #[serde(default)]
    pub persist_dir: Option<PathBuf>,
    /// Persisted envelopes older than this are pruned.
    #[serde(default)]
    pub retention: Option<Duration>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            persist_dir: None,
            retention: None,
        }
    }
}

/// Loop bounds and deadlines for a single run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum model-turn iterations per run before the run fails.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Wall-clock bound for an entire run.
    #[serde(default)]
    pub run_timeout: Option<Duration>,
    /// Per-invocation bound for stage middleware.
    #[serde(default)]
    pub middleware_timeout: Option<Duration>,
    /// Context token budget shared by the read-time trimmer and the
    /// compaction trigger.  Falls back to [`DEFAULT_TOKEN_LIMIT`].
    #[serde(default)]
    pub token_budget: Option<usize>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            run_timeout: None,
            middleware_timeout: Some(Duration::from_secs(30)),
            token_budget: None,
        }
    }
}

/// Channel sizing for streaming runs.
///
/// The output channel is what the consumer drains; the progress channel sits
/// between the producing pipeline and the forwarder.  Both are bounded so a
/// stalled (but not cancelled) consumer applies backpressure instead of
/// growing memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_output_buffer")]
    pub output_buffer: usize,
    #[serde(default = "default_progress_buffer")]
    pub progress_buffer: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            output_buffer: default_output_buffer(),
            progress_buffer: default_progress_buffer(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compaction_defaults_match_documented_values() {
        let c = CompactionConfig::default();
        assert!(c.enabled);
        assert_eq!(c.threshold, 0.8);
        assert_eq!(c.preserve_count, 5);
        assert!(!c.preserve_initial);
        assert_eq!(c.max_retries, 2);
    }

    #[test]
    fn history_defaults_to_thousand_sessions_no_persistence() {
        let h = HistoryConfig::default();
        assert_eq!(h.max_sessions, 1_000);
        assert!(h.persist_dir.is_none());
    }

    #[test]
    fn limits_default_has_middleware_timeout_but_no_run_timeout() {
        let l = LimitsConfig::default();
        assert!(l.run_timeout.is_none());
        assert_eq!(l.middleware_timeout, Some(Duration::from_secs(30)));
        assert_eq!(l.max_iterations, 25);
    }

    #[test]
    fn stream_buffers_default_to_512_and_256() {
        let s = StreamConfig::default();
        assert_eq!(s.output_buffer, 512);
        assert_eq!(s.progress_buffer, 256);
    }

    #[test]
    fn model_tier_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ModelTier::High).unwrap(), "\"high\"");
        assert_eq!(ModelTier::Low.to_string(), "low");
    }

    #[test]
    fn compaction_config_deserializes_with_partial_fields() {
        let c: CompactionConfig =
            serde_json::from_str(r#"{"threshold": 0.5, "preserve_count": 3}"#).unwrap();
        assert_eq!(c.threshold, 0.5);
        assert_eq!(c.preserve_count, 3);
        // Unspecified fields fall back to defaults.
        assert!(c.enabled);
        assert_eq!(c.user_text_tokens, 1_000);
    }
}
