// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use runa_model::Usage;
use serde::Serialize;

/// Per-model slice of a session's totals.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelTokenStats {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub requests: u64,
}

/// Running token totals for one session.  Reads return deep copies, so a
/// caller can never observe a half-updated struct.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionTokenStats {
    pub session_id: String,
    pub total_input: u64,
    pub total_output: u64,
    pub total: u64,
    pub cache_created: u64,
    pub cache_read: u64,
    pub by_model: HashMap<String, ModelTokenStats>,
    pub request_count: u64,
    pub first_request_at: Option<DateTime<Utc>>,
    pub last_request_at: Option<DateTime<Utc>>,
}

/// Aggregate across all sessions.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TotalTokenStats {
    pub total_input: u64,
    pub total_output: u64,
    pub total: u64,
    pub cache_created: u64,
    pub cache_read: u64,
    pub request_count: u64,
    pub session_count: usize,
}

pub type StatsCallback = Arc<dyn Fn(SessionTokenStats) + Send + Sync>;

/// Token accounting with its own lock; the update callback is invoked after
/// the lock is released so it may call back into the tracker.
#[derive(Default)]
pub struct TokenTracker {
    inner: Mutex<HashMap<String, SessionTokenStats>>,
    on_update: Option<StatsCallback>,
}

impl TokenTracker {
    pub fn new(on_update: Option<StatsCallback>) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            on_update,
        }
    }

    pub fn record(&self, session_id: &str, model: &str, usage: &Usage) {
        let snapshot = {
            let mut map = self.inner.lock().unwrap();
            let now = Utc::now();
            let stats = map.entry(session_id.to_string()).or_insert_with(|| {
                SessionTokenStats {
                    session_id: session_id.to_string(),
                    first_request_at: Some(now),
                    ..Default::default()
                }
            });
            stats.total_input += usage.input_tokens;
            stats.total_output += usage.output_tokens;
            stats.total += usage.total();
            stats.cache_created += usage.cache_creation_tokens;
            stats.cache_read += usage.cache_read_tokens;
            stats.request_count += 1;
            stats.last_request_at = Some(now);
            let per_model = stats.by_model.entry(model.to_string()).or_default();
            per_model.input_tokens += usage.input_tokens;
            per_model.output_tokens += usage.output_tokens;
            per_model.total_tokens += usage.total();
            per_model.requests += 1;
            stats.clone()
        };
        if let Some(cb) = &self.on_update {
            cb(snapshot);
        }
    }

    /// Deep copy of one session's stats.
    pub fn session_stats(&self, session_id: &str) -> Option<SessionTokenStats> {
        self.inner.lock().unwrap().get(session_id).cloned()
    }

    /// Aggregate over every tracked session.
    pub fn total_stats(&self) -> TotalTokenStats {
        let map = self.inner.lock().unwrap();
        let mut total = TotalTokenStats {
            session_count: map.len(),
            ..Default::default()
        };
        for s in map.values() {
            total.total_input += s.total_input;
            total.total_output += s.total_output;
            total.total += s.total;
            total.cache_created += s.cache_created;
            total.cache_read += s.cache_read;
            total.request_count += s.request_count;
        }
        total
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
