// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use lru::LruCache;
use runa_model::{Message, Role};
use tracing::debug;

/// The conversation log of one session.
///
/// Mutation is serialized by the session gate for the duration of a run; the
/// internal lock only protects against readers racing a writer (stats,
/// eviction callbacks).  `replace` is the compactor's atomic swap.
#[derive(Debug)]
pub struct SessionHistory {
    id: String,
    created_at: DateTime<Utc>,
    messages: Mutex<Vec<Message>>,
}

impl SessionHistory {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_messages(id, Vec::new())
    }

    pub fn with_messages(id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
            messages: Mutex::new(messages),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn append(&self, msg: Message) {
        self.messages.lock().unwrap().push(msg);
    }

    /// Consistent copy of the full log.
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    /// Atomically swap the stored sequence (compaction).
    pub fn replace(&self, messages: Vec<Message>) {
        *self.messages.lock().unwrap() = messages;
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Heuristic token estimate over the whole log.
    pub fn approx_tokens(&self) -> usize {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.approx_tokens())
            .sum()
    }
}

/// Read-time trimmer: the index from which `messages` fits within `budget`
/// tokens.  Storage is never mutated; callers send `messages[start..]`.
///
/// The window never opens on a `tool` message — that would orphan tool
/// results from the assistant turn that requested them, which providers
/// reject.  The walk moves the start backward over tool results until it
/// lands on the assistant message carrying the matching tool calls.
pub fn visible_from(messages: &[Message], budget: usize) -> usize {
    if budget == 0 {
        return 0;
    }
    let mut tokens = 0usize;
    let mut start = messages.len();
    while start > 0 {
        let t = messages[start - 1].approx_tokens();
        if tokens + t > budget && start < messages.len() {
            break;
        }
        tokens += t;
        start -= 1;
    }
    while start > 0 && messages[start].role == Role::Tool {
        start -= 1;
    }
    start
}

type Loader = Box<dyn Fn(&str) -> Option<Vec<Message>> + Send + Sync>;
type EvictCallback = Box<dyn Fn(&str) + Send + Sync>;

/// `session_id → SessionHistory` with least-recently-used eviction.
///
/// A `get` during residency always returns the same `Arc`, so an active run
/// keeps its history alive across an eviction; the evicted session merely
/// loses its slot (and its future scratch cleanup runs immediately).
pub struct HistoryStore {
    inner: Mutex<LruCache<String, Arc<SessionHistory>>>,
    loader: Option<Loader>,
    on_evict: Option<EvictCallback>,
}

impl HistoryStore {
    pub fn new(max_sessions: usize) -> Self {
        let cap = NonZeroUsize::new(max_sessions.max(1)).unwrap();
        Self {
            inner: Mutex::new(LruCache::new(cap)),
            loader: None,
            on_evict: None,
        }
    }

    /// Hydrate newly created sessions from durable storage.  Invoked at most
    /// once per residency, on first creation.
    pub fn with_loader(
        mut self,
        loader: impl Fn(&str) -> Option<Vec<Message>> + Send + Sync + 'static,
    ) -> Self {
        self.loader = Some(Box::new(loader));
        self
    }

    pub fn with_on_evict(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_evict = Some(Box::new(f));
        self
    }

    /// Fetch the session's history, creating (and hydrating) it when absent.
    /// Updates the recency order either way.
    pub fn get(&self, session_id: &str) -> Arc<SessionHistory> {
        let (out, evicted) = {
            let mut cache = self.inner.lock().unwrap();
            if let Some(h) = cache.get(session_id) {
                return Arc::clone(h);
            }
            let messages = self
                .loader
                .as_ref()
                .and_then(|l| l(session_id))
                .unwrap_or_default();
            let history = Arc::new(SessionHistory::with_messages(session_id, messages));
            let out = Arc::clone(&history);
            let evicted = cache
                .push(session_id.to_string(), history)
                .filter(|(k, _)| k != session_id)
                .map(|(k, _)| k);
            (out, evicted)
        };
        // The callback runs outside the lock so it may touch the store.
        if let Some(id) = evicted {
            debug!(session_id = %id, "evicting least-recently-used session");
            if let Some(cb) = &self.on_evict {
                cb(&id);
            }
        }
        out
    }

    /// Snapshot of currently resident session ids, most recent first.
    pub fn session_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.inner.lock().unwrap().contains(session_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn get_creates_then_returns_same_reference() {
        let store = HistoryStore::new(10);
        let a = store.get("s1");
        let b = store.get("s1");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let store = HistoryStore::new(2);
        store.get("a");
        store.get("b");
        store.get("a"); // refresh a; b is now LRU
        store.get("c"); // evicts b
        assert!(store.contains("a"));
        assert!(store.contains("c"));
        assert!(!store.contains("b"));
    }

    #[test]
    fn eviction_fires_callback_with_evicted_id() {
        let evicted = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen = Arc::clone(&evicted);
        let store = HistoryStore::new(1).with_on_evict(move |id| {
            seen.lock().unwrap().push(id.to_string());
        });
        store.get("first");
        store.get("second");
        assert_eq!(*evicted.lock().unwrap(), vec!["first".to_string()]);
    }

    #[test]
    fn evicted_history_stays_alive_through_held_arc() {
        let store = HistoryStore::new(1);
        let held = store.get("old");
        held.append(Message::user("still here"));
        store.get("new"); // evicts "old"
        assert!(!store.contains("old"));
        assert_eq!(held.len(), 1, "active run keeps its history alive");
    }

    #[test]
    fn loader_hydrates_once_per_residency() {
        let calls = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&calls);
        let store = HistoryStore::new(10).with_loader(move |_id| {
            count.fetch_add(1, Ordering::SeqCst);
            Some(vec![Message::user("restored")])
        });
        let h = store.get("s");
        assert_eq!(h.len(), 1);
        store.get("s");
        store.get("s");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn replace_swaps_the_whole_sequence() {
        let h = SessionHistory::new("s");
        h.append(Message::user("one"));
        h.append(Message::assistant("two"));
        h.replace(vec![Message::system("summary")]);
        let snap = h.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].role, Role::System);
    }

    #[test]
    fn approx_tokens_sums_messages() {
        let h = SessionHistory::new("s");
        h.append(Message::user("12345678")); // 2
        h.append(Message::assistant("abcd")); // 1
        assert_eq!(h.approx_tokens(), 3);
    }

    // ── Trimmer ───────────────────────────────────────────────────────────────

    fn msgs(texts: &[&str]) -> Vec<Message> {
        texts.iter().map(|t| Message::user(*t)).collect()
    }

    #[test]
    fn trimmer_keeps_everything_within_budget() {
        let m = msgs(&["aaaa", "bbbb"]);
        assert_eq!(visible_from(&m, 100), 0);
    }

    #[test]
    fn trimmer_hides_oldest_prefix() {
        // Each message ≈ 2 tokens; budget of 4 keeps the last two.
        let m = msgs(&["11111111", "22222222", "33333333"]);
        assert_eq!(visible_from(&m, 4), 1);
    }

    #[test]
    fn trimmer_always_keeps_the_newest_message() {
        let m = msgs(&["0123456789abcdef"]); // 4 tokens
        assert_eq!(visible_from(&m, 1), 0, "newest message is never hidden");
    }

    #[test]
    fn trimmer_never_starts_on_a_tool_message() {
        let mut m = vec![Message::user("x".repeat(400))];
        let mut assistant = Message::assistant("");
        assistant.tool_calls.push(runa_model::ToolCallRequest {
            id: "1".into(),
            name: "echo".into(),
            input: serde_json::json!({}),
        });
        m.push(assistant);
        m.push(Message::tool_result("1", "result"));
        m.push(Message::assistant("done"));
        // Budget small enough to hide the large opening message.
        let start = visible_from(&m, 10);
        assert!(start <= 1, "window must include the assistant tool-call turn");
        assert_ne!(m[start].role, Role::Tool);
    }
}
