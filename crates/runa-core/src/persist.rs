// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use runa_model::Message;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const ENVELOPE_VERSION: u32 = 1;

/// On-disk shape of a persisted session log.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    session_id: String,
    updated_at: DateTime<Utc>,
    messages: Vec<Message>,
}

/// File-name-safe form of a session id: ASCII alphanumerics, `-` and `_`
/// pass through, every other byte becomes `_`.
pub fn sanitize_session_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Durable storage for session histories: one JSON envelope per session,
/// written atomically (create-temp + rename), rotated by a retention window.
///
/// Persistence is advisory — every failure here is logged and swallowed by
/// callers; a run never fails because its history could not be saved.
pub struct HistoryPersistence {
    dir: PathBuf,
    retention: Option<Duration>,
}

impl HistoryPersistence {
    pub fn new(dir: impl Into<PathBuf>, retention: Option<Duration>) -> Self {
        Self {
            dir: dir.into(),
            retention,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", sanitize_session_id(session_id)))
    }

    /// Load a session's messages.  Missing or unreadable envelopes hydrate
    /// as an empty history.
    pub fn load(&self, session_id: &str) -> Option<Vec<Message>> {
        let path = self.path_for(session_id);
        let raw = fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<Envelope>(&raw) {
            Ok(env) if env.version == ENVELOPE_VERSION => Some(env.messages),
            Ok(env) => {
                warn!(path = %path.display(), version = env.version, "unsupported history envelope version");
                None
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable history envelope");
                None
            }
        }
    }

    /// Write the session's messages.  The temp file lives in the same
    /// directory so the rename is atomic on every sane filesystem.
    pub fn save(&self, session_id: &str, messages: &[Message]) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating history dir {}", self.dir.display()))?;
        let env = Envelope {
            version: ENVELOPE_VERSION,
            session_id: session_id.to_string(),
            updated_at: Utc::now(),
            messages: messages.to_vec(),
        };
        let body = serde_json::to_vec(&env)?;
        let path = self.path_for(session_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, body).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("renaming into {}", path.display()))?;
        debug!(session_id, path = %path.display(), "history persisted");
        Ok(())
    }

    /// Delete envelopes older than the retention window.  Returns the number
    /// of files removed.
    pub fn prune(&self) -> usize {
        let Some(retention) = self.retention else {
            return 0;
        };
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            let expired = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.elapsed().ok())
                .map(|age| age > retention)
                .unwrap_or(false);
            if expired {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = %path.display(), error = %e, "history prune failed"),
                }
            }
        }
        removed
    }

    /// Remove the persisted envelope for one session, if any.
    pub fn remove(&self, session_id: &str) {
        let path = self.path_for(session_id);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "history remove failed");
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_passes_safe_chars_and_replaces_the_rest() {
        assert_eq!(sanitize_session_id("user-42_a"), "user-42_a");
        assert_eq!(sanitize_session_id("a/b:c d"), "a_b_c_d");
        assert_eq!(sanitize_session_id("päron"), "p_ron");
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let p = HistoryPersistence::new(dir.path(), None);
        let messages = vec![Message::user("hello"), Message::assistant("hi")];
        p.save("s1", &messages).unwrap();
        let loaded = p.load("s1").unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].content, "hello");
    }

    #[test]
    fn load_missing_session_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let p = HistoryPersistence::new(dir.path(), None);
        assert!(p.load("nope").is_none());
    }

    #[test]
    fn load_corrupt_envelope_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let p = HistoryPersistence::new(dir.path(), None);
        fs::create_dir_all(dir.path()).unwrap();
        fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        assert!(p.load("bad").is_none());
    }

    #[test]
    fn save_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let p = HistoryPersistence::new(dir.path(), None);
        p.save("s", &[Message::user("x")]).unwrap();
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn prune_removes_only_expired_envelopes() {
        let dir = tempfile::tempdir().unwrap();
        let p = HistoryPersistence::new(dir.path(), Some(Duration::from_secs(3600)));
        p.save("fresh", &[Message::user("x")]).unwrap();
        // Nothing is older than an hour.
        assert_eq!(p.prune(), 0);
        assert!(p.load("fresh").is_some());

        let p_zero = HistoryPersistence::new(dir.path(), Some(Duration::from_secs(0)));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(p_zero.prune(), 1);
        assert!(p_zero.load("fresh").is_none());
    }

    #[test]
    fn remove_is_silent_for_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let p = HistoryPersistence::new(dir.path(), None);
        p.remove("never-existed");
    }
}
