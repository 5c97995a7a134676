// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, watch};

use crate::error::RuntimeError;

/// Per-session run serialization without a lock shared across sessions.
///
/// Acquiring installs a fresh closed-on-release signal (a `watch` sender)
/// into the session map; contenders subscribe to the current holder's signal
/// and retry once it closes.  The map holds an entry iff exactly one holder
/// is active, so unrelated sessions never contend on anything but the brief
/// map lock.
#[derive(Debug, Default)]
pub struct SessionGate {
    sessions: Mutex<HashMap<String, watch::Sender<()>>>,
}

impl SessionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to become the session's holder without waiting.
    pub fn try_acquire(self: &Arc<Self>, session_id: &str) -> Option<GateGuard> {
        let mut map = self.sessions.lock().unwrap();
        match map.entry(session_id.to_string()) {
            Entry::Vacant(v) => {
                let (tx, _rx) = watch::channel(());
                v.insert(tx);
                Some(GateGuard {
                    gate: Arc::clone(self),
                    session_id: session_id.to_string(),
                    released: false,
                })
            }
            Entry::Occupied(_) => None,
        }
    }

    /// Block until the prior holder releases, or until `cancel` fires.
    ///
    /// The subscription happens under the map lock, so a release between the
    /// lookup and the wait is observed as a closed channel rather than lost.
    pub async fn acquire(
        self: &Arc<Self>,
        session_id: &str,
        cancel: &mut oneshot::Receiver<()>,
    ) -> Result<GateGuard, RuntimeError> {
        loop {
            let mut rx = {
                let mut map = self.sessions.lock().unwrap();
                match map.entry(session_id.to_string()) {
                    Entry::Vacant(v) => {
                        let (tx, _rx) = watch::channel(());
                        v.insert(tx);
                        return Ok(GateGuard {
                            gate: Arc::clone(self),
                            session_id: session_id.to_string(),
                            released: false,
                        });
                    }
                    Entry::Occupied(o) => o.get().subscribe(),
                }
            };
            tokio::select! {
                biased;
                _ = &mut *cancel => return Err(RuntimeError::Cancelled),
                // Both a value change and a dropped sender mean "retry".
                _ = rx.changed() => {}
            }
        }
    }

    /// Remove and close the session's signal.  No-op when not held.
    fn release(&self, session_id: &str) {
        // Dropping the sender closes every subscribed receiver.
        let _ = self.sessions.lock().unwrap().remove(session_id);
    }

    /// True when a run currently holds the session.
    pub fn is_held(&self, session_id: &str) -> bool {
        self.sessions.lock().unwrap().contains_key(session_id)
    }
}

/// RAII holder of one session slot; releases on drop so cancellation paths
/// cannot leave a phantom entry behind.
pub struct GateGuard {
    gate: Arc<SessionGate>,
    session_id: String,
    released: bool,
}

impl GateGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Explicit early release; subsequent drops are no-ops.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.gate.release(&self.session_id);
        }
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
