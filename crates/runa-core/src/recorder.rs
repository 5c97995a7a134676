// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Mutex;

use chrono::Utc;

use crate::events::Event;

/// Per-request append-only event buffer.
///
/// A fresh recorder is constructed for every run and never shared across
/// runs; that isolation is what prevents cross-request event leakage under
/// concurrency.  On response construction the buffer is drained exactly once.
#[derive(Debug, Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one event, stamping the timestamp when the producer left it
    /// unset.
    pub fn record(&self, mut event: Event) {
        if event.timestamp.is_none() {
            event.timestamp = Some(Utc::now());
        }
        self.events.lock().unwrap().push(event);
    }

    /// Move all buffered events out.  Subsequent drains return nothing.
    pub fn drain(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    /// Copy of the buffer, for inspection without consuming it.
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
