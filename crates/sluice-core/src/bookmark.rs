// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bookmarks: persistable descriptors of how far a source has safely processed.
//!
//! A [`Bookmark`] carries a [`SavedPosition`] (an entry name plus an opaque JSON
//! state) and the [`PersistState`] backend it is written to. Save failures are
//! logged and never propagated to the ack tracker.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{trace, warn};

/// Errors returned by persist-state backends.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// Backend storage failed.
    #[error("persist storage error: {0}")]
    Storage(String),
}

/// Storage for committed source positions, keyed by persist entry name.
pub trait PersistState: Send + Sync {
    /// Store `position` under `entry`, replacing any previous value.
    fn save(&self, entry: &str, position: &Value) -> Result<(), PersistError>;

    /// Load the last position stored under `entry`.
    fn load(&self, entry: &str) -> Option<Value>;
}

/// In-memory persist state, used by tests and the demo binary.
#[derive(Default)]
pub struct MemoryPersistState {
    entries: Mutex<HashMap<String, Value>>,
    saves: AtomicU64,
}

impl MemoryPersistState {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful saves across all entries.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }
}

impl PersistState for MemoryPersistState {
    fn save(&self, entry: &str, position: &Value) -> Result<(), PersistError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(entry.to_string(), position.clone());
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn load(&self, entry: &str) -> Option<Value> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(entry).cloned()
    }
}

impl fmt::Debug for MemoryPersistState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPersistState")
            .field("saves", &self.save_count())
            .finish_non_exhaustive()
    }
}

/// A position within a source, as written to persist state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedPosition {
    /// Persist entry name (usually the source's persist name).
    pub entry: String,
    /// Source-specific position, e.g. `{"offset": 1024}`.
    pub state: Value,
}

type DestroyFn = Box<dyn FnOnce() + Send>;

/// Position descriptor embedded in every tracked record.
///
/// The optional destroy hook runs exactly once when the bookmark is dropped,
/// whether or not it was saved.
pub struct Bookmark {
    persist_state: Option<Arc<dyn PersistState>>,
    position: Option<SavedPosition>,
    destroy: Option<DestroyFn>,
}

impl Bookmark {
    /// Create a bookmark bound to `persist_state`.
    pub fn new(persist_state: Option<Arc<dyn PersistState>>) -> Self {
        Self {
            persist_state,
            position: None,
            destroy: None,
        }
    }

    /// A bookmark with no backend and no position. Saving it is a no-op.
    pub fn empty() -> Self {
        Self::new(None)
    }

    /// Record the position this bookmark describes.
    pub fn set_position(&mut self, entry: impl Into<String>, state: Value) {
        self.position = Some(SavedPosition {
            entry: entry.into(),
            state,
        });
    }

    /// The recorded position, if any.
    pub fn position(&self) -> Option<&SavedPosition> {
        self.position.as_ref()
    }

    /// Register a hook releasing resources tied to the position.
    ///
    /// Replaces (and runs) any previously registered hook.
    pub fn on_destroy(&mut self, destroy: impl FnOnce() + Send + 'static) {
        if let Some(previous) = self.destroy.replace(Box::new(destroy)) {
            previous();
        }
    }

    /// Persist the position. Returns whether anything was written.
    pub fn save(&self) -> bool {
        let (Some(persist_state), Some(position)) = (&self.persist_state, &self.position) else {
            trace!("Bookmark has no position or persist state, nothing to save");
            return false;
        };

        match persist_state.save(&position.entry, &position.state) {
            Ok(()) => {
                trace!(entry = %position.entry, "Bookmark saved");
                true
            }
            Err(e) => {
                warn!(entry = %position.entry, error = %e, "Failed to save bookmark");
                false
            }
        }
    }
}

impl Drop for Bookmark {
    fn drop(&mut self) {
        if let Some(destroy) = self.destroy.take() {
            destroy();
        }
    }
}

impl fmt::Debug for Bookmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bookmark")
            .field("position", &self.position)
            .field("has_persist_state", &self.persist_state.is_some())
            .field("has_destroy", &self.destroy.is_some())
            .finish()
    }
}
