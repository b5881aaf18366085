// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ack tracking: turning out-of-order message acks into committed bookmarks.
//!
//! Every message a source posts goes through the same protocol:
//!
//! ```text
//!   request_bookmark() ──► fill position ──► track_msg(msg) ──► ... ──► manage_msg_ack(msg, ack)
//!        PENDING                                TRACKED        ACKED        COMMITTED
//! ```
//!
//! Two strategies implement [`AckTracker`]:
//!
//! | Tracker | Bookmark saved | Window adjusted by |
//! |---------|----------------|--------------------|
//! | [`LateAckTracker`] | when the record ends a contiguous acked prefix | prefix length |
//! | [`EarlyAckTracker`] | at `track_msg` | 1 per ack |
//!
//! [`AckTrackerKind`] selects between them from [`AckMode`].

mod early;
mod late;
pub mod store;

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use early::EarlyAckTracker;
pub use late::LateAckTracker;

use crate::bookmark::{Bookmark, PersistState};
use crate::config::{AckMode, SourceConfig};
use crate::error::Result;
use crate::message::{AckType, LogMessage, MessageRef};

/// Flow-control hooks a tracker drives while resolving acks.
///
/// Implemented by [`LogSource`](crate::source::LogSource). Trackers never call
/// these while holding their own lock.
pub trait FlowControl {
    /// A destination reported backpressure; stop accepting input.
    fn flow_control_suspend(&self);

    /// `n` messages were resolved on the normal path.
    fn flow_control_adjust(&self, n: usize);

    /// `n` messages were resolved while a destination is suspended.
    fn flow_control_adjust_when_suspended(&self, n: usize);
}

/// Callback fired when a tracker drains to empty.
pub type OnAllAcked = Box<dyn Fn() + Send + Sync>;

/// Capability shared by every ack tracking strategy.
pub trait AckTracker: Send + Sync {
    /// Reserve the pending bookmark for the next message.
    ///
    /// Repeated calls before `track_msg` return the same pending bookmark.
    /// Fails with [`AckRecordsExhausted`](crate::SluiceError::AckRecordsExhausted)
    /// when the tracker is bounded and full; the caller must then refuse the
    /// message. The guard must be dropped before `track_msg`.
    fn request_bookmark(&self) -> Result<BookmarkGuard<'_>>;

    /// Attach the pending bookmark to `msg`.
    ///
    /// # Panics
    ///
    /// Panics if `request_bookmark` was not called first.
    fn track_msg(&self, msg: &LogMessage);

    /// Attach the bookmark held by `bookmark` to `msg` and release the guard.
    ///
    /// Reservation and tracking happen under one lock, so concurrent posters
    /// never share a pending bookmark. `bookmark` must come from this
    /// tracker's `request_bookmark`.
    fn track_reserved(&self, bookmark: BookmarkGuard<'_>, msg: &LogMessage);

    /// Resolve the final ack of `msg`.
    ///
    /// # Panics
    ///
    /// Panics if `msg` was not tracked or was already resolved.
    fn manage_msg_ack(&self, msg: MessageRef, ack_type: AckType, flow: &dyn FlowControl);

    /// Replace the drain callback. The previous callback is dropped.
    fn set_on_all_acked(&self, callback: Option<OnAllAcked>);

    /// Stop persisting bookmarks. Cannot be undone.
    fn disable_bookmark_saving(&self);

    /// Whether every tracked message has been resolved.
    fn is_empty(&self) -> bool;

    /// The strategy implemented by this tracker.
    fn mode(&self) -> AckMode;
}

/// The tracker owned by a source.
#[derive(Debug)]
pub enum AckTrackerKind {
    /// Contiguous-prefix commit.
    Late(LateAckTracker),
    /// Commit at read time.
    Early(EarlyAckTracker),
}

impl AckTrackerKind {
    /// Build the tracker selected by `config.ack_mode`.
    pub fn new(config: &SourceConfig, persist_state: Option<Arc<dyn PersistState>>) -> Self {
        let limit = (config.max_pending_records > 0).then_some(config.max_pending_records);
        match config.ack_mode {
            AckMode::Late => Self::Late(LateAckTracker::new(limit, persist_state)),
            AckMode::Early => Self::Early(EarlyAckTracker::new(limit, persist_state)),
        }
    }

    fn inner(&self) -> &dyn AckTracker {
        match self {
            Self::Late(t) => t,
            Self::Early(t) => t,
        }
    }
}

impl AckTracker for AckTrackerKind {
    fn request_bookmark(&self) -> Result<BookmarkGuard<'_>> {
        self.inner().request_bookmark()
    }

    fn track_msg(&self, msg: &LogMessage) {
        self.inner().track_msg(msg)
    }

    fn track_reserved(&self, bookmark: BookmarkGuard<'_>, msg: &LogMessage) {
        self.inner().track_reserved(bookmark, msg)
    }

    fn manage_msg_ack(&self, msg: MessageRef, ack_type: AckType, flow: &dyn FlowControl) {
        self.inner().manage_msg_ack(msg, ack_type, flow)
    }

    fn set_on_all_acked(&self, callback: Option<OnAllAcked>) {
        self.inner().set_on_all_acked(callback)
    }

    fn disable_bookmark_saving(&self) {
        self.inner().disable_bookmark_saving()
    }

    fn is_empty(&self) -> bool {
        self.inner().is_empty()
    }

    fn mode(&self) -> AckMode {
        self.inner().mode()
    }
}

/// Bookmark reserved by `request_bookmark` and not yet tracked.
#[derive(Debug)]
pub(crate) struct PendingSlot {
    bookmark: Bookmark,
    armed: bool,
}

impl PendingSlot {
    pub(crate) fn new() -> Self {
        Self {
            bookmark: Bookmark::empty(),
            armed: false,
        }
    }

    /// Arm the slot with a fresh bookmark unless one is already pending.
    pub(crate) fn arm(&mut self, persist_state: &Option<Arc<dyn PersistState>>) {
        if !self.armed {
            self.bookmark = Bookmark::new(persist_state.clone());
            self.armed = true;
        }
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.armed
    }

    /// Take the pending bookmark, leaving the slot empty.
    pub(crate) fn take(&mut self) -> Bookmark {
        assert!(self.armed, "track_msg called without request_bookmark");
        self.armed = false;
        std::mem::replace(&mut self.bookmark, Bookmark::empty())
    }
}

/// Exclusive access to the pending bookmark.
pub struct BookmarkGuard<'a> {
    slot: MutexGuard<'a, PendingSlot>,
}

impl<'a> BookmarkGuard<'a> {
    pub(crate) fn new(slot: MutexGuard<'a, PendingSlot>) -> Self {
        Self { slot }
    }
}

impl std::fmt::Debug for BookmarkGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BookmarkGuard").field(&self.slot.bookmark).finish()
    }
}

impl Deref for BookmarkGuard<'_> {
    type Target = Bookmark;

    fn deref(&self) -> &Bookmark {
        &self.slot.bookmark
    }
}

impl DerefMut for BookmarkGuard<'_> {
    fn deref_mut(&mut self) -> &mut Bookmark {
        &mut self.slot.bookmark
    }
}

/// Holder for the drain callback.
#[derive(Default)]
pub(crate) struct AllAckedCallback {
    callback: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl AllAckedCallback {
    pub(crate) fn replace(&self, callback: Option<OnAllAcked>) {
        let previous = {
            let mut slot = self.callback.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *slot, callback.map(Arc::from))
        };
        drop(previous);
    }

    pub(crate) fn fire(&self) {
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl std::fmt::Debug for AllAckedCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set = self
            .callback
            .lock()
            .map(|c| c.is_some())
            .unwrap_or_default();
        f.debug_struct("AllAckedCallback").field("set", &set).finish()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
