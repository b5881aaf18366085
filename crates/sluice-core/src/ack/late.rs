// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Late ack tracker: bookmarks are committed only for contiguous acked prefixes.
//!
//! Downstream acks arrive out of order. Only a run of acked records starting
//! at the oldest outstanding one is a safe resume point, so each ack scans
//! the head of the store, saves the bookmark of the last record in the run
//! and drops the run.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use super::store::AckRecordStore;
use super::{
    AckTracker, AllAckedCallback, BookmarkGuard, FlowControl, OnAllAcked, PendingSlot, lock,
};
use crate::bookmark::PersistState;
use crate::config::AckMode;
use crate::error::{Result, SluiceError};
use crate::message::{AckType, LogMessage, MessageRef};

/// Contiguous-prefix ack tracker.
///
/// Lock order is `pending` then `store`. Flow-control callbacks and the drain
/// callback run with no lock held.
pub struct LateAckTracker {
    pending: Mutex<PendingSlot>,
    store: Mutex<AckRecordStore>,
    persist_state: Option<Arc<dyn PersistState>>,
    bookmark_saving_disabled: AtomicBool,
    on_all_acked: AllAckedCallback,
}

impl LateAckTracker {
    /// Create a tracker holding at most `limit` records (`None` = unbounded).
    pub fn new(limit: Option<usize>, persist_state: Option<Arc<dyn PersistState>>) -> Self {
        Self {
            pending: Mutex::new(PendingSlot::new()),
            store: Mutex::new(AckRecordStore::with_capacity(limit)),
            persist_state,
            bookmark_saving_disabled: AtomicBool::new(false),
            on_all_acked: AllAckedCallback::default(),
        }
    }

    /// Number of tracked, uncommitted records.
    pub fn outstanding(&self) -> usize {
        lock(&self.store).len()
    }
}

impl fmt::Debug for LateAckTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LateAckTracker")
            .field("outstanding", &self.outstanding())
            .field(
                "bookmark_saving_disabled",
                &self.bookmark_saving_disabled.load(Ordering::Relaxed),
            )
            .field("on_all_acked", &self.on_all_acked)
            .finish_non_exhaustive()
    }
}

impl AckTracker for LateAckTracker {
    fn request_bookmark(&self) -> Result<BookmarkGuard<'_>> {
        let mut pending = lock(&self.pending);
        if !pending.is_armed() {
            let store = lock(&self.store);
            if !store.has_room(1) {
                let limit = store.capacity().unwrap_or_default();
                debug!(limit, "Ack record store is full");
                return Err(SluiceError::AckRecordsExhausted { limit });
            }
        }
        pending.arm(&self.persist_state);
        Ok(BookmarkGuard::new(pending))
    }

    fn track_msg(&self, msg: &LogMessage) {
        self.track_reserved(BookmarkGuard::new(lock(&self.pending)), msg);
    }

    fn track_reserved(&self, mut bookmark: BookmarkGuard<'_>, msg: &LogMessage) {
        let taken = bookmark.slot.take();
        let id = lock(&self.store).append(taken);
        drop(bookmark);

        msg.set_record_id(id);
        trace!(record = id.0, "Tracked message");
    }

    fn manage_msg_ack(&self, msg: MessageRef, ack_type: AckType, flow: &dyn FlowControl) {
        let Some(id) = msg.record_id() else {
            panic!("ack for a message that was never tracked");
        };

        if ack_type == AckType::Suspended {
            flow.flow_control_suspend();
        }

        let (committed, drained, released) = {
            let mut store = lock(&self.store);
            store.mark_acked(id);

            let (committed, last) = store.scan_committed_prefix();
            if let Some(last) = last
                && ack_type != AckType::Aborted
                && !self.bookmark_saving_disabled.load(Ordering::Acquire)
            {
                last.bookmark.save();
            }
            let released = store.drop_prefix(committed);

            (committed, committed > 0 && store.is_empty(), released)
        };
        // Destroy hooks run without the store lock
        drop(released);

        trace!(record = id.0, committed, ack_type = %ack_type, "Processed ack");

        if ack_type == AckType::Suspended {
            flow.flow_control_adjust_when_suspended(committed);
        } else {
            flow.flow_control_adjust(committed);
        }

        if drained {
            debug!("All tracked messages acknowledged");
            self.on_all_acked.fire();
        }

        drop(msg);
    }

    fn set_on_all_acked(&self, callback: Option<OnAllAcked>) {
        self.on_all_acked.replace(callback);
    }

    fn disable_bookmark_saving(&self) {
        self.bookmark_saving_disabled.store(true, Ordering::Release);
    }

    fn is_empty(&self) -> bool {
        lock(&self.store).is_empty()
    }

    fn mode(&self) -> AckMode {
        AckMode::Late
    }
}
