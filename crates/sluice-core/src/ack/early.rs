// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Early ack tracker: the bookmark is saved as soon as a message is read.
//!
//! Used by sources whose position cannot be replayed, where committing late
//! buys nothing. No record store is kept; only the in-flight count.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use super::{
    AckTracker, AllAckedCallback, BookmarkGuard, FlowControl, OnAllAcked, PendingSlot, lock,
};
use crate::bookmark::PersistState;
use crate::config::AckMode;
use crate::error::{Result, SluiceError};
use crate::message::{AckType, LogMessage, MessageRef};

/// Ack tracker that commits at read time.
pub struct EarlyAckTracker {
    pending: Mutex<PendingSlot>,
    in_flight: AtomicUsize,
    limit: Option<usize>,
    persist_state: Option<Arc<dyn PersistState>>,
    bookmark_saving_disabled: AtomicBool,
    on_all_acked: AllAckedCallback,
}

impl EarlyAckTracker {
    /// Create a tracker allowing at most `limit` messages in flight
    /// (`None` = unbounded).
    pub fn new(limit: Option<usize>, persist_state: Option<Arc<dyn PersistState>>) -> Self {
        Self {
            pending: Mutex::new(PendingSlot::new()),
            in_flight: AtomicUsize::new(0),
            limit,
            persist_state,
            bookmark_saving_disabled: AtomicBool::new(false),
            on_all_acked: AllAckedCallback::default(),
        }
    }

    /// Messages tracked and not yet acked.
    pub fn outstanding(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

impl fmt::Debug for EarlyAckTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EarlyAckTracker")
            .field("outstanding", &self.outstanding())
            .field("limit", &self.limit)
            .field("on_all_acked", &self.on_all_acked)
            .finish_non_exhaustive()
    }
}

impl AckTracker for EarlyAckTracker {
    fn request_bookmark(&self) -> Result<BookmarkGuard<'_>> {
        let mut pending = lock(&self.pending);
        if !pending.is_armed()
            && let Some(limit) = self.limit
            && self.outstanding() >= limit
        {
            debug!(limit, "Early ack tracker is full");
            return Err(SluiceError::AckRecordsExhausted { limit });
        }
        pending.arm(&self.persist_state);
        Ok(BookmarkGuard::new(pending))
    }

    fn track_msg(&self, msg: &LogMessage) {
        self.track_reserved(BookmarkGuard::new(lock(&self.pending)), msg);
    }

    fn track_reserved(&self, mut bookmark: BookmarkGuard<'_>, _msg: &LogMessage) {
        // Saves stay in posting order: the pending lock is still held
        let taken = bookmark.slot.take();
        if !self.bookmark_saving_disabled.load(Ordering::Acquire) {
            taken.save();
        }
        let in_flight = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        drop(bookmark);
        drop(taken);

        trace!(in_flight, "Tracked message");
    }

    fn manage_msg_ack(&self, msg: MessageRef, ack_type: AckType, flow: &dyn FlowControl) {
        if ack_type == AckType::Suspended {
            flow.flow_control_suspend();
        }

        let prev = self.in_flight.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "ack for a message that was never tracked");
        trace!(in_flight = prev - 1, ack_type = %ack_type, "Processed ack");

        if ack_type == AckType::Suspended {
            flow.flow_control_adjust_when_suspended(1);
        } else {
            flow.flow_control_adjust(1);
        }

        if prev == 1 {
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
        self.outstanding() == 0
    }

    fn mode(&self) -> AckMode {
        AckMode::Early
    }
}
