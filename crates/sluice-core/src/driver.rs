// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Async input driver support.
//!
//! [`NotifyDriver`] bridges [`SourceDriver`] callbacks, which arrive on
//! whatever thread resolved an ack, into the input task's own context. The
//! callbacks only post a `Notify` permit; the input task re-checks the source
//! when it wakes.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Notify;
use tracing::trace;

use crate::source::{LogSource, SourceDriver, SourceState};

/// [`SourceDriver`] backed by tokio `Notify`.
#[derive(Debug, Default)]
pub struct NotifyDriver {
    wakeup: Notify,
    window_empty: Notify,
    wakeups: AtomicU64,
}

impl NotifyDriver {
    /// Create a driver with no pending notifications.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `source` accepts input, or is deinitialized.
    pub async fn wait_until_free(&self, source: &LogSource) {
        loop {
            let notified = self.wakeup.notified();
            if source.free_to_send() || source.state() == SourceState::Deinitialized {
                return;
            }
            trace!(source = %source.name(), "Waiting for flow control");
            notified.await;
        }
    }

    /// Wait until every message posted by `source` is resolved.
    pub async fn wait_for_window_empty(&self, source: &LogSource) {
        loop {
            let notified = self.window_empty.notified();
            if source.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Number of wakeups received.
    pub fn wakeups(&self) -> u64 {
        self.wakeups.load(Ordering::Relaxed)
    }
}

impl SourceDriver for NotifyDriver {
    fn wakeup(&self) {
        self.wakeups.fetch_add(1, Ordering::Relaxed);
        self.wakeup.notify_one();
    }

    fn window_empty(&self) {
        self.window_empty.notify_one();
    }
}
