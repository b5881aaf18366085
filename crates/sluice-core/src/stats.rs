// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-source statistics.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::AckType;

/// Lock-free counters updated on the message path.
#[derive(Debug, Default)]
pub struct SourceStats {
    received: AtomicU64,
    acked_success: AtomicU64,
    acked_suspended: AtomicU64,
    acked_aborted: AtomicU64,
    suspensions: AtomicU64,
    wakeups: AtomicU64,
    // Unix millis, 0 = never
    last_message_seen: AtomicI64,
}

impl SourceStats {
    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.last_message_seen
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub(crate) fn record_ack(&self, ack_type: AckType) {
        let counter = match ack_type {
            AckType::Success => &self.acked_success,
            AckType::Suspended => &self.acked_suspended,
            AckType::Aborted => &self.acked_aborted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_suspension(&self) {
        self.suspensions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_wakeup(&self) {
        self.wakeups.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, source: &str, window: WindowSnapshot) -> SourceStatsSnapshot {
        let last = self.last_message_seen.load(Ordering::Relaxed);
        SourceStatsSnapshot {
            source: source.to_string(),
            received: self.received.load(Ordering::Relaxed),
            acked: AckCounts {
                success: self.acked_success.load(Ordering::Relaxed),
                suspended: self.acked_suspended.load(Ordering::Relaxed),
                aborted: self.acked_aborted.load(Ordering::Relaxed),
            },
            window,
            suspensions: self.suspensions.load(Ordering::Relaxed),
            wakeups: self.wakeups.load(Ordering::Relaxed),
            last_message_seen: (last != 0)
                .then(|| DateTime::from_timestamp_millis(last))
                .flatten(),
        }
    }
}

/// Acks received, by outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckCounts {
    /// Successful acks.
    pub success: u64,
    /// Acks reporting destination backpressure.
    pub suspended: u64,
    /// Acks for discarded messages.
    pub aborted: u64,
}

impl AckCounts {
    /// All acks regardless of outcome.
    pub fn total(&self) -> u64 {
        self.success + self.suspended + self.aborted
    }
}

/// Flow-control state at snapshot time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSnapshot {
    /// Messages in flight.
    pub in_flight: usize,
    /// Bytes of message memory in use (shared counters include other sources).
    pub memory_usage: usize,
    /// Whether the source is currently refusing input.
    pub suspended: bool,
}

/// Point-in-time view of a source, suitable for JSON export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStatsSnapshot {
    /// Source name.
    pub source: String,
    /// Messages posted.
    pub received: u64,
    /// Final acks, by outcome.
    pub acked: AckCounts,
    /// Flow-control state.
    pub window: WindowSnapshot,
    /// Times the source transitioned into the suspended state.
    pub suspensions: u64,
    /// Times the driver was woken.
    pub wakeups: u64,
    /// When the last message was posted.
    pub last_message_seen: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let stats = SourceStats::default();
        stats.record_received();
        stats.record_received();
        stats.record_ack(AckType::Success);
        stats.record_ack(AckType::Aborted);
        stats.record_suspension();
        stats.record_wakeup();

        let snapshot = stats.snapshot("tcp-in", WindowSnapshot::default());

        assert_eq!(snapshot.source, "tcp-in");
        assert_eq!(snapshot.received, 2);
        assert_eq!(snapshot.acked.success, 1);
        assert_eq!(snapshot.acked.aborted, 1);
        assert_eq!(snapshot.acked.total(), 2);
        assert_eq!(snapshot.suspensions, 1);
        assert_eq!(snapshot.wakeups, 1);
        assert!(snapshot.last_message_seen.is_some());
    }

    #[test]
    fn test_fresh_snapshot_has_no_timestamp() {
        let snapshot = SourceStats::default().snapshot("s", WindowSnapshot::default());
        assert!(snapshot.last_message_seen.is_none());
        assert_eq!(snapshot.acked, AckCounts::default());
    }

    #[test]
    fn test_snapshot_serializes_to_json() {
        let snapshot = SourceStats::default().snapshot(
            "s",
            WindowSnapshot {
                in_flight: 3,
                memory_usage: 512,
                suspended: true,
            },
        );
        let value = serde_json::to_value(&snapshot).unwrap();

        assert_eq!(value["source"], "s");
        assert_eq!(value["window"]["in_flight"], 3);
        assert_eq!(value["window"]["suspended"], true);
        assert!(value["last_message_seen"].is_null());
    }
}
