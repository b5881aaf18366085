// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reference-counted log messages and their acknowledgment outcome.
//!
//! A message is shared as a [`MessageRef`] (`Arc<LogMessage>`). Each consumer
//! that receives it calls [`LogMessage::ack`] once; consumers that fan out to
//! further destinations register the extra acks with [`LogMessage::add_ack`]
//! first. The final ack is forwarded to the source that posted the message,
//! carrying the merged outcome of all consumers.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::trace;

/// Shared handle to a log message.
pub type MessageRef = Arc<LogMessage>;

/// Outcome reported by a consumer for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckType {
    /// Processed. The bookmark may be committed.
    Success,
    /// Processed, but the destination is applying backpressure.
    Suspended,
    /// Discarded without delivery. The bookmark must not be committed.
    Aborted,
}

impl AckType {
    /// Returns the string representation of the ack type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Suspended => "suspended",
            Self::Aborted => "aborted",
        }
    }

    /// Combine two outcomes. Aborted dominates suspended, which dominates success.
    pub fn merge(self, other: AckType) -> AckType {
        self.max(other)
    }

    fn flag(self) -> u8 {
        match self {
            Self::Success => 0b001,
            Self::Suspended => 0b010,
            Self::Aborted => 0b100,
        }
    }

    fn from_flags(flags: u8) -> AckType {
        if flags & Self::Aborted.flag() != 0 {
            Self::Aborted
        } else if flags & Self::Suspended.flag() != 0 {
            Self::Suspended
        } else {
            Self::Success
        }
    }

    fn rank(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Suspended => 1,
            Self::Aborted => 2,
        }
    }
}

impl PartialOrd for AckType {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AckType {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for AckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of a tracked message in its tracker's record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(pub(crate) u64);

/// Receiver of the final, merged ack of a message.
pub(crate) trait AckSink: Send + Sync {
    fn handle_ack(&self, msg: MessageRef, ack_type: AckType);
}

/// A log message flowing from a source to its consumers.
pub struct LogMessage {
    payload: Vec<u8>,
    allocated_bytes: usize,
    pending_acks: AtomicUsize,
    ack_flags: AtomicU8,
    record: OnceLock<RecordId>,
    owner: OnceLock<Arc<dyn AckSink>>,
}

impl LogMessage {
    /// Create a message wrapped in a shared handle.
    pub fn new(payload: impl Into<Vec<u8>>) -> MessageRef {
        let payload = payload.into();
        let allocated_bytes = mem::size_of::<LogMessage>() + payload.len();
        Arc::new(Self {
            payload,
            allocated_bytes,
            pending_acks: AtomicUsize::new(0),
            ack_flags: AtomicU8::new(0),
            record: OnceLock::new(),
            owner: OnceLock::new(),
        })
    }

    /// Message payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Bytes charged against the source's memory limit.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    /// Acks still expected before the message is resolved.
    pub fn pending_acks(&self) -> usize {
        self.pending_acks.load(Ordering::Acquire)
    }

    /// Expect one more ack (the message was handed to another consumer).
    pub fn add_ack(&self) {
        self.pending_acks.fetch_add(1, Ordering::AcqRel);
    }

    /// Acknowledge the message on behalf of one consumer.
    ///
    /// # Panics
    ///
    /// Panics if the message is acked more times than acks were expected.
    pub fn ack(self: Arc<Self>, ack_type: AckType) {
        self.ack_flags.fetch_or(ack_type.flag(), Ordering::AcqRel);
        let prev = self.pending_acks.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "message acknowledged more times than tracked");

        if prev > 1 {
            return;
        }

        let merged = AckType::from_flags(self.ack_flags.load(Ordering::Acquire));
        let owner = self.owner.get().cloned();
        match owner {
            Some(owner) => owner.handle_ack(self, merged),
            None => trace!(ack_type = %merged, "Acked message has no owning source"),
        }
    }

    pub(crate) fn set_record_id(&self, id: RecordId) {
        if self.record.set(id).is_err() {
            panic!("message is already tracked");
        }
    }

    pub(crate) fn record_id(&self) -> Option<RecordId> {
        self.record.get().copied()
    }

    /// Attach the posting source and account for its ack.
    pub(crate) fn bind_owner(&self, owner: Arc<dyn AckSink>) {
        if self.owner.set(owner).is_err() {
            panic!("message is already posted to a source");
        }
        self.add_ack();
    }
}

impl fmt::Debug for LogMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogMessage")
            .field("len", &self.payload.len())
            .field("allocated_bytes", &self.allocated_bytes)
            .field("pending_acks", &self.pending_acks())
            .field("record", &self.record.get())
            .finish()
    }
}
