// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! FIFO store of in-flight ack records.
//!
//! Records live in a ring buffer in arrival order. Each record is addressed
//! by a monotonically increasing [`RecordId`]; the id of the record at the
//! head is `head`, so a record's slot is `id - head` and ids stay stable as
//! the prefix is dropped.
//!
//! The store is not thread-safe on its own. The late tracker keeps it behind
//! its mutex.

use std::collections::VecDeque;

use crate::bookmark::Bookmark;
use crate::message::RecordId;

/// Delivery state of one tracked message.
#[derive(Debug)]
pub struct AckRecord {
    /// Position to commit once this record and all before it are acked.
    pub bookmark: Bookmark,
    /// Whether the message's final ack has arrived.
    pub acked: bool,
}

/// Ordered collection of [`AckRecord`]s.
#[derive(Debug)]
pub struct AckRecordStore {
    records: VecDeque<AckRecord>,
    head: u64,
    capacity: Option<usize>,
}

impl AckRecordStore {
    /// Create an unbounded store.
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// Create a store holding at most `capacity` records (`None` = unbounded).
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            records: VecDeque::new(),
            head: 0,
            capacity,
        }
    }

    /// Configured bound, if any.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Whether `additional` more records fit.
    pub fn has_room(&self, additional: usize) -> bool {
        match self.capacity {
            Some(limit) => self.records.len() + additional <= limit,
            None => true,
        }
    }

    /// Append an unacked record at the tail.
    pub fn append(&mut self, bookmark: Bookmark) -> RecordId {
        let id = RecordId(self.head + self.records.len() as u64);
        self.records.push_back(AckRecord {
            bookmark,
            acked: false,
        });
        id
    }

    /// Flag the record `id` as acked.
    ///
    /// # Panics
    ///
    /// Panics if the record was already acked, already committed, or never
    /// appended.
    pub fn mark_acked(&mut self, id: RecordId) {
        assert!(
            id.0 >= self.head,
            "ack for record {} which is already committed",
            id.0
        );
        let slot = (id.0 - self.head) as usize;
        let len = self.records.len();
        let Some(record) = self.records.get_mut(slot) else {
            panic!("ack for unknown record {} (store holds {} records)", id.0, len);
        };
        assert!(!record.acked, "record {} acknowledged twice", id.0);
        record.acked = true;
    }

    /// Length of the acked run starting at the head, and its last record.
    ///
    /// An empty store, or one whose head is unacked, yields `(0, None)`.
    pub fn scan_committed_prefix(&self) -> (usize, Option<&AckRecord>) {
        let count = self.records.iter().take_while(|r| r.acked).count();
        let last = count.checked_sub(1).and_then(|i| self.records.get(i));
        (count, last)
    }

    /// Remove the first `count` records and hand them back.
    ///
    /// Bookmark destroy hooks run when the returned records are dropped, so
    /// a caller holding a lock around the store can release it first.
    ///
    /// # Panics
    ///
    /// Panics if the store holds fewer than `count` records.
    pub fn drop_prefix(&mut self, count: usize) -> Vec<AckRecord> {
        assert!(
            count <= self.records.len(),
            "cannot drop {} records from a store of {}",
            count,
            self.records.len()
        );
        self.head += count as u64;
        self.records.drain(..count).collect()
    }

    /// Number of records in the store.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for AckRecordStore {
    fn default() -> Self {
        Self::new()
    }
}
