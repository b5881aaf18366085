// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for sluice-core integration tests.
//!
//! Provides recording collaborators for trackers and sources.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};

use sluice_core::{
    AckTracker, FlowControl, LogMessage, LogSource, MessageRef, PersistError, PersistState,
    Pipeline, SourceDriver,
};

/// Persist entry used by every helper.
pub const ENTRY: &str = "test-source";

/// A flow-control call made by a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowEvent {
    Suspend,
    Adjust(usize),
    AdjustWhenSuspended(usize),
}

/// FlowControl that records every call.
#[derive(Default)]
pub struct RecordingFlow {
    events: Mutex<Vec<FlowEvent>>,
}

impl RecordingFlow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain the recorded events.
    pub fn take(&self) -> Vec<FlowEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

impl FlowControl for RecordingFlow {
    fn flow_control_suspend(&self) {
        self.events.lock().unwrap().push(FlowEvent::Suspend);
    }

    fn flow_control_adjust(&self, n: usize) {
        self.events.lock().unwrap().push(FlowEvent::Adjust(n));
    }

    fn flow_control_adjust_when_suspended(&self, n: usize) {
        self.events.lock().unwrap().push(FlowEvent::AdjustWhenSuspended(n));
    }
}

/// PersistState that keeps every save in order.
#[derive(Default)]
pub struct RecordingPersistState {
    saves: Mutex<Vec<(String, Value)>>,
}

impl RecordingPersistState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `seq` of every saved position, in save order.
    pub fn saved_seqs(&self) -> Vec<u64> {
        self.saves
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, v)| v["seq"].as_u64())
            .collect()
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.saved_seqs().last().copied()
    }

    pub fn save_count(&self) -> usize {
        self.saves.lock().unwrap().len()
    }
}

impl PersistState for RecordingPersistState {
    fn save(&self, entry: &str, position: &Value) -> Result<(), PersistError> {
        self.saves
            .lock()
            .unwrap()
            .push((entry.to_string(), position.clone()));
        Ok(())
    }

    fn load(&self, entry: &str) -> Option<Value> {
        self.saves
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(e, _)| e == entry)
            .map(|(_, v)| v.clone())
    }
}

/// Pipeline that holds on to every queued message.
#[derive(Default)]
pub struct CollectingPipeline {
    messages: Mutex<Vec<MessageRef>>,
}

impl CollectingPipeline {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take every queued message, oldest first.
    pub fn take_all(&self) -> Vec<MessageRef> {
        std::mem::take(&mut *self.messages.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }
}

impl Pipeline for CollectingPipeline {
    fn queue(&self, msg: MessageRef) {
        self.messages.lock().unwrap().push(msg);
    }
}

/// SourceDriver counting its callbacks.
#[derive(Default)]
pub struct CountingDriver {
    wakeups: AtomicUsize,
    window_empties: AtomicUsize,
}

impl CountingDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn wakeups(&self) -> usize {
        self.wakeups.load(Ordering::SeqCst)
    }

    pub fn window_empties(&self) -> usize {
        self.window_empties.load(Ordering::SeqCst)
    }
}

impl SourceDriver for CountingDriver {
    fn wakeup(&self) {
        self.wakeups.fetch_add(1, Ordering::SeqCst);
    }

    fn window_empty(&self) {
        self.window_empties.fetch_add(1, Ordering::SeqCst);
    }
}

/// Callback counter for `set_on_all_acked`.
pub fn counting_callback() -> (Arc<AtomicUsize>, Box<dyn Fn() + Send + Sync>) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    (
        count,
        Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }),
    )
}

/// Request a bookmark at `seq`, then track a new message.
pub fn track(tracker: &dyn AckTracker, seq: u64) -> MessageRef {
    tracker
        .request_bookmark()
        .expect("tracker has room")
        .set_position(ENTRY, json!({ "seq": seq }));
    let msg = LogMessage::new(format!("message {seq}"));
    tracker.track_msg(&msg);
    msg
}

/// Post a new message with a bookmark at `seq`.
pub fn post(source: &LogSource, seq: u64) -> sluice_core::Result<()> {
    source.post_with_bookmark(LogMessage::new(format!("message {seq}")), |bookmark| {
        bookmark.set_position(ENTRY, json!({ "seq": seq }));
    })
}

/// Bytes charged for a message posted by [`post`] with a single-digit `seq`.
pub fn small_message_bytes() -> usize {
    LogMessage::new("message 0").allocated_bytes()
}
