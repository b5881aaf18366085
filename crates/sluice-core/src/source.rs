// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Log source: flow-controlled entry point for messages from one input.
//!
//! A [`LogSource`] owns an ack tracker, an in-flight window counter and a
//! memory counter. The input driver posts messages through it; destinations
//! ack them on arbitrary threads, and the source turns those acks into
//! committed bookmarks, window adjustments and driver wakeups.
//!
//! ```text
//!   input driver                    LogSource                       destinations
//!  ┌────────────┐   post(msg)   ┌──────────────────┐  queue(msg)   ┌────────────┐
//!  │            │──────────────►│ tracker          │──────────────►│            │
//!  │            │               │ window  (count)  │               │            │
//!  │            │◄──────────────│ memory  (bytes)  │◄──────────────│            │
//!  └────────────┘  wakeup()     └──────────────────┘  msg.ack(..)  └────────────┘
//! ```
//!
//! The driver must stop reading while [`LogSource::free_to_send`] is false
//! and resume after [`SourceDriver::wakeup`], which may be called from any
//! thread.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use tracing::{debug, info, trace};

use crate::ack::{AckTracker, AckTrackerKind, BookmarkGuard, FlowControl, OnAllAcked, lock};
use crate::bookmark::{Bookmark, PersistState};
use crate::config::SourceConfig;
use crate::error::{Result, SluiceError};
use crate::message::{AckSink, AckType, MessageRef};
use crate::stats::{SourceStats, SourceStatsSnapshot, WindowSnapshot};
use crate::window::WindowSizeCounter;

/// Hooks supplied by the input driver that reads for a source.
pub trait SourceDriver: Send + Sync {
    /// The source may be free to read again.
    ///
    /// Called from whichever thread resolved the ack. Implementations must
    /// hand the wakeup to the driver's own execution context.
    fn wakeup(&self);

    /// Every message posted by the source has been resolved.
    fn window_empty(&self) {}
}

/// Downstream consumer of posted messages.
pub trait Pipeline: Send + Sync {
    /// Accept a message. The pipeline owns one ack of it.
    fn queue(&self, msg: MessageRef);
}

/// Lifecycle state of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    /// Built but not initialized.
    Uninitialized,
    /// Initialized, nothing posted yet.
    Initialized,
    /// Accepting input.
    Running,
    /// Flow control is holding input back.
    Suspended,
    /// Shut down.
    Deinitialized,
}

impl SourceState {
    /// Returns the string representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Deinitialized => "deinitialized",
        }
    }
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const LIFECYCLE_UNINITIALIZED: u8 = 0;
const LIFECYCLE_INITIALIZED: u8 = 1;
const LIFECYCLE_RUNNING: u8 = 2;
const LIFECYCLE_DEINITIALIZED: u8 = 3;

/// Memory budget in bytes, owned by one source or shared by several.
///
/// When a release brings the counter back under its limit, every source
/// built on it is woken, whichever source's ack did the release.
pub struct MemoryCounter {
    counter: WindowSizeCounter,
    sources: Mutex<Vec<Weak<SourceShared>>>,
}

impl MemoryCounter {
    /// Create a counter suspending at `limit` bytes (0 disables accounting).
    pub fn new(limit: usize) -> Self {
        Self {
            counter: WindowSizeCounter::new(limit),
            sources: Mutex::new(Vec::new()),
        }
    }

    /// The underlying byte counter.
    pub fn counter(&self) -> &WindowSizeCounter {
        &self.counter
    }

    /// Number of live sources built on this counter.
    pub fn sources(&self) -> usize {
        lock(&self.sources)
            .iter()
            .filter(|s| s.strong_count() > 0)
            .count()
    }

    fn register(&self, source: Weak<SourceShared>) {
        let mut sources = lock(&self.sources);
        sources.retain(|s| s.strong_count() > 0);
        sources.push(source);
    }

    fn wake_all(&self) {
        let sources: Vec<_> = lock(&self.sources)
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for source in sources {
            source.wakeup();
        }
    }
}

impl fmt::Debug for MemoryCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCounter")
            .field("counter", &self.counter)
            .field("sources", &self.sources())
            .finish()
    }
}

/// Builder for a [`LogSource`].
pub struct LogSourceBuilder {
    config: SourceConfig,
    persist_state: Option<Arc<dyn PersistState>>,
    memory_counter: Option<Arc<MemoryCounter>>,
}

impl fmt::Debug for LogSourceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogSourceBuilder")
            .field("config", &self.config)
            .field("persist_state", &self.persist_state.as_ref().map(|_| "..."))
            .field("memory_counter", &self.memory_counter)
            .finish()
    }
}

impl LogSourceBuilder {
    /// Create a builder for a source with the given configuration.
    pub fn new(config: SourceConfig) -> Self {
        Self {
            config,
            persist_state: None,
            memory_counter: None,
        }
    }

    /// Set the backend committed bookmarks are written to.
    pub fn persist_state(mut self, persist_state: Arc<dyn PersistState>) -> Self {
        self.persist_state = Some(persist_state);
        self
    }

    /// Share a memory counter with other sources.
    ///
    /// The counter's limit replaces `memory_limit` from the configuration.
    pub fn memory_counter(mut self, counter: Arc<MemoryCounter>) -> Self {
        self.memory_counter = Some(counter);
        self
    }

    /// Build the source. It must be initialized before posting.
    pub fn build(self) -> LogSource {
        let tracker = AckTrackerKind::new(&self.config, self.persist_state);
        let window = WindowSizeCounter::new(self.config.init_window_size);
        let memory = self
            .memory_counter
            .unwrap_or_else(|| Arc::new(MemoryCounter::new(self.config.memory_limit)));

        let shared = Arc::new(SourceShared {
            config: self.config,
            tracker,
            window,
            memory,
            lifecycle: AtomicU8::new(LIFECYCLE_UNINITIALIZED),
            pipeline: RwLock::new(None),
            driver: RwLock::new(None),
            stats: SourceStats::default(),
        });
        shared.memory.register(Arc::downgrade(&shared));

        LogSource { shared }
    }
}

/// A flow-controlled message source. Cheap to clone.
#[derive(Clone)]
pub struct LogSource {
    shared: Arc<SourceShared>,
}

struct SourceShared {
    config: SourceConfig,
    tracker: AckTrackerKind,
    window: WindowSizeCounter,
    memory: Arc<MemoryCounter>,
    lifecycle: AtomicU8,
    pipeline: RwLock<Option<Arc<dyn Pipeline>>>,
    driver: RwLock<Option<Arc<dyn SourceDriver>>>,
    stats: SourceStats,
}

impl LogSource {
    /// Create a builder.
    pub fn builder(config: SourceConfig) -> LogSourceBuilder {
        LogSourceBuilder::new(config)
    }

    /// Create a source with no persist state and a private memory counter.
    pub fn new(config: SourceConfig) -> Self {
        LogSourceBuilder::new(config).build()
    }

    /// Source name.
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// Source configuration.
    pub fn config(&self) -> &SourceConfig {
        &self.shared.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SourceState {
        match self.shared.lifecycle.load(Ordering::Acquire) {
            LIFECYCLE_UNINITIALIZED => SourceState::Uninitialized,
            LIFECYCLE_DEINITIALIZED => SourceState::Deinitialized,
            _ if !self.free_to_send() => SourceState::Suspended,
            LIFECYCLE_INITIALIZED => SourceState::Initialized,
            _ => SourceState::Running,
        }
    }

    /// Attach the pipeline and driver and start accepting messages.
    pub fn init(&self, pipeline: Arc<dyn Pipeline>, driver: Arc<dyn SourceDriver>) -> Result<()> {
        let shared = &self.shared;
        shared
            .lifecycle
            .compare_exchange(
                LIFECYCLE_UNINITIALIZED,
                LIFECYCLE_INITIALIZED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| shared.invalid_state(self.state(), "uninitialized"))?;

        *write(&shared.pipeline) = Some(pipeline);
        *write(&shared.driver) = Some(driver);

        if !shared.config.bookmark_saving {
            shared.tracker.disable_bookmark_saving();
        }

        info!(
            source = %shared.config.name,
            window = shared.config.init_window_size,
            memory_limit = shared.memory_usage().suspend_threshold(),
            ack_mode = %shared.tracker.mode(),
            "Source initialized"
        );
        Ok(())
    }

    /// Stop accepting messages and detach the pipeline and driver.
    ///
    /// Messages already posted may still be acked; their bookmarks are
    /// committed as usual.
    pub fn deinit(&self) {
        let shared = &self.shared;
        let previous = shared
            .lifecycle
            .swap(LIFECYCLE_DEINITIALIZED, Ordering::AcqRel);
        if previous == LIFECYCLE_DEINITIALIZED {
            return;
        }

        write(&shared.pipeline).take();
        write(&shared.driver).take();

        info!(
            source = %shared.config.name,
            pending = !shared.tracker.is_empty(),
            "Source deinitialized"
        );
    }

    /// Reserve the bookmark of the next posted message so the caller can fill in
    /// its position. Drop the guard before calling [`post`](Self::post).
    ///
    /// The reservation is shared by every clone of the source, so this
    /// two-step form needs a single posting thread. Concurrent posters use
    /// [`post_with_bookmark`](Self::post_with_bookmark).
    pub fn request_bookmark(&self) -> Result<BookmarkGuard<'_>> {
        self.shared.tracker.request_bookmark()
    }

    /// Track `msg` and forward it to the pipeline.
    ///
    /// Uses the bookmark reserved by [`request_bookmark`](Self::request_bookmark),
    /// or an empty one. Fails without taking the message if the source is not
    /// initialized or the tracker is full.
    pub fn post(&self, msg: MessageRef) -> Result<()> {
        self.shared.ensure_accepting()?;
        let bookmark = self.shared.tracker.request_bookmark()?;
        self.track_and_queue(bookmark, msg);
        Ok(())
    }

    /// Fill the message's bookmark with `fill` and post it.
    ///
    /// Filling and tracking happen under the tracker's pending lock, so any
    /// number of threads may post through clones of one source.
    pub fn post_with_bookmark(
        &self,
        msg: MessageRef,
        fill: impl FnOnce(&mut Bookmark),
    ) -> Result<()> {
        self.shared.ensure_accepting()?;
        let mut bookmark = self.shared.tracker.request_bookmark()?;
        fill(&mut *bookmark);
        self.track_and_queue(bookmark, msg);
        Ok(())
    }

    fn track_and_queue(&self, bookmark: BookmarkGuard<'_>, msg: MessageRef) {
        let shared = &self.shared;

        msg.bind_owner(shared.clone());
        shared.tracker.track_reserved(bookmark, &msg);

        let update = shared.window.fetch_add(1);
        if update.became_suspended() {
            shared.stats.record_suspension();
            debug!(
                source = %shared.config.name,
                window = update.previous + 1,
                "Window is full, suspending source"
            );
        }
        shared.increment_memory_usage(msg.allocated_bytes());
        shared.stats.record_received();

        let _ = shared.lifecycle.compare_exchange(
            LIFECYCLE_INITIALIZED,
            LIFECYCLE_RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        trace!(source = %shared.config.name, bytes = msg.allocated_bytes(), "Posted message");

        let pipeline = read(&shared.pipeline).clone();
        match pipeline {
            Some(pipeline) => pipeline.queue(msg),
            // Deinitialized between the state check and here
            None => msg.ack(AckType::Aborted),
        }
    }

    /// Charge `bytes` against the memory limit.
    pub fn increment_memory_usage(&self, bytes: usize) {
        self.shared.increment_memory_usage(bytes);
    }

    /// Release `bytes` from the memory limit, waking the driver if this frees
    /// the source.
    pub fn decrement_memory_usage(&self, bytes: usize) {
        self.shared.decrement_memory_usage(bytes);
    }

    /// Clear a destination-requested suspend.
    pub fn flow_control_resume(&self) {
        let shared = &self.shared;
        if shared.window.resume().resumed() {
            debug!(source = %shared.config.name, "Flow control resumed");
            shared.wakeup();
        }
    }

    /// Whether the driver may read more input.
    pub fn free_to_send(&self) -> bool {
        !self.shared.window.suspended() && !self.shared.memory_usage().suspended()
    }

    /// In-flight message window.
    pub fn window(&self) -> &WindowSizeCounter {
        &self.shared.window
    }

    /// Memory usage counter (possibly shared with other sources).
    pub fn memory_usage(&self) -> &WindowSizeCounter {
        self.shared.memory_usage()
    }

    /// Memory counter, for building further sources on the same budget.
    pub fn memory_counter(&self) -> &Arc<MemoryCounter> {
        &self.shared.memory
    }

    /// Replace the callback fired when every posted message is resolved.
    pub fn set_on_all_acked(&self, callback: Option<OnAllAcked>) {
        self.shared.tracker.set_on_all_acked(callback);
    }

    /// Stop persisting bookmarks for the rest of the source's lifetime.
    pub fn disable_bookmark_saving(&self) {
        self.shared.tracker.disable_bookmark_saving();
    }

    /// Whether every posted message has been resolved.
    pub fn is_empty(&self) -> bool {
        self.shared.tracker.is_empty()
    }

    /// Snapshot of the source's counters.
    pub fn stats(&self) -> SourceStatsSnapshot {
        let shared = &self.shared;
        shared.stats.snapshot(
            &shared.config.name,
            WindowSnapshot {
                in_flight: shared.window.value(),
                memory_usage: shared.memory_usage().value(),
                suspended: !self.free_to_send(),
            },
        )
    }
}

impl FlowControl for LogSource {
    fn flow_control_suspend(&self) {
        self.shared.as_ref().flow_control_suspend();
    }

    fn flow_control_adjust(&self, n: usize) {
        self.shared.as_ref().flow_control_adjust(n);
    }

    fn flow_control_adjust_when_suspended(&self, n: usize) {
        self.shared.as_ref().flow_control_adjust_when_suspended(n);
    }
}

impl fmt::Debug for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogSource")
            .field("name", &self.shared.config.name)
            .field("state", &self.state())
            .field("window", &self.shared.window)
            .field("memory", &self.shared.memory)
            .field("tracker", &self.shared.tracker)
            .finish()
    }
}

impl SourceShared {
    fn invalid_state(&self, state: SourceState, expected: &'static str) -> SluiceError {
        SluiceError::InvalidState {
            source_name: self.config.name.clone(),
            state,
            expected,
        }
    }

    fn ensure_accepting(&self) -> Result<()> {
        match self.lifecycle.load(Ordering::Acquire) {
            LIFECYCLE_INITIALIZED | LIFECYCLE_RUNNING => Ok(()),
            LIFECYCLE_UNINITIALIZED => {
                Err(self.invalid_state(SourceState::Uninitialized, "initialized"))
            }
            _ => Err(self.invalid_state(SourceState::Deinitialized, "initialized")),
        }
    }

    fn memory_usage(&self) -> &WindowSizeCounter {
        &self.memory.counter
    }

    fn memory_accounting(&self) -> bool {
        self.memory_usage().suspend_threshold() > 0
    }

    fn increment_memory_usage(&self, bytes: usize) {
        if !self.memory_accounting() {
            return;
        }

        let update = self.memory_usage().fetch_add(bytes);
        trace!(
            source = %self.config.name,
            current = update.previous,
            increment = bytes,
            "memory.inc"
        );
        if update.became_suspended() {
            self.stats.record_suspension();
            debug!(
                source = %self.config.name,
                memory_limit = self.memory_usage().suspend_threshold(),
                current = update.previous + bytes,
                "Memory limit reached, suspending source"
            );
        }
    }

    fn decrement_memory_usage(&self, bytes: usize) {
        if !self.memory_accounting() {
            return;
        }

        let update = self.memory_usage().fetch_sub(bytes);
        trace!(
            source = %self.config.name,
            current = update.previous,
            decrement = bytes,
            "memory.dec"
        );
        if update.resumed() {
            debug!(
                source = %self.config.name,
                memory_limit = self.memory_usage().suspend_threshold(),
                "Memory usage below limit, resuming sources"
            );
            self.memory.wake_all();
        }
        if update.previous == bytes {
            self.window_empty();
        }
    }

    fn window_drained(&self, n: usize, previous: usize) {
        if n > 0 && previous == n && !self.memory_accounting() {
            self.window_empty();
        }
    }

    fn wakeup(&self) {
        let driver = read(&self.driver).clone();
        if let Some(driver) = driver {
            self.stats.record_wakeup();
            driver.wakeup();
        }
    }

    fn window_empty(&self) {
        let driver = read(&self.driver).clone();
        if let Some(driver) = driver {
            trace!(source = %self.config.name, "Window empty");
            driver.window_empty();
        }
    }
}

impl AckSink for SourceShared {
    fn handle_ack(&self, msg: MessageRef, ack_type: AckType) {
        let bytes = msg.allocated_bytes();
        self.stats.record_ack(ack_type);
        self.tracker.manage_msg_ack(msg, ack_type, self);
        self.decrement_memory_usage(bytes);
    }
}

impl FlowControl for SourceShared {
    fn flow_control_suspend(&self) {
        if self.window.suspend().became_suspended() {
            self.stats.record_suspension();
            debug!(source = %self.config.name, "Destination suspended flow control");
        }
    }

    fn flow_control_adjust(&self, n: usize) {
        let resumed = self.window.resume();
        let update = self.window.fetch_sub(n);
        trace!(
            source = %self.config.name,
            adjust = n,
            window = update.previous - n,
            "Window adjusted"
        );

        // A post may refill the window between resume and the decrement
        if update.resumed() || (resumed.was_suspended && !update.suspended) {
            debug!(source = %self.config.name, "Window has room, resuming source");
            self.wakeup();
        }
        self.window_drained(n, update.previous);
    }

    fn flow_control_adjust_when_suspended(&self, n: usize) {
        let update = self.window.fetch_sub(n);
        trace!(
            source = %self.config.name,
            adjust = n,
            window = update.previous - n,
            "Window adjusted while suspended"
        );

        // flow_control_resume may have cleared the suspend bit meanwhile
        if update.resumed() {
            self.wakeup();
        }
        self.window_drained(n, update.previous);
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
