// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sluice Core - Message Delivery Reliability for Log Sources
//!
//! This crate tracks messages from the moment an input reads them until every
//! destination has acknowledged them, commits the read position (bookmark)
//! only once it is safe to resume from, and applies backpressure to inputs
//! when too many messages or too many bytes are in flight.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Input Driver                                    │
//! │           (reads input, waits on wakeup while suspended)                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//!          │ request_bookmark / post                  ▲ wakeup / window_empty
//!          ▼                                          │
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           LogSource                                      │
//! │   WindowSizeCounter (messages)     MemoryCounter (bytes, shareable)      │
//! │                                                                          │
//! │   AckTrackerKind ──► LateAckTracker ──► AckRecordStore ──► Bookmark      │
//! │                 └──► EarlyAckTracker                          │          │
//! └─────────────────────────────────────────────────────────────────────────┘
//!          │ queue(msg)                      ▲ msg.ack(type)     │ save
//!          ▼                                 │                   ▼
//! ┌───────────────────────────────────────────────┐   ┌─────────────────────┐
//! │              Pipeline / Destinations           │   │    PersistState     │
//! └───────────────────────────────────────────────┘   └─────────────────────┘
//! ```
//!
//! # Ack Types
//!
//! | Ack | Bookmark | Window adjustment |
//! |-----|----------|-------------------|
//! | `Success` | saved when it ends a contiguous acked prefix | normal, clears destination suspend |
//! | `Suspended` | saved when it ends a contiguous acked prefix | suspend first, then suspended variant |
//! | `Aborted` | never saved | normal |
//!
//! # Commit Semantics
//!
//! Acks arrive out of order. With the late tracker, the persisted position only
//! ever advances to the last message of the longest acked run starting at the
//! oldest outstanding message:
//!
//! ```text
//!   tracked:  [1] [2] [3] [4]
//!   ack 3:    [1] [2] [3✓][4]     committed: none
//!   ack 1:    [2] [3✓][4]         committed: 1        bookmark = position(1)
//!   ack 2:    [4]                 committed: 2, 3     bookmark = position(3)
//! ```
//!
//! # Errors
//!
//! Only recoverable conditions are returned as [`SluiceError`]: a full ack
//! record store, posting to a source in the wrong state, and configuration
//! problems. Protocol violations (tracking without a bookmark, acking a
//! message twice, window underflow) panic.
//!
//! # Configuration
//!
//! See [`SourceConfig::from_env`] for the `SLUICE_*` environment variables.

#![deny(missing_docs)]

pub mod ack;
pub mod bookmark;
pub mod config;
pub mod driver;
pub mod error;
pub mod message;
pub mod source;
pub mod stats;
pub mod window;

pub use ack::{AckTracker, AckTrackerKind, BookmarkGuard, FlowControl, OnAllAcked};
pub use bookmark::{Bookmark, MemoryPersistState, PersistError, PersistState, SavedPosition};
pub use config::{AckMode, ConfigError, SourceConfig};
pub use driver::NotifyDriver;
pub use error::{Result, SluiceError};
pub use message::{AckType, LogMessage, MessageRef, RecordId};
pub use source::{LogSource, LogSourceBuilder, MemoryCounter, Pipeline, SourceDriver, SourceState};
pub use stats::{SourceStatsSnapshot, WindowSnapshot};
pub use window::{WindowSizeCounter, WindowUpdate};
