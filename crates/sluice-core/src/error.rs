// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for sluice-core.
//!
//! Only recoverable conditions are errors. Caller protocol violations
//! (tracking without a bookmark, double acks, counter underflow) panic.

use thiserror::Error;

use crate::config::ConfigError;
use crate::source::SourceState;

/// Result type using SluiceError
pub type Result<T> = std::result::Result<T, SluiceError>;

/// Errors reported to the immediate caller.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SluiceError {
    /// The ack record store is full; the message must not be accepted.
    #[error("ack record limit of {limit} reached")]
    AckRecordsExhausted {
        /// Configured store capacity.
        limit: usize,
    },

    /// The source is in the wrong lifecycle state for the operation.
    #[error("source '{source_name}' is {state}, expected {expected}")]
    InvalidState {
        /// Name of the source.
        source_name: String,
        /// The actual state.
        state: SourceState,
        /// The state the operation requires.
        expected: &'static str,
    },

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SluiceError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AckRecordsExhausted { .. } => "ACK_RECORDS_EXHAUSTED",
            Self::InvalidState { .. } => "INVALID_SOURCE_STATE",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }
}
