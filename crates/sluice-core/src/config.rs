// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Source configuration, built programmatically or loaded from environment variables.

use std::env;
use std::fmt;
use std::str::FromStr;

/// Default window size (messages in flight before the source suspends).
pub const DEFAULT_INIT_WINDOW_SIZE: usize = 100;

/// How a source acknowledges messages back to its bookmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Bookmarks are committed when a contiguous prefix of messages is acked.
    #[default]
    Late,
    /// Bookmarks are saved as soon as a message is read.
    Early,
}

impl AckMode {
    /// Returns the string representation of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Late => "late",
            Self::Early => "early",
        }
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AckMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "late" => Ok(Self::Late),
            "early" => Ok(Self::Early),
            _ => Err(ConfigError::Invalid("SLUICE_ACK_MODE", "must be late or early")),
        }
    }
}

/// Log source configuration.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Source name used in logs and statistics
    pub name: String,
    /// Messages in flight before the source suspends (0 = unlimited)
    pub init_window_size: usize,
    /// Bytes of message memory before the source suspends (0 = unlimited)
    pub memory_limit: usize,
    /// Ack tracking strategy
    pub ack_mode: AckMode,
    /// Capacity of the ack record store (0 = unbounded)
    pub max_pending_records: usize,
    /// Whether committed bookmarks are persisted
    pub bookmark_saving: bool,
}

impl SourceConfig {
    /// Create a configuration with defaults for the named source.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            init_window_size: DEFAULT_INIT_WINDOW_SIZE,
            memory_limit: 0,
            ack_mode: AckMode::Late,
            max_pending_records: 0,
            bookmark_saving: true,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `SLUICE_SOURCE_NAME`: source name
    ///
    /// Optional (with defaults):
    /// - `SLUICE_INIT_WINDOW_SIZE`: window size (default: 100, 0 = unlimited)
    /// - `SLUICE_MEMORY_LIMIT`: memory limit in bytes (default: 0 = unlimited)
    /// - `SLUICE_ACK_MODE`: `late` or `early` (default: late)
    /// - `SLUICE_MAX_PENDING_RECORDS`: ack record store capacity (default: 0 = unbounded)
    /// - `SLUICE_BOOKMARK_SAVING`: persist bookmarks (default: true)
    pub fn from_env() -> Result<Self, ConfigError> {
        let name = env::var("SLUICE_SOURCE_NAME")
            .map_err(|_| ConfigError::Missing("SLUICE_SOURCE_NAME"))?;

        let init_window_size = parse_var(
            "SLUICE_INIT_WINDOW_SIZE",
            DEFAULT_INIT_WINDOW_SIZE,
            "must be a non-negative integer",
        )?;

        let memory_limit = parse_var("SLUICE_MEMORY_LIMIT", 0, "must be a byte count")?;

        let ack_mode = match env::var("SLUICE_ACK_MODE") {
            Ok(v) => v.parse()?,
            Err(_) => AckMode::default(),
        };

        let max_pending_records = parse_var(
            "SLUICE_MAX_PENDING_RECORDS",
            0,
            "must be a non-negative integer",
        )?;

        let bookmark_saving = match env::var("SLUICE_BOOKMARK_SAVING") {
            Ok(v) => match v.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                _ => {
                    return Err(ConfigError::Invalid(
                        "SLUICE_BOOKMARK_SAVING",
                        "must be true or false",
                    ));
                }
            },
            Err(_) => true,
        };

        Ok(Self {
            name,
            init_window_size,
            memory_limit,
            ack_mode,
            max_pending_records,
            bookmark_saving,
        })
    }

    /// Set the window size.
    pub fn with_init_window_size(mut self, size: usize) -> Self {
        self.init_window_size = size;
        self
    }

    /// Set the memory limit in bytes.
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = bytes;
        self
    }

    /// Set the ack tracking strategy.
    pub fn with_ack_mode(mut self, mode: AckMode) -> Self {
        self.ack_mode = mode;
        self
    }

    /// Bound the ack record store.
    pub fn with_max_pending_records(mut self, limit: usize) -> Self {
        self.max_pending_records = limit;
        self
    }

    /// Enable or disable bookmark persistence.
    pub fn with_bookmark_saving(mut self, enabled: bool) -> Self {
        self.bookmark_saving = enabled;
        self
    }
}

fn parse_var(
    var: &'static str,
    default: usize,
    reason: &'static str,
) -> Result<usize, ConfigError> {
    match env::var(var) {
        Ok(v) => v.trim().parse().map_err(|_| ConfigError::Invalid(var, reason)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
