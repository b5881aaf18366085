// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sluice demo - generator source with out-of-order destinations
//!
//! Posts numbered messages through a flow-controlled [`LogSource`] into a pool
//! of destination tasks. Destinations ack with varying delays so acks arrive
//! out of order; a few messages are aborted or reported as suspended. When
//! everything is acked, the committed bookmark and the source statistics are
//! logged.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use sluice_core::{
    AckType, ConfigError, LogMessage, LogSource, MemoryPersistState, MessageRef, NotifyDriver,
    PersistState, Pipeline, SluiceError, SourceConfig,
};

const MESSAGE_COUNT: u64 = 2_000;
const DESTINATIONS: usize = 4;

/// Round-robin fan-in to destination tasks.
struct ChannelPipeline {
    destinations: Vec<mpsc::UnboundedSender<MessageRef>>,
    next: AtomicUsize,
}

impl Pipeline for ChannelPipeline {
    fn queue(&self, msg: MessageRef) {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.destinations.len();
        if let Err(mpsc::error::SendError(msg)) = self.destinations[idx].send(msg) {
            msg.ack(AckType::Aborted);
        }
    }
}

fn sequence_of(msg: &LogMessage) -> u64 {
    std::str::from_utf8(msg.payload())
        .ok()
        .and_then(|s| s.rsplit(' ').next())
        .and_then(|s| s.parse().ok())
        .unwrap_or_default()
}

async fn run_destination(
    id: usize,
    source: LogSource,
    mut rx: mpsc::UnboundedReceiver<MessageRef>,
) {
    while let Some(msg) = rx.recv().await {
        let seq = sequence_of(&msg);
        tokio::time::sleep(Duration::from_micros((seq * 7919) % 900)).await;

        let ack_type = if seq % 97 == 13 {
            AckType::Aborted
        } else if seq % 250 == 7 {
            AckType::Suspended
        } else {
            AckType::Success
        };
        msg.ack(ack_type);

        if ack_type == AckType::Suspended {
            debug!(destination = id, seq, "Destination backing off");
            tokio::time::sleep(Duration::from_millis(5)).await;
            source.flow_control_resume();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sluice_core=info".parse().unwrap()),
        )
        .init();

    info!("Starting Sluice demo");

    // Load configuration
    let config = match SourceConfig::from_env() {
        Ok(config) => config,
        Err(ConfigError::Missing(_)) => SourceConfig::new("demo-generator")
            .with_init_window_size(64)
            .with_memory_limit(64 * 1024),
        Err(e) => {
            error!("Configuration error: {}", e);
            return Err(e.into());
        }
    };

    info!(
        source = %config.name,
        window = config.init_window_size,
        memory_limit = config.memory_limit,
        ack_mode = %config.ack_mode,
        "Configuration loaded"
    );

    let persist = Arc::new(MemoryPersistState::new());
    let source = LogSource::builder(config)
        .persist_state(persist.clone())
        .build();
    let driver = Arc::new(NotifyDriver::new());

    // Spawn destinations
    let mut senders = Vec::with_capacity(DESTINATIONS);
    let mut handles = Vec::with_capacity(DESTINATIONS);
    for id in 0..DESTINATIONS {
        let (tx, rx) = mpsc::unbounded_channel();
        senders.push(tx);
        handles.push(tokio::spawn(run_destination(id, source.clone(), rx)));
    }
    let pipeline = Arc::new(ChannelPipeline {
        destinations: senders,
        next: AtomicUsize::new(0),
    });

    let drains = Arc::new(AtomicU64::new(0));
    {
        let drains = drains.clone();
        source.set_on_all_acked(Some(Box::new(move || {
            drains.fetch_add(1, Ordering::Relaxed);
        })));
    }

    source.init(pipeline.clone(), driver.clone())?;

    // Generator
    let entry = source.name().to_string();
    for seq in 0..MESSAGE_COUNT {
        driver.wait_until_free(&source).await;

        let msg = LogMessage::new(format!("message {seq}"));
        loop {
            match source.post_with_bookmark(msg.clone(), |bookmark| {
                bookmark.set_position(entry.clone(), json!({ "seq": seq }));
            }) {
                Ok(()) => break,
                Err(SluiceError::AckRecordsExhausted { .. }) => {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
    info!(messages = MESSAGE_COUNT, "All messages posted, waiting for acks");

    driver.wait_for_window_empty(&source).await;
    source.deinit();
    drop(pipeline);
    for handle in handles {
        handle.await?;
    }

    let stats = source.stats();
    info!(
        drains = drains.load(Ordering::Relaxed),
        wakeups = driver.wakeups(),
        position = %persist.load(&entry).unwrap_or_default(),
        "Demo complete"
    );
    info!("{}", serde_json::to_string_pretty(&stats)?);

    Ok(())
}
