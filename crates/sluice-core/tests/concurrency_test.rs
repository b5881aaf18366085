// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Concurrency tests: acks from many threads, async driver end to end.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use common::*;
use sluice_core::{
    AckMode, AckType, LogMessage, LogSource, MessageRef, NotifyDriver, Pipeline, SourceConfig,
    WindowSizeCounter,
};

// ============================================================================
// Lock-free counter
// ============================================================================

#[test]
fn test_window_counter_concurrent_add_sub() {
    let counter = Arc::new(WindowSizeCounter::new(0));
    let threads: Vec<_> = (0..8)
        .map(|_| {
            let counter = counter.clone();
            thread::spawn(move || {
                for _ in 0..10_000 {
                    counter.add(3);
                    counter.sub(3);
                }
                counter.add(1);
            })
        })
        .collect();

    for t in threads {
        t.join().unwrap();
    }
    assert_eq!(counter.get(), (8, false));
}

// ============================================================================
// Acks from many threads
// ============================================================================

#[test]
fn test_acks_from_many_threads_commit_everything() {
    const MESSAGES: u64 = 2_000;
    const ACKERS: usize = 4;

    let persist = RecordingPersistState::new();
    let source = LogSource::builder(SourceConfig::new("mt").with_init_window_size(0))
        .persist_state(persist.clone())
        .build();
    let pipeline = CollectingPipeline::new();
    let driver = CountingDriver::new();
    source.init(pipeline.clone(), driver.clone()).unwrap();

    let (drains, callback) = counting_callback();
    source.set_on_all_acked(Some(callback));

    for seq in 0..MESSAGES {
        post(&source, seq).unwrap();
    }
    let msgs = pipeline.take_all();

    // Each thread acks an interleaved slice, newest first
    let mut buckets: Vec<Vec<MessageRef>> = (0..ACKERS).map(|_| Vec::new()).collect();
    for (i, msg) in msgs.into_iter().enumerate() {
        buckets[i % ACKERS].push(msg);
    }
    let threads: Vec<_> = buckets
        .into_iter()
        .map(|bucket| {
            thread::spawn(move || {
                for msg in bucket.into_iter().rev() {
                    msg.ack(AckType::Success);
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    assert!(source.is_empty());
    assert_eq!(source.window().get(), (0, false));
    assert_eq!(drains.load(Ordering::SeqCst), 1);
    assert_eq!(driver.window_empties(), 1);
    assert_eq!(persist.last_seq(), Some(MESSAGES - 1));

    let saved = persist.saved_seqs();
    assert!(saved.windows(2).all(|w| w[0] < w[1]));

    let stats = source.stats();
    assert_eq!(stats.received, MESSAGES);
    assert_eq!(stats.acked.success, MESSAGES);
}

// ============================================================================
// Concurrent posters
// ============================================================================

#[test]
fn test_concurrent_posters_track_every_message() {
    const POSTERS: u64 = 4;
    const PER_POSTER: u64 = 20_000;

    let source = LogSource::new(SourceConfig::new("posters").with_init_window_size(0));
    let pipeline = CollectingPipeline::new();
    source.init(pipeline.clone(), CountingDriver::new()).unwrap();

    let threads: Vec<_> = (0..POSTERS)
        .map(|_| {
            let source = source.clone();
            thread::spawn(move || {
                for _ in 0..PER_POSTER {
                    source.post(LogMessage::new("m")).unwrap();
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    let msgs = pipeline.take_all();
    assert_eq!(msgs.len() as u64, POSTERS * PER_POSTER);
    assert_eq!(source.stats().received, POSTERS * PER_POSTER);

    for msg in msgs {
        msg.ack(AckType::Success);
    }
    assert!(source.is_empty());
    assert_eq!(source.window().get(), (0, false));
}

#[test]
fn test_concurrent_posters_keep_their_own_positions() {
    const POSTERS: u64 = 4;
    const PER_POSTER: u64 = 5_000;

    let persist = RecordingPersistState::new();
    let config = SourceConfig::new("positions")
        .with_init_window_size(0)
        .with_ack_mode(AckMode::Early);
    let source = LogSource::builder(config)
        .persist_state(persist.clone())
        .build();
    let pipeline = CollectingPipeline::new();
    source.init(pipeline.clone(), CountingDriver::new()).unwrap();

    let threads: Vec<_> = (0..POSTERS)
        .map(|poster| {
            let source = source.clone();
            thread::spawn(move || {
                for i in 0..PER_POSTER {
                    post(&source, poster * PER_POSTER + i).unwrap();
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    // Early mode saves every position once, at post time
    let mut saved = persist.saved_seqs();
    saved.sort_unstable();
    assert_eq!(saved, (0..POSTERS * PER_POSTER).collect::<Vec<_>>());

    for msg in pipeline.take_all() {
        msg.ack(AckType::Success);
    }
    assert!(source.is_empty());
}

// ============================================================================
// Async driver
// ============================================================================

struct ChannelPipeline {
    tx: mpsc::UnboundedSender<MessageRef>,
}

impl Pipeline for ChannelPipeline {
    fn queue(&self, msg: MessageRef) {
        if let Err(mpsc::error::SendError(msg)) = self.tx.send(msg) {
            msg.ack(AckType::Aborted);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_notify_driver_end_to_end() {
    const MESSAGES: u64 = 500;
    const WINDOW: usize = 8;

    let persist = RecordingPersistState::new();
    let source = LogSource::builder(SourceConfig::new("async").with_init_window_size(WINDOW))
        .persist_state(persist.clone())
        .build();
    let driver = Arc::new(NotifyDriver::new());
    let (tx, mut rx) = mpsc::unbounded_channel::<MessageRef>();
    source
        .init(Arc::new(ChannelPipeline { tx }), driver.clone())
        .unwrap();

    let max_in_flight = Arc::new(AtomicUsize::new(0));
    let destination = {
        let source = source.clone();
        let max_in_flight = max_in_flight.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Some(msg) = rx.recv().await {
                max_in_flight.fetch_max(source.window().value(), Ordering::SeqCst);
                held.push(msg);
                // Ack in reverse batches of three
                if held.len() == 3 {
                    for msg in held.drain(..).rev() {
                        msg.ack(AckType::Success);
                    }
                    tokio::task::yield_now().await;
                }
            }
            for msg in held.drain(..).rev() {
                msg.ack(AckType::Success);
            }
        })
    };

    for seq in 0..MESSAGES {
        tokio::time::timeout(Duration::from_secs(5), driver.wait_until_free(&source))
            .await
            .expect("source should be woken");
        source
            .post_with_bookmark(LogMessage::new(format!("message {seq}")), |bookmark| {
                bookmark.set_position(ENTRY, json!({ "seq": seq }));
            })
            .unwrap();
    }

    // Closing the pipeline flushes the last partial batch
    source.deinit();
    tokio::time::timeout(Duration::from_secs(5), destination)
        .await
        .expect("destination should finish")
        .unwrap();

    assert!(source.is_empty());
    assert!(max_in_flight.load(Ordering::SeqCst) <= WINDOW);
    assert_eq!(persist.last_seq(), Some(MESSAGES - 1));
    assert_eq!(source.stats().acked.total(), MESSAGES);
}

/// Post `messages` through a `NotifyDriver` while a plain thread acks each
/// message as soon as it is queued, so acks keep racing the full window.
async fn race_posts_against_acks(config: SourceConfig, messages: u64) {
    let source = LogSource::new(config);
    let driver = Arc::new(NotifyDriver::new());
    let (tx, mut rx) = mpsc::unbounded_channel::<MessageRef>();
    source
        .init(Arc::new(ChannelPipeline { tx }), driver.clone())
        .unwrap();

    let acker = thread::spawn(move || {
        let mut acked = 0u64;
        while let Some(msg) = rx.blocking_recv() {
            msg.ack(AckType::Success);
            acked += 1;
        }
        acked
    });

    for seq in 0..messages {
        let waited =
            tokio::time::timeout(Duration::from_secs(2), driver.wait_until_free(&source)).await;
        assert!(
            waited.is_ok(),
            "message {seq}: driver not woken, free_to_send={} window={:?} memory={:?}",
            source.free_to_send(),
            source.window().get(),
            source.memory_usage().get()
        );
        source
            .post(LogMessage::new(format!("message {seq}")))
            .unwrap();
    }

    source.deinit();
    let acked = tokio::task::spawn_blocking(move || acker.join().unwrap())
        .await
        .unwrap();

    assert_eq!(acked, messages);
    assert!(source.is_empty());
    assert_eq!(source.stats().received, messages);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_window_bound_posts_racing_acks_never_stall() {
    let config = SourceConfig::new("window-race").with_init_window_size(2);
    race_posts_against_acks(config, 20_000).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_memory_bound_posts_racing_acks_never_stall() {
    let config = SourceConfig::new("memory-race")
        .with_init_window_size(0)
        .with_memory_limit(small_message_bytes() * 2);
    race_posts_against_acks(config, 20_000).await;
}
