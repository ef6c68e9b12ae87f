// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Drains the staging queue into a downstream [`ChunkSink`] and routes the
//! sink's acknowledgements back to the registry and the watchdog.

pub mod file_sink;

pub use file_sink::FileSink;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::chunk::{AdaptorRef, Chunk};
use crate::errors::SinkError;
use crate::queue::ChunkQueue;
use crate::registry::Registry;
use crate::watchdog::Watchdog;

/// Downstream transport. Implementations call `commits` for data once it is
/// durable; that may happen during `send` or later.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    async fn send(&self, chunks: Vec<Chunk>, commits: &CommitReporter) -> Result<(), SinkError>;
}

/// Commit channel handed to sinks.
#[derive(Debug, Clone)]
pub struct CommitReporter {
    registry: Arc<Registry>,
    watchdog: Option<Arc<Watchdog>>,
}

impl CommitReporter {
    #[must_use]
    pub fn new(registry: Arc<Registry>, watchdog: Option<Arc<Watchdog>>) -> Self {
        Self { registry, watchdog }
    }

    /// Everything from `adaptor` up to `offset` is durable.
    pub async fn commit(&self, adaptor: AdaptorRef, offset: u64) -> Option<String> {
        if let Some(watchdog) = &self.watchdog {
            watchdog.report_commit(adaptor);
        }
        self.registry.report_commit(adaptor, offset).await
    }

    /// Commits the highest offset per producing adaptor in `chunks`.
    pub async fn commit_chunks(&self, chunks: &[Chunk]) {
        let mut highest: HashMap<AdaptorRef, u64> = HashMap::new();
        for chunk in chunks {
            if let Some(adaptor) = chunk.initiator {
                let seq = highest.entry(adaptor).or_insert(0);
                *seq = (*seq).max(chunk.seq_id);
            }
        }
        for (adaptor, offset) in highest {
            self.commit(adaptor, offset).await;
        }
    }
}

pub struct Connector {
    queue: Arc<ChunkQueue>,
    sink: Arc<dyn ChunkSink>,
    reporter: CommitReporter,
    watchdog: Option<Arc<Watchdog>>,
    batch_bytes: usize,
}

impl Connector {
    #[must_use]
    pub fn new(
        queue: Arc<ChunkQueue>,
        sink: Arc<dyn ChunkSink>,
        reporter: CommitReporter,
        watchdog: Option<Arc<Watchdog>>,
        batch_bytes: usize,
    ) -> Self {
        Self {
            queue,
            sink,
            reporter,
            watchdog,
            batch_bytes,
        }
    }

    /// Moves one batch from the queue to the sink, waiting for data if needed.
    pub async fn drain_once(&self) {
        let chunks = self.queue.collect(self.batch_bytes).await;
        self.send_batch(chunks).await;
    }

    async fn send_batch(&self, chunks: Vec<Chunk>) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.report_pending(&chunks);
        }
        let count = chunks.len();
        // Lost batches are redelivered when the watchdog restarts their adaptors.
        if let Err(e) = self.sink.send(chunks, &self.reporter).await {
            error!("failed to send {count} chunks downstream: {e}");
        }
    }

    /// Drains until `cancel` fires. A batch already taken from the queue is
    /// always handed to the sink before returning.
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            let chunks = tokio::select! {
                () = cancel.cancelled() => {
                    debug!("connector stopping");
                    return;
                }
                chunks = self.queue.collect(self.batch_bytes) => chunks,
            };
            self.send_batch(chunks).await;
        }
    }
}
