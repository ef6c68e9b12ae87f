// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Scripted adaptor and capturing sink

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use harvest_agent::adaptor::task::AdaptorTask;
use harvest_agent::adaptor::{Adaptor, AdaptorFactory, ShutdownPolicy, StartContext};
use harvest_agent::chunk::Chunk;
use harvest_agent::connector::{ChunkSink, CommitReporter};
use harvest_agent::errors::{AdaptorError, SinkError};

/// Byte found at stream offset `offset` of every scripted stream.
pub fn scripted_byte(offset: u64) -> u8 {
    (offset % 251) as u8
}

/// `Scripted <kind> <chunkSize> <end>`: emits the bytes from the start offset up
/// to `end` in chunks of `chunkSize`, then idles until stopped. An `end` of 0
/// makes the adaptor deregister itself as soon as it starts.
pub struct ScriptedAdaptor {
    kind: String,
    chunk_size: u64,
    end: u64,
    offset: Arc<AtomicU64>,
    task: AdaptorTask,
}

impl ScriptedAdaptor {
    pub fn new() -> Self {
        Self {
            kind: String::new(),
            chunk_size: 1,
            end: 0,
            offset: Arc::new(AtomicU64::new(0)),
            task: AdaptorTask::new(),
        }
    }

    pub fn register(factory: &mut AdaptorFactory) {
        factory.register("Scripted", || Box::new(ScriptedAdaptor::new()));
    }
}

#[async_trait::async_trait]
impl Adaptor for ScriptedAdaptor {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn current_status(&self) -> String {
        format!("{} {} {}", self.kind, self.chunk_size, self.end)
    }

    fn parse_args(
        &mut self,
        kind: &str,
        params: &str,
        _factory: &AdaptorFactory,
    ) -> Result<String, AdaptorError> {
        let mut words = params.split_whitespace();
        let (Some(size), Some(end), None) = (words.next(), words.next(), words.next()) else {
            return Err(AdaptorError::InvalidParams(format!(
                "expected '<chunkSize> <end>', got '{params}'"
            )));
        };
        self.chunk_size = size
            .parse()
            .ok()
            .filter(|s| *s > 0)
            .ok_or_else(|| AdaptorError::InvalidParams(format!("bad chunk size {size}")))?;
        self.end = end
            .parse()
            .map_err(|_| AdaptorError::InvalidParams(format!("bad end {end}")))?;
        self.kind = kind.to_string();
        Ok(format!("{} {}", self.chunk_size, self.end))
    }

    async fn start(&self, ctx: StartContext) -> Result<(), AdaptorError> {
        if self.end == 0 {
            ctx.control.deregister_and_stop();
            return Ok(());
        }

        self.offset.store(ctx.offset, Ordering::SeqCst);
        let offset = Arc::clone(&self.offset);
        let kind = self.kind.clone();
        let (chunk_size, end) = (self.chunk_size, self.end);
        self.task.spawn(move |signals| async move {
            let mut pos = ctx.offset;
            while pos < end {
                let next = (pos + chunk_size).min(end);
                let data = (pos..next).map(scripted_byte).collect();
                offset.store(next, Ordering::SeqCst);
                ctx.dest
                    .add(ctx.control.new_chunk(&kind, "scripted", next, data))
                    .await;
                pos = next;
                tokio::task::yield_now().await;
            }
            signals.draining().await;
        });
        Ok(())
    }

    async fn shutdown(&self, policy: ShutdownPolicy) -> Result<u64, AdaptorError> {
        self.task.stop(policy, Duration::from_secs(5)).await;
        Ok(self.offset.load(Ordering::SeqCst))
    }
}

/// Records every batch and commits chunks ending at or before the commit limit.
pub struct CapturingSink {
    received: Mutex<Vec<Chunk>>,
    commit_limit: AtomicU64,
}

impl CapturingSink {
    /// Commits everything it receives.
    pub fn new() -> Arc<Self> {
        Self::committing_up_to(u64::MAX)
    }

    /// Never commits.
    pub fn holding() -> Arc<Self> {
        Self::committing_up_to(0)
    }

    pub fn committing_up_to(limit: u64) -> Arc<Self> {
        Arc::new(Self {
            received: Mutex::new(Vec::new()),
            commit_limit: AtomicU64::new(limit),
        })
    }

    pub fn set_commit_limit(&self, limit: u64) {
        self.commit_limit.store(limit, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<Chunk> {
        self.received.lock().unwrap().clone()
    }

    /// Received chunks whose stream name is `stream`, in arrival order.
    pub fn received_from(&self, stream: &str) -> Vec<Chunk> {
        self.received()
            .into_iter()
            .filter(|c| c.stream_name == stream)
            .collect()
    }

    pub fn clear(&self) {
        self.received.lock().unwrap().clear();
    }
}

#[async_trait::async_trait]
impl ChunkSink for CapturingSink {
    async fn send(&self, chunks: Vec<Chunk>, commits: &CommitReporter) -> Result<(), SinkError> {
        let limit = self.commit_limit.load(Ordering::SeqCst);
        let committable: Vec<Chunk> = chunks
            .iter()
            .filter(|c| c.seq_id <= limit)
            .cloned()
            .collect();
        self.received.lock().unwrap().extend(chunks);
        commits.commit_chunks(&committable).await;
        Ok(())
    }
}
