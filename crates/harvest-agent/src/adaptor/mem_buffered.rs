// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Decorator keeping uncommitted chunks in memory so a restart can replay them.
//!
//! Buffers live in a [`MemBufferStore`] keyed by adaptor id, which outlives the
//! decorator instances: a `Restarting` stop leaves the buffer behind for the
//! next instance with the same id, any other stop discards it. The buffer is
//! bounded by bytes; when full, the inner adaptor is suspended until commits
//! free space. A single chunk is always admitted into an empty buffer.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use crate::adaptor::wrapper::Wrapped;
use crate::adaptor::{
    Adaptor, AdaptorFactory, ChunkReceiver, CommitListener, ShutdownPolicy, StartContext,
};
use crate::chunk::Chunk;
use crate::config::AdaptorSettings;
use crate::errors::AdaptorError;

#[derive(Debug, Default)]
struct BufferState {
    chunks: VecDeque<Chunk>,
    bytes: usize,
}

/// Outstanding chunks of one adaptor id.
#[derive(Debug)]
pub struct MemBuffer {
    state: Mutex<BufferState>,
    max_bytes: usize,
    space: Notify,
}

impl MemBuffer {
    fn new(max_bytes: usize) -> Self {
        Self {
            state: Mutex::new(BufferState::default()),
            max_bytes,
            space: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BufferState> {
        #[allow(clippy::expect_used)]
        self.state.lock().expect("lock poisoned")
    }

    /// Appends `chunk`, waiting for commits to free space if the buffer is full.
    pub async fn push(&self, chunk: Chunk) {
        loop {
            let notified = self.space.notified();
            {
                let mut state = self.lock();
                if state.chunks.is_empty() || state.bytes + chunk.len() <= self.max_bytes {
                    state.bytes += chunk.len();
                    state.chunks.push_back(chunk);
                    return;
                }
            }
            debug!("memory buffer full, waiting for commits");
            notified.await;
        }
    }

    /// Drops every chunk ending at or before `offset`.
    pub fn release_through(&self, offset: u64) -> usize {
        let freed = {
            let mut state = self.lock();
            let before = state.chunks.len();
            let mut freed_bytes = 0;
            state.chunks.retain(|c| {
                let keep = c.seq_id > offset;
                if !keep {
                    freed_bytes += c.len();
                }
                keep
            });
            state.bytes -= freed_bytes;
            before - state.chunks.len()
        };
        if freed > 0 {
            self.space.notify_waiters();
        }
        freed
    }

    /// Copy of the outstanding chunks, oldest first.
    #[must_use]
    pub fn pending(&self) -> Vec<Chunk> {
        self.lock().chunks.iter().cloned().collect()
    }

    #[must_use]
    pub fn bytes(&self) -> usize {
        self.lock().bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().chunks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().chunks.is_empty()
    }
}

/// Agent-wide map of memory buffers by adaptor id.
#[derive(Debug, Default)]
pub struct MemBufferStore {
    buffers: Mutex<HashMap<String, Arc<MemBuffer>>>,
}

impl MemBufferStore {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<MemBuffer>>> {
        #[allow(clippy::expect_used)]
        self.buffers.lock().expect("lock poisoned")
    }

    #[must_use]
    pub fn get_or_create(&self, id: &str, max_bytes: usize) -> Arc<MemBuffer> {
        Arc::clone(
            self.lock()
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(MemBuffer::new(max_bytes))),
        )
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<MemBuffer>> {
        self.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<MemBuffer>> {
        self.lock().remove(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Sits between the inner adaptor and the real destination.
struct BufferingReceiver {
    buffer: Arc<MemBuffer>,
    dest: Arc<dyn ChunkReceiver>,
}

#[async_trait]
impl ChunkReceiver for BufferingReceiver {
    async fn add(&self, chunk: Chunk) {
        self.buffer.push(chunk.clone()).await;
        self.dest.add(chunk).await;
    }
}

pub struct MemBuffered {
    wrapped: Wrapped,
    store: Arc<MemBufferStore>,
    max_bytes: usize,
    running: Mutex<Option<(String, Arc<MemBuffer>)>>,
}

impl MemBuffered {
    #[must_use]
    pub fn new(settings: &AdaptorSettings, store: Arc<MemBufferStore>) -> Self {
        Self {
            wrapped: Wrapped::default(),
            store,
            max_bytes: settings.mem_buffer_size,
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> Option<(String, Arc<MemBuffer>)> {
        #[allow(clippy::expect_used)]
        self.running.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl Adaptor for MemBuffered {
    fn kind(&self) -> &str {
        self.wrapped.kind()
    }

    fn current_status(&self) -> String {
        self.wrapped.status()
    }

    fn parse_args(
        &mut self,
        kind: &str,
        params: &str,
        factory: &AdaptorFactory,
    ) -> Result<String, AdaptorError> {
        self.wrapped.parse(kind, params, factory)
    }

    async fn start(&self, ctx: StartContext) -> Result<(), AdaptorError> {
        let inner = self.wrapped.inner()?;
        let buffer = self.store.get_or_create(&ctx.id, self.max_bytes);
        #[allow(clippy::expect_used)]
        {
            *self.running.lock().expect("lock poisoned") =
                Some((ctx.id.clone(), Arc::clone(&buffer)));
        }

        let mut resume_at = ctx.offset;
        let replay = buffer.pending();
        if !replay.is_empty() {
            debug!("adaptor {} replaying {} buffered chunks", ctx.id, replay.len());
        }
        for mut chunk in replay {
            resume_at = resume_at.max(chunk.seq_id);
            chunk.initiator = Some(ctx.control.adaptor_ref());
            ctx.dest.add(chunk).await;
        }

        let receiver = Arc::new(BufferingReceiver {
            buffer,
            dest: Arc::clone(&ctx.dest),
        });
        inner.start(ctx.with_dest(receiver, resume_at)).await
    }

    async fn shutdown(&self, policy: ShutdownPolicy) -> Result<u64, AdaptorError> {
        let offset = self.wrapped.inner()?.shutdown(policy).await;
        if !policy.retains_state() {
            if let Some((id, _)) = self.running() {
                self.store.remove(&id);
            }
        }
        offset
    }

    fn as_commit_listener(&self) -> Option<&dyn CommitListener> {
        Some(self)
    }
}

#[async_trait]
impl CommitListener for MemBuffered {
    async fn committed(&self, offset: u64) {
        if let Some((_, buffer)) = self.running() {
            buffer.release_through(offset);
        }
        self.wrapped.forward_commit(offset).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn chunk(seq: u64, len: usize) -> Chunk {
        Chunk::new("raw", "s", seq, vec![0; len])
    }

    #[tokio::test]
    async fn test_release_through_frees_space() {
        let buffer = MemBuffer::new(100);
        buffer.push(chunk(10, 10)).await;
        buffer.push(chunk(20, 10)).await;
        buffer.push(chunk(30, 10)).await;
        assert_eq!(buffer.release_through(20), 2);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.bytes(), 10);
        assert_eq!(buffer.release_through(20), 0);
    }

    #[tokio::test]
    async fn test_oversized_chunk_admitted_when_empty() {
        let buffer = MemBuffer::new(4);
        buffer.push(chunk(10, 10)).await;
        assert_eq!(buffer.bytes(), 10);
    }

    #[tokio::test]
    async fn test_full_buffer_waits_for_commit() {
        let buffer = Arc::new(MemBuffer::new(15));
        buffer.push(chunk(10, 10)).await;

        let pusher = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.push(chunk(20, 10)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pusher.is_finished());

        buffer.release_through(10);
        tokio::time::timeout(Duration::from_secs(5), pusher)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buffer.pending()[0].seq_id, 20);
    }

    #[test]
    fn test_store_keys_by_id() {
        let store = MemBufferStore::default();
        let a = store.get_or_create("adaptor_a", 10);
        let again = store.get_or_create("adaptor_a", 99);
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(store.len(), 1);
        store.remove("adaptor_a");
        assert!(store.get("adaptor_a").is_none());
    }
}
