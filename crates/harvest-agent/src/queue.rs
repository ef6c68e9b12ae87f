// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Byte-bounded staging queue between adaptors and the drain.
//!
//! `add` never waits: a chunk that would push the buffered payload bytes over the
//! ceiling is dropped. `collect` waits until something is queued.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{error, warn};

use crate::adaptor::ChunkReceiver;
use crate::chunk::Chunk;

#[derive(Debug, Default)]
struct QueueState {
    chunks: VecDeque<Chunk>,
    bytes: usize,
}

#[derive(Debug)]
pub struct ChunkQueue {
    state: Mutex<QueueState>,
    max_bytes: usize,
    not_empty: Notify,
}

impl ChunkQueue {
    #[must_use]
    pub fn new(max_bytes: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            max_bytes,
            not_empty: Notify::new(),
        }
    }

    /// Queues `chunk` unless it would exceed the ceiling. Returns whether it
    /// was admitted.
    pub fn offer(&self, chunk: Chunk) -> bool {
        let len = chunk.len();
        {
            #[allow(clippy::expect_used)]
            let mut state = self.state.lock().expect("lock poisoned");
            if state.bytes + len > self.max_bytes {
                if state.chunks.is_empty() {
                    error!(
                        "JUMBO CHUNK: dropping {len} byte chunk from {} (seq {}), larger than queue limit {}",
                        chunk.stream_name, chunk.seq_id, self.max_bytes
                    );
                } else {
                    warn!(
                        "queue full ({} of {} bytes), dropping {len} byte chunk from {} (seq {})",
                        state.bytes, self.max_bytes, chunk.stream_name, chunk.seq_id
                    );
                }
                return false;
            }
            state.bytes += len;
            state.chunks.push_back(chunk);
        }
        self.not_empty.notify_one();
        true
    }

    /// Waits for at least one chunk, then removes chunks oldest-first until the
    /// queue is empty or `max_bytes` have been taken. The first chunk is always
    /// taken, whatever its size.
    pub async fn collect(&self, max_bytes: usize) -> Vec<Chunk> {
        loop {
            {
                #[allow(clippy::expect_used)]
                let mut state = self.state.lock().expect("lock poisoned");
                if !state.chunks.is_empty() {
                    let mut taken = 0;
                    let mut out = Vec::new();
                    while let Some(front) = state.chunks.front() {
                        if !out.is_empty() && taken + front.len() > max_bytes {
                            break;
                        }
                        let Some(chunk) = state.chunks.pop_front() else {
                            break;
                        };
                        taken += chunk.len();
                        out.push(chunk);
                    }
                    state.bytes -= taken;
                    if !state.chunks.is_empty() {
                        self.not_empty.notify_one();
                    }
                    return out;
                }
            }
            self.not_empty.notified().await;
        }
    }

    /// Buffered payload bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.state.lock().expect("lock poisoned").bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.state.lock().expect("lock poisoned").chunks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }
}

#[async_trait]
impl ChunkReceiver for ChunkQueue {
    async fn add(&self, chunk: Chunk) {
        self.offer(chunk);
    }
}
