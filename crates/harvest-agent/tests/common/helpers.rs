// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use std::sync::Arc;
use std::time::Duration;

use harvest_agent::adaptor::mem_buffered::MemBufferStore;
use harvest_agent::adaptor::AdaptorFactory;
use harvest_agent::chunk::Tags;
use harvest_agent::config::AdaptorSettings;
use harvest_agent::connector::{CommitReporter, Connector};
use harvest_agent::queue::ChunkQueue;
use harvest_agent::registry::Registry;
use harvest_agent::watchdog::Watchdog;
use tokio_util::sync::CancellationToken;

use super::mocks::{CapturingSink, ScriptedAdaptor};

pub const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(60);

/// Polls `condition` until it holds, panicking after ten seconds.
pub async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Built-in adaptors plus `Scripted`.
pub fn test_factory(settings: &AdaptorSettings, mem_buffers: Arc<MemBufferStore>) -> AdaptorFactory {
    let mut factory = AdaptorFactory::with_builtins(settings, mem_buffers);
    ScriptedAdaptor::register(&mut factory);
    factory
}

/// Registry, queue, watchdog and a running connector feeding `sink`.
pub struct Harness {
    pub registry: Arc<Registry>,
    pub queue: Arc<ChunkQueue>,
    pub sink: Arc<CapturingSink>,
    pub watchdog: Arc<Watchdog>,
    pub mem_buffers: Arc<MemBufferStore>,
    cancel: CancellationToken,
}

impl Harness {
    pub fn new(sink: Arc<CapturingSink>) -> Self {
        Self::with_settings(&AdaptorSettings::default(), sink)
    }

    pub fn with_settings(settings: &AdaptorSettings, sink: Arc<CapturingSink>) -> Self {
        let mem_buffers = Arc::new(MemBufferStore::default());
        let queue = Arc::new(ChunkQueue::new(1024 * 1024));
        let registry = Registry::new(
            test_factory(settings, Arc::clone(&mem_buffers)),
            queue.clone(),
            "testhost",
            Tags::parse("cluster=\"test\""),
        );
        let watchdog = Arc::new(Watchdog::new(Arc::clone(&registry), WATCHDOG_TIMEOUT));
        let cancel = CancellationToken::new();
        let connector = Connector::new(
            queue.clone(),
            sink.clone(),
            CommitReporter::new(Arc::clone(&registry), Some(Arc::clone(&watchdog))),
            Some(Arc::clone(&watchdog)),
            64 * 1024,
        );
        tokio::spawn(connector.run(cancel.clone()));
        Self {
            registry,
            queue,
            sink,
            watchdog,
            mem_buffers,
            cancel,
        }
    }

    /// Waits until the sink has seen a chunk ending at `seq` from the current
    /// registration of `id`.
    pub async fn wait_for_seq(&self, id: &str, seq: u64) {
        wait_until(&format!("{id} to deliver up to {seq}"), || {
            let Some(entry) = self.registry.entry_by_id(id) else {
                return false;
            };
            self.sink
                .received()
                .iter()
                .any(|c| c.initiator == Some(entry.adaptor_ref) && c.seq_id >= seq)
        })
        .await;
    }

    pub async fn wait_for_offset(&self, id: &str, offset: u64) {
        wait_until(&format!("{id} to commit {offset}"), || {
            self.registry.offset_of(id) == Some(offset)
        })
        .await;
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
