// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Restarts adaptors whose sent data stops being committed.
//!
//! For every registration the watchdog remembers the highest offset handed to
//! the sink and when a commit was last seen. A sweep restarts any adaptor that
//! has uncommitted data and no commit within the timeout: it is stopped with
//! `Restarting` and re-added under the same id with its live status, resuming
//! at the last committed offset. The gap is delivered again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adaptor::ShutdownPolicy;
use crate::chunk::{AdaptorRef, Chunk};
use crate::registry::{AdaptorEntry, Registry};

#[derive(Debug, Clone, Copy)]
struct AdaptorStat {
    last_commit: Instant,
    max_sent: u64,
}

#[derive(Debug)]
pub struct Watchdog {
    registry: Arc<Registry>,
    timeout: Duration,
    stats: Mutex<HashMap<AdaptorRef, AdaptorStat>>,
}

impl Watchdog {
    #[must_use]
    pub fn new(registry: Arc<Registry>, timeout: Duration) -> Self {
        Self {
            registry,
            timeout,
            stats: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<AdaptorRef, AdaptorStat>> {
        #[allow(clippy::expect_used)]
        self.stats.lock().expect("lock poisoned")
    }

    /// Notes chunks about to be handed to the sink.
    pub fn report_pending(&self, chunks: &[Chunk]) {
        let now = Instant::now();
        let mut stats = self.lock();
        for chunk in chunks {
            let Some(adaptor) = chunk.initiator else {
                continue;
            };
            let stat = stats.entry(adaptor).or_insert(AdaptorStat {
                last_commit: now,
                max_sent: 0,
            });
            stat.max_sent = stat.max_sent.max(chunk.seq_id);
        }
    }

    /// Notes a commit for `adaptor`.
    pub fn report_commit(&self, adaptor: AdaptorRef) {
        let mut stats = self.lock();
        match stats.get_mut(&adaptor) {
            Some(stat) => stat.last_commit = Instant::now(),
            None => debug!("commit for adaptor {adaptor} with no recorded sends"),
        }
    }

    /// Number of registrations being tracked.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.lock().len()
    }

    /// Runs one sweep as of now. Returns the ids that were restarted.
    pub async fn sweep(&self) -> Vec<String> {
        self.sweep_at(Instant::now()).await
    }

    /// Runs one sweep as of `now`.
    pub async fn sweep_at(&self, now: Instant) -> Vec<String> {
        let candidates: Vec<(AdaptorRef, AdaptorStat)> =
            self.lock().iter().map(|(a, s)| (*a, *s)).collect();

        let mut restarted = Vec::new();
        for (adaptor, stat) in candidates {
            let Some(entry) = self.registry.entry(adaptor) else {
                self.lock().remove(&adaptor);
                continue;
            };

            let stalled = stat.max_sent > entry.offset
                && stat.last_commit + self.timeout < now;
            if !stalled {
                continue;
            }

            self.lock().remove(&adaptor);
            if self.restart(&entry, &stat).await {
                restarted.push(entry.id);
            }
        }
        restarted
    }

    async fn restart(&self, entry: &AdaptorEntry, stat: &AdaptorStat) -> bool {
        warn!(
            "adaptor {} sent up to {} but only {} is committed, no commit for over {:?}; restarting",
            entry.id, stat.max_sent, entry.offset, self.timeout
        );

        if self
            .registry
            .stop_adaptor(&entry.id, ShutdownPolicy::Restarting)
            .await
            .is_none()
        {
            debug!("adaptor {} went away before it could be restarted", entry.id);
            return false;
        }

        let command = format!(
            "add {} = {} {} {}",
            entry.id, entry.class, entry.status, entry.offset
        );
        match self.registry.process_add_command(&command).await {
            Ok(_) => {
                info!("restarted adaptor {} at offset {}", entry.id, entry.offset);
                true
            }
            Err(e) => {
                error!("failed to restart adaptor {}: {e}", entry.id);
                false
            }
        }
    }

    /// Sweeps every half timeout until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let period = (self.timeout / 2).max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("watchdog stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let restarted = self.sweep().await;
                    if !restarted.is_empty() {
                        debug!("watchdog restarted {} adaptors", restarted.len());
                    }
                }
            }
        }
    }
}
