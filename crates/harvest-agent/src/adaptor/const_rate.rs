// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Synthetic adaptor emitting verifiable random data at a roughly constant rate.
//!
//! Params: `<bytesPerSec> [<seed>]`. Each chunk starts with the seed as eight
//! big-endian bytes; the remainder is drawn from a generator seeded with
//! `start_offset ^ seed`, so any chunk can be checked with
//! [`ConstRateAdaptor::check_chunk`]. Sleep lengths come from a generator seeded
//! with `seed`, which makes chunk boundaries reproducible after a restart.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use regex::Regex;
use tracing::debug;

use crate::adaptor::task::AdaptorTask;
use crate::adaptor::{Adaptor, AdaptorFactory, ShutdownPolicy, StartContext};
use crate::chunk::Chunk;
use crate::config::AdaptorSettings;
use crate::errors::AdaptorError;

const SEED_LEN: usize = 8;

fn params_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    PATTERN.get_or_init(|| Regex::new(r"^([0-9]+)(?:\s+([0-9]+))?\s*$").expect("valid pattern"))
}

pub struct ConstRateAdaptor {
    kind: String,
    bytes_per_sec: u64,
    seed: u64,
    min_sleep_ms: u64,
    sleep_variance_ms: u64,
    grace: Duration,
    offset: Arc<AtomicU64>,
    task: AdaptorTask,
}

impl ConstRateAdaptor {
    #[must_use]
    pub fn new(settings: &AdaptorSettings) -> Self {
        Self {
            kind: String::new(),
            bytes_per_sec: 0,
            seed: 0,
            min_sleep_ms: settings.const_rate_min_sleep_ms,
            sleep_variance_ms: settings.const_rate_sleep_variance_ms,
            grace: settings.graceful_timeout,
            offset: Arc::new(AtomicU64::new(0)),
            task: AdaptorTask::new(),
        }
    }

    /// Verifies a chunk produced by any `ConstRate` adaptor.
    #[must_use]
    pub fn check_chunk(chunk: &Chunk) -> bool {
        if chunk.data.len() < SEED_LEN {
            return false;
        }
        let mut seed_bytes = [0u8; SEED_LEN];
        seed_bytes.copy_from_slice(&chunk.data[..SEED_LEN]);
        let seed = u64::from_be_bytes(seed_bytes);
        let expected = pattern(chunk.start_offset(), seed, chunk.data.len());
        expected[SEED_LEN..] == chunk.data[SEED_LEN..]
    }
}

struct Timing {
    rate: u64,
    min_sleep_ms: u64,
    variance_ms: u64,
}

impl Timing {
    fn next_sleep(&self, coin: &mut StdRng) -> u64 {
        let jitter = if self.variance_ms == 0 {
            0
        } else {
            coin.gen_range(0..self.variance_ms)
        };
        self.min_sleep_ms + jitter
    }

    fn chunk_len(&self, sleep_ms: u64) -> usize {
        usize::try_from(sleep_ms.saturating_mul(self.rate) / 1000).unwrap_or(usize::MAX - SEED_LEN)
            + SEED_LEN
    }
}

fn pattern(start_offset: u64, seed: u64, len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(start_offset ^ seed).fill_bytes(&mut data);
    let prefix = len.min(SEED_LEN);
    data[..prefix].copy_from_slice(&seed.to_be_bytes()[..prefix]);
    data
}

#[async_trait]
impl Adaptor for ConstRateAdaptor {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn current_status(&self) -> String {
        format!("{} {} {}", self.kind.trim(), self.bytes_per_sec, self.seed)
    }

    fn parse_args(
        &mut self,
        kind: &str,
        params: &str,
        _factory: &AdaptorFactory,
    ) -> Result<String, AdaptorError> {
        let params = params.trim();
        let caps = params_pattern().captures(params).ok_or_else(|| {
            AdaptorError::InvalidParams(format!("expected '<bytesPerSec> [<seed>]', got '{params}'"))
        })?;
        self.bytes_per_sec = caps[1]
            .parse()
            .map_err(|e| AdaptorError::InvalidParams(format!("bad rate '{}': {e}", &caps[1])))?;
        self.seed = match caps.get(2) {
            Some(seed) => seed.as_str().parse().map_err(|e| {
                AdaptorError::InvalidParams(format!("bad seed '{}': {e}", seed.as_str()))
            })?,
            None => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
        };
        self.kind = kind.to_string();
        Ok(params.to_string())
    }

    async fn start(&self, ctx: StartContext) -> Result<(), AdaptorError> {
        let timing = Timing {
            rate: self.bytes_per_sec,
            min_sleep_ms: self.min_sleep_ms,
            variance_ms: self.sleep_variance_ms,
        };
        let mut coin = StdRng::seed_from_u64(self.seed);
        let mut replayed = 0u64;
        while replayed < ctx.offset {
            replayed += timing.chunk_len(timing.next_sleep(&mut coin)) as u64;
        }

        self.offset.store(ctx.offset, Ordering::SeqCst);
        let offset = Arc::clone(&self.offset);
        let seed = self.seed;
        let kind = self.kind.clone();
        let stream_name = format!("random ({seed})");

        self.task.spawn(move |signals| async move {
            loop {
                let sleep_ms = timing.next_sleep(&mut coin);
                let len = timing.chunk_len(sleep_ms);
                let start = offset.load(Ordering::SeqCst);
                let seq = start + len as u64;
                let chunk =
                    ctx.control
                        .new_chunk(&kind, &stream_name, seq, pattern(start, seed, len));
                offset.store(seq, Ordering::SeqCst);
                ctx.dest.add(chunk).await;

                tokio::select! {
                    () = signals.draining() => break,
                    () = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
                }
            }
            debug!("const rate adaptor {} stopped at {}", ctx.id, offset.load(Ordering::SeqCst));
        });
        Ok(())
    }

    async fn shutdown(&self, policy: ShutdownPolicy) -> Result<u64, AdaptorError> {
        self.task.stop(policy, self.grace).await;
        Ok(self.offset.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptor::AdaptorControl;
    use crate::chunk::AdaptorRef;
    use crate::queue::ChunkQueue;

    fn fast_settings() -> AdaptorSettings {
        AdaptorSettings {
            const_rate_min_sleep_ms: 5,
            const_rate_sleep_variance_ms: 5,
            ..AdaptorSettings::default()
        }
    }

    #[test]
    fn test_parse_args() {
        let factory = AdaptorFactory::new();
        let mut adaptor = ConstRateAdaptor::new(&fast_settings());
        assert_eq!(
            adaptor.parse_args("raw", " 500 42 ", &factory).unwrap(),
            "500 42"
        );
        assert_eq!(adaptor.current_status(), "raw 500 42");

        assert!(adaptor.parse_args("raw", "fast", &factory).is_err());
        assert!(adaptor.parse_args("raw", "500 42 7", &factory).is_err());
    }

    #[test]
    fn test_check_chunk_detects_corruption() {
        let data = pattern(100, 9, 64);
        let mut chunk = Chunk::new("raw", "s", 164, data);
        assert!(ConstRateAdaptor::check_chunk(&chunk));

        chunk.data[20] ^= 0xff;
        assert!(!ConstRateAdaptor::check_chunk(&chunk));
    }

    #[tokio::test]
    async fn test_emits_contiguous_verifiable_chunks() {
        let factory = AdaptorFactory::new();
        let mut adaptor = ConstRateAdaptor::new(&fast_settings());
        adaptor.parse_args("raw", "2000 7", &factory).unwrap();

        let queue = Arc::new(ChunkQueue::new(1024 * 1024));
        let ctx = StartContext {
            id: "adaptor_rate".to_string(),
            kind: "raw".to_string(),
            offset: 0,
            dest: queue.clone(),
            control: AdaptorControl::detached("adaptor_rate", AdaptorRef::new(1)),
        };
        adaptor.start(ctx).await.unwrap();

        let mut chunks = Vec::new();
        while chunks.len() < 3 {
            chunks.extend(queue.collect(1024 * 1024).await);
        }
        let stopped_at = adaptor.shutdown(ShutdownPolicy::HardStop).await.unwrap();

        let mut expected_start = 0;
        for chunk in &chunks {
            assert!(ConstRateAdaptor::check_chunk(chunk));
            assert_eq!(chunk.start_offset(), expected_start);
            assert_eq!(chunk.initiator, Some(AdaptorRef::new(1)));
            expected_start = chunk.seq_id;
        }
        assert!(stopped_at >= expected_start);
    }
}
