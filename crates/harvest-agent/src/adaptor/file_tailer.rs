// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tails a single file.
//!
//! Params: `[<firstByteOffset>] <path>`. The stream offset of a byte is its
//! position in the file plus `firstByteOffset`. Reads are bounded by
//! `file_max_read_size`; a missing file is polled quietly until it appears. When
//! the file shrinks it is treated as rotated: reading restarts at the top and
//! the bytes already read are folded into `firstByteOffset`, so offsets keep
//! increasing.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use crate::adaptor::task::AdaptorTask;
use crate::adaptor::{
    Adaptor, AdaptorControl, AdaptorFactory, ChunkReceiver, ShutdownPolicy, StartContext,
};
use crate::config::AdaptorSettings;
use crate::errors::AdaptorError;

fn params_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    PATTERN.get_or_init(|| Regex::new(r"^(\d+)\s+(.+?)\s*$").expect("valid pattern"))
}

#[derive(Debug, Default, Clone, Copy)]
struct Position {
    /// Stream offset of the first byte of the file.
    offset_of_first_byte: u64,
    /// Next byte of the file to read.
    file_read_offset: u64,
}

impl Position {
    fn stream_offset(self) -> u64 {
        self.offset_of_first_byte + self.file_read_offset
    }
}

pub struct FileTailerAdaptor {
    kind: String,
    path: PathBuf,
    position: Arc<Mutex<Position>>,
    period: Duration,
    max_read: usize,
    grace: Duration,
    task: AdaptorTask,
}

impl FileTailerAdaptor {
    #[must_use]
    pub fn new(settings: &AdaptorSettings) -> Self {
        Self {
            kind: String::new(),
            path: PathBuf::new(),
            position: Arc::new(Mutex::new(Position::default())),
            period: settings.file_tail_period,
            max_read: settings.file_max_read_size.max(1),
            grace: settings.graceful_timeout,
            task: AdaptorTask::new(),
        }
    }

    fn position(&self) -> Position {
        #[allow(clippy::expect_used)]
        *self.position.lock().expect("lock poisoned")
    }
}

struct Tail {
    kind: String,
    path: PathBuf,
    stream_name: String,
    position: Arc<Mutex<Position>>,
    max_read: usize,
    dest: Arc<dyn ChunkReceiver>,
    control: AdaptorControl,
}

impl Tail {
    fn position(&self) -> std::sync::MutexGuard<'_, Position> {
        #[allow(clippy::expect_used)]
        self.position.lock().expect("lock poisoned")
    }

    /// Reads at most one bounded slice. Returns whether more data is waiting.
    async fn tail_once(&self) -> std::io::Result<bool> {
        let len = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} does not exist yet", self.path.display());
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let read_offset = {
            let mut pos = self.position();
            if len < pos.file_read_offset {
                info!(
                    "file {} shrank from {} to {len} bytes, reading from the top",
                    self.path.display(),
                    pos.file_read_offset
                );
                pos.offset_of_first_byte += pos.file_read_offset;
                pos.file_read_offset = 0;
            }
            pos.file_read_offset
        };
        if len == read_offset {
            return Ok(false);
        }

        let available = len - read_offset;
        let to_read = usize::try_from(available).map_or(self.max_read, |a| a.min(self.max_read));
        let buf = read_slice(&self.path, read_offset, to_read).await?;
        if buf.is_empty() {
            // Truncated since the size was taken; the next pass sees the shrink.
            return Ok(false);
        }

        let read = buf.len();
        let seq = {
            let mut pos = self.position();
            pos.file_read_offset += read as u64;
            pos.stream_offset()
        };
        let chunk = self
            .control
            .new_chunk(&self.kind, &self.stream_name, seq, buf);
        self.dest.add(chunk).await;
        Ok(read == to_read && available > to_read as u64)
    }

    /// Reads until the end of the file as currently sized.
    async fn drain(&self) -> std::io::Result<()> {
        while self.tail_once().await? {}
        Ok(())
    }
}

/// Reads up to `max` bytes at `offset`. A file shorter than expected yields a
/// short (possibly empty) slice rather than an error.
async fn read_slice(path: &Path, offset: u64, max: usize) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::with_capacity(max);
    file.take(max as u64).read_to_end(&mut buf).await?;
    Ok(buf)
}

#[async_trait]
impl Adaptor for FileTailerAdaptor {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn current_status(&self) -> String {
        format!(
            "{} {} {}",
            self.kind.trim(),
            self.position().offset_of_first_byte,
            self.path.display()
        )
    }

    fn parse_args(
        &mut self,
        kind: &str,
        params: &str,
        _factory: &AdaptorFactory,
    ) -> Result<String, AdaptorError> {
        let params = params.trim();
        let (first_byte, path) = match params_pattern().captures(params) {
            Some(caps) => {
                let first = caps[1].parse::<u64>().map_err(|e| {
                    AdaptorError::InvalidParams(format!("bad first byte offset '{}': {e}", &caps[1]))
                })?;
                (first, caps[2].to_string())
            }
            None => (0, params.to_string()),
        };
        if path.is_empty() {
            return Err(AdaptorError::InvalidParams(
                "expected '[<firstByteOffset>] <path>'".to_string(),
            ));
        }

        let path = Path::new(&path);
        self.path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        self.kind = kind.to_string();
        #[allow(clippy::expect_used)]
        {
            self.position.lock().expect("lock poisoned").offset_of_first_byte = first_byte;
        }
        Ok(self.path.display().to_string())
    }

    async fn start(&self, ctx: StartContext) -> Result<(), AdaptorError> {
        {
            #[allow(clippy::expect_used)]
            let mut pos = self.position.lock().expect("lock poisoned");
            pos.file_read_offset = ctx.offset.saturating_sub(pos.offset_of_first_byte);
        }

        let tail = Tail {
            kind: self.kind.clone(),
            path: self.path.clone(),
            stream_name: self.path.display().to_string(),
            position: Arc::clone(&self.position),
            max_read: self.max_read,
            dest: Arc::clone(&ctx.dest),
            control: ctx.control.clone(),
        };
        let period = self.period;

        self.task.spawn(move |signals| async move {
            loop {
                match tail.tail_once().await {
                    Ok(true) => continue,
                    Ok(false) => {}
                    Err(e) => {
                        warn!("error tailing {}: {e}", tail.path.display());
                        tail.control.deregister_and_stop();
                        return;
                    }
                }
                tokio::select! {
                    () = signals.draining() => break,
                    () = tokio::time::sleep(period) => {}
                }
            }
            if let Err(e) = tail.drain().await {
                warn!("error draining {}: {e}", tail.path.display());
            }
        });
        Ok(())
    }

    async fn shutdown(&self, policy: ShutdownPolicy) -> Result<u64, AdaptorError> {
        self.task.stop(policy, self.grace).await;
        Ok(self.position().stream_offset())
    }
}
