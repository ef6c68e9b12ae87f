// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Decorator logging every chunk to disk before it is passed on.
//!
//! Each adaptor id owns one log file under `writeahead_dir`. A record is a
//! big-endian `u32` length followed by the MessagePack encoding of the chunk,
//! and is synced before the chunk reaches the destination. On start, records
//! past the resume offset are replayed and the inner adaptor continues after
//! the last of them. Once committed bytes dominate the file it is rewritten
//! without them. A `Restarting` stop keeps the file; any other stop deletes it.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

use crate::adaptor::wrapper::Wrapped;
use crate::adaptor::{
    Adaptor, AdaptorFactory, ChunkReceiver, CommitListener, ShutdownPolicy, StartContext,
};
use crate::chunk::Chunk;
use crate::config::AdaptorSettings;
use crate::errors::AdaptorError;

const LENGTH_PREFIX: usize = 4;

fn encode_record(chunk: &Chunk) -> Result<Vec<u8>, AdaptorError> {
    let body = rmp_serde::to_vec(chunk)
        .map_err(|e| AdaptorError::Start(format!("cannot encode chunk: {e}")))?;
    let len = u32::try_from(body.len())
        .map_err(|_| AdaptorError::Start(format!("chunk of {} bytes too large to log", body.len())))?;
    let mut record = Vec::with_capacity(LENGTH_PREFIX + body.len());
    record.extend_from_slice(&len.to_be_bytes());
    record.extend_from_slice(&body);
    Ok(record)
}

/// Decodes every complete record of a log file's contents. A torn or
/// undecodable tail ends the log.
#[must_use]
pub fn decode_records(bytes: &[u8], path: &Path) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        let Some((prefix, body)) = rest.split_first_chunk::<LENGTH_PREFIX>() else {
            warn!("ignoring truncated record header at the end of {}", path.display());
            break;
        };
        let len = u32::from_be_bytes(*prefix) as usize;
        if body.len() < len {
            warn!("ignoring truncated record at the end of {}", path.display());
            break;
        }
        match rmp_serde::from_slice::<Chunk>(&body[..len]) {
            Ok(chunk) => chunks.push(chunk),
            Err(e) => {
                warn!("ignoring undecodable record in {}: {e}", path.display());
                break;
            }
        }
        rest = &body[len..];
    }
    chunks
}

#[derive(Debug)]
struct LogState {
    file: Option<tokio::fs::File>,
    /// Total data bytes of the chunks in the file.
    data_bytes: u64,
    /// Highest sequence id written.
    highest_seq: u64,
}

/// One adaptor's write-ahead log.
#[derive(Debug)]
pub struct WriteaheadLog {
    path: PathBuf,
    compact_at: u64,
    state: tokio::sync::Mutex<LogState>,
}

impl WriteaheadLog {
    /// Opens (creating if needed) the log at `path` and returns it with the
    /// chunks it already holds.
    pub async fn open(path: PathBuf, compact_at: u64) -> Result<(Self, Vec<Chunk>), AdaptorError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let existing = match tokio::fs::read(&path).await {
            Ok(bytes) => decode_records(&bytes, &path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        // Rewrite so a torn tail never sits in front of new records.
        let file = Self::rewrite(&path, &existing).await?;
        let state = LogState {
            file: Some(file),
            data_bytes: existing.iter().map(|c| c.len() as u64).sum(),
            highest_seq: existing.iter().map(|c| c.seq_id).max().unwrap_or(0),
        };
        Ok((
            Self {
                path,
                compact_at,
                state: tokio::sync::Mutex::new(state),
            },
            existing,
        ))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `chunks` to a temporary file, renames it over `path` and returns
    /// a handle positioned for appending.
    async fn rewrite(path: &Path, chunks: &[Chunk]) -> Result<tokio::fs::File, AdaptorError> {
        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        let mut contents = Vec::new();
        for chunk in chunks {
            contents.extend_from_slice(&encode_record(chunk)?);
        }
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&contents).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await?;

        Ok(tokio::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .await?)
    }

    /// Appends and syncs one record.
    pub async fn append(&self, chunk: &Chunk) -> Result<(), AdaptorError> {
        let record = encode_record(chunk)?;
        let mut state = self.state.lock().await;
        let file = state
            .file
            .as_mut()
            .ok_or_else(|| AdaptorError::Shutdown("write-ahead log already closed".to_string()))?;
        file.write_all(&record).await?;
        file.sync_data().await?;
        state.data_bytes += chunk.len() as u64;
        state.highest_seq = state.highest_seq.max(chunk.seq_id);
        Ok(())
    }

    /// Notes that everything up to `offset` is durable downstream and compacts
    /// the file when committed data outweighs the threshold.
    pub async fn committed(&self, offset: u64) -> Result<bool, AdaptorError> {
        let mut state = self.state.lock().await;
        if state.file.is_none() {
            return Ok(false);
        }
        let outstanding = state.highest_seq.saturating_sub(offset);
        let committed_bytes = state.data_bytes.saturating_sub(outstanding);
        if committed_bytes <= self.compact_at {
            return Ok(false);
        }

        let bytes = tokio::fs::read(&self.path).await?;
        let keep: Vec<Chunk> = decode_records(&bytes, &self.path)
            .into_iter()
            .filter(|c| c.seq_id > offset)
            .collect();
        debug!(
            "compacting {}: keeping {} chunks after offset {offset}",
            self.path.display(),
            keep.len()
        );
        state.file = Some(Self::rewrite(&self.path, &keep).await?);
        state.data_bytes = keep.iter().map(|c| c.len() as u64).sum();
        Ok(true)
    }

    /// Closes and removes the log file.
    pub async fn delete(&self) -> Result<(), AdaptorError> {
        let mut state = self.state.lock().await;
        state.file = None;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

struct LoggingReceiver {
    log: Arc<WriteaheadLog>,
    dest: Arc<dyn ChunkReceiver>,
}

#[async_trait]
impl ChunkReceiver for LoggingReceiver {
    async fn add(&self, chunk: Chunk) {
        if let Err(e) = self.log.append(&chunk).await {
            error!(
                "failed to log chunk ending at {} to {}: {e}",
                chunk.seq_id,
                self.log.path().display()
            );
        }
        self.dest.add(chunk).await;
    }
}

/// Log file name for an adaptor id; anything outside `[A-Za-z0-9_-]` becomes `_`.
fn log_file_name(id: &str) -> String {
    let safe: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    format!("{safe}.wal")
}

pub struct WriteaheadBuffered {
    wrapped: Wrapped,
    dir: PathBuf,
    compact_at: u64,
    log: Mutex<Option<Arc<WriteaheadLog>>>,
}

impl WriteaheadBuffered {
    #[must_use]
    pub fn new(settings: &AdaptorSettings) -> Self {
        Self {
            wrapped: Wrapped::default(),
            dir: settings.writeahead_dir.clone(),
            compact_at: settings.writeahead_compact_at,
            log: Mutex::new(None),
        }
    }

    /// Path of the log kept for `id` under `dir`.
    #[must_use]
    pub fn log_path(dir: &Path, id: &str) -> PathBuf {
        dir.join(log_file_name(id))
    }

    fn log(&self) -> Option<Arc<WriteaheadLog>> {
        #[allow(clippy::expect_used)]
        self.log.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl Adaptor for WriteaheadBuffered {
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
        let path = Self::log_path(&self.dir, &ctx.id);
        let (log, existing) = WriteaheadLog::open(path, self.compact_at).await?;
        let log = Arc::new(log);
        #[allow(clippy::expect_used)]
        {
            *self.log.lock().expect("lock poisoned") = Some(Arc::clone(&log));
        }

        let mut resume_at = ctx.offset;
        let mut replayed = 0;
        for mut chunk in existing.into_iter().filter(|c| c.seq_id > ctx.offset) {
            resume_at = resume_at.max(chunk.seq_id);
            chunk.initiator = Some(ctx.control.adaptor_ref());
            ctx.dest.add(chunk).await;
            replayed += 1;
        }
        if replayed > 0 {
            debug!(
                "adaptor {} replayed {replayed} logged chunks, resuming at {resume_at}",
                ctx.id
            );
        }

        let receiver = Arc::new(LoggingReceiver {
            log,
            dest: Arc::clone(&ctx.dest),
        });
        inner.start(ctx.with_dest(receiver, resume_at)).await
    }

    async fn shutdown(&self, policy: ShutdownPolicy) -> Result<u64, AdaptorError> {
        let offset = self.wrapped.inner()?.shutdown(policy).await;
        if !policy.retains_state() {
            if let Some(log) = self.log() {
                if let Err(e) = log.delete().await {
                    warn!("failed to delete write-ahead log {}: {e}", log.path().display());
                }
            }
        }
        offset
    }

    fn as_commit_listener(&self) -> Option<&dyn CommitListener> {
        Some(self)
    }
}

#[async_trait]
impl CommitListener for WriteaheadBuffered {
    async fn committed(&self, offset: u64) {
        if let Some(log) = self.log() {
            if let Err(e) = log.committed(offset).await {
                warn!("failed to compact {}: {e}", log.path().display());
            }
        }
        self.wrapped.forward_commit(offset).await;
    }
}
