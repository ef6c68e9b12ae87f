// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::chunk::Chunk;
use crate::connector::{ChunkSink, CommitReporter};
use crate::errors::SinkError;

/// Appends payloads to `<dir>/<kind>.log` and commits once the file is synced.
#[derive(Debug, Clone)]
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    #[must_use]
    pub fn path_for_kind(&self, kind: &str) -> PathBuf {
        let name: String = kind
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{name}.log"))
    }
}

#[async_trait]
impl ChunkSink for FileSink {
    async fn send(&self, chunks: Vec<Chunk>, commits: &CommitReporter) -> Result<(), SinkError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut by_kind: Vec<(&str, Vec<&Chunk>)> = Vec::new();
        for chunk in &chunks {
            match by_kind.iter_mut().find(|(k, _)| *k == chunk.kind) {
                Some((_, group)) => group.push(chunk),
                None => by_kind.push((chunk.kind.as_str(), vec![chunk])),
            }
        }

        for (kind, group) in by_kind {
            let path = self.path_for_kind(kind);
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            for chunk in &group {
                file.write_all(&chunk.data).await?;
            }
            file.sync_data().await?;
            debug!("wrote {} chunks to {}", group.len(), path.display());
        }

        commits.commit_chunks(&chunks).await;
        Ok(())
    }
}
