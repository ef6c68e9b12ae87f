// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Numbered checkpoint files holding one `add` command per registered adaptor.
//!
//! A write creates generation `N` and then removes `N - 1`, so a crash between
//! the two steps leaves two readable generations and never zero. Recovery picks
//! the lowest-numbered file and replays it through the registry's add parser.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::CheckpointError;
use crate::registry::Registry;

/// What a boot-time restore did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    /// Generation that was replayed, if any.
    pub generation: Option<u64>,
    pub restored: usize,
    pub failed: usize,
    /// Generations skipped because they could not be read.
    pub unreadable: usize,
}

#[derive(Debug)]
pub struct CheckpointManager {
    dir: PathBuf,
    base_name: String,
    next_generation: Mutex<u64>,
}

impl CheckpointManager {
    #[must_use]
    pub fn new(dir: &Path, base_name: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            base_name: base_name.to_string(),
            next_generation: Mutex::new(0),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn path_for(&self, generation: u64) -> PathBuf {
        self.dir.join(format!("{}{generation}", self.base_name))
    }

    /// Checkpoint generations present on disk, lowest first. Files whose suffix
    /// is not a number are ignored.
    ///
    /// # Errors
    ///
    /// Fails when the directory cannot be read. A missing directory is empty.
    pub async fn generations(&self) -> Result<Vec<u64>, CheckpointError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut generations = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(generation) = name
                .strip_prefix(&self.base_name)
                .and_then(|suffix| suffix.parse::<u64>().ok())
            {
                generations.push(generation);
            }
        }
        generations.sort_unstable();
        Ok(generations)
    }

    /// Replays the lowest-numbered readable checkpoint into `registry` and
    /// continues numbering above it. No checkpoint at all is a cold start.
    ///
    /// A generation that cannot be read is skipped with a warning and the next
    /// one is tried; when none is readable the agent starts cold and numbering
    /// continues above the highest file found.
    ///
    /// # Errors
    ///
    /// Fails only when the checkpoint directory cannot be listed; rejected
    /// lines are logged and counted.
    pub async fn restore(&self, registry: &Registry) -> Result<RestoreSummary, CheckpointError> {
        let generations = self.generations().await?;
        let (Some(&lowest), Some(&highest)) = (generations.first(), generations.last()) else {
            info!("no checkpoint found in {}, cold start", self.dir.display());
            return Ok(RestoreSummary::default());
        };
        if generations.len() > 2 {
            warn!(
                "found {} checkpoint generations in {}, expected at most two; using {lowest}",
                generations.len(),
                self.dir.display()
            );
        }

        let mut summary = RestoreSummary::default();
        for &generation in &generations {
            let path = self.path_for(generation);
            let contents = match tokio::fs::read_to_string(&path).await {
                Ok(contents) => contents,
                Err(e) => {
                    warn!("cannot read checkpoint {}: {e}", path.display());
                    summary.unreadable += 1;
                    continue;
                }
            };

            summary.generation = Some(generation);
            for line in contents.lines().filter(|l| !l.trim().is_empty()) {
                match registry.process_add_command(line).await {
                    Ok(_) => summary.restored += 1,
                    Err(e) => {
                        warn!("could not restore '{line}' from {}: {e}", path.display());
                        summary.failed += 1;
                    }
                }
            }
            *self.next_generation.lock().await = generation + 1;
            info!(
                "restored {} adaptors from checkpoint {} ({} failed)",
                summary.restored,
                path.display(),
                summary.failed
            );
            return Ok(summary);
        }

        warn!(
            "no readable checkpoint in {}, cold start",
            self.dir.display()
        );
        *self.next_generation.lock().await = highest + 1;
        Ok(summary)
    }

    /// Writes a checkpoint only if the registry changed since the last one.
    ///
    /// # Errors
    ///
    /// On failure the registry stays dirty so the next attempt retries.
    pub async fn write_if_dirty(&self, registry: &Registry) -> Result<Option<PathBuf>, CheckpointError> {
        if !registry.take_dirty() {
            return Ok(None);
        }
        match self.write_generation(registry).await {
            Ok(path) => Ok(Some(path)),
            Err(e) => {
                registry.mark_dirty();
                Err(e)
            }
        }
    }

    /// Writes a checkpoint unconditionally.
    ///
    /// # Errors
    ///
    /// Fails when the new generation cannot be written and synced.
    pub async fn write(&self, registry: &Registry) -> Result<PathBuf, CheckpointError> {
        registry.take_dirty();
        self.write_generation(registry).await.inspect_err(|_| {
            registry.mark_dirty();
        })
    }

    async fn write_generation(&self, registry: &Registry) -> Result<PathBuf, CheckpointError> {
        let mut next = self.next_generation.lock().await;
        let generation = *next;

        let mut contents = String::new();
        for entry in registry.snapshot() {
            contents.push_str(&entry.to_add_command());
            contents.push('\n');
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(generation);
        let mut file = tokio::fs::File::create(&path).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        if generation > 0 {
            let previous = self.path_for(generation - 1);
            match tokio::fs::remove_file(&previous).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("failed to delete old checkpoint {}: {e}", previous.display()),
            }
        }

        *next = generation + 1;
        debug!("wrote checkpoint {}", path.display());
        Ok(path)
    }

    /// Writes a checkpoint every `interval` while the registry is dirty, until
    /// `cancel` fires.
    pub async fn run(
        self: Arc<Self>,
        registry: Arc<Registry>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("checkpoint task stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.write_if_dirty(&registry).await {
                        warn!("failed to write checkpoint, will retry: {e}");
                    }
                }
            }
        }
    }
}
