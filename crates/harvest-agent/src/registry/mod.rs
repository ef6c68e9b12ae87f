// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The running adaptor set.
//!
//! Two maps live under one lock: id to registration, and registration handle to
//! registration (which carries the committed offset). Adds are serialized by an
//! async gate so an adaptor is only visible to listings and checkpoints once its
//! `start` has succeeded; a failed start removes it from both maps.

pub mod command;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, info, warn};

use crate::adaptor::naming::{normalize_id, synthesize_id};
use crate::adaptor::{
    Adaptor, AdaptorControl, AdaptorFactory, ChunkReceiver, ShutdownPolicy, StartContext,
};
use crate::chunk::{AdaptorRef, Tags};
use crate::errors::CommandError;

pub use command::{parse_add_command, AddCommand};

struct Registered {
    id: String,
    class: String,
    adaptor_ref: AdaptorRef,
    adaptor: Arc<dyn Adaptor>,
    offset: AtomicU64,
    started: AtomicBool,
}

impl Registered {
    fn entry(&self) -> AdaptorEntry {
        AdaptorEntry {
            id: self.id.clone(),
            class: self.class.clone(),
            adaptor_ref: self.adaptor_ref,
            status: self.adaptor.current_status(),
            offset: self.offset.load(Ordering::SeqCst),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    by_id: HashMap<String, Arc<Registered>>,
    by_ref: HashMap<AdaptorRef, Arc<Registered>>,
}

/// Point-in-time description of one registered adaptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdaptorEntry {
    pub id: String,
    pub class: String,
    pub adaptor_ref: AdaptorRef,
    /// Live status string, starting with the data kind.
    pub status: String,
    /// Highest committed offset.
    pub offset: u64,
}

impl AdaptorEntry {
    /// The add command that recreates this adaptor at its committed offset.
    #[must_use]
    pub fn to_add_command(&self) -> String {
        format!(
            "ADD {} = {} {} {}",
            self.id, self.class, self.status, self.offset
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Started(String),
    /// The id was already registered; nothing was started.
    AlreadyRunning(String),
    /// Blank line.
    Ignored,
}

impl AddOutcome {
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        match self {
            AddOutcome::Started(id) | AddOutcome::AlreadyRunning(id) => Some(id),
            AddOutcome::Ignored => None,
        }
    }
}

pub struct Registry {
    me: Weak<Registry>,
    factory: AdaptorFactory,
    dest: Arc<dyn ChunkReceiver>,
    source: String,
    tags: Tags,
    state: Mutex<RegistryState>,
    add_gate: tokio::sync::Mutex<()>,
    dirty: AtomicBool,
    next_ref: AtomicU64,
}

impl Registry {
    /// `dest` receives every chunk produced by adaptors started here; `source`
    /// and `tags` are stamped on those chunks.
    #[must_use]
    pub fn new(
        factory: AdaptorFactory,
        dest: Arc<dyn ChunkReceiver>,
        source: &str,
        tags: Tags,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Registry {
            me: me.clone(),
            factory,
            dest,
            source: source.to_string(),
            tags,
            state: Mutex::new(RegistryState::default()),
            add_gate: tokio::sync::Mutex::new(()),
            dirty: AtomicBool::new(false),
            next_ref: AtomicU64::new(1),
        })
    }

    #[must_use]
    pub fn factory(&self) -> &AdaptorFactory {
        &self.factory
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        #[allow(clippy::expect_used)]
        self.state.lock().expect("lock poisoned")
    }

    /// Parses and executes one `add` line.
    ///
    /// Re-adding a registered id is a no-op returning that id. Any error leaves
    /// the registry exactly as it was.
    ///
    /// # Errors
    ///
    /// Returns the [`CommandError`] describing why the line was rejected.
    pub async fn process_add_command(&self, line: &str) -> Result<AddOutcome, CommandError> {
        let Some(cmd) = parse_add_command(line)? else {
            return Ok(AddOutcome::Ignored);
        };

        let class = self
            .factory
            .resolve(&cmd.class)
            .ok_or_else(|| CommandError::UnknownClass(cmd.class.clone()))?
            .to_string();
        let mut adaptor = self
            .factory
            .create(&class)
            .ok_or_else(|| CommandError::UnknownClass(cmd.class.clone()))?;

        let canonical = adaptor
            .parse_args(&cmd.kind, &cmd.params, &self.factory)
            .map_err(|e| CommandError::InvalidParams {
                class: class.clone(),
                reason: e.to_string(),
            })?;

        let id = match &cmd.id {
            Some(id) => normalize_id(id),
            None => synthesize_id(&class, &cmd.kind, &canonical),
        };

        let _gate = self.add_gate.lock().await;

        let registered = {
            let mut state = self.lock();
            if state.by_id.contains_key(&id) {
                debug!("adaptor {id} already running, ignoring add");
                return Ok(AddOutcome::AlreadyRunning(id));
            }
            let adaptor_ref = AdaptorRef::new(self.next_ref.fetch_add(1, Ordering::SeqCst));
            let registered = Arc::new(Registered {
                id: id.clone(),
                class: cmd.class.clone(),
                adaptor_ref,
                adaptor: Arc::from(adaptor),
                offset: AtomicU64::new(cmd.offset),
                started: AtomicBool::new(false),
            });
            state.by_id.insert(id.clone(), Arc::clone(&registered));
            state.by_ref.insert(adaptor_ref, Arc::clone(&registered));
            registered
        };

        let ctx = StartContext {
            id: id.clone(),
            kind: cmd.kind.clone(),
            offset: cmd.offset,
            dest: Arc::clone(&self.dest),
            control: AdaptorControl::new(
                self.me.clone(),
                registered.adaptor_ref,
                &id,
                &self.source,
                self.tags.clone(),
            ),
        };

        if let Err(e) = registered.adaptor.start(ctx).await {
            let mut state = self.lock();
            state.by_id.remove(&id);
            state.by_ref.remove(&registered.adaptor_ref);
            warn!("failed to start adaptor {id}: {e}");
            return Err(CommandError::StartFailed {
                id,
                reason: e.to_string(),
            });
        }

        registered.started.store(true, Ordering::SeqCst);
        self.mark_dirty();
        info!(
            "started adaptor {id} ({} {}) at offset {}",
            cmd.class, cmd.kind, cmd.offset
        );
        Ok(AddOutcome::Started(id))
    }

    /// Records that everything up to `offset` from `adaptor` is durable.
    ///
    /// The committed offset only moves forward. Adaptors exposing a
    /// [`crate::adaptor::CommitListener`] are notified with the new committed offset.
    /// Returns the adaptor id, or `None` when the handle is not registered.
    pub async fn report_commit(&self, adaptor: AdaptorRef, offset: u64) -> Option<String> {
        let registered = self.lock().by_ref.get(&adaptor).cloned();
        let Some(registered) = registered else {
            warn!("got commit up to {offset} for adaptor {adaptor} that is not registered");
            return None;
        };

        let previous = registered.offset.fetch_max(offset, Ordering::SeqCst);
        self.mark_dirty();
        if let Some(listener) = registered.adaptor.as_commit_listener() {
            listener.committed(previous.max(offset)).await;
        }
        Some(registered.id.clone())
    }

    /// Stops and unregisters `id`. Returns the offset reported by the adaptor's
    /// shutdown, or `None` if no such adaptor was registered.
    ///
    /// Concurrent stops of the same id resolve to a single winner; the others
    /// return `None`. Shutdown runs outside the registry lock and may block for
    /// as long as the policy allows.
    pub async fn stop_adaptor(&self, id: &str, policy: ShutdownPolicy) -> Option<u64> {
        let registered = {
            let _gate = self.add_gate.lock().await;
            self.lock().by_id.remove(id)
        };
        let Some(registered) = registered else {
            warn!("cannot stop adaptor {id}: not registered");
            return None;
        };
        Some(self.finish_stop(&registered, policy).await)
    }

    /// Like [`Registry::stop_adaptor`] but only stops the adaptor if `adaptor` is
    /// still the registration under its id.
    pub async fn stop_registration(
        &self,
        adaptor: AdaptorRef,
        policy: ShutdownPolicy,
    ) -> Option<u64> {
        let registered = {
            let _gate = self.add_gate.lock().await;
            let mut state = self.lock();
            let id = state.by_ref.get(&adaptor).map(|r| r.id.clone())?;
            match state.by_id.get(&id) {
                Some(current) if current.adaptor_ref == adaptor => state.by_id.remove(&id),
                _ => None,
            }
        }?;
        Some(self.finish_stop(&registered, policy).await)
    }

    async fn finish_stop(&self, registered: &Registered, policy: ShutdownPolicy) -> u64 {
        let offset = match registered.adaptor.shutdown(policy).await {
            Ok(offset) => offset,
            Err(e) => {
                warn!("adaptor {} failed to shut down cleanly: {e}", registered.id);
                registered.offset.load(Ordering::SeqCst)
            }
        };
        self.lock().by_ref.remove(&registered.adaptor_ref);
        self.mark_dirty();
        info!(
            "stopped adaptor {} with policy {policy} at offset {offset}",
            registered.id
        );
        offset
    }

    /// Stops every registered adaptor with `policy`, removing each one.
    /// Returns how many were stopped.
    pub async fn stop_all(&self, policy: ShutdownPolicy) -> usize {
        let ids: Vec<String> = self.snapshot().into_iter().map(|e| e.id).collect();
        let mut stopped = 0;
        for id in ids {
            if self.stop_adaptor(&id, policy).await.is_some() {
                stopped += 1;
            }
        }
        stopped
    }

    /// Shuts every adaptor down with `policy` but keeps the registrations, so a
    /// final checkpoint still records them. Follow with [`Registry::clear`].
    pub async fn shutdown_all(&self, policy: ShutdownPolicy) {
        let registered: Vec<Arc<Registered>> = self
            .lock()
            .by_id
            .values()
            .filter(|r| r.started.load(Ordering::SeqCst))
            .cloned()
            .collect();
        for r in registered {
            if let Err(e) = r.adaptor.shutdown(policy).await {
                warn!("adaptor {} failed to shut down cleanly: {e}", r.id);
            }
        }
    }

    /// Drops every registration without stopping anything.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.by_id.clear();
        state.by_ref.clear();
    }

    /// Started adaptors, ordered by id. Status strings are read after the lock
    /// is released.
    #[must_use]
    pub fn snapshot(&self) -> Vec<AdaptorEntry> {
        let registered: Vec<Arc<Registered>> = self
            .lock()
            .by_id
            .values()
            .filter(|r| r.started.load(Ordering::SeqCst))
            .cloned()
            .collect();
        let mut entries: Vec<AdaptorEntry> = registered.iter().map(|r| r.entry()).collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    /// Looks up a live registration by handle.
    #[must_use]
    pub fn entry(&self, adaptor: AdaptorRef) -> Option<AdaptorEntry> {
        let registered = self.lock().by_ref.get(&adaptor).cloned()?;
        Some(registered.entry())
    }

    #[must_use]
    pub fn entry_by_id(&self, id: &str) -> Option<AdaptorEntry> {
        let registered = self.lock().by_id.get(id).cloned()?;
        registered
            .started
            .load(Ordering::SeqCst)
            .then(|| registered.entry())
    }

    /// `id -> "<class> <status> <offset>"` for every started adaptor.
    #[must_use]
    pub fn list(&self) -> BTreeMap<String, String> {
        self.snapshot()
            .into_iter()
            .map(|e| {
                let line = format!("{} {} {}", e.class, e.status, e.offset);
                (e.id, line)
            })
            .collect()
    }

    #[must_use]
    pub fn adaptor_count(&self) -> usize {
        self.lock()
            .by_id
            .values()
            .filter(|r| r.started.load(Ordering::SeqCst))
            .count()
    }

    #[must_use]
    pub fn offset_of(&self, id: &str) -> Option<u64> {
        self.lock()
            .by_id
            .get(id)
            .map(|r| r.offset.load(Ordering::SeqCst))
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Clears the dirty flag, returning whether it was set.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("adaptors", &self.adaptor_count())
            .field("dirty", &self.is_dirty())
            .finish_non_exhaustive()
    }
}
